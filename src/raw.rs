//! Low-level socket operations
//!
//! Thin wrappers over the POSIX socket calls the transports need before a
//! descriptor is handed to `mio`: creation, socket options, bind, listen and
//! non-blocking connect. Descriptors are returned as [`OwnedFd`] so a failed
//! setup step closes the socket instead of leaking it.
//!
//! # Safety
//!
//! This module contains the crate's raw system calls. Every `unsafe` block is
//! confined to a single libc call whose arguments are built locally.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// IP protocol domain for sockets
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Domain {
    /// IPv4 protocol
    Ipv4,
    /// IPv6 protocol
    Ipv6,
}

impl Domain {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Domain::Ipv4,
            SocketAddr::V6(_) => Domain::Ipv6,
        }
    }
}

/// Socket type for protocol communication
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Type {
    /// TCP stream socket
    Stream,
    /// UDP datagram socket
    Dgram,
}

/// Transport protocol for sockets
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// TCP protocol
    Tcp,
    /// UDP protocol
    Udp,
}

pub type OsSocket = RawFd;

/// Platform socket address storage
#[derive(Debug)]
pub enum SockAddr {
    /// IPv4 socket address
    V4(libc::sockaddr_in),
    /// IPv6 socket address
    V6(libc::sockaddr_in6),
}

impl SockAddr {
    fn as_ptr(&self) -> *const libc::sockaddr {
        match self {
            SockAddr::V4(s) => s as *const _ as *const libc::sockaddr,
            SockAddr::V6(s) => s as *const _ as *const libc::sockaddr,
        }
    }
}

/// Convert SocketAddr to platform socket address
pub fn to_sockaddr(addr: SocketAddr) -> (Domain, SockAddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => {
            let mut s: libc::sockaddr_in = unsafe { mem::zeroed() };
            s.sin_family = libc::AF_INET as _;
            s.sin_port = a.port().to_be();
            s.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) };
            (Domain::Ipv4, SockAddr::V4(s), mem::size_of::<libc::sockaddr_in>() as _)
        }
        SocketAddr::V6(a) => {
            let mut s: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            s.sin6_family = libc::AF_INET6 as _;
            s.sin6_port = a.port().to_be();
            s.sin6_flowinfo = a.flowinfo();
            s.sin6_scope_id = a.scope_id();
            s.sin6_addr = libc::in6_addr { s6_addr: a.ip().octets() };
            (Domain::Ipv6, SockAddr::V6(s), mem::size_of::<libc::sockaddr_in6>() as _)
        }
    }
}

/// Create a non-blocking, close-on-exec socket
pub fn socket(domain: Domain, ty: Type, proto: Protocol) -> io::Result<OwnedFd> {
    let d = match domain { Domain::Ipv4 => libc::AF_INET, Domain::Ipv6 => libc::AF_INET6 };
    let t = match ty { Type::Stream => libc::SOCK_STREAM, Type::Dgram => libc::SOCK_DGRAM };
    let p = match proto { Protocol::Tcp => libc::IPPROTO_TCP, Protocol::Udp => libc::IPPROTO_UDP };

    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
            let fd = unsafe { libc::socket(d, t | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK, p) };
            if fd < 0 { return Err(io::Error::last_os_error()); }
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        } else {
            let fd = unsafe { libc::socket(d, t, p) };
            if fd < 0 { return Err(io::Error::last_os_error()); }
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
                return Err(io::Error::last_os_error());
            }
            set_nonblocking(fd, true)?;
            Ok(owned)
        }
    }
}

/// Set socket non-blocking mode
pub fn set_nonblocking(os: OsSocket, on: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(os, libc::F_GETFL);
        if flags < 0 { return Err(io::Error::last_os_error()); }
        let nb = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
        if libc::fcntl(os, libc::F_SETFL, nb) != 0 { return Err(io::Error::last_os_error()); }
        Ok(())
    }
}

/// Bind socket to address
pub fn bind_raw(os: OsSocket, addr: SocketAddr) -> io::Result<()> {
    let (_, sa, len) = to_sockaddr(addr);
    if unsafe { libc::bind(os, sa.as_ptr(), len) } != 0 { return Err(io::Error::last_os_error()); }
    Ok(())
}

/// Start listening on socket with specified backlog
pub fn listen_raw(os: OsSocket, backlog: i32) -> io::Result<()> {
    if unsafe { libc::listen(os, backlog) } != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Start a non-blocking connect; an in-progress connect counts as success
pub fn connect_raw(os: OsSocket, addr: SocketAddr) -> io::Result<()> {
    let (_, sa, len) = to_sockaddr(addr);
    if unsafe { libc::connect(os, sa.as_ptr(), len) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EINTR) => Ok(()),
        _ => Err(err),
    }
}

/// Allow rebinding a listening port that still has connections in TIME_WAIT
pub fn set_reuse_addr(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as i32) }
/// Set socket receive buffer size
pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_RCVBUF, sz) }
/// Set socket send buffer size
pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_SNDBUF, sz) }
/// Current socket receive buffer size as reported by the kernel
pub fn recv_buffer(os: OsSocket) -> io::Result<usize> { getsockopt_int(os, libc::SOL_SOCKET, libc::SO_RCVBUF).map(|v| v as usize) }
/// Current socket send buffer size as reported by the kernel
pub fn send_buffer(os: OsSocket) -> io::Result<usize> { getsockopt_int(os, libc::SOL_SOCKET, libc::SO_SNDBUF).map(|v| v as usize) }
/// Enable port reuse for multiple binds
pub fn set_reuse_port(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as i32) }
/// Set IPv4 Type of Service
pub fn set_tos_v4(os: OsSocket, tos: i32) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IP, libc::IP_TOS, tos) }
/// Set IPv6 Traffic Class
pub fn set_tos_v6(os: OsSocket, tc: i32) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tc) }
/// Configure IPv6-only mode (disable dual-stack)
pub fn set_ipv6_only(os: OsSocket, only: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, only as i32) }
/// Disable TCP Nagle algorithm
pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32) }
/// Enable TCP quick ACK
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn set_tcp_quickack(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_TCP, libc::TCP_QUICKACK, on as i32) }

fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> io::Result<()> {
    let v = val as libc::c_int;
    let rc = unsafe { libc::setsockopt(fd, level, opt, &v as *const _ as _, mem::size_of::<libc::c_int>() as _) };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

fn getsockopt_int(fd: RawFd, level: i32, opt: i32) -> io::Result<i32> {
    let mut v: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe { libc::getsockopt(fd, level, opt, &mut v as *mut _ as _, &mut len) };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(v) }
}

/// Convert an owned descriptor into a std UDP socket
pub fn udp_from_os(fd: OwnedFd) -> std::net::UdpSocket { std::net::UdpSocket::from(fd) }
/// Convert an owned descriptor into a std TCP listener
pub fn tcp_listener_from_os(fd: OwnedFd) -> std::net::TcpListener { std::net::TcpListener::from(fd) }
/// Convert an owned descriptor into a std TCP stream
pub fn tcp_stream_from_os(fd: OwnedFd) -> std::net::TcpStream { std::net::TcpStream::from(fd) }

/// Raw descriptor of anything socket-like
pub fn fd_of<S: AsRawFd>(s: &S) -> OsSocket { s.as_raw_fd() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let (domain, sa, len) = to_sockaddr(addr);
        assert_eq!(domain, Domain::Ipv4);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        match sa {
            SockAddr::V4(s) => {
                assert_eq!(u16::from_be(s.sin_port), 4242);
                assert_eq!(s.sin_addr.s_addr.to_ne_bytes(), [127, 0, 0, 1]);
            }
            SockAddr::V6(_) => panic!("expected v4"),
        }
    }

    #[test]
    fn test_bind_and_buffer_options() {
        let fd = socket(Domain::Ipv4, Type::Dgram, Protocol::Udp).unwrap();
        let os = fd.as_raw_fd();
        bind_raw(os, "127.0.0.1:0".parse().unwrap()).unwrap();
        set_recv_buffer(os, 64 * 1024).unwrap();
        assert!(recv_buffer(os).unwrap() >= 64 * 1024);
        let sock = udp_from_os(fd);
        assert_ne!(sock.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_bind_in_use_reports_addr_in_use() {
        let first = socket(Domain::Ipv4, Type::Stream, Protocol::Tcp).unwrap();
        bind_raw(first.as_raw_fd(), "127.0.0.1:0".parse().unwrap()).unwrap();
        listen_raw(first.as_raw_fd(), 8).unwrap();
        let taken = tcp_listener_from_os(first);
        let addr = taken.local_addr().unwrap();

        let second = socket(Domain::Ipv4, Type::Stream, Protocol::Tcp).unwrap();
        let err = bind_raw(second.as_raw_fd(), addr).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
    }
}
