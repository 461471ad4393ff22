//! Loop-wide configuration and socket tuning
//!
//! A [`NetConfig`] is built once, handed to
//! [`EventLoop::with_config`](crate::EventLoop::with_config) and then read by
//! every socket, secure session and file created on that loop. It is never
//! mutated while the loop runs, so loops on different threads can carry
//! different settings.
//!
//! # Categories
//!
//! ## Socket tuning
//! - `tcp_nodelay`, `tcp_quickack`: latency knobs for stream sockets
//! - `recv_buf`/`send_buf`: kernel buffer sizes applied at socket creation
//! - `reuse_port`: SO_REUSEPORT on listening and bound sockets
//!
//! ## Buffer policy
//! - `tcp_read_buffer_size`: per-connection receive buffer
//! - `udp_max_datagram_size`: outbound payload limit, larger sends fail with
//!   `MessageTooLong`
//! - `min_*`/`max_*` buffer sizes: bounds for runtime buffer resizing
//! - `file_read_buffer_size`/`file_read_buffers`: pooled file streaming
//!
//! ## Secure transport
//! - `ciphers`: OpenSSL cipher list applied to every TLS/DTLS context
//! - `dtls_mtu`: record size limit for DTLS sessions
//!
//! # Examples
//!
//! ```rust
//! use horizon_io::NetConfig;
//!
//! let cfg = NetConfig {
//!     tcp_read_buffer_size: 16 * 1024,
//!     worker_threads: 2,
//!     ..Default::default()
//! };
//! assert!(cfg.validate().is_ok());
//! ```

use std::io;
use std::time::Duration;

use crate::error::{Error, StatusCode};
use crate::raw;

/// Cipher list used when none is configured
pub const DEFAULT_CIPHERS: &str = "ALL:!aNULL:!eNULL:!LOW:!EXP:!MD5:!RC4:@STRENGTH";

/// Largest UDP payload over IPv4 (65535 - 8 byte UDP header - 20 byte IP header)
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Loop-wide configuration
///
/// Every field has a default suited to loopback tests and small services;
/// override only what you need with struct update syntax.
#[derive(Clone, Debug, PartialEq)]
pub struct NetConfig {
    /// Enable TCP_NODELAY on every stream socket
    ///
    /// **Default**: `true`
    pub tcp_nodelay: bool,

    /// Enable TCP_QUICKACK on stream sockets (Linux only)
    ///
    /// **Default**: `false`
    pub tcp_quickack: bool,

    /// Enable SO_REUSEPORT on listening/bound sockets
    ///
    /// Leaving this off keeps a second bind to a busy port failing with
    /// `AddressAlreadyInUse`.
    ///
    /// **Default**: `false`
    pub reuse_port: bool,

    /// Kernel receive buffer applied at socket creation
    ///
    /// **Default**: `None` (system default)
    pub recv_buf: Option<usize>,

    /// Kernel send buffer applied at socket creation
    ///
    /// **Default**: `None` (system default)
    pub send_buf: Option<usize>,

    /// IP Type of Service / IPv6 traffic class
    ///
    /// **Default**: `None`
    pub tos: Option<u32>,

    /// IPv6-only mode for IPv6 sockets
    ///
    /// - `Some(true)`: reject IPv4-mapped traffic
    /// - `Some(false)`: dual-stack
    /// - `None`: system default
    ///
    /// **Default**: `Some(false)`
    pub ipv6_only: Option<bool>,

    /// Capacity of the readiness event buffer used per poll
    ///
    /// **Default**: `1024`
    pub event_capacity: usize,

    /// Background threads serving `EventLoop::add_work`
    ///
    /// **Default**: `4`
    pub worker_threads: usize,

    /// Receive buffer of every TCP connection
    ///
    /// **Default**: `64 KiB`
    pub tcp_read_buffer_size: usize,

    /// Largest UDP payload accepted by `send_data`
    ///
    /// **Default**: `65507`
    pub udp_max_datagram_size: usize,

    /// Lower bound accepted by `set_receive_buffer_size`
    pub min_receive_buffer_size: usize,
    /// Upper bound accepted by `set_receive_buffer_size`
    pub max_receive_buffer_size: usize,
    /// Lower bound accepted by `set_send_buffer_size`
    pub min_send_buffer_size: usize,
    /// Upper bound accepted by `set_send_buffer_size`
    pub max_send_buffer_size: usize,

    /// OpenSSL cipher list for TLS and DTLS contexts
    ///
    /// **Default**: [`DEFAULT_CIPHERS`]
    pub ciphers: String,

    /// Path MTU handed to DTLS sessions
    ///
    /// **Default**: `1200`
    pub dtls_mtu: u32,

    /// Size of each pooled file read buffer
    ///
    /// **Default**: `64 KiB`
    pub file_read_buffer_size: usize,

    /// Number of pooled buffers a single file read may hold at once
    ///
    /// **Default**: `4`
    pub file_read_buffers: usize,

    /// How long a closed UDP peer keeps swallowing datagrams before it is forgotten
    ///
    /// **Default**: `1s`
    pub udp_peer_close_inactivity: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_quickack: false,
            reuse_port: false,
            recv_buf: None,
            send_buf: None,
            tos: None,
            ipv6_only: Some(false),
            event_capacity: 1024,
            worker_threads: 4,
            tcp_read_buffer_size: 64 * 1024,
            udp_max_datagram_size: MAX_UDP_PAYLOAD,
            min_receive_buffer_size: 4 * 1024,
            max_receive_buffer_size: 64 << 20,
            min_send_buffer_size: 4 * 1024,
            max_send_buffer_size: 64 << 20,
            ciphers: DEFAULT_CIPHERS.to_string(),
            dtls_mtu: 1200,
            file_read_buffer_size: 64 * 1024,
            file_read_buffers: 4,
            udp_peer_close_inactivity: Duration::from_secs(1),
        }
    }
}

impl NetConfig {
    /// Preset favouring request/response latency
    ///
    /// Small TCP read buffers, TCP_QUICKACK and low-delay TOS marking.
    pub fn low_latency() -> Self {
        Self {
            tcp_quickack: true,
            tos: Some(0x10),
            tcp_read_buffer_size: 16 * 1024,
            recv_buf: Some(256 * 1024),
            send_buf: Some(256 * 1024),
            ..Self::default()
        }
    }

    /// Preset favouring bulk transfer
    pub fn high_throughput() -> Self {
        Self {
            tcp_nodelay: false,
            tos: Some(0x08),
            recv_buf: Some(16 << 20),
            send_buf: Some(16 << 20),
            tcp_read_buffer_size: 256 * 1024,
            file_read_buffer_size: 1 << 20,
            ..Self::default()
        }
    }

    /// Rejects settings the loop cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |what: &str| Err(Error::with_message(StatusCode::InvalidArgument, what.to_string()));

        if self.event_capacity == 0 {
            return invalid("event_capacity must be non-zero");
        }
        if self.worker_threads == 0 {
            return invalid("worker_threads must be non-zero");
        }
        if self.tcp_read_buffer_size == 0 || self.file_read_buffer_size == 0 || self.file_read_buffers == 0 {
            return invalid("read buffers must be non-empty");
        }
        if self.udp_max_datagram_size == 0 || self.udp_max_datagram_size > MAX_UDP_PAYLOAD {
            return invalid("udp_max_datagram_size out of range");
        }
        if self.min_receive_buffer_size > self.max_receive_buffer_size
            || self.min_send_buffer_size > self.max_send_buffer_size
        {
            return invalid("buffer size bounds are inverted");
        }
        Ok(())
    }

    pub(crate) fn check_receive_buffer_size(&self, size: usize) -> Result<(), Error> {
        if size < self.min_receive_buffer_size || size > self.max_receive_buffer_size {
            return Err(Error::with_message(
                StatusCode::InvalidArgument,
                format!(
                    "receive buffer size {} outside [{}, {}]",
                    size, self.min_receive_buffer_size, self.max_receive_buffer_size
                ),
            ));
        }
        Ok(())
    }

    pub(crate) fn check_send_buffer_size(&self, size: usize) -> Result<(), Error> {
        if size < self.min_send_buffer_size || size > self.max_send_buffer_size {
            return Err(Error::with_message(
                StatusCode::InvalidArgument,
                format!(
                    "send buffer size {} outside [{}, {}]",
                    size, self.min_send_buffer_size, self.max_send_buffer_size
                ),
            ));
        }
        Ok(())
    }
}

/// Applies the socket-level settings of `cfg` to a freshly created socket
///
/// Must run before bind/connect. Options the platform does not support are
/// skipped rather than reported.
pub fn apply_socket_options(os: raw::OsSocket, domain: raw::Domain, ty: raw::Type, cfg: &NetConfig) -> io::Result<()> {
    use crate::raw as r;

    if let Some(sz) = cfg.recv_buf { r::set_recv_buffer(os, sz as i32)?; }
    if let Some(sz) = cfg.send_buf { r::set_send_buffer(os, sz as i32)?; }

    if let Some(tos) = cfg.tos {
        match domain {
            r::Domain::Ipv4 => r::set_tos_v4(os, tos as i32)?,
            r::Domain::Ipv6 => r::set_tos_v6(os, tos as i32)?,
        }
    }

    if let r::Domain::Ipv6 = domain {
        if let Some(only) = cfg.ipv6_only { r::set_ipv6_only(os, only)?; }
    }

    if cfg.reuse_port { r::set_reuse_port(os, true)?; }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if cfg.tcp_quickack && ty == r::Type::Stream {
            let _ = r::set_tcp_quickack(os, true);
        }
    }

    if ty == r::Type::Stream && cfg.tcp_nodelay {
        r::set_tcp_nodelay(os, true)?;
    }

    Ok(())
}
