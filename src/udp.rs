//! UDP client and the datagram engine shared with the server
//!
//! [`DatagramCore`] wraps a non-blocking `mio` UDP socket with an outbound
//! queue for datagrams the kernel could not take right away. A send is tried
//! immediately; its completion callback still runs on a later loop iteration
//! so callers never see it re-entrantly. Payloads larger than
//! `NetConfig::udp_max_datagram_size` fail with `MessageTooLong` before
//! touching the socket.
//!
//! A socket keeps the loop alive only while it is receiving or has queued
//! datagrams.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::UdpSocket;
use mio::{Interest, Token};

use crate::backlog::BacklogWithTimeout;
use crate::config::apply_socket_options;
use crate::data_chunk::DataChunk;
use crate::endpoint::Endpoint;
use crate::error::{Error, StatusCode};
use crate::event_loop::{EventHandler, EventLoop, Readiness};
use crate::raw as r;
use crate::removable::{Removable, RemovalPhase, RemovalState};
use crate::transport::{complete_later, SendCompletion, Transport};
use crate::user_data::UserData;

/// Largest datagram accepted from the network
const RECV_BUFFER_SIZE: usize = 64 * 1024;
/// Consecutive receive errors tolerated before a readiness event is abandoned
const MAX_RECV_ERRORS: usize = 16;

/// What a receive loop does after `recv_from` failed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RecvError {
    Drained,
    Retry,
    Skipped,
}

fn classify_recv_error(e: &io::Error, local: Option<SocketAddr>) -> RecvError {
    match e.kind() {
        io::ErrorKind::WouldBlock => RecvError::Drained,
        io::ErrorKind::Interrupted => RecvError::Retry,
        _ => {
            log::warn!("udp receive error on {:?}: {}", local, e);
            RecvError::Skipped
        }
    }
}

struct QueuedDatagram {
    data: Bytes,
    to: SocketAddr,
    cb: SendCompletion,
}

/// Socket plus outbound queue of one UDP endpoint
pub(crate) struct DatagramCore {
    socket: RefCell<Option<UdpSocket>>,
    token: Cell<Option<Token>>,
    queue: RefCell<VecDeque<QueuedDatagram>>,
    write_interest: Cell<bool>,
    receiving: Cell<bool>,
    recv_buf: RefCell<Vec<u8>>,
}

impl DatagramCore {
    pub fn new() -> Self {
        Self {
            socket: RefCell::new(None),
            token: Cell::new(None),
            queue: RefCell::new(VecDeque::new()),
            write_interest: Cell::new(false),
            receiving: Cell::new(false),
            recv_buf: RefCell::new(Vec::new()),
        }
    }

    /// Binds a socket to `addr` and registers it with the loop
    pub fn bind(&self, lp: &EventLoop, addr: SocketAddr, handler: Rc<dyn EventHandler>) -> Result<(), Error> {
        let domain = r::Domain::of(&addr);
        let fd = r::socket(domain, r::Type::Dgram, r::Protocol::Udp)?;
        let os = r::fd_of(&fd);
        apply_socket_options(os, domain, r::Type::Dgram, lp.config())?;
        r::bind_raw(os, addr)?;
        let mut socket = UdpSocket::from_std(r::udp_from_os(fd));
        let token = lp.register(&mut socket, Interest::READABLE, handler)?;
        self.token.set(Some(token));
        *self.socket.borrow_mut() = Some(socket);
        self.update_ref(lp);
        log::debug!("udp socket bound to {:?}", self.local_addr());
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.socket.borrow().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.borrow().as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn set_receiving(&self, lp: &EventLoop, on: bool) {
        self.receiving.set(on);
        self.update_ref(lp);
    }

    fn update_ref(&self, lp: &EventLoop) {
        if let Some(token) = self.token.get() {
            lp.set_refd(token, self.receiving.get() || !self.queue.borrow().is_empty());
        }
    }

    /// Sends at once if nothing is queued, otherwise queues behind earlier datagrams
    pub fn send_to(&self, lp: &EventLoop, data: Bytes, to: SocketAddr, cb: SendCompletion) {
        if data.len() > lp.config().udp_max_datagram_size {
            return complete_later(lp, cb, Err(Error::new(StatusCode::MessageTooLong)));
        }
        if !self.queue.borrow().is_empty() {
            self.queue.borrow_mut().push_back(QueuedDatagram { data, to, cb });
            return;
        }
        let sent = match self.socket.borrow().as_ref() {
            Some(socket) => socket.send_to(&data, to),
            None => return complete_later(lp, cb, Err(Error::new(StatusCode::BadFileDescriptor))),
        };
        match sent {
            Ok(_) => {
                log::trace!("udp sent {} bytes to {}", data.len(), to);
                complete_later(lp, cb, Ok(()));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.queue.borrow_mut().push_back(QueuedDatagram { data, to, cb });
                self.update_interest(lp);
                self.update_ref(lp);
            }
            Err(e) => complete_later(lp, cb, Err(e.into())),
        }
    }

    /// Sends queued datagrams until the kernel pushes back
    pub fn flush(&self, lp: &EventLoop) {
        loop {
            let Some(next) = self.queue.borrow_mut().pop_front() else { break };
            let sent = match self.socket.borrow().as_ref() {
                Some(socket) => socket.send_to(&next.data, next.to),
                None => Err(io::Error::from_raw_os_error(libc::EBADF)),
            };
            match sent {
                Ok(_) => complete_later(lp, next.cb, Ok(())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.queue.borrow_mut().push_front(next);
                    break;
                }
                Err(e) => complete_later(lp, next.cb, Err(e.into())),
            }
        }
        self.update_interest(lp);
        self.update_ref(lp);
    }

    fn update_interest(&self, lp: &EventLoop) {
        let want = !self.queue.borrow().is_empty();
        if want == self.write_interest.get() {
            return;
        }
        let mut socket = self.socket.borrow_mut();
        let (Some(token), Some(socket)) = (self.token.get(), socket.as_mut()) else {
            return;
        };
        let interest = if want { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        match lp.reregister(socket, token, interest) {
            Ok(()) => self.write_interest.set(want),
            Err(e) => log::warn!("failed to update datagram interest: {}", e),
        }
    }

    /// Reads every pending datagram, handing each to `deliver`
    pub fn recv_all(&self, deliver: &mut dyn FnMut(DataChunk, Endpoint)) {
        let mut errors = 0;
        loop {
            let received = {
                let socket = self.socket.borrow();
                let Some(socket) = socket.as_ref() else { return };
                let mut buf = self.recv_buf.borrow_mut();
                if buf.len() != RECV_BUFFER_SIZE {
                    buf.resize(RECV_BUFFER_SIZE, 0);
                }
                match socket.recv_from(&mut buf[..]) {
                    Ok((n, from)) => {
                        errors = 0;
                        (Bytes::copy_from_slice(&buf[..n]), Endpoint::from(from))
                    }
                    Err(e) => match classify_recv_error(&e, socket.local_addr().ok()) {
                        RecvError::Drained => return,
                        RecvError::Retry => continue,
                        RecvError::Skipped => {
                            errors += 1;
                            if errors >= MAX_RECV_ERRORS {
                                log::error!("udp receive failing repeatedly, waiting for next readiness");
                                return;
                            }
                            continue;
                        }
                    },
                }
            };
            if !self.receiving.get() {
                continue;
            }
            log::trace!("udp received {} bytes from {}", received.0.len(), received.1);
            deliver(DataChunk::new(received.0), received.1);
        }
    }

    pub fn receive_buffer_size(&self) -> Result<usize, Error> {
        match self.socket.borrow().as_ref() {
            Some(s) => Ok(r::recv_buffer(r::fd_of(s))?),
            None => Err(Error::new(StatusCode::BadFileDescriptor)),
        }
    }

    pub fn send_buffer_size(&self) -> Result<usize, Error> {
        match self.socket.borrow().as_ref() {
            Some(s) => Ok(r::send_buffer(r::fd_of(s))?),
            None => Err(Error::new(StatusCode::BadFileDescriptor)),
        }
    }

    pub fn set_receive_buffer_size(&self, lp: &EventLoop, size: usize) -> Result<(), Error> {
        lp.config().check_receive_buffer_size(size)?;
        match self.socket.borrow().as_ref() {
            Some(s) => Ok(r::set_recv_buffer(r::fd_of(s), size as i32)?),
            None => Err(Error::new(StatusCode::BadFileDescriptor)),
        }
    }

    pub fn set_send_buffer_size(&self, lp: &EventLoop, size: usize) -> Result<(), Error> {
        lp.config().check_send_buffer_size(size)?;
        match self.socket.borrow().as_ref() {
            Some(s) => Ok(r::set_send_buffer(r::fd_of(s), size as i32)?),
            None => Err(Error::new(StatusCode::BadFileDescriptor)),
        }
    }

    /// Closes the socket; queued datagrams fail with `OperationCanceled`
    pub fn close(&self, lp: &EventLoop) {
        self.receiving.set(false);
        let socket = self.socket.borrow_mut().take();
        if let (Some(mut socket), Some(token)) = (socket, self.token.take()) {
            lp.deregister(&mut socket, token);
        }
        let canceled: Vec<_> = self.queue.borrow_mut().drain(..).collect();
        for d in canceled {
            complete_later(lp, d.cb, Err(Error::canceled()));
        }
        self.write_interest.set(false);
    }
}

/// Which senders a [`UdpClient`] accepts datagrams from
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SenderFilter {
    /// Only the configured destination; nothing while no destination is set
    #[default]
    DestinationOnly,
    /// Any sender when no destination is set, otherwise only the destination
    Any,
}

type ClientReceiveCallback = Rc<dyn Fn(&UdpClient, DataChunk, Endpoint)>;
type ClientTimeoutCallback = Box<dyn FnOnce(&UdpClient)>;

struct ClientInner {
    lp: EventLoop,
    core: DatagramCore,
    destination: Cell<Endpoint>,
    filter: Cell<SenderFilter>,
    closed: Cell<bool>,
    on_receive: RefCell<Option<ClientReceiveCallback>>,
    on_timeout: RefCell<Option<ClientTimeoutCallback>>,
    timeout: RefCell<Option<BacklogWithTimeout<(), ()>>>,
    last_packet_time: Cell<Instant>,
    removal: RemovalState,
    user_data: UserData,
}

/// Connectionless UDP sender/receiver bound to one destination
///
/// The socket is bound lazily to an ephemeral port of the destination's
/// family, on the first send, `set_destination` or `start_receive`.
#[derive(Clone)]
pub struct UdpClient {
    inner: Rc<ClientInner>,
}

impl UdpClient {
    pub fn new(lp: &EventLoop) -> Self {
        Self {
            inner: Rc::new(ClientInner {
                lp: lp.clone(),
                core: DatagramCore::new(),
                destination: Cell::new(Endpoint::Undefined),
                filter: Cell::new(SenderFilter::default()),
                closed: Cell::new(false),
                on_receive: RefCell::new(None),
                on_timeout: RefCell::new(None),
                timeout: RefCell::new(None),
                last_packet_time: Cell::new(lp.now()),
                removal: RemovalState::default(),
                user_data: UserData::default(),
            }),
        }
    }

    /// Creates a client that sends to `destination`
    ///
    /// An undefined destination is accepted here and reported by `send_data`.
    pub fn with_destination(lp: &EventLoop, destination: Endpoint) -> Self {
        let client = Self::new(lp);
        client.inner.destination.set(destination);
        client
    }

    /// Changes the destination, binding the socket if needed
    pub fn set_destination(&self, destination: Endpoint) -> Result<(), Error> {
        destination.require_socket_addr()?;
        self.inner.destination.set(destination);
        self.inner.ensure_bound()
    }

    pub fn destination(&self) -> Endpoint {
        self.inner.destination.get()
    }

    pub fn sender_filter(&self) -> SenderFilter {
        self.inner.filter.get()
    }

    pub fn set_sender_filter(&self, filter: SenderFilter) {
        self.inner.filter.set(filter);
    }

    /// Starts delivering datagrams from accepted senders to `on_receive`
    pub fn start_receive<F>(&self, on_receive: F) -> Result<(), Error>
    where
        F: Fn(&UdpClient, DataChunk, Endpoint) + 'static,
    {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return Err(Error::canceled());
        }
        inner.ensure_bound()?;
        *inner.on_receive.borrow_mut() = Some(Rc::new(on_receive));
        inner.last_packet_time.set(inner.lp.now());
        inner.core.set_receiving(&inner.lp, true);
        Ok(())
    }

    /// Like [`start_receive`](Self::start_receive), closing the client once
    /// no datagram arrived for `timeout`; `on_timeout` fires once then
    pub fn start_receive_with_timeout<F, T>(&self, on_receive: F, timeout: Duration, on_timeout: T) -> Result<(), Error>
    where
        F: Fn(&UdpClient, DataChunk, Endpoint) + 'static,
        T: FnOnce(&UdpClient) + 'static,
    {
        self.start_receive(on_receive)?;
        let inner = &self.inner;
        *inner.on_timeout.borrow_mut() = Some(Box::new(on_timeout));

        let activity: Weak<ClientInner> = Rc::downgrade(inner);
        let expiry: Weak<ClientInner> = Rc::downgrade(inner);
        let backlog = BacklogWithTimeout::new(
            &inner.lp,
            timeout,
            move |_: &()| activity.upgrade().map(|i| i.last_packet_time.get()).unwrap_or_else(Instant::now),
            move |_: &()| {
                if let Some(inner) = expiry.upgrade() {
                    inner.expire();
                }
            },
        );
        backlog.add_item((), ());
        *inner.timeout.borrow_mut() = Some(backlog);
        Ok(())
    }

    /// Stops receiving and closes the socket
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.get() && self.inner.removal.is_active()
    }

    /// Local port, 0 until the socket is bound
    pub fn bound_port(&self) -> u16 {
        self.inner.core.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn last_packet_time(&self) -> Instant {
        self.inner.last_packet_time.get()
    }

    pub fn receive_buffer_size(&self) -> Result<usize, Error> {
        self.inner.core.receive_buffer_size()
    }

    pub fn send_buffer_size(&self) -> Result<usize, Error> {
        self.inner.core.send_buffer_size()
    }

    pub fn set_receive_buffer_size(&self, size: usize) -> Result<(), Error> {
        self.inner.core.set_receive_buffer_size(&self.inner.lp, size)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), Error> {
        self.inner.core.set_send_buffer_size(&self.inner.lp, size)
    }

    pub fn set_user_data<T: 'static>(&self, value: T) {
        self.inner.user_data.set(value);
    }

    pub fn user_data<T: 'static>(&self) -> Option<Rc<T>> {
        self.inner.user_data.get()
    }
}

impl ClientInner {
    fn handle(self: &Rc<Self>) -> UdpClient {
        UdpClient { inner: Rc::clone(self) }
    }

    fn ensure_bound(self: &Rc<Self>) -> Result<(), Error> {
        if self.closed.get() {
            return Err(Error::new(StatusCode::BadFileDescriptor));
        }
        if self.core.is_bound() {
            return Ok(());
        }
        let local = self.destination.get().unspecified_like();
        let handler: Rc<dyn EventHandler> = Rc::clone(self) as Rc<dyn EventHandler>;
        self.core.bind(&self.lp, local, handler)
    }

    fn accepts(&self, from: &Endpoint) -> bool {
        let destination = self.destination.get();
        if destination.is_defined() {
            return *from == destination;
        }
        self.filter.get() == SenderFilter::Any
    }

    fn close(self: &Rc<Self>) {
        if self.closed.replace(true) {
            return;
        }
        self.core.close(&self.lp);
        if let Some(backlog) = self.timeout.borrow_mut().take() {
            backlog.clear();
        }
        self.on_receive.borrow_mut().take();
        log::debug!("udp client to {} closed", self.destination.get());
    }

    fn expire(self: &Rc<Self>) {
        log::debug!("udp client to {} timed out", self.destination.get());
        let cb = self.on_timeout.borrow_mut().take();
        self.close();
        if let Some(cb) = cb {
            cb(&self.handle());
        }
    }
}

impl EventHandler for ClientInner {
    fn handle_event(self: Rc<Self>, lp: &EventLoop, ready: Readiness) {
        if ready.writable {
            self.core.flush(lp);
        }
        if ready.readable {
            let on_receive = self.on_receive.borrow().clone();
            let this = self.handle();
            self.core.recv_all(&mut |chunk, from| {
                if !self.accepts(&from) {
                    log::trace!("udp client dropped datagram from {}", from);
                    return;
                }
                self.last_packet_time.set(lp.now());
                if let Some(cb) = &on_receive {
                    cb(&this, chunk, from);
                }
            });
        }
    }
}

impl Transport for UdpClient {
    fn send_bytes(&self, data: Bytes, cb: SendCompletion) {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return complete_later(&inner.lp, cb, Err(Error::canceled()));
        }
        let Some(to) = inner.destination.get().to_socket_addr() else {
            return complete_later(&inner.lp, cb, Err(Error::new(StatusCode::DestinationAddressRequired)));
        };
        if data.len() > inner.lp.config().udp_max_datagram_size {
            return complete_later(&inner.lp, cb, Err(Error::new(StatusCode::MessageTooLong)));
        }
        if let Err(e) = inner.ensure_bound() {
            return complete_later(&inner.lp, cb, Err(e));
        }
        inner.core.send_to(&inner.lp, data, to, cb);
    }

    fn is_open(&self) -> bool {
        UdpClient::is_open(self)
    }

    fn endpoint(&self) -> Endpoint {
        self.destination()
    }

    fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }
}

impl Removable for UdpClient {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        log::debug!("udp client to {} removal scheduled", inner.destination.get());
        inner.close();
        let inner = Rc::clone(inner);
        self.inner.lp.post(move |_| {
            inner.on_timeout.borrow_mut().take();
            inner.user_data.clear();
            inner.removal.finish();
        });
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

impl std::fmt::Debug for UdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpClient")
            .field("destination", &self.inner.destination.get())
            .field("bound_port", &self.bound_port())
            .finish()
    }
}
