//! TCP client and the stream engine shared with accepted connections
//!
//! [`StreamCore`] owns a non-blocking `mio` stream plus its write queue and
//! receive buffer. It is driven by readiness events and knows nothing about
//! callbacks beyond the write completions it posts back to the loop.
//!
//! # Write path
//!
//! `send_data` queues the bytes and tries to write them right away. Anything
//! the kernel does not take is kept until the socket turns writable. Write
//! completions always run on a later loop iteration, in submission order,
//! after the pending-write counter has been decremented.
//!
//! # Read path
//!
//! Every readable event drains the socket into a single receive buffer.
//! Each read is split off as shared [`Bytes`]; the buffer memory is reused
//! only when no earlier chunk is still referenced.
//!
//! # Examples
//!
//! ```rust,no_run
//! use horizon_io::{Endpoint, EventLoop, TcpClient, Transport};
//!
//! let lp = EventLoop::new().unwrap();
//! let client = TcpClient::new(&lp);
//! client.connect(
//!     Endpoint::new("127.0.0.1", 8080),
//!     |client, result| {
//!         if result.is_ok() {
//!             client.send_data(&b"ping"[..], |client, _| client.shutdown());
//!         }
//!     },
//!     |_client, chunk| println!("got {} bytes", chunk.len()),
//!     |_client, _result| println!("closed"),
//! );
//! lp.run().unwrap();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::config::apply_socket_options;
use crate::data_chunk::DataChunk;
use crate::endpoint::Endpoint;
use crate::error::{Error, StatusCode};
use crate::event_loop::{EventHandler, EventLoop, Readiness};
use crate::raw as r;
use crate::removable::{Removable, RemovalPhase, RemovalState};
use crate::transport::{complete_later, SendCompletion, Transport};
use crate::user_data::UserData;

struct PendingWrite {
    data: Bytes,
    written: usize,
    cb: SendCompletion,
}

/// Outcome of draining a readable socket
pub(crate) enum ReadStatus {
    /// Socket drained, more data may come later
    WouldBlock,
    /// Peer closed its side
    Eof,
    Failed(Error),
    /// The socket was closed while delivering data
    Stopped,
}

/// Socket, write queue and receive buffer of one TCP connection
pub(crate) struct StreamCore {
    stream: RefCell<Option<TcpStream>>,
    token: Cell<Option<Token>>,
    writes: RefCell<VecDeque<PendingWrite>>,
    pending: Cell<usize>,
    read_buf: RefCell<BytesMut>,
    read_size: usize,
    write_interest: Cell<bool>,
}

impl StreamCore {
    pub fn new(read_size: usize) -> Self {
        Self {
            stream: RefCell::new(None),
            token: Cell::new(None),
            writes: RefCell::new(VecDeque::new()),
            pending: Cell::new(0),
            read_buf: RefCell::new(BytesMut::with_capacity(read_size)),
            read_size,
            write_interest: Cell::new(false),
        }
    }

    /// Registers `stream` with the loop and takes ownership of it
    pub fn attach(
        &self,
        lp: &EventLoop,
        mut stream: TcpStream,
        writable: bool,
        handler: Rc<dyn EventHandler>,
    ) -> io::Result<()> {
        let interest = if writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        let token = lp.register(&mut stream, interest, handler)?;
        self.token.set(Some(token));
        self.write_interest.set(writable);
        *self.stream.borrow_mut() = Some(stream);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.stream.borrow().is_some()
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.get()
    }

    pub fn peer_endpoint(&self) -> Result<Endpoint, Error> {
        match self.stream.borrow().as_ref() {
            Some(s) => Ok(s.peer_addr()?.into()),
            None => Err(Error::new(StatusCode::SocketIsNotConnected)),
        }
    }

    /// Resolves a non-blocking connect: `Ok(true)` once established
    pub fn connect_result(&self) -> Result<bool, Error> {
        let stream = self.stream.borrow();
        let Some(stream) = stream.as_ref() else {
            return Err(Error::canceled());
        };
        if let Some(e) = stream.take_error()? {
            return Err(e.into());
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Queues a write and tries to push it out immediately
    pub fn enqueue(&self, lp: &EventLoop, data: Bytes, cb: SendCompletion) -> Result<(), Error> {
        if !self.is_open() {
            complete_later(lp, cb, Err(Error::new(StatusCode::SocketIsNotConnected)));
            return Ok(());
        }
        self.pending.set(self.pending.get() + 1);
        self.writes.borrow_mut().push_back(PendingWrite { data, written: 0, cb });
        self.flush(lp)
    }

    /// Writes queued data until the kernel pushes back
    ///
    /// A write error completes the failing request with that error and is
    /// returned; the caller is expected to close the stream.
    pub fn flush(&self, lp: &EventLoop) -> Result<(), Error> {
        let mut finished: Vec<(SendCompletion, Result<(), Error>)> = Vec::new();
        let outcome = {
            let mut stream = self.stream.borrow_mut();
            let Some(stream) = stream.as_mut() else {
                return Ok(());
            };
            let mut writes = self.writes.borrow_mut();
            loop {
                let Some(front) = writes.front_mut() else { break Ok(()) };
                if front.written == front.data.len() {
                    if let Some(done) = writes.pop_front() {
                        finished.push((done.cb, Ok(())));
                    }
                    continue;
                }
                match stream.write(&front.data[front.written..]) {
                    Ok(0) => {
                        let err = Error::new(StatusCode::BrokenPipe);
                        if let Some(done) = writes.pop_front() {
                            finished.push((done.cb, Err(err.clone())));
                        }
                        break Err(err);
                    }
                    Ok(n) => front.written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let err = Error::from(e);
                        if let Some(done) = writes.pop_front() {
                            finished.push((done.cb, Err(err.clone())));
                        }
                        break Err(err);
                    }
                }
            }
        };

        self.complete(lp, finished);
        if outcome.is_ok() {
            self.update_interest(lp);
        }
        outcome
    }

    fn complete(&self, lp: &EventLoop, finished: Vec<(SendCompletion, Result<(), Error>)>) {
        if finished.is_empty() {
            return;
        }
        self.pending.set(self.pending.get() - finished.len());
        lp.post(move |_| {
            for (cb, result) in finished {
                cb(result);
            }
        });
    }

    fn update_interest(&self, lp: &EventLoop) {
        let want = !self.writes.borrow().is_empty();
        if want == self.write_interest.get() {
            return;
        }
        let mut stream = self.stream.borrow_mut();
        let (Some(token), Some(stream)) = (self.token.get(), stream.as_mut()) else {
            return;
        };
        let interest = if want { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        match lp.reregister(stream, token, interest) {
            Ok(()) => self.write_interest.set(want),
            Err(e) => log::warn!("failed to update stream interest: {}", e),
        }
    }

    /// Reads until the socket would block, handing each read to `deliver`
    pub fn read_available(&self, deliver: &mut dyn FnMut(DataChunk)) -> ReadStatus {
        loop {
            let read = {
                let mut stream = self.stream.borrow_mut();
                let Some(stream) = stream.as_mut() else {
                    return ReadStatus::Stopped;
                };
                let mut buf = self.read_buf.borrow_mut();
                buf.resize(self.read_size, 0);
                match stream.read(&mut buf[..]) {
                    Ok(0) => {
                        buf.clear();
                        return ReadStatus::Eof;
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        buf.split().freeze()
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        buf.clear();
                        return ReadStatus::WouldBlock;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        buf.clear();
                        continue;
                    }
                    Err(e) => {
                        buf.clear();
                        return ReadStatus::Failed(e.into());
                    }
                }
            };
            log::trace!("tcp read {} bytes", read.len());
            deliver(DataChunk::new(read));
        }
    }

    /// Half-closes the write side
    pub fn half_close(&self) {
        if let Some(stream) = self.stream.borrow().as_ref() {
            if let Err(e) = stream.shutdown(Shutdown::Write) {
                log::debug!("tcp half-close failed: {}", e);
            }
        }
    }

    /// Deregisters and closes the socket; queued writes fail with `OperationCanceled`
    pub fn close(&self, lp: &EventLoop) {
        let stream = self.stream.borrow_mut().take();
        if let (Some(mut stream), Some(token)) = (stream, self.token.take()) {
            lp.deregister(&mut stream, token);
        }
        let canceled: Vec<_> = self
            .writes
            .borrow_mut()
            .drain(..)
            .map(|w| (w.cb, Err(Error::canceled())))
            .collect();
        self.complete(lp, canceled);
        self.write_interest.set(false);
    }
}

/// Opens a non-blocking stream socket and starts connecting it
pub(crate) fn start_connect(endpoint: &Endpoint, lp: &EventLoop) -> Result<TcpStream, Error> {
    let addr = endpoint.require_socket_addr()?;
    let domain = r::Domain::of(&addr);
    let fd = r::socket(domain, r::Type::Stream, r::Protocol::Tcp)?;
    apply_socket_options(r::fd_of(&fd), domain, r::Type::Stream, lp.config())?;
    r::connect_raw(r::fd_of(&fd), addr)?;
    Ok(TcpStream::from_std(r::tcp_stream_from_os(fd)))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ClientState {
    Idle,
    Connecting,
    Connected,
    ShuttingDown,
    Closed,
}

type ConnectCallback = Box<dyn FnOnce(&TcpClient, Result<(), Error>)>;
type ReceiveCallback = Rc<dyn Fn(&TcpClient, DataChunk)>;
type CloseCallback = Box<dyn FnOnce(&TcpClient, Result<(), Error>)>;

struct ClientInner {
    lp: EventLoop,
    core: StreamCore,
    state: Cell<ClientState>,
    peer: Cell<Endpoint>,
    on_connect: RefCell<Option<ConnectCallback>>,
    on_receive: RefCell<Option<ReceiveCallback>>,
    on_close: RefCell<Option<CloseCallback>>,
    removal: RemovalState,
    user_data: UserData,
}

/// Outgoing TCP connection
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct TcpClient {
    inner: Rc<ClientInner>,
}

impl TcpClient {
    pub fn new(lp: &EventLoop) -> Self {
        Self {
            inner: Rc::new(ClientInner {
                lp: lp.clone(),
                core: StreamCore::new(lp.config().tcp_read_buffer_size),
                state: Cell::new(ClientState::Idle),
                peer: Cell::new(Endpoint::Undefined),
                on_connect: RefCell::new(None),
                on_receive: RefCell::new(None),
                on_close: RefCell::new(None),
                removal: RemovalState::default(),
                user_data: UserData::default(),
            }),
        }
    }

    /// Connects to `endpoint`
    ///
    /// `on_connect` fires exactly once with the outcome. After a successful
    /// connect, `on_receive` fires for every read and `on_close` once when the
    /// connection ends, with `Ok` for an orderly close.
    pub fn connect<C, R, X>(&self, endpoint: Endpoint, on_connect: C, on_receive: R, on_close: X)
    where
        C: FnOnce(&TcpClient, Result<(), Error>) + 'static,
        R: Fn(&TcpClient, DataChunk) + 'static,
        X: FnOnce(&TcpClient, Result<(), Error>) + 'static,
    {
        let inner = &self.inner;
        let refusal = if !inner.removal.is_active() {
            Some(StatusCode::OperationCanceled)
        } else {
            match inner.state.get() {
                ClientState::Idle | ClientState::Closed => None,
                ClientState::Connecting => Some(StatusCode::ConnectionAlreadyInProgress),
                ClientState::Connected | ClientState::ShuttingDown => Some(StatusCode::SocketIsAlreadyConnected),
            }
        };
        if let Some(status) = refusal {
            let this = self.clone();
            inner.lp.post(move |_| on_connect(&this, Err(Error::new(status))));
            return;
        }

        *inner.on_connect.borrow_mut() = Some(Box::new(on_connect));
        *inner.on_receive.borrow_mut() = Some(Rc::new(on_receive));
        *inner.on_close.borrow_mut() = Some(Box::new(on_close));
        inner.peer.set(endpoint);

        let started = start_connect(&endpoint, &inner.lp).and_then(|stream| {
            let handler: Rc<dyn EventHandler> = Rc::clone(inner) as Rc<dyn EventHandler>;
            inner.core.attach(&inner.lp, stream, true, handler).map_err(Error::from)
        });
        match started {
            Ok(()) => {
                log::debug!("tcp connecting to {}", endpoint);
                inner.state.set(ClientState::Connecting);
            }
            Err(e) => {
                log::debug!("tcp connect to {} failed early: {}", endpoint, e);
                inner.state.set(ClientState::Connecting);
                inner.close_with(Err(e));
            }
        }
    }

    /// Aborts the connection; queued writes complete with `OperationCanceled`
    pub fn close(&self) {
        self.inner.close_with(Ok(()));
    }

    /// Stops accepting sends, finishes queued writes, then closes
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.state.get(), ClientState::Connected | ClientState::ShuttingDown)
    }

    /// Writes queued but not yet completed
    pub fn pending_write_requests(&self) -> usize {
        self.inner.core.pending_writes()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.peer.get()
    }

    pub fn set_user_data<T: 'static>(&self, value: T) {
        self.inner.user_data.set(value);
    }

    pub fn user_data<T: 'static>(&self) -> Option<Rc<T>> {
        self.inner.user_data.get()
    }
}

impl ClientInner {
    fn handle(self: &Rc<Self>) -> TcpClient {
        TcpClient { inner: Rc::clone(self) }
    }

    fn close_with(self: &Rc<Self>, result: Result<(), Error>) {
        let prev = self.state.replace(ClientState::Closed);
        if matches!(prev, ClientState::Idle | ClientState::Closed) {
            return;
        }
        self.core.close(&self.lp);
        self.on_receive.borrow_mut().take();

        let this = self.handle();
        if prev == ClientState::Connecting {
            self.on_close.borrow_mut().take();
            let cb = self.on_connect.borrow_mut().take();
            if let Some(cb) = cb {
                let result = result.and(Err(Error::canceled()));
                self.lp.post(move |_| cb(&this, result));
            }
        } else {
            log::debug!("tcp connection to {} closed", self.peer.get());
            let cb = self.on_close.borrow_mut().take();
            if let Some(cb) = cb {
                self.lp.post(move |_| cb(&this, result));
            }
        }
    }

    fn shutdown(self: &Rc<Self>) {
        match self.state.get() {
            ClientState::Connected => {
                self.state.set(ClientState::ShuttingDown);
                self.maybe_finish_shutdown();
            }
            ClientState::Connecting => self.close_with(Ok(())),
            _ => {}
        }
    }

    fn maybe_finish_shutdown(self: &Rc<Self>) {
        if self.state.get() == ClientState::ShuttingDown && self.core.pending_writes() == 0 {
            self.core.half_close();
            self.close_with(Ok(()));
        }
    }

    fn finish_connect(self: &Rc<Self>) {
        match self.core.connect_result() {
            Ok(false) => {}
            Ok(true) => {
                self.state.set(ClientState::Connected);
                if let Ok(peer) = self.core.peer_endpoint() {
                    self.peer.set(peer);
                }
                log::debug!("tcp connected to {}", self.peer.get());
                if let Err(e) = self.core.flush(&self.lp) {
                    return self.close_with(Err(e));
                }
                let cb = self.on_connect.borrow_mut().take();
                if let Some(cb) = cb {
                    cb(&self.handle(), Ok(()));
                }
                if self.state.get() == ClientState::Connected {
                    self.read();
                }
            }
            Err(e) => self.close_with(Err(e)),
        }
    }

    fn read(self: &Rc<Self>) {
        let on_receive = self.on_receive.borrow().clone();
        let this = self.handle();
        let status = self.core.read_available(&mut |chunk| {
            if let Some(cb) = &on_receive {
                cb(&this, chunk);
            }
        });
        match status {
            ReadStatus::Eof => self.close_with(Ok(())),
            ReadStatus::Failed(e) => self.close_with(Err(e)),
            ReadStatus::WouldBlock | ReadStatus::Stopped => {}
        }
    }
}

impl EventHandler for ClientInner {
    fn handle_event(self: Rc<Self>, lp: &EventLoop, ready: Readiness) {
        match self.state.get() {
            ClientState::Connecting => {
                if ready.writable || ready.error || ready.write_closed || ready.read_closed {
                    self.finish_connect();
                }
            }
            ClientState::Connected | ClientState::ShuttingDown => {
                if ready.writable {
                    if let Err(e) = self.core.flush(lp) {
                        return self.close_with(Err(e));
                    }
                    self.maybe_finish_shutdown();
                }
                if ready.readable || ready.read_closed || ready.error {
                    self.read();
                }
            }
            ClientState::Idle | ClientState::Closed => {}
        }
    }
}

impl Transport for TcpClient {
    fn send_bytes(&self, data: Bytes, cb: SendCompletion) {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return complete_later(&inner.lp, cb, Err(Error::canceled()));
        }
        match inner.state.get() {
            ClientState::Connected => {
                if let Err(e) = inner.core.enqueue(&inner.lp, data, cb) {
                    inner.close_with(Err(e));
                }
            }
            ClientState::ShuttingDown => complete_later(
                &inner.lp,
                cb,
                Err(Error::new(StatusCode::CannotSendAfterTransportEndpointShutdown)),
            ),
            _ => complete_later(&inner.lp, cb, Err(Error::new(StatusCode::SocketIsNotConnected))),
        }
    }

    fn is_open(&self) -> bool {
        TcpClient::is_open(self)
    }

    fn endpoint(&self) -> Endpoint {
        TcpClient::endpoint(self)
    }

    fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }
}

impl Removable for TcpClient {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        log::debug!("tcp client {} removal scheduled", inner.peer.get());
        inner.close_with(Ok(()));
        let inner = Rc::clone(inner);
        self.inner.lp.post(move |_| {
            inner.on_connect.borrow_mut().take();
            inner.on_close.borrow_mut().take();
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

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("endpoint", &self.inner.peer.get())
            .field("state", &self.inner.state.get())
            .finish()
    }
}
