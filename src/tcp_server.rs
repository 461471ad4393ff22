//! TCP listener and accepted connections

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};

use crate::config::apply_socket_options;
use crate::data_chunk::DataChunk;
use crate::endpoint::Endpoint;
use crate::error::{Error, StatusCode};
use crate::event_loop::{EventHandler, EventLoop, Readiness};
use crate::raw as r;
use crate::removable::{Removable, RemovalPhase, RemovalState};
use crate::tcp::{ReadStatus, StreamCore};
use crate::transport::{complete_later, SendCompletion, Transport};
use crate::user_data::UserData;

/// Accept backlog used when callers have no preference
pub const DEFAULT_BACKLOG: i32 = 128;

struct ServerCallbacks {
    on_new_connection: Box<dyn Fn(&TcpConnectedClient, Result<(), Error>)>,
    on_data: Box<dyn Fn(&TcpConnectedClient, DataChunk)>,
    on_close: Box<dyn Fn(&TcpConnectedClient, Result<(), Error>)>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ServerState {
    Idle,
    Listening,
    ShuttingDown,
    Closed,
}

struct ServerInner {
    lp: EventLoop,
    listener: RefCell<Option<TcpListener>>,
    token: Cell<Option<Token>>,
    bound: Cell<Endpoint>,
    state: Cell<ServerState>,
    clients: RefCell<BTreeMap<u64, TcpConnectedClient>>,
    next_client_id: Cell<u64>,
    callbacks: RefCell<Option<Rc<ServerCallbacks>>>,
    on_closed: RefCell<Option<Box<dyn FnOnce(&TcpServer)>>>,
    removal: RemovalState,
}

/// Listening TCP socket serving many connections
#[derive(Clone)]
pub struct TcpServer {
    inner: Rc<ServerInner>,
}

impl TcpServer {
    pub fn new(lp: &EventLoop) -> Self {
        Self {
            inner: Rc::new(ServerInner {
                lp: lp.clone(),
                listener: RefCell::new(None),
                token: Cell::new(None),
                bound: Cell::new(Endpoint::Undefined),
                state: Cell::new(ServerState::Idle),
                clients: RefCell::new(BTreeMap::new()),
                next_client_id: Cell::new(0),
                callbacks: RefCell::new(None),
                on_closed: RefCell::new(None),
                removal: RemovalState::default(),
            }),
        }
    }

    /// Binds to `endpoint` and starts accepting connections
    ///
    /// Bind and listen failures are returned directly, e.g.
    /// `AddressAlreadyInUse` or `PermissionDenied`; a malformed endpoint
    /// yields `InvalidArgument`. For every accepted connection
    /// `on_new_connection` runs first; reading starts only if the connection
    /// is still open afterwards.
    pub fn listen<N, D, C>(&self, endpoint: Endpoint, on_new_connection: N, on_data: D, on_close: C, backlog: i32) -> Result<(), Error>
    where
        N: Fn(&TcpConnectedClient, Result<(), Error>) + 'static,
        D: Fn(&TcpConnectedClient, DataChunk) + 'static,
        C: Fn(&TcpConnectedClient, Result<(), Error>) + 'static,
    {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return Err(Error::canceled());
        }
        if inner.state.get() != ServerState::Idle {
            return Err(Error::with_message(StatusCode::InvalidArgument, "server is already listening"));
        }
        let addr = endpoint.require_socket_addr()?;
        let mut listener = bind_listener(addr, backlog, &inner.lp)?;
        let handler: Rc<dyn EventHandler> = Rc::clone(inner) as Rc<dyn EventHandler>;
        let token = inner.lp.register(&mut listener, Interest::READABLE, handler)?;

        inner.bound.set(listener.local_addr().map(Endpoint::from).unwrap_or(endpoint));
        inner.token.set(Some(token));
        *inner.listener.borrow_mut() = Some(listener);
        *inner.callbacks.borrow_mut() = Some(Rc::new(ServerCallbacks {
            on_new_connection: Box::new(on_new_connection),
            on_data: Box::new(on_data),
            on_close: Box::new(on_close),
        }));
        inner.state.set(ServerState::Listening);
        log::debug!("tcp server listening on {}", inner.bound.get());
        Ok(())
    }

    /// Gracefully shuts down every connection, then closes the listener
    ///
    /// `cb` fires once, after the last connection has gone.
    pub fn shutdown<F: FnOnce(&TcpServer) + 'static>(&self, cb: F) {
        self.inner.shutdown(Some(Box::new(cb)));
    }

    /// Aborts every connection and closes the listener; `cb` fires once
    pub fn close<F: FnOnce(&TcpServer) + 'static>(&self, cb: F) {
        self.inner.close(Some(Box::new(cb)));
    }

    pub fn connected_clients_count(&self) -> usize {
        self.inner.clients.borrow().len()
    }

    /// Address actually bound, with the real port when 0 was requested
    pub fn endpoint(&self) -> Endpoint {
        self.inner.bound.get()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.get() == ServerState::Listening
    }
}

fn bind_listener(addr: SocketAddr, backlog: i32, lp: &EventLoop) -> Result<TcpListener, Error> {
    let domain = r::Domain::of(&addr);
    let fd = r::socket(domain, r::Type::Stream, r::Protocol::Tcp)?;
    let os = r::fd_of(&fd);
    r::set_reuse_addr(os, true)?;
    apply_socket_options(os, domain, r::Type::Stream, lp.config())?;
    r::bind_raw(os, addr)?;
    r::listen_raw(os, backlog)?;
    Ok(TcpListener::from_std(r::tcp_listener_from_os(fd)))
}

impl ServerInner {
    fn handle(self: &Rc<Self>) -> TcpServer {
        TcpServer { inner: Rc::clone(self) }
    }

    fn close_listener(&self) {
        let listener = self.listener.borrow_mut().take();
        if let (Some(mut listener), Some(token)) = (listener, self.token.take()) {
            self.lp.deregister(&mut listener, token);
        }
    }

    fn shutdown(self: &Rc<Self>, cb: Option<Box<dyn FnOnce(&TcpServer)>>) {
        match self.state.get() {
            ServerState::Listening => {}
            _ => {
                if let Some(cb) = cb {
                    let this = self.handle();
                    self.lp.post(move |_| cb(&this));
                }
                return;
            }
        }
        self.state.set(ServerState::ShuttingDown);
        *self.on_closed.borrow_mut() = cb;
        self.close_listener();
        let clients: Vec<_> = self.clients.borrow().values().cloned().collect();
        for client in clients {
            client.shutdown();
        }
        self.maybe_finish_close();
    }

    fn close(self: &Rc<Self>, cb: Option<Box<dyn FnOnce(&TcpServer)>>) {
        match self.state.get() {
            ServerState::Listening | ServerState::ShuttingDown => {}
            _ => {
                if let Some(cb) = cb {
                    let this = self.handle();
                    self.lp.post(move |_| cb(&this));
                }
                return;
            }
        }
        self.state.set(ServerState::ShuttingDown);
        if cb.is_some() {
            *self.on_closed.borrow_mut() = cb;
        }
        self.close_listener();
        let clients: Vec<_> = self.clients.borrow().values().cloned().collect();
        for client in clients {
            client.close();
        }
        self.maybe_finish_close();
    }

    fn maybe_finish_close(self: &Rc<Self>) {
        if self.state.get() != ServerState::ShuttingDown || !self.clients.borrow().is_empty() {
            return;
        }
        self.state.set(ServerState::Closed);
        log::debug!("tcp server on {} closed", self.bound.get());
        let cb = self.on_closed.borrow_mut().take();
        if let Some(cb) = cb {
            let this = self.handle();
            self.lp.post(move |_| cb(&this));
        }
    }

    fn accept_pending(self: &Rc<Self>) {
        loop {
            if self.state.get() != ServerState::Listening {
                return;
            }
            let accepted = match self.listener.borrow().as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => self.on_accept(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("tcp accept on {} failed: {}", self.bound.get(), e);
                    return;
                }
            }
        }
    }

    fn on_accept(self: &Rc<Self>, stream: TcpStream, addr: SocketAddr) {
        let Some(callbacks) = self.callbacks.borrow().clone() else {
            return;
        };
        if self.lp.config().tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                log::debug!("failed to set TCP_NODELAY on accepted socket: {}", e);
            }
        }

        let id = self.next_client_id.get();
        self.next_client_id.set(id + 1);
        let client = TcpConnectedClient {
            inner: Rc::new(ConnInner {
                lp: self.lp.clone(),
                id,
                core: StreamCore::new(self.lp.config().tcp_read_buffer_size),
                peer: Cell::new(Endpoint::from(addr)),
                state: Cell::new(ConnState::Open),
                server: Rc::downgrade(self),
                callbacks: Rc::clone(&callbacks),
                user_data: UserData::default(),
                removal: RemovalState::default(),
            }),
        };

        let handler: Rc<dyn EventHandler> = Rc::clone(&client.inner) as Rc<dyn EventHandler>;
        if let Err(e) = client.inner.core.attach(&self.lp, stream, false, handler) {
            log::error!("failed to register accepted connection from {}: {}", addr, e);
            return;
        }
        self.clients.borrow_mut().insert(id, client.clone());
        log::debug!("tcp server on {} accepted {}", self.bound.get(), addr);

        let resolved = if client.endpoint().is_defined() {
            Ok(())
        } else {
            Err(Error::new(StatusCode::AddressFamilyNotSupported))
        };
        let failed = resolved.is_err();
        (callbacks.on_new_connection)(&client, resolved);
        if failed {
            client.close();
        } else if client.is_open() {
            client.inner.read();
        }
    }

    fn forget_client(self: &Rc<Self>, id: u64) {
        self.clients.borrow_mut().remove(&id);
        self.maybe_finish_close();
    }
}

impl EventHandler for ServerInner {
    fn handle_event(self: Rc<Self>, _lp: &EventLoop, ready: Readiness) {
        if ready.readable || ready.error {
            self.accept_pending();
        }
    }
}

impl Removable for TcpServer {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        log::debug!("tcp server on {} removal scheduled", inner.bound.get());
        inner.close(None);
        let inner = Rc::clone(inner);
        self.inner.lp.post(move |_| {
            inner.callbacks.borrow_mut().take();
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

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnState {
    Open,
    ShuttingDown,
    Closed,
}

struct ConnInner {
    lp: EventLoop,
    id: u64,
    core: StreamCore,
    peer: Cell<Endpoint>,
    state: Cell<ConnState>,
    server: Weak<ServerInner>,
    callbacks: Rc<ServerCallbacks>,
    user_data: UserData,
    removal: RemovalState,
}

/// One connection accepted by a [`TcpServer`]
#[derive(Clone)]
pub struct TcpConnectedClient {
    inner: Rc<ConnInner>,
}

impl TcpConnectedClient {
    /// Server-unique id of the connection
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.peer.get()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.get() != ConnState::Closed
    }

    /// Aborts the connection; queued writes complete with `OperationCanceled`
    pub fn close(&self) {
        self.inner.close_with(Ok(()));
    }

    /// Finishes queued writes, half-closes, then closes
    pub fn shutdown(&self) {
        if self.inner.state.get() == ConnState::Open {
            self.inner.state.set(ConnState::ShuttingDown);
            self.inner.maybe_finish_shutdown();
        }
    }

    pub fn pending_write_requests(&self) -> usize {
        self.inner.core.pending_writes()
    }

    pub fn server(&self) -> Option<TcpServer> {
        self.inner.server.upgrade().map(|inner| TcpServer { inner })
    }

    pub fn set_user_data<T: 'static>(&self, value: T) {
        self.inner.user_data.set(value);
    }

    pub fn user_data<T: 'static>(&self) -> Option<Rc<T>> {
        self.inner.user_data.get()
    }
}

impl ConnInner {
    fn handle(self: &Rc<Self>) -> TcpConnectedClient {
        TcpConnectedClient { inner: Rc::clone(self) }
    }

    fn close_with(self: &Rc<Self>, result: Result<(), Error>) {
        if self.state.replace(ConnState::Closed) == ConnState::Closed {
            return;
        }
        self.core.close(&self.lp);
        log::debug!("tcp connection {} from {} closed", self.id, self.peer.get());

        let this = self.handle();
        let server = self.server.clone();
        self.lp.post(move |_| {
            (this.inner.callbacks.on_close)(&this, result);
            this.inner.user_data.clear();
            if let Some(server) = server.upgrade() {
                server.forget_client(this.id());
            }
        });
    }

    fn maybe_finish_shutdown(self: &Rc<Self>) {
        if self.state.get() == ConnState::ShuttingDown && self.core.pending_writes() == 0 {
            self.core.half_close();
            self.close_with(Ok(()));
        }
    }

    fn read(self: &Rc<Self>) {
        let this = self.handle();
        let callbacks = Rc::clone(&self.callbacks);
        let status = self.core.read_available(&mut |chunk| (callbacks.on_data)(&this, chunk));
        match status {
            ReadStatus::Eof => self.close_with(Ok(())),
            ReadStatus::Failed(e) => self.close_with(Err(e)),
            ReadStatus::WouldBlock | ReadStatus::Stopped => {}
        }
    }
}

impl EventHandler for ConnInner {
    fn handle_event(self: Rc<Self>, lp: &EventLoop, ready: Readiness) {
        if self.state.get() == ConnState::Closed {
            return;
        }
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
}

impl Transport for TcpConnectedClient {
    fn send_bytes(&self, data: Bytes, cb: SendCompletion) {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return complete_later(&inner.lp, cb, Err(Error::canceled()));
        }
        match inner.state.get() {
            ConnState::Open => {
                if let Err(e) = inner.core.enqueue(&inner.lp, data, cb) {
                    inner.close_with(Err(e));
                }
            }
            ConnState::ShuttingDown => complete_later(
                &inner.lp,
                cb,
                Err(Error::new(StatusCode::CannotSendAfterTransportEndpointShutdown)),
            ),
            ConnState::Closed => complete_later(&inner.lp, cb, Err(Error::new(StatusCode::SocketIsNotConnected))),
        }
    }

    fn is_open(&self) -> bool {
        TcpConnectedClient::is_open(self)
    }

    fn endpoint(&self) -> Endpoint {
        TcpConnectedClient::endpoint(self)
    }

    fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }
}

impl Removable for TcpConnectedClient {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        inner.close_with(Ok(()));
        let inner = Rc::clone(inner);
        self.inner.lp.post(move |_| inner.removal.finish());
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

impl PartialEq for TcpConnectedClient {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for TcpConnectedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnectedClient")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.peer.get())
            .field("state", &self.inner.state.get())
            .finish()
    }
}
