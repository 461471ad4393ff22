//! TLS client and server over the TCP transports
//!
//! Each TLS object owns its TCP counterpart and a [`SecureChannel`]. Bytes
//! read from the socket are fed to the session; the handshake outcome is
//! reported before any decrypted data, and a failed handshake is reported
//! through the connect callback only. Application data is refused until the
//! handshake has completed.
//!
//! Removal is delegated: removing a TLS object schedules removal of its TCP
//! transport, whose removal observer completes the TLS object's removal.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::data_chunk::DataChunk;
use crate::endpoint::Endpoint;
use crate::error::{Error, StatusCode};
use crate::event_loop::EventLoop;
use crate::removable::{Removable, RemovalPhase, RemovalState};
use crate::secure::{Role, SecureChannel, SecureContext, SecureMode, SessionOutput, TlsVersion, TlsVersionRange};
use crate::tcp::TcpClient;
use crate::tcp_server::{TcpConnectedClient, TcpServer};
use crate::transport::{complete_later, SendCompletion, Transport};
use crate::user_data::UserData;

fn check_context(ctx: &SecureContext, role: Role) -> Result<(), Error> {
    if ctx.mode() != SecureMode::Tls || ctx.role() != role {
        return Err(Error::with_message(StatusCode::InvalidArgument, "context does not match a tls endpoint of this role"));
    }
    Ok(())
}

type ConnectCallback = Box<dyn FnOnce(&TlsClient, Result<(), Error>)>;
type DataCallback = Rc<dyn Fn(&TlsClient, DataChunk)>;
type CloseCallback = Box<dyn FnOnce(&TlsClient, Result<(), Error>)>;

struct ClientInner {
    lp: EventLoop,
    ctx: SecureContext,
    tcp: TcpClient,
    channel: RefCell<Option<Rc<SecureChannel<TcpClient>>>>,
    on_connect: RefCell<Option<ConnectCallback>>,
    on_data: RefCell<Option<DataCallback>>,
    on_close: RefCell<Option<CloseCallback>>,
    removal: RemovalState,
    user_data: UserData,
}

/// Outgoing TLS connection
#[derive(Clone)]
pub struct TlsClient {
    inner: Rc<ClientInner>,
}

impl TlsClient {
    /// Client accepting `range`; `verify_peer` checks the server certificate
    pub fn new(lp: &EventLoop, range: TlsVersionRange, verify_peer: bool) -> Result<Self, Error> {
        let ctx = SecureContext::tls_client(lp.config(), range, verify_peer)?;
        Self::with_context(lp, ctx)
    }

    pub fn with_context(lp: &EventLoop, ctx: SecureContext) -> Result<Self, Error> {
        check_context(&ctx, Role::Client)?;
        Ok(Self {
            inner: Rc::new(ClientInner {
                lp: lp.clone(),
                ctx,
                tcp: TcpClient::new(lp),
                channel: RefCell::new(None),
                on_connect: RefCell::new(None),
                on_data: RefCell::new(None),
                on_close: RefCell::new(None),
                removal: RemovalState::default(),
                user_data: UserData::default(),
            }),
        })
    }

    /// Connects and runs the handshake
    ///
    /// `on_connect` fires once: `Ok` after the handshake completed, or the
    /// connect or handshake error. `on_close` fires only for connections that
    /// completed the handshake.
    pub fn connect<C, D, X>(&self, endpoint: Endpoint, on_connect: C, on_data: D, on_close: X)
    where
        C: FnOnce(&TlsClient, Result<(), Error>) + 'static,
        D: Fn(&TlsClient, DataChunk) + 'static,
        X: FnOnce(&TlsClient, Result<(), Error>) + 'static,
    {
        let inner = &self.inner;
        let refusal = if !inner.removal.is_active() {
            Some(Error::canceled())
        } else if inner.on_connect.borrow().is_some() {
            Some(Error::new(StatusCode::ConnectionAlreadyInProgress))
        } else if inner.tcp.is_open() {
            Some(Error::new(StatusCode::SocketIsAlreadyConnected))
        } else {
            None
        };
        let channel = match refusal {
            Some(e) => Err(e),
            None => SecureChannel::new(inner.tcp.clone(), &inner.ctx),
        };
        let channel = match channel {
            Ok(channel) => Rc::new(channel),
            Err(e) => {
                let this = self.clone();
                inner.lp.post(move |_| on_connect(&this, Err(e)));
                return;
            }
        };

        *inner.channel.borrow_mut() = Some(channel);
        *inner.on_connect.borrow_mut() = Some(Box::new(on_connect));
        *inner.on_data.borrow_mut() = Some(Rc::new(on_data));
        *inner.on_close.borrow_mut() = Some(Box::new(on_close));

        let connected = Rc::clone(inner);
        let received = Rc::clone(inner);
        let closed = Rc::clone(inner);
        inner.tcp.connect(
            endpoint,
            move |_, result| connected.on_tcp_connect(result),
            move |_, chunk| received.on_tcp_data(chunk),
            move |_, result| closed.on_tcp_close(result),
        );
    }

    /// Sends close_notify, finishes queued writes, then closes
    pub fn shutdown(&self) {
        if let Some(channel) = self.inner.channel() {
            channel.shutdown();
        }
        self.inner.tcp.shutdown();
    }

    /// Aborts the connection
    pub fn close(&self) {
        self.inner.tcp.close();
    }

    /// True once the handshake completed and until the connection closes
    pub fn is_open(&self) -> bool {
        self.inner.tcp.is_open() && self.inner.channel().is_some_and(|c| c.is_established())
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.tcp.endpoint()
    }

    pub fn pending_write_requests(&self) -> usize {
        self.inner.tcp.pending_write_requests()
    }

    pub fn negotiated_tls_version(&self) -> Option<TlsVersion> {
        self.inner.channel().and_then(|c| c.negotiated_tls_version())
    }

    pub fn set_user_data<T: 'static>(&self, value: T) {
        self.inner.user_data.set(value);
    }

    pub fn user_data<T: 'static>(&self) -> Option<Rc<T>> {
        self.inner.user_data.get()
    }
}

impl ClientInner {
    fn handle(self: &Rc<Self>) -> TlsClient {
        TlsClient { inner: Rc::clone(self) }
    }

    fn channel(&self) -> Option<Rc<SecureChannel<TcpClient>>> {
        self.channel.borrow().clone()
    }

    fn on_tcp_connect(self: &Rc<Self>, result: Result<(), Error>) {
        match result {
            Ok(()) => {
                log::debug!("tls client: tcp connected to {}, starting handshake", self.tcp.endpoint());
                if let Some(channel) = self.channel() {
                    let out = channel.process(None);
                    self.deliver(out);
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_tcp_data(self: &Rc<Self>, chunk: DataChunk) {
        if let Some(channel) = self.channel() {
            let out = channel.process(Some(&chunk));
            self.deliver(out);
        }
    }

    fn on_tcp_close(self: &Rc<Self>, result: Result<(), Error>) {
        self.on_data.borrow_mut().take();
        if self.on_connect.borrow().is_some() {
            let err = result.err().unwrap_or_else(|| Error::new(StatusCode::ConnectionResetByPeer));
            return self.fail(err);
        }
        let cb = self.on_close.borrow_mut().take();
        if let Some(cb) = cb {
            cb(&self.handle(), result);
        }
    }

    /// Reports a connect or handshake failure and drops the connection
    fn fail(self: &Rc<Self>, e: Error) {
        self.on_close.borrow_mut().take();
        self.on_data.borrow_mut().take();
        let cb = self.on_connect.borrow_mut().take();
        self.tcp.close();
        if let Some(cb) = cb {
            cb(&self.handle(), Err(e));
        }
    }

    fn deliver(self: &Rc<Self>, out: SessionOutput) {
        match out.handshake {
            Some(Ok(())) => {
                let cb = self.on_connect.borrow_mut().take();
                if let Some(cb) = cb {
                    cb(&self.handle(), Ok(()));
                }
            }
            Some(Err(e)) => return self.fail(e),
            None => {}
        }
        let on_data = self.on_data.borrow().clone();
        if let Some(on_data) = on_data {
            let this = self.handle();
            for plain in out.plaintext {
                if !self.tcp.is_open() {
                    break;
                }
                on_data(&this, DataChunk::new(plain));
            }
        }
        if let Some(closed) = out.closed {
            match closed {
                Ok(()) => self.tcp.shutdown(),
                Err(e) => {
                    log::warn!("tls client to {}: {}", self.tcp.endpoint(), e);
                    self.tcp.close();
                }
            }
        }
    }
}

impl Transport for TlsClient {
    fn send_bytes(&self, data: Bytes, cb: SendCompletion) {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return complete_later(&inner.lp, cb, Err(Error::canceled()));
        }
        match inner.channel() {
            Some(channel) if inner.tcp.is_open() => channel.send(&data, cb),
            _ => complete_later(&inner.lp, cb, Err(Error::new(StatusCode::SocketIsNotConnected))),
        }
    }

    fn is_open(&self) -> bool {
        TlsClient::is_open(self)
    }

    fn endpoint(&self) -> Endpoint {
        TlsClient::endpoint(self)
    }

    fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }
}

impl Removable for TlsClient {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        log::debug!("tls client {} removal scheduled", inner.tcp.endpoint());
        let done = Rc::clone(inner);
        inner.tcp.set_on_schedule_removal(move || {
            done.on_connect.borrow_mut().take();
            done.on_close.borrow_mut().take();
            done.channel.borrow_mut().take();
            done.user_data.clear();
            done.removal.finish();
        });
        inner.tcp.schedule_removal();
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient").field("endpoint", &self.endpoint()).field("open", &self.is_open()).finish()
    }
}

struct ServerCallbacks {
    on_new_connection: Box<dyn Fn(&TlsConnectedClient, Result<(), Error>)>,
    on_data: Box<dyn Fn(&TlsConnectedClient, DataChunk)>,
    on_close: Box<dyn Fn(&TlsConnectedClient, Result<(), Error>)>,
}

struct ServerInner {
    lp: EventLoop,
    ctx: SecureContext,
    tcp: TcpServer,
    clients: RefCell<HashMap<u64, TlsConnectedClient>>,
    callbacks: RefCell<Option<Rc<ServerCallbacks>>>,
    removal: RemovalState,
}

/// TLS listener; connections are reported once their handshake finished
#[derive(Clone)]
pub struct TlsServer {
    inner: Rc<ServerInner>,
}

impl TlsServer {
    /// Server presenting the PEM certificate chain and key at the given paths
    pub fn new(lp: &EventLoop, cert: &Path, key: &Path, range: TlsVersionRange) -> Result<Self, Error> {
        let ctx = SecureContext::tls_server(lp.config(), cert, key, range)?;
        Self::with_context(lp, ctx)
    }

    pub fn with_context(lp: &EventLoop, ctx: SecureContext) -> Result<Self, Error> {
        check_context(&ctx, Role::Server)?;
        Ok(Self {
            inner: Rc::new(ServerInner {
                lp: lp.clone(),
                ctx,
                tcp: TcpServer::new(lp),
                clients: RefCell::new(HashMap::new()),
                callbacks: RefCell::new(None),
                removal: RemovalState::default(),
            }),
        })
    }

    /// Starts accepting connections
    ///
    /// `on_new_connection` fires once per connection with the handshake
    /// outcome. `on_data` and `on_close` only ever see connections whose
    /// handshake succeeded.
    pub fn listen<N, D, C>(&self, endpoint: Endpoint, on_new_connection: N, on_data: D, on_close: C, backlog: i32) -> Result<(), Error>
    where
        N: Fn(&TlsConnectedClient, Result<(), Error>) + 'static,
        D: Fn(&TlsConnectedClient, DataChunk) + 'static,
        C: Fn(&TlsConnectedClient, Result<(), Error>) + 'static,
    {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return Err(Error::canceled());
        }
        let accepted: Weak<ServerInner> = Rc::downgrade(inner);
        let received: Weak<ServerInner> = Rc::downgrade(inner);
        let closed: Weak<ServerInner> = Rc::downgrade(inner);
        inner.tcp.listen(
            endpoint,
            move |tcp, result| {
                if let Some(server) = accepted.upgrade() {
                    server.on_accept(tcp, result);
                }
            },
            move |tcp, chunk| {
                let client = received.upgrade().and_then(|s| s.clients.borrow().get(&tcp.id()).cloned());
                if let Some(client) = client {
                    client.inner.on_tcp_data(chunk);
                }
            },
            move |tcp, result| {
                let client = closed.upgrade().and_then(|s| s.clients.borrow_mut().remove(&tcp.id()));
                if let Some(client) = client {
                    client.inner.on_tcp_close(result);
                }
            },
            backlog,
        )?;
        *inner.callbacks.borrow_mut() = Some(Rc::new(ServerCallbacks {
            on_new_connection: Box::new(on_new_connection),
            on_data: Box::new(on_data),
            on_close: Box::new(on_close),
        }));
        log::debug!("tls server listening on {}", inner.tcp.endpoint());
        Ok(())
    }

    /// Sends close_notify to every client and shuts the TCP server down; `cb` fires once
    pub fn shutdown<F: FnOnce(&TlsServer) + 'static>(&self, cb: F) {
        let clients: Vec<TlsConnectedClient> = self.inner.clients.borrow().values().cloned().collect();
        for client in clients {
            if let Some(channel) = client.inner.channel.as_ref() {
                channel.shutdown();
            }
        }
        let this = self.clone();
        self.inner.tcp.shutdown(move |_| cb(&this));
    }

    /// Aborts every connection and closes the listener; `cb` fires once
    pub fn close<F: FnOnce(&TlsServer) + 'static>(&self, cb: F) {
        let this = self.clone();
        self.inner.tcp.close(move |_| cb(&this));
    }

    /// Connections whose handshake completed and that are still open
    pub fn connected_clients_count(&self) -> usize {
        self.inner.clients.borrow().values().filter(|c| c.inner.phase.get() == ConnPhase::Established).count()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.tcp.endpoint()
    }

    pub fn is_open(&self) -> bool {
        self.inner.tcp.is_open()
    }
}

impl ServerInner {
    fn on_accept(self: &Rc<Self>, tcp: &TcpConnectedClient, result: Result<(), Error>) {
        if let Err(e) = result {
            log::debug!("tls server: accept failed: {}", e);
            return;
        }
        let Some(callbacks) = self.callbacks.borrow().clone() else {
            return tcp.close();
        };
        let channel = match SecureChannel::new(tcp.clone(), &self.ctx) {
            Ok(channel) => channel,
            Err(e) => {
                log::error!("tls server: cannot create session: {}", e);
                return tcp.close();
            }
        };
        let client = TlsConnectedClient {
            inner: Rc::new(ConnInner {
                lp: self.lp.clone(),
                tcp: tcp.clone(),
                channel: Some(channel),
                phase: Cell::new(ConnPhase::Handshaking),
                server: Rc::downgrade(self),
                callbacks,
                removal: RemovalState::default(),
                user_data: UserData::default(),
            }),
        };
        self.clients.borrow_mut().insert(tcp.id(), client);
    }
}

impl Removable for TlsServer {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        log::debug!("tls server on {} removal scheduled", inner.tcp.endpoint());
        let done = Rc::clone(inner);
        inner.tcp.set_on_schedule_removal(move || {
            done.callbacks.borrow_mut().take();
            done.clients.borrow_mut().clear();
            done.removal.finish();
        });
        inner.tcp.schedule_removal();
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

impl std::fmt::Debug for TlsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServer")
            .field("endpoint", &self.endpoint())
            .field("clients", &self.connected_clients_count())
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnPhase {
    Handshaking,
    Established,
    Failed,
    Closed,
}

struct ConnInner {
    lp: EventLoop,
    tcp: TcpConnectedClient,
    channel: Option<SecureChannel<TcpConnectedClient>>,
    phase: Cell<ConnPhase>,
    server: Weak<ServerInner>,
    callbacks: Rc<ServerCallbacks>,
    removal: RemovalState,
    user_data: UserData,
}

/// One TLS connection accepted by a [`TlsServer`]
#[derive(Clone)]
pub struct TlsConnectedClient {
    inner: Rc<ConnInner>,
}

impl TlsConnectedClient {
    pub fn id(&self) -> u64 {
        self.inner.tcp.id()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.tcp.endpoint()
    }

    pub fn is_open(&self) -> bool {
        self.inner.phase.get() == ConnPhase::Established && self.inner.tcp.is_open()
    }

    /// Aborts the connection
    pub fn close(&self) {
        self.inner.tcp.close();
    }

    /// Sends close_notify, finishes queued writes, then closes
    pub fn shutdown(&self) {
        if let Some(channel) = self.inner.channel.as_ref() {
            channel.shutdown();
        }
        self.inner.tcp.shutdown();
    }

    pub fn pending_write_requests(&self) -> usize {
        self.inner.tcp.pending_write_requests()
    }

    pub fn negotiated_tls_version(&self) -> Option<TlsVersion> {
        self.inner.channel.as_ref().and_then(|c| c.negotiated_tls_version())
    }

    pub fn server(&self) -> Option<TlsServer> {
        self.inner.server.upgrade().map(|inner| TlsServer { inner })
    }

    pub fn set_user_data<T: 'static>(&self, value: T) {
        self.inner.user_data.set(value);
    }

    pub fn user_data<T: 'static>(&self) -> Option<Rc<T>> {
        self.inner.user_data.get()
    }
}

impl ConnInner {
    fn handle(self: &Rc<Self>) -> TlsConnectedClient {
        TlsConnectedClient { inner: Rc::clone(self) }
    }

    fn on_tcp_data(self: &Rc<Self>, chunk: DataChunk) {
        let Some(channel) = self.channel.as_ref() else { return };
        if matches!(self.phase.get(), ConnPhase::Failed | ConnPhase::Closed) {
            return;
        }
        let out = channel.process(Some(&chunk));
        let this = self.handle();

        match out.handshake {
            Some(Ok(())) => {
                self.phase.set(ConnPhase::Established);
                log::debug!("tls server: handshake with {} complete", self.tcp.endpoint());
                (self.callbacks.on_new_connection)(&this, Ok(()));
            }
            Some(Err(e)) => {
                self.phase.set(ConnPhase::Failed);
                (self.callbacks.on_new_connection)(&this, Err(e));
                return self.tcp.close();
            }
            None => {}
        }
        for plain in out.plaintext {
            if !this.is_open() {
                break;
            }
            (self.callbacks.on_data)(&this, DataChunk::new(plain));
        }
        match out.closed {
            Some(Ok(())) => self.tcp.shutdown(),
            Some(Err(e)) => {
                log::warn!("tls connection from {}: {}", self.tcp.endpoint(), e);
                self.tcp.close();
            }
            None => {}
        }
    }

    fn on_tcp_close(self: &Rc<Self>, result: Result<(), Error>) {
        let this = self.handle();
        match self.phase.replace(ConnPhase::Closed) {
            ConnPhase::Established => (self.callbacks.on_close)(&this, result),
            ConnPhase::Handshaking => {
                let err = result.err().unwrap_or_else(|| Error::new(StatusCode::ConnectionResetByPeer));
                (self.callbacks.on_new_connection)(&this, Err(err));
            }
            ConnPhase::Failed | ConnPhase::Closed => {}
        }
        self.user_data.clear();
    }
}

impl Transport for TlsConnectedClient {
    fn send_bytes(&self, data: Bytes, cb: SendCompletion) {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return complete_later(&inner.lp, cb, Err(Error::canceled()));
        }
        match inner.channel.as_ref() {
            Some(channel) if self.is_open() => channel.send(&data, cb),
            _ => complete_later(&inner.lp, cb, Err(Error::new(StatusCode::SocketIsNotConnected))),
        }
    }

    fn is_open(&self) -> bool {
        TlsConnectedClient::is_open(self)
    }

    fn endpoint(&self) -> Endpoint {
        TlsConnectedClient::endpoint(self)
    }

    fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }
}

impl Removable for TlsConnectedClient {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        let done = Rc::clone(inner);
        inner.tcp.set_on_schedule_removal(move || done.removal.finish());
        inner.tcp.schedule_removal();
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

impl PartialEq for TlsConnectedClient {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for TlsConnectedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnectedClient")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint())
            .field("phase", &self.inner.phase.get())
            .finish()
    }
}
