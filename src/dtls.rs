//! DTLS client and server over the UDP transports
//!
//! The session runs over a datagram bridge, so record boundaries follow
//! datagram boundaries. Server-side sessions are keyed by the [`UdpPeer`]
//! that carries them; an inactive peer evicted by the UDP server closes its
//! session with `ConnectionTimedOut`.
//!
//! Lost handshake datagrams are not retransmitted.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;

use crate::data_chunk::DataChunk;
use crate::endpoint::Endpoint;
use crate::error::{Error, StatusCode};
use crate::event_loop::EventLoop;
use crate::removable::{Removable, RemovalPhase, RemovalState};
use crate::secure::{DtlsVersion, DtlsVersionRange, Role, SecureChannel, SecureContext, SecureMode, SessionOutput};
use crate::transport::{complete_later, SendCompletion, Transport};
use crate::udp::UdpClient;
use crate::udp_server::{UdpPeer, UdpServer};
use crate::user_data::UserData;

fn check_context(ctx: &SecureContext, role: Role) -> Result<(), Error> {
    if ctx.mode() != SecureMode::Dtls || ctx.role() != role {
        return Err(Error::with_message(StatusCode::InvalidArgument, "context does not match a dtls endpoint of this role"));
    }
    Ok(())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Handshaking,
    Established,
    Closed,
}

type ConnectCallback = Box<dyn FnOnce(&DtlsClient, Result<(), Error>)>;
type DataCallback = Rc<dyn Fn(&DtlsClient, DataChunk)>;
type CloseCallback = Box<dyn FnOnce(&DtlsClient, Result<(), Error>)>;

struct ClientInner {
    lp: EventLoop,
    ctx: RefCell<SecureContext>,
    udp: UdpClient,
    phase: Cell<Phase>,
    channel: RefCell<Option<Rc<SecureChannel<UdpClient>>>>,
    on_connect: RefCell<Option<ConnectCallback>>,
    on_data: RefCell<Option<DataCallback>>,
    on_close: RefCell<Option<CloseCallback>>,
    removal: RemovalState,
    user_data: UserData,
}

/// DTLS session with one server
#[derive(Clone)]
pub struct DtlsClient {
    inner: Rc<ClientInner>,
}

impl DtlsClient {
    pub fn new(lp: &EventLoop, range: DtlsVersionRange, verify_peer: bool) -> Result<Self, Error> {
        let ctx = SecureContext::dtls_client(lp.config(), range, verify_peer)?;
        Self::with_context(lp, ctx)
    }

    pub fn with_context(lp: &EventLoop, ctx: SecureContext) -> Result<Self, Error> {
        check_context(&ctx, Role::Client)?;
        Ok(Self {
            inner: Rc::new(ClientInner {
                lp: lp.clone(),
                ctx: RefCell::new(ctx),
                udp: UdpClient::new(lp),
                phase: Cell::new(Phase::Idle),
                channel: RefCell::new(None),
                on_connect: RefCell::new(None),
                on_data: RefCell::new(None),
                on_close: RefCell::new(None),
                removal: RemovalState::default(),
                user_data: UserData::default(),
            }),
        })
    }

    /// Sends the first handshake flight to `endpoint`
    ///
    /// `on_connect` fires once with the handshake outcome; `on_close` fires
    /// once for sessions that were established.
    pub fn connect<C, D, X>(&self, endpoint: Endpoint, on_connect: C, on_data: D, on_close: X)
    where
        C: FnOnce(&DtlsClient, Result<(), Error>) + 'static,
        D: Fn(&DtlsClient, DataChunk) + 'static,
        X: FnOnce(&DtlsClient, Result<(), Error>) + 'static,
    {
        let inner = &self.inner;
        let started = inner.start(endpoint);
        let channel = match started {
            Ok(channel) => channel,
            Err(e) => {
                let this = self.clone();
                inner.lp.post(move |_| on_connect(&this, Err(e)));
                return;
            }
        };
        *inner.on_connect.borrow_mut() = Some(Box::new(on_connect));
        *inner.on_data.borrow_mut() = Some(Rc::new(on_data));
        *inner.on_close.borrow_mut() = Some(Box::new(on_close));
        inner.phase.set(Phase::Handshaking);
        log::debug!("dtls client: handshake with {} started", endpoint);
        let out = channel.process(None);
        inner.deliver(out);
    }

    /// Sends close_notify and closes the socket
    pub fn close(&self) {
        self.inner.close_with(Ok(()), true);
    }

    pub fn is_open(&self) -> bool {
        self.inner.phase.get() == Phase::Established
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.udp.destination()
    }

    pub fn bound_port(&self) -> u16 {
        self.inner.udp.bound_port()
    }

    pub fn negotiated_dtls_version(&self) -> Option<DtlsVersion> {
        self.inner.channel().and_then(|c| c.negotiated_dtls_version())
    }

    /// Sets the path MTU used to fragment handshake flights; only before `connect`
    pub fn set_mtu(&self, mtu: u32) -> Result<(), Error> {
        if self.inner.phase.get() != Phase::Idle {
            return Err(Error::with_message(StatusCode::InvalidArgument, "mtu must be set before connecting"));
        }
        let ctx = self.inner.ctx.borrow().with_mtu(mtu)?;
        *self.inner.ctx.borrow_mut() = ctx;
        Ok(())
    }

    pub fn set_user_data<T: 'static>(&self, value: T) {
        self.inner.user_data.set(value);
    }

    pub fn user_data<T: 'static>(&self) -> Option<Rc<T>> {
        self.inner.user_data.get()
    }
}

impl ClientInner {
    fn handle(self: &Rc<Self>) -> DtlsClient {
        DtlsClient { inner: Rc::clone(self) }
    }

    fn channel(&self) -> Option<Rc<SecureChannel<UdpClient>>> {
        self.channel.borrow().clone()
    }

    fn start(self: &Rc<Self>, endpoint: Endpoint) -> Result<Rc<SecureChannel<UdpClient>>, Error> {
        if !self.removal.is_active() {
            return Err(Error::canceled());
        }
        match self.phase.get() {
            Phase::Idle => {}
            Phase::Handshaking => return Err(Error::new(StatusCode::ConnectionAlreadyInProgress)),
            Phase::Established => return Err(Error::new(StatusCode::SocketIsAlreadyConnected)),
            Phase::Closed => return Err(Error::new(StatusCode::BadFileDescriptor)),
        }
        self.udp.set_destination(endpoint)?;
        let channel = Rc::new(SecureChannel::new(self.udp.clone(), &self.ctx.borrow())?);
        let receiver = Rc::clone(self);
        self.udp.start_receive(move |_, chunk, _| receiver.on_udp_data(chunk))?;
        *self.channel.borrow_mut() = Some(Rc::clone(&channel));
        Ok(channel)
    }

    fn on_udp_data(self: &Rc<Self>, chunk: DataChunk) {
        if !matches!(self.phase.get(), Phase::Handshaking | Phase::Established) {
            return;
        }
        if let Some(channel) = self.channel() {
            let out = channel.process(Some(&chunk));
            self.deliver(out);
        }
    }

    fn deliver(self: &Rc<Self>, out: SessionOutput) {
        match out.handshake {
            Some(Ok(())) => {
                self.phase.set(Phase::Established);
                let cb = self.on_connect.borrow_mut().take();
                if let Some(cb) = cb {
                    cb(&self.handle(), Ok(()));
                }
            }
            Some(Err(e)) => return self.close_with(Err(e), false),
            None => {}
        }
        let on_data = self.on_data.borrow().clone();
        if let Some(on_data) = on_data {
            let this = self.handle();
            for plain in out.plaintext {
                if self.phase.get() != Phase::Established {
                    break;
                }
                on_data(&this, DataChunk::new(plain));
            }
        }
        if let Some(closed) = out.closed {
            self.close_with(closed, false);
        }
    }

    /// Ends the session; `notify` sends close_notify first
    fn close_with(self: &Rc<Self>, result: Result<(), Error>, notify: bool) {
        let prev = self.phase.replace(Phase::Closed);
        if matches!(prev, Phase::Idle | Phase::Closed) {
            return;
        }
        if notify && prev == Phase::Established {
            if let Some(channel) = self.channel() {
                channel.shutdown();
            }
        }
        self.udp.close();
        self.on_data.borrow_mut().take();

        let this = self.handle();
        if prev == Phase::Handshaking {
            self.on_close.borrow_mut().take();
            let cb = self.on_connect.borrow_mut().take();
            if let Some(cb) = cb {
                let result = result.and(Err(Error::canceled()));
                self.lp.post(move |_| cb(&this, result));
            }
        } else {
            log::debug!("dtls session with {} closed", self.udp.destination());
            let cb = self.on_close.borrow_mut().take();
            if let Some(cb) = cb {
                self.lp.post(move |_| cb(&this, result));
            }
        }
    }
}

impl Transport for DtlsClient {
    fn send_bytes(&self, data: Bytes, cb: SendCompletion) {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return complete_later(&inner.lp, cb, Err(Error::canceled()));
        }
        match inner.channel() {
            Some(channel) if inner.phase.get() == Phase::Established => channel.send(&data, cb),
            _ => complete_later(&inner.lp, cb, Err(Error::new(StatusCode::SocketIsNotConnected))),
        }
    }

    fn is_open(&self) -> bool {
        DtlsClient::is_open(self)
    }

    fn endpoint(&self) -> Endpoint {
        DtlsClient::endpoint(self)
    }

    fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }
}

impl Removable for DtlsClient {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        log::debug!("dtls client {} removal scheduled", inner.udp.destination());
        inner.close_with(Ok(()), true);
        let done = Rc::clone(inner);
        inner.udp.set_on_schedule_removal(move || {
            done.on_connect.borrow_mut().take();
            done.on_close.borrow_mut().take();
            done.channel.borrow_mut().take();
            done.user_data.clear();
            done.removal.finish();
        });
        inner.udp.schedule_removal();
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

impl std::fmt::Debug for DtlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsClient")
            .field("endpoint", &self.endpoint())
            .field("phase", &self.inner.phase.get())
            .finish()
    }
}

struct ServerCallbacks {
    on_new_connection: Box<dyn Fn(&DtlsConnectedClient, Result<(), Error>)>,
    on_data: Box<dyn Fn(&DtlsConnectedClient, DataChunk)>,
    on_close: Box<dyn Fn(&DtlsConnectedClient, Result<(), Error>)>,
}

struct ServerInner {
    lp: EventLoop,
    ctx: RefCell<SecureContext>,
    udp: UdpServer,
    clients: RefCell<HashMap<Endpoint, DtlsConnectedClient>>,
    callbacks: RefCell<Option<Rc<ServerCallbacks>>>,
    removal: RemovalState,
}

/// DTLS server running one session per UDP peer
#[derive(Clone)]
pub struct DtlsServer {
    inner: Rc<ServerInner>,
}

impl DtlsServer {
    pub fn new(lp: &EventLoop, cert: &Path, key: &Path, range: DtlsVersionRange) -> Result<Self, Error> {
        let ctx = SecureContext::dtls_server(lp.config(), cert, key, range)?;
        Self::with_context(lp, ctx)
    }

    pub fn with_context(lp: &EventLoop, ctx: SecureContext) -> Result<Self, Error> {
        check_context(&ctx, Role::Server)?;
        Ok(Self {
            inner: Rc::new(ServerInner {
                lp: lp.clone(),
                ctx: RefCell::new(ctx),
                udp: UdpServer::new(lp),
                clients: RefCell::new(HashMap::new()),
                callbacks: RefCell::new(None),
                removal: RemovalState::default(),
            }),
        })
    }

    /// Binds to `endpoint`; peers quiet for `peer_timeout` are dropped
    ///
    /// `on_new_connection` fires once per session with the handshake outcome.
    pub fn listen<N, D, C>(&self, endpoint: Endpoint, on_new_connection: N, on_data: D, on_close: C, peer_timeout: Duration) -> Result<(), Error>
    where
        N: Fn(&DtlsConnectedClient, Result<(), Error>) + 'static,
        D: Fn(&DtlsConnectedClient, DataChunk) + 'static,
        C: Fn(&DtlsConnectedClient, Result<(), Error>) + 'static,
    {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return Err(Error::canceled());
        }
        *inner.callbacks.borrow_mut() = Some(Rc::new(ServerCallbacks {
            on_new_connection: Box::new(on_new_connection),
            on_data: Box::new(on_data),
            on_close: Box::new(on_close),
        }));
        let created: Weak<ServerInner> = Rc::downgrade(inner);
        let received: Weak<ServerInner> = Rc::downgrade(inner);
        let expired: Weak<ServerInner> = Rc::downgrade(inner);
        let started = inner.udp.start_receive_with_timeout(
            endpoint,
            Some(move |peer: &UdpPeer| {
                if let Some(server) = created.upgrade() {
                    server.on_new_peer(peer);
                }
            }),
            move |peer: &UdpPeer, chunk: DataChunk| {
                if let Some(client) = received.upgrade().and_then(|s| s.client_for(peer)) {
                    client.inner.on_peer_data(chunk);
                }
            },
            peer_timeout,
            move |peer: &UdpPeer| {
                if let Some(client) = expired.upgrade().and_then(|s| s.client_for(peer)) {
                    client.inner.close_with(Err(Error::new(StatusCode::ConnectionTimedOut)), false);
                }
            },
        );
        if let Err(e) = started {
            inner.callbacks.borrow_mut().take();
            return Err(e);
        }
        log::debug!("dtls server listening on port {}", inner.udp.bound_port());
        Ok(())
    }

    /// Sets the path MTU used by sessions created afterwards
    pub fn set_mtu(&self, mtu: u32) -> Result<(), Error> {
        let ctx = self.inner.ctx.borrow().with_mtu(mtu)?;
        *self.inner.ctx.borrow_mut() = ctx;
        Ok(())
    }

    /// Closes every session and the socket
    pub fn close(&self) {
        let clients: Vec<DtlsConnectedClient> = self.inner.clients.borrow().values().cloned().collect();
        for client in clients {
            client.inner.close_with(Ok(()), true);
        }
        self.inner.udp.close();
    }

    pub fn connected_clients_count(&self) -> usize {
        self.inner.clients.borrow().len()
    }

    pub fn bound_port(&self) -> u16 {
        self.inner.udp.bound_port()
    }

    pub fn is_open(&self) -> bool {
        self.inner.udp.is_open()
    }
}

impl ServerInner {
    fn client_for(&self, peer: &UdpPeer) -> Option<DtlsConnectedClient> {
        self.clients.borrow().get(&peer.endpoint()).filter(|c| c.inner.peer == *peer).cloned()
    }

    fn on_new_peer(self: &Rc<Self>, peer: &UdpPeer) {
        let Some(callbacks) = self.callbacks.borrow().clone() else { return };
        let channel = match SecureChannel::new(peer.clone(), &self.ctx.borrow()) {
            Ok(channel) => channel,
            Err(e) => {
                log::error!("dtls server: cannot create session for {}: {}", peer.endpoint(), e);
                return peer.close(self.lp.config().udp_peer_close_inactivity);
            }
        };
        let client = DtlsConnectedClient {
            inner: Rc::new(ConnInner {
                lp: self.lp.clone(),
                peer: peer.clone(),
                channel,
                phase: Cell::new(Phase::Handshaking),
                server: Rc::downgrade(self),
                callbacks,
                removal: RemovalState::default(),
                user_data: UserData::default(),
            }),
        };
        self.clients.borrow_mut().insert(peer.endpoint(), client);
    }

    fn forget(&self, client: &DtlsConnectedClient) {
        let mut clients = self.clients.borrow_mut();
        if clients.get(&client.endpoint()) == Some(client) {
            clients.remove(&client.endpoint());
        }
    }
}

impl Removable for DtlsServer {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        log::debug!("dtls server on port {} removal scheduled", inner.udp.bound_port());
        self.close();
        let done = Rc::clone(inner);
        inner.udp.set_on_schedule_removal(move || {
            done.callbacks.borrow_mut().take();
            done.clients.borrow_mut().clear();
            done.removal.finish();
        });
        inner.udp.schedule_removal();
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

struct ConnInner {
    lp: EventLoop,
    peer: UdpPeer,
    channel: SecureChannel<UdpPeer>,
    phase: Cell<Phase>,
    server: Weak<ServerInner>,
    callbacks: Rc<ServerCallbacks>,
    removal: RemovalState,
    user_data: UserData,
}

/// One DTLS session accepted by a [`DtlsServer`]
#[derive(Clone)]
pub struct DtlsConnectedClient {
    inner: Rc<ConnInner>,
}

impl DtlsConnectedClient {
    pub fn endpoint(&self) -> Endpoint {
        self.inner.peer.endpoint()
    }

    pub fn is_open(&self) -> bool {
        self.inner.phase.get() == Phase::Established
    }

    /// Sends close_notify and ignores the peer's endpoint for a while
    pub fn close(&self) {
        self.inner.close_with(Ok(()), true);
    }

    pub fn negotiated_dtls_version(&self) -> Option<DtlsVersion> {
        self.inner.channel.negotiated_dtls_version()
    }

    pub fn server(&self) -> Option<DtlsServer> {
        self.inner.server.upgrade().map(|inner| DtlsServer { inner })
    }

    pub fn set_user_data<T: 'static>(&self, value: T) {
        self.inner.user_data.set(value);
    }

    pub fn user_data<T: 'static>(&self) -> Option<Rc<T>> {
        self.inner.user_data.get()
    }
}

impl ConnInner {
    fn handle(self: &Rc<Self>) -> DtlsConnectedClient {
        DtlsConnectedClient { inner: Rc::clone(self) }
    }

    fn on_peer_data(self: &Rc<Self>, chunk: DataChunk) {
        if !matches!(self.phase.get(), Phase::Handshaking | Phase::Established) {
            return;
        }
        let out = self.channel.process(Some(&chunk));
        let this = self.handle();
        match out.handshake {
            Some(Ok(())) => {
                self.phase.set(Phase::Established);
                log::debug!("dtls server: handshake with {} complete", self.peer.endpoint());
                (self.callbacks.on_new_connection)(&this, Ok(()));
            }
            Some(Err(e)) => return self.close_with(Err(e), false),
            None => {}
        }
        for plain in out.plaintext {
            if self.phase.get() != Phase::Established {
                break;
            }
            (self.callbacks.on_data)(&this, DataChunk::new(plain));
        }
        if let Some(closed) = out.closed {
            self.close_with(closed, false);
        }
    }

    fn close_with(self: &Rc<Self>, result: Result<(), Error>, notify: bool) {
        let prev = self.phase.replace(Phase::Closed);
        if prev == Phase::Closed {
            return;
        }
        if notify && prev == Phase::Established {
            self.channel.shutdown();
        }
        self.peer.close(self.lp.config().udp_peer_close_inactivity);
        let this = self.handle();
        if let Some(server) = self.server.upgrade() {
            server.forget(&this);
        }
        let callbacks = Rc::clone(&self.callbacks);
        if prev == Phase::Established {
            log::debug!("dtls session with {} closed", self.peer.endpoint());
            self.lp.post(move |_| (callbacks.on_close)(&this, result));
        } else {
            let result = result.and(Err(Error::canceled()));
            self.lp.post(move |_| (callbacks.on_new_connection)(&this, result));
        }
    }
}

impl Transport for DtlsConnectedClient {
    fn send_bytes(&self, data: Bytes, cb: SendCompletion) {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return complete_later(&inner.lp, cb, Err(Error::canceled()));
        }
        if inner.phase.get() != Phase::Established {
            return complete_later(&inner.lp, cb, Err(Error::new(StatusCode::SocketIsNotConnected)));
        }
        inner.channel.send(&data, cb);
    }

    fn is_open(&self) -> bool {
        DtlsConnectedClient::is_open(self)
    }

    fn endpoint(&self) -> Endpoint {
        DtlsConnectedClient::endpoint(self)
    }

    fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }
}

impl Removable for DtlsConnectedClient {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        inner.close_with(Ok(()), true);
        let done = Rc::clone(inner);
        inner.peer.set_on_schedule_removal(move || {
            done.user_data.clear();
            done.removal.finish();
        });
        inner.peer.schedule_removal();
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

impl PartialEq for DtlsConnectedClient {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for DtlsConnectedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsConnectedClient")
            .field("endpoint", &self.endpoint())
            .field("phase", &self.inner.phase.get())
            .finish()
    }
}
