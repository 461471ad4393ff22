//! UDP server with per-sender peers
//!
//! Every remote endpoint that sends a datagram gets a [`UdpPeer`], created on
//! its first datagram and kept in the server's table. With a timeout, one
//! shared [`BacklogWithTimeout`] evicts peers that stayed quiet too long; the
//! next datagram from an evicted endpoint creates a fresh peer.
//!
//! A peer closed by the application is kept as a tombstone: datagrams from
//! its endpoint are dropped until the endpoint has been quiet for the
//! inactivity period given to [`UdpPeer::close`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::backlog::BacklogWithTimeout;
use crate::data_chunk::DataChunk;
use crate::endpoint::Endpoint;
use crate::error::{Error, StatusCode};
use crate::event_loop::{EventHandler, EventLoop, Readiness};
use crate::removable::{Removable, RemovalPhase, RemovalState};
use crate::transport::{complete_later, SendCompletion, Transport};
use crate::udp::DatagramCore;
use crate::user_data::UserData;

type PeerCallback = Rc<dyn Fn(&UdpPeer)>;
type PeerDataCallback = Rc<dyn Fn(&UdpPeer, DataChunk)>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ServerState {
    Idle,
    Receiving,
    Closed,
}

struct Tombstone {
    last_seen: Instant,
    inactivity: Duration,
}

struct ServerInner {
    lp: EventLoop,
    core: DatagramCore,
    state: Cell<ServerState>,
    peers: RefCell<HashMap<Endpoint, UdpPeer>>,
    tombstones: RefCell<HashMap<Endpoint, Tombstone>>,
    on_new_peer: RefCell<Option<PeerCallback>>,
    on_data: RefCell<Option<PeerDataCallback>>,
    on_timeout: RefCell<Option<PeerCallback>>,
    backlog: RefCell<Option<BacklogWithTimeout<Endpoint, UdpPeer>>>,
    removal: RemovalState,
}

/// Datagram server demultiplexing senders into [`UdpPeer`]s
#[derive(Clone)]
pub struct UdpServer {
    inner: Rc<ServerInner>,
}

impl UdpServer {
    pub fn new(lp: &EventLoop) -> Self {
        Self {
            inner: Rc::new(ServerInner {
                lp: lp.clone(),
                core: DatagramCore::new(),
                state: Cell::new(ServerState::Idle),
                peers: RefCell::new(HashMap::new()),
                tombstones: RefCell::new(HashMap::new()),
                on_new_peer: RefCell::new(None),
                on_data: RefCell::new(None),
                on_timeout: RefCell::new(None),
                backlog: RefCell::new(None),
                removal: RemovalState::default(),
            }),
        }
    }

    /// Binds to `endpoint` and delivers every datagram to `on_data`
    pub fn start_receive<D>(&self, endpoint: Endpoint, on_data: D) -> Result<(), Error>
    where
        D: Fn(&UdpPeer, DataChunk) + 'static,
    {
        self.inner.listen(endpoint, None, Rc::new(on_data), None)
    }

    /// Like [`start_receive`](Self::start_receive); `on_new_peer` fires once
    /// per peer, before its first datagram is delivered
    pub fn start_receive_with_new_peer<N, D>(&self, endpoint: Endpoint, on_new_peer: N, on_data: D) -> Result<(), Error>
    where
        N: Fn(&UdpPeer) + 'static,
        D: Fn(&UdpPeer, DataChunk) + 'static,
    {
        self.inner.listen(endpoint, Some(Rc::new(on_new_peer)), Rc::new(on_data), None)
    }

    /// Receives with peer eviction: a peer quiet for `timeout` is closed and
    /// handed to `on_timeout` once
    pub fn start_receive_with_timeout<N, D, T>(
        &self,
        endpoint: Endpoint,
        on_new_peer: Option<N>,
        on_data: D,
        timeout: Duration,
        on_timeout: T,
    ) -> Result<(), Error>
    where
        N: Fn(&UdpPeer) + 'static,
        D: Fn(&UdpPeer, DataChunk) + 'static,
        T: Fn(&UdpPeer) + 'static,
    {
        let on_new_peer = on_new_peer.map(|cb| Rc::new(cb) as PeerCallback);
        self.inner
            .listen(endpoint, on_new_peer, Rc::new(on_data), Some((timeout, Rc::new(on_timeout))))
    }

    /// Closes the socket and every peer
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.get() == ServerState::Receiving
    }

    /// Local port, 0 until bound
    pub fn bound_port(&self) -> u16 {
        self.inner.core.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn peers_count(&self) -> usize {
        self.inner.peers.borrow().len()
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

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }
}

impl ServerInner {
    fn listen(
        self: &Rc<Self>,
        endpoint: Endpoint,
        on_new_peer: Option<PeerCallback>,
        on_data: PeerDataCallback,
        timeout: Option<(Duration, PeerCallback)>,
    ) -> Result<(), Error> {
        if !self.removal.is_active() {
            return Err(Error::canceled());
        }
        if self.state.get() != ServerState::Idle {
            return Err(Error::with_message(StatusCode::InvalidArgument, "server already started"));
        }
        let addr = endpoint.require_socket_addr()?;
        let handler: Rc<dyn EventHandler> = Rc::clone(self) as Rc<dyn EventHandler>;
        self.core.bind(&self.lp, addr, handler)?;

        *self.on_new_peer.borrow_mut() = on_new_peer;
        *self.on_data.borrow_mut() = Some(on_data);
        if let Some((timeout, on_timeout)) = timeout {
            *self.on_timeout.borrow_mut() = Some(on_timeout);
            let weak: Weak<ServerInner> = Rc::downgrade(self);
            let backlog = BacklogWithTimeout::new(
                &self.lp,
                timeout,
                |peer: &UdpPeer| peer.last_packet_time(),
                move |peer: &UdpPeer| {
                    if let Some(server) = weak.upgrade() {
                        server.expire(peer);
                    }
                },
            );
            *self.backlog.borrow_mut() = Some(backlog);
        }
        self.state.set(ServerState::Receiving);
        self.core.set_receiving(&self.lp, true);
        log::debug!("udp server listening on {}", endpoint);
        Ok(())
    }

    /// Looks up the peer for `from`, creating it unless the endpoint is tombstoned
    fn peer_for(self: &Rc<Self>, from: Endpoint, now: Instant) -> Option<(UdpPeer, bool)> {
        if let Some(peer) = self.peers.borrow().get(&from) {
            return Some((peer.clone(), false));
        }
        {
            let mut tombstones = self.tombstones.borrow_mut();
            if let Some(t) = tombstones.get_mut(&from) {
                if now.saturating_duration_since(t.last_seen) < t.inactivity {
                    t.last_seen = now;
                    return None;
                }
                tombstones.remove(&from);
            }
        }
        let peer = UdpPeer::new(self, from, now);
        self.peers.borrow_mut().insert(from, peer.clone());
        if let Some(backlog) = self.backlog.borrow().as_ref() {
            backlog.add_item(from, peer.clone());
        }
        log::debug!("udp server: new peer {}", from);
        Some((peer, true))
    }

    fn deliver(self: &Rc<Self>, chunk: DataChunk, from: Endpoint) {
        let now = self.lp.now();
        let Some((peer, is_new)) = self.peer_for(from, now) else {
            log::trace!("udp server dropped datagram from closed peer {}", from);
            return;
        };
        peer.inner.last_packet_time.set(now);
        if is_new {
            let cb = self.on_new_peer.borrow().clone();
            if let Some(cb) = cb {
                cb(&peer);
            }
        }
        if !peer.is_open() {
            return;
        }
        let cb = self.on_data.borrow().clone();
        if let Some(cb) = cb {
            cb(&peer, chunk);
        }
    }

    /// Forgets `peer` and leaves a tombstone for its endpoint
    fn close_peer(&self, peer: &UdpPeer, inactivity: Duration) {
        self.forget(peer);
        self.tombstones
            .borrow_mut()
            .insert(peer.inner.endpoint, Tombstone { last_seen: self.lp.now(), inactivity });
    }

    /// Drops `peer` from the table and the backlog, which are keyed alike
    fn forget(&self, peer: &UdpPeer) {
        let mut peers = self.peers.borrow_mut();
        if peers.get(&peer.inner.endpoint) != Some(peer) {
            return;
        }
        peers.remove(&peer.inner.endpoint);
        drop(peers);
        if let Some(backlog) = self.backlog.borrow().as_ref() {
            backlog.remove_item(&peer.inner.endpoint);
        }
    }

    fn expire(&self, peer: &UdpPeer) {
        log::debug!("udp peer {} timed out", peer.inner.endpoint);
        {
            let mut peers = self.peers.borrow_mut();
            if peers.get(&peer.inner.endpoint) == Some(peer) {
                peers.remove(&peer.inner.endpoint);
            }
        }
        peer.inner.closed.set(true);
        let cb = self.on_timeout.borrow().clone();
        if let Some(cb) = cb {
            cb(peer);
        }
    }

    fn close(&self) {
        if self.state.replace(ServerState::Closed) == ServerState::Closed {
            return;
        }
        self.core.close(&self.lp);
        if let Some(backlog) = self.backlog.borrow_mut().take() {
            backlog.clear();
        }
        let peers: Vec<UdpPeer> = self.peers.borrow_mut().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.inner.closed.set(true);
        }
        self.tombstones.borrow_mut().clear();
        self.on_new_peer.borrow_mut().take();
        self.on_data.borrow_mut().take();
        self.on_timeout.borrow_mut().take();
        log::debug!("udp server closed");
    }
}

impl EventHandler for ServerInner {
    fn handle_event(self: Rc<Self>, lp: &EventLoop, ready: Readiness) {
        if ready.writable {
            self.core.flush(lp);
        }
        if ready.readable {
            self.core.recv_all(&mut |chunk, from| self.deliver(chunk, from));
        }
    }
}

impl Removable for UdpServer {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        log::debug!("udp server removal scheduled");
        inner.close();
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

impl std::fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServer")
            .field("bound_port", &self.bound_port())
            .field("peers", &self.peers_count())
            .finish()
    }
}

struct PeerInner {
    lp: EventLoop,
    server: Weak<ServerInner>,
    endpoint: Endpoint,
    last_packet_time: Cell<Instant>,
    closed: Cell<bool>,
    removal: RemovalState,
    user_data: UserData,
}

/// One remote sender as seen by a [`UdpServer`]
///
/// Equality is identity: a peer recreated after eviction is a different peer.
#[derive(Clone)]
pub struct UdpPeer {
    inner: Rc<PeerInner>,
}

impl PartialEq for UdpPeer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for UdpPeer {}

impl UdpPeer {
    fn new(server: &Rc<ServerInner>, endpoint: Endpoint, now: Instant) -> Self {
        Self {
            inner: Rc::new(PeerInner {
                lp: server.lp.clone(),
                server: Rc::downgrade(server),
                endpoint,
                last_packet_time: Cell::new(now),
                closed: Cell::new(false),
                removal: RemovalState::default(),
                user_data: UserData::default(),
            }),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    /// Arrival time of the latest datagram from this peer
    pub fn last_packet_time(&self) -> Instant {
        self.inner.last_packet_time.get()
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.get() && self.inner.removal.is_active()
    }

    /// Owning server, `None` once it is gone
    pub fn server(&self) -> Option<UdpServer> {
        self.inner.server.upgrade().map(|inner| UdpServer { inner })
    }

    /// Closes the peer; its endpoint is ignored until quiet for `inactivity`
    pub fn close(&self, inactivity: Duration) {
        if self.inner.closed.replace(true) {
            return;
        }
        log::debug!("udp peer {} closed", self.inner.endpoint);
        if let Some(server) = self.inner.server.upgrade() {
            server.close_peer(self, inactivity);
        }
    }

    pub fn set_user_data<T: 'static>(&self, value: T) {
        self.inner.user_data.set(value);
    }

    pub fn user_data<T: 'static>(&self) -> Option<Rc<T>> {
        self.inner.user_data.get()
    }
}

impl Transport for UdpPeer {
    fn send_bytes(&self, data: Bytes, cb: SendCompletion) {
        let inner = &self.inner;
        if !inner.removal.is_active() {
            return complete_later(&inner.lp, cb, Err(Error::canceled()));
        }
        if data.len() > inner.lp.config().udp_max_datagram_size {
            return complete_later(&inner.lp, cb, Err(Error::new(StatusCode::MessageTooLong)));
        }
        let server = inner.server.upgrade();
        let (Some(server), Some(to), false) = (server, inner.endpoint.to_socket_addr(), inner.closed.get()) else {
            return complete_later(&inner.lp, cb, Err(Error::new(StatusCode::SocketIsNotConnected)));
        };
        server.core.send_to(&inner.lp, data, to, cb);
    }

    fn is_open(&self) -> bool {
        UdpPeer::is_open(self)
    }

    fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }
}

impl Removable for UdpPeer {
    fn schedule_removal(&self) {
        let inner = &self.inner;
        if !inner.removal.begin() {
            return;
        }
        if !inner.closed.replace(true) {
            if let Some(server) = inner.server.upgrade() {
                server.close_peer(self, inner.lp.config().udp_peer_close_inactivity);
            }
        }
        let inner = Rc::clone(inner);
        self.inner.lp.post(move |_| {
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

impl std::fmt::Debug for UdpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpPeer")
            .field("endpoint", &self.inner.endpoint)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_twice_is_rejected() {
        let lp = EventLoop::new().unwrap();
        let server = UdpServer::new(&lp);
        server.start_receive(Endpoint::new("127.0.0.1", 0), |_, _| {}).unwrap();
        assert_ne!(server.bound_port(), 0);
        let again = server.start_receive(Endpoint::new("127.0.0.1", 0), |_, _| {});
        assert_eq!(again.unwrap_err().code(), StatusCode::InvalidArgument);
        server.schedule_removal();
        lp.run().unwrap();
        assert_eq!(server.removal_phase(), RemovalPhase::Removed);
    }

    #[test]
    fn test_undefined_endpoint_is_invalid() {
        let lp = EventLoop::new().unwrap();
        let server = UdpServer::new(&lp);
        let err = server.start_receive(Endpoint::Undefined, |_, _| {}).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert!(!server.is_open());
    }

    #[test]
    fn test_closed_peer_is_tombstoned() {
        let lp = EventLoop::new().unwrap();
        let server = UdpServer::new(&lp);
        server.start_receive(Endpoint::new("127.0.0.1", 0), |_, _| {}).unwrap();
        let inner = &server.inner;
        let from = Endpoint::new("127.0.0.1", 4000);
        let now = lp.now();

        let (peer, is_new) = inner.peer_for(from, now).unwrap();
        assert!(is_new);
        assert_eq!(server.peers_count(), 1);
        peer.close(Duration::from_millis(50));
        assert!(!peer.is_open());
        assert_eq!(server.peers_count(), 0);

        assert!(inner.peer_for(from, now + Duration::from_millis(10)).is_none());
        let (fresh, is_new) = inner.peer_for(from, now + Duration::from_millis(100)).unwrap();
        assert!(is_new);
        assert_ne!(fresh, peer);
        server.close();
    }
}
