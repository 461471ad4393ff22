//! Encryption engine shared by TLS and DTLS
//!
//! OpenSSL never touches a socket here. It reads ciphertext from, and writes
//! ciphertext to, an in-memory [`ByteBridge`]; the owning transport moves
//! bytes between the bridge and the network. The bridge runs in stream mode
//! for TLS and in datagram mode for DTLS, where every write is one datagram
//! and every read consumes exactly one.
//!
//! [`SecureSession::process`] is the single entry point after construction:
//! it feeds received ciphertext, advances the handshake, decrypts whatever is
//! available and hands back everything the caller must act on. Callers
//! deliver the results after releasing their borrow of the session.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;

use bytes::{Buf, Bytes, BytesMut};
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslOptions, SslStream, SslVerifyMode, SslVersion,
};

use crate::config::NetConfig;
use crate::error::{Error, StatusCode};
use crate::transport::{complete_later, SendCompletion, Transport};

/// Largest plaintext carried by one record
const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

const MIN_DTLS_MTU: u32 = 256;
const MAX_DTLS_MTU: u32 = 65_507;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    V1_0,
    V1_1,
    V1_2,
    V1_3,
}

impl TlsVersion {
    fn to_ssl(self) -> SslVersion {
        match self {
            TlsVersion::V1_0 => SslVersion::TLS1,
            TlsVersion::V1_1 => SslVersion::TLS1_1,
            TlsVersion::V1_2 => SslVersion::TLS1_2,
            TlsVersion::V1_3 => SslVersion::TLS1_3,
        }
    }

    fn from_ssl(v: SslVersion) -> Option<Self> {
        [TlsVersion::V1_0, TlsVersion::V1_1, TlsVersion::V1_2, TlsVersion::V1_3]
            .into_iter()
            .find(|t| t.to_ssl() == v)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DtlsVersion {
    V1_0,
    V1_2,
}

impl DtlsVersion {
    fn to_ssl(self) -> SslVersion {
        match self {
            DtlsVersion::V1_0 => SslVersion::DTLS1,
            DtlsVersion::V1_2 => SslVersion::DTLS1_2,
        }
    }

    fn from_ssl(v: SslVersion) -> Option<Self> {
        [DtlsVersion::V1_0, DtlsVersion::V1_2].into_iter().find(|d| d.to_ssl() == v)
    }
}

/// Inclusive range of TLS versions a context accepts
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TlsVersionRange {
    pub min: TlsVersion,
    pub max: TlsVersion,
}

impl Default for TlsVersionRange {
    fn default() -> Self {
        Self { min: TlsVersion::V1_2, max: TlsVersion::V1_3 }
    }
}

/// Inclusive range of DTLS versions a context accepts
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DtlsVersionRange {
    pub min: DtlsVersion,
    pub max: DtlsVersion,
}

impl Default for DtlsVersionRange {
    fn default() -> Self {
        Self { min: DtlsVersion::V1_2, max: DtlsVersion::V1_2 }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SecureMode {
    Tls,
    Dtls,
}

/// Immutable crypto configuration shared by every session it creates
#[derive(Clone)]
pub struct SecureContext {
    ctx: SslContext,
    role: Role,
    mode: SecureMode,
    mtu: u32,
}

impl SecureContext {
    /// Client context; `verify_peer` enables certificate verification against
    /// the system trust store
    pub fn tls_client(cfg: &NetConfig, range: TlsVersionRange, verify_peer: bool) -> Result<Self, Error> {
        if range.min > range.max {
            return Err(Error::with_message(StatusCode::InvalidArgument, "empty tls version range"));
        }
        let builder = Self::builder(SslMethod::tls(), cfg, Role::Client, verify_peer, None)?;
        Self::finish(builder, cfg, Role::Client, SecureMode::Tls, range.min.to_ssl(), range.max.to_ssl())
    }

    /// Server context presenting the PEM certificate chain and key at the given paths
    pub fn tls_server(cfg: &NetConfig, cert: &Path, key: &Path, range: TlsVersionRange) -> Result<Self, Error> {
        if range.min > range.max {
            return Err(Error::with_message(StatusCode::InvalidArgument, "empty tls version range"));
        }
        let builder = Self::builder(SslMethod::tls(), cfg, Role::Server, false, Some((cert, key)))?;
        Self::finish(builder, cfg, Role::Server, SecureMode::Tls, range.min.to_ssl(), range.max.to_ssl())
    }

    pub fn dtls_client(cfg: &NetConfig, range: DtlsVersionRange, verify_peer: bool) -> Result<Self, Error> {
        if range.min > range.max {
            return Err(Error::with_message(StatusCode::InvalidArgument, "empty dtls version range"));
        }
        let mut builder = Self::builder(SslMethod::dtls(), cfg, Role::Client, verify_peer, None)?;
        builder.set_options(SslOptions::NO_QUERY_MTU);
        Self::finish(builder, cfg, Role::Client, SecureMode::Dtls, range.min.to_ssl(), range.max.to_ssl())
    }

    pub fn dtls_server(cfg: &NetConfig, cert: &Path, key: &Path, range: DtlsVersionRange) -> Result<Self, Error> {
        if range.min > range.max {
            return Err(Error::with_message(StatusCode::InvalidArgument, "empty dtls version range"));
        }
        let mut builder = Self::builder(SslMethod::dtls(), cfg, Role::Server, false, Some((cert, key)))?;
        builder.set_options(SslOptions::NO_QUERY_MTU);
        Self::finish(builder, cfg, Role::Server, SecureMode::Dtls, range.min.to_ssl(), range.max.to_ssl())
    }

    fn builder(
        method: SslMethod,
        cfg: &NetConfig,
        role: Role,
        verify_peer: bool,
        identity: Option<(&Path, &Path)>,
    ) -> Result<SslContextBuilder, Error> {
        let mut builder = SslContextBuilder::new(method)?;
        builder.set_cipher_list(&cfg.ciphers)?;
        if role == Role::Client && verify_peer {
            builder.set_default_verify_paths()?;
            builder.set_verify(SslVerifyMode::PEER);
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }
        if let Some((cert, key)) = identity {
            builder
                .set_certificate_chain_file(cert)
                .map_err(|e| Error::with_message(StatusCode::TlsError, format!("{}: {}", cert.display(), e)))?;
            builder
                .set_private_key_file(key, SslFiletype::PEM)
                .map_err(|e| Error::with_message(StatusCode::TlsError, format!("{}: {}", key.display(), e)))?;
            builder.check_private_key()?;
        }
        Ok(builder)
    }

    fn finish(
        mut builder: SslContextBuilder,
        cfg: &NetConfig,
        role: Role,
        mode: SecureMode,
        min: SslVersion,
        max: SslVersion,
    ) -> Result<Self, Error> {
        builder.set_min_proto_version(Some(min))?;
        builder.set_max_proto_version(Some(max))?;
        Ok(Self { ctx: builder.build(), role, mode, mtu: cfg.dtls_mtu })
    }

    /// Same context with a different DTLS path MTU
    pub fn with_mtu(&self, mtu: u32) -> Result<Self, Error> {
        if !(MIN_DTLS_MTU..=MAX_DTLS_MTU).contains(&mtu) {
            return Err(Error::with_message(StatusCode::InvalidArgument, format!("mtu {} out of range", mtu)));
        }
        Ok(Self { mtu, ..self.clone() })
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn mode(&self) -> SecureMode {
        self.mode
    }
}

impl fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureContext").field("role", &self.role).field("mode", &self.mode).finish()
    }
}

/// In-memory transport OpenSSL reads ciphertext from and writes it to
pub(crate) enum ByteBridge {
    Stream { inbound: BytesMut, outbound: BytesMut },
    Datagram { inbound: VecDeque<Bytes>, outbound: VecDeque<Bytes> },
}

impl ByteBridge {
    pub fn stream() -> Self {
        ByteBridge::Stream { inbound: BytesMut::new(), outbound: BytesMut::new() }
    }

    pub fn datagram() -> Self {
        ByteBridge::Datagram { inbound: VecDeque::new(), outbound: VecDeque::new() }
    }

    /// Appends ciphertext received from the network
    pub fn feed(&mut self, data: &[u8]) {
        match self {
            ByteBridge::Stream { inbound, .. } => inbound.extend_from_slice(data),
            ByteBridge::Datagram { inbound, .. } => inbound.push_back(Bytes::copy_from_slice(data)),
        }
    }

    /// Takes the ciphertext waiting to go out; one entry per datagram in datagram mode
    pub fn drain(&mut self) -> Vec<Bytes> {
        match self {
            ByteBridge::Stream { outbound, .. } => {
                if outbound.is_empty() {
                    Vec::new()
                } else {
                    vec![outbound.split().freeze()]
                }
            }
            ByteBridge::Datagram { outbound, .. } => outbound.drain(..).collect(),
        }
    }

    /// Drops ciphertext that was written but not yet taken
    pub fn discard_outgoing(&mut self) {
        match self {
            ByteBridge::Stream { outbound, .. } => outbound.clear(),
            ByteBridge::Datagram { outbound, .. } => outbound.clear(),
        }
    }
}

impl Read for ByteBridge {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ByteBridge::Stream { inbound, .. } => {
                if inbound.is_empty() {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                let n = buf.len().min(inbound.len());
                buf[..n].copy_from_slice(&inbound[..n]);
                inbound.advance(n);
                Ok(n)
            }
            ByteBridge::Datagram { inbound, .. } => {
                let Some(dgram) = inbound.pop_front() else {
                    return Err(io::ErrorKind::WouldBlock.into());
                };
                let n = buf.len().min(dgram.len());
                buf[..n].copy_from_slice(&dgram[..n]);
                Ok(n)
            }
        }
    }
}

impl Write for ByteBridge {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ByteBridge::Stream { outbound, .. } => outbound.extend_from_slice(buf),
            ByteBridge::Datagram { outbound, .. } => outbound.push_back(Bytes::copy_from_slice(buf)),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

/// Result of one handshake step
#[derive(Debug)]
pub(crate) enum HandshakeStep {
    NeedMoreInput,
    /// Handshake records are waiting in the write bridge
    Send,
    Complete,
    Failed(Error),
}

/// Everything one call to [`SecureSession::process`] produced
#[derive(Debug, Default)]
pub(crate) struct SessionOutput {
    /// Ciphertext to hand to the transport, in order
    pub outgoing: Vec<Bytes>,
    /// Set once, when the handshake finishes either way
    pub handshake: Option<Result<(), Error>>,
    /// Decrypted data, one entry per record read
    pub plaintext: Vec<Bytes>,
    /// Peer closed the session (`Ok`) or the session broke after the handshake
    pub closed: Option<Result<(), Error>>,
}

enum Plain {
    Data(Bytes),
    WouldBlock,
    Closed,
}

/// One TLS or DTLS session over a [`ByteBridge`]
pub(crate) struct SecureSession {
    stream: SslStream<ByteBridge>,
    state: HandshakeState,
    scratch: Vec<u8>,
}

impl SecureSession {
    pub fn new(ctx: &SecureContext) -> Result<Self, Error> {
        let mut ssl = Ssl::new(&ctx.ctx)?;
        let bridge = match ctx.mode {
            SecureMode::Tls => ByteBridge::stream(),
            SecureMode::Dtls => {
                ssl.set_mtu(ctx.mtu)?;
                ByteBridge::datagram()
            }
        };
        match ctx.role {
            Role::Client => ssl.set_connect_state(),
            Role::Server => ssl.set_accept_state(),
        }
        let stream = SslStream::new(ssl, bridge)?;
        Ok(Self { stream, state: HandshakeState::NotStarted, scratch: vec![0u8; MAX_RECORD_PLAINTEXT] })
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Complete
    }

    /// Advances the handshake as far as the buffered input allows
    pub fn do_handshake(&mut self) -> HandshakeStep {
        match self.state {
            HandshakeState::Complete => return HandshakeStep::Complete,
            HandshakeState::Failed => {
                return HandshakeStep::Failed(Error::with_message(StatusCode::TlsError, "handshake already failed"))
            }
            HandshakeState::NotStarted => self.state = HandshakeState::InProgress,
            HandshakeState::InProgress => {}
        }
        match self.stream.do_handshake() {
            Ok(()) => {
                self.state = HandshakeState::Complete;
                log::debug!("secure handshake complete: {}", self.stream.ssl().version_str());
                HandshakeStep::Complete
            }
            Err(e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => {
                if self.has_outgoing() {
                    HandshakeStep::Send
                } else {
                    HandshakeStep::NeedMoreInput
                }
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                let err = Error::from(e);
                log::error!("secure handshake failed: {}", err);
                HandshakeStep::Failed(err)
            }
        }
    }

    fn has_outgoing(&self) -> bool {
        match self.stream.get_ref() {
            ByteBridge::Stream { outbound, .. } => !outbound.is_empty(),
            ByteBridge::Datagram { outbound, .. } => !outbound.is_empty(),
        }
    }

    fn read_plaintext(&mut self) -> Result<Plain, Error> {
        match self.stream.ssl_read(&mut self.scratch) {
            Ok(0) => Ok(Plain::Closed),
            Ok(n) => Ok(Plain::Data(Bytes::copy_from_slice(&self.scratch[..n]))),
            Err(e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => Ok(Plain::WouldBlock),
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(Plain::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Feeds `input` (if any) and runs the session until it needs more input
    pub fn process(&mut self, input: Option<&[u8]>) -> SessionOutput {
        if let Some(data) = input {
            self.stream.get_mut().feed(data);
        }
        let mut out = SessionOutput::default();

        if matches!(self.state, HandshakeState::NotStarted | HandshakeState::InProgress) {
            match self.do_handshake() {
                HandshakeStep::NeedMoreInput | HandshakeStep::Send => {}
                HandshakeStep::Complete => out.handshake = Some(Ok(())),
                HandshakeStep::Failed(e) => out.handshake = Some(Err(e)),
            }
        }

        if self.state == HandshakeState::Complete {
            loop {
                match self.read_plaintext() {
                    Ok(Plain::Data(data)) => out.plaintext.push(data),
                    Ok(Plain::WouldBlock) => break,
                    Ok(Plain::Closed) => {
                        out.closed = Some(Ok(()));
                        break;
                    }
                    Err(e) => {
                        out.closed = Some(Err(e));
                        break;
                    }
                }
            }
        }

        out.outgoing = self.stream.get_mut().drain();
        out
    }

    /// Encrypts `data`, returning the ciphertext to send
    ///
    /// In DTLS mode the result is one datagram per record.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<Bytes>, Error> {
        if self.state != HandshakeState::Complete {
            return Err(Error::with_message(StatusCode::SocketIsNotConnected, "handshake not complete"));
        }
        let datagram = matches!(self.stream.get_ref(), ByteBridge::Datagram { .. });
        if datagram && data.len() > MAX_RECORD_PLAINTEXT {
            return Err(Error::new(StatusCode::MessageTooLong));
        }
        let mut written = 0;
        while written < data.len() {
            let end = (written + MAX_RECORD_PLAINTEXT).min(data.len());
            match self.stream.ssl_write(&data[written..end]) {
                Ok(n) => written += n,
                Err(e) => {
                    // Records of a half-written message must never reach the peer
                    self.stream.get_mut().discard_outgoing();
                    return Err(e.into());
                }
            }
        }
        Ok(self.stream.get_mut().drain())
    }

    /// Queues a close_notify alert and returns the ciphertext carrying it
    pub fn shutdown(&mut self) -> Vec<Bytes> {
        if self.state == HandshakeState::Complete {
            if let Err(e) = self.stream.shutdown() {
                log::debug!("secure shutdown: {}", e);
            }
        }
        self.stream.get_mut().drain()
    }

    pub fn negotiated_tls_version(&self) -> Option<TlsVersion> {
        if !self.is_established() {
            return None;
        }
        self.stream.ssl().version2().and_then(TlsVersion::from_ssl)
    }

    pub fn negotiated_dtls_version(&self) -> Option<DtlsVersion> {
        if !self.is_established() {
            return None;
        }
        self.stream.ssl().version2().and_then(DtlsVersion::from_ssl)
    }
}

/// A session bound to the transport carrying its ciphertext
pub(crate) struct SecureChannel<T: Transport> {
    transport: T,
    session: RefCell<SecureSession>,
}

impl<T: Transport> SecureChannel<T> {
    pub fn new(transport: T, ctx: &SecureContext) -> Result<Self, Error> {
        Ok(Self { transport, session: RefCell::new(SecureSession::new(ctx)?) })
    }

    pub fn is_established(&self) -> bool {
        self.session.borrow().is_established()
    }

    /// Runs the session on `input` and sends whatever ciphertext it produced
    pub fn process(&self, input: Option<&[u8]>) -> SessionOutput {
        let mut out = self.session.borrow_mut().process(input);
        let outgoing = std::mem::take(&mut out.outgoing);
        self.transmit(outgoing, None);
        out
    }

    /// Encrypts and sends `data`; `cb` fires when the transport is done with it
    pub fn send(&self, data: &[u8], cb: SendCompletion) {
        let encrypted = self.session.borrow_mut().encrypt(data);
        match encrypted {
            Ok(chunks) => self.transmit(chunks, Some(cb)),
            Err(e) => complete_later(self.transport.event_loop(), cb, Err(e)),
        }
    }

    /// Sends a close_notify alert
    pub fn shutdown(&self) {
        let chunks = self.session.borrow_mut().shutdown();
        self.transmit(chunks, None);
    }

    pub fn negotiated_tls_version(&self) -> Option<TlsVersion> {
        self.session.borrow().negotiated_tls_version()
    }

    pub fn negotiated_dtls_version(&self) -> Option<DtlsVersion> {
        self.session.borrow().negotiated_dtls_version()
    }

    fn transmit(&self, chunks: Vec<Bytes>, cb: Option<SendCompletion>) {
        let last = chunks.len().saturating_sub(1);
        let mut cb = cb;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let done: SendCompletion = match (i == last, cb.take()) {
                (true, Some(cb)) => cb,
                (_, held) => {
                    cb = held;
                    Box::new(|result| {
                        if let Err(e) = result {
                            log::debug!("secure transmit failed: {}", e);
                        }
                    })
                }
            };
            self.transport.send_bytes(chunk, done);
        }
        if let Some(cb) = cb {
            complete_later(self.transport.event_loop(), cb, Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::PathBuf;

    struct Identity {
        dir: PathBuf,
        cert: PathBuf,
        key: PathBuf,
    }

    impl Drop for Identity {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn identity(tag: &str) -> Identity {
        let dir = std::env::temp_dir().join(format!("horizon_io_secure_{}_{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        fs::write(&cert, generated.cert.pem()).unwrap();
        fs::write(&key, generated.key_pair.serialize_pem()).unwrap();
        Identity { dir, cert, key }
    }

    /// Shuttles ciphertext between two sessions until neither produces any
    fn pump(client: &mut SecureSession, server: &mut SecureSession) -> (SessionOutput, SessionOutput) {
        let mut c = client.process(None);
        let mut s = SessionOutput::default();
        for _ in 0..16 {
            if c.outgoing.is_empty() && s.outgoing.is_empty() {
                break;
            }
            let mut next_s = SessionOutput::default();
            for chunk in c.outgoing.drain(..) {
                let o = server.process(Some(&chunk));
                merge(&mut next_s, o);
            }
            let mut next_c = SessionOutput::default();
            for chunk in s.outgoing.drain(..) {
                let o = client.process(Some(&chunk));
                merge(&mut next_c, o);
            }
            merge(&mut s, next_s);
            merge(&mut c, next_c);
        }
        (c, s)
    }

    fn merge(into: &mut SessionOutput, from: SessionOutput) {
        into.outgoing.extend(from.outgoing);
        into.plaintext.extend(from.plaintext);
        if from.handshake.is_some() {
            into.handshake = from.handshake;
        }
        if from.closed.is_some() {
            into.closed = from.closed;
        }
    }

    #[test]
    fn test_tls_handshake_and_data_over_bridges() {
        let id = identity("tls");
        let cfg = NetConfig::default();
        let client_ctx = SecureContext::tls_client(&cfg, TlsVersionRange::default(), false).unwrap();
        let server_ctx = SecureContext::tls_server(&cfg, &id.cert, &id.key, TlsVersionRange::default()).unwrap();
        let mut client = SecureSession::new(&client_ctx).unwrap();
        let mut server = SecureSession::new(&server_ctx).unwrap();
        assert_eq!(client.state, HandshakeState::NotStarted);

        let (c, s) = pump(&mut client, &mut server);
        assert!(matches!(c.handshake, Some(Ok(()))));
        assert!(matches!(s.handshake, Some(Ok(()))));
        assert_eq!(client.negotiated_tls_version(), Some(TlsVersion::V1_3));
        assert_eq!(server.negotiated_tls_version(), Some(TlsVersion::V1_3));

        let ciphertext = client.encrypt(b"hello").unwrap();
        assert_eq!(ciphertext.len(), 1);
        assert_ne!(&ciphertext[0][..], b"hello");
        let out = server.process(Some(&ciphertext[0]));
        assert_eq!(out.plaintext, vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn test_dtls_keeps_datagram_boundaries() {
        let id = identity("dtls");
        let cfg = NetConfig::default();
        let client_ctx = SecureContext::dtls_client(&cfg, DtlsVersionRange::default(), false).unwrap();
        let server_ctx = SecureContext::dtls_server(&cfg, &id.cert, &id.key, DtlsVersionRange::default()).unwrap();
        let mut client = SecureSession::new(&client_ctx).unwrap();
        let mut server = SecureSession::new(&server_ctx).unwrap();

        let (c, s) = pump(&mut client, &mut server);
        assert!(matches!(c.handshake, Some(Ok(()))));
        assert!(matches!(s.handshake, Some(Ok(()))));
        assert_eq!(client.negotiated_dtls_version(), Some(DtlsVersion::V1_2));

        let first = client.encrypt(b"one").unwrap();
        let second = client.encrypt(b"two").unwrap();
        let mut got = Vec::new();
        for d in first.iter().chain(second.iter()) {
            got.extend(server.process(Some(d)).plaintext);
        }
        assert_eq!(got, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[test]
    fn test_encrypt_before_handshake_is_refused() {
        let cfg = NetConfig::default();
        let ctx = SecureContext::tls_client(&cfg, TlsVersionRange::default(), false).unwrap();
        let mut session = SecureSession::new(&ctx).unwrap();
        let err = session.encrypt(b"early").unwrap_err();
        assert_eq!(err.code(), StatusCode::SocketIsNotConnected);
    }

    #[test]
    fn test_failed_encrypt_leaves_nothing_to_send() {
        let id = identity("partial");
        let cfg = NetConfig::default();
        let client_ctx = SecureContext::tls_client(&cfg, TlsVersionRange::default(), false).unwrap();
        let server_ctx = SecureContext::tls_server(&cfg, &id.cert, &id.key, TlsVersionRange::default()).unwrap();
        let mut client = SecureSession::new(&client_ctx).unwrap();
        let mut server = SecureSession::new(&server_ctx).unwrap();
        let (c, _) = pump(&mut client, &mut server);
        assert!(matches!(c.handshake, Some(Ok(()))));

        // After close_notify every write fails; stale records left behind must go too
        assert!(!client.shutdown().is_empty());
        client.stream.get_mut().write_all(b"stale record").unwrap();
        assert!(client.encrypt(&vec![7u8; 3 * MAX_RECORD_PLAINTEXT]).is_err());
        assert!(!client.has_outgoing());
        assert!(client.stream.get_mut().drain().is_empty());
    }

    #[test]
    fn test_verifying_client_rejects_self_signed() {
        let id = identity("verify");
        let cfg = NetConfig::default();
        let client_ctx = SecureContext::tls_client(&cfg, TlsVersionRange::default(), true).unwrap();
        let server_ctx = SecureContext::tls_server(&cfg, &id.cert, &id.key, TlsVersionRange::default()).unwrap();
        let mut client = SecureSession::new(&client_ctx).unwrap();
        let mut server = SecureSession::new(&server_ctx).unwrap();

        let (c, _) = pump(&mut client, &mut server);
        assert_eq!(c.handshake.unwrap().unwrap_err().code(), StatusCode::TlsError);
        assert_eq!(client.state, HandshakeState::Failed);
        assert!(client.negotiated_tls_version().is_none());
    }

    #[test]
    fn test_inverted_range_is_invalid() {
        let cfg = NetConfig::default();
        let range = TlsVersionRange { min: TlsVersion::V1_3, max: TlsVersion::V1_2 };
        let err = SecureContext::tls_client(&cfg, range, false).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn test_missing_certificate_file() {
        let cfg = NetConfig::default();
        let missing = Path::new("/nonexistent/horizon_io/cert.pem");
        let err = SecureContext::tls_server(&cfg, missing, missing, TlsVersionRange::default()).unwrap_err();
        assert_eq!(err.code(), StatusCode::TlsError);
    }
}
