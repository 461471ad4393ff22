mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use horizon_io::{
    DataChunk, EventLoop, StatusCode, TlsClient, TlsConnectedClient, TlsServer, TlsVersion, TlsVersionRange, Transport,
    DEFAULT_BACKLOG,
};

use common::{identity, localhost, pattern};

/// Echo server that closes itself once its connection has gone
fn echo_server(lp: &EventLoop, range: TlsVersionRange, log: Rc<RefCell<Vec<String>>>) -> anyhow::Result<TlsServer> {
    let id = identity()?;
    let server = TlsServer::new(lp, &id.cert, &id.key, range)?;
    let connected = Rc::clone(&log);
    let data = Rc::clone(&log);
    server.listen(
        localhost(0),
        move |conn: &TlsConnectedClient, result| {
            connected.borrow_mut().push(match result {
                Ok(()) => format!("connected {:?}", conn.negotiated_tls_version()),
                Err(e) => format!("failed {:?}", e.code()),
            });
        },
        move |conn: &TlsConnectedClient, chunk: DataChunk| {
            if !data.borrow().iter().any(|l| l == "data") {
                data.borrow_mut().push("data".to_string());
            }
            conn.send(chunk.into_bytes());
        },
        |conn: &TlsConnectedClient, _| {
            if let Some(server) = conn.server() {
                server.close(|_| {});
            }
        },
        DEFAULT_BACKLOG,
    )?;
    Ok(server)
}

fn run_echo(client_range: TlsVersionRange) -> anyhow::Result<(Vec<String>, Option<TlsVersion>)> {
    const TOTAL: usize = 200 * 1024;
    let lp = EventLoop::new()?;
    let server_log = Rc::new(RefCell::new(Vec::new()));
    let server = echo_server(&lp, TlsVersionRange::default(), Rc::clone(&server_log))?;

    let client = TlsClient::new(&lp, client_range, false)?;
    let payload = pattern(TOTAL);
    let echoed = Rc::new(RefCell::new(Vec::new()));
    let connected = Rc::new(Cell::new(false));
    let version = Rc::new(Cell::new(None));
    let closed = Rc::new(Cell::new(false));

    let to_send = payload.clone();
    let (c, v) = (Rc::clone(&connected), Rc::clone(&version));
    let (c2, e) = (Rc::clone(&connected), Rc::clone(&echoed));
    let cl = Rc::clone(&closed);
    client.connect(
        localhost(server.endpoint().port()),
        move |client: &TlsClient, result| {
            assert!(result.is_ok(), "handshake failed: {:?}", result);
            assert!(client.is_open());
            c.set(true);
            v.set(client.negotiated_tls_version());
            client.send(to_send);
        },
        move |client: &TlsClient, chunk: DataChunk| {
            assert!(c2.get(), "data delivered before the handshake completed");
            e.borrow_mut().extend_from_slice(&chunk);
            if e.borrow().len() == TOTAL {
                client.shutdown();
            }
        },
        move |_: &TlsClient, result| {
            assert!(result.is_ok());
            cl.set(true);
        },
    );
    lp.run()?;

    assert!(connected.get());
    assert!(closed.get());
    assert_eq!(*echoed.borrow(), payload);
    let log = server_log.borrow().clone();
    Ok((log, version.get()))
}

#[test]
fn echo_over_tls13() -> anyhow::Result<()> {
    let (server_log, version) = run_echo(TlsVersionRange::default())?;
    assert_eq!(version, Some(TlsVersion::V1_3));
    assert_eq!(server_log, vec!["connected Some(V1_3)".to_string(), "data".to_string()]);
    Ok(())
}

#[test]
fn client_version_cap_is_honored() -> anyhow::Result<()> {
    let range = TlsVersionRange { min: TlsVersion::V1_2, max: TlsVersion::V1_2 };
    let (server_log, version) = run_echo(range)?;
    assert_eq!(version, Some(TlsVersion::V1_2));
    assert_eq!(server_log[0], "connected Some(V1_2)");
    Ok(())
}

#[test]
fn untrusted_certificate_fails_the_handshake() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let server_log = Rc::new(RefCell::new(Vec::new()));
    let server = echo_server(&lp, TlsVersionRange::default(), Rc::clone(&server_log))?;

    let client = TlsClient::new(&lp, TlsVersionRange::default(), true)?;
    let outcome = Rc::new(RefCell::new(None));
    let data_seen = Rc::new(Cell::new(false));
    let close_seen = Rc::new(Cell::new(false));
    let o = Rc::clone(&outcome);
    let d = Rc::clone(&data_seen);
    let cs = Rc::clone(&close_seen);
    let srv = server.clone();
    client.connect(
        localhost(server.endpoint().port()),
        move |client: &TlsClient, result| {
            assert!(!client.is_open());
            *o.borrow_mut() = Some(result.map_err(|e| e.code()));
            srv.close(|_| {});
        },
        move |_: &TlsClient, _: DataChunk| d.set(true),
        move |_: &TlsClient, _| cs.set(true),
    );
    lp.run()?;

    assert_eq!(*outcome.borrow(), Some(Err(StatusCode::TlsError)));
    assert!(!data_seen.get());
    assert!(!close_seen.get());
    assert!(server_log.borrow().iter().all(|l| l.starts_with("failed")));
    Ok(())
}

#[test]
fn missing_certificate_is_reported() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let missing = std::path::Path::new("/nonexistent/cert.pem");
    let err = TlsServer::new(&lp, missing, missing, TlsVersionRange::default()).unwrap_err();
    assert_eq!(err.code(), StatusCode::TlsError);
    Ok(())
}

#[test]
fn client_count_excludes_pending_handshakes() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let id = identity()?;
    let server = TlsServer::new(&lp, &id.cert, &id.key, TlsVersionRange::default())?;
    let counts = Rc::new(RefCell::new(Vec::new()));
    let c = Rc::clone(&counts);
    server.listen(
        localhost(0),
        move |conn: &TlsConnectedClient, result| {
            if result.is_err() {
                return;
            }
            if let Some(server) = conn.server() {
                c.borrow_mut().push(server.connected_clients_count());
                server.close(|_| {});
            }
        },
        |_: &TlsConnectedClient, _: DataChunk| {},
        |_: &TlsConnectedClient, _| {},
        DEFAULT_BACKLOG,
    )?;
    assert!(format!("{:?}", server).contains("clients: 0"));

    // Never speaks TLS, so it stays in the handshake until the server closes
    let silent = std::net::TcpStream::connect(("127.0.0.1", server.endpoint().port()))?;

    let client = TlsClient::new(&lp, TlsVersionRange::default(), false)?;
    client.connect(
        localhost(server.endpoint().port()),
        |_: &TlsClient, result| assert!(result.is_ok()),
        |_: &TlsClient, _: DataChunk| {},
        |_: &TlsClient, _| {},
    );
    lp.run()?;
    drop(silent);

    assert_eq!(*counts.borrow(), vec![1]);
    Ok(())
}
