mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use horizon_io::{
    DataChunk, Endpoint, EventLoop, Removable, SenderFilter, StatusCode, Timer, Transport, UdpClient, UdpPeer, UdpServer,
};

use common::{localhost, pattern, port_is_privileged};

#[test]
fn privileged_port_is_refused() -> anyhow::Result<()> {
    if !port_is_privileged(80) {
        return Ok(());
    }
    let lp = EventLoop::new()?;
    let server = UdpServer::new(&lp);
    let err = server.start_receive(localhost(80), |_: &UdpPeer, _: DataChunk| {}).unwrap_err();
    assert_eq!(err.code(), StatusCode::PermissionDenied);
    Ok(())
}

#[test]
fn second_bind_to_busy_port_fails() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let first = UdpServer::new(&lp);
    first.start_receive(localhost(0), |_: &UdpPeer, _: DataChunk| {})?;
    let second = UdpServer::new(&lp);
    let err = second
        .start_receive(localhost(first.bound_port()), |_: &UdpPeer, _: DataChunk| {})
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::AddressAlreadyInUse);
    first.schedule_removal();
    second.schedule_removal();
    lp.run()?;
    Ok(())
}

#[test]
fn large_datagram_arrives_intact() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let payload = pattern(5000);
    let received = Rc::new(RefCell::new(None));

    let server = UdpServer::new(&lp);
    let r = Rc::clone(&received);
    server.start_receive(localhost(0), move |peer: &UdpPeer, chunk: DataChunk| {
        *r.borrow_mut() = Some(chunk.to_vec());
        if let Some(server) = peer.server() {
            server.schedule_removal();
        }
    })?;

    let client = UdpClient::with_destination(&lp, localhost(server.bound_port()));
    let sent = Rc::new(Cell::new(false));
    let s = Rc::clone(&sent);
    client.send_data(payload.clone(), move |_, result| {
        assert!(result.is_ok());
        s.set(true);
    });
    lp.run()?;

    assert!(sent.get());
    assert_eq!(received.borrow().as_deref(), Some(payload.as_slice()));
    Ok(())
}

#[test]
fn oversized_datagram_is_rejected_asynchronously() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let client = UdpClient::with_destination(&lp, localhost(9));
    let outcome = Rc::new(RefCell::new(Vec::new()));
    let o = Rc::clone(&outcome);
    client.send_data(vec![0u8; 100 * 1024], move |_, result| {
        o.borrow_mut().push(result.map_err(|e| e.code()));
    });
    assert!(outcome.borrow().is_empty());
    lp.run()?;
    assert_eq!(*outcome.borrow(), vec![Err(StatusCode::MessageTooLong)]);
    Ok(())
}

#[test]
fn send_without_destination_fails() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let client = UdpClient::new(&lp);
    let outcome = Rc::new(Cell::new(None));
    let o = Rc::clone(&outcome);
    client.send_data(&b"nowhere"[..], move |_, result| o.set(Some(result.map_err(|e| e.code()))));
    lp.run()?;
    assert_eq!(outcome.get(), Some(Err(StatusCode::DestinationAddressRequired)));
    Ok(())
}

#[test]
fn send_after_removal_is_canceled_once() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let client = UdpClient::with_destination(&lp, localhost(9));
    client.schedule_removal();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let c = Rc::clone(&calls);
    client.send_data(&b"late"[..], move |_, result| c.borrow_mut().push(result.map_err(|e| e.code())));
    assert_eq!(calls.borrow().len(), 0);
    lp.run()?;
    assert_eq!(*calls.borrow(), vec![Err(StatusCode::OperationCanceled)]);
    Ok(())
}

#[test]
fn datagrams_from_one_sender_map_to_one_peer() -> anyhow::Result<()> {
    const MESSAGES: usize = 5;
    let lp = EventLoop::new()?;
    let new_peers = Rc::new(Cell::new(0));
    let delivered = Rc::new(Cell::new(0));

    let server = UdpServer::new(&lp);
    let n = Rc::clone(&new_peers);
    let d = Rc::clone(&delivered);
    server.start_receive_with_new_peer(
        localhost(0),
        move |peer: &UdpPeer| {
            n.set(n.get() + 1);
            peer.set_user_data(String::from("tagged"));
        },
        move |peer: &UdpPeer, _: DataChunk| {
            assert_eq!(peer.user_data::<String>().as_deref().map(String::as_str), Some("tagged"));
            d.set(d.get() + 1);
            if d.get() == MESSAGES {
                if let Some(server) = peer.server() {
                    assert_eq!(server.peers_count(), 1);
                    server.schedule_removal();
                }
            }
        },
    )?;

    let client = UdpClient::with_destination(&lp, localhost(server.bound_port()));
    for i in 0..MESSAGES {
        client.send(format!("message {}", i).into_bytes());
    }
    lp.run()?;

    assert_eq!(new_peers.get(), 1);
    assert_eq!(delivered.get(), MESSAGES);
    Ok(())
}

#[test]
fn quiet_peer_is_evicted_and_replaced() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let server = UdpServer::new(&lp);
    let new_peers = Rc::new(RefCell::new(Vec::<UdpPeer>::new()));
    let timed_out = Rc::new(RefCell::new(Vec::new()));
    let delivered = Rc::new(Cell::new(0));

    let np = Rc::clone(&new_peers);
    let d = Rc::clone(&delivered);
    let t = Rc::clone(&timed_out);
    server.start_receive_with_timeout(
        localhost(0),
        Some(move |peer: &UdpPeer| {
            let generation = np.borrow().len() as u32;
            peer.set_user_data(generation);
            np.borrow_mut().push(peer.clone());
        }),
        move |peer: &UdpPeer, _: DataChunk| {
            d.set(d.get() + 1);
            if d.get() == 3 {
                if let Some(server) = peer.server() {
                    server.schedule_removal();
                }
            }
        },
        Duration::from_millis(200),
        move |peer: &UdpPeer| {
            assert!(!peer.is_open());
            t.borrow_mut().push(peer.user_data::<u32>().map(|g| *g));
        },
    )?;

    let client = UdpClient::with_destination(&lp, localhost(server.bound_port()));
    client.send(&b"first"[..]);
    let second = Timer::new(&lp);
    let c = client.clone();
    second.start(Duration::from_millis(100), move |_| c.send(&b"second"[..]));
    let third = Timer::new(&lp);
    let c = client.clone();
    third.start(Duration::from_millis(600), move |_| c.send(&b"third"[..]));
    lp.run()?;

    let peers = new_peers.borrow();
    assert_eq!(peers.len(), 2);
    assert_ne!(peers[0], peers[1]);
    assert_eq!(*timed_out.borrow(), vec![Some(0)]);
    assert_eq!(delivered.get(), 3);
    Ok(())
}

#[test]
fn echo_on_single_loop() -> anyhow::Result<()> {
    const ROUNDS: usize = 5000;
    let lp = EventLoop::new()?;
    let server = UdpServer::new(&lp);
    let served = Rc::new(Cell::new(0));
    let s = Rc::clone(&served);
    server.start_receive(localhost(0), move |peer: &UdpPeer, chunk: DataChunk| {
        s.set(s.get() + 1);
        peer.send(chunk.into_bytes());
    })?;

    let client = UdpClient::with_destination(&lp, localhost(server.bound_port()));
    let echoed = Rc::new(Cell::new(0));
    let e = Rc::clone(&echoed);
    let srv = server.clone();
    client.start_receive(move |client: &UdpClient, chunk: DataChunk, from: Endpoint| {
        assert_eq!(from, client.destination());
        let round = e.get();
        assert_eq!(&chunk[..], format!("round {}", round).as_bytes());
        e.set(round + 1);
        if round + 1 == ROUNDS {
            client.schedule_removal();
            srv.schedule_removal();
        } else {
            client.send(format!("round {}", round + 1).into_bytes());
        }
    })?;
    client.send(&b"round 0"[..]);
    lp.run()?;

    assert_eq!(echoed.get(), ROUNDS);
    assert_eq!(served.get(), ROUNDS);
    assert_eq!(server.peers_count(), 0);
    Ok(())
}

#[test]
fn echo_across_two_loop_threads() -> anyhow::Result<()> {
    const ROUNDS: usize = 5000;
    let (port_tx, port_rx) = mpsc::channel();
    let server_thread = thread::spawn(move || -> Result<usize, horizon_io::Error> {
        let lp = EventLoop::new()?;
        let server = UdpServer::new(&lp);
        let served = Rc::new(Cell::new(0));
        let s = Rc::clone(&served);
        server.start_receive(localhost(0), move |peer: &UdpPeer, chunk: DataChunk| {
            if &chunk[..] == b"quit" {
                if let Some(server) = peer.server() {
                    server.schedule_removal();
                }
                return;
            }
            s.set(s.get() + 1);
            peer.send(chunk.into_bytes());
        })?;
        let _ = port_tx.send(server.bound_port());
        lp.run()?;
        Ok(served.get())
    });
    let port = port_rx.recv()?;

    let lp = EventLoop::new()?;
    let client = UdpClient::with_destination(&lp, localhost(port));
    let echoed = Rc::new(Cell::new(0));
    let e = Rc::clone(&echoed);
    client.start_receive(move |client: &UdpClient, _: DataChunk, _: Endpoint| {
        e.set(e.get() + 1);
        if e.get() == ROUNDS {
            client.send_data(&b"quit"[..], |client, _| client.schedule_removal());
        } else {
            client.send(pattern(64));
        }
    })?;
    client.send(pattern(64));
    lp.run()?;

    let served = server_thread.join().unwrap()?;
    assert_eq!(echoed.get(), ROUNDS);
    assert_eq!(served, ROUNDS);
    Ok(())
}

#[test]
fn client_drops_datagrams_from_other_senders() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;

    let unrelated = UdpClient::new(&lp);
    unrelated.set_destination(localhost(9))?;
    unrelated.start_receive(|_: &UdpClient, _: DataChunk, _: Endpoint| {})?;
    let target_port = unrelated.bound_port();
    assert_ne!(target_port, 0);

    // Filtered: the destination is some other address
    let filtered = UdpClient::with_destination(&lp, localhost(target_port));
    let filtered_hits = Rc::new(Cell::new(0));
    let f = Rc::clone(&filtered_hits);
    filtered.start_receive(move |_: &UdpClient, _: DataChunk, _: Endpoint| f.set(f.get() + 1))?;

    // Open: no destination and SenderFilter::Any
    let open = UdpClient::new(&lp);
    open.set_sender_filter(SenderFilter::Any);
    let open_hits = Rc::new(Cell::new(0));
    let o = Rc::clone(&open_hits);
    open.start_receive(move |_: &UdpClient, _: DataChunk, _: Endpoint| o.set(o.get() + 1))?;

    let intruder = UdpClient::with_destination(&lp, localhost(filtered.bound_port()));
    intruder.send(&b"spoof"[..]);
    let intruder2 = UdpClient::with_destination(&lp, localhost(open.bound_port()));
    intruder2.send(&b"hello"[..]);

    let stop = Timer::new(&lp);
    let all = vec![unrelated, filtered, open, intruder, intruder2];
    stop.start(Duration::from_millis(200), move |_| {
        for client in &all {
            client.schedule_removal();
        }
    });
    lp.run()?;

    assert_eq!(filtered_hits.get(), 0);
    assert_eq!(open_hits.get(), 1);
    Ok(())
}

#[test]
fn client_times_out_without_traffic() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let client = UdpClient::with_destination(&lp, localhost(9));
    let timed_out = Rc::new(Cell::new(0));
    let t = Rc::clone(&timed_out);
    client.start_receive_with_timeout(
        |_: &UdpClient, _: DataChunk, _: Endpoint| {},
        Duration::from_millis(100),
        move |client: &UdpClient| {
            assert!(!client.is_open());
            t.set(t.get() + 1);
        },
    )?;
    lp.run()?;
    assert_eq!(timed_out.get(), 1);
    Ok(())
}
