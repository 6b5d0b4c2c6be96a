//! Bulk disconnect under load: every connection closes with the supplied
//! condition, is freed exactly once, and a single Inactive follows.

mod common;

use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use amphora::{Condition, Event, Proactor};
use common::{Stats, TestDriver};

const CONNECTIONS: usize = 100;

#[test]
fn bulk_disconnect_closes_everything_once() {
    // A std listener plays the remote peers; accepted sockets are parked
    // until the proactor side goes away.
    let peer = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer_addr = peer.local_addr().unwrap();
    let stop_accepting = Arc::new(AtomicBool::new(false));
    let accept_stop = stop_accepting.clone();
    let peer_thread = thread::spawn(move || {
        let mut parked = Vec::new();
        peer.set_nonblocking(true).unwrap();
        while !accept_stop.load(Ordering::SeqCst) {
            match peer.accept() {
                Ok((sock, _)) => parked.push(sock),
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
        // Hold the sockets open until the other side disconnected, then
        // observe EOF on each.
        for mut sock in parked {
            sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buf = [0u8; 16];
            let _ = sock.read(&mut buf);
        }
    });

    let proactor: Proactor<TestDriver> = Proactor::new().unwrap();
    let stats = Arc::new(Stats::default());
    let mut conns = Vec::with_capacity(CONNECTIONS);
    for _ in 0..CONNECTIONS {
        conns.push(proactor.connect(
            TestDriver::idle(stats.clone()),
            &format!("127.0.0.1:{}", peer_addr.port()),
        ));
    }

    // Let the connects establish while draining.
    let settle = Instant::now() + Duration::from_millis(200);
    while Instant::now() < settle {
        if let Some(mut batch) = proactor.get() {
            while batch.next_event().is_some() {}
            proactor.done(batch);
        } else {
            thread::sleep(Duration::from_millis(1));
        }
    }

    let cond = Condition::new("amqp:connection:forced", "shutting down");
    proactor.disconnect(Some(&cond));

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut inactives = 0;
    while inactives == 0 {
        assert!(Instant::now() < deadline, "no Inactive after disconnect");
        match proactor.get() {
            Some(mut batch) => {
                while let Some(event) = batch.next_event() {
                    if event == Event::Inactive {
                        inactives += 1;
                    }
                }
                proactor.done(batch);
            }
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
    assert_eq!(inactives, 1);

    // Every connection got the supplied condition, exactly once each.
    {
        let errors = stats.errors.lock().unwrap();
        assert_eq!(errors.len(), CONNECTIONS);
        for c in errors.iter() {
            assert_eq!(c.name, "amqp:connection:forced");
            assert_eq!(c.description, "shutting down");
        }
    }

    // Dropping the handles releases the last references: each driver is
    // freed exactly once.
    drop(conns);
    assert_eq!(stats.drops.load(Ordering::SeqCst), CONNECTIONS);

    stop_accepting.store(true, Ordering::SeqCst);
    peer_thread.join().unwrap();
}

#[test]
fn disconnect_with_no_contexts_is_a_noop() {
    let proactor: Proactor<TestDriver> = Proactor::new().unwrap();
    proactor.disconnect(None);
    // No contexts were ever added, so no Inactive is generated.
    thread::sleep(Duration::from_millis(20));
    while let Some(mut batch) = proactor.get() {
        assert!(batch.next_event().is_none());
        proactor.done(batch);
    }
}
