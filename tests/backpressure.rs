//! Accept back-pressure: an accepted socket's registration is not
//! rearmed until the application has called `accept` and returned the
//! batch, so at most one `ListenerAccept` is outstanding at any time.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use amphora::{Event, Listener, Proactor};
use common::{Stats, TestDriver};

const CLIENTS: usize = 8;

#[test]
fn accepts_are_paced_and_all_clients_served() {
    let proactor: Proactor<TestDriver> = Proactor::new().unwrap();
    let listener: Listener<TestDriver> = Listener::new();
    proactor.listen(&listener, "127.0.0.1:0", 1);

    let server_stats = Arc::new(Stats::default());
    let served = Arc::new(AtomicUsize::new(0));

    // Pull the bound port out before spawning clients.
    let deadline = Instant::now() + Duration::from_secs(20);
    let port = loop {
        assert!(Instant::now() < deadline, "listener never opened");
        if let Some(addr) = listener.local_addr().and_then(|a| a.to_socket_addr()) {
            break addr.port();
        }
        thread::sleep(Duration::from_millis(1));
    };

    let mut accepts = 0;
    let mut accept_outstanding = false;
    let mut inactives = 0;
    let mut listener_closed = false;

    thread::scope(|s| {
        for _ in 0..CLIENTS {
            let served = served.clone();
            s.spawn(move || {
                let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
                sock.set_read_timeout(Some(Duration::from_secs(15))).unwrap();
                sock.write_all(b"x").unwrap();
                let mut buf = [0u8; 1];
                sock.read_exact(&mut buf).unwrap();
                assert_eq!(&buf, b"x");
                served.fetch_add(1, Ordering::SeqCst);
            });
        }

        loop {
            assert!(Instant::now() < deadline, "backpressure test timed out");

            if accepts == CLIENTS
                && served.load(Ordering::SeqCst) == CLIENTS
                && !listener_closed
            {
                listener.close();
                listener_closed = true;
            }
            if listener_closed && inactives > 0 {
                break;
            }

            let mut batch = match proactor.get() {
                Some(b) => b,
                None => {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
            };
            let is_listener_batch = batch.listener().is_some();
            while let Some(event) = batch.next_event() {
                match event {
                    Event::ListenerAccept => {
                        // The previous accept must have completed before
                        // the listener was rearmed.
                        assert!(!accept_outstanding, "two accepts outstanding");
                        accept_outstanding = true;
                        accepts += 1;
                        listener
                            .accept(TestDriver::echo(server_stats.clone()))
                            .unwrap();
                    }
                    Event::Inactive => inactives += 1,
                    _ => {}
                }
            }
            proactor.done(batch);
            if is_listener_batch {
                // Returning the listener batch is what rearms the
                // accepted socket.
                accept_outstanding = false;
            }
        }
    });

    assert_eq!(accepts, CLIENTS);
    assert_eq!(served.load(Ordering::SeqCst), CLIENTS);
    assert_eq!(inactives, 1);
    assert_eq!(server_stats.received_len(), CLIENTS);
}
