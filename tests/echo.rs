//! End-to-end echo: listen, connect, send 4 KiB, get it echoed back,
//! close everything, and see exactly one Inactive.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use amphora::{Event, Listener, Proactor};
use common::{Stats, TestDriver};

const PAYLOAD_LEN: usize = 4096;

#[test]
fn echo_roundtrip() {
    let proactor: Proactor<TestDriver> = Proactor::new().unwrap();
    let listener = Listener::new();
    proactor.listen(&listener, "127.0.0.1:0", 4);

    let server_stats = Arc::new(Stats::default());
    let client_stats = Arc::new(Stats::default());
    let payload = vec![0x5au8; PAYLOAD_LEN];

    let mut opens = 0;
    let mut accepts = 0;
    let mut listener_closes = 0;
    let mut inactives = 0;
    let mut listener_closed = false;
    let mut _client = None;

    let deadline = Instant::now() + Duration::from_secs(20);
    'outer: loop {
        assert!(Instant::now() < deadline, "echo test timed out");

        if !listener_closed && client_stats.received_len() == PAYLOAD_LEN {
            listener.close();
            listener_closed = true;
        }

        let mut batch = match proactor.get() {
            Some(b) => b,
            None => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
        };
        let mut done_after = false;
        while let Some(event) = batch.next_event() {
            match event {
                Event::ListenerOpen => {
                    opens += 1;
                    let port = listener
                        .local_addr()
                        .expect("bound")
                        .to_socket_addr()
                        .expect("ip address")
                        .port();
                    _client = Some(proactor.connect(
                        TestDriver::client(payload.clone(), client_stats.clone()),
                        &format!("127.0.0.1:{port}"),
                    ));
                }
                Event::ListenerAccept => {
                    accepts += 1;
                    listener
                        .accept(TestDriver::echo(server_stats.clone()))
                        .unwrap();
                }
                Event::ListenerClose => listener_closes += 1,
                Event::Inactive => {
                    inactives += 1;
                    done_after = true;
                }
                Event::Transport(_) | Event::ConnectionWake => {}
                Event::Interrupt | Event::Timeout => {
                    panic!("unexpected proactor event: {event:?}")
                }
            }
        }
        proactor.done(batch);
        if done_after {
            break 'outer;
        }
    }

    assert_eq!(opens, 1);
    assert_eq!(accepts, 1);
    assert_eq!(listener_closes, 1);
    assert_eq!(inactives, 1);
    assert_eq!(server_stats.received.lock().unwrap().as_slice(), &payload[..]);
    assert_eq!(client_stats.received.lock().unwrap().as_slice(), &payload[..]);
    assert_eq!(server_stats.error_count(), 0);
    assert_eq!(client_stats.error_count(), 0);
}

#[test]
fn echo_with_parallel_workers() {
    let proactor: Proactor<TestDriver> = Proactor::new().unwrap();
    let listener: Listener<TestDriver> = Listener::new();
    proactor.listen(&listener, "127.0.0.1:0", 4);

    let server_stats = Arc::new(Stats::default());
    let client_stats = Arc::new(Stats::default());
    let payload = vec![0xa5u8; PAYLOAD_LEN];

    let stop = AtomicBool::new(false);
    let inactives = AtomicUsize::new(0);
    let close_once = AtomicBool::new(false);
    let client_slot = std::sync::Mutex::new(None);

    thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                let deadline = Instant::now() + Duration::from_secs(20);
                while !stop.load(Ordering::SeqCst) {
                    assert!(Instant::now() < deadline, "worker timed out");

                    if client_stats.received_len() == PAYLOAD_LEN
                        && !close_once.swap(true, Ordering::SeqCst)
                    {
                        listener.close();
                    }

                    let mut batch = match proactor.get() {
                        Some(b) => b,
                        None => {
                            thread::sleep(Duration::from_millis(1));
                            continue;
                        }
                    };
                    while let Some(event) = batch.next_event() {
                        match event {
                            Event::ListenerOpen => {
                                let port = listener
                                    .local_addr()
                                    .expect("bound")
                                    .to_socket_addr()
                                    .expect("ip address")
                                    .port();
                                let conn = proactor.connect(
                                    TestDriver::client(
                                        payload.clone(),
                                        client_stats.clone(),
                                    ),
                                    &format!("127.0.0.1:{port}"),
                                );
                                *client_slot.lock().unwrap() = Some(conn);
                            }
                            Event::ListenerAccept => {
                                listener
                                    .accept(TestDriver::echo(server_stats.clone()))
                                    .unwrap();
                            }
                            Event::Inactive => {
                                inactives.fetch_add(1, Ordering::SeqCst);
                                stop.store(true, Ordering::SeqCst);
                            }
                            _ => {}
                        }
                    }
                    proactor.done(batch);
                }
            });
        }
    });

    assert_eq!(inactives.load(Ordering::SeqCst), 1);
    assert_eq!(server_stats.received_len(), PAYLOAD_LEN);
    assert_eq!(client_stats.received.lock().unwrap().as_slice(), &payload[..]);
}
