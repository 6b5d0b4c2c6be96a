//! External wake storm: many threads hammering `Connection::wake` must
//! coalesce into at most one `ConnectionWake` per drain cycle, and the
//! eventfd must end up cleared rather than wedged.

mod common;

use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use amphora::{Event, Proactor};
use common::{Stats, TestDriver};

const WAKER_THREADS: usize = 10;
const WAKES_PER_THREAD: usize = 1000;

#[test]
fn wake_storm_coalesces() {
    // A plain std listener stands in for the remote peer.
    let peer = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer_addr = peer.local_addr().unwrap();
    let peer_thread = thread::spawn(move || peer.accept().map(|(s, _)| s));

    let proactor: Proactor<TestDriver> = Proactor::new().unwrap();
    let stats = Arc::new(Stats::default());
    let conn = proactor.connect(
        TestDriver::idle(stats.clone()),
        &format!("127.0.0.1:{}", peer_addr.port()),
    );
    let _peer_sock = peer_thread.join().unwrap().unwrap();

    let mut wakes_seen = 0usize;
    let mut drains = 0usize;

    thread::scope(|s| {
        for _ in 0..WAKER_THREADS {
            s.spawn(|| {
                for _ in 0..WAKES_PER_THREAD {
                    conn.wake();
                }
            });
        }

        // Drain while the storm runs.
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            assert!(Instant::now() < deadline, "wake storm test timed out");
            match proactor.get() {
                Some(mut batch) => {
                    drains += 1;
                    let mut in_batch = 0;
                    while let Some(event) = batch.next_event() {
                        if event == Event::ConnectionWake {
                            in_batch += 1;
                        }
                    }
                    proactor.done(batch);
                    // One coalesced wake per drain cycle; a batch spans
                    // at most 1 + hog_max cycles via top-up.
                    assert!(in_batch <= 4, "wake events not coalesced");
                    wakes_seen += in_batch;
                }
                None => {
                    if wakes_seen > 0 {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    });
    // All waker threads joined; settle any stragglers.
    let quiet = Instant::now() + Duration::from_millis(100);
    while Instant::now() < quiet {
        if let Some(mut batch) = proactor.get() {
            drains += 1;
            while let Some(event) = batch.next_event() {
                if event == Event::ConnectionWake {
                    wakes_seen += 1;
                }
            }
            proactor.done(batch);
        } else {
            thread::sleep(Duration::from_millis(1));
        }
    }

    assert!(wakes_seen >= 1);
    // Coalescing must have collapsed the storm by orders of magnitude.
    assert!(
        wakes_seen <= drains * 4 && wakes_seen < WAKER_THREADS * WAKES_PER_THREAD / 2,
        "wake storm not coalesced: {wakes_seen} events in {drains} drains"
    );

    // Tear down: release the connection and expect a single Inactive,
    // proving the eventfd was left in a sane state.
    conn.release();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut inactives = 0;
    while inactives == 0 {
        assert!(Instant::now() < deadline, "no Inactive after release");
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

    drop(conn);
    assert_eq!(stats.drops.load(Ordering::SeqCst), 1);
}
