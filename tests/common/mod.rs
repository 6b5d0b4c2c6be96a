//! Shared test driver: a minimal in-memory protocol engine that can echo
//! inbound bytes, preload outbound data, or sit idle, while recording
//! everything the proactor tells it.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use amphora::{Condition, ConnectionDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestEvent {
    Data,
    Closed,
    Error,
}

/// Shared observation point for one side of a test.
#[derive(Default)]
pub struct Stats {
    pub received: Mutex<Vec<u8>>,
    pub errors: Mutex<Vec<Condition>>,
    pub drops: AtomicUsize,
}

impl Stats {
    pub fn received_len(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

pub struct TestDriver {
    buf: Box<[u8]>,
    out: Vec<u8>,
    events: VecDeque<TestEvent>,
    rclosed: bool,
    wclose_requested: bool,
    closed: bool,
    echo: bool,
    stats: Arc<Stats>,
}

impl TestDriver {
    fn base(stats: Arc<Stats>) -> TestDriver {
        TestDriver {
            buf: vec![0u8; 16 * 1024].into_boxed_slice(),
            out: Vec::new(),
            events: VecDeque::new(),
            rclosed: false,
            wclose_requested: false,
            closed: false,
            echo: false,
            stats,
        }
    }

    /// Echo every inbound byte back; close after the peer half-closes.
    pub fn echo(stats: Arc<Stats>) -> TestDriver {
        let mut d = Self::base(stats);
        d.echo = true;
        d
    }

    /// Send `payload`, then close the write side once it is flushed.
    pub fn client(payload: Vec<u8>, stats: Arc<Stats>) -> TestDriver {
        let mut d = Self::base(stats);
        d.out = payload;
        d.wclose_requested = true;
        d
    }

    /// No traffic; stays open until closed or released.
    pub fn idle(stats: Arc<Stats>) -> TestDriver {
        Self::base(stats)
    }
}

impl ConnectionDriver for TestDriver {
    type Event = TestEvent;

    fn read_buffer(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn read_done(&mut self, n: usize) {
        let data = &self.buf[..n];
        self.stats.received.lock().unwrap().extend_from_slice(data);
        if self.echo {
            self.out.extend_from_slice(data);
        }
        self.events.push_back(TestEvent::Data);
    }

    fn read_close(&mut self) {
        if !self.rclosed {
            self.rclosed = true;
            // Peer half-closed: flush what we have and close our side.
            self.wclose_requested = true;
            self.events.push_back(TestEvent::Closed);
        }
    }

    fn read_closed(&self) -> bool {
        self.closed || self.rclosed
    }

    fn write_buffer(&self) -> &[u8] {
        &self.out
    }

    fn write_done(&mut self, n: usize) {
        self.out.drain(..n);
    }

    fn write_close(&mut self) {
        self.wclose_requested = true;
    }

    fn write_closed(&self) -> bool {
        self.closed || (self.wclose_requested && self.out.is_empty())
    }

    fn next_event(&mut self) -> Option<TestEvent> {
        self.events.pop_front()
    }

    fn has_event(&self) -> bool {
        !self.events.is_empty()
    }

    fn finished(&self) -> bool {
        self.read_closed() && self.write_closed() && self.events.is_empty()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.rclosed = true;
            self.out.clear();
            self.events.push_back(TestEvent::Closed);
        }
    }

    fn set_error(&mut self, condition: Condition) {
        self.stats.errors.lock().unwrap().push(condition);
        self.events.push_back(TestEvent::Error);
    }
}

impl Drop for TestDriver {
    fn drop(&mut self) {
        self.stats.drops.fetch_add(1, Ordering::SeqCst);
    }
}
