//! The connection-driver contract.
//!
//! The proactor moves bytes and schedules work; the driver is the
//! protocol engine that consumes inbound bytes, produces outbound bytes,
//! and emits its own transport-level events. One driver instance is owned
//! by each connection and is only ever called from that connection's
//! working thread.

use std::fmt;

/// An error condition attached to a connection or listener: a symbolic
/// name plus a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub name: String,
    pub description: String,
}

impl Condition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Condition {
        Condition {
            name: name.into(),
            description: description.into(),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.description)
    }
}

/// Protocol engine driven by the proactor's read/write pump.
///
/// Contract notes:
/// - `read_buffer` exposes writable capacity; after the proactor reads
///   `n` bytes into it, `read_done(n)` is called.
/// - `write_buffer` exposes pending output; after the proactor writes
///   `n` bytes from it, `write_done(n)` is called.
/// - `close` must be idempotent.
/// - `finished` is true once both directions are closed and no events
///   remain; the proactor then tears the connection down.
/// - `tick` is consulted only when `has_idle_timeout` is true; it returns
///   the next deadline in monotonic milliseconds (see [`crate::now_ms`]),
///   or 0 for none.
pub trait ConnectionDriver: Send + 'static {
    /// Transport-level event type yielded through connection batches.
    type Event: Send;

    fn read_buffer(&mut self) -> &mut [u8];
    fn read_done(&mut self, n: usize);
    fn read_close(&mut self);
    fn read_closed(&self) -> bool;

    fn write_buffer(&self) -> &[u8];
    fn write_done(&mut self, n: usize);
    fn write_close(&mut self);
    fn write_closed(&self) -> bool;

    fn next_event(&mut self) -> Option<Self::Event>;
    fn has_event(&self) -> bool;
    fn finished(&self) -> bool;

    fn close(&mut self);
    fn set_error(&mut self, condition: Condition);

    /// Called once on accepted connections before any I/O.
    fn set_server(&mut self) {}

    /// The application has released the connection; the proactor will
    /// close and tear down.
    fn released(&mut self) {}

    fn has_idle_timeout(&self) -> bool {
        false
    }

    fn tick(&mut self, _now_ms: u64) -> u64 {
        0
    }
}
