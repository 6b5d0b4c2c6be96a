//! An epoll-backed multithreaded proactor for AMQP-style connections
//! and listeners.
//!
//! The proactor multiplexes an arbitrary number of connections and
//! listeners onto a small pool of worker threads. Workers call
//! [`Proactor::wait`] (or [`Proactor::get`]), drain the returned
//! [`Batch`] one [`Event`] at a time, and hand it back with
//! [`Proactor::done`]. Event delivery is serialized per context — one
//! thread at a time ever works a given connection or listener — while
//! distinct contexts run freely in parallel.
//!
//! The protocol engine itself is external: each connection owns a
//! [`ConnectionDriver`] that consumes inbound bytes, produces outbound
//! bytes, and emits transport-level events through the batch.
//!
//! ```no_run
//! use amphora::{Event, Listener, Proactor};
//! # use amphora::{Condition, ConnectionDriver};
//! # struct MyDriver;
//! # impl ConnectionDriver for MyDriver {
//! #     type Event = ();
//! #     fn read_buffer(&mut self) -> &mut [u8] { &mut [] }
//! #     fn read_done(&mut self, _: usize) {}
//! #     fn read_close(&mut self) {}
//! #     fn read_closed(&self) -> bool { true }
//! #     fn write_buffer(&self) -> &[u8] { &[] }
//! #     fn write_done(&mut self, _: usize) {}
//! #     fn write_close(&mut self) {}
//! #     fn write_closed(&self) -> bool { true }
//! #     fn next_event(&mut self) -> Option<()> { None }
//! #     fn has_event(&self) -> bool { false }
//! #     fn finished(&self) -> bool { true }
//! #     fn close(&mut self) {}
//! #     fn set_error(&mut self, _: Condition) {}
//! # }
//!
//! let proactor: Proactor<MyDriver> = Proactor::new().unwrap();
//! let listener = Listener::new();
//! proactor.listen(&listener, "127.0.0.1:0", 16);
//! loop {
//!     let mut batch = proactor.wait();
//!     while let Some(event) = batch.next_event() {
//!         match event {
//!             Event::ListenerAccept => {
//!                 listener.accept(MyDriver).unwrap();
//!             }
//!             Event::Inactive => return,
//!             _ => {}
//!         }
//!     }
//!     proactor.done(batch);
//! }
//! ```

mod addr;
mod batch;
mod config;
mod connection;
mod driver;
mod error;
mod listener;
mod proactor;
mod sys;
mod timer;

pub use addr::NetAddr;
pub use batch::{Batch, Event};
pub use config::Config;
pub use connection::Connection;
pub use driver::{Condition, ConnectionDriver};
pub use error::Error;
pub use listener::Listener;
pub use proactor::Proactor;
pub use sys::now_ms;
