//! Event batches: the owned handle returned by `wait`/`get` that yields
//! events for exactly one context until drained and returned via `done`.

use std::sync::Arc;

use crate::connection::{Connection, ConnectionInner};
use crate::driver::ConnectionDriver;
use crate::listener::{Listener, ListenerInner};
use crate::proactor::ProactorInner;

/// An event delivered through a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<E> {
    /// A transport-level event produced by the connection driver.
    Transport(E),
    /// Coalesced external wakes: posted at most once per drain cycle no
    /// matter how many `Connection::wake` calls accumulated.
    ConnectionWake,
    ListenerOpen,
    ListenerAccept,
    ListenerClose,
    /// One per `Proactor::interrupt` call, never coalesced.
    Interrupt,
    /// The proactor timeout elapsed (or was set to zero).
    Timeout,
    /// The last connection or listener was torn down and no disconnects
    /// are pending.
    Inactive,
}

/// A batch of events belonging to a single context. Drain it with
/// `next_event` and hand it back with [`crate::Proactor::done`]; the
/// owning context stays serialized to the draining thread until then.
pub struct Batch<D: ConnectionDriver> {
    pub(crate) owner: BatchOwner<D>,
}

pub(crate) enum BatchOwner<D: ConnectionDriver> {
    Proactor(Arc<ProactorInner<D>>),
    Connection(Arc<ConnectionInner<D>>),
    Listener(Arc<ListenerInner<D>>),
}

impl<D: ConnectionDriver> Batch<D> {
    pub fn next_event(&mut self) -> Option<Event<D::Event>> {
        match &self.owner {
            BatchOwner::Proactor(p) => p.batch_next(),
            BatchOwner::Connection(c) => ConnectionInner::batch_next(c),
            BatchOwner::Listener(l) => l.batch_next(),
        }
    }

    /// The connection this batch belongs to, if it is a connection batch.
    pub fn connection(&self) -> Option<Connection<D>> {
        match &self.owner {
            BatchOwner::Connection(c) => Some(Connection::from_inner(Arc::clone(c))),
            _ => None,
        }
    }

    /// The listener this batch belongs to, if it is a listener batch.
    pub fn listener(&self) -> Option<Listener<D>> {
        match &self.owner {
            BatchOwner::Listener(l) => Some(Listener::from_inner(Arc::clone(l))),
            _ => None,
        }
    }
}
