//! Proactor core: the epoll loop, the wake subsystem, batch dispatch,
//! interrupts, the global timeout, bulk disconnect, and inactivity
//! detection.
//!
//! The proactor multiplexes any number of connections and listeners onto
//! however many threads call `wait`/`get`. Each `epoll_wait` fetches a
//! single event, so every kernel event is dispatched to exactly one
//! thread; `EPOLLONESHOT` on every fd keeps a context's fds quiet until
//! the working thread rearms them.
//!
//! Lock order: connection/listener context mutex, then optionally the
//! proactor scheduler mutex, then the wake-list (eventfd) mutex. The
//! eventfd mutex and the registration table are leaves. Only the remove
//! and disconnect paths take the scheduler mutex under a context mutex;
//! no other nesting of context mutexes exists.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::batch::{Batch, BatchOwner, Event};
use crate::config::Config;
use crate::connection::{Connection, ConnectionInner};
use crate::driver::{Condition, ConnectionDriver};
use crate::error::Error;
use crate::listener::{Listener, ListenerInner};
use crate::sys::{self, EpollArm};
use crate::timer::Timer;

/// Condition name for errors originated by the proactor itself.
pub(crate) const COND_NAME: &str = "proactor";

const TOKEN_WAKE: u64 = 0;
const TOKEN_PROACTOR_TIMER: u64 = 1;
const TOKEN_DYNAMIC_BASE: u64 = 2;

/// Serialization state shared by the proactor, each connection, and each
/// listener. At most one thread is "working" a context at a time; all
/// non-I/O entries into the context go through the wake queue, on which
/// a context appears at most once.
pub(crate) struct Context {
    pub(crate) working: bool,
    pub(crate) wake_ops: u32,
    pub(crate) closing: bool,
}

impl Context {
    pub(crate) fn new() -> Context {
        Context {
            working: false,
            wake_ops: 0,
            closing: false,
        }
    }

    /// Once per pop from the wake list.
    pub(crate) fn wake_done(&mut self) {
        debug_assert!(self.wake_ops > 0);
        self.wake_ops = self.wake_ops.saturating_sub(1);
    }
}

/// A live context, as held on the proactor's contexts list.
pub(crate) enum Ctx<D: ConnectionDriver> {
    Conn(Arc<ConnectionInner<D>>),
    Listener(Arc<ListenerInner<D>>),
}

impl<D: ConnectionDriver> Ctx<D> {
    pub(crate) fn key(&self) -> usize {
        match self {
            Ctx::Conn(c) => Arc::as_ptr(c) as usize,
            Ctx::Listener(l) => Arc::as_ptr(l) as usize,
        }
    }
}

impl<D: ConnectionDriver> Clone for Ctx<D> {
    fn clone(&self) -> Self {
        match self {
            Ctx::Conn(c) => Ctx::Conn(Arc::clone(c)),
            Ctx::Listener(l) => Ctx::Listener(Arc::clone(l)),
        }
    }
}

/// An entry on the wake queue.
pub(crate) enum Waked<D: ConnectionDriver> {
    Proactor,
    Conn(Arc<ConnectionInner<D>>),
    Listener(Arc<ListenerInner<D>>),
}

/// What an epoll token resolves to. Tokens are never reused, so a stale
/// kernel event after deregistration misses the table and is dropped.
pub(crate) enum Target<D: ConnectionDriver> {
    Wake,
    ProactorTimer,
    ConnIo(Arc<ConnectionInner<D>>),
    ConnTimer(Arc<ConnectionInner<D>>),
    ListenerIo(Arc<ListenerInner<D>>, usize),
}

impl<D: ConnectionDriver> Clone for Target<D> {
    fn clone(&self) -> Self {
        match self {
            Target::Wake => Target::Wake,
            Target::ProactorTimer => Target::ProactorTimer,
            Target::ConnIo(c) => Target::ConnIo(Arc::clone(c)),
            Target::ConnTimer(c) => Target::ConnTimer(Arc::clone(c)),
            Target::ListenerIo(l, i) => Target::ListenerIo(Arc::clone(l), *i),
        }
    }
}

enum ProEvent {
    Interrupt,
    Timeout,
    Inactive,
}

/// Proactor-scope state, guarded by the scheduler mutex (the proactor's
/// own context mutex).
struct Sched<D: ConnectionDriver> {
    ctx: Context,
    /// Live contexts, for inactivity detection and teardown.
    contexts: Vec<Ctx<D>>,
    /// At most one queued proactor event at a time.
    collector: VecDeque<ProEvent>,
    /// Total pending interrupts.
    interrupts: usize,
    /// Interrupts reserved behind the one currently in the collector.
    deferred_interrupts: usize,
    /// Unfinished bulk disconnects.
    disconnects_pending: usize,
    /// Rendezvous tokens for contexts detached by a bulk disconnect:
    /// context key -> ops remaining before the free is owned.
    disconnecting: HashMap<usize, u32>,
    inactive: bool,
    timer_expired: bool,
    timer_cancelled: bool,
    timer_armed: bool,
    shutting_down: bool,
}

struct WakeQueue<D: ConnectionDriver> {
    list: VecDeque<Waked<D>>,
    in_progress: bool,
}

pub(crate) struct ProactorInner<D: ConnectionDriver> {
    epoll_fd: RawFd,
    event_fd: RawFd,
    timer: Timer,
    config: Config,
    sched: Mutex<Sched<D>>,
    /// The eventfd mutex: leaf level, never acquire another lock under it.
    wake_q: Mutex<WakeQueue<D>>,
    registry: Mutex<HashMap<u64, Target<D>>>,
    next_token: AtomicU64,
    timer_arm: Mutex<EpollArm>,
    wake_arm: Mutex<EpollArm>,
}

impl<D: ConnectionDriver> ProactorInner<D> {
    fn new(config: Config) -> io::Result<Arc<ProactorInner<D>>> {
        let epoll_fd = sys::epoll_create()?;
        let event_fd = match sys::eventfd_new() {
            Ok(fd) => fd,
            Err(e) => {
                sys::close_fd(epoll_fd);
                return Err(e);
            }
        };
        let timer = match Timer::new() {
            Ok(t) => t,
            Err(e) => {
                sys::close_fd(epoll_fd);
                sys::close_fd(event_fd);
                return Err(e);
            }
        };
        let timer_fd = timer.fd();

        let inner = Arc::new(ProactorInner {
            epoll_fd,
            event_fd,
            timer,
            config,
            sched: Mutex::new(Sched {
                ctx: Context::new(),
                contexts: Vec::new(),
                collector: VecDeque::new(),
                interrupts: 0,
                deferred_interrupts: 0,
                disconnects_pending: 0,
                disconnecting: HashMap::new(),
                inactive: false,
                timer_expired: false,
                timer_cancelled: false,
                timer_armed: true,
                shutting_down: false,
            }),
            wake_q: Mutex::new(WakeQueue {
                list: VecDeque::new(),
                in_progress: false,
            }),
            registry: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(TOKEN_DYNAMIC_BASE),
            timer_arm: Mutex::new(EpollArm {
                fd: timer_fd,
                token: TOKEN_PROACTOR_TIMER,
                wanted: sys::EPOLLIN,
                polling: true,
            }),
            wake_arm: Mutex::new(EpollArm {
                fd: event_fd,
                token: TOKEN_WAKE,
                wanted: sys::EPOLLIN,
                polling: true,
            }),
        });

        {
            let mut reg = inner.registry.lock();
            reg.insert(TOKEN_WAKE, Target::Wake);
            reg.insert(TOKEN_PROACTOR_TIMER, Target::ProactorTimer);
        }
        sys::epoll_add(epoll_fd, &inner.timer_arm.lock());
        sys::epoll_add(epoll_fd, &inner.wake_arm.lock());
        tracing::debug!("proactor created");
        Ok(inner)
    }

    pub(crate) fn epoll_fd(&self) -> RawFd {
        self.epoll_fd
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Register an fd, with a fresh never-reused token.
    pub(crate) fn start_polling(&self, arm: &mut EpollArm, target: Target<D>) {
        if arm.polling {
            return;
        }
        arm.token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().insert(arm.token, target);
        arm.polling = true;
        sys::epoll_add(self.epoll_fd, arm);
    }

    /// Deregister an fd and drop its token.
    pub(crate) fn stop_polling(&self, arm: &mut EpollArm) {
        if arm.fd == -1 || !arm.polling {
            return;
        }
        self.registry.lock().remove(&arm.token);
        sys::epoll_del(self.epoll_fd, arm);
    }

    /// Wake part 1: call with the target context's mutex held. Enqueues
    /// the context at most once; returns true when the caller must write
    /// the eventfd *after releasing the context mutex*.
    pub(crate) fn wake(&self, ctx: &mut Context, target: Waked<D>) -> bool {
        let mut notify = false;
        if ctx.wake_ops == 0 && !ctx.working {
            ctx.wake_ops += 1;
            let mut q = self.wake_q.lock();
            q.list.push_back(target);
            if !q.in_progress {
                q.in_progress = true;
                notify = true;
            }
        }
        notify
    }

    /// Wake part 2: the OS write, with no locks held.
    pub(crate) fn wake_notify(&self) {
        sys::eventfd_write(self.event_fd);
    }

    /// Consume one wake. The clearing read happens under the eventfd
    /// mutex exactly when the list empties; out-of-order reads and
    /// writes would hang the wake mechanism.
    fn wake_pop_front(&self) -> Option<Waked<D>> {
        let popped = {
            let mut q = self.wake_q.lock();
            debug_assert!(q.in_progress);
            let ctx = q.list.pop_front();
            if ctx.is_some() && q.list.is_empty() {
                sys::eventfd_read(self.event_fd);
                q.in_progress = false;
            }
            ctx
        };
        sys::rearm(self.epoll_fd, &self.wake_arm.lock());
        popped
    }

    pub(crate) fn add_context(&self, ctx: Ctx<D>) {
        self.sched.lock().contexts.push(ctx);
    }

    /// Detach a context at end of life. Returns true when the caller owns
    /// the final free; a concurrent bulk disconnect may own it instead.
    /// Call with the departing context's mutex held.
    pub(crate) fn remove_context(&self, key: usize) -> bool {
        let mut notify = false;
        let mut can_free = true;
        let mut s = self.sched.lock();
        if s.disconnecting.contains_key(&key) {
            // No longer on the contexts list.
            let ops = s.disconnecting.get_mut(&key).unwrap();
            *ops -= 1;
            if *ops == 0 {
                s.disconnecting.remove(&key);
                s.disconnects_pending -= 1;
                if s.disconnects_pending == 0 && s.contexts.is_empty() {
                    s.inactive = true;
                    notify = self.wake(&mut s.ctx, Waked::Proactor);
                }
            } else {
                // The disconnect walk still owns this context.
                can_free = false;
            }
        } else {
            s.contexts.retain(|c| c.key() != key);
            if s.contexts.is_empty() && s.disconnects_pending == 0 && !s.shutting_down {
                s.inactive = true;
                notify = self.wake(&mut s.ctx, Waked::Proactor);
            }
        }
        drop(s);
        if notify {
            self.wake_notify();
        }
        can_free
    }

    /// Refill the collector in priority order: existing events, one
    /// deferred interrupt, the timeout, one fresh interrupt (reserving
    /// the rest), then inactivity. Never more than one queued event, so
    /// interrupts stay serialized across batches.
    fn update_batch(s: &mut Sched<D>) -> bool {
        if !s.collector.is_empty() {
            return true;
        }
        if s.deferred_interrupts > 0 {
            s.deferred_interrupts -= 1;
            s.interrupts -= 1;
            s.collector.push_back(ProEvent::Interrupt);
            return true;
        }
        if s.timer_expired {
            s.timer_expired = false;
            s.collector.push_back(ProEvent::Timeout);
            return true;
        }
        let mut ec = 0;
        if s.interrupts > 0 {
            s.interrupts -= 1;
            s.collector.push_back(ProEvent::Interrupt);
            ec += 1;
            if s.interrupts > 0 {
                s.deferred_interrupts = s.interrupts;
            }
        }
        if s.inactive && ec == 0 {
            s.inactive = false;
            ec += 1;
            s.collector.push_back(ProEvent::Inactive);
        }
        ec > 0
    }

    pub(crate) fn batch_next(&self) -> Option<Event<D::Event>> {
        let mut s = self.sched.lock();
        Self::update_batch(&mut s);
        s.collector.pop_front().map(|e| match e {
            ProEvent::Interrupt => Event::Interrupt,
            ProEvent::Timeout => Event::Timeout,
            ProEvent::Inactive => Event::Inactive,
        })
    }

    /// Drive the proactor context itself, from its timer or a wake.
    fn process(this: &Arc<ProactorInner<D>>, timeout: bool) -> Option<Batch<D>> {
        let timer_fired = timeout && this.timer.on_expiry() != 0;
        let mut s = this.sched.lock();
        if timeout {
            s.timer_armed = false;
            if timer_fired && !s.timer_cancelled {
                s.timer_expired = true;
            }
        } else {
            s.ctx.wake_done();
        }
        if !s.ctx.working && Self::update_batch(&mut s) {
            s.ctx.working = true;
            drop(s);
            return Some(Batch {
                owner: BatchOwner::Proactor(Arc::clone(this)),
            });
        }
        let rearm_timer = !s.timer_armed;
        drop(s);
        if rearm_timer {
            sys::rearm(this.epoll_fd, &this.timer_arm.lock());
        }
        None
    }

    /// Completion for a proactor batch.
    pub(crate) fn proactor_done(&self) {
        let mut notify = false;
        let mut s = self.sched.lock();
        let rearm_timer = !s.timer_armed;
        s.ctx.working = false;
        Self::update_batch(&mut s);
        if !s.collector.is_empty() {
            notify = self.wake(&mut s.ctx, Waked::Proactor);
        }
        drop(s);
        if notify {
            self.wake_notify();
        }
        if rearm_timer {
            sys::rearm(self.epoll_fd, &self.timer_arm.lock());
        }
    }

    /// Interrupts do not coalesce: each call produces exactly one
    /// `Interrupt` event.
    pub(crate) fn interrupt(&self) {
        let mut s = self.sched.lock();
        s.interrupts += 1;
        let notify = self.wake(&mut s.ctx, Waked::Proactor);
        drop(s);
        if notify {
            self.wake_notify();
        }
    }

    /// A zero timeout fires through the event path, not the kernel timer.
    pub(crate) fn set_timeout(&self, millis: u64) {
        let mut notify = false;
        let mut s = self.sched.lock();
        s.timer_cancelled = false;
        if millis == 0 {
            self.timer.set(0);
            s.timer_expired = true;
            notify = self.wake(&mut s.ctx, Waked::Proactor);
        } else {
            self.timer.set(millis);
        }
        drop(s);
        if notify {
            self.wake_notify();
        }
    }

    /// Sticky: suppresses any in-flight timer fire until the next
    /// `set_timeout`.
    pub(crate) fn cancel_timeout(&self) {
        let mut s = self.sched.lock();
        s.timer_cancelled = true;
        s.timer_expired = false;
        self.timer.set(0);
    }

    fn process_inbound_wake(this: &Arc<ProactorInner<D>>) -> Option<Batch<D>> {
        match this.wake_pop_front() {
            Some(Waked::Proactor) => Self::process(this, false),
            Some(Waked::Conn(pc)) => ConnectionInner::process(&pc, 0, false, false),
            Some(Waked::Listener(l)) => ListenerInner::process(&l, 0, 0),
            None => None,
        }
    }

    /// The reactor loop: fetch one kernel event, dispatch it to the
    /// owning context, and hand back whatever batch that produced.
    pub(crate) fn do_epoll(this: &Arc<ProactorInner<D>>, can_block: bool) -> Option<Batch<D>> {
        let timeout: libc::c_int = if can_block { -1 } else { 0 };
        loop {
            let mut ev = libc::epoll_event { events: 0, u64: 0 };
            let n = unsafe { libc::epoll_wait(this.epoll_fd, &mut ev, 1, timeout) };
            if n < 0 {
                let err = sys::errno();
                if err != libc::EINTR {
                    tracing::warn!("epoll_wait failed: {}", sys::errno_string(err));
                }
                if !can_block {
                    return None;
                }
                continue;
            }
            if n == 0 {
                if !can_block {
                    return None;
                }
                tracing::warn!("epoll_wait returned no events while blocking");
                continue;
            }
            let token = ev.u64;
            let events = ev.events;
            let target = this.registry.lock().get(&token).cloned();
            let batch = match target {
                Some(Target::Wake) => Self::process_inbound_wake(this),
                Some(Target::ProactorTimer) => Self::process(this, true),
                Some(Target::ConnIo(pc)) => ConnectionInner::process(&pc, events, false, false),
                Some(Target::ConnTimer(pc)) => ConnectionInner::process(&pc, 0, true, false),
                Some(Target::ListenerIo(l, idx)) => ListenerInner::process(&l, idx, events),
                // The registration went away while this event was in
                // flight; the context is tearing down.
                None => None,
            };
            if batch.is_some() {
                return batch;
            }
            // No application event produced; poll again.
        }
    }

    /// Bulk disconnect: detach the whole contexts list, then close each
    /// context under its own mutex. `disconnect_ops` starts at 2 — the
    /// walk below and the context's own `remove_context`, in either
    /// order — and whichever decrements it to zero owns the final free.
    pub(crate) fn disconnect(this: &Arc<ProactorInner<D>>, cond: Option<&Condition>) {
        let detached: Vec<Ctx<D>> = {
            let mut s = this.sched.lock();
            let detached = std::mem::take(&mut s.contexts);
            for ctx in &detached {
                s.disconnecting.insert(ctx.key(), 2);
                s.disconnects_pending += 1;
            }
            detached
        };
        if detached.is_empty() {
            return;
        }
        tracing::debug!(contexts = detached.len(), "bulk disconnect");

        let mut notify_proactor = false;
        for ctx in &detached {
            let mut do_free = false;
            let mut ctx_notify = false;
            match ctx {
                Ctx::Conn(pc) => {
                    let mut cst = pc.state.lock();
                    if !cst.ctx.closing {
                        if cst.ctx.working {
                            // A working thread owns the driver; defer.
                            cst.queued_disconnect = true;
                            if let Some(c) = cond {
                                cst.disconnect_condition = Some(c.clone());
                            }
                        } else {
                            pc.disconnect_now(cond);
                        }
                    }
                    // Documented lock-order exception: context mutex
                    // held, then the proactor mutex.
                    let owns_free = {
                        let mut s = this.sched.lock();
                        Self::disconnect_account(this, &mut s, ctx.key(), &mut notify_proactor)
                    };
                    if owns_free {
                        do_free = true;
                    } else {
                        // The context will do the free; wake it.
                        ctx_notify = this.wake(&mut cst.ctx, Waked::Conn(Arc::clone(pc)));
                    }
                    drop(cst);
                }
                Ctx::Listener(l) => {
                    let mut lst = l.state.lock();
                    if !lst.ctx.closing {
                        if let Some(c) = cond {
                            lst.condition = Some(c.clone());
                        }
                        ListenerInner::begin_close(&mut lst);
                    }
                    let owns_free = {
                        let mut s = this.sched.lock();
                        Self::disconnect_account(this, &mut s, ctx.key(), &mut notify_proactor)
                    };
                    if owns_free {
                        do_free = true;
                    } else {
                        ctx_notify = this.wake(&mut lst.ctx, Waked::Listener(Arc::clone(l)));
                    }
                    drop(lst);
                }
            }
            if do_free {
                match ctx {
                    Ctx::Conn(pc) => pc.final_free(),
                    Ctx::Listener(l) => l.final_free(),
                }
            } else if ctx_notify {
                this.wake_notify();
            }
        }
        if notify_proactor {
            this.wake_notify();
        }
    }

    /// Decrement a detached context's rendezvous token under the
    /// scheduler mutex. Returns true when this caller owns the free.
    fn disconnect_account(
        this: &ProactorInner<D>,
        s: &mut Sched<D>,
        key: usize,
        notify_proactor: &mut bool,
    ) -> bool {
        let ops = s
            .disconnecting
            .get_mut(&key)
            .expect("disconnect accounting");
        *ops -= 1;
        if *ops > 0 {
            return false;
        }
        s.disconnecting.remove(&key);
        s.disconnects_pending -= 1;
        if s.disconnects_pending == 0 && s.contexts.is_empty() {
            s.inactive = true;
            if this.wake(&mut s.ctx, Waked::Proactor) {
                *notify_proactor = true;
            }
        }
        true
    }

    /// Forced teardown of everything still alive. Caller guarantees no
    /// worker threads and no outstanding batches.
    fn shutdown(this: &Arc<ProactorInner<D>>) {
        let snapshot: Vec<Ctx<D>> = {
            let mut s = this.sched.lock();
            s.shutting_down = true;
            s.contexts.clone()
        };
        for ctx in snapshot {
            match ctx {
                Ctx::Conn(pc) => ConnectionInner::forced_shutdown(&pc),
                Ctx::Listener(l) => ListenerInner::forced_shutdown(&l),
            }
        }
        // Anything still parked on the wake queue dies with it.
        this.wake_q.lock().list.clear();
    }
}

impl<D: ConnectionDriver> Drop for ProactorInner<D> {
    fn drop(&mut self) {
        sys::close_fd(self.epoll_fd);
        sys::close_fd(self.event_fd);
    }
}

/// The proactor: a multithreaded epoll reactor delivering serialized
/// per-context event batches.
///
/// Any number of threads may call [`wait`](Proactor::wait) and
/// [`get`](Proactor::get) concurrently; each returned [`Batch`] belongs
/// to one context (a connection, a listener, or the proactor itself) and
/// must be handed back with [`done`](Proactor::done) when drained.
pub struct Proactor<D: ConnectionDriver> {
    inner: Arc<ProactorInner<D>>,
}

impl<D: ConnectionDriver> Proactor<D> {
    pub fn new() -> Result<Proactor<D>, Error> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Proactor<D>, Error> {
        Ok(Proactor {
            inner: ProactorInner::new(config)?,
        })
    }

    /// Block until some context has a batch of events.
    pub fn wait(&self) -> Batch<D> {
        loop {
            if let Some(b) = ProactorInner::do_epoll(&self.inner, true) {
                return b;
            }
        }
    }

    /// Non-blocking variant of [`wait`](Proactor::wait).
    pub fn get(&self) -> Option<Batch<D>> {
        ProactorInner::do_epoll(&self.inner, false)
    }

    /// Return a drained batch. Releases the owning context's working
    /// claim, re-examines its pending state, and rearms its fds.
    pub fn done(&self, batch: Batch<D>) {
        match batch.owner {
            BatchOwner::Connection(pc) => ConnectionInner::done(&pc),
            BatchOwner::Listener(l) => ListenerInner::done(&l),
            BatchOwner::Proactor(p) => {
                debug_assert!(Arc::ptr_eq(&p, &self.inner), "batch from another proactor");
                p.proactor_done();
            }
        }
    }

    /// Post one `Interrupt` event. Never coalesced: N calls produce
    /// exactly N events, in order, across subsequent batches.
    pub fn interrupt(&self) {
        self.inner.interrupt();
    }

    /// Arm the global timeout. Zero fires immediately through the event
    /// path.
    pub fn set_timeout(&self, millis: u64) {
        self.inner.set_timeout(millis);
    }

    /// Cancel the global timeout. Sticky: a fire already in flight is
    /// suppressed until the next `set_timeout`.
    pub fn cancel_timeout(&self) {
        self.inner.cancel_timeout();
    }

    /// Close every connection and listener, each with a copy of `cond`.
    /// A single `Inactive` event follows once all of them are torn down.
    pub fn disconnect(&self, cond: Option<&Condition>) {
        ProactorInner::disconnect(&self.inner, cond);
    }

    /// Start an outbound connection. Progress and errors are reported
    /// through the connection's transport events.
    pub fn connect(&self, driver: D, addr: &str) -> Connection<D> {
        tracing::debug!(addr, "connecting");
        let pc = ConnectionInner::new(&self.inner, driver, false, addr);
        self.inner.add_context(Ctx::Conn(Arc::clone(&pc)));
        ConnectionInner::connect(&pc);
        Connection::from_inner(pc)
    }

    /// Bind and listen on every address `addr` resolves to. Success or
    /// failure is reported through the listener's events and condition;
    /// a `ListenerOpen` event is always posted.
    pub fn listen(&self, listener: &Listener<D>, addr: &str, backlog: i32) {
        ListenerInner::listen(listener.inner(), &self.inner, addr, backlog);
    }
}

impl<D: ConnectionDriver> Drop for Proactor<D> {
    fn drop(&mut self) {
        ProactorInner::shutdown(&self.inner);
    }
}
