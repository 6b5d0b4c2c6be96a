//! Per-connection state machine: non-blocking connect with address
//! fallback, the read/write pump, tick timer, wake coalescing, and
//! close/teardown.
//!
//! A connection is one serialization context. State splits two ways:
//! the context mutex guards the merge state that any thread may touch
//! (pending epoll events, wake and tick flags, close bookkeeping), while
//! the io mutex guards everything only the working thread drives (the
//! driver, blocked flags, the armed mask, the socket itself). Lock order
//! is context before io; the io mutex is never held while acquiring the
//! context mutex.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::{self, NetAddr, SockAddr};
use crate::batch::{Batch, BatchOwner, Event};
use crate::driver::{Condition, ConnectionDriver};
use crate::proactor::{Context, ProactorInner, Target, Waked, COND_NAME};
use crate::sys::{self, EpollArm};
use crate::timer::Timer;

/// Merge state, guarded by the context mutex.
pub(crate) struct ConnShared {
    pub(crate) ctx: Context,
    /// Epoll events received but not yet processed.
    new_events: u32,
    /// Pending coalesced external wakes.
    wake_count: u32,
    /// The per-connection timer fired.
    tick_pending: bool,
    timer_armed: bool,
    /// Bulk disconnect arrived while another thread was working.
    pub(crate) queued_disconnect: bool,
    pub(crate) disconnect_condition: Option<Condition>,
}

/// Working-thread-only state, guarded by the io mutex.
pub(crate) struct ConnIo<D: ConnectionDriver> {
    pub(crate) driver: D,
    fd: libc::c_int,
    sock_arm: EpollArm,
    timer_arm: EpollArm,
    /// The mask last armed in epoll.
    current_arm: u32,
    connected: bool,
    read_blocked: bool,
    write_blocked: bool,
    disconnected: bool,
    hog_count: u32,
    /// A coalesced CONNECTION_WAKE event awaits delivery.
    wake_event_pending: bool,
    addrs: Vec<SockAddr>,
    addr_cursor: usize,
    local: NetAddr,
    remote: NetAddr,
    finalized: bool,
}

pub(crate) struct ConnectionInner<D: ConnectionDriver> {
    pub(crate) proactor: Arc<ProactorInner<D>>,
    timer: Timer,
    host: Option<String>,
    port: String,
    pub(crate) state: Mutex<ConnShared>,
    pub(crate) io: Mutex<ConnIo<D>>,
}

impl<D: ConnectionDriver> ConnectionInner<D> {
    pub(crate) fn new(
        proactor: &Arc<ProactorInner<D>>,
        mut driver: D,
        server: bool,
        addr: &str,
    ) -> Arc<ConnectionInner<D>> {
        let (host, port) = addr::parse(addr);
        if server {
            driver.set_server();
        }
        let timer = match Timer::new() {
            Ok(t) => t,
            Err(_) => sys::fatal!("timerfd setup"),
        };
        Arc::new(ConnectionInner {
            proactor: Arc::clone(proactor),
            timer,
            host,
            port,
            state: Mutex::new(ConnShared {
                ctx: Context::new(),
                new_events: 0,
                wake_count: 0,
                tick_pending: false,
                timer_armed: false,
                queued_disconnect: false,
                disconnect_condition: None,
            }),
            io: Mutex::new(ConnIo {
                driver,
                fd: -1,
                sock_arm: EpollArm::unregistered(),
                timer_arm: EpollArm::unregistered(),
                current_arm: 0,
                connected: false,
                read_blocked: true,
                write_blocked: true,
                disconnected: false,
                hog_count: 0,
                wake_event_pending: false,
                addrs: Vec::new(),
                addr_cursor: 0,
                local: NetAddr::unspecified(),
                remote: NetAddr::unspecified(),
                finalized: false,
            }),
        })
    }

    pub(crate) fn key(this: &Arc<ConnectionInner<D>>) -> usize {
        Arc::as_ptr(this) as usize
    }

    fn batch(this: &Arc<ConnectionInner<D>>) -> Batch<D> {
        Batch {
            owner: BatchOwner::Connection(Arc::clone(this)),
        }
    }

    /// Begin the outbound connect: resolve, then walk the address list.
    /// Called by `Proactor::connect` with the context mutex held.
    pub(crate) fn connect(this: &Arc<ConnectionInner<D>>) {
        let mut st = this.state.lock();
        let mut notify = false;
        match addr::resolve(this.host.as_deref(), &this.port, false) {
            Ok(addrs) => {
                let mut io = this.io.lock();
                io.addrs = addrs;
                io.addr_cursor = 0;
                Self::maybe_connect(this, &mut io);
                if io.disconnected {
                    drop(io);
                    notify = this.proactor.wake(&mut st.ctx, Waked::Conn(Arc::clone(this)));
                }
            }
            Err(e) => {
                let mut io = this.io.lock();
                let desc = format!(
                    "connect to {}:{}: {}",
                    this.host.as_deref().unwrap_or(""),
                    this.port,
                    e
                );
                tracing::debug!("{desc}");
                io.driver.set_error(Condition::new(COND_NAME, desc));
                io.driver.close();
                drop(io);
                notify = this.proactor.wake(&mut st.ctx, Waked::Conn(Arc::clone(this)));
            }
        }
        drop(st);
        if notify {
            this.proactor.wake_notify();
        }
    }

    /// Fail a connection that never got a socket (e.g. a failed accept):
    /// record the error, close the driver, and wake the context so a
    /// worker delivers the error events and reaps it.
    pub(crate) fn fail(this: &Arc<ConnectionInner<D>>, err: i32, what: &str) {
        let notify = {
            let mut st = this.state.lock();
            {
                let mut io = this.io.lock();
                this.error_and_close(&mut io, err, what);
            }
            this.proactor.wake(&mut st.ctx, Waked::Conn(Arc::clone(this)))
        };
        if notify {
            this.proactor.wake_notify();
        }
    }

    /// Adopt an accepted socket and start polling. The listener mutex is
    /// not held here; only this connection's locks are taken.
    pub(crate) fn accepted(this: &Arc<ConnectionInner<D>>, fd: libc::c_int) {
        let _st = this.state.lock();
        let mut io_g = this.io.lock();
        let io = &mut *io_g;
        sys::configure_socket(fd, this.proactor.config().tcp_nodelay);
        io.fd = fd;
        io.connected = true;
        Self::start(this, io);
    }

    /// Report a socket-level error on this connection: bind the condition
    /// into the transport and close the driver.
    fn error_and_close(&self, io: &mut ConnIo<D>, err: i32, what: &str) {
        let desc = format!(
            "{} {}:{}: {}",
            what,
            self.host.as_deref().unwrap_or(""),
            self.port,
            sys::errno_string(err)
        );
        tracing::debug!("connection error: {desc}");
        io.driver.set_error(Condition::new(COND_NAME, desc));
        io.driver.close();
    }

    /// Called on initial connect, and after HUP/ERR to try the next
    /// resolved address. Exhaustion produces a transport error.
    fn maybe_connect(this: &Arc<ConnectionInner<D>>, io: &mut ConnIo<D>) {
        if !io.connected {
            while io.addr_cursor < io.addrs.len() {
                let ai = io.addrs[io.addr_cursor];
                io.addr_cursor += 1;
                let fd = unsafe { libc::socket(ai.family, libc::SOCK_STREAM, 0) };
                if fd < 0 {
                    continue;
                }
                sys::configure_socket(fd, this.proactor.config().tcp_nodelay);
                let rc = unsafe { libc::connect(fd, ai.as_ptr(), ai.len) };
                if rc == 0 || sys::errno() == libc::EINPROGRESS {
                    // A previous attempt's socket is done for.
                    this.proactor.stop_polling(&mut io.sock_arm);
                    if io.fd >= 0 {
                        sys::close_fd(io.fd);
                    }
                    io.fd = fd;
                    Self::start(this, io);
                    return; // async connection started
                }
                sys::close_fd(fd);
                // connect failed immediately, try the next address
            }
            io.addrs.clear();
            io.addr_cursor = 0;
            let err = if io.fd >= 0 {
                sys::socket_error(io.fd)
            } else {
                sys::errno()
            };
            this.error_and_close(
                io,
                if err != 0 { err } else { libc::ENOTCONN },
                "on connect",
            );
        }
        io.disconnected = true;
    }

    /// A non-error epoll event means the socket is connected.
    fn mark_connected(&self, io: &mut ConnIo<D>) {
        if !io.connected {
            io.connected = true;
            io.addrs.clear();
            io.addr_cursor = 0;
        }
    }

    /// Register the socket (and, once, the timer) with epoll and capture
    /// the endpoint addresses.
    fn start(this: &Arc<ConnectionInner<D>>, io: &mut ConnIo<D>) {
        let p = &this.proactor;
        if !io.timer_arm.polling {
            io.timer_arm = EpollArm {
                fd: this.timer.fd(),
                token: 0,
                wanted: sys::EPOLLIN,
                polling: false,
            };
            p.start_polling(&mut io.timer_arm, Target::ConnTimer(Arc::clone(this)));
        }
        io.local = NetAddr::local_of(io.fd);
        io.remote = NetAddr::peer_of(io.fd);
        io.sock_arm = EpollArm {
            fd: io.fd,
            token: 0,
            wanted: sys::EPOLLIN | sys::EPOLLOUT,
            polling: false,
        };
        p.start_polling(&mut io.sock_arm, Target::ConnIo(Arc::clone(this)));
        io.current_arm = sys::EPOLLIN | sys::EPOLLOUT;
    }

    /// The tick contract: when the transport runs an idle timeout, ask
    /// the driver for the next deadline and arm the connection timer.
    fn tick_io(&self, io: &mut ConnIo<D>) {
        if io.driver.has_idle_timeout() {
            self.timer.set(0);
            let now = sys::now_ms();
            let next = io.driver.tick(now);
            if next > 0 {
                self.timer.set(next.saturating_sub(now).max(1));
            }
        }
    }

    /// Compute the wanted epoll mask from the pump state. Never arms a
    /// zero mask: a zero mask still delivers HUP/ERR and muddles
    /// teardown, so closed directions rely on read/write returning 0/-1.
    fn rearm_check(&self, io: &mut ConnIo<D>) -> bool {
        let rclosed = io.driver.read_closed();
        let wclosed = io.driver.write_closed();
        if rclosed && wclosed {
            return false;
        }
        let mut wanted = 0;
        if io.read_blocked && !rclosed {
            wanted |= sys::EPOLLIN;
        }
        if !wclosed && (io.write_blocked || !io.driver.write_buffer().is_empty()) {
            wanted |= sys::EPOLLOUT;
        }
        if wanted == 0 || io.current_arm == wanted {
            return false;
        }
        io.sock_arm.wanted = wanted;
        io.current_arm = wanted;
        true
    }

    fn rearm_sock(&self) {
        let io = self.io.lock();
        sys::rearm(self.proactor.epoll_fd(), &io.sock_arm);
    }

    /// All possible outstanding epoll, timer, and wake events for this
    /// connection have been processed. Call with the context mutex held
    /// and `closing` true.
    fn is_final(&self, st: &ConnShared) -> bool {
        let io = self.io.lock();
        io.current_arm == 0 && self.timer.pending() == 0 && st.ctx.wake_ops == 0
    }

    fn work_pending(&self, st: &ConnShared) -> bool {
        if st.new_events != 0 || st.wake_count > 0 || st.tick_pending || st.queued_disconnect {
            return true;
        }
        let io = self.io.lock();
        if !io.read_blocked && !io.driver.read_closed() {
            return true;
        }
        !io.write_blocked && !io.driver.write_closed() && !io.driver.write_buffer().is_empty()
    }

    /// Stop socket polling and close the driver. Call with the context
    /// mutex held (or from forced shutdown).
    pub(crate) fn begin_close(&self, st: &mut ConnShared) {
        if !st.ctx.closing {
            st.ctx.closing = true;
            {
                let mut io_g = self.io.lock();
                let io = &mut *io_g;
                self.proactor.stop_polling(&mut io.sock_arm);
                io.current_arm = 0;
                io.driver.close();
            }
            self.timer.set(0);
        }
    }

    /// Call without locks, and only once `is_final` held under the
    /// context mutex.
    fn cleanup(this: &Arc<ConnectionInner<D>>) {
        {
            let mut io_g = this.io.lock();
            let io = &mut *io_g;
            this.proactor.stop_polling(&mut io.timer_arm);
            if io.fd >= 0 {
                sys::close_fd(io.fd);
                io.fd = -1;
            }
        }
        let can_free = {
            let _st = this.state.lock();
            this.proactor.remove_context(Self::key(this))
        };
        if can_free {
            this.final_free();
        }
        // else the bulk-disconnect walk owns the final free
    }

    pub(crate) fn final_free(&self) {
        let mut io = self.io.lock();
        debug_assert!(!io.finalized, "connection freed twice");
        io.finalized = true;
        tracing::debug!(remote = %io.remote, "connection finalized");
    }

    /// Called by proactor teardown: no competing threads, no further
    /// epoll activity.
    pub(crate) fn forced_shutdown(this: &Arc<ConnectionInner<D>>) {
        {
            let mut st = this.state.lock();
            this.begin_close(&mut st);
            st.ctx.wake_ops = 0;
        }
        this.timer.force_clear();
        Self::cleanup(this);
    }

    /// Drive the connection. Re-entrant from four sources: socket I/O
    /// (`events != 0`), the timer (`timeout`), an inbound wake (neither),
    /// and batch top-up (`topup`, only from the batch owner). Exactly one
    /// thread becomes or remains the working thread; the others merge
    /// their inputs and return immediately.
    pub(crate) fn process(
        this: &Arc<ConnectionInner<D>>,
        events: u32,
        timeout: bool,
        topup: bool,
    ) -> Option<Batch<D>> {
        let inbound_wake = events == 0 && !timeout && !topup;
        let mut timer_unarmed = false;
        let mut waking = false;
        let mut tick_required = false;

        // Don't touch data exclusive to the working thread yet.
        let timer_fired = timeout && this.timer.on_expiry() != 0;
        if timeout {
            timer_unarmed = true;
        }

        let mut st = this.state.lock();

        if events != 0 {
            st.new_events = events;
        } else if timer_fired {
            st.tick_pending = true;
        } else if inbound_wake {
            st.ctx.wake_done();
        }

        if timer_unarmed {
            st.timer_armed = false;
        }

        if topup {
            // Only the batch owner tops up; it is already working.
            debug_assert!(st.ctx.working);
        } else {
            if st.ctx.working {
                // Another thread is the working context.
                return None;
            }
            st.ctx.working = true;
        }

        // Confirmed as the working thread.
        if st.ctx.closing && this.is_final(&st) {
            drop(st);
            Self::cleanup(this);
            return None;
        }

        loop {
            let unarmed;
            {
                let mut io_g = this.io.lock();
                let io = &mut *io_g;

                if st.queued_disconnect {
                    st.queued_disconnect = false;
                    if !st.ctx.closing {
                        if let Some(cond) = st.disconnect_condition.take() {
                            io.driver.set_error(cond);
                        }
                        io.driver.close();
                    }
                }

                if io.wake_event_pending || io.driver.has_event() {
                    return Some(Self::batch(this));
                }

                let closed = io.driver.read_closed() && io.driver.write_closed();
                if st.wake_count > 0 {
                    waking = !closed;
                    st.wake_count = 0;
                }
                if st.tick_pending {
                    st.tick_pending = false;
                    tick_required = !closed;
                }

                if st.new_events != 0 {
                    let ne = st.new_events;
                    st.new_events = 0;
                    if ne & (sys::EPOLLHUP | sys::EPOLLERR) != 0
                        && !io.driver.read_closed()
                        && !io.driver.write_closed()
                    {
                        Self::maybe_connect(this, io);
                    } else {
                        this.mark_connected(io);
                    }
                    if ne & sys::EPOLLOUT != 0 {
                        io.write_blocked = false;
                    }
                    if ne & sys::EPOLLIN != 0 {
                        io.read_blocked = false;
                    }
                    io.current_arm = 0;
                }
                unarmed = io.current_arm == 0;
            }
            if !st.timer_armed {
                st.timer_armed = true; // about to rearm outside the lock
                timer_unarmed = true;
            }
            drop(st);

            // Working-thread section: context mutex released, io mutex
            // held across the pump (ordinarily uncontended).
            {
                let mut io_g = this.io.lock();
                let io = &mut *io_g;
                io.hog_count += 1;

                if timer_unarmed {
                    sys::rearm(this.proactor.epoll_fd(), &io.timer_arm);
                    timer_unarmed = false;
                }
                if waking {
                    io.wake_event_pending = true;
                    waking = false;
                }

                // read... tick... write
                if !io.driver.read_closed() && !io.read_blocked {
                    let fd = io.fd;
                    let (result, cap) = {
                        let rbuf = io.driver.read_buffer();
                        if rbuf.is_empty() {
                            (None, 0)
                        } else {
                            let cap = rbuf.len();
                            let n = unsafe {
                                libc::read(fd, rbuf.as_mut_ptr() as *mut libc::c_void, cap)
                            };
                            (Some(n), cap)
                        }
                    };
                    match result {
                        Some(n) if n > 0 => {
                            io.driver.read_done(n as usize);
                            this.tick_io(io);
                            tick_required = false;
                            if !io.driver.read_closed() && (n as usize) < cap {
                                io.read_blocked = true;
                            }
                        }
                        Some(0) => {
                            io.driver.read_close();
                        }
                        Some(_) => {
                            let err = sys::errno();
                            if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                                io.read_blocked = true;
                            } else if err != libc::EINTR {
                                let what = if io.disconnected {
                                    "disconnected"
                                } else {
                                    "on read from"
                                };
                                this.error_and_close(io, err, what);
                            }
                        }
                        None => {}
                    }
                }

                if tick_required {
                    this.tick_io(io);
                    tick_required = false;
                }

                while !io.write_blocked {
                    let wlen = io.driver.write_buffer().len();
                    if wlen > 0 {
                        let fd = io.fd;
                        let n = {
                            let wbuf = io.driver.write_buffer();
                            unsafe {
                                libc::write(fd, wbuf.as_ptr() as *const libc::c_void, wbuf.len())
                            }
                        };
                        if n > 0 {
                            io.driver.write_done(n as usize);
                            if (n as usize) < wlen {
                                io.write_blocked = true;
                            }
                        } else {
                            let err = sys::errno();
                            if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                                io.write_blocked = true;
                            } else if err != libc::EINTR {
                                let what = if io.disconnected {
                                    "disconnected"
                                } else {
                                    "on write to"
                                };
                                this.error_and_close(io, err, what);
                            }
                        }
                    } else if io.driver.write_closed() {
                        // Nothing more to flush: propagate the half-close.
                        unsafe {
                            libc::shutdown(io.fd, libc::SHUT_WR);
                        }
                        io.write_blocked = true;
                    } else {
                        break; // nothing to write until the next read/wake/timeout
                    }
                }

                if topup {
                    // If there was anything new to top up, we have it by now.
                    if unarmed && this.rearm_check(io) {
                        sys::rearm(this.proactor.epoll_fd(), &io.sock_arm);
                    }
                    return None; // the caller already owns the batch
                }

                if io.wake_event_pending || io.driver.has_event() {
                    if unarmed && this.rearm_check(io) {
                        sys::rearm(this.proactor.epoll_fd(), &io.sock_arm);
                    }
                    return Some(Self::batch(this));
                }
            }

            st = this.state.lock();
            if st.ctx.closing && this.is_final(&st) {
                drop(st);
                Self::cleanup(this);
                return None;
            }

            // Never stop working while work remains; the hog limit is the
            // one exception, enforced in the batch top-up path.
            if this.work_pending(&st) {
                continue;
            }

            st.ctx.working = false;
            let finished = {
                let mut io = this.io.lock();
                io.hog_count = 0;
                io.driver.finished()
            };
            if finished {
                this.begin_close(&mut st);
                if this.is_final(&st) {
                    drop(st);
                    Self::cleanup(this);
                    return None;
                }
            }
            let do_rearm = {
                let mut io = this.io.lock();
                this.rearm_check(&mut io)
            };
            drop(st);
            if do_rearm {
                this.rearm_sock();
            }
            return None;
        }
    }

    /// Release the working claim after a batch drain; re-examine pending
    /// state and self-wake if anything arrived meanwhile.
    pub(crate) fn done(this: &Arc<ConnectionInner<D>>) {
        let mut notify = false;
        let mut st = this.state.lock();
        // We remain the de facto working context while the lock is held.
        st.ctx.working = false;
        this.io.lock().hog_count = 0;

        let has_event = {
            let io = this.io.lock();
            io.wake_event_pending || io.driver.has_event()
        };
        if has_event || this.work_pending(&st) {
            notify = this.proactor.wake(&mut st.ctx, Waked::Conn(Arc::clone(this)));
        } else {
            let finished = this.io.lock().driver.finished();
            if finished {
                this.begin_close(&mut st);
                if this.is_final(&st) {
                    drop(st);
                    Self::cleanup(this);
                    return;
                }
            }
        }
        let do_rearm = {
            let mut io = this.io.lock();
            this.rearm_check(&mut io)
        };
        drop(st);
        if do_rearm {
            this.rearm_sock();
        }
        if notify {
            this.proactor.wake_notify();
        }
    }

    /// Yield the next event for the batch owner, topping up from the
    /// driver at most `hog_max` times per drain.
    pub(crate) fn batch_next(this: &Arc<ConnectionInner<D>>) -> Option<Event<D::Event>> {
        let hog_max = this.proactor.config().hog_max;
        {
            let mut io_g = this.io.lock();
            let io = &mut *io_g;
            if io.wake_event_pending {
                io.wake_event_pending = false;
                return Some(Event::ConnectionWake);
            }
            if let Some(e) = io.driver.next_event() {
                return Some(Event::Transport(e));
            }
            if io.hog_count >= hog_max {
                return None; // the worker must return to the reactor
            }
        }
        Self::process(this, 0, false, true); // top up
        let mut io_g = this.io.lock();
        let io = &mut *io_g;
        if io.wake_event_pending {
            io.wake_event_pending = false;
            return Some(Event::ConnectionWake);
        }
        io.driver.next_event().map(Event::Transport)
    }
}

/// Handle to a proactor-managed connection. Cheap to clone; safe to use
/// from any thread.
pub struct Connection<D: ConnectionDriver> {
    inner: Arc<ConnectionInner<D>>,
}

impl<D: ConnectionDriver> Clone for Connection<D> {
    fn clone(&self) -> Self {
        Connection {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: ConnectionDriver> Connection<D> {
    pub(crate) fn from_inner(inner: Arc<ConnectionInner<D>>) -> Connection<D> {
        Connection { inner }
    }

    /// Schedule a `ConnectionWake` event for this connection. Multiple
    /// wakes coalesce into a single event per drain cycle. Safe to call
    /// from any thread, including threads outside the proactor.
    pub fn wake(&self) {
        let this = &self.inner;
        let notify = {
            let mut st = this.state.lock();
            if !st.ctx.closing {
                st.wake_count += 1;
                this.proactor
                    .wake(&mut st.ctx, Waked::Conn(Arc::clone(this)))
            } else {
                false
            }
        };
        if notify {
            this.proactor.wake_notify();
        }
    }

    /// Detach the application from the connection and close it.
    pub fn release(&self) {
        let this = &self.inner;
        let notify = {
            let mut st = this.state.lock();
            this.io.lock().driver.released();
            this.begin_close(&mut st);
            this.proactor
                .wake(&mut st.ctx, Waked::Conn(Arc::clone(this)))
        };
        if notify {
            this.proactor.wake_notify();
        }
    }

    /// Local socket address, captured when the socket started.
    pub fn local_addr(&self) -> NetAddr {
        self.inner.io.lock().local
    }

    /// Peer socket address, captured when the socket started.
    pub fn remote_addr(&self) -> NetAddr {
        self.inner.io.lock().remote
    }
}

impl<D: ConnectionDriver> ConnectionInner<D> {
    /// Bulk-disconnect second pass, non-working case: bind the condition
    /// and close the driver immediately. Context mutex held by caller.
    pub(crate) fn disconnect_now(&self, cond: Option<&Condition>) {
        let mut io = self.io.lock();
        if let Some(c) = cond {
            io.driver.set_error(c.clone());
        }
        io.driver.close();
    }
}
