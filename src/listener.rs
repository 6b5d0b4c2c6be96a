//! Listener state machine: bind/listen on every resolved address,
//! accept with back-pressure, orderly close.
//!
//! A listener is one serialization context covering all of its listening
//! sockets. An accepted socket's registration is not rearmed until the
//! application has called `accept` and returned the batch via `done`,
//! so at most one `ListenerAccept` is outstanding at a time.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::{self, NetAddr};
use crate::batch::{Batch, BatchOwner, Event};
use crate::connection::{Connection, ConnectionInner};
use crate::driver::{Condition, ConnectionDriver};
use crate::error::Error;
use crate::proactor::{Context, Ctx, ProactorInner, Target, Waked, COND_NAME};
use crate::sys::{self, EpollArm};

enum LEvent {
    Open,
    Accept,
    Close,
}

struct LSocket {
    fd: libc::c_int,
    arm: EpollArm,
}

pub(crate) struct ListenerShared<D: ConnectionDriver> {
    pub(crate) ctx: Context,
    proactor: Option<Arc<ProactorInner<D>>>,
    sockets: Vec<LSocket>,
    /// Socket signaled readable by epoll, waiting for `accept`.
    acceptable: Option<usize>,
    /// Socket consumed by `accept`, waiting for `done` to rearm.
    accepted: Option<usize>,
    armed: bool,
    close_dispatched: bool,
    collector: VecDeque<LEvent>,
    pub(crate) condition: Option<Condition>,
    host: Option<String>,
    port: String,
    finalized: bool,
}

pub(crate) struct ListenerInner<D: ConnectionDriver> {
    pub(crate) state: Mutex<ListenerShared<D>>,
    attachments: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl<D: ConnectionDriver> ListenerInner<D> {
    fn new() -> Arc<ListenerInner<D>> {
        Arc::new(ListenerInner {
            state: Mutex::new(ListenerShared {
                ctx: Context::new(),
                proactor: None,
                sockets: Vec::new(),
                acceptable: None,
                accepted: None,
                armed: false,
                close_dispatched: false,
                collector: VecDeque::new(),
                condition: None,
                host: None,
                port: addr::AMQP_PORT.to_string(),
                finalized: false,
            }),
            attachments: Mutex::new(None),
        })
    }

    pub(crate) fn key(this: &Arc<ListenerInner<D>>) -> usize {
        Arc::as_ptr(this) as usize
    }

    /// Resolve and bind every address; always post `ListenerOpen`, even
    /// when every bind failed (the error then travels through the
    /// condition and the close path).
    pub(crate) fn listen(
        this: &Arc<ListenerInner<D>>,
        proactor: &Arc<ProactorInner<D>>,
        addr: &str,
        backlog: i32,
    ) {
        let mut st = this.state.lock();
        st.proactor = Some(Arc::clone(proactor));
        let (host, port) = addr::parse(addr);
        st.host = host;
        st.port = port;

        let mut last_err = 0;
        match addr::resolve(st.host.as_deref(), &st.port, true) {
            Ok(addrs) => {
                for ai in addrs {
                    let fd = unsafe { libc::socket(ai.family, libc::SOCK_STREAM, ai.protocol) };
                    if fd < 0 {
                        last_err = sys::errno();
                        continue;
                    }
                    let on: libc::c_int = 1;
                    let mut ok = unsafe {
                        libc::setsockopt(
                            fd,
                            libc::SOL_SOCKET,
                            libc::SO_REUSEADDR,
                            &on as *const _ as *const libc::c_void,
                            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                        )
                    } == 0;
                    // v4 and v6 listen on separate sockets; don't let a
                    // v6 socket capture v4 traffic.
                    if ok && ai.family == libc::AF_INET6 {
                        ok = unsafe {
                            libc::setsockopt(
                                fd,
                                libc::IPPROTO_IPV6,
                                libc::IPV6_V6ONLY,
                                &on as *const _ as *const libc::c_void,
                                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                            )
                        } == 0;
                    }
                    if ok {
                        ok = unsafe { libc::bind(fd, ai.as_ptr(), ai.len) } == 0
                            && unsafe { libc::listen(fd, backlog) } == 0;
                    }
                    if !ok {
                        last_err = sys::errno();
                        sys::close_fd(fd);
                        continue;
                    }
                    let idx = st.sockets.len();
                    let mut arm = EpollArm {
                        fd,
                        token: 0,
                        wanted: sys::EPOLLIN,
                        polling: false,
                    };
                    proactor.start_polling(&mut arm, Target::ListenerIo(Arc::clone(this), idx));
                    st.sockets.push(LSocket { fd, arm });
                }
            }
            Err(e) => {
                tracing::debug!("listener resolve failed: {e}");
                last_err = e.raw_os_error().unwrap_or(0);
            }
        }

        // Always an OPEN event for symmetry, even if we close right away.
        st.collector.push_back(LEvent::Open);
        let notify = proactor.wake(&mut st.ctx, Waked::Listener(Arc::clone(this)));

        if st.sockets.is_empty() {
            Self::error_and_close_locked(&mut st, last_err, "listen on");
        } else {
            tracing::debug!(
                addr,
                backlog,
                sockets = st.sockets.len(),
                "listener bound"
            );
        }
        proactor.add_context(Ctx::Listener(Arc::clone(this)));
        drop(st);
        if notify {
            proactor.wake_notify();
        }
    }

    /// Record the condition and begin the close. Errors on one socket
    /// close the whole listener.
    fn error_and_close_locked(st: &mut ListenerShared<D>, err: i32, what: &str) {
        let desc = format!(
            "{} {}:{}: {}",
            what,
            st.host.as_deref().unwrap_or(""),
            st.port,
            sys::errno_string(err)
        );
        tracing::debug!("listener error: {desc}");
        st.condition = Some(Condition::new(COND_NAME, desc));
        Self::begin_close(st);
    }

    pub(crate) fn begin_close(st: &mut ListenerShared<D>) {
        if !st.ctx.closing {
            st.ctx.closing = true;
            let proactor = st.proactor.clone();
            if let Some(p) = proactor {
                for s in &mut st.sockets {
                    p.stop_polling(&mut s.arm);
                    if s.fd >= 0 {
                        sys::close_fd(s.fd);
                        s.fd = -1;
                    }
                }
            }
            st.collector.push_back(LEvent::Close);
            st.acceptable = None;
            st.accepted = None;
        }
    }

    fn can_free(st: &ListenerShared<D>) -> bool {
        st.ctx.closing && st.close_dispatched && st.ctx.wake_ops == 0
    }

    /// Detach from the proactor and finalize once nothing else co-owns
    /// the teardown.
    fn reap(this: &Arc<ListenerInner<D>>) {
        let can_free = {
            let st = this.state.lock();
            match &st.proactor {
                Some(p) => p.remove_context(Self::key(this)),
                None => true,
            }
        };
        if can_free {
            this.final_free();
        }
    }

    pub(crate) fn final_free(&self) {
        let mut st = self.state.lock();
        debug_assert!(!st.finalized, "listener freed twice");
        st.finalized = true;
        tracing::debug!("listener finalized");
    }

    /// Called by proactor teardown: no competing threads, no further
    /// epoll activity.
    pub(crate) fn forced_shutdown(this: &Arc<ListenerInner<D>>) {
        {
            let mut st = this.state.lock();
            Self::begin_close(&mut st);
            st.ctx.wake_ops = 0;
            st.close_dispatched = true;
        }
        Self::reap(this);
    }

    /// Process a listening-socket event (`events != 0`) or an inbound
    /// wake (`events == 0`).
    pub(crate) fn process(
        this: &Arc<ListenerInner<D>>,
        idx: usize,
        events: u32,
    ) -> Option<Batch<D>> {
        let mut st = this.state.lock();
        if events != 0 {
            st.armed = false;
            if events & (sys::EPOLLRDHUP | sys::EPOLLHUP | sys::EPOLLERR) != 0 {
                Self::error_and_close_locked(&mut st, sys::errno(), "listener epoll");
            } else if !st.ctx.closing && events & sys::EPOLLIN != 0 {
                st.acceptable = Some(idx);
                st.collector.push_back(LEvent::Accept);
            }
        } else {
            st.ctx.wake_done();
            // This wake may be the last outstanding reference to a
            // listener whose close was already dispatched.
            if !st.ctx.working && Self::can_free(&st) {
                drop(st);
                Self::reap(this);
                return None;
            }
        }
        let mut batch = None;
        if !st.ctx.working && !st.collector.is_empty() {
            st.ctx.working = true;
            batch = Some(Batch {
                owner: BatchOwner::Listener(Arc::clone(this)),
            });
        }
        batch
    }

    pub(crate) fn batch_next(&self) -> Option<Event<D::Event>> {
        let mut st = self.state.lock();
        let e = st.collector.pop_front();
        if matches!(e, Some(LEvent::Close)) {
            st.close_dispatched = true;
        }
        e.map(|e| match e {
            LEvent::Open => Event::ListenerOpen,
            LEvent::Accept => Event::ListenerAccept,
            LEvent::Close => Event::ListenerClose,
        })
    }

    pub(crate) fn done(this: &Arc<ListenerInner<D>>) {
        let mut notify = false;
        let mut st = this.state.lock();
        st.ctx.working = false;

        if st.close_dispatched {
            if Self::can_free(&st) {
                drop(st);
                Self::reap(this);
                return;
            }
        } else if !st.collector.is_empty() {
            if let Some(p) = st.proactor.clone() {
                notify = p.wake(&mut st.ctx, Waked::Listener(Arc::clone(this)));
            }
        } else if !st.ctx.closing && !st.armed && st.acceptable.is_none() {
            // Don't rearm until the pending socket has been accepted.
            if let Some(i) = st.accepted.take() {
                if let Some(p) = &st.proactor {
                    sys::rearm(p.epoll_fd(), &st.sockets[i].arm);
                }
                st.armed = true;
            }
        }
        let p = st.proactor.clone();
        drop(st);
        if notify {
            if let Some(p) = p {
                p.wake_notify();
            }
        }
    }
}

/// Handle to a listener. Create with [`Listener::new`], start it with
/// [`crate::Proactor::listen`]. Cheap to clone.
pub struct Listener<D: ConnectionDriver> {
    inner: Arc<ListenerInner<D>>,
}

impl<D: ConnectionDriver> Clone for Listener<D> {
    fn clone(&self) -> Self {
        Listener {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: ConnectionDriver> Default for Listener<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: ConnectionDriver> Listener<D> {
    pub fn new() -> Listener<D> {
        Listener {
            inner: ListenerInner::new(),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ListenerInner<D>>) -> Listener<D> {
        Listener { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ListenerInner<D>> {
        &self.inner
    }

    /// Begin an orderly close: stop and close every listening socket and
    /// post `ListenerClose`.
    pub fn close(&self) {
        let this = &self.inner;
        let mut notify = false;
        let mut proactor = None;
        {
            let mut st = this.state.lock();
            if !st.ctx.closing {
                ListenerInner::begin_close(&mut st);
                proactor = st.proactor.clone();
                if let Some(p) = &proactor {
                    notify = p.wake(&mut st.ctx, Waked::Listener(Arc::clone(this)));
                }
            }
        }
        if notify {
            if let Some(p) = proactor {
                p.wake_notify();
            }
        }
    }

    /// Accept the pending inbound socket, handing it the given driver.
    /// Call once per `ListenerAccept` event, from the batch drain.
    /// Failures are reported through the listener condition and the new
    /// connection's transport error events, mirroring socket errors on
    /// live connections.
    pub fn accept(&self, driver: D) -> Result<Connection<D>, Error> {
        let proactor = self
            .inner
            .state
            .lock()
            .proactor
            .clone()
            .ok_or(Error::NotListening)?;
        let pc = ConnectionInner::new(&proactor, driver, true, "");
        proactor.add_context(Ctx::Conn(Arc::clone(&pc)));

        let mut failure: Option<(i32, &'static str)> = None;
        let mut newfd = -1;
        {
            let mut st = self.inner.state.lock();
            if st.ctx.closing {
                failure = Some((libc::EBADF, "listener state on accept"));
            } else {
                match st.acceptable.take() {
                    None => failure = Some((libc::EAGAIN, "listener state on accept")),
                    Some(i) => {
                        st.accepted = Some(i);
                        newfd = unsafe {
                            libc::accept(
                                st.sockets[i].fd,
                                std::ptr::null_mut(),
                                std::ptr::null_mut(),
                            )
                        };
                        if newfd < 0 {
                            failure = Some((sys::errno(), "accept"));
                        }
                    }
                }
            }
        }

        match failure {
            None => {
                ConnectionInner::accepted(&pc, newfd);
                tracing::trace!("accepted connection");
            }
            Some((err, what)) => {
                // An error on one socket closes the entire listener. The
                // new connection is failed and woken so a worker reaps it.
                {
                    let mut st = self.inner.state.lock();
                    ListenerInner::error_and_close_locked(&mut st, err, what);
                }
                ConnectionInner::fail(&pc, err, "failed initialization on accept");
            }
        }
        Ok(Connection::from_inner(pc))
    }

    /// The error condition, if the listener closed with one.
    pub fn condition(&self) -> Option<Condition> {
        self.inner.state.lock().condition.clone()
    }

    /// Attach application data to the listener.
    pub fn set_context(&self, context: Arc<dyn Any + Send + Sync>) {
        *self.inner.attachments.lock() = Some(context);
    }

    /// Application data previously attached with `set_context`.
    pub fn context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.attachments.lock().clone()
    }

    /// The bound address of the first listening socket. Useful after
    /// listening on port 0.
    pub fn local_addr(&self) -> Option<NetAddr> {
        let st = self.inner.state.lock();
        st.sockets.first().filter(|s| s.fd >= 0).map(|s| NetAddr::local_of(s.fd))
    }
}
