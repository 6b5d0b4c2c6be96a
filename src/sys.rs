//! Thin wrappers over the raw syscalls the proactor is built on: epoll,
//! eventfd, timerfd, and socket configuration.
//!
//! Every fd is registered with `EPOLLONESHOT` so each readiness report is
//! delivered to exactly one thread; nothing fires again until `rearm`.

use std::io;
use std::os::unix::io::RawFd;

pub(crate) const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub(crate) const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub(crate) const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub(crate) const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub(crate) const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;

/// Internal error, no recovery. Indicates kernel or proactor state
/// corruption (e.g. epoll_ctl on a registered fd failing).
macro_rules! fatal {
    ($what:expr) => {{
        let err = ::std::io::Error::last_os_error();
        ::tracing::error!(
            "proactor failure in {}:{}: {}: {}",
            file!(),
            line!(),
            $what,
            err
        );
        ::std::process::abort()
    }};
}
pub(crate) use fatal;

/// One epoll registration: the fd, the registry token delivered back in
/// `epoll_event.u64`, the event mask to poll for, and whether the fd is
/// currently registered.
#[derive(Debug)]
pub(crate) struct EpollArm {
    pub(crate) fd: RawFd,
    pub(crate) token: u64,
    pub(crate) wanted: u32,
    pub(crate) polling: bool,
}

impl EpollArm {
    pub(crate) fn unregistered() -> Self {
        EpollArm {
            fd: -1,
            token: 0,
            wanted: 0,
            polling: false,
        }
    }
}

/// Initial `EPOLL_CTL_ADD` with one-shot semantics.
pub(crate) fn epoll_add(epfd: RawFd, arm: &EpollArm) {
    let mut ev = libc::epoll_event {
        events: arm.wanted | EPOLLONESHOT,
        u64: arm.token,
    };
    if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, arm.fd, &mut ev) } == -1 {
        fatal!("adding polled file descriptor");
    }
}

/// Re-enable delivery for a one-shot registration. A record that was never
/// registered (or already deregistered) is left alone.
pub(crate) fn rearm(epfd: RawFd, arm: &EpollArm) {
    if !arm.polling {
        return;
    }
    let mut ev = libc::epoll_event {
        events: arm.wanted | EPOLLONESHOT,
        u64: arm.token,
    };
    if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, arm.fd, &mut ev) } == -1 {
        fatal!("arming polled file descriptor");
    }
}

/// `EPOLL_CTL_DEL` and mark the record unregistered.
pub(crate) fn epoll_del(epfd: RawFd, arm: &mut EpollArm) {
    if arm.fd == -1 || !arm.polling {
        return;
    }
    let mut ev = libc::epoll_event { events: 0, u64: 0 };
    if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, arm.fd, &mut ev) } == -1 {
        fatal!("removing polled file descriptor");
    }
    arm.fd = -1;
    arm.polling = false;
}

pub(crate) fn epoll_create() -> io::Result<RawFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub(crate) fn eventfd_new() -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Post one wakeup. Failure here means the fd is gone or the counter
/// overflowed, either of which is unrecoverable.
pub(crate) fn eventfd_write(fd: RawFd) {
    let increment: u64 = 1;
    let n = unsafe {
        libc::write(
            fd,
            &increment as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n != std::mem::size_of::<u64>() as isize {
        fatal!("writing eventfd");
    }
}

/// Clear the eventfd counter. Must be paired with the writes: call only
/// while the wake list is observed empty under the eventfd mutex.
pub(crate) fn eventfd_read(fd: RawFd) {
    let mut ignored: u64 = 0;
    unsafe {
        libc::read(
            fd,
            &mut ignored as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        );
    }
}

pub(crate) fn close_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Non-blocking, and optionally TCP_NODELAY, on every connection socket.
pub(crate) fn configure_socket(fd: RawFd, tcp_nodelay: bool) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);

        if tcp_nodelay {
            let on: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

/// Monotonic clock in milliseconds. Used for transport tick deadlines.
pub fn now_ms() -> u64 {
    let mut t = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut t);
    }
    t.tv_sec as u64 * 1000 + t.tv_nsec as u64 / 1_000_000
}

/// Drain SO_ERROR from a socket whose connect attempt failed.
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return errno();
    }
    err
}

pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// strerror-style rendering for condition descriptions.
pub(crate) fn errno_string(err: i32) -> String {
    if err == 0 {
        "unknown error".to_string()
    } else {
        io::Error::from_raw_os_error(err).to_string()
    }
}
