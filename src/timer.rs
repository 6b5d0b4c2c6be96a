//! One-shot monotonic timer on a timerfd.
//!
//! Assumes EPOLLONESHOT registration and at most one expiry callback
//! running at a time. `pending` counts armed-but-unconsumed expiries;
//! `skip` counts expiries that fired but were then displaced by a
//! `set()` before their readiness notification was consumed. A settime
//! clears the kernel expiration counter, so a displaced fire shows up as
//! a zero-count read and is absorbed through `skip`.

use std::os::unix::io::RawFd;

use parking_lot::Mutex;

use crate::sys;

pub(crate) struct Timer {
    fd: RawFd,
    counts: Mutex<Counts>,
}

struct Counts {
    pending: i32,
    skip: i32,
}

impl Timer {
    pub(crate) fn new() -> std::io::Result<Timer> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Timer {
            fd,
            counts: Mutex::new(Counts {
                pending: 0,
                skip: 0,
            }),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Arm for `millis` from now; 0 cancels.
    pub(crate) fn set(&self, millis: u64) {
        let mut c = self.counts.lock();
        if millis == 0 && c.pending == 0 {
            return; // nothing to cancel
        }
        let newt = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (millis / 1000) as libc::time_t,
                tv_nsec: ((millis % 1000) * 1_000_000) as libc::c_long,
            },
        };
        let mut oldt = unsafe { std::mem::zeroed::<libc::itimerspec>() };
        unsafe {
            libc::timerfd_settime(self.fd, 0, &newt, &mut oldt);
        }
        if oldt.it_value.tv_sec != 0 || oldt.it_value.tv_nsec != 0 {
            // Displaced an arm that had not yet fired.
            debug_assert!(c.pending > 0);
            c.pending -= 1;
        } else if c.pending > c.skip {
            // An expiry already fired but has not been consumed; the
            // settime above wiped it from the kernel counter, so its
            // readiness notification must be ignored when it arrives.
            c.skip += 1;
        }
        if millis > 0 {
            c.pending += 1;
        }
        debug_assert!(c.pending >= 0);
    }

    /// Expiry bookkeeping. Returns the number of uncancelled expiries.
    /// Multiple kernel expirations collapsed into one read are handled; a
    /// zero-count read is a stale notification and consumes one skip.
    pub(crate) fn on_expiry(&self) -> u32 {
        let mut c = self.counts.lock();
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize || count == 0 {
            if c.skip > 0 {
                c.skip -= 1;
                c.pending -= 1;
            }
            debug_assert!(c.pending >= 0);
            return 0;
        }
        let count = count as i32;
        debug_assert!(count <= c.pending - c.skip);
        c.pending -= count;
        debug_assert!(c.pending >= 0);
        count as u32
    }

    /// For the connection final predicate: armed or in-flight expiries.
    pub(crate) fn pending(&self) -> i32 {
        self.counts.lock().pending
    }

    /// Forced shutdown: no competing threads, no further epoll activity.
    pub(crate) fn force_clear(&self) {
        let mut c = self.counts.lock();
        c.pending = 0;
        c.skip = 0;
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        sys::close_fd(self.fd);
    }
}
