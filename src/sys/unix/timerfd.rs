use std::io::{self, Read};
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

/// A `CLOCK_MONOTONIC` timer fd that participates in the selector as an
/// ordinary readiness source. The loop keeps it armed at the earliest timer
/// deadline; reading it acknowledges an expiration.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: File,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
        ))?;
        // SAFETY: `timerfd_create(2)` ensures the fd is valid.
        Ok(TimerFd {
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    /// Arms the timer to fire at `deadline`, with a floor of 100us so a
    /// deadline in the past still produces an expiration instead of
    /// disarming.
    pub(crate) fn set_deadline(&self, deadline: Instant) -> io::Result<()> {
        let delay = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_micros(100));

        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(delay.subsec_nanos() as i32),
            },
        };
        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &new_value,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }

    /// Acknowledges an expiration; the expiry count itself is discarded.
    #[allow(clippy::unused_io_amount)]
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 8];
        let _ = (&self.fd).read(&mut buf);
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
