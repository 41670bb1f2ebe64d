use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::{Interest, Ready, Token};

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout, unless
                // the caller explicitly requests that by specifying a zero
                // timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `epoll_wait` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    /// Unsubscribe `fd` while keeping the registration slot conceptually
    /// alive; with epoll there is nothing to keep, so this is a removal.
    pub(crate) fn disable(&self, fd: RawFd) -> io::Result<()> {
        self.deregister(fd)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())).map(|_| ())
    }

    /// A disabled registration left nothing behind with epoll.
    pub(crate) fn purge(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

// Level-triggered on purpose: the write path relies on POLLOUT staying
// reported until the interest is dropped.
fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    if interest.is_priority() {
        kind |= EPOLLPRI;
    }

    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::*;

    pub(crate) fn token(event: &Event) -> Token {
        Token(event.u64 as usize)
    }

    pub(crate) fn ready(event: &Event) -> Ready {
        let bits = event.events as libc::c_int;
        let mut ready = Ready::EMPTY;

        // `EPOLLRDHUP` means the peer shut down its write side; a read will
        // observe the EOF, so it counts as readable here.
        if bits & (EPOLLIN | EPOLLRDHUP) != 0 {
            ready |= Ready::READABLE;
        }
        if bits & EPOLLOUT != 0 {
            ready |= Ready::WRITABLE;
        }
        if bits & EPOLLERR != 0 {
            ready |= Ready::ERROR;
        }
        if bits & EPOLLHUP != 0 {
            ready |= Ready::HUP;
        }
        if bits & EPOLLPRI != 0 {
            ready |= Ready::PRIORITY;
        }
        ready
    }
}
