use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::{Interest, Ready, Token};

/// Readiness backend of last resort, built on `poll(2)`.
///
/// The pollfd array is kept aligned with an fd -> (index, token) map. A
/// disabled entry keeps its slot but negates the fd to `-(fd + 1)` so the
/// kernel skips it; deregistration swap-removes the slot and fixes up the
/// index of the entry that moved.
#[derive(Debug)]
pub(crate) struct Selector {
    fds: Vec<libc::pollfd>,
    entries: HashMap<RawFd, (usize, Token)>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        Ok(Selector {
            fds: Vec::new(),
            entries: HashMap::new(),
        })
    }

    pub(crate) fn select(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        let n_events = syscall!(poll(
            self.fds.as_mut_ptr(),
            self.fds.len() as libc::nfds_t,
            timeout,
        ))?;

        let mut collected = 0;
        for pfd in self.fds.iter_mut() {
            if collected == n_events {
                break;
            }
            if pfd.revents != 0 {
                let (_, token) = self.entries[&pfd.fd];
                events.push(Event {
                    token,
                    revents: pfd.revents,
                });
                pfd.revents = 0;
                collected += 1;
            }
        }
        Ok(())
    }

    pub(crate) fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        // A disabled entry keeps its slot; registering again revives it.
        if self.entries.contains_key(&fd) {
            return self.reregister(fd, token, interest);
        }
        self.fds.push(libc::pollfd {
            fd,
            events: interest_to_poll(interest),
            revents: 0,
        });
        self.entries.insert(fd, (self.fds.len() - 1, token));
        Ok(())
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let (idx, slot_token) = self
            .entries
            .get_mut(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        *slot_token = token;
        let pfd = &mut self.fds[*idx];
        pfd.fd = fd;
        pfd.events = interest_to_poll(interest);
        pfd.revents = 0;
        Ok(())
    }

    /// Keeps the slot but stops the kernel from looking at it.
    pub(crate) fn disable(&mut self, fd: RawFd) -> io::Result<()> {
        let (idx, _) = self
            .entries
            .get(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let pfd = &mut self.fds[*idx];
        pfd.fd = -fd - 1;
        pfd.events = 0;
        pfd.revents = 0;
        Ok(())
    }

    /// Drops the slot a disabled entry kept.
    pub(crate) fn purge(&mut self, fd: RawFd) -> io::Result<()> {
        self.deregister(fd)
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let (idx, _) = self
            .entries
            .remove(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.fds.swap_remove(idx);
        if idx < self.fds.len() {
            let mut moved = self.fds[idx].fd;
            if moved < 0 {
                moved = -moved - 1;
            }
            self.entries.get_mut(&moved).expect("moved fd not tracked").0 = idx;
        }
        Ok(())
    }
}

fn interest_to_poll(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    if interest.is_priority() {
        events |= libc::POLLPRI;
    }
    events
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    token: Token,
    revents: libc::c_short,
}

pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::*;

    pub(crate) fn token(event: &Event) -> Token {
        event.token
    }

    pub(crate) fn ready(event: &Event) -> Ready {
        let bits = event.revents;
        let mut ready = Ready::EMPTY;

        if bits & libc::POLLIN != 0 {
            ready |= Ready::READABLE;
        }
        if bits & libc::POLLOUT != 0 {
            ready |= Ready::WRITABLE;
        }
        if bits & (libc::POLLERR | libc::POLLNVAL) != 0 {
            ready |= Ready::ERROR;
        }
        if bits & libc::POLLHUP != 0 {
            ready |= Ready::HUP;
        }
        if bits & libc::POLLPRI != 0 {
            ready |= Ready::PRIORITY;
        }
        ready
    }
}
