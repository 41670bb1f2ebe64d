use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use log::trace;

use crate::token::WAKE_TOKEN;
use crate::{sys, Interest, Ready, Token};

/// Initial capacity of the native event array.
const INIT_EVENTS: usize = 16;

/// Readiness wait and subscription over the platform selector.
///
/// `poll` translates every native event the kernel reports into a
/// `(Token, Ready)` pair; the event loop maps tokens back to channels. The
/// native event array doubles whenever one wait fills it completely.
pub(crate) struct Poller {
    selector: sys::Selector,
    events: sys::Events,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let selector = sys::Selector::new()?;
        Ok(Poller {
            selector,
            events: new_events(INIT_EVENTS),
        })
    }

    /// Creates this platform's waker and, where it is fd-backed, registers
    /// it under the reserved wake token. The waker is handed to the caller;
    /// where the kqueue supports user events it posts those straight into
    /// the selector instead.
    #[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
    pub(crate) fn setup_waker(&mut self) -> io::Result<sys::Waker> {
        sys::Waker::new(&self.selector, WAKE_TOKEN)
    }

    #[cfg(not(any(target_os = "freebsd", target_os = "ios", target_os = "macos")))]
    pub(crate) fn setup_waker(&mut self) -> io::Result<sys::Waker> {
        use std::os::fd::AsRawFd;

        let waker = sys::Waker::new()?;
        self.register(waker.as_raw_fd(), WAKE_TOKEN, Interest::READABLE)?;
        Ok(waker)
    }

    /// Blocks until readiness or timeout and fills `active` with one entry
    /// per reported registration. `None` blocks indefinitely.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<(Token, Ready)>,
    ) -> io::Result<()> {
        self.selector.select(&mut self.events, timeout)?;

        for event in self.events.iter() {
            let token = sys::event::token(event);
            let ready = sys::event::ready(event);
            if !ready.is_empty() {
                active.push((token, ready));
            }
        }

        // A full array likely means there was more to report; grow so the
        // next wait sees everything in one go.
        if self.events.len() == self.events.capacity() {
            let grown = self.events.capacity() * 2;
            trace!("event array full, growing to {}", grown);
            self.events = new_events(grown);
        }
        Ok(())
    }

    pub(crate) fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        trace!("registering fd {} with {:?} as {:?}", fd, interest, token);
        self.selector.register(fd, token, interest)
    }

    pub(crate) fn reregister(
        &mut self,
        fd: RawFd,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        trace!("reregistering fd {} with {:?}", fd, interest);
        self.selector.reregister(fd, token, interest)
    }

    /// Unsubscribes `fd` but remembers the slot (where the backend keeps
    /// slots at all).
    pub(crate) fn disable(&mut self, fd: RawFd) -> io::Result<()> {
        trace!("disabling fd {}", fd);
        self.selector.disable(fd)
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        trace!("deregistering fd {}", fd);
        self.selector.deregister(fd)
    }

    /// Forgets a previously disabled registration. Only the `poll(2)`
    /// backend retains anything to forget.
    pub(crate) fn purge(&mut self, fd: RawFd) -> io::Result<()> {
        self.selector.purge(fd)
    }
}

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn new_events(capacity: usize) -> sys::Events {
    sys::Events::with_capacity(capacity)
}

#[cfg(not(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
fn new_events(capacity: usize) -> sys::Events {
    Vec::with_capacity(capacity)
}
