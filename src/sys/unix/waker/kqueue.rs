use std::io;

use crate::sys::Selector;
use crate::Token;

/// Waker backed by kqueue user space notifications (`EVFILT_USER`).
///
/// The kqueue must be set up to receive waker events first, which is done by
/// `Selector::setup_waker`. The selector fd is duplicated so the waker can
/// outlive borrows of the poller; waking is then as simple as posting a user
/// event to the kqueue.
#[derive(Debug)]
pub(crate) struct Waker {
    selector: Selector,
    token: Token,
}

impl Waker {
    pub(crate) fn new(selector: &Selector, token: Token) -> io::Result<Waker> {
        let selector = selector.try_clone()?;
        selector.setup_waker(token)?;
        Ok(Waker { selector, token })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        self.selector.wake(self.token)
    }

    /// Nothing is queued behind a user event; present for interface parity
    /// with the fd-backed wakers.
    pub(crate) fn drain(&self) {}
}
