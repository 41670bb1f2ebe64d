use std::any::Any;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use crate::event_loop::EventLoop;
use crate::{Interest, Ready, Token};

/// Callbacks live on the loop thread; they are cloned out of the channel
/// table before being invoked so a callback can freely mutate its own
/// channel.
pub(crate) type EventCallback = Rc<dyn Fn()>;

/// Poller membership of a channel.
///
/// `Deleted` means the interest set went empty and the OS registration was
/// dropped, but the slot is remembered so a later re-enable knows to use a
/// fresh registration rather than a modification.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChannelState {
    New,
    Added,
    Deleted,
}

/// Per-fd registration record: the association between an fd and its
/// callbacks. Stored in the owning loop's channel table; handled through
/// [`ChannelRef`].
pub(crate) struct Channel {
    fd: RawFd,
    interest: Option<Interest>,
    revents: Ready,
    state: ChannelState,
    retired: bool,
    read_cb: Option<EventCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
    // Overrides the four callbacks above when set (used by fd-backed loop
    // internals).
    event_cb: Option<EventCallback>,
    tie: Option<Weak<dyn Any + Send + Sync>>,
}

impl Channel {
    pub(crate) fn new(fd: RawFd) -> Channel {
        Channel {
            fd,
            interest: None,
            revents: Ready::EMPTY,
            state: ChannelState::New,
            retired: false,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
            event_cb: None,
            tie: None,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        self.interest
    }

    pub(crate) fn set_interest(&mut self, interest: Option<Interest>) {
        self.interest = interest;
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    pub(crate) fn set_revents(&mut self, revents: Ready) {
        self.revents = revents;
    }

    pub(crate) fn revents(&self) -> Ready {
        self.revents
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn callbacks(&self) -> ChannelCallbacks {
        ChannelCallbacks {
            read: self.read_cb.clone(),
            write: self.write_cb.clone(),
            close: self.close_cb.clone(),
            error: self.error_cb.clone(),
            event: self.event_cb.clone(),
            tie: self.tie.clone(),
        }
    }

    pub(crate) fn set_read_cb(&mut self, cb: EventCallback) {
        self.read_cb = Some(cb);
    }

    pub(crate) fn set_write_cb(&mut self, cb: EventCallback) {
        self.write_cb = Some(cb);
    }

    pub(crate) fn set_close_cb(&mut self, cb: EventCallback) {
        self.close_cb = Some(cb);
    }

    pub(crate) fn set_error_cb(&mut self, cb: EventCallback) {
        self.error_cb = Some(cb);
    }

    pub(crate) fn set_event_cb(&mut self, cb: EventCallback) {
        self.event_cb = Some(cb);
    }

    pub(crate) fn set_tie(&mut self, tie: Weak<dyn Any + Send + Sync>) {
        self.tie = Some(tie);
    }
}

/// A clone of one channel's callback set, taken while the channel table is
/// borrowed and invoked after the borrow is released.
pub(crate) struct ChannelCallbacks {
    pub(crate) read: Option<EventCallback>,
    pub(crate) write: Option<EventCallback>,
    pub(crate) close: Option<EventCallback>,
    pub(crate) error: Option<EventCallback>,
    pub(crate) event: Option<EventCallback>,
    pub(crate) tie: Option<Weak<dyn Any + Send + Sync>>,
}

/// Handle to one channel of an event loop.
///
/// Obtained from [`EventLoop::channel`]; all operations must run on the loop
/// thread (which holding an `&EventLoop` guarantees). Enabling or disabling
/// readiness classes synchronizes the poller registration immediately.
#[derive(Copy, Clone)]
pub struct ChannelRef<'a> {
    pub(crate) loop_: &'a EventLoop,
    pub(crate) token: Token,
}

impl ChannelRef<'_> {
    /// Interest the read path subscribes to: ordinary plus out-of-band data.
    pub(crate) const READ: Interest = Interest::READABLE.add(Interest::PRIORITY);
    pub(crate) const WRITE: Interest = Interest::WRITABLE;

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn fd(&self) -> RawFd {
        self.loop_.with_channel(self.token, |ch| ch.fd())
    }

    /// The callback invoked when the fd is readable.
    pub fn set_read_callback(&self, cb: impl Fn() + 'static) {
        self.loop_
            .with_channel(self.token, |ch| ch.set_read_cb(Rc::new(cb)));
    }

    /// The callback invoked when the fd is writable.
    pub fn set_write_callback(&self, cb: impl Fn() + 'static) {
        self.loop_
            .with_channel(self.token, |ch| ch.set_write_cb(Rc::new(cb)));
    }

    /// The callback invoked when the peer hung up without readable data.
    pub fn set_close_callback(&self, cb: impl Fn() + 'static) {
        self.loop_
            .with_channel(self.token, |ch| ch.set_close_cb(Rc::new(cb)));
    }

    /// The callback invoked on an error condition.
    pub fn set_error_callback(&self, cb: impl Fn() + 'static) {
        self.loop_
            .with_channel(self.token, |ch| ch.set_error_cb(Rc::new(cb)));
    }

    /// Installs an override callback; when set, it receives every event and
    /// none of the other callbacks run.
    pub fn set_event_callback(&self, cb: impl Fn() + 'static) {
        self.loop_
            .with_channel(self.token, |ch| ch.set_event_cb(Rc::new(cb)));
    }

    /// Ties the channel to its owning object.
    ///
    /// Before dispatching an event the loop upgrades the tie and drops the
    /// event if the owner is gone; the strong reference is held for the
    /// duration of the dispatch so callbacks cannot pull the owner out from
    /// under themselves.
    pub fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let weak: Weak<T> = Arc::downgrade(owner);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        self.loop_.with_channel(self.token, |ch| ch.set_tie(weak));
    }

    pub fn is_reading(&self) -> bool {
        self.loop_.with_channel(self.token, |ch| {
            ch.interest().map_or(false, |i| i.is_readable())
        })
    }

    pub fn is_writing(&self) -> bool {
        self.loop_.with_channel(self.token, |ch| {
            ch.interest().map_or(false, |i| i.is_writable())
        })
    }

    pub fn enable_reading(&self) {
        self.update(|i| Some(i.map_or(Self::READ, |i| i | Self::READ)));
    }

    pub fn disable_reading(&self) {
        self.update(|i| i.and_then(|i| i.remove(Self::READ)));
    }

    pub fn enable_writing(&self) {
        self.update(|i| Some(i.map_or(Self::WRITE, |i| i | Self::WRITE)));
    }

    pub fn disable_writing(&self) {
        self.update(|i| i.and_then(|i| i.remove(Self::WRITE)));
    }

    /// Clears the whole interest set.
    pub fn disable_all(&self) {
        self.update(|_| None);
    }

    /// Unregisters the channel and retires its token.
    ///
    /// The interest set must already be empty (call
    /// [`disable_all`](ChannelRef::disable_all) first).
    pub fn remove(&self) {
        self.loop_.remove_channel(self.token);
    }

    fn update(&self, f: impl FnOnce(Option<Interest>) -> Option<Interest>) {
        self.loop_.with_channel(self.token, |ch| {
            let interest = f(ch.interest());
            ch.set_interest(interest);
        });
        self.loop_.update_channel(self.token);
    }
}
