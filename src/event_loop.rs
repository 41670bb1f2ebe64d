use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use log::{error, trace, warn};

use crate::channel::{Channel, ChannelRef};
use crate::poller::Poller;
use crate::timer::{next_timer_id, Timer, TimerCallback, TimerQueue};
use crate::token::WAKE_TOKEN;
#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::token::TIMER_TOKEN;
use crate::{sys, Ready, Token};
use crate::{TimerId, TimerPriority};

/// Upper bound of one poller wait. Where the timer fd participates as a
/// readiness source this is the whole timeout; elsewhere the next timer
/// deadline caps it further.
const POLL_TIME: Duration = Duration::from_secs(10);

thread_local! {
    static CURRENT_LOOP: Cell<Option<NonNull<EventLoop>>> = const { Cell::new(None) };
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// The part of a loop other threads may touch: task queues, the waker and
/// the lifecycle flags. `LoopHandle` is an `Arc` of this.
pub(crate) struct LoopShared {
    id: u64,
    tasks: ConcurrentQueue<Task>,
    quit_tasks: ConcurrentQueue<Task>,
    waker: sys::Waker,
    looping: AtomicBool,
    quit: AtomicBool,
}

/// A single-threaded reactor.
///
/// An event loop drives one poller: each iteration waits for readiness,
/// expires timers, dispatches every active channel's callbacks and then
/// drains the queued tasks, so tasks queued by callbacks run in the same
/// tick, after all channels. The loop binds to whichever thread calls
/// [`run`](EventLoop::run) and everything it owns — channels, timers, the
/// poller — must only be touched from that thread; the [`LoopHandle`] is the
/// cross-thread doorway.
///
/// # Examples
///
/// ```no_run
/// use netloop::EventLoop;
/// use std::time::Duration;
///
/// let event_loop = EventLoop::new().unwrap();
/// let handle = event_loop.handle();
/// event_loop.run_after(Duration::from_millis(10), move |_| handle.quit());
/// event_loop.run();
/// ```
pub struct EventLoop {
    poller: RefCell<Poller>,
    channels: RefCell<slab::Slab<Channel>>,
    // Channel slots removed mid-tick; freed at the next tick boundary so a
    // token never aliases a new channel within the tick that removed it.
    retired: RefCell<Vec<usize>>,
    timers: RefCell<TimerQueue>,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    timer_fd: sys::TimerFd,
    local_tasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    shared: Arc<LoopShared>,
    event_handling: Cell<bool>,
    context: RefCell<Option<Box<dyn Any>>>,
    // Neither `Send` nor `Sync`; a loop lives and dies on one thread.
    _marker: PhantomData<*const ()>,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let mut poller = Poller::new()?;
        let waker = poller.setup_waker()?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let timer_fd = {
            use std::os::fd::AsRawFd;
            let timer_fd = sys::TimerFd::new()?;
            poller.register(timer_fd.as_raw_fd(), TIMER_TOKEN, crate::Interest::READABLE)?;
            timer_fd
        };

        Ok(EventLoop {
            poller: RefCell::new(poller),
            channels: RefCell::new(slab::Slab::new()),
            retired: RefCell::new(Vec::new()),
            timers: RefCell::new(TimerQueue::new()),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            timer_fd,
            local_tasks: RefCell::new(VecDeque::new()),
            shared: Arc::new(LoopShared {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                tasks: ConcurrentQueue::unbounded(),
                quit_tasks: ConcurrentQueue::unbounded(),
                waker,
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
            }),
            event_handling: Cell::new(false),
            context: RefCell::new(None),
            _marker: PhantomData,
        })
    }

    /// The cross-thread handle of this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    /// True while [`run`](EventLoop::run) is executing on the calling
    /// thread. Before `run`, no thread counts as the loop thread.
    pub fn is_in_loop_thread(&self) -> bool {
        current_loop_id() == Some(self.shared.id)
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    /// Runs `f` with the loop currently executing on this thread, if any.
    pub(crate) fn with_current<R>(f: impl FnOnce(&EventLoop) -> R) -> Option<R> {
        CURRENT_LOOP.with(|current| {
            current.get().map(|ptr| {
                // SAFETY: the pointer is installed by `run` from `&self` and
                // cleared before `run` returns; any code observing it on
                // this thread runs inside that borrow's extent.
                let event_loop = unsafe { ptr.as_ref() };
                f(event_loop)
            })
        })
    }

    /// Runs the loop on the calling thread until [`quit`](LoopHandle::quit).
    ///
    /// A panic escaping a callback stops the loop, runs the on-quit tasks
    /// and is then propagated.
    pub fn run(&self) {
        assert!(!self.is_looping(), "event loop is already running");
        CURRENT_LOOP.with(|current| {
            assert!(
                current.get().is_none(),
                "another event loop is already running on this thread"
            );
            current.set(Some(NonNull::from(self)));
        });
        self.shared.looping.store(true, Ordering::Release);
        self.shared.quit.store(false, Ordering::Release);

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_inner()));

        // Run the quit tasks even if a panic unwound the loop body.
        while let Ok(task) = self.shared.quit_tasks.pop() {
            task();
        }

        self.shared.looping.store(false, Ordering::Release);
        CURRENT_LOOP.with(|current| current.set(None));

        if let Err(payload) = result {
            warn!("panic escaped the event loop; rethrowing after running quit tasks");
            panic::resume_unwind(payload);
        }
    }

    fn run_inner(&self) {
        let mut active: Vec<(Token, Ready)> = Vec::new();
        while !self.shared.quit.load(Ordering::Acquire) {
            active.clear();
            self.free_retired();

            let timeout = self.poll_timeout();
            if let Err(err) = self.poller.borrow_mut().poll(Some(timeout), &mut active) {
                if err.kind() != io::ErrorKind::Interrupted {
                    error!("poller wait failed: {}", err);
                }
            }

            // Without a timer fd the wait itself was the timer.
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            self.process_timers();

            self.event_handling.set(true);
            for &(token, ready) in active.iter() {
                self.handle_event(token, ready);
            }
            self.event_handling.set(false);

            self.run_pending_tasks();
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn poll_timeout(&self) -> Duration {
        POLL_TIME
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn poll_timeout(&self) -> Duration {
        self.timers.borrow().timeout(POLL_TIME, Instant::now())
    }

    fn handle_event(&self, token: Token, ready: Ready) {
        if token == WAKE_TOKEN {
            self.shared.waker.drain();
            return;
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if token == TIMER_TOKEN {
            self.timer_fd.drain();
            self.process_timers();
            return;
        }

        let (interest, ready, callbacks) = {
            let mut channels = self.channels.borrow_mut();
            let channel = match channels.get_mut(token.0) {
                Some(channel) if !channel.is_retired() => channel,
                // The channel went away earlier this tick; sporadic events
                // happen.
                _ => {
                    trace!("event for unknown {:?}, dropping", token);
                    return;
                }
            };
            channel.set_revents(ready);
            (channel.interest(), channel.revents(), channel.callbacks())
        };

        if interest.is_none() && callbacks.event.is_none() {
            return;
        }

        // Hold the owner alive across the dispatch; a dead owner means the
        // event is stale.
        let _guard: Option<Arc<dyn Any + Send + Sync>> = match &callbacks.tie {
            Some(tie) => match tie.upgrade() {
                Some(guard) => Some(guard),
                None => return,
            },
            None => None,
        };

        if let Some(cb) = &callbacks.event {
            cb();
            return;
        }
        if ready.is_hup() && !ready.is_readable() {
            if let Some(cb) = &callbacks.close {
                cb();
            }
        }
        if ready.is_error() {
            if let Some(cb) = &callbacks.error {
                cb();
            }
        }
        if ready.is_readable() || ready.is_priority() {
            if let Some(cb) = &callbacks.read {
                cb();
            }
        }
        if ready.is_writable() {
            if let Some(cb) = &callbacks.write {
                cb();
            }
        }
    }

    fn process_timers(&self) {
        let now = Instant::now();
        let expired = self.timers.borrow_mut().take_expired(now);
        if !expired.is_empty() {
            let mut highest = Vec::new();
            let mut normal = Vec::new();
            let mut lowest = Vec::new();
            for timer in expired {
                match timer.priority() {
                    TimerPriority::Highest => highest.push(timer),
                    TimerPriority::Normal => normal.push(timer),
                    TimerPriority::Lowest => lowest.push(timer),
                }
            }

            let mut processed = Vec::new();
            for batch in [highest, normal, lowest] {
                for mut timer in batch {
                    // A callback earlier in the tick may have cancelled it.
                    if self.timers.borrow().is_active(timer.id()) {
                        timer.run();
                    }
                    processed.push(timer);
                }
            }
            self.timers.borrow_mut().restore(processed, now);
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(next) = self.timers.borrow().next_deadline() {
            if let Err(err) = self.timer_fd.set_deadline(next) {
                error!("failed to rearm timer fd: {}", err);
            }
        }
    }

    fn run_pending_tasks(&self) {
        loop {
            let local = self.local_tasks.borrow_mut().pop_front();
            if let Some(task) = local {
                task();
                continue;
            }
            match self.shared.tasks.pop() {
                Ok(task) => task(),
                Err(_) => break,
            }
        }
    }

    fn free_retired(&self) {
        // Slots are only freed at the tick boundary, never while events are
        // being dispatched.
        debug_assert!(!self.event_handling.get());
        let mut retired = self.retired.borrow_mut();
        if retired.is_empty() {
            return;
        }
        let mut channels = self.channels.borrow_mut();
        for index in retired.drain(..) {
            let _ = channels.try_remove(index);
        }
    }

    /// Runs `f` now.
    ///
    /// Holding an `&EventLoop` means being on the loop thread (or setting
    /// the loop up before it runs), so unlike
    /// [`LoopHandle::run_in_loop`] there is never a queue hop.
    pub fn run_in_loop(&self, f: impl FnOnce()) {
        f();
    }

    /// Defers `f` to the end of the current tick (or the first tick, when
    /// the loop is not running yet).
    pub fn queue_in_loop(&self, f: impl FnOnce() + 'static) {
        self.local_tasks.borrow_mut().push_back(Box::new(f));
        if !self.is_looping() {
            if let Err(err) = self.shared.waker.wake() {
                error!("failed to wake event loop: {}", err);
            }
        }
    }

    /// Registers `f` to run when the loop quits, even when it quits by
    /// panic.
    pub fn run_on_quit(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.shared.quit_tasks.push(Box::new(f));
    }

    /// Stops the loop after the current tick.
    pub fn quit(&self) {
        self.handle().quit();
    }

    // ===== channels =====

    /// Adds a channel for `fd` and returns its token. The channel starts
    /// with an empty interest set.
    pub fn add_channel(&self, fd: RawFd) -> Token {
        let token = Token(self.channels.borrow_mut().insert(Channel::new(fd)));
        trace!("new channel for fd {} as {:?}", fd, token);
        token
    }

    /// Handle to an existing channel.
    pub fn channel(&self, token: Token) -> ChannelRef<'_> {
        ChannelRef {
            loop_: self,
            token,
        }
    }

    pub(crate) fn with_channel<R>(&self, token: Token, f: impl FnOnce(&mut Channel) -> R) -> R {
        let mut channels = self.channels.borrow_mut();
        let channel = channels
            .get_mut(token.0)
            .unwrap_or_else(|| panic!("{:?} does not name a channel", token));
        f(channel)
    }

    pub(crate) fn update_channel(&self, token: Token) {
        use crate::channel::ChannelState::*;

        let (fd, interest, state) =
            self.with_channel(token, |ch| (ch.fd(), ch.interest(), ch.state()));
        let mut poller = self.poller.borrow_mut();
        let result = match state {
            New | Deleted => match interest {
                Some(interest) => poller
                    .register(fd, token, interest)
                    .map(|()| self.with_channel(token, |ch| ch.set_state(Added))),
                // Nothing to tell the kernel about yet.
                None => Ok(()),
            },
            Added => match interest {
                Some(interest) => poller.reregister(fd, token, interest),
                None => poller
                    .disable(fd)
                    .map(|()| self.with_channel(token, |ch| ch.set_state(Deleted))),
            },
        };
        if let Err(err) = result {
            error!("failed to update channel for fd {}: {}", fd, err);
        }
    }

    pub(crate) fn remove_channel(&self, token: Token) {
        use crate::channel::ChannelState::*;

        let (fd, interest, state) =
            self.with_channel(token, |ch| (ch.fd(), ch.interest(), ch.state()));
        assert!(
            interest.is_none(),
            "channel removed while events are still enabled"
        );
        let result = match state {
            Added => self.poller.borrow_mut().deregister(fd),
            Deleted => self.poller.borrow_mut().purge(fd),
            New => Ok(()),
        };
        if let Err(err) = result {
            error!("failed to deregister fd {}: {}", fd, err);
        }
        self.with_channel(token, |ch| {
            ch.set_state(New);
            ch.retire();
        });
        self.retired.borrow_mut().push(token.0);
    }

    // ===== timers =====

    /// Runs `cb` once at `when`.
    pub fn run_at(&self, when: Instant, cb: impl FnMut(TimerId) + 'static) -> TimerId {
        self.run_at_prioritized(when, cb, TimerPriority::Normal)
    }

    /// Runs `cb` once at `when` in the given tier of its tick.
    pub fn run_at_prioritized(
        &self,
        when: Instant,
        cb: impl FnMut(TimerId) + 'static,
        priority: TimerPriority,
    ) -> TimerId {
        let id = next_timer_id();
        self.add_timer(id, when, Duration::ZERO, false, priority, Box::new(cb));
        TimerId(id)
    }

    /// Runs `cb` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut(TimerId) + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Runs `cb` once, `delay` from now, in the given tier of its tick.
    pub fn run_after_prioritized(
        &self,
        delay: Duration,
        cb: impl FnMut(TimerId) + 'static,
        priority: TimerPriority,
    ) -> TimerId {
        self.run_at_prioritized(Instant::now() + delay, cb, priority)
    }

    /// Runs `cb` every `interval`, starting one interval from now.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut(TimerId) + 'static) -> TimerId {
        self.run_every_prioritized(interval, cb, TimerPriority::Normal)
    }

    /// Runs `cb` every `interval` in the given tier of its tick.
    pub fn run_every_prioritized(
        &self,
        interval: Duration,
        cb: impl FnMut(TimerId) + 'static,
        priority: TimerPriority,
    ) -> TimerId {
        assert!(!interval.is_zero(), "repeating timer with a zero interval");
        let id = next_timer_id();
        self.add_timer(
            id,
            Instant::now() + interval,
            interval,
            true,
            priority,
            Box::new(cb),
        );
        TimerId(id)
    }

    /// Cancels a timer. The callback will not run again once this returns
    /// on the loop thread (a tick already in flight may still run it when
    /// cancelling from elsewhere).
    pub fn cancel_timer(&self, id: TimerId) {
        self.timers.borrow_mut().cancel(id);
    }

    pub(crate) fn add_timer(
        &self,
        id: u64,
        when: Instant,
        interval: Duration,
        repeat: bool,
        priority: TimerPriority,
        cb: TimerCallback,
    ) {
        trace!("adding timer {} for {:?}", id, when);
        let earliest_changed = self
            .timers
            .borrow_mut()
            .add(Timer::new(id, when, interval, repeat, priority, cb));
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if earliest_changed {
            if let Err(err) = self.timer_fd.set_deadline(when) {
                error!("failed to arm timer fd: {}", err);
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = earliest_changed;
    }

    // ===== context =====

    /// Stores an opaque user value on the loop.
    pub fn set_context<T: Any>(&self, value: T) {
        *self.context.borrow_mut() = Some(Box::new(value));
    }

    /// Borrows the stored context, downcast to `T`.
    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut context = self.context.borrow_mut();
        f(context.as_mut().and_then(|ctx| ctx.downcast_mut::<T>()))
    }

    pub fn clear_context(&self) {
        *self.context.borrow_mut() = None;
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Dropping from another thread while the loop still runs is a logic
        // error; the owner (an EventLoopThread) quits and joins first.
        debug_assert!(!self.is_looping() || self.is_in_loop_thread());
    }
}

fn current_loop_id() -> Option<u64> {
    EventLoop::with_current(|event_loop| event_loop.shared.id)
}

/// Sharable, sendable handle to an [`EventLoop`].
///
/// The handle outlives nothing: it may outlast its loop, in which case
/// queued work is silently dropped with the queues.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    /// True when the calling thread is currently running this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        current_loop_id() == Some(self.shared.id)
    }

    /// Panics unless called on the loop thread.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "operation is forbidden off the event-loop thread"
        );
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    /// Runs `f` on the loop thread: immediately when already there, else
    /// queued and woken.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queues `f` for the end of the current tick (or the first tick).
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.shared.tasks.push(Box::new(f));
        if !self.is_in_loop_thread() || !self.is_looping() {
            self.wake();
        }
    }

    /// Registers `f` to run when the loop quits.
    pub fn run_on_quit(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.shared.quit_tasks.push(Box::new(f));
    }

    /// Stops the loop after its current tick. Idempotent; wakes the loop
    /// when called from another thread.
    pub fn quit(&self) {
        if self.shared.quit.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    fn wake(&self) {
        if let Err(err) = self.shared.waker.wake() {
            error!("failed to wake event loop {}: {}", self.shared.id, err);
        }
    }

    /// Runs `f` with the loop itself; must be called on the loop thread.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&EventLoop) -> R) -> R {
        let id = self.shared.id;
        EventLoop::with_current(|event_loop| {
            assert!(
                event_loop.id() == id,
                "operation landed on the wrong event loop"
            );
            f(event_loop)
        })
        .expect("operation is forbidden off the event-loop thread")
    }

    // ===== timers =====

    /// Thread-safe [`EventLoop::run_at`]; the id is allocated immediately,
    /// the timer is installed on the loop thread.
    pub fn run_at(&self, when: Instant, cb: impl FnMut(TimerId) + Send + 'static) -> TimerId {
        self.run_at_prioritized(when, cb, TimerPriority::Normal)
    }

    pub fn run_at_prioritized(
        &self,
        when: Instant,
        cb: impl FnMut(TimerId) + Send + 'static,
        priority: TimerPriority,
    ) -> TimerId {
        let id = next_timer_id();
        self.install_timer(id, when, Duration::ZERO, false, priority, cb);
        TimerId(id)
    }

    /// Thread-safe [`EventLoop::run_after`].
    pub fn run_after(&self, delay: Duration, cb: impl FnMut(TimerId) + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, cb)
    }

    pub fn run_after_prioritized(
        &self,
        delay: Duration,
        cb: impl FnMut(TimerId) + Send + 'static,
        priority: TimerPriority,
    ) -> TimerId {
        self.run_at_prioritized(Instant::now() + delay, cb, priority)
    }

    /// Thread-safe [`EventLoop::run_every`].
    pub fn run_every(
        &self,
        interval: Duration,
        cb: impl FnMut(TimerId) + Send + 'static,
    ) -> TimerId {
        self.run_every_prioritized(interval, cb, TimerPriority::Normal)
    }

    pub fn run_every_prioritized(
        &self,
        interval: Duration,
        cb: impl FnMut(TimerId) + Send + 'static,
        priority: TimerPriority,
    ) -> TimerId {
        assert!(!interval.is_zero(), "repeating timer with a zero interval");
        let id = next_timer_id();
        self.install_timer(id, Instant::now() + interval, interval, true, priority, cb);
        TimerId(id)
    }

    fn install_timer(
        &self,
        id: u64,
        when: Instant,
        interval: Duration,
        repeat: bool,
        priority: TimerPriority,
        cb: impl FnMut(TimerId) + Send + 'static,
    ) {
        let handle = self.clone();
        self.run_in_loop(move || {
            handle.with(|event_loop| {
                event_loop.add_timer(id, when, interval, repeat, priority, Box::new(cb));
            });
        });
    }

    /// Thread-safe [`EventLoop::cancel_timer`].
    pub fn cancel_timer(&self, id: TimerId) {
        if self.is_in_loop_thread() {
            self.with(|event_loop| event_loop.cancel_timer(id));
        } else {
            let handle = self.clone();
            self.queue_in_loop(move || handle.with(|event_loop| event_loop.cancel_timer(id)));
        }
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").field("id", &self.shared.id).finish()
    }
}
