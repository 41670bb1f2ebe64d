use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as MemOrdering};
use std::time::{Duration, Instant};

/// Identifier of a registered timer.
///
/// Ids are drawn from a process-wide monotonic counter and never reused;
/// [`TimerId::INVALID`] (zero) is never handed out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

impl TimerId {
    /// The id no timer ever has.
    pub const INVALID: TimerId = TimerId(0);
}

/// When a timer runs relative to the other timers expiring in the same tick.
///
/// Each tick runs every expired `Highest` timer first, then the `Normal`
/// batch in deadline order, then every expired `Lowest` timer. The timing
/// wheel rotates in a `Lowest` timer so connection kick-offs observe a tick's
/// ordinary work before the buckets turn.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum TimerPriority {
    Highest,
    #[default]
    Normal,
    Lowest,
}

pub(crate) type TimerCallback = Box<dyn FnMut(TimerId)>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_timer_id() -> u64 {
    NEXT_TIMER_ID.fetch_add(1, MemOrdering::Relaxed)
}

pub(crate) struct Timer {
    id: u64,
    when: Instant,
    interval: Duration,
    repeat: bool,
    priority: TimerPriority,
    cb: TimerCallback,
}

impl Timer {
    pub(crate) fn new(
        id: u64,
        when: Instant,
        interval: Duration,
        repeat: bool,
        priority: TimerPriority,
        cb: TimerCallback,
    ) -> Timer {
        Timer {
            id,
            when,
            interval,
            repeat,
            priority,
            cb,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn priority(&self) -> TimerPriority {
        self.priority
    }

    pub(crate) fn is_repeat(&self) -> bool {
        self.repeat
    }

    pub(crate) fn run(&mut self) {
        (self.cb)(TimerId(self.id));
    }

    pub(crate) fn restart(&mut self, now: Instant) {
        self.when = now + self.interval;
    }
}

/// Heap entry ordered so that `BinaryHeap` (a max-heap) pops the earliest
/// deadline first; the id breaks ties in registration order.
struct HeapEntry(Timer);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &HeapEntry) -> bool {
        self.0.when == other.0.when && self.0.id == other.0.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &HeapEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &HeapEntry) -> Ordering {
        (other.0.when, other.0.id).cmp(&(self.0.when, self.0.id))
    }
}

/// Deadline-ordered timers with lazy cancellation.
///
/// Cancelling removes the id from the active set; an expired timer whose id
/// is no longer active is dropped silently before it would run.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<HeapEntry>,
    active: HashSet<u64>,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            heap: BinaryHeap::new(),
            active: HashSet::new(),
        }
    }

    /// Inserts a timer; returns true when it became the earliest deadline.
    pub(crate) fn add(&mut self, timer: Timer) -> bool {
        let earliest_changed = self
            .heap
            .peek()
            .map_or(true, |top| timer.when < top.0.when);
        self.active.insert(timer.id);
        self.heap.push(HeapEntry(timer));
        earliest_changed
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        self.active.remove(&id.0);
    }

    pub(crate) fn is_active(&self, id: u64) -> bool {
        self.active.contains(&id)
    }

    /// Earliest pending deadline, cancelled timers included (they produce at
    /// worst one spurious wakeup before being purged).
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.0.when)
    }

    /// Poll timeout for backends without a timer fd: time until the next
    /// deadline, clamped to [1 ms, `cap`].
    pub(crate) fn timeout(&self, cap: Duration, now: Instant) -> Duration {
        match self.next_deadline() {
            Some(when) => when
                .saturating_duration_since(now)
                .max(Duration::from_millis(1))
                .min(cap),
            None => cap,
        }
    }

    /// Removes and returns every timer with a deadline in the past, in
    /// deadline order. Cancelled timers are dropped on the way out.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.0.when >= now {
                break;
            }
            let timer = self.heap.pop().unwrap().0;
            if self.active.contains(&timer.id) {
                expired.push(timer);
            }
        }
        expired
    }

    /// Re-inserts still-active repeating timers at `now + interval` and
    /// forgets the rest.
    pub(crate) fn restore(&mut self, expired: Vec<Timer>, now: Instant) {
        for mut timer in expired {
            if !self.active.contains(&timer.id) {
                continue;
            }
            if timer.is_repeat() {
                timer.restart(now);
                self.heap.push(HeapEntry(timer));
            } else {
                self.active.remove(&timer.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn timer_at(queue: &mut TimerQueue, when: Instant, prio: TimerPriority, log: &Rc<RefCell<Vec<u64>>>) -> u64 {
        let id = next_timer_id();
        let log = Rc::clone(log);
        queue.add(Timer::new(
            id,
            when,
            Duration::ZERO,
            false,
            prio,
            Box::new(move |tid| log.borrow_mut().push(tid.0)),
        ));
        id
    }

    #[test]
    fn expires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let base = Instant::now();
        let b = timer_at(&mut queue, base + Duration::from_millis(2), TimerPriority::Normal, &log);
        let a = timer_at(&mut queue, base + Duration::from_millis(1), TimerPriority::Normal, &log);

        let mut expired = queue.take_expired(base + Duration::from_millis(10));
        for timer in &mut expired {
            timer.run();
        }
        queue.restore(expired, base);
        assert_eq!(*log.borrow(), vec![a, b]);
        assert!(queue.next_deadline().is_none());
    }

    #[test]
    fn cancelled_timer_is_dropped_silently() {
        let mut queue = TimerQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let base = Instant::now();
        let id = timer_at(&mut queue, base + Duration::from_millis(1), TimerPriority::Normal, &log);
        queue.cancel(TimerId(id));
        let expired = queue.take_expired(base + Duration::from_millis(10));
        assert!(expired.is_empty());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn earliest_changed_reported_on_add() {
        let mut queue = TimerQueue::new();
        let base = Instant::now();
        let log = Rc::new(RefCell::new(Vec::new()));
        assert!(queue.add(Timer::new(
            next_timer_id(),
            base + Duration::from_secs(10),
            Duration::ZERO,
            false,
            TimerPriority::Normal,
            Box::new(|_| {}),
        )));
        // A later deadline does not move the front.
        let id = next_timer_id();
        assert!(!queue.add(Timer::new(
            id,
            base + Duration::from_secs(20),
            Duration::ZERO,
            false,
            TimerPriority::Normal,
            Box::new(|_| {}),
        )));
        let _ = timer_at(&mut queue, base, TimerPriority::Normal, &log);
        assert_eq!(queue.next_deadline(), Some(base));
    }

    #[test]
    fn timeout_clamps() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let cap = Duration::from_secs(10);
        assert_eq!(queue.timeout(cap, now), cap);

        queue.add(Timer::new(
            next_timer_id(),
            now + Duration::from_secs(30),
            Duration::ZERO,
            false,
            TimerPriority::Normal,
            Box::new(|_| {}),
        ));
        assert_eq!(queue.timeout(cap, now), cap);

        queue.add(Timer::new(
            next_timer_id(),
            now,
            Duration::ZERO,
            false,
            TimerPriority::Normal,
            Box::new(|_| {}),
        ));
        assert_eq!(queue.timeout(cap, now), Duration::from_millis(1));
    }
}
