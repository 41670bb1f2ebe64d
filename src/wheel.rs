use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::trace;

use crate::event_loop::LoopHandle;
use crate::{TimerId, TimerPriority};

/// Default rotation interval.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of buckets per ring.
pub const BUCKETS_PER_RING: usize = 100;

/// An opaque wheel entry. Whatever side effect the entry's `Drop` has fires
/// when its last bucket rotates out — that is the whole mechanism.
pub type WheelEntry = Arc<dyn Any + Send + Sync>;

type Bucket = Vec<WheelEntry>;

/// A coarse, cheap deadline structure: hierarchical bucket rings advanced by
/// a repeating timer.
///
/// Ring `i` advances once every `buckets_per_ring^i` rotations; advancing
/// pops the ring's front bucket, destroying the entries inside, and appends
/// a fresh bucket at the back. An entry inserted with delay `d` therefore
/// drops roughly `d` after its *last* insertion — re-inserting the same
/// `Arc` pushes the side effect out, which is how "kick an idle connection
/// after N seconds of silence" is expressed.
///
/// The rotation runs as a lowest-tier repeating timer on the owning loop, so
/// a tick's ordinary timers run before its buckets turn.
pub struct TimingWheel {
    handle: LoopHandle,
    inner: Mutex<Inner>,
    tick_interval: Duration,
    buckets_per_ring: usize,
    timer_id: Mutex<TimerId>,
    weak_self: Weak<TimingWheel>,
}

struct Inner {
    // Rings of varying precision, innermost first.
    rings: Vec<VecDeque<Bucket>>,
    // How many times the wheel has turned.
    ticks: u64,
}

impl TimingWheel {
    /// A wheel covering `max_timeout` with the default tick interval and
    /// bucket count.
    pub fn new(handle: LoopHandle, max_timeout: Duration) -> Arc<TimingWheel> {
        TimingWheel::with_layout(handle, max_timeout, TICK_INTERVAL, BUCKETS_PER_RING)
    }

    /// A wheel with an explicit tick interval and buckets per ring. The
    /// number of rings is the smallest `n` with
    /// `buckets_per_ring^n >= max_timeout / tick_interval`.
    pub fn with_layout(
        handle: LoopHandle,
        max_timeout: Duration,
        tick_interval: Duration,
        buckets_per_ring: usize,
    ) -> Arc<TimingWheel> {
        assert!(max_timeout > tick_interval);
        assert!(!tick_interval.is_zero());
        assert!(buckets_per_ring > 1);

        let max_ticks = ticks_for(max_timeout, tick_interval);
        let ring_count = ring_count(max_ticks, buckets_per_ring);
        let rings = (0..ring_count)
            .map(|_| {
                let mut ring = VecDeque::with_capacity(buckets_per_ring);
                ring.resize_with(buckets_per_ring, Bucket::new);
                ring
            })
            .collect();

        let wheel = Arc::new_cyclic(|weak| TimingWheel {
            handle: handle.clone(),
            inner: Mutex::new(Inner { rings, ticks: 0 }),
            tick_interval,
            buckets_per_ring,
            timer_id: Mutex::new(TimerId::INVALID),
            weak_self: weak.clone(),
        });

        let rotor = Arc::downgrade(&wheel);
        let timer_id = handle.run_every_prioritized(
            tick_interval,
            move |_| {
                if let Some(wheel) = rotor.upgrade() {
                    wheel.rotate();
                }
            },
            TimerPriority::Lowest,
        );
        *wheel.timer_id.lock().unwrap() = timer_id;
        wheel
    }

    /// The loop this wheel rotates on.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Schedules `entry` to drop `delay` from now (rounded up to whole
    /// ticks). Off-loop callers are bounced through the loop.
    pub fn insert_entry(&self, delay: Duration, entry: WheelEntry) {
        if delay.is_zero() {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.insert_entry_in_loop(delay, entry);
        } else if let Some(wheel) = self.weak_self.upgrade() {
            self.handle
                .run_in_loop(move || wheel.insert_entry_in_loop(delay, entry));
        }
    }

    fn insert_entry_in_loop(&self, delay: Duration, entry: WheelEntry) {
        self.handle.assert_in_loop_thread();

        let buckets = self.buckets_per_ring as u64;
        let mut delay = ticks_for(delay, self.tick_interval);
        let mut entry = entry;

        let mut inner = self.inner.lock().unwrap();
        let mut t = inner.ticks;
        let ring_count = inner.rings.len();
        for i in 0..ring_count {
            // The delay fits the span of this ring.
            if delay <= buckets {
                inner.rings[i][(delay - 1) as usize].push(entry);
                break;
            }
            if i < ring_count - 1 {
                // Bridge through the next outer ring: when that bucket
                // rotates out, drop the payload back into this ring.
                let weak = self.weak_self.clone();
                let inner_delay = delay;
                let inner_t = t;
                entry = Arc::new(CallbackEntry::new(move || {
                    if inner_delay > 0 {
                        if let Some(wheel) = weak.upgrade() {
                            let mut inner = wheel.inner.lock().unwrap();
                            let b = wheel.buckets_per_ring as u64;
                            let idx = ((inner_delay + (inner_t % b)) % b) as usize;
                            // The wheel may be tearing down, with its rings
                            // already taken out.
                            if let Some(ring) = inner.rings.get_mut(i) {
                                ring[idx].push(entry);
                            }
                        }
                    }
                }));
            } else {
                // Longer than the wheel can express; park it in the
                // outermost bucket.
                trace!("wheel entry delay exceeds span, clamping");
                inner.rings[i][(buckets - 1) as usize].push(entry);
                break;
            }
            delay = (delay + (t % buckets) - 1) / buckets;
            t /= buckets;
        }
    }

    fn rotate(&self) {
        // The dropped buckets must outlive the lock: entry destructors run
        // arbitrary code, including re-insertions into this wheel.
        let mut dropped: Vec<Bucket> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.ticks += 1;
            let t = inner.ticks;
            let mut pow = 1u64;
            for ring in inner.rings.iter_mut() {
                if t % pow == 0 {
                    if let Some(front) = ring.pop_front() {
                        if !front.is_empty() {
                            dropped.push(front);
                        }
                    }
                    ring.push_back(Bucket::new());
                }
                pow = pow.saturating_mul(self.buckets_per_ring as u64);
            }
        }
        drop(dropped);
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        let timer_id = *self.timer_id.lock().unwrap();
        if timer_id != TimerId::INVALID {
            self.handle.cancel_timer(timer_id);
        }
        // Clear outermost ring first so bridge entries find their inner
        // rings already emptied instead of repopulating them.
        let mut inner = self.inner.lock().unwrap();
        let mut rings = std::mem::take(&mut inner.rings);
        drop(inner);
        while let Some(ring) = rings.pop() {
            drop(ring);
        }
        trace!("timing wheel dropped");
    }
}

/// An entry whose destruction invokes a closure; the wheel's bridging
/// mechanism and anything else that wants "run this when the bucket turns".
pub(crate) struct CallbackEntry {
    cb: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackEntry {
    pub(crate) fn new(cb: impl FnOnce() + Send + Sync + 'static) -> CallbackEntry {
        CallbackEntry { cb: Some(Box::new(cb)) }
    }
}

impl Drop for CallbackEntry {
    fn drop(&mut self) {
        if let Some(cb) = self.cb.take() {
            cb();
        }
    }
}

fn ticks_for(delay: Duration, tick_interval: Duration) -> u64 {
    let ticks = delay.as_nanos() / tick_interval.as_nanos();
    let rem = delay.as_nanos() % tick_interval.as_nanos();
    (ticks + u128::from(rem != 0)) as u64
}

fn ring_count(max_ticks: u64, buckets_per_ring: usize) -> usize {
    let mut rings = 1;
    let mut span = buckets_per_ring as u64;
    while max_ticks > span {
        rings += 1;
        span = span.saturating_mul(buckets_per_ring as u64);
    }
    rings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_count_covers_the_timeout() {
        assert_eq!(ring_count(1, 100), 1);
        assert_eq!(ring_count(100, 100), 1);
        assert_eq!(ring_count(101, 100), 2);
        assert_eq!(ring_count(10_000, 100), 2);
        assert_eq!(ring_count(10_001, 100), 3);
        assert_eq!(ring_count(5, 2), 3);
    }

    #[test]
    fn ticks_round_up() {
        let tick = Duration::from_secs(1);
        assert_eq!(ticks_for(Duration::from_millis(1), tick), 1);
        assert_eq!(ticks_for(Duration::from_secs(1), tick), 1);
        assert_eq!(ticks_for(Duration::from_millis(1500), tick), 2);
        assert_eq!(ticks_for(Duration::from_secs(60), tick), 60);
    }

    #[test]
    fn callback_entry_fires_on_drop() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let entry = CallbackEntry::new(move || flag.store(true, Ordering::SeqCst));
        assert!(!fired.load(Ordering::SeqCst));
        drop(entry);
        assert!(fired.load(Ordering::SeqCst));
    }
}
