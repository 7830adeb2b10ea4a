// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hierarchical timer wheel for coarse, jiffy-resolution timers.
//!
//! The wheel trades precision for scalability: insertion and cancellation are
//! O(1), and advancing the wheel by `n` ticks touches a bounded number of
//! buckets regardless of how many timers are pending. It is the right home
//! for timers whose wakeup need not be exact -- retransmit timers, idle
//! timeouts, and the like. Anything that needs nanosecond placement belongs
//! in the companion high-resolution engine instead.
//!
//! # Geometry
//!
//! There are [`LEVELS`] levels of [`SLOTS`] buckets each. Level `L` has a
//! granularity of `2^(3L)` ticks, so each level is three bits coarser than
//! the one below it and directly spans deltas up to `64 << 3L` ticks. A
//! timer is parked at the finest level that can span its delta; deltas
//! beyond the range of the coarsest level are clamped there and will take
//! several cascade hops to arrive. As the wheel's tick position crosses a
//! bucket, timers found there either fire (deadline reached at this level's
//! granularity and every finer one) or are re-bucketed at a finer level --
//! the classic cascading scheme.
//!
//! # Ownership
//!
//! The wheel owns its timer records. `add` moves the callback into an
//! internal slot arena and hands back a generational [`TimerHandle`]; a
//! handle goes stale the moment its timer fires or is cancelled, and stale
//! handles are simply ignored thereafter. There is no way to register the
//! same timer twice, and no dangling references for a caller to misuse.
//!
//! # Context
//!
//! No operation blocks or waits. `advance` runs timer callbacks inline, so
//! callbacks must themselves be brief and non-blocking; they are expected to
//! run in interrupt context on most ports.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::array;
use core::fmt;
use core::mem;

use static_assertions::const_assert;

/// Number of wheel levels.
pub const LEVELS: usize = 8;

/// Buckets per level.
pub const SLOTS: usize = 64;

/// Granularity step between adjacent levels, in bits.
pub const LEVEL_SHIFT: u32 = 3;

const SLOT_MASK: u64 = SLOTS as u64 - 1;

// Bucket addressing at the coarsest level must still fit in a u64 shift.
const_assert!(SLOTS.is_power_of_two());
const_assert!((LEVELS as u32 - 1) * LEVEL_SHIFT + SLOTS.trailing_zeros() <= 64);

/// Handle naming one live timer registration.
///
/// Handles are generational: once the timer fires or is cancelled, the
/// handle is dead and every operation on it becomes a harmless no-op (in
/// particular, [`TimerWheel::cancel`] returns `false`). A handle is never
/// reissued for a different timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerHandle {
    index: u32,
    generation: u32,
}

/// Reference to an arena slot, stored in a bucket. Stale references (the
/// slot has since been freed or recycled) are detected by generation
/// mismatch and dropped when the bucket is next touched.
#[derive(Copy, Clone)]
struct SlotRef {
    index: u32,
    generation: u32,
}

struct Entry {
    deadline: u64,
    callback: Box<dyn FnMut() + Send>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Flat event counts, for debug tooling and tests.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct WheelCounters {
    pub added: u64,
    pub fired: u64,
    pub cancelled: u64,
    pub cascaded: u64,
}

/// The wheel proper.
///
/// This is a plain owned value: build one per core, or wrap one in a lock if
/// it must be shared. Nothing here is process-global.
pub struct TimerWheel {
    /// Current wheel time, in ticks. Advanced only by [`Self::advance`].
    jiffies: u64,
    buckets: [[Vec<SlotRef>; SLOTS]; LEVELS],
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    /// Cached earliest pending deadline. Only meaningful while
    /// `hint_valid`; recomputed lazily by [`Self::next_event`].
    hint: Option<u64>,
    hint_valid: bool,
    counters: WheelCounters,
}

impl TimerWheel {
    /// Creates an empty wheel with its clock at tick zero.
    pub fn new() -> Self {
        Self::new_at(0)
    }

    /// Creates an empty wheel with its clock at `jiffies`.
    pub fn new_at(jiffies: u64) -> Self {
        Self {
            jiffies,
            buckets: array::from_fn(|_| array::from_fn(|_| Vec::new())),
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            hint: None,
            hint_valid: true,
            counters: WheelCounters::default(),
        }
    }

    /// Current wheel time in ticks.
    pub fn now(&self) -> u64 {
        self.jiffies
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn counters(&self) -> &WheelCounters {
        &self.counters
    }

    /// Registers a timer to fire once `deadline` (absolute, in ticks) has
    /// passed at the owning level's granularity.
    ///
    /// A deadline at or before the current tick is legal; the timer lands in
    /// a level-0 bucket and fires when that bucket is next crossed, within
    /// one 64-tick cycle. Callers needing fire-immediately semantics want
    /// the high-resolution engine, not the wheel.
    pub fn add<F>(&mut self, deadline: u64, callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(Entry {
            deadline,
            callback: Box::new(callback),
        });
        let r = SlotRef {
            index,
            generation: slot.generation,
        };
        self.link(r, deadline);
        self.live += 1;
        self.counters.added += 1;
        if self.hint_valid {
            self.hint = Some(match self.hint {
                Some(h) => h.min(deadline),
                None => deadline,
            });
        }
        TimerHandle {
            index: r.index,
            generation: r.generation,
        }
    }

    /// Cancels a pending timer. Returns `true` iff the handle named a live
    /// registration; stale handles return `false`.
    ///
    /// The bucket reference is left behind and discarded lazily when the
    /// bucket is next processed.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation || slot.entry.is_none() {
            return false;
        }
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        self.counters.cancelled += 1;
        // The cached hint may have been this timer's deadline.
        self.hint_valid = false;
        true
    }

    /// Deadline of a pending timer, or `None` for a stale handle.
    pub fn deadline(&self, handle: TimerHandle) -> Option<u64> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref().map(|e| e.deadline)
    }

    /// Advances wheel time by `ticks` and fires everything that came due.
    ///
    /// Buckets are processed level by level, finest first, in increasing
    /// tick order; within a bucket, timers run in insertion order. A timer
    /// whose true deadline has not arrived yet (it was parked at a coarser
    /// granularity) is re-bucketed at a finer level instead of firing. Once
    /// a level's bucket index has not moved, no coarser level can have
    /// anything due and processing stops.
    ///
    /// Each level visits at most [`SLOTS`] buckets per call, so a huge
    /// `ticks` argument costs one full sweep of the wheel plus the timers
    /// actually due -- it cannot loop.
    ///
    /// All due timers are unlinked before any callback runs; callbacks
    /// wanting periodic behavior re-add themselves through whatever context
    /// they captured, after this call returns. Returns the number fired.
    pub fn advance(&mut self, ticks: u64) -> usize {
        let old = self.jiffies;
        let new = old.saturating_add(ticks);
        self.jiffies = new;

        let mut expired: Vec<Entry> = Vec::new();
        for level in 0..LEVELS {
            let shift = LEVEL_SHIFT * level as u32;
            let old_pos = old >> shift;
            let new_pos = new >> shift;
            if old_pos == new_pos {
                // Nothing crossed here, so nothing crossed at any coarser
                // level either.
                break;
            }
            let steps = (new_pos - old_pos).min(SLOTS as u64);
            for i in 1..=steps {
                let bucket = ((old_pos + i) & SLOT_MASK) as usize;
                let refs = mem::take(&mut self.buckets[level][bucket]);
                for r in refs {
                    let deadline = {
                        let Some(slot) = self.slots.get_mut(r.index as usize)
                        else {
                            continue;
                        };
                        if slot.generation != r.generation {
                            // Cancelled (or long gone); drop the reference.
                            continue;
                        }
                        match slot.entry.as_ref() {
                            Some(e) => e.deadline,
                            None => continue,
                        }
                    };
                    if deadline > new {
                        // Cascade: this bucket was only coarse-grained
                        // cover; re-park at the level that can now place it
                        // more precisely.
                        self.link(r, deadline);
                        self.counters.cascaded += 1;
                    } else {
                        let slot = &mut self.slots[r.index as usize];
                        let entry = match slot.entry.take() {
                            Some(e) => e,
                            None => continue,
                        };
                        slot.generation = slot.generation.wrapping_add(1);
                        self.free.push(r.index);
                        self.live -= 1;
                        expired.push(entry);
                    }
                }
            }
        }

        // Every due timer is unlinked (its handle dead) before the first
        // callback runs.
        let fired = expired.len();
        for mut entry in expired {
            (entry.callback)();
        }
        self.counters.fired += fired as u64;
        self.hint_valid = false;
        fired
    }

    /// Earliest pending deadline, or `None` if the wheel is empty.
    ///
    /// The value is cached and only recomputed after an `advance` or
    /// `cancel` invalidated it. Clock sources use this to decide how far
    /// ahead the next wheel tick may be pushed.
    pub fn next_event(&mut self) -> Option<u64> {
        if !self.hint_valid {
            self.recompute_hint();
        }
        self.hint
    }

    /// Files `r` in the bucket for `deadline` relative to the current tick.
    fn link(&mut self, r: SlotRef, deadline: u64) {
        let (level, bucket) = position(self.jiffies, deadline);
        self.buckets[level][bucket].push(r);
    }

    /// Full-scan recomputation of the next-event hint. Also purges stale
    /// bucket references as it goes.
    fn recompute_hint(&mut self) {
        let mut best: Option<u64> = None;
        let slots = &self.slots;
        for level in self.buckets.iter_mut() {
            for bucket in level.iter_mut() {
                bucket.retain(|r| {
                    let slot = &slots[r.index as usize];
                    slot.generation == r.generation && slot.entry.is_some()
                });
                for r in bucket.iter() {
                    if let Some(e) = slots[r.index as usize].entry.as_ref() {
                        best = Some(match best {
                            Some(b) => b.min(e.deadline),
                            None => e.deadline,
                        });
                    }
                }
            }
        }
        self.hint = best;
        self.hint_valid = true;
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel")
            .field("jiffies", &self.jiffies)
            .field("live", &self.live)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

/// Computes the (level, bucket) a deadline belongs in, as seen from `now`.
///
/// The level is the smallest `L` with `deadline - now < 64 << 3L`, clamped
/// to the coarsest level; the bucket is the deadline's own bits at that
/// level's granularity, `(deadline >> 3L) & 63`.
fn position(now: u64, deadline: u64) -> (usize, usize) {
    let delta = deadline.saturating_sub(now);
    let mut level = 0;
    while level < LEVELS - 1
        && delta >= (SLOTS as u64) << (LEVEL_SHIFT * level as u32)
    {
        level += 1;
    }
    let bucket = ((deadline >> (LEVEL_SHIFT * level as u32)) & SLOT_MASK) as usize;
    (level, bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    fn counter_cb(counter: &Arc<AtomicU64>) -> impl FnMut() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn placement_scenario() {
        // now=0, deadline=70: one level up, bucket (70 >> 3) & 63.
        assert_eq!(position(0, 70), (1, 8));
    }

    #[test]
    fn placement_level_boundaries() {
        // Deltas inside the level-0 span stay at level 0.
        assert_eq!(position(0, 0), (0, 0));
        assert_eq!(position(0, 63), (0, 63));
        // Exactly 64 is the first delta level 0 cannot span.
        assert_eq!(position(0, 64), (1, 8));
        assert_eq!(position(0, 511), (1, 63));
        // 512 = 64 << 3 rolls over to level 2.
        assert_eq!(position(0, 512), (2, 8));
        // The coarsest level takes everything else.
        assert_eq!(position(0, u64::MAX).0, LEVELS - 1);
    }

    #[test]
    fn placement_is_relative_to_now() {
        // Same deadline, later now: smaller delta, finer level.
        assert_eq!(position(0, 100).0, 1);
        assert_eq!(position(90, 100).0, 0);
        assert_eq!(position(90, 100).1, 100 & 63);
    }

    #[test]
    fn fires_exactly_at_deadline_after_cascade() {
        let mut wheel = TimerWheel::new();
        let fired = Arc::new(AtomicU64::new(0));
        wheel.add(70, counter_cb(&fired));

        // Crossing the level-1 bucket cascades but must not fire early.
        assert_eq!(wheel.advance(64), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(wheel.counters().cascaded >= 1);

        assert_eq!(wheel.advance(5), 0); // now 69
        assert_eq!(wheel.advance(1), 1); // now 70
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn single_advance_covers_cascade_and_fire() {
        let mut wheel = TimerWheel::new();
        let fired = Arc::new(AtomicU64::new(0));
        wheel.add(70, counter_cb(&fired));

        // One big jump: the level-1 bucket and the deadline are both inside
        // this advance, so the timer fires exactly once within it.
        assert_eq!(wheel.advance(70), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_fire() {
        let mut wheel = TimerWheel::new();
        let fired = Arc::new(AtomicU64::new(0));
        let handle = wheel.add(10, counter_cb(&fired));

        assert!(wheel.cancel(handle));
        // Second cancel sees a stale handle.
        assert!(!wheel.cancel(handle));

        assert_eq!(wheel.advance(100), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(wheel.counters().cancelled, 1);
    }

    #[test]
    fn handle_goes_stale_after_fire() {
        let mut wheel = TimerWheel::new();
        let handle = wheel.add(5, || {});
        assert_eq!(wheel.advance(5), 1);
        assert!(!wheel.cancel(handle));
        assert_eq!(wheel.deadline(handle), None);
    }

    #[test]
    fn slot_reuse_does_not_resurrect_old_handle() {
        let mut wheel = TimerWheel::new();
        let first = wheel.add(10, || {});
        assert!(wheel.cancel(first));

        // The freed slot is recycled for a new registration.
        let fired = Arc::new(AtomicU64::new(0));
        let second = wheel.add(10, counter_cb(&fired));

        // The old handle must not reach the new timer.
        assert!(!wheel.cancel(first));
        assert_eq!(wheel.advance(10), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let _ = second;
    }

    #[test]
    fn insertion_order_within_bucket() {
        let mut wheel = TimerWheel::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4u32 {
            let order = Arc::clone(&order);
            wheel.add(20, move || order.lock().unwrap().push(tag));
        }
        assert_eq!(wheel.advance(20), 4);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn overdue_deadline_fires_within_one_cycle() {
        let mut wheel = TimerWheel::new_at(100);
        let fired = Arc::new(AtomicU64::new(0));
        // Deadline already passed: parks at level 0, bucket 50, which is
        // behind the cursor (100 & 63 == 36). It fires when the cursor
        // wraps around to it, not immediately.
        wheel.add(50, counter_cb(&fired));
        assert_eq!(wheel.advance(13), 0); // now 113, bucket 49
        assert_eq!(wheel.advance(1), 1); // now 114, bucket 50
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn next_event_tracks_min_and_recomputes() {
        let mut wheel = TimerWheel::new();
        assert_eq!(wheel.next_event(), None);

        wheel.add(500, || {});
        let near = wheel.add(40, || {});
        wheel.add(9000, || {});
        assert_eq!(wheel.next_event(), Some(40));

        // Cancelling the nearest timer invalidates the hint.
        assert!(wheel.cancel(near));
        assert_eq!(wheel.next_event(), Some(500));

        wheel.advance(500);
        assert_eq!(wheel.next_event(), Some(9000));
        wheel.advance(10_000);
        assert_eq!(wheel.next_event(), None);
    }

    #[test]
    fn large_jump_terminates_and_fires() {
        let mut wheel = TimerWheel::new();
        let fired = Arc::new(AtomicU64::new(0));
        let far = 1u64 << 40;
        wheel.add(far, counter_cb(&fired));

        // A gigantic single advance must complete with bounded bucket work
        // and still deliver the timer.
        assert_eq!(wheel.advance(far + 1), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn counters_add_up() {
        let mut wheel = TimerWheel::new();
        let h = wheel.add(5, || {});
        wheel.add(6, || {});
        wheel.cancel(h);
        wheel.advance(10);
        let c = wheel.counters();
        assert_eq!(c.added, 2);
        assert_eq!(c.cancelled, 1);
        assert_eq!(c.fired, 1);
    }

    proptest! {
        /// Bucket law: the chosen level is the smallest that spans the
        /// delta, and the bucket is the deadline's own bits at that
        /// granularity.
        #[test]
        fn placement_law(now in 0u64..1 << 40, delta in 0u64..1 << 40) {
            let deadline = now + delta;
            let (level, bucket) = position(now, deadline);
            prop_assert_eq!(
                bucket as u64,
                (deadline >> (LEVEL_SHIFT * level as u32)) & SLOT_MASK
            );
            if level < LEVELS - 1 {
                prop_assert!(
                    delta < (SLOTS as u64) << (LEVEL_SHIFT * level as u32)
                );
            }
            if level > 0 {
                prop_assert!(
                    delta >= (SLOTS as u64) << (LEVEL_SHIFT * (level as u32 - 1))
                );
            }
        }

        /// Firing completeness: every timer fires exactly once, never
        /// before its deadline, once the wheel has advanced past it.
        #[test]
        fn firing_completeness(
            deadlines in proptest::collection::vec(0u64..4096, 1..40),
            chunks in proptest::collection::vec(1u64..512, 1..40),
        ) {
            let mut wheel = TimerWheel::new();
            let fires: Vec<Arc<AtomicU64>> = deadlines
                .iter()
                .map(|&d| {
                    let counter = Arc::new(AtomicU64::new(0));
                    wheel.add(d, counter_cb(&counter));
                    counter
                })
                .collect();

            for &chunk in &chunks {
                wheel.advance(chunk);
                // Nothing still pending may have fired.
                for (counter, &d) in fires.iter().zip(&deadlines) {
                    if d > wheel.now() {
                        prop_assert_eq!(counter.load(Ordering::SeqCst), 0);
                    }
                }
            }
            // Push past every deadline, with slack for coarse placement.
            wheel.advance(8192);

            for counter in &fires {
                prop_assert_eq!(counter.load(Ordering::SeqCst), 1);
            }
            prop_assert!(wheel.is_empty());
        }
    }
}
