// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-resolution timer engine.
//!
//! The engine keeps an exact, totally ordered set of nanosecond-resolution
//! deadlines and drives exactly one [`ClockEventDevice`], keeping it armed
//! for the earliest pending deadline so the core wakes precisely when
//! something is due and not before.
//!
//! Ordering is by `(deadline, registration sequence)`: two timers with the
//! same deadline still have a fully defined order, and the ordered map never
//! sees a duplicate key. The sequence number doubles as the timer's handle.
//!
//! The backing structure is an ordered map rather than a heap because the
//! engine needs both in-order traversal from the minimum *and* efficient
//! removal of arbitrary timers (`try_remove`), which a heap cannot do.
//!
//! The engine never reads a clock of its own; every operation that needs
//! the current time takes `now` as an argument. That keeps the engine
//! deterministic and makes the interrupt path explicit: the platform's
//! device interrupt handler reads its clocksource and calls
//! [`HrTimerEngine::expire`].
//!
//! # Usage model
//!
//! - Register callbacks with [`HrTimerEngine::add`]. A callback returns a
//!   [`Disposition`]: [`Disposition::Rearm`] with the next absolute deadline
//!   for periodic behavior, [`Disposition::Done`] for one-shot.
//! - When the device interrupt fires, call [`HrTimerEngine::expire`] with
//!   the current time. Due callbacks run in strictly ascending
//!   `(deadline, seq)` order, and the device is reprogrammed (or stopped)
//!   afterwards.
//!
//! Operations are synchronous and bounded; they are safe to call from
//! interrupt context. The engine is a plain owned value -- share it behind
//! a lock if several cores must reach it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod device;

pub use device::{select_device, ClockEventDevice, NoClockEventDevice};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

/// What a callback wants done with its timer after firing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Reinsert with the given absolute deadline (nanoseconds). A deadline
    /// at or before the current time is accepted; the timer fires again on
    /// the next expiry pass rather than looping inside the current one.
    Rearm(u64),
    /// Leave the timer unregistered.
    Done,
}

/// Handle naming a timer registration.
///
/// This is the registration's sequence number, which is also the ordering
/// tie-break key. A handle stays valid across `Rearm` reinsertions; it dies
/// when the timer completes (`Done`) or is removed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HrTimerHandle(u64);

type Callback = Box<dyn FnMut(u64) -> Disposition + Send>;

struct Record {
    callback: Callback,
}

/// Flat event counts, for debug tooling and tests.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EngineCounters {
    pub added: u64,
    pub fired: u64,
    pub rearmed: u64,
    pub removed: u64,
    /// Times the device was actually programmed.
    pub reprogrammed: u64,
    /// Times reprogramming was elided because the armed value was already
    /// right.
    pub reprogram_skipped: u64,
}

/// The engine proper: an ordered deadline set plus the one device it owns.
pub struct HrTimerEngine<D> {
    /// Pending timers, ordered by `(deadline, seq)`.
    queue: BTreeMap<(u64, u64), Record>,
    /// Registration set: seq -> current deadline. A timer is registered
    /// iff its seq is present here.
    registered: BTreeMap<u64, u64>,
    next_seq: u64,
    device: D,
    /// Deadline the device is currently armed for, if any. The device is
    /// one-shot: delivery of its interrupt disarms it, and `expire` resets
    /// this before reprogramming.
    armed: Option<u64>,
    counters: EngineCounters,
}

impl<D: ClockEventDevice> HrTimerEngine<D> {
    /// Creates an engine owning `device`, with the device stopped.
    ///
    /// Use [`select_device`] first when the platform registered several
    /// candidate devices.
    pub fn new(mut device: D) -> Self {
        device.stop();
        Self {
            queue: BTreeMap::new(),
            registered: BTreeMap::new(),
            next_seq: 0,
            device,
            armed: None,
            counters: EngineCounters::default(),
        }
    }

    /// Number of registered timers.
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// The owned device, for inspection.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Earliest pending deadline, or `None` when nothing is registered.
    /// Idle-loop code uses this to bound how long the core may halt.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Deadline the device is currently armed for.
    pub fn armed(&self) -> Option<u64> {
        self.armed
    }

    /// Whether `handle` names a live registration.
    pub fn is_registered(&self, handle: HrTimerHandle) -> bool {
        self.registered.contains_key(&handle.0)
    }

    /// Registers `callback` to fire at `deadline` (absolute nanoseconds).
    ///
    /// If the deadline has already passed, the callback runs synchronously
    /// right here instead of being registered -- there is no interrupt to
    /// wait for, and deferring it would race the very wakeup it asked for.
    /// A `Rearm` from that inline firing registers the timer at its next
    /// deadline (which may itself be overdue; it then fires on the next
    /// expiry pass, so `add` never loops).
    ///
    /// The returned handle is dead on arrival if the timer fired inline and
    /// completed.
    pub fn add<F>(&mut self, now: u64, deadline: u64, callback: F) -> HrTimerHandle
    where
        F: FnMut(u64) -> Disposition + Send + 'static,
    {
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut callback: Callback = Box::new(callback);
        self.counters.added += 1;

        if deadline <= now {
            self.counters.fired += 1;
            match callback(now) {
                Disposition::Rearm(next) => {
                    self.counters.rearmed += 1;
                    self.link(seq, next, Record { callback });
                    self.reprogram(Some(next));
                }
                Disposition::Done => {}
            }
            return HrTimerHandle(seq);
        }

        self.link(seq, deadline, Record { callback });
        self.reprogram(Some(deadline));
        HrTimerHandle(seq)
    }

    /// Moves a registered timer to `deadline`.
    ///
    /// The key changes, so this is a remove-and-reinsert, never an in-place
    /// mutation. An overdue `deadline` fires inline, exactly like `add`'s
    /// overdue path, keeping the same handle on rearm.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not currently registered. Updating a dead
    /// timer is a caller bug, and silently ignoring it would hide that bug.
    pub fn update(&mut self, now: u64, handle: HrTimerHandle, deadline: u64) {
        let seq = handle.0;
        let Some(old) = self.registered.remove(&seq) else {
            panic!("hrtimer: update of unregistered timer");
        };
        let Some(mut record) = self.queue.remove(&(old, seq)) else {
            panic!("hrtimer: deadline index out of sync");
        };

        if deadline <= now {
            self.counters.fired += 1;
            match (record.callback)(now) {
                Disposition::Rearm(next) => {
                    self.counters.rearmed += 1;
                    self.link(seq, next, record);
                }
                Disposition::Done => {}
            }
        } else {
            self.link(seq, deadline, record);
        }
        // The old deadline may have been what the device was armed for.
        self.reprogram(None);
    }

    /// Removes a timer if it is registered. Returns whether it was.
    /// Idempotent: a second call (or a dead handle) returns `false`.
    pub fn try_remove(&mut self, handle: HrTimerHandle) -> bool {
        let Some(deadline) = self.registered.remove(&handle.0) else {
            return false;
        };
        self.queue.remove(&(deadline, handle.0));
        self.counters.removed += 1;
        // The removed timer may have been the armed minimum.
        self.reprogram(None);
        true
    }

    /// Fire-and-forget removal.
    pub fn remove(&mut self, handle: HrTimerHandle) {
        let _ = self.try_remove(handle);
    }

    /// Expiry pass, called from the device's interrupt handler with the
    /// current time.
    ///
    /// Every timer with `deadline <= now` is unlinked first, then fired in
    /// ascending `(deadline, seq)` order. A `Rearm` reinserts with the same
    /// seq; an overdue rearm deadline is accepted and will be picked up by
    /// the *next* pass (the device gets armed to the overdue value and
    /// fires again immediately), so one pass fires each timer at most once
    /// and always terminates. Returns the number fired.
    pub fn expire(&mut self, now: u64) -> usize {
        // The one-shot device disarmed itself by delivering this interrupt.
        self.armed = None;

        // Drain the due prefix before running anything, so a callback that
        // rearms into the past cannot be revisited within this pass.
        let mut due: Vec<(u64, Record)> = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            let &(deadline, seq) = entry.key();
            if deadline > now {
                break;
            }
            due.push((seq, entry.remove()));
            self.registered.remove(&seq);
        }

        let fired = due.len();
        for (seq, mut record) in due {
            match (record.callback)(now) {
                Disposition::Rearm(next) => {
                    self.counters.rearmed += 1;
                    self.link(seq, next, record);
                }
                Disposition::Done => {}
            }
        }
        self.counters.fired += fired as u64;

        self.reprogram(None);
        fired
    }

    fn link(&mut self, seq: u64, deadline: u64, record: Record) {
        self.queue.insert((deadline, seq), record);
        self.registered.insert(seq, deadline);
    }

    /// Brings the device in line with the queue.
    ///
    /// With the device disarmed, a `hint` (the deadline just inserted) can
    /// be armed directly without consulting the queue -- the common path
    /// when the first timer arrives. Otherwise the queue minimum decides:
    /// arm it if it differs from the current setting, stop the device if
    /// the queue is empty.
    fn reprogram(&mut self, hint: Option<u64>) {
        match hint {
            Some(hint) => match self.armed {
                None => self.arm(hint),
                Some(current) if hint < current => self.arm(hint),
                Some(_) => self.counters.reprogram_skipped += 1,
            },
            None => match self.next_deadline() {
                Some(min) if self.armed != Some(min) => self.arm(min),
                Some(_) => self.counters.reprogram_skipped += 1,
                None => {
                    if self.armed.take().is_some() {
                        self.device.stop();
                    }
                }
            },
        }
    }

    fn arm(&mut self, deadline: u64) {
        self.device.set_next_event(deadline);
        self.armed = Some(deadline);
        self.counters.reprogrammed += 1;
    }
}

impl<D> fmt::Debug for HrTimerEngine<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HrTimerEngine")
            .field("len", &self.registered.len())
            .field("armed", &self.armed)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}
