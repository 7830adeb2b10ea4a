// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-facing timer façade.
//!
//! Most kernel code wants "run this after N ticks" and should not care how
//! that is scheduled. [`Timekeeper`] wraps the hierarchical wheel from the
//! `timerwheel` crate behind that interface and keeps a small trace of
//! recent timer activity for debugging. Code that needs nanosecond
//! precision goes to the high-resolution engine instead, re-exported here
//! from the `hrtimer` crate so the façade is the one import site for both
//! tiers.
//!
//! The two tiers stay independent: the wheel counts coarse ticks driven by
//! the periodic interrupt, the high-resolution engine programs its own
//! one-shot device. Nothing routes between them.
//!
//! A [`Timekeeper`] is a plain owned value, one per core. For a shared
//! instance, [`SharedTimekeeper`] wraps it in a spinlock; hold it only for
//! the duration of a single operation, and never across a callback that
//! might re-enter the timekeeper.

#![cfg_attr(not(test), no_std)]

pub use hrtimer::{
    select_device, ClockEventDevice, Disposition, EngineCounters, HrTimerEngine, HrTimerHandle,
    NoClockEventDevice,
};
pub use timerwheel::{TimerHandle, TimerWheel, WheelCounters};

/// Depth of the activity trace. Power of two keeps the wrap cheap.
pub const TRACE_DEPTH: usize = 32;

/// One recorded timer event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    Add { handle: TimerHandle, deadline: u64 },
    Cancel { handle: TimerHandle, hit: bool },
    Advance { ticks: u64, fired: usize },
}

/// Fixed-depth ring of recent [`Trace`] entries, newest overwriting oldest.
struct TraceBuf {
    entries: [Option<Trace>; TRACE_DEPTH],
    next: usize,
}

impl TraceBuf {
    const fn new() -> Self {
        Self {
            entries: [None; TRACE_DEPTH],
            next: 0,
        }
    }

    fn record(&mut self, event: Trace) {
        self.entries[self.next] = Some(event);
        self.next = (self.next + 1) % TRACE_DEPTH;
    }

    /// Entries in chronological order, oldest first.
    fn iter(&self) -> impl Iterator<Item = Trace> + '_ {
        let (older, newer) = self.entries.split_at(self.next);
        newer.iter().chain(older.iter()).filter_map(|e| *e)
    }
}

/// Tick-resolution timer service: the wheel plus its activity trace.
pub struct Timekeeper {
    wheel: TimerWheel,
    trace: TraceBuf,
}

impl Timekeeper {
    pub fn new() -> Self {
        Self::new_at(0)
    }

    /// Starts the wheel clock at `jiffies`, for resuming a saved epoch.
    pub fn new_at(jiffies: u64) -> Self {
        Self {
            wheel: TimerWheel::new_at(jiffies),
            trace: TraceBuf::new(),
        }
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        self.wheel.now()
    }

    /// Registers `callback` to run once tick `deadline` has passed, at the
    /// wheel's granularity for that distance.
    pub fn timer_add<F>(&mut self, deadline: u64, callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let handle = self.wheel.add(deadline, callback);
        self.trace.record(Trace::Add { handle, deadline });
        handle
    }

    /// Cancels a pending timer; `false` means the handle was stale.
    pub fn timer_cancel(&mut self, handle: TimerHandle) -> bool {
        let hit = self.wheel.cancel(handle);
        self.trace.record(Trace::Cancel { handle, hit });
        hit
    }

    /// Advances the wheel clock, running every timer whose deadline was
    /// crossed. Called from the periodic tick interrupt with the number of
    /// ticks elapsed (usually 1, more after a tickless idle period).
    /// Returns the number fired.
    pub fn tick(&mut self, ticks: u64) -> usize {
        let fired = self.wheel.advance(ticks);
        self.trace.record(Trace::Advance { ticks, fired });
        fired
    }

    /// Earliest pending deadline, for tickless-idle decisions.
    pub fn next_event(&mut self) -> Option<u64> {
        self.wheel.next_event()
    }

    /// The underlying wheel, for inspection (counters, len).
    pub fn wheel(&self) -> &TimerWheel {
        &self.wheel
    }

    /// Recent activity, oldest first.
    pub fn trace(&self) -> impl Iterator<Item = Trace> + '_ {
        self.trace.iter()
    }
}

impl Default for Timekeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Timekeeper`] behind a spinlock, for sharing across cores.
pub struct SharedTimekeeper {
    inner: spin::Mutex<Timekeeper>,
}

impl SharedTimekeeper {
    pub fn new() -> Self {
        Self {
            inner: spin::Mutex::new(Timekeeper::new()),
        }
    }

    /// Locks the timekeeper for a sequence of operations. The single-op
    /// wrappers below are preferred; use this when several calls must be
    /// atomic with respect to other cores.
    pub fn lock(&self) -> spin::MutexGuard<'_, Timekeeper> {
        self.inner.lock()
    }

    pub fn timer_add<F>(&self, deadline: u64, callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.lock().timer_add(deadline, callback)
    }

    pub fn timer_cancel(&self, handle: TimerHandle) -> bool {
        self.inner.lock().timer_cancel(handle)
    }

    pub fn tick(&self, ticks: u64) -> usize {
        self.inner.lock().tick(ticks)
    }

    pub fn next_event(&self) -> Option<u64> {
        self.inner.lock().next_event()
    }
}

impl Default for SharedTimekeeper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn add_tick_cancel_forward_to_wheel() {
        let mut tk = Timekeeper::new();
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);

        let kept = tk.timer_add(10, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let dropped = tk.timer_add(12, || panic!("cancelled timer fired"));
        assert_eq!(tk.next_event(), Some(10));

        assert!(tk.timer_cancel(dropped));
        assert!(!tk.timer_cancel(dropped));

        assert_eq!(tk.tick(16), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(tk.now(), 16);
        assert!(tk.wheel().is_empty());
        // The fired timer's handle is stale now too.
        assert!(!tk.timer_cancel(kept));
    }

    #[test]
    fn trace_records_in_order() {
        let mut tk = Timekeeper::new();
        let handle = tk.timer_add(5, || ());
        tk.timer_cancel(handle);
        tk.tick(8);

        let events: Vec<Trace> = tk.trace().collect();
        assert_eq!(
            events,
            vec![
                Trace::Add {
                    handle,
                    deadline: 5
                },
                Trace::Cancel { handle, hit: true },
                Trace::Advance { ticks: 8, fired: 0 },
            ]
        );
    }

    #[test]
    fn trace_wraps_keeping_newest() {
        let mut tk = Timekeeper::new();
        for _ in 0..TRACE_DEPTH + 8 {
            tk.tick(1);
        }

        let events: Vec<Trace> = tk.trace().collect();
        assert_eq!(events.len(), TRACE_DEPTH);
        assert!(events
            .iter()
            .all(|e| matches!(e, Trace::Advance { ticks: 1, fired: 0 })));
    }

    #[test]
    fn shared_timekeeper_smoke() {
        let tk = SharedTimekeeper::new();
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);

        tk.timer_add(3, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(tk.next_event(), Some(3));
        assert_eq!(tk.tick(4), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Multi-step sequence under one lock hold.
        let mut guard = tk.lock();
        let h = guard.timer_add(100, || ());
        assert!(guard.timer_cancel(h));
    }
}
