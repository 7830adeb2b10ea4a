// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clock-event device abstraction.
//!
//! A clock-event device is a one-shot hardware (or virtualized) timer that
//! can be armed to raise an interrupt at one future instant. Platform code
//! registers whatever devices it has; the engine picks the best one at boot
//! and keeps it armed for the earliest pending deadline from then on.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

/// A one-shot programmable event timer.
///
/// The device fires its interrupt once when the armed instant is reached
/// and then disarms itself; it stays quiet until armed again. `set_next_event`
/// with an instant that has already passed must fire as soon as possible --
/// the engine relies on this to avoid lost wakeups for overdue deadlines.
pub trait ClockEventDevice {
    /// Human-readable device name, for diagnostics.
    fn name(&self) -> &str;

    /// Selection priority. Among all registered devices, the highest
    /// priority wins; ties go to the earliest registration.
    fn priority(&self) -> u8;

    /// Arms the device to fire at `deadline` (absolute nanoseconds),
    /// replacing any previous setting.
    fn set_next_event(&mut self, deadline: u64);

    /// Cancels any pending event.
    fn stop(&mut self);
}

impl<D: ClockEventDevice + ?Sized> ClockEventDevice for &mut D {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn priority(&self) -> u8 {
        (**self).priority()
    }
    fn set_next_event(&mut self, deadline: u64) {
        (**self).set_next_event(deadline)
    }
    fn stop(&mut self) {
        (**self).stop()
    }
}

impl<D: ClockEventDevice + ?Sized> ClockEventDevice for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn priority(&self) -> u8 {
        (**self).priority()
    }
    fn set_next_event(&mut self, deadline: u64) {
        (**self).set_next_event(deadline)
    }
    fn stop(&mut self) {
        (**self).stop()
    }
}

/// Error: the platform registered no clock-event device at all.
///
/// Fatal for any subsystem needing precise timers; reported upward so the
/// boot sequence can decide what to do about it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NoClockEventDevice;

impl fmt::Display for NoClockEventDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no clock-event device registered")
    }
}

/// Picks the highest-priority device from `devices`, consuming the rest.
///
/// Ties keep the earliest-registered candidate, so the selection is stable
/// however many devices share a priority.
pub fn select_device(
    devices: Vec<Box<dyn ClockEventDevice + Send>>,
) -> Result<Box<dyn ClockEventDevice + Send>, NoClockEventDevice> {
    let mut best: Option<Box<dyn ClockEventDevice + Send>> = None;
    for candidate in devices {
        match &best {
            Some(b) if candidate.priority() <= b.priority() => {}
            _ => best = Some(candidate),
        }
    }
    best.ok_or(NoClockEventDevice)
}
