//! # Per-CPU timers
//!
//! Each core owns a [`TimerQueue`] of pending one-shot callbacks, sorted
//! by deadline and stored as deltas from the previous entry. The head's
//! delta is what the core's [`HardwareTimer`] counts down; when it fires,
//! the next entry is armed before the expired callback runs.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(all(not(any(test, doctest)), not(target_os = "none")))]
extern crate std;

mod queue;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x2apic;

pub use crate::queue::{TimerEntry, TimerFn, TimerQueue};

/// A per-core one-shot countdown timer.
pub trait HardwareTimer {
    /// Starts counting down from `ticks`; raises the timer vector at zero.
    fn arm(&mut self, ticks: u32);

    /// Ticks left on the current countdown.
    fn remaining(&self) -> u32;

    /// Acknowledges the timer interrupt.
    fn eoi(&mut self);

    fn ticks_per_microsecond(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("{ticks} ticks exceed the 32-bit counter")]
    DelayTooLong { ticks: u64 },
    #[error("timer queue is full")]
    QueueFull,
}
