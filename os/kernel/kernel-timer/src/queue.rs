use crate::{HardwareTimer, TimerError};
use arrayvec::ArrayVec;
use kernel_sync::InterruptGuard;

/// Callback run when a timer expires. It gets the queue back so it can
/// re-enqueue itself for periodic work.
pub type TimerFn<H> = fn(&mut TimerQueue<H>, usize);

pub struct TimerEntry<H> {
    pub func: TimerFn<H>,
    pub cookie: usize,
    /// Ticks after the previous entry's deadline.
    pub delta: u32,
}

impl<H> Clone for TimerEntry<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for TimerEntry<H> {}

impl<H> core::fmt::Debug for TimerEntry<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerEntry")
            .field("cookie", &self.cookie)
            .field("delta", &self.delta)
            .finish_non_exhaustive()
    }
}

/// One core's pending timers, soonest first.
///
/// Owned by its core and never shared; only the interrupt flag guards it.
pub struct TimerQueue<H: HardwareTimer> {
    hw: H,
    entries: ArrayVec<TimerEntry<H>, { Self::CAPACITY }>,
}

impl<H: HardwareTimer> TimerQueue<H> {
    pub const CAPACITY: usize = 32;

    pub const fn new(hw: H) -> Self {
        Self {
            hw,
            entries: ArrayVec::new_const(),
        }
    }

    pub const fn hardware(&self) -> &H {
        &self.hw
    }

    pub const fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs `func(cookie)` once, `delay_us` microseconds from now.
    ///
    /// # Errors
    /// - [`TimerError::DelayTooLong`] when the delay does not fit the
    ///   hardware counter.
    /// - [`TimerError::QueueFull`] at [`CAPACITY`](Self::CAPACITY) entries.
    pub fn enqueue(&mut self, delay_us: u64, func: TimerFn<H>, cookie: usize) -> Result<(), TimerError> {
        let ticks = delay_us.saturating_mul(self.hw.ticks_per_microsecond());
        let ticks = u32::try_from(ticks).map_err(|_| TimerError::DelayTooLong { ticks })?.max(1);

        let _irq = InterruptGuard::new();
        if self.entries.is_full() {
            log::warn!("timer queue full, dropping {ticks}-tick timer");
            return Err(TimerError::QueueFull);
        }

        let mut entry = TimerEntry {
            func,
            cookie,
            delta: ticks,
        };
        let Some(head) = self.entries.first_mut() else {
            self.hw.arm(ticks);
            self.entries.push(entry);
            return Ok(());
        };

        // Count from now: the head only has what the hardware has left.
        head.delta = self.hw.remaining().min(head.delta);

        let mut at = 0;
        let mut elapsed = 0u32;
        while let Some(next) = self.entries.get(at)
            && elapsed + next.delta <= ticks
        {
            elapsed += next.delta;
            at += 1;
        }
        entry.delta = ticks - elapsed;
        if let Some(after) = self.entries.get_mut(at) {
            after.delta -= entry.delta;
        }
        self.entries.insert(at, entry);
        if at == 0 {
            self.hw.arm(entry.delta);
        }
        Ok(())
    }

    /// Handles the timer interrupt: pops the expired head, arms the next
    /// entry, acknowledges the interrupt, and only then runs the callback.
    ///
    /// Returns whether a callback ran.
    pub fn on_fire(&mut self) -> bool {
        if self.entries.is_empty() {
            self.hw.eoi();
            return false;
        }
        let expired = self.entries.remove(0);
        if let Some(next) = self.entries.first_mut() {
            // The counter cannot fire on zero. The tick spent waiting is
            // recorded on the head and taken back from the entry after it.
            if next.delta == 0 {
                next.delta = 1;
                if let Some(after) = self.entries.get_mut(1)
                    && after.delta > 0
                {
                    after.delta -= 1;
                }
            }
            let ticks = self.entries[0].delta;
            self.hw.arm(ticks);
        }
        self.hw.eoi();
        (expired.func)(self, expired.cookie);
        true
    }

    /// Deadline of every entry, in ticks from when the head was armed.
    pub fn deadlines(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().scan(0u64, |at, e| {
            *at += u64::from(e.delta);
            Some(*at)
        })
    }
}
