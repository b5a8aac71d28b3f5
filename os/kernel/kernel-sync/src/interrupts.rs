//! Interrupt-flag management.
//!
//! [`push_disable`] saves `RFLAGS` into an [`InterruptState`] cookie and
//! clears `IF`; [`InterruptState::restore`] puts the saved flags back.
//! On bare metal this is `pushfq; cli` and `push; popfq`. Hosted builds
//! (unit tests, tools) keep an emulated flag per OS thread so code paths
//! that require "interrupts disabled" can still be exercised.

/// `RFLAGS.IF`.
pub const INTERRUPT_FLAG: u64 = 1 << 9;

/// Saved `RFLAGS`, as returned by [`push_disable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct InterruptState(u64);

impl InterruptState {
    #[inline]
    pub const fn from_flags(flags: u64) -> Self {
        Self(flags)
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> u64 {
        self.0
    }

    /// Whether interrupts were enabled when the cookie was taken.
    #[inline]
    #[must_use]
    pub const fn were_enabled(self) -> bool {
        self.0 & INTERRUPT_FLAG != 0
    }

    /// Restores the saved flags.
    ///
    /// Returns `true` if interrupts are disabled afterwards.
    #[inline]
    #[allow(clippy::must_use_candidate)]
    pub fn restore(self) -> bool {
        arch::restore_flags(self.0);
        !self.were_enabled()
    }
}

/// Saves the current flags and disables interrupts.
#[inline]
pub fn push_disable() -> InterruptState {
    InterruptState(arch::push_disable())
}

/// Current interrupt state, without changing it.
#[inline]
pub fn current() -> InterruptState {
    InterruptState(arch::flags())
}

#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    current().were_enabled()
}

/// Sets `IF` (`sti`).
#[inline]
pub fn enable_interrupts() {
    arch::enable();
}

/// Clears `IF` (`cli`).
#[inline]
pub fn disable_interrupts() {
    arch::disable();
}

/// Disables interrupts for its lifetime and restores the previous state on drop.
pub struct InterruptGuard {
    state: InterruptState,
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: push_disable(),
        }
    }

    /// The state that will be restored on drop.
    #[inline]
    pub const fn saved(&self) -> InterruptState {
        self.state
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.state.restore();
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    #[inline]
    pub fn flags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r
    }

    #[inline]
    pub fn push_disable() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; cli; pop {}", out(reg) r) }
        r
    }

    #[inline]
    pub fn restore_flags(flags: u64) {
        unsafe { core::arch::asm!("push {}; popfq", in(reg) flags) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    use super::INTERRUPT_FLAG;
    use core::cell::Cell;

    /// Bit 1 of `RFLAGS` always reads as one.
    const RESERVED_ONE: u64 = 1 << 1;

    std::thread_local! {
        static FLAGS: Cell<u64> = const { Cell::new(RESERVED_ONE | INTERRUPT_FLAG) };
    }

    pub fn flags() -> u64 {
        FLAGS.with(Cell::get)
    }

    pub fn push_disable() -> u64 {
        FLAGS.with(|f| f.replace(f.get() & !INTERRUPT_FLAG))
    }

    pub fn restore_flags(flags: u64) {
        FLAGS.with(|f| f.set(flags));
    }

    pub fn enable() {
        FLAGS.with(|f| f.set(f.get() | INTERRUPT_FLAG));
    }

    pub fn disable() {
        FLAGS.with(|f| f.set(f.get() & !INTERRUPT_FLAG));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TicketMutex;

    #[test]
    fn nested_cookies_restore_in_order() {
        assert!(interrupts_enabled());
        let outer = push_disable();
        assert!(outer.were_enabled());
        assert!(!interrupts_enabled());

        let inner = push_disable();
        assert!(!inner.were_enabled());

        assert!(inner.restore());
        assert!(!interrupts_enabled());
        assert!(!outer.restore());
        assert!(interrupts_enabled());
    }

    #[test]
    fn guard_restores_previous_state() {
        disable_interrupts();
        {
            let g = InterruptGuard::new();
            assert!(!g.saved().were_enabled());
        }
        assert!(!interrupts_enabled());
        enable_interrupts();
        {
            let _g = InterruptGuard::new();
            assert!(!interrupts_enabled());
        }
        assert!(interrupts_enabled());
    }

    #[test]
    fn uninterruptible_lock_masks_interrupts() {
        let m = TicketMutex::new(5_u32);
        {
            let mut g = m.lock_uninterruptible();
            *g += 1;
            assert!(!interrupts_enabled());
            assert!(g.is_uninterruptible());
            assert!(m.try_lock().is_none());
        }
        assert!(interrupts_enabled());
        assert_eq!(*m.lock(), 6);
    }
}
