use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

const HEAD_MASK: u32 = 0x0000_FFFF;
const TAIL_ONE: u32 = 1 << 16;

/// FIFO spinlock over a single 32-bit word.
///
/// The low half is the `head` (ticket now being served), the high half the
/// `tail` (next ticket to hand out). Both counters wrap modulo 2^16.
pub struct TicketLock {
    value: AtomicU32,
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn head(v: u32) -> u16 {
    (v & HEAD_MASK) as u16
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn tail(v: u32) -> u16 {
    (v >> 16) as u16
}

impl TicketLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }

    /// Takes the lock only if nobody holds it and no acquire is in flight.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        let v = self.value.load(Ordering::Relaxed);
        if head(v) != tail(v) {
            return false;
        }

        self.value
            .compare_exchange(
                v,
                v.wrapping_add(TAIL_ONE),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Draws a ticket and spins until it is served.
    #[inline]
    pub fn acquire(&self) {
        // A carry out of the tail falls off the top of the word.
        let ticket = tail(self.value.fetch_add(TAIL_ONE, Ordering::Relaxed));
        while head(self.value.load(Ordering::Acquire)) != ticket {
            spin_loop();
        }
    }

    /// Serves the next ticket.
    ///
    /// # Safety
    /// The caller must hold the lock.
    #[inline]
    pub unsafe fn release(&self) {
        // Only the holder moves the head; the tail may move concurrently.
        let _ = self
            .value
            .fetch_update(Ordering::Release, Ordering::Relaxed, |v| {
                Some((v & !HEAD_MASK) | u32::from(head(v).wrapping_add(1)))
            });
    }

    /// Returns `true` if the lock is free.
    #[inline]
    #[must_use]
    pub fn check(&self) -> bool {
        let v = self.value.load(Ordering::Acquire);
        head(v) == tail(v)
    }

    /// Waits until the lock is free without taking it.
    #[inline]
    pub fn spin_wait(&self) {
        while !self.check() {
            spin_loop();
        }
    }

    /// Number of tickets handed out but not yet released (holder included).
    #[inline]
    #[must_use]
    pub fn queued(&self) -> u16 {
        let v = self.value.load(Ordering::Relaxed);
        tail(v).wrapping_sub(head(v))
    }
}

impl RawLock for TicketLock {
    fn raw_lock(&self) {
        self.acquire();
    }

    fn raw_try_lock(&self) -> bool {
        self.try_acquire()
    }
}

impl RawUnlock for TicketLock {
    unsafe fn raw_unlock(&self) {
        unsafe { self.release() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_wraps_without_touching_head() {
        let lock = TicketLock {
            value: AtomicU32::new(0xFFFF_FFFF),
        };
        assert!(lock.check());
        assert!(lock.try_acquire());
        assert_eq!(lock.value.load(Ordering::Relaxed), 0x0000_FFFF);
        assert!(!lock.check());
        unsafe { lock.release() };
        assert_eq!(lock.value.load(Ordering::Relaxed), 0);
        assert!(lock.check());
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let lock = TicketLock::new();
        lock.acquire();
        assert!(!lock.try_acquire());
        assert_eq!(lock.queued(), 1);
        unsafe { lock.release() };
        assert!(lock.try_acquire());
        unsafe { lock.release() };
        assert_eq!(lock.queued(), 0);
    }
}
