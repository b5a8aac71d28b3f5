use crate::{InterruptGuard, RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// A value behind any raw lock: [`TicketLock`](crate::TicketLock) on SMP
/// paths, [`NoLock`](crate::NoLock) where only one core ever gets here.
pub struct Mutex<T, R> {
    raw: R,
    cell: UnsafeCell<T>,
}

unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub const fn raw(&self) -> &R {
        &self.raw
    }

    /// The protected value without taking the lock.
    ///
    /// Only sound to dereference while the caller has exclusive access by
    /// other means, such as holding the lock further up its own stack.
    #[inline]
    pub const fn data_ptr(&self) -> *mut T {
        self.cell.get()
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock();
        MutexGuard {
            mutex: self,
            irq: None,
        }
    }

    /// Masks interrupts on this core, then spins for the lock.
    ///
    /// Interrupts come back only after the lock is released, so an
    /// interrupt handler on this core never spins on a lock its own core
    /// holds.
    #[inline]
    pub fn lock_uninterruptible(&self) -> MutexGuard<'_, T, R> {
        let irq = InterruptGuard::new();
        self.raw.raw_lock();
        MutexGuard {
            mutex: self,
            irq: Some(irq),
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        self.raw.raw_try_lock().then_some(MutexGuard {
            mutex: self,
            irq: None,
        })
    }

    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        f(&mut self.lock())
    }
}

/// Holds a [`Mutex`] until dropped.
pub struct MutexGuard<'a, T, R: RawUnlock> {
    mutex: &'a Mutex<T, R>,
    // Dropped after `drop` below released the lock.
    irq: Option<InterruptGuard>,
}

impl<T, R: RawUnlock> MutexGuard<'_, T, R> {
    /// Whether interrupts are masked for as long as the guard lives.
    #[must_use]
    pub const fn is_uninterruptible(&self) -> bool {
        self.irq.is_some()
    }
}

impl<T, R: RawUnlock> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.cell.get() }
    }
}

impl<T, R: RawUnlock> DerefMut for MutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.cell.get() }
    }
}

impl<T, R: RawUnlock> Drop for MutexGuard<'_, T, R> {
    fn drop(&mut self) {
        unsafe { self.mutex.raw.raw_unlock() }
    }
}
