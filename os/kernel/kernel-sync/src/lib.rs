//! # Kernel synchronization primitives
//!
//! Ticket and read-write spinlocks, the interrupt-state cookie used by
//! uninterruptible critical sections, and the core index source used to
//! detect re-entry on the same CPU.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(all(not(any(test, doctest)), not(target_os = "none")))]
extern crate std;

pub mod core_local;
pub mod interrupts;
mod mutex;
mod no_lock;
mod once;
mod rw_spin;
mod ticket;

pub use interrupts::{InterruptGuard, InterruptState};
pub use mutex::{Mutex, MutexGuard};
pub use no_lock::NoLock;
pub use once::SyncOnceCell;
pub use rw_spin::{RwLock, RwLockReadGuard, RwLockWriteGuard, RwSpinlock};
pub use ticket::TicketLock;

/// A mutex serialized by a FIFO ticket lock.
pub type TicketMutex<T> = Mutex<T, TicketLock>;

/// A mutex without any locking, for structures only ever touched by one core.
pub type UpMutex<T> = Mutex<T, NoLock>;

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(TicketLock::new(), value)
    }
}

impl<T> UpMutex<T> {
    pub const fn new_unlocked(value: T) -> Self {
        Self::from_raw(NoLock, value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    /// Releases the lock.
    ///
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}

/// Shared/exclusive raw locking, for structures walked often and relinked rarely.
pub trait RawRwLock {
    fn raw_lock_shared(&self);

    /// # Safety
    /// The caller must hold a shared lock.
    unsafe fn raw_unlock_shared(&self);

    fn raw_lock_exclusive(&self);

    /// # Safety
    /// The caller must hold the exclusive lock.
    unsafe fn raw_unlock_exclusive(&self);
}
