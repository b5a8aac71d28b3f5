//! Read-write spinlock.
//!
//! One 32-bit word holds everything:
//!
//! | bits  | meaning                          |
//! |-------|----------------------------------|
//! | 0     | a writer is waiting              |
//! | 1     | a writer holds the lock          |
//! | 2     | a reader is upgrading to writer  |
//! | 3..32 | number of readers                |
//!
//! Readers only enter while bits 0..3 are clear, so a reader count above
//! zero never coexists with the write bit.

use crate::RawRwLock;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

const WAIT: u32 = 1 << 0;
const WRITE: u32 = 1 << 1;
const UPGRADE: u32 = 1 << 2;
const READ: u32 = 1 << 3;
const READER_SHIFT: u32 = 3;
const BLOCKS_READERS: u32 = WAIT | WRITE | UPGRADE;

pub struct RwSpinlock {
    value: AtomicU32,
}

impl Default for RwSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwSpinlock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn try_acquire_as_reader(&self) -> bool {
        let v = self.value.load(Ordering::Relaxed);
        v & BLOCKS_READERS == 0
            && self
                .value
                .compare_exchange(v, v + READ, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    #[inline]
    pub fn acquire_as_reader(&self) {
        while !self.try_acquire_as_reader() {
            spin_loop();
        }
    }

    /// # Safety
    /// The caller must hold a read lock.
    #[inline]
    pub unsafe fn release_as_reader(&self) {
        self.value.fetch_sub(READ, Ordering::Release);
    }

    /// Succeeds only if the lock is completely idle.
    #[inline]
    pub fn try_acquire_as_writer(&self) -> bool {
        self.value
            .compare_exchange(0, WRITE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Announces the writer, then waits for the word to drain to "wait only".
    pub fn acquire_as_writer(&self) {
        loop {
            let v = self.value.load(Ordering::Relaxed);
            if v & WAIT == 0 {
                self.value.fetch_or(WAIT, Ordering::Relaxed);
            }

            if self
                .value
                .compare_exchange_weak(WAIT, WRITE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            spin_loop();
        }
    }

    /// # Safety
    /// The caller must hold the write lock.
    #[inline]
    pub unsafe fn release_as_writer(&self) {
        self.value.fetch_and(!WRITE, Ordering::Release);
    }

    /// Turns a read lock into the write lock if this is the only reader.
    ///
    /// # Safety
    /// The caller must hold a read lock.
    #[inline]
    pub unsafe fn try_upgrade_to_writer(&self) -> bool {
        let v = self.value.load(Ordering::Relaxed);
        v >> READER_SHIFT == 1
            && v & (WRITE | UPGRADE) == 0
            && self
                .value
                .compare_exchange(v, (v & WAIT) | WRITE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Turns a read lock into the write lock, waiting for other readers to leave.
    ///
    /// Fails immediately, keeping the read lock, if another reader is already
    /// upgrading: both would otherwise wait on each other forever.
    ///
    /// # Safety
    /// The caller must hold a read lock.
    pub unsafe fn upgrade_to_writer(&self) -> bool {
        let mut v = self.value.load(Ordering::Relaxed);
        loop {
            if v & (WRITE | UPGRADE) != 0 {
                return false;
            }

            match self.value.compare_exchange_weak(
                v,
                (v - READ) | UPGRADE,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(now) => v = now,
            }
        }

        while self.value.load(Ordering::Acquire) >> READER_SHIFT != 0 {
            spin_loop();
        }

        self.value.fetch_xor(UPGRADE | WRITE, Ordering::Acquire);
        true
    }

    /// Turns the write lock into a read lock in one step.
    ///
    /// # Safety
    /// The caller must hold the write lock.
    #[inline]
    pub unsafe fn downgrade_to_reader(&self) {
        // WRITE is set, so this clears it and adds one reader.
        self.value.fetch_add(READ - WRITE, Ordering::Release);
    }

    /// Forces the lock back to idle.
    ///
    /// # Safety
    /// No one may hold the lock.
    #[inline]
    pub unsafe fn reset(&self) {
        self.value.store(0, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn has_writer(&self) -> bool {
        self.value.load(Ordering::Acquire) & WRITE != 0
    }

    #[inline]
    #[must_use]
    pub fn reader_count(&self) -> u32 {
        self.value.load(Ordering::Acquire) >> READER_SHIFT
    }

    /// Raw snapshot of the lock word.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }
}

/// A value protected by a [`RwSpinlock`].
impl RawRwLock for RwSpinlock {
    #[inline]
    fn raw_lock_shared(&self) {
        self.acquire_as_reader();
    }

    #[inline]
    unsafe fn raw_unlock_shared(&self) {
        unsafe { self.release_as_reader() }
    }

    #[inline]
    fn raw_lock_exclusive(&self) {
        self.acquire_as_writer();
    }

    #[inline]
    unsafe fn raw_unlock_exclusive(&self) {
        unsafe { self.release_as_writer() }
    }
}

pub struct RwLock<T> {
    raw: RwSpinlock,
    cell: UnsafeCell<T>,
    _no_send_sync: PhantomData<*mut ()>,
}

unsafe impl<T: Send + Sync> Sync for RwLock<T> {}
unsafe impl<T: Send> Send for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RwSpinlock::new(),
            cell: UnsafeCell::new(value),
            _no_send_sync: PhantomData,
        }
    }

    #[inline]
    pub const fn raw(&self) -> &RwSpinlock {
        &self.raw
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    /// Pointer to the value, bypassing the lock.
    ///
    /// Only sound while the caller already holds the write lock further up
    /// the stack on this core.
    #[inline]
    pub const fn data_ptr(&self) -> *mut T {
        self.cell.get()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.raw.acquire_as_reader();
        RwLockReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.raw
            .try_acquire_as_reader()
            .then_some(RwLockReadGuard { lock: self })
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.raw.acquire_as_writer();
        RwLockWriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.raw
            .try_acquire_as_writer()
            .then_some(RwLockWriteGuard { lock: self })
    }
}

pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> RwLockReadGuard<'a, T> {
    /// Upgrades to a write guard; gives the read guard back on failure.
    pub fn upgrade(self) -> Result<RwLockWriteGuard<'a, T>, Self> {
        let this = ManuallyDrop::new(self);
        if unsafe { this.lock.raw.upgrade_to_writer() } {
            Ok(RwLockWriteGuard { lock: this.lock })
        } else {
            Err(ManuallyDrop::into_inner(this))
        }
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.lock.raw.release_as_reader() }
    }
}

pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> RwLockWriteGuard<'a, T> {
    pub fn downgrade(self) -> RwLockReadGuard<'a, T> {
        let this = ManuallyDrop::new(self);
        unsafe { this.lock.raw.downgrade_to_reader() };
        RwLockReadGuard { lock: this.lock }
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.lock.raw.release_as_writer() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_excludes_readers() {
        let l = RwSpinlock::new();
        l.acquire_as_writer();
        assert!(l.has_writer());
        assert!(!l.try_acquire_as_reader());
        assert_eq!(l.reader_count(), 0);
        unsafe { l.release_as_writer() };
        assert!(l.try_acquire_as_reader());
        assert!(!l.try_acquire_as_writer());
        unsafe { l.release_as_reader() };
        assert_eq!(l.snapshot(), 0);
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let l = RwSpinlock::new();
        l.acquire_as_reader();
        l.value.fetch_or(WAIT, Ordering::Relaxed);
        assert!(!l.try_acquire_as_reader());
        assert_eq!(l.reader_count(), 1);
    }

    #[test]
    fn sole_reader_upgrades_and_downgrades() {
        let l = RwSpinlock::new();
        l.acquire_as_reader();
        assert!(unsafe { l.try_upgrade_to_writer() });
        assert!(l.has_writer());
        assert_eq!(l.reader_count(), 0);

        unsafe { l.downgrade_to_reader() };
        assert!(!l.has_writer());
        assert_eq!(l.reader_count(), 1);
        unsafe { l.release_as_reader() };
        assert_eq!(l.snapshot(), 0);
    }

    #[test]
    fn second_upgrade_is_refused() {
        let l = RwSpinlock::new();
        l.acquire_as_reader();
        l.acquire_as_reader();
        assert!(!unsafe { l.try_upgrade_to_writer() });

        // Pretend the other reader is already upgrading.
        l.value.fetch_sub(READ, Ordering::Relaxed);
        l.value.fetch_or(UPGRADE, Ordering::Relaxed);
        assert!(!unsafe { l.upgrade_to_writer() });
        assert_eq!(l.reader_count(), 1);
    }

    #[test]
    fn guards_round_trip() {
        let l = RwLock::new(vec![1, 2]);
        {
            let r1 = l.read();
            let r2 = l.read();
            assert_eq!(r1.len() + r2.len(), 4);
            assert!(l.try_write().is_none());
        }

        let r = l.read();
        let mut w = r.upgrade().unwrap_or_else(|_| panic!("sole reader must upgrade"));
        w.push(3);
        let r = w.downgrade();
        assert_eq!(*r, [1, 2, 3]);
        drop(r);
        assert_eq!(l.raw().snapshot(), 0);
    }
}
