use crate::{RawLock, RawRwLock, RawUnlock};

/// A raw lock that never blocks.
///
/// Used where the structure is only reachable from a single core, such as
/// the uniprocessor object allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl RawLock for NoLock {
    #[inline]
    fn raw_lock(&self) {}

    #[inline]
    fn raw_try_lock(&self) -> bool {
        true
    }
}

impl RawUnlock for NoLock {
    #[inline]
    unsafe fn raw_unlock(&self) {}
}

impl RawRwLock for NoLock {
    #[inline]
    fn raw_lock_shared(&self) {}

    #[inline]
    unsafe fn raw_unlock_shared(&self) {}

    #[inline]
    fn raw_lock_exclusive(&self) {}

    #[inline]
    unsafe fn raw_unlock_exclusive(&self) {}
}
