//! Pool-backed allocator of equally sized objects.

use crate::pool::ObjectPool;
use crate::{ObjectAllocError, PoolGeometry, PoolProvider};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use kernel_info::memory::PAGE_SIZE;
use kernel_sync::core_local::{NO_CORE, current_core_index};
use kernel_sync::{
    InterruptGuard, NoLock, RawLock, RawRwLock, RawUnlock, RwSpinlock, TicketLock,
};

/// What happens to a pool once every slot in it is free again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolReleaseOptions {
    /// Give every empty pool back to the provider.
    ReleaseAll,
    /// Same, but never the last remaining pool.
    #[default]
    KeepOne,
    /// Keep everything.
    NoRelease,
}

/// The locks an allocator uses, chosen per build flavour.
pub trait Locking: 'static {
    /// Guards one pool's free list.
    type Pool: RawLock + RawUnlock + Default;
    /// Shared while walking the pool list, exclusive while relinking it.
    type Linkage: RawRwLock + Default;
    /// Serializes calls into the pool provider.
    type Acquisition: RawLock + RawUnlock + Default;
}

/// Locks for allocators shared between cores.
pub enum SmpLocking {}

impl Locking for SmpLocking {
    type Pool = TicketLock;
    type Linkage = RwSpinlock;
    type Acquisition = TicketLock;
}

/// No locks at all, for allocators touched by a single core.
pub enum UpLocking {}

impl Locking for UpLocking {
    type Pool = NoLock;
    type Linkage = NoLock;
    type Acquisition = NoLock;
}

pub type SmpObjectAllocator<T, P> = ObjectAllocator<T, P, SmpLocking>;
pub type UpObjectAllocator<T, P> = ObjectAllocator<T, P, UpLocking>;

type Pool<K> = ObjectPool<<K as Locking>::Pool>;

/// Hands out slots for `T` from a chain of pools obtained from `P`.
///
/// Aggregate counters are updated while the affected pool (or the whole
/// chain) is locked, so `capacity - free_count` is the number of live
/// objects whenever no operation is in flight.
pub struct ObjectAllocator<T, P: PoolProvider, K: Locking = SmpLocking> {
    provider: P,
    geometry: PoolGeometry,
    release: PoolReleaseOptions,
    quota: Option<usize>,

    first: AtomicPtr<Pool<K>>,
    last: AtomicPtr<Pool<K>>,
    linkage: K::Linkage,
    acquisition: K::Acquisition,
    /// Core currently inside the provider, or [`NO_CORE`].
    special_locker: AtomicUsize,
    /// Pool being grown in place; never released meanwhile.
    enlarging: AtomicPtr<Pool<K>>,

    capacity: AtomicUsize,
    free_count: AtomicUsize,
    pool_count: AtomicUsize,

    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Send, P: PoolProvider + Send, K: Locking> Send for ObjectAllocator<T, P, K> {}
unsafe impl<T: Send, P: PoolProvider + Send + Sync> Sync for ObjectAllocator<T, P, SmpLocking> {}

impl<T, P: PoolProvider, K: Locking> ObjectAllocator<T, P, K> {
    const SLOT_ALIGN: usize = {
        let a = align_of::<T>();
        assert!(a as u64 <= PAGE_SIZE, "objects cannot be aligned beyond a page");
        if a < 4 { 4 } else { a }
    };

    /// Slot size: room for the object and for a free-list link.
    const OBJECT_SIZE: usize = {
        let s = if size_of::<T>() < 4 { 4 } else { size_of::<T>() };
        s.next_multiple_of(Self::SLOT_ALIGN)
    };

    const HEADER_SIZE: usize = size_of::<Pool<K>>().next_multiple_of(Self::SLOT_ALIGN);

    #[must_use]
    pub fn new(provider: P, release: PoolReleaseOptions) -> Self {
        Self {
            provider,
            geometry: PoolGeometry {
                object_size: Self::OBJECT_SIZE,
                header_size: Self::HEADER_SIZE,
            },
            release,
            quota: None,
            first: AtomicPtr::new(ptr::null_mut()),
            last: AtomicPtr::new(ptr::null_mut()),
            linkage: K::Linkage::default(),
            acquisition: K::Acquisition::default(),
            special_locker: AtomicUsize::new(NO_CORE),
            enlarging: AtomicPtr::new(ptr::null_mut()),
            capacity: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
            pool_count: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Caps the total capacity the allocator will grow to.
    #[must_use]
    pub const fn with_quota(mut self, max_objects: usize) -> Self {
        self.quota = Some(max_objects);
        self
    }

    #[inline]
    pub const fn geometry(&self) -> PoolGeometry {
        self.geometry
    }

    #[inline]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn pool_count(&self) -> usize {
        self.pool_count.load(Ordering::Acquire)
    }

    /// Objects handed out and not yet returned.
    #[inline]
    pub fn live(&self) -> usize {
        self.capacity().saturating_sub(self.free_count())
    }

    /// Uninitialized storage for one `T`.
    ///
    /// `estimated_left` hints how many more objects the caller expects to
    /// need soon; a new pool is sized for at least that many.
    ///
    /// # Errors
    /// When the provider is exhausted or the quota is reached.
    pub fn allocate(&self, estimated_left: usize) -> Result<NonNull<T>, ObjectAllocError> {
        let _irq = InterruptGuard::new();
        loop {
            if let Some(slot) = self.take_free() {
                return Ok(slot.cast());
            }

            self.with_acquisition(|| {
                // Another core may have grown the pools while we waited.
                if self.free_count() > 0 {
                    Ok(())
                } else {
                    self.grow(estimated_left.max(1))
                }
            })?;
        }
    }

    /// Allocates and moves `value` in.
    ///
    /// # Errors
    /// See [`allocate`](Self::allocate); `value` is dropped on failure.
    pub fn allocate_value(&self, value: T) -> Result<NonNull<T>, ObjectAllocError> {
        let slot = self.allocate(1)?;
        unsafe { slot.as_ptr().write(value) };
        Ok(slot)
    }

    /// Returns storage obtained from [`allocate`](Self::allocate) without
    /// dropping its contents.
    ///
    /// # Errors
    /// [`ObjectAllocError::NotOwned`] if no pool contains `object`.
    pub fn deallocate(&self, object: NonNull<T>) -> Result<(), ObjectAllocError> {
        let _irq = InterruptGuard::new();
        let addr = object.as_ptr() as usize;
        let mut owner = None;

        self.linkage.raw_lock_shared();
        let mut cursor = self.first.load(Ordering::Acquire);
        while let Some(pool) = unsafe { cursor.as_ref() } {
            if let Some(index) = pool.index_of(self.geometry, addr) {
                pool.lock.raw_lock();
                unsafe { pool.push(self.geometry, index) };
                self.free_count.fetch_add(1, Ordering::AcqRel);
                let emptied = pool.free_count() == pool.capacity();
                unsafe { pool.lock.raw_unlock() };
                owner = Some(emptied.then_some(cursor));
                break;
            }
            cursor = pool.next.load(Ordering::Acquire);
        }
        unsafe { self.linkage.raw_unlock_shared() };

        match owner {
            None => Err(ObjectAllocError::NotOwned),
            Some(Some(emptied)) => {
                self.release_if_idle(emptied);
                Ok(())
            }
            Some(None) => Ok(()),
        }
    }

    /// Drops the object in place and returns its storage.
    ///
    /// # Errors
    /// [`ObjectAllocError::NotOwned`] if no pool contains `object`; nothing
    /// is dropped then.
    ///
    /// # Safety
    /// `object` must hold an initialized `T` that is not used afterwards.
    pub unsafe fn destroy(&self, object: NonNull<T>) -> Result<(), ObjectAllocError> {
        if !self.contains(object.as_ptr()) {
            return Err(ObjectAllocError::NotOwned);
        }
        unsafe { ptr::drop_in_place(object.as_ptr()) };
        self.deallocate(object)
    }

    /// Whether `object` is the start of a slot in one of the pools.
    pub fn contains(&self, object: *const T) -> bool {
        let addr = object as usize;
        self.linkage.raw_lock_shared();
        let mut found = false;
        let mut cursor = self.first.load(Ordering::Acquire);
        while let Some(pool) = unsafe { cursor.as_ref() } {
            if pool.index_of(self.geometry, addr).is_some() {
                found = true;
                break;
            }
            cursor = pool.next.load(Ordering::Acquire);
        }
        unsafe { self.linkage.raw_unlock_shared() };
        found
    }

    /// Grows the capacity by at least `objects`, whether or not any are free.
    ///
    /// # Errors
    /// When the provider is exhausted or the quota is reached.
    pub fn force_expand(&self, objects: usize) -> Result<(), ObjectAllocError> {
        let _irq = InterruptGuard::new();
        self.with_acquisition(|| self.grow(objects.max(1)))
    }

    /// Pops a free slot from the first pool that has one.
    fn take_free(&self) -> Option<NonNull<u8>> {
        if self.free_count() == 0 {
            return None;
        }

        let mut slot = None;
        self.linkage.raw_lock_shared();
        let mut cursor = self.first.load(Ordering::Acquire);
        while let Some(pool) = unsafe { cursor.as_ref() } {
            if pool.free_count() > 0 {
                pool.lock.raw_lock();
                slot = unsafe { pool.pop(self.geometry) };
                if slot.is_some() {
                    self.free_count.fetch_sub(1, Ordering::AcqRel);
                }
                unsafe { pool.lock.raw_unlock() };
                if slot.is_some() {
                    break;
                }
            }
            cursor = pool.next.load(Ordering::Acquire);
        }
        unsafe { self.linkage.raw_unlock_shared() };
        slot
    }

    /// Runs `f` as the only core talking to the provider.
    ///
    /// A core that is already inside (a nested call from the provider
    /// itself) runs `f` directly.
    fn with_acquisition<U>(&self, f: impl FnOnce() -> U) -> U {
        let core = current_core_index();
        if self.special_locker.load(Ordering::Acquire) == core {
            return f();
        }

        self.acquisition.raw_lock();
        self.special_locker.store(core, Ordering::Release);
        let result = f();
        self.special_locker.store(NO_CORE, Ordering::Release);
        unsafe { self.acquisition.raw_unlock() };
        result
    }

    fn clamp_to_quota(&self, wanted: usize) -> Result<usize, ObjectAllocError> {
        let Some(quota) = self.quota else {
            return Ok(wanted);
        };
        let capacity = self.capacity();
        if capacity >= quota {
            return Err(ObjectAllocError::QuotaExceeded { quota });
        }
        Ok(wanted.min(quota - capacity))
    }

    /// Adds at least `objects` slots. Caller is inside [`with_acquisition`](Self::with_acquisition).
    fn grow(&self, objects: usize) -> Result<(), ObjectAllocError> {
        let objects = self.clamp_to_quota(objects)?;

        let tail = self.last.load(Ordering::Acquire);
        if let Some(pool) = unsafe { tail.as_ref() } {
            self.enlarging.store(tail, Ordering::Release);
            let grown = self
                .provider
                .enlarge_pool(self.geometry, objects, pool.block());
            self.enlarging.store(ptr::null_mut(), Ordering::Release);

            match grown {
                Ok(block) => {
                    pool.lock.raw_lock();
                    let added = unsafe { pool.extend(self.geometry, block.bytes) };
                    self.capacity.fetch_add(added, Ordering::AcqRel);
                    self.free_count.fetch_add(added, Ordering::AcqRel);
                    unsafe { pool.lock.raw_unlock() };
                    if added > 0 {
                        log::trace!("pool {tail:p} enlarged by {added} objects");
                        return Ok(());
                    }
                }
                Err(e) => log::trace!("pool {tail:p} not enlarged: {e}"),
            }
        }

        let block = self.provider.acquire_pool(self.geometry, objects)?;
        let Some(pool) = (unsafe { Pool::<K>::format(block, self.geometry) }) else {
            self.provider.release_pool(self.geometry, block)?;
            return Err(ObjectAllocError::PoolTooSmall { bytes: block.bytes });
        };
        let added = unsafe { pool.as_ref() }.capacity() as usize;

        self.linkage.raw_lock_exclusive();
        let tail = self.last.load(Ordering::Acquire);
        match unsafe { tail.as_ref() } {
            Some(t) => t.next.store(pool.as_ptr(), Ordering::Release),
            None => self.first.store(pool.as_ptr(), Ordering::Release),
        }
        self.last.store(pool.as_ptr(), Ordering::Release);
        self.pool_count.fetch_add(1, Ordering::AcqRel);
        self.capacity.fetch_add(added, Ordering::AcqRel);
        self.free_count.fetch_add(added, Ordering::AcqRel);
        unsafe { self.linkage.raw_unlock_exclusive() };

        log::debug!(
            "acquired pool {:p} with {added} objects of {} bytes",
            pool.as_ptr(),
            self.geometry.object_size
        );
        Ok(())
    }

    /// Gives an empty pool back, subject to the release policy.
    fn release_if_idle(&self, target: *mut Pool<K>) {
        if self.release == PoolReleaseOptions::NoRelease {
            return;
        }

        self.with_acquisition(|| {
            if self.enlarging.load(Ordering::Acquire) == target {
                return;
            }

            self.linkage.raw_lock_exclusive();
            let block = self.unlink_if_idle(target);
            unsafe { self.linkage.raw_unlock_exclusive() };

            if let Some(block) = block {
                if let Err(e) = self.provider.release_pool(self.geometry, block) {
                    log::warn!("pool at {:p} could not be released: {e}", block.base);
                } else {
                    log::trace!("released pool at {:p}", block.base);
                }
            }
        });
    }

    /// Caller holds the linkage lock exclusively.
    fn unlink_if_idle(&self, target: *mut Pool<K>) -> Option<crate::PoolBlock> {
        if self.release == PoolReleaseOptions::KeepOne && self.pool_count() <= 1 {
            return None;
        }

        let mut prev: *mut Pool<K> = ptr::null_mut();
        let mut cursor = self.first.load(Ordering::Acquire);
        while !cursor.is_null() && cursor != target {
            prev = cursor;
            cursor = unsafe { &*cursor }.next.load(Ordering::Acquire);
        }
        // Already released by someone else.
        let pool = unsafe { cursor.as_ref() }?;

        let capacity = pool.capacity() as usize;
        if pool.free_count() as usize != capacity {
            return None;
        }

        let next = pool.next.load(Ordering::Acquire);
        match unsafe { prev.as_ref() } {
            Some(p) => p.next.store(next, Ordering::Release),
            None => self.first.store(next, Ordering::Release),
        }
        if self.last.load(Ordering::Acquire) == target {
            self.last.store(prev, Ordering::Release);
        }
        self.pool_count.fetch_sub(1, Ordering::AcqRel);
        self.capacity.fetch_sub(capacity, Ordering::AcqRel);
        self.free_count.fetch_sub(capacity, Ordering::AcqRel);
        Some(pool.block())
    }
}

impl<T, P: PoolProvider, K: Locking> Drop for ObjectAllocator<T, P, K> {
    fn drop(&mut self) {
        if self.live() > 0 {
            log::warn!("dropping allocator with {} live objects", self.live());
        }
        let mut cursor = *self.first.get_mut();
        while let Some(pool) = unsafe { cursor.as_ref() } {
            let next = pool.next.load(Ordering::Acquire);
            if let Err(e) = self.provider.release_pool(self.geometry, pool.block()) {
                log::warn!("pool at {cursor:p} could not be released: {e}");
            }
            cursor = next;
        }
    }
}
