//! Virtual address spaces: a region list behind a read-write spinlock.
//!
//! [`Vas`] is the plain kind used for userland. [`KernelVas`] covers the
//! kernel heap, whose region descriptors are themselves allocated from the
//! kernel heap. After every exclusive operation it tops the descriptor
//! allocator back up to [`KernelVas::FREE_DESCRIPTORS_THRESHOLD`] while
//! still holding the lock; the nested heap operations this triggers run on
//! the electing core and skip the lock it already holds.

use crate::region::{Descriptors, Link, RegionList};
use crate::{MemoryAllocationOptions, MemoryContent, MemoryRange, MemoryRegion, VmmError};
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_alloc::{PoolProvider, PoolReleaseOptions};
use kernel_info::memory::{KERNEL_HEAP_END, KERNEL_HEAP_START, USERLAND_END, USERLAND_START};
use kernel_sync::core_local::{NO_CORE, current_core_index};
use kernel_sync::{InterruptGuard, RwLock, RwLockReadGuard};
use kernel_vmem::{MemoryFlags, VirtualAddress};

/// Read access to a region list.
pub enum SharedRegions<'a> {
    Locked(RwLockReadGuard<'a, RegionList>),
    /// The calling core already holds the lock exclusively.
    Borrowed(&'a RegionList),
}

impl Deref for SharedRegions<'_> {
    type Target = RegionList;

    fn deref(&self) -> &RegionList {
        match self {
            Self::Locked(guard) => guard,
            Self::Borrowed(list) => list,
        }
    }
}

/// Copies of the regions of a VAS, in address order, taken under its lock.
pub struct Regions<'a> {
    list: SharedRegions<'a>,
    next: Link,
}

impl Iterator for Regions<'_> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<MemoryRegion> {
        let (region, next) = RegionList::step(self.next)?;
        self.next = next;
        Some(region)
    }
}

impl Regions<'_> {
    /// The list the iterator walks.
    #[must_use]
    pub fn list(&self) -> &RegionList {
        &self.list
    }
}

/// Region bookkeeping shared by [`Vas`] and [`KernelVas`].
pub trait VirtualSpace {
    type Provider: PoolProvider;

    fn bounds(&self) -> MemoryRange;

    fn descriptors(&self) -> &Descriptors<Self::Provider>;

    /// Read access to the region list.
    fn shared(&self) -> SharedRegions<'_>;

    /// Runs `op` with exclusive access to the region list.
    ///
    /// # Errors
    /// Whatever `op` returns.
    fn exclusive<R>(
        &self,
        op: impl FnOnce(&mut RegionList) -> Result<R, VmmError>,
    ) -> Result<R, VmmError>;

    /// Reserves `pages` pages plus the requested guard pages and returns
    /// the first usable address.
    ///
    /// # Errors
    /// - [`VmmError::OutOfVirtualSpace`] when no free region is large enough.
    /// - [`VmmError::AddressInUse`] when `hint` is not free.
    /// - [`VmmError::ArgumentOutOfRange`] for empty or out-of-bounds requests.
    /// - [`VmmError::Descriptors`] when no region descriptor is left.
    fn allocate(
        &self,
        hint: Option<VirtualAddress>,
        pages: usize,
        flags: MemoryFlags,
        options: MemoryAllocationOptions,
        content: MemoryContent,
    ) -> Result<VirtualAddress, VmmError> {
        let bounds = self.bounds();
        let descriptors = self.descriptors();
        self.exclusive(|list| {
            list.allocate(descriptors, bounds, hint, pages, flags, options, content)
        })
    }

    /// Marks `pages` pages at `addr` free again and returns the freed range.
    ///
    /// # Errors
    /// The range must lie in one allocated, non-permanent region.
    fn free(&self, addr: VirtualAddress, pages: usize) -> Result<MemoryRange, VmmError> {
        let descriptors = self.descriptors();
        self.exclusive(|list| list.free(descriptors, addr, pages))
    }

    /// Changes the protection of `pages` pages at `addr`; returns the old flags.
    ///
    /// # Errors
    /// The range must lie in one allocated region.
    fn modify(
        &self,
        addr: VirtualAddress,
        pages: usize,
        flags: MemoryFlags,
    ) -> Result<MemoryFlags, VmmError> {
        let descriptors = self.descriptors();
        self.exclusive(|list| list.modify(descriptors, addr, pages, flags))
    }

    fn find_region(&self, addr: VirtualAddress) -> Option<MemoryRegion> {
        self.shared().find(addr).copied()
    }

    fn regions(&self) -> Regions<'_> {
        let list = self.shared();
        let next = list.head();
        Regions { list, next }
    }
}

pub struct Vas<D: PoolProvider> {
    bounds: MemoryRange,
    regions: RwLock<RegionList>,
    descriptors: Descriptors<D>,
}

impl<D: PoolProvider> Vas<D> {
    /// A space spanning `bounds`, entirely free.
    ///
    /// # Errors
    /// Unaligned or empty bounds, or no descriptor for the first region.
    pub fn new(bounds: MemoryRange, provider: D, release: PoolReleaseOptions) -> Result<Self, VmmError> {
        if bounds.is_empty() || !bounds.is_page_aligned() {
            return Err(VmmError::ArgumentOutOfRange);
        }
        let descriptors = Descriptors::new(provider, release);
        let mut regions = RegionList::new();
        regions.init(&descriptors, bounds)?;
        Ok(Self {
            bounds,
            regions: RwLock::new(regions),
            descriptors,
        })
    }

    /// The userland window of a process.
    ///
    /// # Errors
    /// See [`Vas::new`].
    pub fn userland(provider: D) -> Result<Self, VmmError> {
        Self::new(
            MemoryRange::new(
                VirtualAddress::new(USERLAND_START),
                VirtualAddress::new(USERLAND_END),
            ),
            provider,
            PoolReleaseOptions::KeepOne,
        )
    }

    #[must_use]
    pub fn free_descriptors(&self) -> usize {
        self.descriptors.free_count()
    }
}

impl<D: PoolProvider> VirtualSpace for Vas<D> {
    type Provider = D;

    fn bounds(&self) -> MemoryRange {
        self.bounds
    }

    fn descriptors(&self) -> &Descriptors<D> {
        &self.descriptors
    }

    fn shared(&self) -> SharedRegions<'_> {
        SharedRegions::Locked(self.regions.read())
    }

    fn exclusive<R>(
        &self,
        op: impl FnOnce(&mut RegionList) -> Result<R, VmmError>,
    ) -> Result<R, VmmError> {
        let _irq = InterruptGuard::new();
        let mut list = self.regions.write();
        op(&mut list)
    }
}

impl<D: PoolProvider> Drop for Vas<D> {
    fn drop(&mut self) {
        let Self {
            regions,
            descriptors,
            ..
        } = self;
        regions.get_mut().clear(descriptors);
    }
}

/// The kernel heap's address space.
pub struct KernelVas<D: PoolProvider> {
    vas: Vas<D>,
    enlarging_core: AtomicUsize,
}

impl<D: PoolProvider> KernelVas<D> {
    /// Free descriptors kept in reserve for the next operation.
    ///
    /// One operation consumes at most two, so a nested operation during
    /// replenishment always finds enough.
    pub const FREE_DESCRIPTORS_THRESHOLD: usize = 4;

    /// A kernel space spanning `bounds`, with the descriptor reserve filled.
    ///
    /// Descriptor pools are never released, since releasing one would need
    /// the lock held by the releasing operation.
    ///
    /// # Errors
    /// See [`Vas::new`].
    pub fn new(bounds: MemoryRange, provider: D) -> Result<Self, VmmError> {
        let kvas = Self {
            vas: Vas::new(bounds, provider, PoolReleaseOptions::NoRelease)?,
            enlarging_core: AtomicUsize::new(NO_CORE),
        };
        kvas.replenish(current_core_index());
        Ok(kvas)
    }

    /// The kernel heap window.
    ///
    /// # Errors
    /// See [`Vas::new`].
    pub fn kernel_heap(provider: D) -> Result<Self, VmmError> {
        Self::new(
            MemoryRange::new(
                VirtualAddress::new(KERNEL_HEAP_START),
                VirtualAddress::new(KERNEL_HEAP_END),
            ),
            provider,
        )
    }

    #[must_use]
    pub fn free_descriptors(&self) -> usize {
        self.vas.free_descriptors()
    }

    /// The core currently refilling the descriptor reserve.
    #[must_use]
    pub fn enlarging_core(&self) -> Option<usize> {
        let core = self.enlarging_core.load(Ordering::Acquire);
        (core != NO_CORE).then_some(core)
    }

    /// Whether the calling core is refilling the reserve, and so already
    /// holds the lock.
    #[must_use]
    pub fn is_enlarging_here(&self) -> bool {
        self.enlarging_core.load(Ordering::Acquire) == current_core_index()
    }

    /// Tops the descriptor reserve up if it fell below the threshold and
    /// no other core is already on it.
    fn replenish(&self, core: usize) {
        let free = self.vas.descriptors.free_count();
        if free >= Self::FREE_DESCRIPTORS_THRESHOLD {
            return;
        }
        if self
            .enlarging_core
            .compare_exchange(NO_CORE, core, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        log::debug!("core {core} refilling kernel VAS descriptors ({free} free)");
        if let Err(e) = self
            .vas
            .descriptors
            .force_expand(Self::FREE_DESCRIPTORS_THRESHOLD - free)
        {
            log::warn!("kernel VAS descriptor reserve not refilled: {e}");
        }
        self.enlarging_core.store(NO_CORE, Ordering::Release);
    }
}

impl<D: PoolProvider> VirtualSpace for KernelVas<D> {
    type Provider = D;

    fn bounds(&self) -> MemoryRange {
        self.vas.bounds
    }

    fn descriptors(&self) -> &Descriptors<D> {
        &self.vas.descriptors
    }

    fn shared(&self) -> SharedRegions<'_> {
        if self.is_enlarging_here() {
            // The exclusive lock is held further up this core's stack.
            return SharedRegions::Borrowed(unsafe { &*self.vas.regions.data_ptr() });
        }
        SharedRegions::Locked(self.vas.regions.read())
    }

    fn exclusive<R>(
        &self,
        op: impl FnOnce(&mut RegionList) -> Result<R, VmmError>,
    ) -> Result<R, VmmError> {
        let core = current_core_index();
        if self.enlarging_core.load(Ordering::Acquire) == core {
            // Nested inside `replenish` below, on this core.
            return op(unsafe { &mut *self.vas.regions.data_ptr() });
        }

        let _irq = InterruptGuard::new();
        let mut list = self.vas.regions.write();
        let result = op(&mut list);
        self.replenish(core);
        drop(list);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::HeapPoolProvider;
    use kernel_vmem::PAGE_SIZE;

    fn heap() -> KernelVas<HeapPoolProvider> {
        KernelVas::kernel_heap(HeapPoolProvider).unwrap()
    }

    #[test]
    fn kernel_vas_starts_with_a_full_reserve() {
        let kvas = heap();
        assert!(kvas.free_descriptors() >= KernelVas::<HeapPoolProvider>::FREE_DESCRIPTORS_THRESHOLD);
        assert_eq!(kvas.enlarging_core(), None);
        assert_eq!(kvas.regions().count(), 1);
    }

    #[test]
    fn reserve_is_refilled_after_every_operation() {
        let kvas = heap();
        let threshold = KernelVas::<HeapPoolProvider>::FREE_DESCRIPTORS_THRESHOLD;
        for _ in 0..64 {
            kvas.allocate(
                None,
                1,
                MemoryFlags::WRITABLE,
                MemoryAllocationOptions::COMMIT,
                MemoryContent::Generic,
            )
            .unwrap();
            assert!(kvas.free_descriptors() >= threshold);
        }
        assert_eq!(kvas.regions().count(), 65);
    }

    #[test]
    fn regions_tile_the_bounds() {
        let vas = Vas::userland(HeapPoolProvider).unwrap();
        let a = vas
            .allocate(
                None,
                3,
                MemoryFlags::USERLAND,
                MemoryAllocationOptions::GUARD_HIGH,
                MemoryContent::ThreadStack,
            )
            .unwrap();
        assert_eq!(a.as_u64(), USERLAND_START);

        let mut end = vas.bounds().start;
        for region in vas.regions() {
            assert_eq!(region.range.start, end);
            end = region.range.end;
        }
        assert_eq!(end, vas.bounds().end);

        let region = vas.find_region(a + 3 * PAGE_SIZE).unwrap();
        assert_eq!(region.content, MemoryContent::ThreadStack);
        assert!(region.is_guard_page(a + 3 * PAGE_SIZE));
    }

    #[test]
    fn unaligned_bounds_are_rejected() {
        let bounds = MemoryRange::new(VirtualAddress::new(0x1000), VirtualAddress::new(0x1800));
        assert!(matches!(
            Vas::new(bounds, HeapPoolProvider, PoolReleaseOptions::KeepOne),
            Err(VmmError::ArgumentOutOfRange)
        ));
    }
}
