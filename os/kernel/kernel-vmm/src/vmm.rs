//! The memory manager proper: page tables, frames and both kinds of VAS.
//!
//! Lock order is VAS lock, then a table lock (kernel half or one process's
//! user half), then the frame allocator. Table and frame locks are held
//! with interrupts disabled.

use crate::region::Descriptors;
use crate::{
    AllocationStrategy, KernelVas, MemoryAllocationOptions, MemoryCheckType, MemoryContent,
    MemoryRange, PageFaultFlags, ProcessSpace, Vas, VirtualSpace, VmmError,
};
use core::ptr::NonNull;
use kernel_alloc::{ObjectAllocError, PageSource, PoolProvider};
use kernel_info::memory::{
    KERNEL_HEAP_END, KERNEL_HEAP_START, USERLAND_END, is_kernel_heap, is_userland,
};
use kernel_sync::TicketMutex;
use kernel_vmem::{
    AddressSpace, FrameAlloc, MemoryFlags, Mmu, PAGE_SIZE, PhysMapper, PhysicalAddress,
    VirtualAddress, fill_frame,
};

/// Byte committed userland pages start out as.
const USER_FILL: u8 = 0xCA;

/// Page tables one operation works on.
#[derive(Clone, Copy)]
struct Tables<'a> {
    root: PhysicalAddress,
    lock: &'a TicketMutex<()>,
}

pub struct Vmm<M: Mmu, F: FrameAlloc, P: PhysMapper, D: PoolProvider> {
    mmu: M,
    mapper: P,
    frames: TicketMutex<F>,
    kernel_root: PhysicalAddress,
    /// Serializes changes to the kernel half of the tables.
    kernel_tables: TicketMutex<()>,
    kvas: KernelVas<D>,
}

impl<M: Mmu, F: FrameAlloc, P: PhysMapper, D: PoolProvider> Vmm<M, F, P, D> {
    /// Builds a manager around a fresh, empty kernel root.
    ///
    /// # Errors
    /// Running out of frames for tables, or of descriptors for the kernel VAS.
    pub fn new(mmu: M, mapper: P, frames: F, descriptors: D) -> Result<Self, VmmError> {
        let mut frames = frames;
        let root = AddressSpace::new(&mapper, &mut frames)?.root();
        // The root came from `frames` and is reachable through `mapper`.
        unsafe { Self::with_kernel_root(mmu, mapper, frames, root, descriptors) }
    }

    /// Builds a manager around the kernel tables at `kernel_root`.
    ///
    /// Every PML4 slot of the kernel heap gets a table up front, so process
    /// roots copied from the kernel half later see every heap mapping.
    ///
    /// # Errors
    /// Running out of frames for tables, or of descriptors for the kernel VAS.
    ///
    /// # Safety
    /// `kernel_root` must be a PML4 reachable through `mapper`, and no frame
    /// in use by it may be handed out by `frames`.
    pub unsafe fn with_kernel_root(
        mmu: M,
        mapper: P,
        frames: F,
        kernel_root: PhysicalAddress,
        descriptors: D,
    ) -> Result<Self, VmmError> {
        let mut frames = frames;
        let linked = AddressSpace::from_root(&mapper, kernel_root).link_top_level(
            &mut frames,
            VirtualAddress::new(KERNEL_HEAP_START),
            VirtualAddress::new(KERNEL_HEAP_END),
        )?;
        log::debug!("kernel root {kernel_root:?}: {linked} heap tables linked");

        Ok(Self {
            mmu,
            mapper,
            frames: TicketMutex::new(frames),
            kernel_root,
            kernel_tables: TicketMutex::new(()),
            kvas: KernelVas::kernel_heap(descriptors)?,
        })
    }

    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalAddress {
        self.kernel_root
    }

    #[inline]
    #[must_use]
    pub const fn kernel_vas(&self) -> &KernelVas<D> {
        &self.kvas
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &M {
        &self.mmu
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &P {
        &self.mapper
    }

    /// Runs `f` on the frame allocator.
    pub fn with_frames<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        let mut frames = self.frames.lock_uninterruptible();
        f(&mut *frames)
    }

    #[inline]
    fn tree(&self, root: PhysicalAddress) -> AddressSpace<'_, P> {
        AddressSpace::from_root(&self.mapper, root)
    }

    #[inline]
    const fn kernel_tables(&self) -> Tables<'_> {
        Tables {
            root: self.kernel_root,
            lock: &self.kernel_tables,
        }
    }

    /// Upper-half addresses always resolve through the kernel tables.
    #[inline]
    fn tables<'a, U: PoolProvider>(
        &'a self,
        space: &'a ProcessSpace<U>,
        va: VirtualAddress,
    ) -> Tables<'a> {
        if va.as_u64() >= USERLAND_END {
            self.kernel_tables()
        } else {
            Tables {
                root: space.root,
                lock: &space.tables,
            }
        }
    }

    /// A new process space sharing the kernel half.
    ///
    /// # Errors
    /// No frame for the root, or no descriptor for the userland VAS.
    pub fn create_space<U: PoolProvider>(&self, provider: U) -> Result<ProcessSpace<U>, VmmError> {
        let vas = Vas::userland(provider)?;
        let _kernel = self.kernel_tables.lock_uninterruptible();
        let mut frames = self.frames.lock_uninterruptible();
        let tree = AddressSpace::new(&self.mapper, &mut *frames)?;
        tree.share_kernel_half(&self.tree(self.kernel_root));
        Ok(ProcessSpace {
            root: tree.root(),
            tables: TicketMutex::new(()),
            vas,
        })
    }

    /// Unmaps every userland page of `space`, then frees its tables.
    ///
    /// Returns the number of frames given back. The space must not be
    /// active on any core.
    pub fn destroy_space<U: PoolProvider>(&self, space: ProcessSpace<U>) -> usize {
        debug_assert_ne!(self.mmu.current_root(), space.root);
        let t = Tables {
            root: space.root,
            lock: &space.tables,
        };
        let mut released = 0;
        for region in space.vas.regions().filter(|r| !r.is_free()) {
            released += self.unmap_in(t, region.range, true);
        }
        let _tables = space.tables.lock_uninterruptible();
        let mut frames = self.frames.lock_uninterruptible();
        released + self.tree(space.root).release_tables(&mut *frames)
    }

    /// Maps one page.
    ///
    /// # Errors
    /// An existing mapping without `overwrite`, bad addresses, or no frame
    /// for an intermediate table.
    pub fn map_page<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MemoryFlags,
        overwrite: bool,
    ) -> Result<(), VmmError> {
        let t = self.tables(space, va);
        let _tables = t.lock.lock_uninterruptible();
        let mut frames = self.frames.lock_uninterruptible();
        self.tree(t.root)
            .map_page(&mut *frames, va, pa, flags, overwrite)?;
        self.mmu.invalidate_page(va);
        Ok(())
    }

    /// Maps `pages` consecutive pages onto consecutive frames. All or nothing.
    ///
    /// # Errors
    /// As [`map_page`](Self::map_page), for any page of the range.
    pub fn map_range<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        pages: usize,
        flags: MemoryFlags,
    ) -> Result<(), VmmError> {
        let t = self.tables(space, va);
        let _tables = t.lock.lock_uninterruptible();
        let mut frames = self.frames.lock_uninterruptible();
        let tree = self.tree(t.root);

        for i in 0..pages as u64 {
            let page = va + i * PAGE_SIZE;
            if let Err(e) = tree.map_page(&mut *frames, page, pa + i * PAGE_SIZE, flags, false) {
                for j in 0..i {
                    let _ = tree.unmap_page(va + j * PAGE_SIZE);
                    self.mmu.invalidate_page(va + j * PAGE_SIZE);
                }
                return Err(e.into());
            }
            self.mmu.invalidate_page(page);
        }
        Ok(())
    }

    /// Removes one mapping and returns the frame it pointed at.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] when nothing is mapped at `va`.
    pub fn unmap_page<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, VmmError> {
        let t = self.tables(space, va);
        let _tables = t.lock.lock_uninterruptible();
        let pa = self.tree(t.root).unmap_page(va)?;
        self.mmu.invalidate_page(va);
        Ok(pa)
    }

    /// Removes every mapping in `pages` pages at `va`, skipping holes, and
    /// returns how many were removed. With `release_frames` the frames go
    /// back to the frame allocator.
    ///
    /// # Errors
    /// [`VmmError::AlignmentFailure`] for an unaligned `va`.
    pub fn unmap_range<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        va: VirtualAddress,
        pages: usize,
        release_frames: bool,
    ) -> Result<usize, VmmError> {
        if !va.is_page_aligned() {
            return Err(VmmError::AlignmentFailure);
        }
        let t = self.tables(space, va);
        Ok(self.unmap_in(t, MemoryRange::from_pages(va, pages), release_frames))
    }

    fn unmap_in(&self, t: Tables<'_>, range: MemoryRange, release_frames: bool) -> usize {
        let _tables = t.lock.lock_uninterruptible();
        let mut frames = self.frames.lock_uninterruptible();
        let tree = self.tree(t.root);
        let mut removed = 0;
        for page in range.pages() {
            if let Ok(pa) = tree.unmap_page(page) {
                self.mmu.invalidate_page(page);
                if release_frames {
                    frames.free_4k(pa);
                }
                removed += 1;
            }
        }
        removed
    }

    #[must_use]
    pub fn translate<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        self.tree(self.tables(space, va).root).translate(va)
    }

    #[must_use]
    pub fn page_flags<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        va: VirtualAddress,
    ) -> Option<MemoryFlags> {
        self.tree(self.tables(space, va).root).page_flags(va)
    }

    /// Replaces the protection of a mapped page; returns the old flags.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] when the page is not present.
    pub fn set_page_flags<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        va: VirtualAddress,
        flags: MemoryFlags,
    ) -> Result<MemoryFlags, VmmError> {
        let t = self.tables(space, va);
        let _tables = t.lock.lock_uninterruptible();
        let old = self.tree(t.root).set_page_flags(va, flags)?;
        self.mmu.invalidate_page(va);
        Ok(old)
    }

    /// Reserves `pages` pages in the kernel heap or, with
    /// [`MemoryAllocationOptions::VIRTUAL_USER`], in `space`'s userland.
    ///
    /// Commit-strategy allocations are backed right away; userland ones are
    /// filled with `0xCA`. If frames run out midway, the pages mapped so far
    /// are unmapped and the reservation is dropped.
    ///
    /// # Errors
    /// - [`VmmError::OutOfVirtualSpace`] or [`VmmError::AddressInUse`] from
    ///   the VAS.
    /// - [`VmmError::OutOfMemory`] when frames run out during a commit.
    pub fn allocate_pages<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        hint: Option<VirtualAddress>,
        pages: usize,
        options: MemoryAllocationOptions,
        flags: MemoryFlags,
        content: MemoryContent,
    ) -> Result<VirtualAddress, VmmError> {
        if options.contains(MemoryAllocationOptions::VIRTUAL_USER) {
            let t = Tables {
                root: space.root,
                lock: &space.tables,
            };
            self.allocate_in(&space.vas, t, hint, pages, options, flags, content, Some(USER_FILL))
        } else {
            self.allocate_kernel_pages(hint, pages, options, flags, content)
        }
    }

    /// [`allocate_pages`](Self::allocate_pages) in the kernel heap.
    ///
    /// # Errors
    /// See [`allocate_pages`](Self::allocate_pages).
    pub fn allocate_kernel_pages(
        &self,
        hint: Option<VirtualAddress>,
        pages: usize,
        options: MemoryAllocationOptions,
        flags: MemoryFlags,
        content: MemoryContent,
    ) -> Result<VirtualAddress, VmmError> {
        debug_assert!(!options.contains(MemoryAllocationOptions::VIRTUAL_USER));
        let t = self.kernel_tables();
        self.allocate_in(&self.kvas, t, hint, pages, options, flags, content, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate_in<V: VirtualSpace>(
        &self,
        vas: &V,
        t: Tables<'_>,
        hint: Option<VirtualAddress>,
        pages: usize,
        options: MemoryAllocationOptions,
        flags: MemoryFlags,
        content: MemoryContent,
        fill: Option<u8>,
    ) -> Result<VirtualAddress, VmmError> {
        let va = vas.allocate(hint, pages, flags, options, content)?;
        if options.strategy() != AllocationStrategy::Commit {
            return Ok(va);
        }

        if let Err(e) = self.commit(t, va, pages, flags, fill) {
            log::debug!("commit of {pages} pages at {va:?} failed: {e}");
            let descriptors: &Descriptors<V::Provider> = vas.descriptors();
            if let Err(e) = vas.exclusive(|list| list.release(descriptors, va, pages, false)) {
                log::warn!("reservation at {va:?} not returned: {e}");
            }
            return Err(e);
        }
        Ok(va)
    }

    /// Backs `pages` pages at `va` with fresh frames, rolling back on failure.
    fn commit(
        &self,
        t: Tables<'_>,
        va: VirtualAddress,
        pages: usize,
        flags: MemoryFlags,
        fill: Option<u8>,
    ) -> Result<(), VmmError> {
        let _tables = t.lock.lock_uninterruptible();
        let mut frames = self.frames.lock_uninterruptible();
        let tree = self.tree(t.root);

        let range = MemoryRange::from_pages(va, pages);
        for (done, page) in range.pages().enumerate() {
            let mapped = match frames.alloc_4k() {
                None => Err(VmmError::OutOfMemory),
                Some(pa) => {
                    if let Some(byte) = fill {
                        // Fresh frame, owned by us until mapped.
                        unsafe { fill_frame(&self.mapper, pa, byte) };
                    }
                    tree.map_page(&mut *frames, page, pa, flags, false)
                        .map_err(|e| {
                            frames.free_4k(pa);
                            VmmError::from(e)
                        })
                }
            };

            if let Err(e) = mapped {
                for undo in range.pages().take(done) {
                    if let Ok(pa) = tree.unmap_page(undo) {
                        self.mmu.invalidate_page(undo);
                        frames.free_4k(pa);
                    }
                }
                return Err(e);
            }
            self.mmu.invalidate_page(page);
        }
        Ok(())
    }

    /// Unmaps and frees `pages` pages at `va`, then returns them to the VAS
    /// they came from.
    ///
    /// # Errors
    /// - [`VmmError::AlignmentFailure`] for an unaligned `va`.
    /// - [`VmmError::ArgumentOutOfRange`] outside both windows or outside
    ///   one allocated region.
    /// - [`VmmError::Failed`] for permanent regions.
    pub fn free_pages<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        va: VirtualAddress,
        pages: usize,
    ) -> Result<(), VmmError> {
        if is_userland(va.as_u64()) {
            let t = Tables {
                root: space.root,
                lock: &space.tables,
            };
            self.free_in(&space.vas, t, va, pages)
        } else {
            self.free_kernel_pages(va, pages)
        }
    }

    /// [`free_pages`](Self::free_pages) in the kernel heap.
    ///
    /// # Errors
    /// See [`free_pages`](Self::free_pages).
    pub fn free_kernel_pages(&self, va: VirtualAddress, pages: usize) -> Result<(), VmmError> {
        if !is_kernel_heap(va.as_u64()) {
            return Err(VmmError::ArgumentOutOfRange);
        }
        self.free_in(&self.kvas, self.kernel_tables(), va, pages)
    }

    fn free_in<V: VirtualSpace>(
        &self,
        vas: &V,
        t: Tables<'_>,
        va: VirtualAddress,
        pages: usize,
    ) -> Result<(), VmmError> {
        if !va.is_page_aligned() {
            return Err(VmmError::AlignmentFailure);
        }
        let want = MemoryRange::from_pages(va, pages);
        let descriptors: &Descriptors<V::Provider> = vas.descriptors();

        // Lookup, unmap and release under one exclusive hold, so no other
        // core frees or reuses the range in between.
        vas.exclusive(|list| {
            let region = list.find(va).ok_or(VmmError::ArgumentOutOfRange)?;
            if pages == 0 || region.is_free() || !region.range.covers(&want) {
                return Err(VmmError::ArgumentOutOfRange);
            }
            if region.options.contains(MemoryAllocationOptions::PERMANENT) {
                return Err(VmmError::Failed);
            }

            let unmapped = self.unmap_in(t, want, true);
            let released = list.free(descriptors, va, pages)?;
            log::trace!("freed {released:?}, {unmapped} frames returned");
            Ok(())
        })
    }

    /// Resolves a page fault at `addr` by backing an allocate-on-demand
    /// page, under the VAS read lock.
    ///
    /// # Errors
    /// - [`VmmError::Failed`] for faults on present pages, outside both
    ///   windows, or access the region does not allow.
    /// - [`VmmError::ArgumentOutOfRange`] outside any allocated region.
    /// - [`VmmError::PageUndemandable`] for regions not allocated on demand.
    /// - [`VmmError::PageGuard`] on a guard page.
    /// - [`VmmError::OutOfMemory`] when no frame is left.
    pub fn handle_page_fault<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        addr: VirtualAddress,
        access: PageFaultFlags,
    ) -> Result<(), VmmError> {
        if access.contains(PageFaultFlags::PRESENT) {
            return Err(VmmError::Failed);
        }
        let a = addr.as_u64();
        if is_userland(a) {
            let t = Tables {
                root: space.root,
                lock: &space.tables,
            };
            self.fault_in(&space.vas, t, addr, access, true)
        } else if is_kernel_heap(a) {
            debug_assert!(
                !self.kvas.is_enlarging_here(),
                "kernel heap fault while refilling descriptors"
            );
            self.fault_in(&self.kvas, self.kernel_tables(), addr, access, false)
        } else {
            Err(VmmError::Failed)
        }
    }

    fn fault_in<V: VirtualSpace>(
        &self,
        vas: &V,
        t: Tables<'_>,
        addr: VirtualAddress,
        access: PageFaultFlags,
        userland: bool,
    ) -> Result<(), VmmError> {
        let list = vas.shared();
        // The cached node may have been freed or reused since; it is checked
        // like a fresh lookup.
        let region = match list.last_searched(addr) {
            Some(region) => *region,
            None => *list.find(addr).ok_or(VmmError::ArgumentOutOfRange)?,
        };
        if region.is_free() {
            return Err(VmmError::ArgumentOutOfRange);
        }
        if region.options.strategy() != AllocationStrategy::AllocateOnDemand {
            return Err(VmmError::PageUndemandable);
        }
        if region.is_guard_page(addr) {
            return Err(VmmError::PageGuard);
        }
        if (access.contains(PageFaultFlags::EXECUTE)
            && !region.flags.contains(MemoryFlags::EXECUTABLE))
            || (access.contains(PageFaultFlags::USERLAND)
                && !region.flags.contains(MemoryFlags::USERLAND))
        {
            return Err(VmmError::Failed);
        }
        list.remember(addr);

        let fill = userland.then_some(if region.flags.contains(MemoryFlags::WRITABLE) {
            0
        } else {
            USER_FILL
        });
        let page = addr.page_base();

        let _tables = t.lock.lock_uninterruptible();
        let mut frames = self.frames.lock_uninterruptible();
        let pa = frames.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        if let Some(byte) = fill {
            unsafe { fill_frame(&self.mapper, pa, byte) };
        }
        match self
            .tree(t.root)
            .map_page(&mut *frames, page, pa, region.flags, false)
        {
            Ok(()) => {
                self.mmu.invalidate_page(page);
                log::trace!("demand-paged {page:?} -> {pa:?}");
                Ok(())
            }
            Err(e) => {
                frames.free_4k(pa);
                match e {
                    // Another core resolved the same fault first.
                    kernel_vmem::MapError::AlreadyMapped(_) => Ok(()),
                    e => Err(e.into()),
                }
            }
        }
    }

    /// Verifies that `[addr, addr + size)` is allocated with the
    /// attributes `check` asks for.
    ///
    /// # Errors
    /// - [`VmmError::ArgumentOutOfRange`] outside both windows, across a
    ///   window edge, or over a gap.
    /// - [`VmmError::PageReserved`] over reserve-only or unwanted free regions.
    /// - [`VmmError::PageGuard`] over a guard page.
    /// - [`VmmError::Failed`] when flags are missing or, for
    ///   [`MemoryCheckType::PRIVATE`], over shared or runtime regions.
    pub fn check_memory_region<U: PoolProvider>(
        &self,
        space: &ProcessSpace<U>,
        addr: VirtualAddress,
        size: u64,
        check: MemoryCheckType,
    ) -> Result<(), VmmError> {
        let start = addr.as_u64();
        let end = start
            .checked_add(size)
            .filter(|_| size > 0)
            .ok_or(VmmError::ArgumentOutOfRange)?;
        let range = MemoryRange::new(addr, VirtualAddress::new(end));

        if is_userland(start) && end <= USERLAND_END {
            Self::check_in(&space.vas, range, check)
        } else if is_kernel_heap(start) && end <= KERNEL_HEAP_END {
            Self::check_in(&self.kvas, range, check)
        } else {
            Err(VmmError::ArgumentOutOfRange)
        }
    }

    fn check_in<V: VirtualSpace>(
        vas: &V,
        range: MemoryRange,
        check: MemoryCheckType,
    ) -> Result<(), VmmError> {
        let mut required = MemoryFlags::empty();
        required.set(MemoryFlags::WRITABLE, check.contains(MemoryCheckType::WRITABLE));
        required.set(MemoryFlags::USERLAND, check.contains(MemoryCheckType::USERLAND));

        let list = vas.shared();
        let mut cursor = range.start;
        loop {
            let region = list.find(cursor).ok_or(VmmError::ArgumentOutOfRange)?;
            let part = MemoryRange::new(cursor, region.range.end.min(range.end));

            if !(region.is_free() && check.contains(MemoryCheckType::FREE)) {
                if region.options.strategy() == AllocationStrategy::Reserve {
                    return Err(VmmError::PageReserved);
                }
                if region.touches_guard(&part) {
                    return Err(VmmError::PageGuard);
                }
                if !region.flags.contains(required) {
                    return Err(VmmError::Failed);
                }
                if check.contains(MemoryCheckType::PRIVATE)
                    && matches!(region.content, MemoryContent::Share | MemoryContent::Runtime)
                {
                    return Err(VmmError::Failed);
                }
            }

            if region.range.end >= range.end {
                return Ok(());
            }
            cursor = region.range.end;
        }
    }

    /// Loads `to`'s root unless it is already active.
    ///
    /// Returns whether the root changed.
    pub fn switch_to<U: PoolProvider>(&self, to: &ProcessSpace<U>) -> bool {
        let _irq = kernel_sync::InterruptGuard::new();
        if self.mmu.current_root() == to.root {
            return false;
        }
        // Every process root shares the kernel half, so the running code
        // and stack stay mapped.
        unsafe { self.mmu.load_root(to.root) };
        true
    }

    /// Loads `space`'s root unconditionally.
    pub fn activate<U: PoolProvider>(&self, space: &ProcessSpace<U>) {
        let _irq = kernel_sync::InterruptGuard::new();
        unsafe { self.mmu.load_root(space.root) };
    }

    /// Loads the kernel root.
    pub fn activate_kernel(&self) {
        let _irq = kernel_sync::InterruptGuard::new();
        unsafe { self.mmu.load_root(self.kernel_root) };
    }
}

/// Committed, writable kernel heap pages for object pools.
impl<M: Mmu, F: FrameAlloc, P: PhysMapper, D: PoolProvider> PageSource for Vmm<M, F, P, D> {
    fn allocate_pages(
        &self,
        pages: usize,
        at: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, ObjectAllocError> {
        let hint = at.map(|p| VirtualAddress::from_ptr(p.as_ptr()));
        let va = self
            .allocate_kernel_pages(
                hint,
                pages,
                MemoryAllocationOptions::COMMIT,
                MemoryFlags::WRITABLE | MemoryFlags::GLOBAL,
                MemoryContent::Generic,
            )
            .map_err(|e| match e {
                VmmError::AddressInUse(_) | VmmError::ArgumentOutOfRange => {
                    ObjectAllocError::Misplaced
                }
                VmmError::OutOfVirtualSpace => ObjectAllocError::OutOfAddressSpace,
                _ => ObjectAllocError::OutOfMemory,
            })?;

        #[allow(clippy::cast_possible_truncation)]
        let ptr = core::ptr::with_exposed_provenance_mut::<u8>(va.as_u64() as usize);
        NonNull::new(ptr).ok_or(ObjectAllocError::OutOfAddressSpace)
    }

    fn free_pages(&self, base: NonNull<u8>, pages: usize) -> Result<(), ObjectAllocError> {
        self.free_kernel_pages(VirtualAddress::from_ptr(base.as_ptr()), pages)
            .map_err(|e| {
                log::warn!("kernel pages at {base:p} not freed: {e}");
                ObjectAllocError::NotOwned
            })
    }
}
