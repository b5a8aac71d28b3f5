//! # Address Space (x86-64, PML4-rooted)
//!
//! One tree of paging structures rooted at a PML4 frame. All mutation goes
//! through the [`PhysMapper`], so the same code runs against the kernel's
//! direct map and against the in-memory frames used by tests.
//!
//! Intermediate tables are created on demand and are maximally permissive;
//! the leaf entry alone carries the protection. Callers own TLB maintenance
//! for spaces that are currently loaded.

use crate::{
    FrameAlloc, MapError, MemoryFlags, Mmu, PageTable, PageTableEntry, PhysMapper,
    PhysicalAddress, VirtualAddress,
};

/// First PML4 slot of the kernel (upper) half.
pub const KERNEL_HALF_FIRST_SLOT: usize = 256;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalAddress,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocates a zeroed PML4 and wraps it.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if `alloc` has no frame left.
    pub fn new<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        let space = Self { root, mapper };
        space.table(root).zero();
        Ok(space)
    }

    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalAddress) -> Self {
        Self { root, mapper }
    }

    /// Physical address of the PML4.
    #[inline]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Loads this space's root into the MMU.
    ///
    /// # Safety
    /// See [`Mmu::load_root`].
    #[inline]
    pub unsafe fn activate<U: Mmu>(&self, mmu: &U) {
        unsafe { mmu.load_root(self.root) }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    fn table(&self, pa: PhysicalAddress) -> &mut PageTable {
        // Table frames are owned by this tree and mapped by the mapper.
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    fn check(va: VirtualAddress) -> Result<(), MapError> {
        if !va.is_canonical() {
            return Err(MapError::NonCanonical(va));
        }
        if !va.is_page_aligned() {
            return Err(MapError::Unaligned(va.as_u64()));
        }
        Ok(())
    }

    /// Leaf entry for `va` without creating anything.
    #[allow(clippy::mut_from_ref)]
    fn leaf(&self, va: VirtualAddress) -> Result<&mut PageTableEntry, MapError> {
        let [i4, i3, i2, i1] = va.table_indices();
        let mut table = self.table(self.root);
        for i in [i4, i3, i2] {
            let e = table[i];
            if !e.present() {
                return Err(MapError::NotMapped(va));
            }
            if e.huge_page() {
                return Err(MapError::HugePage(va));
            }
            table = self.table(e.physical_address());
        }
        Ok(&mut table[i1])
    }

    /// Leaf entry for `va`, linking missing intermediate tables.
    #[allow(clippy::mut_from_ref)]
    fn leaf_or_create<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<&mut PageTableEntry, MapError> {
        let [i4, i3, i2, i1] = va.table_indices();
        let mut table = self.table(self.root);
        for i in [i4, i3, i2] {
            let e = table[i];
            let next = if e.present() {
                if e.huge_page() {
                    return Err(MapError::HugePage(va));
                }
                e.physical_address()
            } else {
                let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
                log::trace!("new page table at {frame:?} for {va:?}");
                self.table(frame).zero();
                table[i] = PageTableEntry::table(frame);
                frame
            };
            table = self.table(next);
        }
        Ok(&mut table[i1])
    }

    /// Maps the 4 KiB page at `va` to `pa` with `flags`.
    ///
    /// An existing mapping is replaced only when `overwrite` is set.
    ///
    /// # Errors
    /// Misaligned or non-canonical input, an existing mapping without
    /// `overwrite`, or a failed table allocation.
    pub fn map_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MemoryFlags,
        overwrite: bool,
    ) -> Result<(), MapError> {
        Self::check(va)?;
        if !pa.is_page_aligned() {
            return Err(MapError::Unaligned(pa.as_u64()));
        }
        let entry = self.leaf_or_create(alloc, va)?;
        if entry.present() && !overwrite {
            return Err(MapError::AlreadyMapped(va));
        }
        if entry.present() {
            log::debug!("remapping {va:?} from {:?} to {pa:?}", entry.physical_address());
        }
        *entry = PageTableEntry::leaf(pa, flags);
        Ok(())
    }

    /// Removes the mapping at `va` and returns the frame it pointed at.
    ///
    /// Intermediate tables are kept.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] when nothing is mapped there.
    pub fn unmap_page(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        Self::check(va)?;
        let entry = self.leaf(va)?;
        if !entry.present() {
            return Err(MapError::NotMapped(va));
        }
        let pa = entry.physical_address();
        *entry = PageTableEntry::EMPTY;
        Ok(pa)
    }

    /// Translates `va` if a 4 KiB mapping covers it.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !va.is_canonical() {
            return None;
        }
        let entry = self.leaf(va.page_base()).ok()?;
        entry
            .present()
            .then(|| entry.physical_address() + va.page_offset())
    }

    /// Flags of the page containing `va`, or `None` when not present.
    #[must_use]
    pub fn page_flags(&self, va: VirtualAddress) -> Option<MemoryFlags> {
        if !va.is_canonical() {
            return None;
        }
        let entry = self.leaf(va.page_base()).ok()?;
        entry.present().then(|| entry.flags())
    }

    /// Replaces the protection of a present page and returns the old flags.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] when the page is not present.
    pub fn set_page_flags(
        &self,
        va: VirtualAddress,
        flags: MemoryFlags,
    ) -> Result<MemoryFlags, MapError> {
        Self::check(va)?;
        let entry = self.leaf(va)?;
        if !entry.present() {
            return Err(MapError::NotMapped(va));
        }
        let old = entry.flags();
        *entry = entry.with_protection(flags);
        Ok(old)
    }

    /// Copies the kernel-half PML4 slots from `other`.
    ///
    /// Both spaces then share the same kernel page tables below the root.
    pub fn share_kernel_half(&self, other: &AddressSpace<'_, M>) {
        let src = other.table(other.root);
        let dst = self.table(self.root);
        for i in KERNEL_HALF_FIRST_SLOT..512 {
            dst[i] = src[i];
        }
    }

    /// Frees every table of the user (lower) half and the root itself.
    ///
    /// Leaf frames are not touched; unmap them first. Returns the number of
    /// frames given back.
    pub fn release_tables<A: FrameAlloc>(self, alloc: &mut A) -> usize {
        let mut released = 0;
        let root = self.table(self.root);
        for i in 0..KERNEL_HALF_FIRST_SLOT {
            if root[i].present() {
                released += self.release_subtree(alloc, root[i].physical_address(), 3);
                root[i] = PageTableEntry::EMPTY;
            }
        }
        alloc.free_4k(self.root);
        released + 1
    }

    fn release_subtree<A: FrameAlloc>(&self, alloc: &mut A, table: PhysicalAddress, level: u8) -> usize {
        let mut released = 0;
        if level > 1 {
            let entries = self.table(table);
            for i in 0..512 {
                let e = entries[i];
                if e.present() && !e.huge_page() {
                    released += self.release_subtree(alloc, e.physical_address(), level - 1);
                }
            }
        }
        alloc.free_4k(table);
        released + 1
    }

    /// Links an empty PDPT into every missing PML4 slot covering
    /// `start..end`, so spaces sharing the root slots see later mappings.
    ///
    /// Returns the number of tables created.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if `alloc` runs dry; tables linked so far stay.
    pub fn link_top_level<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<usize, MapError> {
        if end <= start {
            return Ok(0);
        }
        let first = start.table_indices()[0];
        let last = VirtualAddress::new(end.as_u64() - 1).table_indices()[0];
        let root = self.table(self.root);
        let mut created = 0;
        for i in first..=last {
            if root[i].present() {
                continue;
            }
            let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
            self.table(frame).zero();
            root[i] = PageTableEntry::table(frame);
            created += 1;
        }
        Ok(created)
    }
}
