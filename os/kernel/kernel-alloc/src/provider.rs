//! Backing stores for object pools.

use crate::{ObjectAllocError, PoolBlock, PoolGeometry};
use core::ptr::NonNull;
use kernel_info::memory::PAGE_SIZE;

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = PAGE_SIZE as usize;

/// Supplies, grows and takes back the memory behind object pools.
///
/// Blocks must be aligned to at least the page size.
pub trait PoolProvider {
    /// A block holding the pool header and at least `min_objects` slots.
    ///
    /// # Errors
    /// When the backing store is exhausted.
    fn acquire_pool(
        &self,
        geometry: PoolGeometry,
        min_objects: usize,
    ) -> Result<PoolBlock, ObjectAllocError>;

    /// Grows `pool` in place by at least `min_extra` slots.
    ///
    /// # Errors
    /// When the block cannot grow where it is; the allocator then acquires a
    /// fresh pool instead.
    fn enlarge_pool(
        &self,
        geometry: PoolGeometry,
        min_extra: usize,
        pool: PoolBlock,
    ) -> Result<PoolBlock, ObjectAllocError>;

    /// Returns a block previously handed out.
    ///
    /// # Errors
    /// When the backing store refuses to take it back.
    fn release_pool(&self, geometry: PoolGeometry, pool: PoolBlock)
    -> Result<(), ObjectAllocError>;
}

impl<P: PoolProvider + ?Sized> PoolProvider for &P {
    fn acquire_pool(&self, g: PoolGeometry, min: usize) -> Result<PoolBlock, ObjectAllocError> {
        (**self).acquire_pool(g, min)
    }

    fn enlarge_pool(
        &self,
        g: PoolGeometry,
        min_extra: usize,
        pool: PoolBlock,
    ) -> Result<PoolBlock, ObjectAllocError> {
        (**self).enlarge_pool(g, min_extra, pool)
    }

    fn release_pool(&self, g: PoolGeometry, pool: PoolBlock) -> Result<(), ObjectAllocError> {
        (**self).release_pool(g, pool)
    }
}

/// Committed, writable pages; in the kernel this is the heap part of the
/// memory manager.
pub trait PageSource {
    /// Commits `pages` pages, exactly at `at` when given.
    ///
    /// # Errors
    /// When no frames or no address space are left, or `at` is taken.
    fn allocate_pages(
        &self,
        pages: usize,
        at: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, ObjectAllocError>;

    /// # Errors
    /// When the range was not allocated by this source.
    fn free_pages(&self, base: NonNull<u8>, pages: usize) -> Result<(), ObjectAllocError>;
}

impl<S: PageSource + ?Sized> PageSource for &S {
    fn allocate_pages(
        &self,
        pages: usize,
        at: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, ObjectAllocError> {
        (**self).allocate_pages(pages, at)
    }

    fn free_pages(&self, base: NonNull<u8>, pages: usize) -> Result<(), ObjectAllocError> {
        (**self).free_pages(base, pages)
    }
}

/// Pools made of whole pages from a [`PageSource`].
pub struct PagePoolProvider<S> {
    source: S,
}

impl<S: PageSource> PagePoolProvider<S> {
    pub const fn new(source: S) -> Self {
        Self { source }
    }

    pub const fn source(&self) -> &S {
        &self.source
    }
}

impl<S: PageSource> PoolProvider for PagePoolProvider<S> {
    fn acquire_pool(&self, g: PoolGeometry, min: usize) -> Result<PoolBlock, ObjectAllocError> {
        let pages = g.pages_for(min.max(1));
        let base = self.source.allocate_pages(pages, None)?;
        Ok(PoolBlock {
            base,
            bytes: pages * PAGE,
        })
    }

    fn enlarge_pool(
        &self,
        g: PoolGeometry,
        min_extra: usize,
        pool: PoolBlock,
    ) -> Result<PoolBlock, ObjectAllocError> {
        let old_pages = pool.bytes / PAGE;
        let capacity = g.objects_in(pool.bytes);
        let new_pages = g.pages_for(capacity + min_extra.max(1)).max(old_pages + 1);
        let extra = new_pages - old_pages;

        let at = NonNull::new(pool.base.as_ptr().wrapping_add(pool.bytes))
            .ok_or(ObjectAllocError::OutOfAddressSpace)?;
        let got = self.source.allocate_pages(extra, Some(at))?;
        if got != at {
            // Not contiguous; the pool cannot use it.
            self.source.free_pages(got, extra)?;
            return Err(ObjectAllocError::Misplaced);
        }

        Ok(PoolBlock {
            base: pool.base,
            bytes: new_pages * PAGE,
        })
    }

    fn release_pool(&self, _g: PoolGeometry, pool: PoolBlock) -> Result<(), ObjectAllocError> {
        self.source.free_pages(pool.base, pool.bytes / PAGE)
    }
}

/// Pools from the global allocator. Cannot grow pools in place.
#[cfg(not(target_os = "none"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapPoolProvider;

#[cfg(not(target_os = "none"))]
impl HeapPoolProvider {
    fn layout(bytes: usize) -> Result<core::alloc::Layout, ObjectAllocError> {
        core::alloc::Layout::from_size_align(bytes, PAGE).map_err(|_| ObjectAllocError::OutOfMemory)
    }
}

#[cfg(not(target_os = "none"))]
impl PoolProvider for HeapPoolProvider {
    fn acquire_pool(&self, g: PoolGeometry, min: usize) -> Result<PoolBlock, ObjectAllocError> {
        let bytes = g.pages_for(min.max(1)) * PAGE;
        let layout = Self::layout(bytes)?;
        let base = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })
            .ok_or(ObjectAllocError::OutOfMemory)?;
        Ok(PoolBlock { base, bytes })
    }

    fn enlarge_pool(
        &self,
        _g: PoolGeometry,
        _min_extra: usize,
        _pool: PoolBlock,
    ) -> Result<PoolBlock, ObjectAllocError> {
        Err(ObjectAllocError::EnlargeUnsupported)
    }

    fn release_pool(&self, _g: PoolGeometry, pool: PoolBlock) -> Result<(), ObjectAllocError> {
        let layout = Self::layout(pool.bytes)?;
        unsafe { alloc::alloc::dealloc(pool.base.as_ptr(), layout) };
        Ok(())
    }
}
