//! Pages for the kernel VAS before the kernel VAS exists.
//!
//! Region descriptors live in object pools, and the pools of the kernel
//! VAS cannot come from the kernel heap it describes until it has its
//! first descriptors. They come from a fixed arena instead, handed out
//! bottom-up; only the most recent block can be given back.

use crate::config::BOOTSTRAP_PAGES;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_alloc::{ObjectAllocError, PageSource, PagePoolProvider};
use kernel_info::memory::PAGE_SIZE;

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = PAGE_SIZE as usize;

/// `N` page-aligned pages, usually a `static`.
#[repr(C, align(4096))]
pub struct PageArena<const N: usize> {
    pages: UnsafeCell<[[u8; PAGE]; N]>,
}

// SAFETY: pages are only reached through the `BootstrapPages` handing
// out disjoint blocks.
unsafe impl<const N: usize> Sync for PageArena<N> {}

impl<const N: usize> PageArena<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: UnsafeCell::new([[0; PAGE]; N]),
        }
    }
}

impl<const N: usize> Default for PageArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The arena the kernel VAS starts out on.
pub static BOOTSTRAP_ARENA: PageArena<BOOTSTRAP_PAGES> = PageArena::new();

/// Bump allocator over a [`PageArena`].
pub struct BootstrapPages<'a, const N: usize> {
    arena: &'a PageArena<N>,
    used: AtomicUsize,
}

/// Pool provider for the kernel VAS descriptors.
pub type BootstrapPoolProvider<'a, const N: usize> = PagePoolProvider<BootstrapPages<'a, N>>;

impl<'a, const N: usize> BootstrapPages<'a, N> {
    /// Takes over `arena`; it must not be handed to another allocator.
    pub const fn new(arena: &'a PageArena<N>) -> Self {
        Self {
            arena,
            used: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn used_pages(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn remaining_pages(&self) -> usize {
        N - self.used_pages()
    }

    fn page_ptr(&self, index: usize) -> *mut u8 {
        self.arena.pages.get().cast::<u8>().wrapping_add(index * PAGE)
    }

    fn index_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.page_ptr(0) as usize)?;
        (offset % PAGE == 0 && offset / PAGE <= N).then_some(offset / PAGE)
    }
}

impl<const N: usize> PageSource for BootstrapPages<'_, N> {
    fn allocate_pages(
        &self,
        pages: usize,
        at: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, ObjectAllocError> {
        let wanted = match at {
            Some(ptr) => Some(self.index_of(ptr).ok_or(ObjectAllocError::Misplaced)?),
            None => None,
        };
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            if wanted.is_some_and(|w| w != used) {
                return Err(ObjectAllocError::Misplaced);
            }
            let end = used
                .checked_add(pages)
                .filter(|&end| end <= N)
                .ok_or(ObjectAllocError::OutOfMemory)?;
            match self
                .used
                .compare_exchange(used, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(now) => used = now,
            }
        }
        log::trace!("bootstrap pages {used}..{}", used + pages);
        NonNull::new(self.page_ptr(used)).ok_or(ObjectAllocError::OutOfMemory)
    }

    fn free_pages(&self, base: NonNull<u8>, pages: usize) -> Result<(), ObjectAllocError> {
        let start = self.index_of(base).ok_or(ObjectAllocError::NotOwned)?;
        self.used
            .compare_exchange(start + pages, start, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                log::warn!("bootstrap pages {start}.. are not the most recent block; kept");
                ObjectAllocError::NotOwned
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::{PoolGeometry, PoolProvider};

    #[test]
    fn blocks_are_handed_out_bottom_up() {
        let arena = Box::new(PageArena::<4>::new());
        let pages = BootstrapPages::new(&arena);
        let a = pages.allocate_pages(1, None).unwrap();
        let b = pages.allocate_pages(2, None).unwrap();
        assert_eq!(a.as_ptr() as usize % PAGE, 0);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, PAGE);
        assert_eq!(
            pages.allocate_pages(2, None),
            Err(ObjectAllocError::OutOfMemory)
        );

        assert_eq!(pages.free_pages(a, 1), Err(ObjectAllocError::NotOwned));
        pages.free_pages(b, 2).unwrap();
        assert_eq!(pages.remaining_pages(), 3);
    }

    #[test]
    fn pools_grow_in_place() {
        let arena = Box::new(PageArena::<8>::new());
        let provider = BootstrapPoolProvider::new(BootstrapPages::new(&arena));
        let g = PoolGeometry {
            object_size: 64,
            header_size: 64,
        };
        let pool = provider.acquire_pool(g, 10).unwrap();
        assert_eq!(pool.bytes, PAGE);
        let grown = provider.enlarge_pool(g, 100, pool).unwrap();
        assert_eq!(grown.base, pool.base);
        assert!(grown.bytes > pool.bytes);

        // Something else allocated behind the pool: no more room in place.
        let other = provider.acquire_pool(g, 1).unwrap();
        assert_eq!(
            provider.enlarge_pool(g, 1, grown),
            Err(ObjectAllocError::Misplaced)
        );
        provider.release_pool(g, other).unwrap();
        assert_eq!(provider.source().used_pages(), grown.bytes / PAGE);
    }
}
