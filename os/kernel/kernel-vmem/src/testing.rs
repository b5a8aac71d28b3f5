//! In-memory stand-ins for physical memory, used by tests here and downstream.

use crate::{FrameAlloc, Mmu, PAGE_SIZE, PhysMapper, PhysicalAddress, VirtualAddress};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Physical address of the first fake frame; frame zero stays unused.
pub const PHYS_BASE: u64 = 0x10_0000;

#[repr(C, align(4096))]
pub struct Aligned4K(pub [u8; PAGE_SIZE as usize]);

/// A block of zeroed host memory posing as physical frames.
pub struct TestPhys {
    base: *mut Aligned4K,
    frames: usize,
}

unsafe impl Send for TestPhys {}
unsafe impl Sync for TestPhys {}

impl TestPhys {
    #[must_use]
    pub fn new(frames: usize) -> Self {
        let block: Box<[Aligned4K]> = (0..frames)
            .map(|_| Aligned4K([0; PAGE_SIZE as usize]))
            .collect();
        Self {
            base: Box::into_raw(block).cast(),
            frames,
        }
    }

    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.frames
    }

    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(PHYS_BASE + self.frames as u64 * PAGE_SIZE)
    }

    /// Copies out one byte of fake physical memory.
    #[must_use]
    pub fn read_byte(&self, pa: PhysicalAddress) -> u8 {
        *unsafe { self.phys_to_mut::<u8>(pa) }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let off = pa.as_u64() - PHYS_BASE;
        assert!(
            off + size_of::<T>() as u64 <= self.frames as u64 * PAGE_SIZE,
            "{pa:?} outside fake memory"
        );
        #[allow(clippy::cast_possible_truncation)]
        unsafe {
            &mut *self.base.cast::<u8>().add(off as usize).cast::<T>()
        }
    }
}

impl Drop for TestPhys {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(core::ptr::slice_from_raw_parts_mut(self.base, self.frames)) });
    }
}

/// Bump allocator with a recycle list over a [`TestPhys`].
pub struct TestFrames {
    next: u64,
    end: u64,
    recycled: Vec<PhysicalAddress>,
    outstanding: usize,
}

impl TestFrames {
    #[must_use]
    pub const fn new(phys: &TestPhys) -> Self {
        Self {
            next: PHYS_BASE,
            end: phys.end().as_u64(),
            recycled: Vec::new(),
            outstanding: 0,
        }
    }

    /// Frames handed out and not yet returned.
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl FrameAlloc for TestFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        let pa = if let Some(pa) = self.recycled.pop() {
            pa
        } else if self.next < self.end {
            let pa = PhysicalAddress::new(self.next);
            self.next += PAGE_SIZE;
            pa
        } else {
            return None;
        };
        self.outstanding += 1;
        Some(pa)
    }

    fn free_4k(&mut self, pa: PhysicalAddress) {
        assert!(pa.is_page_aligned());
        self.outstanding -= 1;
        self.recycled.push(pa);
    }
}

/// Records root loads and page invalidations.
#[derive(Default)]
pub struct TestMmu {
    root: AtomicU64,
    invalidations: AtomicUsize,
    last_invalidated: AtomicU64,
}

impl TestMmu {
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_invalidated(&self) -> VirtualAddress {
        VirtualAddress::new(self.last_invalidated.load(Ordering::Relaxed))
    }
}

impl Mmu for TestMmu {
    fn current_root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root.load(Ordering::Relaxed))
    }

    unsafe fn load_root(&self, root: PhysicalAddress) {
        self.root.store(root.as_u64(), Ordering::Relaxed);
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.last_invalidated.store(va.as_u64(), Ordering::Relaxed);
    }
}
