use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use kernel_info::memory::PAGE_SIZE;

/// Index of a slot within one pool.
pub type ObjectIndex = u32;

/// "No such slot"; ends a free list.
pub const OBJ_IND_INVALID: ObjectIndex = 0xFFFF_FFFF;

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = PAGE_SIZE as usize;

/// Slot and header sizes shared by every pool of one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub object_size: usize,
    pub header_size: usize,
}

impl PoolGeometry {
    /// Pages needed for a pool holding at least `objects` slots.
    #[must_use]
    pub const fn pages_for(self, objects: usize) -> usize {
        (self.object_size * objects + self.header_size).div_ceil(PAGE)
    }

    /// Slots that fit into a block of `bytes`.
    #[must_use]
    pub const fn objects_in(self, bytes: usize) -> usize {
        if bytes <= self.header_size {
            return 0;
        }
        let n = (bytes - self.header_size) / self.object_size;
        if n >= OBJ_IND_INVALID as usize {
            OBJ_IND_INVALID as usize - 1
        } else {
            n
        }
    }
}

/// A contiguous block of memory handed out by a pool provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBlock {
    pub base: NonNull<u8>,
    pub bytes: usize,
}

struct FreeList {
    first: ObjectIndex,
    last: ObjectIndex,
}

/// Pool header, placed at the start of its own block.
#[repr(C)]
pub(crate) struct ObjectPool<L> {
    pub(crate) lock: L,
    free_count: AtomicU32,
    capacity: AtomicU32,
    bytes: AtomicUsize,
    list: UnsafeCell<FreeList>,
    pub(crate) next: AtomicPtr<ObjectPool<L>>,
}

impl<L: Default> ObjectPool<L> {
    /// Writes a header into `block` and threads every slot onto the free list.
    ///
    /// Returns `None` if not a single slot fits.
    ///
    /// # Safety
    /// `block` must be writable, exclusively owned and aligned for `Self`
    /// and for the slots.
    pub(crate) unsafe fn format(block: PoolBlock, g: PoolGeometry) -> Option<NonNull<Self>> {
        let capacity = g.objects_in(block.bytes);
        if capacity == 0 {
            return None;
        }
        let pool = block.base.cast::<Self>();
        unsafe {
            ptr::write(
                pool.as_ptr(),
                Self {
                    lock: L::default(),
                    free_count: AtomicU32::new(0),
                    capacity: AtomicU32::new(0),
                    bytes: AtomicUsize::new(block.bytes),
                    list: UnsafeCell::new(FreeList {
                        first: OBJ_IND_INVALID,
                        last: OBJ_IND_INVALID,
                    }),
                    next: AtomicPtr::new(ptr::null_mut()),
                },
            );
            pool.as_ref().thread_slots(g, 0, capacity);
        }
        Some(pool)
    }
}

impl<L> ObjectPool<L> {
    #[inline]
    pub(crate) fn free_count(&self) -> u32 {
        self.free_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    pub(crate) fn block(&self) -> PoolBlock {
        PoolBlock {
            base: NonNull::from(self).cast(),
            bytes: self.bytes.load(Ordering::Acquire),
        }
    }

    #[inline]
    fn slot(&self, g: PoolGeometry, index: ObjectIndex) -> *mut u8 {
        let base = ptr::from_ref(self).cast::<u8>().cast_mut();
        base.wrapping_add(g.header_size + index as usize * g.object_size)
    }

    /// Slot index of `addr`, if it is the start of one of this pool's slots.
    pub(crate) fn index_of(&self, g: PoolGeometry, addr: usize) -> Option<ObjectIndex> {
        let start = ptr::from_ref(self) as usize + g.header_size;
        let offset = addr.checked_sub(start)?;
        if offset % g.object_size != 0 {
            return None;
        }
        let index = offset / g.object_size;
        #[allow(clippy::cast_possible_truncation)]
        (index < self.capacity() as usize).then_some(index as ObjectIndex)
    }

    /// Appends slots `from..to` to the free list.
    ///
    /// # Safety
    /// Caller holds the pool lock (or owns the pool exclusively) and the
    /// slots lie within the block.
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn thread_slots(&self, g: PoolGeometry, from: usize, to: usize) {
        let list = unsafe { &mut *self.list.get() };
        for i in from..to {
            let i = i as ObjectIndex;
            let next = if i as usize + 1 == to { OBJ_IND_INVALID } else { i + 1 };
            unsafe { self.slot(g, i).cast::<ObjectIndex>().write(next) };
        }
        if list.last == OBJ_IND_INVALID {
            list.first = from as ObjectIndex;
        } else {
            unsafe { self.slot(g, list.last).cast::<ObjectIndex>().write(from as ObjectIndex) };
        }
        list.last = (to - 1) as ObjectIndex;
        self.capacity.store(to as u32, Ordering::Release);
        self.free_count
            .fetch_add((to - from) as u32, Ordering::AcqRel);
    }

    /// Takes the head of the free list.
    ///
    /// # Safety
    /// Caller holds the pool lock.
    pub(crate) unsafe fn pop(&self, g: PoolGeometry) -> Option<NonNull<u8>> {
        let list = unsafe { &mut *self.list.get() };
        if list.first == OBJ_IND_INVALID {
            return None;
        }
        let slot = self.slot(g, list.first);
        let next = unsafe { slot.cast::<ObjectIndex>().read() };
        list.first = next;
        if next == OBJ_IND_INVALID {
            list.last = OBJ_IND_INVALID;
        }
        self.free_count.fetch_sub(1, Ordering::AcqRel);
        NonNull::new(slot)
    }

    /// Puts slot `index` back at the head of the free list.
    ///
    /// # Safety
    /// Caller holds the pool lock and `index` is a live slot of this pool.
    pub(crate) unsafe fn push(&self, g: PoolGeometry, index: ObjectIndex) {
        let list = unsafe { &mut *self.list.get() };
        unsafe { self.slot(g, index).cast::<ObjectIndex>().write(list.first) };
        list.first = index;
        if list.last == OBJ_IND_INVALID {
            list.last = index;
        }
        self.free_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Adopts a larger block with the same base; returns the slots added.
    ///
    /// # Safety
    /// Caller holds the pool lock and the block really grew in place.
    pub(crate) unsafe fn extend(&self, g: PoolGeometry, bytes: usize) -> usize {
        let old = self.capacity() as usize;
        let new = g.objects_in(bytes);
        self.bytes.store(bytes, Ordering::Release);
        if new <= old {
            return 0;
        }
        unsafe { self.thread_slots(g, old, new) };
        new - old
    }
}
