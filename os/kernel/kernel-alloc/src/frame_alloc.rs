//! Physical frame bitmap.
//!
//! One bit per 4 KiB frame over a fixed window; a set bit means "free".
//! Everything starts out used and is released by seeding from the boot
//! memory map, so firmware holes and the kernel image are never handed out.

use kernel_info::boot::MemoryMapEntry;
use kernel_vmem::{FrameAlloc, PAGE_SIZE, PhysicalAddress, align_down, align_up};

pub struct BitmapFrameAllocator<const WORDS: usize> {
    base: u64,
    free: [u64; WORDS],
    free_frames: usize,
    /// Word to start the next search at.
    cursor: usize,
}

impl<const WORDS: usize> BitmapFrameAllocator<WORDS> {
    pub const FRAMES: usize = WORDS * 64;

    /// A window of `WORDS * 64` frames starting at `base`, all marked used.
    #[must_use]
    pub const fn new(base: PhysicalAddress) -> Self {
        Self {
            base: align_down(base.as_u64(), PAGE_SIZE),
            free: [0; WORDS],
            free_frames: 0,
            cursor: 0,
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base + Self::FRAMES as u64 * PAGE_SIZE)
    }

    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Frame numbers within the window covered by `[start, start + len)`.
    ///
    /// `inward` shrinks to whole frames, otherwise the range grows to them.
    #[allow(clippy::cast_possible_truncation)]
    fn frames(&self, start: u64, len: u64, inward: bool) -> core::ops::Range<usize> {
        let end = start.saturating_add(len);
        let (lo, hi) = if inward {
            (align_up(start, PAGE_SIZE), align_down(end, PAGE_SIZE))
        } else {
            (align_down(start, PAGE_SIZE), align_up(end, PAGE_SIZE))
        };
        let lo = lo.clamp(self.base, self.end().as_u64());
        let hi = hi.clamp(self.base, self.end().as_u64());
        if hi <= lo {
            return 0..0;
        }
        ((lo - self.base) / PAGE_SIZE) as usize..((hi - self.base) / PAGE_SIZE) as usize
    }

    fn set(&mut self, frame: usize, free: bool) -> bool {
        let (word, bit) = (frame / 64, 1u64 << (frame % 64));
        let was = self.free[word] & bit != 0;
        if free {
            self.free[word] |= bit;
        } else {
            self.free[word] &= !bit;
        }
        if was != free {
            if free {
                self.free_frames += 1;
            } else {
                self.free_frames -= 1;
            }
        }
        was != free
    }

    /// Marks the whole frames inside the range free; returns how many changed.
    pub fn add_free_range(&mut self, start: PhysicalAddress, len: u64) -> usize {
        self.frames(start.as_u64(), len, true)
            .filter(|&f| self.set(f, true))
            .count()
    }

    /// Marks every frame touching the range used; returns how many changed.
    pub fn reserve_range(&mut self, start: PhysicalAddress, len: u64) -> usize {
        self.frames(start.as_u64(), len, false)
            .filter(|&f| self.set(f, false))
            .count()
    }

    /// Frees every available memory-map entry within the window.
    pub fn seed_from_memory_map<I>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = MemoryMapEntry>,
    {
        let mut added = 0;
        for e in entries.into_iter().filter(|e| e.available) {
            added += self.add_free_range(PhysicalAddress::new(e.address), e.length);
        }
        log::info!(
            "frame allocator seeded with {added} frames at {:?}..{:?}",
            self.base(),
            self.end()
        );
        added
    }

    #[must_use]
    pub fn is_free(&self, pa: PhysicalAddress) -> bool {
        let Some(frame) = self.frames(pa.page_base().as_u64(), PAGE_SIZE, true).next() else {
            return false;
        };
        self.free[frame / 64] & (1 << (frame % 64)) != 0
    }
}

impl<const WORDS: usize> FrameAlloc for BitmapFrameAllocator<WORDS> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        if self.free_frames == 0 {
            return None;
        }
        for step in 0..WORDS {
            let word = (self.cursor + step) % WORDS;
            let bits = self.free[word];
            if bits != 0 {
                let frame = word * 64 + bits.trailing_zeros() as usize;
                self.set(frame, false);
                self.cursor = word;
                return Some(PhysicalAddress::new(self.base + frame as u64 * PAGE_SIZE));
            }
        }
        None
    }

    fn free_4k(&mut self, pa: PhysicalAddress) {
        let Some(frame) = self.frames(pa.as_u64(), PAGE_SIZE, true).next() else {
            log::warn!("freeing {pa:?} outside the frame window");
            return;
        };
        let changed = self.set(frame, true);
        debug_assert!(changed, "double free of {pa:?}");
        if frame / 64 < self.cursor {
            self.cursor = frame / 64;
        }
    }
}
