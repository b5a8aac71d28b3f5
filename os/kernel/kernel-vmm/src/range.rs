use core::ops::{BitAnd, BitOr};
use kernel_vmem::{PAGE_SIZE, VirtualAddress};

/// Half-open span of virtual addresses, `start..end`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl MemoryRange {
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self { start, end }
    }

    #[inline]
    #[must_use]
    pub const fn from_pages(start: VirtualAddress, pages: usize) -> Self {
        Self {
            start,
            end: VirtualAddress::new(start.as_u64() + pages as u64 * PAGE_SIZE),
        }
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn page_count(&self) -> usize {
        (self.size() / PAGE_SIZE) as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end.as_u64() <= self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(&self) -> bool {
        self.start.is_page_aligned() && self.end.is_page_aligned()
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn covers(&self, other: &Self) -> bool {
        other.start.as_u64() >= self.start.as_u64() && other.end.as_u64() <= self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    /// Start of every page in the range.
    pub fn pages(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let start = self.start.as_u64();
        (0..self.page_count() as u64).map(move |i| VirtualAddress::new(start + i * PAGE_SIZE))
    }
}

/// Overlap of two ranges, if any.
impl BitAnd for MemoryRange {
    type Output = Option<Self>;

    fn bitand(self, other: Self) -> Option<Self> {
        self.intersects(&other).then(|| Self {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }
}

/// Smallest range covering both, if they overlap or touch.
impl BitOr for MemoryRange {
    type Output = Option<Self>;

    fn bitor(self, other: Self) -> Option<Self> {
        if self.end < other.start || other.end < self.start {
            return None;
        }
        Some(Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        })
    }
}

impl core::fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(a: u64, b: u64) -> MemoryRange {
        MemoryRange::new(VirtualAddress::new(a), VirtualAddress::new(b))
    }

    #[test]
    fn intersection_and_union() {
        assert_eq!(r(0x1000, 0x4000) & r(0x3000, 0x6000), Some(r(0x3000, 0x4000)));
        assert_eq!(r(0x1000, 0x3000) & r(0x3000, 0x6000), None);
        assert_eq!(r(0x1000, 0x3000) | r(0x3000, 0x6000), Some(r(0x1000, 0x6000)));
        assert_eq!(r(0x1000, 0x2000) | r(0x3000, 0x6000), None);
    }

    #[test]
    fn pages_and_containment() {
        let range = MemoryRange::from_pages(VirtualAddress::new(0x40_0000), 3);
        assert_eq!(range.size(), 0x3000);
        assert!(range.contains(VirtualAddress::new(0x40_2fff)));
        assert!(!range.contains(range.end));
        assert_eq!(range.pages().last(), Some(VirtualAddress::new(0x40_2000)));
        assert!(range.covers(&r(0x40_1000, 0x40_3000)));
    }
}
