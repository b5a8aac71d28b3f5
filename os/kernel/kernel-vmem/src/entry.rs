use crate::{MemoryFlags, PhysicalAddress};
use bitfield_struct::bitfield;

/// One 64-bit x86-64 paging entry, any level.
///
/// | Bits   | Field           |
/// |--------|-----------------|
/// | 0      | present         |
/// | 1      | writable        |
/// | 2      | user            |
/// | 3      | write-through   |
/// | 4      | cache disable   |
/// | 5      | accessed        |
/// | 6      | dirty           |
/// | 7      | huge page (PS)  |
/// | 8      | global          |
/// | 12..52 | frame number    |
/// | 63     | no-execute      |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge_page: bool,
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    #[bits(40)]
    frame: u64,
    #[bits(11)]
    pub os_high: u16,
    pub no_execute: bool,
}

impl PageTableEntry {
    pub const EMPTY: Self = Self::new();

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame(pa.as_u64() >> 12)
    }

    /// Entry linking to a lower-level table.
    ///
    /// Intermediate levels are maximally permissive; the leaf decides.
    #[inline]
    #[must_use]
    pub const fn table(pa: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_physical_address(pa)
    }

    /// Present leaf mapping `pa` with `flags`.
    #[must_use]
    pub const fn leaf(pa: PhysicalAddress, flags: MemoryFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_physical_address(pa)
            .with_protection(flags)
    }

    /// Replaces the requestable protection bits, keeping address and status.
    #[must_use]
    pub const fn with_protection(self, flags: MemoryFlags) -> Self {
        self.with_writable(flags.contains(MemoryFlags::WRITABLE))
            .with_user(flags.contains(MemoryFlags::USERLAND))
            .with_global(flags.contains(MemoryFlags::GLOBAL))
            .with_no_execute(!flags.contains(MemoryFlags::EXECUTABLE))
    }

    #[must_use]
    pub const fn flags(self) -> MemoryFlags {
        let mut f = MemoryFlags::empty();
        if self.present() {
            f = f.union(MemoryFlags::PRESENT);
        }
        if self.writable() {
            f = f.union(MemoryFlags::WRITABLE);
        }
        if !self.no_execute() {
            f = f.union(MemoryFlags::EXECUTABLE);
        }
        if self.global() {
            f = f.union(MemoryFlags::GLOBAL);
        }
        if self.user() {
            f = f.union(MemoryFlags::USERLAND);
        }
        if self.accessed() {
            f = f.union(MemoryFlags::ACCESSED);
        }
        if self.dirty() {
            f = f.union(MemoryFlags::WRITTEN);
        }
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_encoding() {
        let pa = PhysicalAddress::new(0x0030_0000);
        let e = PageTableEntry::leaf(pa, MemoryFlags::WRITABLE | MemoryFlags::GLOBAL);
        assert_eq!(e.into_bits(), 0x8000_0000_0030_0000 | 0b1_0000_0011);
        assert_eq!(e.physical_address(), pa);
        assert_eq!(
            e.flags(),
            MemoryFlags::PRESENT | MemoryFlags::WRITABLE | MemoryFlags::GLOBAL
        );
    }

    #[test]
    fn protection_change_keeps_frame_and_status() {
        let pa = PhysicalAddress::new(0x7000);
        let e = PageTableEntry::leaf(pa, MemoryFlags::WRITABLE)
            .with_accessed(true)
            .with_protection(MemoryFlags::EXECUTABLE | MemoryFlags::USERLAND);
        assert_eq!(e.physical_address(), pa);
        assert!(e.accessed());
        assert!(!e.writable());
        assert_eq!(
            e.flags(),
            MemoryFlags::PRESENT
                | MemoryFlags::EXECUTABLE
                | MemoryFlags::USERLAND
                | MemoryFlags::ACCESSED
        );
    }
}
