//! Allocation options, region content tags and check/fault bit sets.

use bitflags::bitflags;

bitflags! {
    /// How an allocation is placed, backed and protected.
    ///
    /// The kernel heap and reserve-only strategy are the zero values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryAllocationOptions: u32 {
        /// The pages are never given back.
        const PERMANENT = 0x1;
        const GUARD_HIGH = 0x2;
        const GUARD_LOW = 0x4;
        const GUARD_FULL = Self::GUARD_LOW.bits() | Self::GUARD_HIGH.bits();

        /// Pages managed internally by the kernel.
        const USED = 0x40;
        /// Backed by frames right away.
        const COMMIT = 0x80;
        /// Backed by frames on first touch.
        const ALLOCATE_ON_DEMAND = 0xC0;

        /// Placed in the userland window of the process.
        const VIRTUAL_USER = 0x8000_0000;
    }
}

/// Backing strategy, bits `0xF0` of [`MemoryAllocationOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    Reserve,
    Used,
    Commit,
    AllocateOnDemand,
}

impl MemoryAllocationOptions {
    pub const STRATEGY_MASK: u32 = 0xF0;
    pub const UNIQUENESS_MASK: u32 = 0x0F;

    #[must_use]
    pub const fn strategy(self) -> AllocationStrategy {
        match self.bits() & Self::STRATEGY_MASK {
            0x40 => AllocationStrategy::Used,
            0x80 => AllocationStrategy::Commit,
            0xC0 => AllocationStrategy::AllocateOnDemand,
            _ => AllocationStrategy::Reserve,
        }
    }

    #[inline]
    #[must_use]
    pub const fn guard_pages(self) -> (usize, usize) {
        (
            self.contains(Self::GUARD_LOW) as usize,
            self.contains(Self::GUARD_HIGH) as usize,
        )
    }
}

/// What a region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryContent {
    #[default]
    Free,
    Generic,
    ThreadStack,
    KernelModule,
    Share,
    Runtime,
}

bitflags! {
    /// Requirements for [`check_memory_region`](crate::Vmm::check_memory_region).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryCheckType: u32 {
        const WRITABLE = 0x1;
        const USERLAND = 0x2;
        /// Free regions inside the range are acceptable.
        const FREE = 0x4;
        /// Shared and runtime regions are not acceptable.
        const PRIVATE = 0x8;
    }
}

bitflags! {
    /// Access that caused a page fault, as reported by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFaultFlags: u32 {
        const PRESENT = 0x01;
        const WRITE = 0x02;
        const USERLAND = 0x04;
        const RESERVED = 0x08;
        const EXECUTE = 0x10;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_is_decoded_from_the_high_nibble() {
        type O = MemoryAllocationOptions;
        assert_eq!(O::empty().strategy(), AllocationStrategy::Reserve);
        assert_eq!((O::COMMIT | O::GUARD_FULL).strategy(), AllocationStrategy::Commit);
        assert_eq!(O::ALLOCATE_ON_DEMAND.strategy(), AllocationStrategy::AllocateOnDemand);
        assert_eq!((O::USED | O::VIRTUAL_USER).strategy(), AllocationStrategy::Used);
        assert_eq!(O::GUARD_LOW.guard_pages(), (1, 0));
        assert_eq!(O::GUARD_FULL.guard_pages(), (1, 1));
    }
}
