use bitflags::bitflags;

bitflags! {
    /// Protection and status of a mapping, independent of the entry format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXECUTABLE = 1 << 2;
        /// Survives address space switches in the TLB.
        const GLOBAL = 1 << 3;
        const USERLAND = 1 << 4;
        const ACCESSED = 1 << 5;
        /// The CPU wrote to the page (dirty).
        const WRITTEN = 1 << 6;
    }
}

impl MemoryFlags {
    /// The bits a caller may request; the others are reported by hardware.
    pub const REQUESTABLE: Self = Self::WRITABLE
        .union(Self::EXECUTABLE)
        .union(Self::GLOBAL)
        .union(Self::USERLAND);
}
