//! # Boot information table
//!
//! The loader's info table is a packed little-endian root record followed by
//! five sub-tables (CPUs, IOAPICs, memory map, modules, strings) addressed by
//! byte offsets from the start of the root. Everything is validated up front
//! in [`InfoTable::parse`]; the accessors afterwards cannot fail.

use bitflags::bitflags;

/// `"YHDR"` read as a little-endian `u32`.
pub const INFO_MAGIC: u32 = 0x5244_5948;

/// Physical address at which the loader places the table.
pub const INFO_TABLE_PADDR: u64 = 0x0014_C000;

/// Number of legacy ISA IRQ lines described in the root.
pub const ISA_IRQ_COUNT: usize = 16;

/// Packed size of the root record.
pub const ROOT_SIZE: usize = 158;
/// Packed size of one CPU entry.
pub const CPU_ENTRY_SIZE: usize = 18;
/// Packed size of one IOAPIC entry.
pub const IOAPIC_ENTRY_SIZE: usize = 16;
/// Packed size of one memory map entry.
pub const MMAP_ENTRY_SIZE: usize = 32;
/// Packed size of one module entry.
pub const MODULE_ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BootInfoError {
    #[error("info table truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("bad info table magic {0:#010x}")]
    BadMagic(u32),
    #[error("{table} table at {offset:#x} (+{size:#x}) exceeds table length {length:#x}")]
    TableOutOfBounds {
        table: &'static str,
        offset: usize,
        size: usize,
        length: usize,
    },
    #[error("string at offset {0:#x} is unterminated or not UTF-8")]
    BadString(usize),
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RootFlags: u32 {
        /// Legacy 8259 PICs are present.
        const PCAT_COMPAT = 1 << 0;
        const X2APIC = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFlags: u16 {
        const PRESENT = 1 << 0;
        const BSP = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqFlags: u8 {
        const ACTIVE_LOW = 1 << 0;
        const LEVEL = 1 << 1;
    }
}

/// The root record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoRoot {
    pub flags: RootFlags,
    /// Length of the whole info table in bytes.
    pub length: u16,
    pub lapic_paddr: u64,
    pub rsdp_paddr: u64,
    pub idt_paddr: u64,
    pub gdt_paddr: u64,
    pub tss_paddr: u64,
    /// First physical byte the kernel may freely use.
    pub free_paddr: u64,
    /// ISA IRQ number to GSI.
    pub irq_gsi: [u32; ISA_IRQ_COUNT],
    pub irq_flags: [IrqFlags; ISA_IRQ_COUNT],
    pub cpu_offset: u16,
    pub ioapic_offset: u16,
    pub mmap_offset: u16,
    pub module_offset: u16,
    pub string_offset: u16,
    pub cpu_count_active: u16,
    pub cpu_count: u16,
    pub ioapic_count: u16,
    pub mmap_count: u16,
    pub module_count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuEntry {
    pub apic_id: u32,
    pub acpi_id: u32,
    pub flags: CpuFlags,
    /// LAPIC timer ticks per second.
    pub lapic_timer_freq: u32,
    /// NUMA domain.
    pub domain: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicEntry {
    pub apic_id: u8,
    pub version: u8,
    pub gsi_base: u32,
    pub gsi_count: u16,
    pub mmio_paddr: u64,
}

impl IoApicEntry {
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn covers(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi - self.gsi_base < self.gsi_count as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub address: u64,
    pub length: u64,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleEntry<'a> {
    pub name: &'a str,
    pub address: u64,
    pub length: u32,
}

/// Little-endian reads over a bounds-checked window.
#[derive(Clone, Copy)]
struct Bytes<'a>(&'a [u8]);

impl<'a> Bytes<'a> {
    fn array<const N: usize>(self, at: usize) -> Result<[u8; N], BootInfoError> {
        self.0
            .get(at..at + N)
            .and_then(|s| s.try_into().ok())
            .ok_or(BootInfoError::Truncated {
                needed: at + N,
                available: self.0.len(),
            })
    }

    fn u8(self, at: usize) -> Result<u8, BootInfoError> {
        Ok(self.array::<1>(at)?[0])
    }

    fn u16(self, at: usize) -> Result<u16, BootInfoError> {
        self.array(at).map(u16::from_le_bytes)
    }

    fn u32(self, at: usize) -> Result<u32, BootInfoError> {
        self.array(at).map(u32::from_le_bytes)
    }

    fn u64(self, at: usize) -> Result<u64, BootInfoError> {
        self.array(at).map(u64::from_le_bytes)
    }

    fn c_str(self, at: usize) -> Result<&'a str, BootInfoError> {
        let tail = self.0.get(at..).ok_or(BootInfoError::BadString(at))?;
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(BootInfoError::BadString(at))?;
        core::str::from_utf8(&tail[..len]).map_err(|_| BootInfoError::BadString(at))
    }
}

impl InfoRoot {
    fn read(b: Bytes<'_>) -> Result<Self, BootInfoError> {
        let mut irq_gsi = [0; ISA_IRQ_COUNT];
        let mut irq_flags = [IrqFlags::empty(); ISA_IRQ_COUNT];
        for i in 0..ISA_IRQ_COUNT {
            irq_gsi[i] = b.u32(58 + 4 * i)?;
            irq_flags[i] = IrqFlags::from_bits_retain(b.u8(122 + i)?);
        }

        Ok(Self {
            flags: RootFlags::from_bits_retain(b.u32(4)?),
            length: b.u16(8)?,
            lapic_paddr: b.u64(10)?,
            rsdp_paddr: b.u64(18)?,
            idt_paddr: b.u64(26)?,
            gdt_paddr: b.u64(34)?,
            tss_paddr: b.u64(42)?,
            free_paddr: b.u64(50)?,
            irq_gsi,
            irq_flags,
            cpu_offset: b.u16(138)?,
            ioapic_offset: b.u16(140)?,
            mmap_offset: b.u16(142)?,
            module_offset: b.u16(144)?,
            string_offset: b.u16(146)?,
            cpu_count_active: b.u16(148)?,
            cpu_count: b.u16(150)?,
            ioapic_count: b.u16(152)?,
            mmap_count: b.u16(154)?,
            module_count: b.u16(156)?,
        })
    }
}

/// A validated view of the loader's info table.
#[derive(Debug, Clone, Copy)]
pub struct InfoTable<'a> {
    bytes: &'a [u8],
    root: InfoRoot,
}

impl<'a> InfoTable<'a> {
    /// Validates and wraps the table.
    ///
    /// # Errors
    /// * [`BootInfoError::Truncated`] if the buffer is shorter than the root
    ///   or than the length the root declares,
    /// * [`BootInfoError::BadMagic`] if the magic does not match,
    /// * [`BootInfoError::TableOutOfBounds`] if any sub-table runs past the
    ///   declared length,
    /// * [`BootInfoError::BadString`] if a module name is not a terminated
    ///   UTF-8 string inside the table.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, BootInfoError> {
        if bytes.len() < ROOT_SIZE {
            return Err(BootInfoError::Truncated {
                needed: ROOT_SIZE,
                available: bytes.len(),
            });
        }

        let magic = Bytes(bytes).u32(0)?;
        if magic != INFO_MAGIC {
            return Err(BootInfoError::BadMagic(magic));
        }

        let root = InfoRoot::read(Bytes(bytes))?;
        let length = usize::from(root.length);
        if length < ROOT_SIZE || length > bytes.len() {
            return Err(BootInfoError::Truncated {
                needed: length.max(ROOT_SIZE),
                available: bytes.len(),
            });
        }

        let table = Self {
            bytes: &bytes[..length],
            root,
        };

        table.check_bounds("cpu", root.cpu_offset, root.cpu_count, CPU_ENTRY_SIZE)?;
        table.check_bounds("ioapic", root.ioapic_offset, root.ioapic_count, IOAPIC_ENTRY_SIZE)?;
        table.check_bounds("mmap", root.mmap_offset, root.mmap_count, MMAP_ENTRY_SIZE)?;
        table.check_bounds("module", root.module_offset, root.module_count, MODULE_ENTRY_SIZE)?;

        for i in 0..usize::from(root.module_count) {
            table.read_module(i)?;
        }

        Ok(table)
    }

    fn check_bounds(
        &self,
        table: &'static str,
        offset: u16,
        count: u16,
        entry: usize,
    ) -> Result<(), BootInfoError> {
        let offset = usize::from(offset);
        let size = usize::from(count) * entry;
        if offset + size > self.bytes.len() {
            return Err(BootInfoError::TableOutOfBounds {
                table,
                offset,
                size,
                length: self.bytes.len(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn root(&self) -> &InfoRoot {
        &self.root
    }

    #[must_use]
    pub const fn flags(&self) -> RootFlags {
        self.root.flags
    }

    fn entry_at(&self, offset: u16, entry: usize, i: usize) -> Bytes<'a> {
        let start = usize::from(offset) + i * entry;
        Bytes(&self.bytes[start..start + entry])
    }

    fn read_cpu(&self, i: usize) -> Result<CpuEntry, BootInfoError> {
        let b = self.entry_at(self.root.cpu_offset, CPU_ENTRY_SIZE, i);
        Ok(CpuEntry {
            apic_id: b.u32(0)?,
            acpi_id: b.u32(4)?,
            flags: CpuFlags::from_bits_retain(b.u16(8)?),
            lapic_timer_freq: b.u32(10)?,
            domain: b.u32(14)?,
        })
    }

    fn read_ioapic(&self, i: usize) -> Result<IoApicEntry, BootInfoError> {
        let b = self.entry_at(self.root.ioapic_offset, IOAPIC_ENTRY_SIZE, i);
        Ok(IoApicEntry {
            apic_id: b.u8(0)?,
            version: b.u8(1)?,
            gsi_base: b.u32(2)?,
            gsi_count: b.u16(6)?,
            mmio_paddr: b.u64(8)?,
        })
    }

    fn read_mmap(&self, i: usize) -> Result<MemoryMapEntry, BootInfoError> {
        let b = self.entry_at(self.root.mmap_offset, MMAP_ENTRY_SIZE, i);
        Ok(MemoryMapEntry {
            address: b.u64(0)?,
            length: b.u64(8)?,
            available: b.u64(16)? == 1,
        })
    }

    fn read_module(&self, i: usize) -> Result<ModuleEntry<'a>, BootInfoError> {
        let b = self.entry_at(self.root.module_offset, MODULE_ENTRY_SIZE, i);
        let name_at = usize::from(self.root.string_offset) + usize::from(b.u16(0)?);
        Ok(ModuleEntry {
            name: Bytes(self.bytes).c_str(name_at)?,
            address: b.u64(2)?,
            length: b.u32(10)?,
        })
    }

    /// All CPU entries, present or not.
    pub fn cpus(&self) -> impl Iterator<Item = CpuEntry> + '_ {
        (0..usize::from(self.root.cpu_count)).filter_map(|i| self.read_cpu(i).ok())
    }

    pub fn ioapics(&self) -> impl Iterator<Item = IoApicEntry> + '_ {
        (0..usize::from(self.root.ioapic_count)).filter_map(|i| self.read_ioapic(i).ok())
    }

    pub fn memory_map(&self) -> impl Iterator<Item = MemoryMapEntry> + '_ {
        (0..usize::from(self.root.mmap_count)).filter_map(|i| self.read_mmap(i).ok())
    }

    pub fn modules(&self) -> impl Iterator<Item = ModuleEntry<'a>> + '_ {
        (0..usize::from(self.root.module_count)).filter_map(|i| self.read_module(i).ok())
    }

    /// The bootstrap processor, if the loader flagged one.
    #[must_use]
    pub fn bsp(&self) -> Option<CpuEntry> {
        self.cpus().find(|c| c.flags.contains(CpuFlags::BSP))
    }

    /// The IOAPIC whose GSI window contains `gsi`.
    #[must_use]
    pub fn ioapic_for_gsi(&self, gsi: u32) -> Option<IoApicEntry> {
        self.ioapics().find(|io| io.covers(gsi))
    }

    /// The ISA IRQ routed to `gsi`, if any.
    #[must_use]
    pub fn irq_for_gsi(&self, gsi: u32) -> Option<usize> {
        self.root.irq_gsi.iter().position(|&g| g == gsi)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TableBuilder;
    use super::*;

    fn sample() -> Vec<u8> {
        TableBuilder {
            flags: (RootFlags::PCAT_COMPAT | RootFlags::X2APIC).bits(),
            cpus: vec![(0, 0b11, 1_000_000), (1, 0b01, 1_000_000), (2, 0, 0)],
            ioapics: vec![(4, 0, 24, 0xFEC0_0000)],
            mmap: vec![(0, 0x9_F000, true), (0x10_0000, 0x7F0_0000, true), (0xF000_0000, 0x1000, false)],
            modules: vec![("init", 0x20_0000, 0x4000), ("shell", 0x30_0000, 0x1800)],
            ..TableBuilder::default()
        }
        .build()
    }

    #[test]
    fn parses_all_tables() {
        let bytes = sample();
        let table = InfoTable::parse(&bytes).unwrap();

        assert!(table.flags().contains(RootFlags::X2APIC));
        assert_eq!(table.root().lapic_paddr, 0xFEE0_0000);
        assert_eq!(table.root().free_paddr, 0x40_0000);

        let cpus: Vec<_> = table.cpus().collect();
        assert_eq!(cpus.len(), 3);
        assert_eq!(cpus[1].acpi_id, 101);
        assert_eq!(table.bsp().map(|c| c.apic_id), Some(0));

        assert_eq!(table.ioapic_for_gsi(23).map(|io| io.apic_id), Some(4));
        assert!(table.ioapic_for_gsi(24).is_none());

        let avail: u64 = table.memory_map().filter(|m| m.available).map(|m| m.length).sum();
        assert_eq!(avail, 0x9_F000 + 0x7F0_0000);

        let names: Vec<_> = table.modules().map(|m| m.name).collect();
        assert_eq!(names, ["init", "shell"]);
        assert_eq!(table.irq_for_gsi(9), Some(9));
        assert_eq!(table.irq_for_gsi(40), None);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample();
        bytes[0] ^= 0xFF;
        assert!(matches!(InfoTable::parse(&bytes), Err(BootInfoError::BadMagic(_))));
    }

    #[test]
    fn rejects_short_buffers() {
        let bytes = sample();
        assert!(matches!(
            InfoTable::parse(&bytes[..ROOT_SIZE - 1]),
            Err(BootInfoError::Truncated { .. })
        ));
        assert!(matches!(
            InfoTable::parse(&bytes[..bytes.len() - 1]),
            Err(BootInfoError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_tables_past_the_end() {
        let mut bytes = sample();
        // mmap_count
        bytes[154..156].copy_from_slice(&200u16.to_le_bytes());
        assert_eq!(
            InfoTable::parse(&bytes).unwrap_err(),
            BootInfoError::TableOutOfBounds {
                table: "mmap",
                offset: ROOT_SIZE + 3 * CPU_ENTRY_SIZE + IOAPIC_ENTRY_SIZE,
                size: 200 * MMAP_ENTRY_SIZE,
                length: bytes.len(),
            }
        );
    }

    #[test]
    fn rejects_unterminated_module_name() {
        let mut bytes = sample();
        let last = bytes.len() - 1;
        bytes[last] = b'x';
        assert!(matches!(InfoTable::parse(&bytes), Err(BootInfoError::BadString(_))));
    }
}
