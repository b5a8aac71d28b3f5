//! # x86-64 Interrupt Descriptor Table (IDT)
//!
//! 256 gate descriptors with a fluent builder:
//!
//! ```ignore
//! idt[0x80]
//!     .set_handler(stub_address)
//!     .selector(KERNEL_CS)
//!     .dpl(3)                 // reachable from ring 3 via `int 0x80`
//!     .present(true)
//!     .gate_interrupt();      // IF cleared on entry
//!
//! unsafe { idt.load() };
//! ```
//!
//! Every gate points at its vector's stub (see [`StubTable`](crate::StubTable)),
//! never at Rust code directly; handlers are resolved at dispatch time.
//!
//! - **DPL**: lowest privilege that may raise the gate with `int n`.
//! - **IST**: alternate stack slot from the TSS, `0` keeps the current stack.
//! - Interrupt gates clear `IF` on entry, trap gates leave it alone.

use crate::KnownExceptionVector;
use bitfield_struct::bitfield;
use core::mem::size_of;
use core::ops::{Index, IndexMut};

const _: () = assert!(size_of::<IdtEntry>() == 16);
const _: () = assert!(align_of::<Idt>() == 16);

/// Kernel code segment selector installed by the GDT.
pub const KERNEL_CS: u16 = 0x08;

/// IST slot for double faults.
pub const DOUBLE_FAULT_IST: u8 = 1;

/// IST slot for page faults.
pub const PAGE_FAULT_IST: u8 = 2;

const TYPE_INTERRUPT: u8 = 0xE;
const TYPE_TRAP: u8 = 0xF;

/// The middle two bytes of a gate: IST index, then `| P | DPL | S | Type |`.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct IdtGateAttr {
    #[bits(3)]
    pub ist: u8,

    #[bits(5)]
    __zero0: u8,

    /// 0xE interrupt gate, 0xF trap gate.
    #[bits(4)]
    pub typ: u8,

    /// Must be `0` for interrupt and trap gates.
    #[bits(1)]
    pub s: bool,

    #[bits(2)]
    pub dpl: u8,

    #[bits(1)]
    pub present: bool,
}

impl IdtGateAttr {
    #[inline]
    #[must_use]
    pub const fn interrupt_gate() -> Self {
        Self::new().with_typ(TYPE_INTERRUPT).with_s(false)
    }

    #[inline]
    #[must_use]
    pub const fn trap_gate() -> Self {
        Self::new().with_typ(TYPE_TRAP).with_s(false)
    }
}

/// Gate kinds used by the kernel. Task gates do not exist in long mode.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GateType {
    /// Clears `IF` on entry.
    InterruptGate,
    /// Leaves `IF` unchanged.
    TrapGate,
}

/// A 256-entry, 16-byte aligned descriptor table.
#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Idt {
    /// A table with every gate not present.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// Points every gate at its stub in a table starting at `stubs_base`.
    ///
    /// All gates become present ring-0 interrupt gates on [`KERNEL_CS`].
    /// Double faults and page faults get their own IST stacks so a blown
    /// kernel stack still reaches a handler.
    pub fn install_stubs(&mut self, stubs_base: u64, stub_size: u64) {
        for (vector, entry) in self.entries.iter_mut().enumerate() {
            entry
                .set_handler(stubs_base + vector as u64 * stub_size)
                .present(true)
                .gate_interrupt();
        }
        self[KnownExceptionVector::DoubleFault as usize]
            .edit()
            .ist(DOUBLE_FAULT_IST);
        self[KnownExceptionVector::PageFault as usize]
            .edit()
            .ist(PAGE_FAULT_IST);
    }

    /// Loads this table into `IDTR`.
    ///
    /// # Safety
    /// Must run at CPL0. Every present gate must point at valid entry code,
    /// and IST slots in use must be set in the TSS.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    #[inline]
    pub unsafe fn load(&'static self) {
        #[allow(clippy::cast_possible_truncation)]
        let idtr = Idtr {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u64,
        };
        unsafe {
            core::arch::asm!(
                "lidt [{}]",
                in(reg) &raw const idtr,
                options(nostack, preserves_flags, readonly)
            );
        }
    }
}

impl Index<usize> for Idt {
    type Output = IdtEntry;
    fn index(&self, i: usize) -> &Self::Output {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Idt {
    fn index_mut(&mut self, i: usize) -> &mut Self::Output {
        &mut self.entries[i]
    }
}

/// `lidt` operand.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u64,
}

/// One 16-byte gate descriptor.
///
/// ```text
/// bytes  0..2   offset[15:0]
///        2..4   selector
///        4..6   IST | P DPL S Type      (IdtGateAttr)
///        6..8   offset[31:16]
///        8..12  offset[63:32]
///       12..16  reserved
/// ```
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    attr: u16,
    offset_mid: u16,
    offset_hi: u32,
    zero: u32,
}

impl IdtEntry {
    pub const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        attr: IdtGateAttr::new().into_bits(),
        offset_mid: 0,
        offset_hi: 0,
        zero: 0,
    };

    /// Stores the entry address and resets the gate to a non-present,
    /// DPL 0 interrupt gate on [`KERNEL_CS`] without IST.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn set_handler(&mut self, address: u64) -> IdtEntryBuilder<'_> {
        self.offset_lo = address as u16;
        self.offset_mid = (address >> 16) as u16;
        self.offset_hi = (address >> 32) as u32;
        self.selector = KERNEL_CS;
        self.attr = IdtGateAttr::interrupt_gate().into_bits();
        IdtEntryBuilder { entry: self }
    }

    /// A builder over the entry as it is.
    pub const fn edit(&mut self) -> IdtEntryBuilder<'_> {
        IdtEntryBuilder { entry: self }
    }

    #[must_use]
    pub const fn handler_address(&self) -> u64 {
        (self.offset_lo as u64) | ((self.offset_mid as u64) << 16) | ((self.offset_hi as u64) << 32)
    }

    #[must_use]
    pub const fn selector(&self) -> u16 {
        self.selector
    }

    #[must_use]
    pub const fn attributes(&self) -> IdtGateAttr {
        IdtGateAttr::from_bits(self.attr)
    }

    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.attributes().present()
    }

    /// `None` for type values the kernel never installs.
    #[must_use]
    pub const fn gate_type(&self) -> Option<GateType> {
        match self.attributes().typ() {
            TYPE_INTERRUPT => Some(GateType::InterruptGate),
            TYPE_TRAP => Some(GateType::TrapGate),
            _ => None,
        }
    }
}

impl core::fmt::Debug for IdtEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let attr = self.attributes();
        f.debug_struct("IdtEntry")
            .field("handler", &format_args!("{:#018x}", self.handler_address()))
            .field("selector", &format_args!("{:#06x}", self.selector))
            .field("type", &self.gate_type())
            .field("dpl", &attr.dpl())
            .field("ist", &attr.ist())
            .field("present", &attr.present())
            .finish()
    }
}

/// Fluent editor for one [`IdtEntry`].
pub struct IdtEntryBuilder<'a> {
    entry: &'a mut IdtEntry,
}

impl IdtEntryBuilder<'_> {
    #[inline]
    pub const fn present(self, p: bool) -> Self {
        let attr = IdtGateAttr::from_bits(self.entry.attr).with_present(p);
        self.entry.attr = attr.into_bits();
        self
    }

    /// Descriptor privilege level, `0..=3`.
    #[inline]
    pub fn dpl(self, dpl: u8) -> Self {
        debug_assert!(dpl <= 3);
        let attr = IdtGateAttr::from_bits(self.entry.attr).with_dpl(dpl);
        self.entry.attr = attr.into_bits();
        self
    }

    #[inline]
    pub const fn gate_interrupt(self) -> Self {
        let attr = IdtGateAttr::from_bits(self.entry.attr)
            .with_typ(TYPE_INTERRUPT)
            .with_s(false);
        self.entry.attr = attr.into_bits();
        self
    }

    #[inline]
    pub const fn gate_trap(self) -> Self {
        let attr = IdtGateAttr::from_bits(self.entry.attr)
            .with_typ(TYPE_TRAP)
            .with_s(false);
        self.entry.attr = attr.into_bits();
        self
    }

    #[inline]
    pub const fn gate_type(self, gate_type: GateType) -> Self {
        match gate_type {
            GateType::InterruptGate => self.gate_interrupt(),
            GateType::TrapGate => self.gate_trap(),
        }
    }

    /// IST slot, `0` to stay on the current stack.
    #[inline]
    pub fn ist(self, idx: u8) -> Self {
        debug_assert!(idx <= 7);
        let attr = IdtGateAttr::from_bits(self.entry.attr).with_ist(idx);
        self.entry.attr = attr.into_bits();
        self
    }

    #[inline]
    pub const fn selector(self, sel: u16) -> Self {
        self.entry.selector = sel;
        self
    }
}
