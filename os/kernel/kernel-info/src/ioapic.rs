//! # IOAPIC redirection entries
//!
//! A redirection entry tells an IOAPIC which vector to raise, on which CPU,
//! for one GSI. The sixteen ISA IRQs carry their polarity and trigger mode in
//! the boot table's `irq_flags`; any other GSI is assumed to be a PCI-style
//! line, which is level triggered and active low.

use crate::boot::{ISA_IRQ_COUNT, InfoTable, IrqFlags};
use bitfield_struct::bitfield;

/// `delivery_mode` values.
pub mod delivery {
    pub const FIXED: u8 = 0b000;
    pub const LOWEST_PRIORITY: u8 = 0b001;
}

/// Destination that addresses every CPU in logical mode.
pub const ALL_LOGICAL: u8 = 0xFF;

#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RedirectionEntry {
    pub vector: u8, // bits 0..8

    #[bits(3)]
    pub delivery_mode: u8, // bits 8..11

    /// 0 = physical APIC id, 1 = logical destination.
    pub logical_destination: bool, // bit 11

    /// Read-only send-pending status.
    pub delivery_pending: bool, // bit 12

    pub active_low: bool, // bit 13

    /// Read-only, level-triggered only.
    pub remote_irr: bool, // bit 14

    pub level_triggered: bool, // bit 15

    pub masked: bool, // bit 16

    #[bits(39)]
    __: u64,

    pub destination: u8, // bits 56..64
}

/// How the kernel wants one ISA IRQ delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqRoute {
    pub vector: u8,
    pub masked: bool,
}

/// Which side is programming the IOAPIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectionMode<'a> {
    /// Fixed delivery to a physical destination, masked, no vector.
    Loader,
    /// Lowest-priority delivery to all CPUs.
    Kernel(&'a [IrqRoute; ISA_IRQ_COUNT]),
    /// Fixed delivery to the BSP only.
    KernelBsp(&'a [IrqRoute; ISA_IRQ_COUNT]),
}

impl RedirectionMode<'_> {
    fn base(self) -> RedirectionEntry {
        match self {
            Self::Loader => RedirectionEntry::new()
                .with_delivery_mode(delivery::FIXED)
                .with_masked(true),
            Self::Kernel(_) => RedirectionEntry::new()
                .with_delivery_mode(delivery::LOWEST_PRIORITY)
                .with_logical_destination(true)
                .with_destination(ALL_LOGICAL),
            Self::KernelBsp(_) => RedirectionEntry::new().with_delivery_mode(delivery::FIXED),
        }
    }
}

/// Builds the redirection entry for `gsi`.
///
/// Polarity and trigger mode come from the ISA IRQ flags when `gsi` is an
/// ISA IRQ target; an active-low line is programmed active low.
#[must_use]
pub fn forge_redirection(info: &InfoTable<'_>, gsi: u32, mode: RedirectionMode<'_>) -> RedirectionEntry {
    let irq = info.irq_for_gsi(gsi);
    let mut entry = mode.base();

    match irq {
        Some(irq) => {
            let flags = info.root().irq_flags[irq];
            entry.set_active_low(flags.contains(IrqFlags::ACTIVE_LOW));
            entry.set_level_triggered(flags.contains(IrqFlags::LEVEL));
        }
        None => {
            entry.set_level_triggered(true);
            entry.set_active_low(true);
        }
    }

    let routes = match mode {
        RedirectionMode::Loader => return entry.with_masked(true),
        RedirectionMode::Kernel(r) | RedirectionMode::KernelBsp(r) => r,
    };

    match irq {
        Some(irq) => {
            let route = routes[irq];
            entry.with_masked(route.masked).with_vector(route.vector)
        }
        None => entry.with_masked(true).with_vector(0),
    }
}
