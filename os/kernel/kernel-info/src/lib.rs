//! # Kernel configuration and boot interface
//!
//! The authoritative source for what the loader hands to the kernel and for
//! the fixed shape of the virtual address space.
//!
//! ## Boot information ([`boot`])
//!
//! The loader leaves a packed, little-endian info table at
//! [`INFO_TABLE_PADDR`](boot::INFO_TABLE_PADDR). It describes:
//!
//! * the CPUs (APIC ids, LAPIC timer frequency, which one is the BSP),
//! * the IOAPICs and how the sixteen ISA IRQs map onto GSIs,
//! * the physical memory map,
//! * the loaded modules and their names.
//!
//! [`InfoTable::parse`](boot::InfoTable::parse) validates every offset and
//! count against the table length before anything is read, so the rest of
//! the kernel never touches the raw bytes.
//!
//! ## Memory layout ([`memory`])
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌──────────────────────────────┐
//!                       │ unmapped (null guard)        │
//! USERLAND_START        ├──────────────────────────────┤ 0x0000_0000_0020_0000
//!                       │ userland                     │
//! USERLAND_END          ├──────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │ non-canonical hole           │
//! HHDM_BASE             ├──────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │ direct map of physical RAM   │
//! KERNEL_HEAP_START     ├──────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │ kernel heap (kernel VAS)     │
//! KERNEL_HEAP_END       ├──────────────────────────────┤ 0xffff_fe00_0000_0000
//!                       │ ...                          │
//! KERNEL_BASE           ├──────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │ kernel image                 │
//! 0xFFFF_FFFF_FFFF_FFFF └──────────────────────────────┘
//! ```
//!
//! ## IOAPIC routing ([`ioapic`])
//!
//! Redirection entries are forged from the boot table's IRQ→GSI map and
//! per-IRQ polarity/trigger flags.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod ioapic;
pub mod memory;
