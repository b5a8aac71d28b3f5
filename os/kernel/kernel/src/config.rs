//! Compile-time tuning.

/// Cores the per-core tables are sized for.
pub const MAX_CORES: usize = 64;

/// Round-robin time slice.
pub const TIME_SLICE_US: u64 = 10_000;

/// Vector of the local APIC timer.
pub const TIMER_VECTOR: u8 = 0x30;

/// Vector the local APIC reports spurious interrupts on.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Pages in the static arena that seeds the kernel VAS descriptors.
pub const BOOTSTRAP_PAGES: usize = 16;

const _: () = assert!(TIMER_VECTOR >= kernel_interrupts::IRQ_BASE);
const _: () = assert!(TIME_SLICE_US > 0);
