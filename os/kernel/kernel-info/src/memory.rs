//! # Memory Layout

/// Size of a small page.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// First userland address. Everything below stays unmapped so null
/// dereferences (plus small offsets) always fault.
pub const USERLAND_START: u64 = 0x0000_0000_0020_0000; // 2 MiB

/// End (exclusive) of the lower canonical half.
pub const USERLAND_END: u64 = 0x0000_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// First address managed by the kernel address space.
pub const KERNEL_HEAP_START: u64 = 0xffff_c000_0000_0000;

/// End (exclusive) of the kernel address space.
pub const KERNEL_HEAP_END: u64 = 0xffff_fe00_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// The size of a kernel thread stack.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Kernel stacks and saved register images are aligned to this.
pub const STACK_ALIGN: u64 = 16;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE as usize));
    assert!(USERLAND_START.is_multiple_of(PAGE_SIZE));
    assert!(USERLAND_START < USERLAND_END);
    assert!(HHDM_BASE >= USERLAND_END);
    assert!(KERNEL_HEAP_START > HHDM_BASE);
    assert!(KERNEL_HEAP_START.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_END.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_BASE > KERNEL_HEAP_END);
};

/// Whether `addr` lies in the userland window.
#[inline]
#[must_use]
pub const fn is_userland(addr: u64) -> bool {
    addr >= USERLAND_START && addr < USERLAND_END
}

/// Whether `addr` lies in the kernel heap window.
#[inline]
#[must_use]
pub const fn is_kernel_heap(addr: u64) -> bool {
    addr >= KERNEL_HEAP_START && addr < KERNEL_HEAP_END
}
