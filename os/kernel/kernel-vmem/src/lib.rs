//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel's address spaces.
//!
//! ## What you get
//! - [`VirtualAddress`] / [`PhysicalAddress`] newtypes so the two never mix.
//! - [`PageTableEntry`], a bitfield view of one 64-bit entry, and the
//!   4 KiB-aligned [`PageTable`].
//! - [`MemoryFlags`], the architecture-neutral protection bits the memory
//!   manager works with.
//! - [`AddressSpace`], a PML4-rooted tree with map, unmap, translate and
//!   flag updates for 4 KiB pages.
//! - The [`FrameAlloc`], [`PhysMapper`] and [`Mmu`] seams. Tests plug in a
//!   vector of frames; the kernel plugs in the frame bitmap, the direct map
//!   and the real `cr3`/`invlpg`.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each level is a table of 512 eight-byte entries. A present non-leaf entry
//! points at the next table; the PT entry maps the 4 KiB frame. Huge pages
//! are never created here, and a walk that meets one reports it as an error
//! rather than guessing.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod address_space;
mod addresses;
mod entry;
mod flags;
mod mmu;
mod table;

pub use crate::address_space::{AddressSpace, KERNEL_HALF_FIRST_SLOT};
pub use crate::addresses::{PhysicalAddress, VirtualAddress};
pub use crate::entry::PageTableEntry;
pub use crate::flags::MemoryFlags;
pub use crate::mmu::Mmu;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use crate::mmu::HardwareMmu;
pub use crate::table::PageTable;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Size of the only page size this crate maps.
pub const PAGE_SIZE: u64 = info::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical frames for page tables")]
    OutOfMemory,
    #[error("{0:?} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0:?} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("{0:?} is not canonical")]
    NonCanonical(VirtualAddress),
    #[error("{0:?} is covered by a huge page")]
    HugePage(VirtualAddress),
}

/// Source of **physical** 4 KiB frames.
///
/// Returned frames **must** be 4 KiB aligned. `None` means out of memory.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Returns a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, pa: PhysicalAddress);
}

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space (e.g., via identity map or a higher-half direct map, HHDM).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable for the lifetime `'a`.
    /// - The bytes at `pa` must be a valid `T` and not aliased elsewhere.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }
}

/// Fills the frame at `pa` with `byte`.
///
/// # Safety
/// `pa` must be a frame the caller owns, reachable through `mapper`.
pub unsafe fn fill_frame<M: PhysMapper>(mapper: &M, pa: PhysicalAddress, byte: u8) {
    let page: &mut [u8; PAGE_SIZE as usize] = unsafe { mapper.phys_to_mut(pa) };
    page.fill(byte);
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(0x12345,   16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
