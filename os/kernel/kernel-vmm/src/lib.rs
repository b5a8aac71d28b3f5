//! # Virtual Memory Manager
//!
//! Region bookkeeping and page mapping for the kernel heap and for every
//! process's userland window.
//!
//! ```text
//!   Vmm ───────────── page tables (kernel-vmem), frames, MMU
//!    ├── KernelVas ── kernel heap regions, descriptor reserve
//!    └── ProcessSpace ─ per-process root + userland Vas
//! ```
//!
//! A [`Vas`] is an address-ordered list of [`MemoryRegion`]s tiling its
//! bounds. Allocation splits free regions first-fit, freeing coalesces
//! them. Committed regions get frames immediately; allocate-on-demand
//! regions get them in [`Vmm::handle_page_fault`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(all(not(any(test, doctest)), not(target_os = "none")))]
extern crate std;

mod options;
mod range;
mod region;
mod space;
mod vas;
mod vmm;

pub use crate::options::{
    AllocationStrategy, MemoryAllocationOptions, MemoryCheckType, MemoryContent, PageFaultFlags,
};
pub use crate::range::MemoryRange;
pub use crate::region::{Descriptors, Iter, MemoryRegion, RegionList, RegionNode};
pub use crate::space::ProcessSpace;
pub use crate::vas::{KernelVas, Regions, SharedRegions, Vas, VirtualSpace};
pub use crate::vmm::Vmm;

use kernel_alloc::ObjectAllocError;
use kernel_vmem::{MapError, VirtualAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("no free virtual range is large enough")]
    OutOfVirtualSpace,
    #[error("argument out of range")]
    ArgumentOutOfRange,
    #[error("address or size is not page aligned")]
    AlignmentFailure,
    #[error("{0:?} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0:?} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0:?} is already reserved")]
    AddressInUse(VirtualAddress),
    #[error("region is not allocated on demand")]
    PageUndemandable,
    #[error("guard page touched")]
    PageGuard,
    #[error("region is only reserved")]
    PageReserved,
    #[error("operation failed")]
    Failed,
    #[error(transparent)]
    Map(MapError),
    #[error("region descriptors: {0}")]
    Descriptors(#[from] ObjectAllocError),
}

impl From<MapError> for VmmError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::AlreadyMapped(va) => Self::AlreadyMapped(va),
            MapError::NotMapped(va) => Self::NotMapped(va),
            MapError::Unaligned(_) => Self::AlignmentFailure,
            MapError::NonCanonical(_) => Self::ArgumentOutOfRange,
            MapError::HugePage(_) => Self::Map(e),
        }
    }
}
