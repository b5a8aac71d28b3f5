//! # Kernel Object and Frame Allocation
//!
//! Fixed-size object allocation for kernel structures (threads, processes,
//! address-space region descriptors) and the physical frame bitmap.
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 ObjectAllocator<T>                  │
//! │    • pools of equal slots, intrusive free lists     │
//! │    • SMP (ticket + RW locks) or UP (no locks)       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ PoolProvider
//! ┌─────────────────▼───────────────────────────────────┐
//! │      PagePoolProvider<S> / HeapPoolProvider         │
//! │    • pages from the kernel heap, or the host heap   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ PageSource (the memory manager)
//! ┌─────────────────▼───────────────────────────────────┐
//! │         BitmapFrameAllocator + HhdmPhysMapper       │
//! │    • 4 KiB frames, one bit each                     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Pools
//!
//! A pool is one contiguous block: a header, then `capacity` slots of
//! `object_size` bytes. A free slot stores the index of the next free slot;
//! [`OBJ_IND_INVALID`] terminates the list. The header records the first and
//! last free index so a pool can be grown in place by appending slots.
//!
//! ## Re-entrancy
//!
//! Growing the allocator may call back into the memory manager, which may in
//! turn need an object from the *same* allocator (region descriptors are the
//! usual case). The core that holds the acquisition lock is recorded; a
//! nested request from that core proceeds without taking the lock again,
//! while other cores wait.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(all(not(any(test, doctest)), not(target_os = "none")))]
extern crate std;

#[cfg(not(target_os = "none"))]
extern crate alloc;

pub mod frame_alloc;
mod object_allocator;
pub mod phys_mapper;
mod pool;
mod provider;

pub use crate::frame_alloc::BitmapFrameAllocator;
pub use crate::object_allocator::{
    Locking, ObjectAllocator, PoolReleaseOptions, SmpLocking, SmpObjectAllocator, UpLocking,
    UpObjectAllocator,
};
pub use crate::pool::{OBJ_IND_INVALID, ObjectIndex, PoolBlock, PoolGeometry};
#[cfg(not(target_os = "none"))]
pub use crate::provider::HeapPoolProvider;
pub use crate::provider::{PagePoolProvider, PageSource, PoolProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ObjectAllocError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("out of address space for pools")]
    OutOfAddressSpace,
    #[error("object quota of {quota} reached")]
    QuotaExceeded { quota: usize },
    #[error("the pool provider cannot enlarge pools")]
    EnlargeUnsupported,
    #[error("pool block of {bytes} bytes holds no object")]
    PoolTooSmall { bytes: usize },
    #[error("pool pages were placed elsewhere")]
    Misplaced,
    #[error("object does not belong to this allocator")]
    NotOwned,
}
