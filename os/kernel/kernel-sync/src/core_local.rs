//! Identity of the executing core.
//!
//! Allocator and address-space code compare core indices to let a core
//! re-enter a structure it is already expanding. The execution layer
//! registers the real source once per boot; until then, bare metal reports
//! core 0 and hosted builds give every OS thread its own index.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Marker for "no core".
pub const NO_CORE: usize = usize::MAX;

static SOURCE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the function that reports the current core index.
///
/// Returns `false` if a source was already installed.
pub fn register_core_index_source(source: fn() -> usize) -> bool {
    SOURCE
        .compare_exchange(
            core::ptr::null_mut(),
            source as *mut (),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
}

#[must_use]
pub fn current_core_index() -> usize {
    let p = SOURCE.load(Ordering::Acquire);
    if p.is_null() {
        return fallback::index();
    }

    // SAFETY: only ever set from a `fn() -> usize` above.
    let source: fn() -> usize = unsafe { core::mem::transmute::<*mut (), fn() -> usize>(p) };
    source()
}

#[cfg(target_os = "none")]
mod fallback {
    pub const fn index() -> usize {
        0
    }
}

#[cfg(not(target_os = "none"))]
mod fallback {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    std::thread_local! {
        static INDEX: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn index() -> usize {
        INDEX.with(|i| *i)
    }
}
