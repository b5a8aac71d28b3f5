//! From page fault to exception.

use kernel_alloc::PoolProvider;
use kernel_interrupts::{
    AccessKind, Exception, ExceptionContextChain, ExceptionType, IsrState, KnownExceptionVector,
    MemoryAccessType, MemoryAccessViolation, PageFaultError, Uncaught,
};
use kernel_vmem::{FrameAlloc, MemoryFlags, Mmu, PhysMapper, VirtualAddress};
use kernel_vmm::{PageFaultFlags, ProcessSpace, Vmm};

/// Exception vectors turned into thrown exceptions.
pub const FAULT_VECTORS: [u8; 5] = [
    KnownExceptionVector::DivideError as u8,
    KnownExceptionVector::Overflow as u8,
    KnownExceptionVector::InvalidOpcode as u8,
    KnownExceptionVector::GeneralProtectionFault as u8,
    KnownExceptionVector::PageFault as u8,
];

/// Access bits the memory manager checks against the region.
#[must_use]
pub fn page_fault_access(error: PageFaultError) -> PageFaultFlags {
    let mut flags = PageFaultFlags::empty();
    flags.set(PageFaultFlags::PRESENT, error.present());
    flags.set(PageFaultFlags::WRITE, error.write());
    flags.set(PageFaultFlags::USERLAND, error.user());
    flags.set(PageFaultFlags::RESERVED, error.reserved_bit());
    flags.set(PageFaultFlags::EXECUTE, error.instruction_fetch());
    flags
}

/// The access as reported in a [`MemoryAccessViolation`].
#[must_use]
pub const fn access_type(error: PageFaultError) -> MemoryAccessType {
    let kind = if error.instruction_fetch() {
        AccessKind::Execute
    } else if error.write() {
        AccessKind::Write
    } else {
        AccessKind::Read
    };
    MemoryAccessType::new()
        .with_kind(kind)
        .with_unprivileged(error.user())
}

/// Handles a page fault at `address` raised by the code `state` describes,
/// running in `space`.
///
/// Allocate-on-demand pages are backed and the access retried. Any other
/// fault is thrown through `chain`; when a context catches it, `state` is
/// redirected to that context's resume point.
///
/// # Errors
/// [`Uncaught`] when no context is active; the caller must not return to
/// the faulting code.
pub fn resolve_page_fault<M, F, P, D, U>(
    vmm: &Vmm<M, F, P, D>,
    space: &ProcessSpace<U>,
    address: VirtualAddress,
    state: &mut IsrState,
    chain: &mut ExceptionContextChain,
) -> Result<(), Uncaught>
where
    M: Mmu,
    F: FrameAlloc,
    P: PhysMapper,
    D: PoolProvider,
    U: PoolProvider,
{
    let error = PageFaultError::from_bits(state.error_code);
    let err = match vmm.handle_page_fault(space, address, page_fault_access(error)) {
        Ok(()) => {
            log::trace!("demand page at {address:?} for rip={:#x}", state.rip);
            return Ok(());
        }
        Err(e) => e,
    };
    log::debug!(
        "page fault at {address:?} ({}) not resolved: {err}",
        error.explain()
    );

    let violation = MemoryAccessViolation {
        address,
        physical_address: vmm.translate(space, address),
        page_flags: vmm
            .page_flags(space, address)
            .unwrap_or(MemoryFlags::empty()),
        access: access_type(error),
    };
    throw(Exception::memory_access(violation, state), state, chain)
}

/// The exception a CPU fault other than `#PF` stands for.
#[must_use]
pub const fn exception_for(state: &IsrState) -> Exception {
    let kind = match KnownExceptionVector::from_vector(state.vector()) {
        Some(KnownExceptionVector::DivideError) => ExceptionType::DivideByZero,
        Some(KnownExceptionVector::Overflow) => ExceptionType::ArithmeticOverflow,
        Some(KnownExceptionVector::InvalidOpcode) => ExceptionType::InvalidInstruction,
        _ => ExceptionType::Unknown,
    };
    Exception::from_state(kind, state)
}

/// Throws `exception` through `chain` and resumes `state` at the catcher.
///
/// # Errors
/// [`Uncaught`] when no context is active.
pub fn throw(
    exception: Exception,
    state: &mut IsrState,
    chain: &mut ExceptionContextChain,
) -> Result<(), Uncaught> {
    let resume = chain.throw(exception)?;
    log::debug!("{exception} caught, resuming at {:#x}", resume.rip);
    resume.apply(state);
    Ok(())
}
