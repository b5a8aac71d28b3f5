//! Structured exceptions and the per-thread chain of catch frames.
//!
//! A guarded scope [`enter`](ExceptionContextChain::enter)s a context with
//! the point execution continues at when something is caught, and
//! [`leave`](ExceptionContextChain::leave)s it on the way out. A fault
//! handler that cannot resolve a fault [`throw`](ExceptionContextChain::throw)s
//! an [`Exception`]: the nearest context still `Active` catches it, the
//! frames above it are dropped, and the handler rewrites the interrupted
//! state to resume there. Without such a context the fault is fatal.

use crate::{InterruptError, IsrState};
use arrayvec::ArrayVec;
use bitfield_struct::bitfield;
use kernel_vmem::{MemoryFlags, PhysicalAddress, VirtualAddress};

/// Read, write or execute, as seen by a faulting access.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read = 0,
    Write = 1,
    Execute = 2,
}

impl AccessKind {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Write,
            2 => Self::Execute,
            _ => Self::Read,
        }
    }
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct MemoryAccessType {
    #[bits(2, default = AccessKind::Read)]
    pub kind: AccessKind,
    #[bits(4)]
    __: u8,
    /// The access came from ring 3.
    pub unprivileged: bool,
    pub unaligned: bool,
}

/// An access the memory manager refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccessViolation {
    pub address: VirtualAddress,
    /// Backing frame, if the page is mapped.
    pub physical_address: Option<PhysicalAddress>,
    pub page_flags: MemoryFlags,
    pub access: MemoryAccessType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    NullReference,
    MemoryAccessViolation(MemoryAccessViolation),
    DivideByZero,
    ArithmeticOverflow,
    InvalidInstruction,
    UnitTestFailure { file: &'static str, line: u32 },
    Unknown,
}

impl ExceptionType {
    /// Numeric code of the type.
    #[must_use]
    pub const fn code(&self) -> usize {
        match self {
            Self::NullReference => 0x01,
            Self::MemoryAccessViolation(_) => 0x02,
            Self::DivideByZero => 0x03,
            Self::ArithmeticOverflow => 0x04,
            Self::InvalidInstruction => 0x05,
            Self::UnitTestFailure { .. } => 0xFF,
            Self::Unknown => usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub kind: ExceptionType,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
}

impl Exception {
    /// An exception of `kind` raised by the code `state` interrupted.
    #[must_use]
    pub const fn from_state(kind: ExceptionType, state: &IsrState) -> Self {
        Self {
            kind,
            instruction_pointer: state.rip,
            stack_pointer: state.rsp,
        }
    }

    /// Null pointer touches are reported separately from other violations.
    #[must_use]
    pub const fn memory_access(violation: MemoryAccessViolation, state: &IsrState) -> Self {
        let kind = if violation.address.as_u64() < kernel_vmem::PAGE_SIZE {
            ExceptionType::NullReference
        } else {
            ExceptionType::MemoryAccessViolation(violation)
        };
        Self::from_state(kind, state)
    }
}

impl core::fmt::Display for Exception {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "exception {:#x} at rip={:#018x} rsp={:#018x}",
            self.kind.code(),
            self.instruction_pointer,
            self.stack_pointer
        )?;
        if let ExceptionType::MemoryAccessViolation(v) = &self.kind {
            write!(
                f,
                ": {:?} {:?} (phys {:?}, page {:?})",
                v.access.kind(),
                v.address,
                v.physical_address,
                v.page_flags
            )?;
        }
        Ok(())
    }
}

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionStatus {
    /// Catches exceptions.
    Active = 0,
    /// Skipped while walking the chain.
    Suspended = 1,
    /// Caught an exception that is being handled.
    Handling = 2,
}

/// Where execution continues when a context catches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
}

impl ResumePoint {
    /// Redirects the interrupted state to this point.
    pub const fn apply(self, state: &mut IsrState) {
        state.rip = self.rip;
        state.rsp = self.rsp;
        state.rbp = self.rbp;
    }
}

/// Names one context of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextHandle(u32);

/// The exception nobody caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uncaught(pub Exception);

#[derive(Debug, Clone, Copy)]
struct Frame {
    handle: ContextHandle,
    status: ExceptionStatus,
    resume: ResumePoint,
}

/// A thread's nested exception contexts, innermost last.
#[derive(Debug, Default)]
pub struct ExceptionContextChain {
    frames: ArrayVec<Frame, { Self::DEPTH }>,
    next: u32,
    exception: Option<Exception>,
}

impl ExceptionContextChain {
    pub const DEPTH: usize = 16;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames: ArrayVec::new_const(),
            next: 0,
            exception: None,
        }
    }

    /// Pushes an active context.
    ///
    /// # Errors
    /// [`InterruptError::ContextChainFull`] past [`DEPTH`](Self::DEPTH).
    pub fn enter(&mut self, resume: ResumePoint) -> Result<ContextHandle, InterruptError> {
        let handle = ContextHandle(self.next);
        self.frames
            .try_push(Frame {
                handle,
                status: ExceptionStatus::Active,
                resume,
            })
            .map_err(|_| InterruptError::ContextChainFull)?;
        self.next = self.next.wrapping_add(1);
        Ok(handle)
    }

    /// Pops `handle` and every context entered after it.
    ///
    /// # Errors
    /// [`InterruptError::NoContext`] if `handle` is not on the chain.
    pub fn leave(&mut self, handle: ContextHandle) -> Result<(), InterruptError> {
        let at = self.position(handle)?;
        self.frames.truncate(at);
        if self.frames.is_empty() {
            self.exception = None;
        }
        Ok(())
    }

    /// Makes an active context transparent to [`throw`](Self::throw).
    ///
    /// # Errors
    /// [`InterruptError::NoContext`] if `handle` is not on the chain.
    pub fn suspend(&mut self, handle: ContextHandle) -> Result<(), InterruptError> {
        let at = self.position(handle)?;
        let frame = &mut self.frames[at];
        if frame.status == ExceptionStatus::Active {
            frame.status = ExceptionStatus::Suspended;
        }
        Ok(())
    }

    /// Undoes [`suspend`](Self::suspend).
    ///
    /// # Errors
    /// [`InterruptError::NoContext`] if `handle` is not on the chain.
    pub fn resume(&mut self, handle: ContextHandle) -> Result<(), InterruptError> {
        let at = self.position(handle)?;
        let frame = &mut self.frames[at];
        if frame.status == ExceptionStatus::Suspended {
            frame.status = ExceptionStatus::Active;
        }
        Ok(())
    }

    #[must_use]
    pub fn status(&self, handle: ContextHandle) -> Option<ExceptionStatus> {
        self.position(handle).ok().map(|at| self.frames[at].status)
    }

    /// Delivers `exception` to the innermost active context.
    ///
    /// That context switches to `Handling` and everything above it is
    /// dropped. Returns where to resume.
    ///
    /// # Errors
    /// [`Uncaught`] when no context is active; the chain is left as it was.
    pub fn throw(&mut self, exception: Exception) -> Result<ResumePoint, Uncaught> {
        let Some(at) = self
            .frames
            .iter()
            .rposition(|f| f.status == ExceptionStatus::Active)
        else {
            return Err(Uncaught(exception));
        };
        self.frames.truncate(at + 1);
        let frame = &mut self.frames[at];
        frame.status = ExceptionStatus::Handling;
        self.exception = Some(exception);
        Ok(frame.resume)
    }

    /// The exception last caught.
    #[must_use]
    pub const fn exception(&self) -> Option<&Exception> {
        self.exception.as_ref()
    }

    #[must_use]
    pub const fn depth(&self) -> usize {
        self.frames.len()
    }

    fn position(&self, handle: ContextHandle) -> Result<usize, InterruptError> {
        self.frames
            .iter()
            .rposition(|f| f.handle == handle)
            .ok_or(InterruptError::NoContext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rip: u64) -> ResumePoint {
        ResumePoint {
            rip,
            rsp: rip + 0x1000,
            rbp: 0,
        }
    }

    fn fault(address: u64) -> Exception {
        let state = IsrState {
            rip: 0xdead,
            rsp: 0xbeef,
            ..IsrState::default()
        };
        Exception::memory_access(
            MemoryAccessViolation {
                address: VirtualAddress::new(address),
                physical_address: None,
                page_flags: MemoryFlags::empty(),
                access: MemoryAccessType::new()
                    .with_kind(AccessKind::Write)
                    .with_unprivileged(true),
            },
            &state,
        )
    }

    #[test]
    fn innermost_active_context_catches() {
        let mut chain = ExceptionContextChain::new();
        let outer = chain.enter(at(0x100)).unwrap();
        let inner = chain.enter(at(0x200)).unwrap();

        let e = fault(0x7000);
        assert_eq!(chain.throw(e), Ok(at(0x200)));
        assert_eq!(chain.status(inner), Some(ExceptionStatus::Handling));
        assert_eq!(chain.status(outer), Some(ExceptionStatus::Active));
        assert_eq!(chain.exception(), Some(&e));
        assert_eq!(e.kind.code(), 0x02);
    }

    #[test]
    fn suspended_contexts_are_skipped_and_unwound() {
        let mut chain = ExceptionContextChain::new();
        let outer = chain.enter(at(0x100)).unwrap();
        let inner = chain.enter(at(0x200)).unwrap();
        chain.suspend(inner).unwrap();

        assert_eq!(chain.throw(fault(0x7000)), Ok(at(0x100)));
        assert_eq!(chain.depth(), 1);
        assert_eq!(chain.status(inner), None);
        assert_eq!(chain.resume(inner), Err(InterruptError::NoContext));
        chain.leave(outer).unwrap();
        assert_eq!(chain.exception(), None);
    }

    #[test]
    fn nothing_active_means_uncaught() {
        let mut chain = ExceptionContextChain::new();
        let e = fault(0x10);
        assert!(matches!(e.kind, ExceptionType::NullReference));
        assert_eq!(chain.throw(e), Err(Uncaught(e)));

        let only = chain.enter(at(0x100)).unwrap();
        chain.suspend(only).unwrap();
        assert_eq!(chain.throw(e), Err(Uncaught(e)));
        assert_eq!(chain.status(only), Some(ExceptionStatus::Suspended));
        chain.resume(only).unwrap();
        assert!(chain.throw(e).is_ok());
    }

    #[test]
    fn leaving_pops_nested_contexts() {
        let mut chain = ExceptionContextChain::new();
        let a = chain.enter(at(1)).unwrap();
        let _b = chain.enter(at(2)).unwrap();
        let _c = chain.enter(at(3)).unwrap();
        chain.leave(a).unwrap();
        assert_eq!(chain.depth(), 0);
        assert_eq!(chain.leave(a), Err(InterruptError::NoContext));
    }

    #[test]
    fn chain_depth_is_bounded() {
        let mut chain = ExceptionContextChain::new();
        for i in 0..ExceptionContextChain::DEPTH {
            chain.enter(at(i as u64)).unwrap();
        }
        assert_eq!(
            chain.enter(at(0)),
            Err(InterruptError::ContextChainFull)
        );
    }

    #[test]
    fn resume_point_redirects_state() {
        let mut state = IsrState::default();
        at(0x4242).apply(&mut state);
        assert_eq!((state.rip, state.rsp), (0x4242, 0x5242));
        assert!(fault(0x7000).to_string().contains("Write"));
    }
}
