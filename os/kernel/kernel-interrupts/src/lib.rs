//! # Interrupts and exceptions
//!
//! ```text
//!  vector n ──> stub n ──jmp──> common entry ──> Dispatcher::dispatch
//!              (push err,                          ├── handlers, by priority
//!               push n)                            └── ender (EOI)
//! ```
//!
//! - [`Idt`]: the 256 gate descriptors, built with a fluent entry builder.
//! - [`StubTable`]: 16-byte entry stubs whose final jump to the common
//!   entry is encoded with [`encode_jump`].
//! - [`Dispatcher`]: per-vector handler lists and end-of-interrupt hooks.
//! - [`ExceptionContextChain`]: per-thread catch frames that faults are
//!   delivered to as structured [`Exception`]s.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(all(not(any(test, doctest)), not(target_os = "none")))]
extern crate std;

mod dispatch;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod entry;
mod exceptions;
mod idt;
mod state;
mod stubs;
mod vectors;

pub use crate::dispatch::{
    Dispatcher, Ender, EnderToken, Handler, InterruptContext, InterruptEndType, Subscription,
    MAX_HANDLERS_PER_VECTOR,
};
pub use crate::exceptions::{
    AccessKind, ContextHandle, Exception, ExceptionContextChain, ExceptionStatus, ExceptionType,
    MemoryAccessType, MemoryAccessViolation, ResumePoint, Uncaught,
};
pub use crate::idt::{
    DOUBLE_FAULT_IST, GateType, Idt, IdtEntry, IdtEntryBuilder, IdtGateAttr, KERNEL_CS,
    PAGE_FAULT_IST,
};
pub use crate::state::IsrState;
pub use crate::stubs::{JumpEncoding, STUB_SIZE, StubTable, encode_jump, pushes_error_code};
pub use crate::vectors::{IRQ_BASE, IRQ_COUNT, KnownExceptionVector, PageFaultError};

/// Number of interrupt vectors on x86-64.
pub const VECTOR_COUNT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JumpEncodeError {
    #[error("jump distance {0} does not fit a relative jump")]
    Unencodable(i64),
    #[error("jump encoding needs {needed} bytes, {available} available")]
    NoRoom { needed: usize, available: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InterruptError {
    #[error("vector {0} out of range")]
    VectorOutOfRange(usize),
    #[error("vector {0} already has the maximum number of handlers")]
    HandlersFull(u8),
    #[error("handler is not subscribed")]
    NotSubscribed,
    #[error("vector {0} already has an ender")]
    EnderAlreadyRegistered(u8),
    #[error("vector {0} has no ender")]
    EnderNotRegistered(u8),
    #[error("vector {0} has a different ender")]
    WrongEnder(u8),
    #[error("exception context chain is full")]
    ContextChainFull,
    #[error("no such exception context")]
    NoContext,
}
