//! # Threads and processes
//!
//! Each core runs the threads linked into its [`Scheduler`]'s ring,
//! round-robin. A switch happens inside an interrupt: the handler passes
//! the interrupted register image as `dest`, the scheduler saves it into
//! the outgoing thread and overwrites it with the incoming one, and the
//! interrupt return resumes the new thread.
//!
//! ```text
//!   timer IRQ ─► switch_to_next(dest)
//!                  ├─ owner differs? Process::switch_to ─► address space
//!                  ├─ save dest + extended state into current
//!                  ├─ CpuData.active_thread, kernel stack top
//!                  └─ dest ◄─ next thread's image
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(all(not(any(test, doctest)), not(target_os = "none")))]
extern crate std;

mod cpu;
mod process;
mod scheduler;
mod thread;

pub use crate::cpu::CpuData;
pub use crate::process::{Process, ProcessId, ProcessStatus};
pub use crate::scheduler::{Ring, Scheduler};
pub use crate::thread::{
    ExtendedState, KERNEL_SS, KernelStack, Thread, ThreadId, ThreadState, ThreadStatus,
    initialize_thread_state,
};

use kernel_vmem::VirtualAddress;
use kernel_vmm::VmmError;

/// The hardware side of a context switch.
pub trait SwitchPlatform {
    /// Whatever identifies a process's address space.
    type Space;

    /// Makes `to` the active address space on this core.
    ///
    /// # Errors
    /// Any failure aborts the thread switch before anything else changes.
    fn switch_address_space(&mut self, to: &Self::Space) -> Result<(), ExecError>;

    /// Stores the FPU and vector registers into `area`.
    fn save_extended(&mut self, area: &mut ExtendedState);

    /// Loads the FPU and vector registers from `area`.
    fn restore_extended(&mut self, area: &ExtendedState);

    /// Stack the CPU switches to when an interrupt arrives from ring 3.
    fn set_kernel_stack_top(&mut self, top: VirtualAddress);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("thread is already linked into the ring")]
    ThreadAlreadyLinked,
    #[error("argument out of range")]
    ArgumentOutOfRange,
    #[error("no thread {0}")]
    UnknownThread(ThreadId),
    #[error("thread {thread} is {status:?}")]
    InvalidTransition { thread: ThreadId, status: ThreadStatus },
    #[error("process {process:?} is {status:?}")]
    InvalidProcessTransition {
        process: ProcessId,
        status: ProcessStatus,
    },
    #[error("kernel stack {bottom:?}..{top:?} is unusable")]
    InvalidStack {
        bottom: VirtualAddress,
        top: VirtualAddress,
    },
    #[error("thread table is full")]
    TooManyThreads,
    #[error("no thread is active on this core")]
    NoActiveThread,
    #[error("thread {0} is running")]
    ThreadRunning(ThreadId),
    #[error(transparent)]
    Vmm(#[from] VmmError),
}
