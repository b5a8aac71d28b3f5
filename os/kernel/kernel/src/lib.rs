//! # Kernel core wiring
//!
//! Joins the subsystems at the points where one hands over to another:
//!
//! * a page fault goes to the memory manager first; if it cannot back the
//!   page, the fault becomes an [`Exception`](kernel_interrupts::Exception)
//!   thrown through the faulting thread's context chain ([`faults`]);
//! * uncaught exceptions are dumped through `log` and stop the core
//!   ([`fatal`]);
//! * each core's timer interrupt drives its timer queue and, once a time
//!   slice ran out, the round-robin switch ([`tick`]);
//! * the kernel VAS gets its first region descriptors from a static page
//!   arena ([`bootstrap`]);
//! * interrupt stubs are copied into place and the IDT pointed at them
//!   ([`setup`]).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(all(not(any(test, doctest)), not(target_os = "none")))]
extern crate std;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;
pub mod bootstrap;
pub mod config;
pub mod faults;
pub mod fatal;
pub mod setup;
pub mod tick;

use kernel_interrupts::{InterruptError, JumpEncodeError};
use kernel_timer::TimerError;
use kernel_vmm::VmmError;

/// Failures while bringing a core up.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("a logger was already installed")]
    Logger,
    #[error("interrupt stubs: {0}")]
    Stubs(#[from] JumpEncodeError),
    #[error("interrupt dispatch: {0}")]
    Dispatch(#[from] InterruptError),
    #[error("memory manager: {0}")]
    Vmm(#[from] VmmError),
    #[error("timer: {0}")]
    Timer(#[from] TimerError),
    #[error("{0} was set up twice")]
    AlreadyInstalled(&'static str),
}
