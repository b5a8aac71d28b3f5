//! # Debug console output
//!
//! Everything the kernel prints goes through QEMU's debug console, port
//! `0x402` (`-debugcon stdio` on the host side). Two entry points:
//!
//! * [`qemu_trace!`] formats straight into the port without allocating and
//!   works before anything else is initialized, including inside fault
//!   handlers.
//! * [`KernelLogger`] is the `log` backend, so the rest of the kernel just
//!   uses `log::info!` and friends.
//!
//! Without the `enabled` feature all output is discarded. Hosted builds
//! (tests, tools) write to standard error instead of the port.
//!
//! ```rust,no_run
//! use log::LevelFilter;
//!
//! kernel_qemu::init_logger(LevelFilter::Debug).ok();
//! log::info!("memory manager up");
//! kernel_qemu::qemu_trace!("cr2={:#x}\n", 0xdead_b000_u64);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(all(not(any(test, doctest)), not(target_os = "none")))]
extern crate std;

mod logger;
mod port;

pub use logger::{KernelLogger, init_logger, write_record};
pub use port::DebugPort;

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; there is nobody to report a failed debug write to.
        let _ = fmt::write(&mut crate::DebugPort, args);
    }
}

/// Formats directly into the debug port.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
