use core::fmt::{self, Write};

/// `fmt::Write` sink for the debug console.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugPort;

impl DebugPort {
    /// QEMU's `-debugcon` I/O port.
    pub const PORT: u16 = 0x402;

    #[inline]
    pub fn write_bytes(bytes: &[u8]) {
        sink::write(bytes);
    }
}

impl Write for DebugPort {
    #[inline]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Self::write_bytes(s.as_bytes());
        Ok(())
    }
}

#[cfg(all(feature = "enabled", target_os = "none"))]
mod sink {
    use super::DebugPort;

    #[inline]
    pub fn write(bytes: &[u8]) {
        for &b in bytes {
            unsafe { outb(DebugPort::PORT, b) }
        }
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") port,
                in("al") val,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}

#[cfg(all(feature = "enabled", not(target_os = "none")))]
mod sink {
    use std::io::Write;

    pub fn write(bytes: &[u8]) {
        let _ = std::io::stderr().write_all(bytes);
    }
}

#[cfg(not(feature = "enabled"))]
mod sink {
    #[inline]
    pub const fn write(_: &[u8]) {}
}
