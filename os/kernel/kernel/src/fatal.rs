//! Last words of a core.

use core::fmt;
use kernel_interrupts::{Exception, IsrState, KnownExceptionVector};

/// An exception and the registers it was raised with, formatted for the
/// debug console.
pub struct Report<'a> {
    pub exception: &'a Exception,
    pub state: &'a IsrState,
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state;
        writeln!(f, "uncaught {}", self.exception)?;
        match KnownExceptionVector::from_vector(s.vector()) {
            Some(known) => writeln!(f, "vector {:#04x} ({known:?}) error {:#x}", s.vector, s.error_code)?,
            None => writeln!(f, "vector {:#04x} error {:#x}", s.vector, s.error_code)?,
        }
        writeln!(
            f,
            "rip={:#018x} cs={:#06x} rflags={:#010x} rsp={:#018x} ss={:#06x}",
            s.rip, s.cs, s.rflags, s.rsp, s.ss
        )?;
        let gprs = [
            ("rax", s.rax),
            ("rbx", s.rbx),
            ("rcx", s.rcx),
            ("rdx", s.rdx),
            ("rsi", s.rsi),
            ("rdi", s.rdi),
            ("rbp", s.rbp),
            ("r8", s.r8),
            ("r9", s.r9),
            ("r10", s.r10),
            ("r11", s.r11),
            ("r12", s.r12),
            ("r13", s.r13),
            ("r14", s.r14),
            ("r15", s.r15),
        ];
        for row in gprs.chunks(4) {
            for (i, (name, value)) in row.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{name:>3}={value:#018x}")?;
            }
            f.write_str("\n")?;
        }
        Ok(())
    }
}

/// Dumps an exception nobody caught.
pub fn report_uncaught(exception: &Exception, state: &IsrState) {
    log::error!("{}", Report { exception, state });
}

/// Stops this core for good.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn stop() -> ! {
    loop {
        // SAFETY: masks interrupts and parks the core.
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

/// Stops this core for good.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn stop() -> ! {
    panic!("core stopped after a fatal exception")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_interrupts::ExceptionType;

    #[test]
    fn report_lists_the_frame_and_registers() {
        let state = IsrState {
            vector: 14,
            error_code: 0b110,
            rip: 0x4000_1000,
            rsp: 0x7fff_0000,
            cs: 0x2b,
            rax: 0xdead,
            r15: 0xbeef,
            ..IsrState::default()
        };
        let exception = Exception::from_state(ExceptionType::InvalidInstruction, &state);
        let text = Report {
            exception: &exception,
            state: &state,
        }
        .to_string();

        let lines: Vec<_> = text.lines().collect();
        assert!(lines[0].starts_with("uncaught exception 0x5 at rip=0x0000000040001000"));
        assert!(lines[1].contains("PageFault"));
        assert!(lines[1].contains("error 0x6"));
        assert!(lines[2].contains("cs=0x002b"));
        assert!(text.contains("rax=0x000000000000dead"));
        assert!(text.contains("r15=0x000000000000beef"));
        assert_eq!(lines.len(), 3 + 4);
    }
}
