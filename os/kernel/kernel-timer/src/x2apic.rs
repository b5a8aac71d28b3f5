//! Local APIC timer in x2APIC mode, driven one-shot.

use crate::HardwareTimer;
use core::arch::asm;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_EN: u64 = 1 << 11;
const APIC_EXTD: u64 = 1 << 10;

const IA32_X2APIC_ID: u32 = 0x802;
const IA32_X2APIC_EOI: u32 = 0x80B;
const IA32_X2APIC_SVR: u32 = 0x80F;
const IA32_X2APIC_LVT_TIMER: u32 = 0x832;
const IA32_X2APIC_INITCNT: u32 = 0x838;
const IA32_X2APIC_CURRCNT: u32 = 0x839;
const IA32_X2APIC_DIVCONF: u32 = 0x83E;

const LVT_MASKED: u64 = 1 << 16;

#[inline]
unsafe fn rdmsr(msr: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        asm!("rdmsr", in("ecx") msr, out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
unsafe fn wrmsr(msr: u32, val: u64) {
    let lo = val as u32;
    let hi = (val >> 32) as u32;
    unsafe {
        asm!("wrmsr", in("ecx") msr, in("eax") lo, in("edx") hi, options(nostack));
    }
}

#[inline]
fn rdtsc() -> u64 {
    let lo: u32;
    let hi: u32;
    // SAFETY: reads the time stamp counter; no memory effects.
    unsafe { asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack)) };
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Divide configuration values for the timer input clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Divider {
    By1 = 0b1011,
    By2 = 0b0000,
    By4 = 0b0001,
    By8 = 0b0010,
    By16 = 0b0011,
    By32 = 0b1000,
    By64 = 0b1001,
    By128 = 0b1010,
}

impl Divider {
    #[must_use]
    pub const fn factor(self) -> u64 {
        match self {
            Self::By1 => 1,
            Self::By2 => 2,
            Self::By4 => 4,
            Self::By8 => 8,
            Self::By16 => 16,
            Self::By32 => 32,
            Self::By64 => 64,
            Self::By128 => 128,
        }
    }
}

/// This core's local APIC timer.
#[derive(Debug)]
pub struct X2ApicTimer {
    lvt: u64,
    ticks_per_us: u64,
}

impl X2ApicTimer {
    /// Switches the local APIC into x2APIC mode, software-enables it with
    /// `spurious_vector`, and calibrates the timer against the TSC.
    ///
    /// Returns the timer and this core's APIC ID.
    ///
    /// # Safety
    /// Must run on the core that will own the timer, with the IDT already
    /// routing `vector` and `spurious_vector`.
    pub unsafe fn bring_up(vector: u8, spurious_vector: u8, divider: Divider, tsc_hz: u64) -> (Self, u32) {
        #[allow(clippy::cast_possible_truncation)]
        let apic_id = unsafe {
            wrmsr(IA32_APIC_BASE, rdmsr(IA32_APIC_BASE) | APIC_EN | APIC_EXTD);
            wrmsr(IA32_X2APIC_SVR, (1 << 8) | u64::from(spurious_vector));
            rdmsr(IA32_X2APIC_ID) as u32
        };

        let ticks_per_us = unsafe { calibrate(tsc_hz, 10_000, divider) }.max(1);
        log::info!(
            "x2APIC {apic_id:#x}: timer at {ticks_per_us} ticks/us (divider {})",
            divider.factor()
        );

        // One-shot mode is LVT bits 17..18 clear.
        let lvt = u64::from(vector);
        unsafe { wrmsr(IA32_X2APIC_LVT_TIMER, lvt) };
        (Self { lvt, ticks_per_us }, apic_id)
    }

    /// Stops any pending countdown.
    pub fn disarm(&mut self) {
        unsafe {
            wrmsr(IA32_X2APIC_LVT_TIMER, self.lvt | LVT_MASKED);
            wrmsr(IA32_X2APIC_INITCNT, 0);
        }
    }
}

impl HardwareTimer for X2ApicTimer {
    fn arm(&mut self, ticks: u32) {
        unsafe {
            wrmsr(IA32_X2APIC_LVT_TIMER, self.lvt);
            wrmsr(IA32_X2APIC_INITCNT, u64::from(ticks));
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn remaining(&self) -> u32 {
        unsafe { rdmsr(IA32_X2APIC_CURRCNT) as u32 }
    }

    fn eoi(&mut self) {
        unsafe { wrmsr(IA32_X2APIC_EOI, 0) };
    }

    fn ticks_per_microsecond(&self) -> u64 {
        self.ticks_per_us
    }
}

/// Counts masked timer ticks over a TSC-timed window of `window_us`.
unsafe fn calibrate(tsc_hz: u64, window_us: u64, divider: Divider) -> u64 {
    unsafe {
        wrmsr(IA32_X2APIC_DIVCONF, divider as u64);
        wrmsr(IA32_X2APIC_LVT_TIMER, LVT_MASKED | 0xFF);
        wrmsr(IA32_X2APIC_INITCNT, u64::from(u32::MAX));
    }

    let target = rdtsc() + (tsc_hz / 1_000_000) * window_us;
    while rdtsc() < target {
        core::hint::spin_loop();
    }

    let left = unsafe { rdmsr(IA32_X2APIC_CURRCNT) };
    unsafe { wrmsr(IA32_X2APIC_INITCNT, 0) };
    (u64::from(u32::MAX) - left) / window_us
}
