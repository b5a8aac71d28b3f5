//! x86-64 pieces of the switch engine and the fault path.

use crate::config::{SPURIOUS_VECTOR, TIMER_VECTOR};
use crate::faults;
use crate::tick::Core;
use core::marker::PhantomData;
use kernel_alloc::PoolProvider;
use kernel_exec::{CpuData, ExecError, ExtendedState, SwitchPlatform};
use kernel_interrupts::{ExceptionContextChain, IsrState, Uncaught};
use kernel_timer::HardwareTimer;
use kernel_timer::x2apic::{Divider, X2ApicTimer};
use kernel_vmem::{FrameAlloc, Mmu, PhysMapper, VirtualAddress};
use kernel_vmm::{ProcessSpace, Vmm};

/// Faulting linear address of the last `#PF`.
#[inline]
#[must_use]
pub fn read_cr2() -> VirtualAddress {
    let cr2: u64;
    unsafe {
        core::arch::asm!(
            "mov {}, cr2",
            out(reg) cr2,
            options(nomem, nostack, preserves_flags)
        );
    }
    VirtualAddress::new(cr2)
}

/// 64-bit task state segment. Only the stack pointers matter in long mode.
#[repr(C, packed)]
pub struct Tss64 {
    _reserved0: u32,
    /// Stack loaded on entry from ring 3.
    pub rsp0: u64,
    pub rsp1: u64,
    pub rsp2: u64,
    _reserved1: u64,
    /// Stacks for gates with a non-zero IST index.
    pub ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    pub iopb_offset: u16,
}

impl Tss64 {
    /// No I/O bitmap: `iopb_offset` points past the segment.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }
}

impl Default for Tss64 {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch engine backend for one core: CR3 through the memory manager,
/// `fxsave64`/`fxrstor64` for the extended registers, `rsp0` in the
/// core's TSS.
///
/// `U` is the descriptor pool provider of the process spaces it switches
/// between.
pub struct FxPlatform<'a, M: Mmu, F: FrameAlloc, P: PhysMapper, D: PoolProvider, U> {
    vmm: &'a Vmm<M, F, P, D>,
    tss: &'a mut Tss64,
    _spaces: PhantomData<fn(&ProcessSpace<U>)>,
}

impl<'a, M, F, P, D, U> FxPlatform<'a, M, F, P, D, U>
where
    M: Mmu,
    F: FrameAlloc,
    P: PhysMapper,
    D: PoolProvider,
    U: PoolProvider,
{
    pub const fn new(vmm: &'a Vmm<M, F, P, D>, tss: &'a mut Tss64) -> Self {
        Self {
            vmm,
            tss,
            _spaces: PhantomData,
        }
    }
}

impl<M, F, P, D, U> SwitchPlatform for FxPlatform<'_, M, F, P, D, U>
where
    M: Mmu,
    F: FrameAlloc,
    P: PhysMapper,
    D: PoolProvider,
    U: PoolProvider,
{
    type Space = ProcessSpace<U>;

    fn switch_address_space(&mut self, to: &Self::Space) -> Result<(), ExecError> {
        if self.vmm.switch_to(to) {
            log::trace!("address space {to:?} loaded");
        }
        Ok(())
    }

    fn save_extended(&mut self, area: &mut ExtendedState) {
        unsafe {
            core::arch::asm!(
                "fxsave64 [{}]",
                in(reg) area.area.as_mut_ptr(),
                options(nostack, preserves_flags)
            );
        }
    }

    fn restore_extended(&mut self, area: &ExtendedState) {
        unsafe {
            core::arch::asm!(
                "fxrstor64 [{}]",
                in(reg) area.area.as_ptr(),
                options(nostack, preserves_flags, readonly)
            );
        }
    }

    fn set_kernel_stack_top(&mut self, top: VirtualAddress) {
        self.tss.rsp0 = top.as_u64();
    }
}

/// `#PF` entry point for the fault hook: reads CR2 and resolves.
///
/// # Errors
/// As [`faults::resolve_page_fault`].
pub fn page_fault<M, F, P, D, U>(
    vmm: &Vmm<M, F, P, D>,
    space: &ProcessSpace<U>,
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
    faults::resolve_page_fault(vmm, space, read_cr2(), state, chain)
}

/// Brings up this core's local APIC timer on [`TIMER_VECTOR`] and the
/// per-core state it belongs to.
///
/// # Safety
/// Once per core, at CPL0, with interrupts masked.
pub unsafe fn bring_up_core<'p, S>(index: u32, tsc_hz: u64) -> Core<'p, X2ApicTimer, S> {
    let (timer, apic_id) =
        unsafe { X2ApicTimer::bring_up(TIMER_VECTOR, SPURIOUS_VECTOR, Divider::By16, tsc_hz) };
    log::info!(
        "core {index}: x2APIC {apic_id}, {} timer ticks/us",
        timer.ticks_per_microsecond()
    );
    Core::new(timer, CpuData::new(index, apic_id))
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    log::error!("kernel panic: {info}");
    crate::fatal::stop()
}
