//! Per-core timer interrupt: timers first, then preemption.

use crate::config::{MAX_CORES, TIME_SLICE_US};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_exec::{CpuData, ExecError, Scheduler, SwitchPlatform, ThreadState};
use kernel_timer::{HardwareTimer, TimerError, TimerQueue};

static PREEMPT: [AtomicBool; MAX_CORES] = [const { AtomicBool::new(false) }; MAX_CORES];

/// Everything one core schedules with. Owned by that core.
pub struct Core<'p, H: HardwareTimer, S> {
    timers: TimerQueue<H>,
    scheduler: Scheduler<'p, S>,
}

impl<'p, H: HardwareTimer, S> Core<'p, H, S> {
    pub const fn new(timer: H, cpu: CpuData) -> Self {
        Self {
            timers: TimerQueue::new(timer),
            scheduler: Scheduler::new(cpu),
        }
    }

    pub const fn timers(&mut self) -> &mut TimerQueue<H> {
        &mut self.timers
    }

    pub const fn scheduler(&mut self) -> &mut Scheduler<'p, S> {
        &mut self.scheduler
    }

    fn index(&self) -> usize {
        self.scheduler.cpu().index as usize
    }

    /// Arms the time slice timer; it re-arms itself from then on.
    ///
    /// # Errors
    /// When the timer queue refuses the entry.
    pub fn start_preemption(&mut self) -> Result<(), TimerError> {
        let core = self.index();
        if core >= MAX_CORES {
            log::warn!("core {core} is beyond the preemption table, not preempting");
            return Ok(());
        }
        self.timers.enqueue(TIME_SLICE_US, time_slice_over::<H>, core)
    }

    /// Handles this core's timer interrupt taken with `dest` as the
    /// interrupted registers.
    ///
    /// Returns whether another thread resumes when the interrupt returns.
    pub fn on_timer_interrupt<P>(&mut self, dest: &mut ThreadState, platform: &mut P) -> bool
    where
        P: SwitchPlatform<Space = S>,
    {
        self.scheduler.cpu_mut().ticks += 1;
        self.timers.on_fire();

        let requested = PREEMPT
            .get(self.index())
            .is_some_and(|flag| flag.swap(false, Ordering::AcqRel));
        if !requested {
            return false;
        }
        let before = self.scheduler.cpu().active_thread();
        match self.scheduler.switch_to_next(dest, platform) {
            Ok(()) => self.scheduler.cpu().active_thread() != before,
            Err(ExecError::NoActiveThread) => false,
            Err(e) => {
                log::warn!("core {}: preemption failed: {e}", self.index());
                false
            }
        }
    }
}

fn time_slice_over<H: HardwareTimer>(queue: &mut TimerQueue<H>, core: usize) {
    if let Some(flag) = PREEMPT.get(core) {
        flag.store(true, Ordering::Release);
    }
    if let Err(e) = queue.enqueue(TIME_SLICE_US, time_slice_over::<H>, core) {
        log::error!("core {core}: time slice timer lost: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use kernel_exec::{ExtendedState, KernelStack, Process, ProcessId, Thread, ThreadId};
    use kernel_vmem::VirtualAddress;

    /// Always expired: the tests only interrupt once a deadline passed.
    #[derive(Default)]
    struct Expired {
        armed: Vec<u32>,
    }

    impl HardwareTimer for Expired {
        fn arm(&mut self, ticks: u32) {
            self.armed.push(ticks);
        }

        fn remaining(&self) -> u32 {
            0
        }

        fn eoi(&mut self) {}

        fn ticks_per_microsecond(&self) -> u64 {
            1
        }
    }

    struct Flat;

    impl SwitchPlatform for Flat {
        type Space = u32;

        fn switch_address_space(&mut self, _: &u32) -> Result<(), ExecError> {
            Ok(())
        }

        fn save_extended(&mut self, _: &mut ExtendedState) {}

        fn restore_extended(&mut self, _: &ExtendedState) {}

        fn set_kernel_stack_top(&mut self, _: VirtualAddress) {}
    }

    fn thread<'p>(core: &mut Core<'p, Expired, u32>, owner: &'p Process<u32>, n: u64) -> ThreadId {
        let bottom = 0xffff_c000_0000_0000 + n * 0x1_0000;
        let top = VirtualAddress::new(bottom + 0x4000);
        let stack = KernelStack::new(VirtualAddress::new(bottom), top).unwrap();
        let id = core.scheduler().create_thread(owner, stack, 0x1000 * n, n).unwrap();
        core.scheduler().activate(id).unwrap();
        id
    }

    fn current(core: &mut Core<'_, Expired, u32>) -> Option<ThreadId> {
        core.scheduler().current().map(Thread::id)
    }

    #[test]
    fn expired_slices_rotate_the_ring() {
        let p = Process::new(ProcessId(1), 7);
        let mut core = Core::new(Expired::default(), CpuData::new(1, 1));
        let a = thread(&mut core, &p, 1);
        let b = thread(&mut core, &p, 2);
        core.scheduler().introduce_next(a, b).unwrap();

        let mut dest = ThreadState::default();
        core.scheduler().switch_to(a, &mut dest, &mut Flat).unwrap();
        core.start_preemption().unwrap();
        assert_eq!(core.timers().hardware().armed, [u32::try_from(TIME_SLICE_US).unwrap()]);

        assert!(core.on_timer_interrupt(&mut dest, &mut Flat));
        assert_eq!(current(&mut core), Some(b));
        assert_eq!(dest.rdi, 2);
        assert!(core.on_timer_interrupt(&mut dest, &mut Flat));
        assert_eq!(current(&mut core), Some(a));
        assert_eq!(dest.rdi, 1);
        assert_eq!(core.scheduler().cpu().ticks, 2);
        assert_eq!(core.timers().len(), 1);
    }

    static OTHER_TIMER: AtomicUsize = AtomicUsize::new(0);

    fn other_timer(_: &mut TimerQueue<Expired>, cookie: usize) {
        OTHER_TIMER.store(cookie, Ordering::Relaxed);
    }

    #[test]
    fn other_timers_do_not_preempt() {
        let p = Process::new(ProcessId(1), 7);
        let mut core = Core::new(Expired::default(), CpuData::new(2, 2));
        let a = thread(&mut core, &p, 1);
        let b = thread(&mut core, &p, 2);
        core.scheduler().introduce_next(a, b).unwrap();
        let mut dest = ThreadState::default();
        core.scheduler().switch_to(a, &mut dest, &mut Flat).unwrap();

        core.timers().enqueue(5, other_timer, 42).unwrap();
        assert!(!core.on_timer_interrupt(&mut dest, &mut Flat));
        assert_eq!(OTHER_TIMER.load(Ordering::Relaxed), 42);
        assert_eq!(current(&mut core), Some(a));
    }

    #[test]
    fn a_core_without_threads_keeps_its_slice_timer() {
        let mut core: Core<'_, Expired, u32> = Core::new(Expired::default(), CpuData::new(3, 3));
        core.start_preemption().unwrap();

        let mut dest = ThreadState::default();
        assert!(!core.on_timer_interrupt(&mut dest, &mut Flat));
        assert_eq!(core.timers().len(), 1);
        assert_eq!(dest, ThreadState::default());
    }
}
