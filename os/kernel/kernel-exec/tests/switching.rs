use kernel_exec::{
    CpuData, ExecError, ExtendedState, KernelStack, Process, ProcessId, Scheduler, SwitchPlatform,
    ThreadId, ThreadState,
};
use kernel_vmem::VirtualAddress;
use kernel_vmm::VmmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Space(u64),
    Save(u8),
    Restore(u8),
    StackTop(u64),
}

/// Records every hardware action; address spaces are plain root numbers.
#[derive(Default)]
struct Recorder {
    calls: Vec<Call>,
    fail_space_switch: bool,
    /// Stand-in for the live FPU registers.
    fpu: u8,
}

impl SwitchPlatform for Recorder {
    type Space = u64;

    fn switch_address_space(&mut self, to: &u64) -> Result<(), ExecError> {
        if self.fail_space_switch {
            return Err(VmmError::Failed.into());
        }
        self.calls.push(Call::Space(*to));
        Ok(())
    }

    fn save_extended(&mut self, area: &mut ExtendedState) {
        area.area[0] = self.fpu;
        self.calls.push(Call::Save(self.fpu));
    }

    fn restore_extended(&mut self, area: &ExtendedState) {
        self.fpu = area.area[0];
        self.calls.push(Call::Restore(self.fpu));
    }

    fn set_kernel_stack_top(&mut self, top: VirtualAddress) {
        self.calls.push(Call::StackTop(top.as_u64()));
    }
}

fn stack(n: u64) -> KernelStack {
    let bottom = 0xffff_c000_0000_0000 + n * 0x1_0000;
    KernelStack::new(VirtualAddress::new(bottom), VirtualAddress::new(bottom + 0x8000)).unwrap()
}

fn spawn<'p>(sched: &mut Scheduler<'p, u64>, owner: &'p Process<u64>, n: u64) -> ThreadId {
    let id = sched.create_thread(owner, stack(n), 0x1000 * n, n).unwrap();
    sched.activate(id).unwrap();
    id
}

fn ring(sched: &Scheduler<'_, u64>, start: ThreadId) -> Vec<ThreadId> {
    sched.ring(start).collect()
}

#[test]
fn introducing_a_linked_thread_leaves_the_ring_alone() {
    let p = Process::new(ProcessId(1), 0x1000);
    let mut sched = Scheduler::new(CpuData::new(0, 0));
    let a = spawn(&mut sched, &p, 1);
    let b = spawn(&mut sched, &p, 2);
    let c = spawn(&mut sched, &p, 3);

    assert_eq!(sched.introduce_next(a, a), Err(ExecError::ThreadAlreadyLinked));
    sched.introduce_next(a, b).unwrap();
    assert_eq!(ring(&sched, a), [a, b]);

    assert_eq!(sched.introduce_next(a, b), Err(ExecError::ThreadAlreadyLinked));
    assert_eq!(sched.introduce_next(b, a), Err(ExecError::ThreadAlreadyLinked));
    assert_eq!(ring(&sched, a), [a, b]);

    sched.introduce_next(a, c).unwrap();
    assert_eq!(ring(&sched, a), [a, c, b]);
    for id in [a, b, c] {
        let t = sched.thread(id).unwrap();
        assert_eq!(sched.thread(t.next()).unwrap().previous(), id);
    }
}

#[test]
fn threads_in_another_ring_are_refused() {
    let p = Process::new(ProcessId(1), 0x1000);
    let mut sched = Scheduler::new(CpuData::new(0, 0));
    let a = spawn(&mut sched, &p, 1);
    let b = spawn(&mut sched, &p, 2);
    let c = spawn(&mut sched, &p, 3);
    let d = spawn(&mut sched, &p, 4);
    sched.introduce_next(a, b).unwrap();
    sched.introduce_next(c, d).unwrap();

    assert_eq!(sched.introduce_next(a, d), Err(ExecError::ThreadAlreadyLinked));
    assert_eq!(ring(&sched, c), [c, d]);
}

#[test]
fn unlinking_closes_the_gap() {
    let p = Process::new(ProcessId(1), 0x1000);
    let mut sched = Scheduler::new(CpuData::new(0, 0));
    let a = spawn(&mut sched, &p, 1);
    let b = spawn(&mut sched, &p, 2);
    let c = spawn(&mut sched, &p, 3);
    sched.introduce_next(a, b).unwrap();
    sched.introduce_next(b, c).unwrap();

    sched.unlink(b).unwrap();
    assert_eq!(ring(&sched, a), [a, c]);
    assert!(sched.thread(b).unwrap().is_alone());
    assert_eq!(sched.thread(c).unwrap().next(), a);

    sched.destroy(c).unwrap();
    assert_eq!(ring(&sched, a), [a]);
}

#[test]
fn round_robin_across_processes() {
    let p1 = Process::new(ProcessId(1), 0x1000);
    let p2 = Process::new(ProcessId(2), 0x2000);
    let mut sched = Scheduler::new(CpuData::new(0, 0));
    let a = spawn(&mut sched, &p1, 1);
    let b = spawn(&mut sched, &p1, 2);
    let c = spawn(&mut sched, &p2, 3);
    sched.introduce_next(a, b).unwrap();
    sched.introduce_next(b, c).unwrap();

    let mut hw = Recorder::default();
    let mut dest = ThreadState {
        vector: 0x20,
        ..ThreadState::default()
    };
    assert_eq!(
        sched.switch_to_next(&mut dest, &mut hw),
        Err(ExecError::NoActiveThread)
    );

    sched.switch_to(a, &mut dest, &mut hw).unwrap();
    assert_eq!(dest.rip, 0x1000);
    assert_eq!(dest.rdi, 1);
    assert_eq!(dest.vector, 0x20);
    assert_eq!(p1.active_core_count(), 1);
    assert_eq!(sched.cpu().active_thread(), Some(a));
    assert_eq!(sched.cpu().kernel_stack_top(), stack(1).top());

    // A runs for a while.
    dest.rax = 11;
    dest.rip = 0x1040;

    hw.calls.clear();
    sched.switch_to_next(&mut dest, &mut hw).unwrap();
    assert_eq!(sched.cpu().active_thread(), Some(b));
    assert_eq!(hw.calls, [Call::StackTop(stack(2).top().as_u64())]);
    assert_eq!(sched.thread(a).unwrap().state().rax, 11);
    assert_eq!(dest.rip, 0x2000);
    assert_eq!(dest.rax, 0);

    hw.calls.clear();
    sched.switch_to_next(&mut dest, &mut hw).unwrap();
    assert_eq!(hw.calls[0], Call::Space(0x2000));
    assert_eq!((p1.active_core_count(), p2.active_core_count()), (0, 1));

    sched.switch_to_next(&mut dest, &mut hw).unwrap();
    assert_eq!(sched.cpu().active_thread(), Some(a));
    assert_eq!((dest.rip, dest.rax), (0x1040, 11));
    assert_eq!((p1.active_core_count(), p2.active_core_count()), (1, 0));
}

#[test]
fn failed_space_switch_has_no_side_effects() {
    let p1 = Process::new(ProcessId(1), 0x1000);
    let p2 = Process::new(ProcessId(2), 0x2000);
    let mut sched = Scheduler::new(CpuData::new(0, 0));
    let a = spawn(&mut sched, &p1, 1);
    let c = spawn(&mut sched, &p2, 2);
    sched.introduce_next(a, c).unwrap();
    sched.enable_extended_state(a).unwrap();

    let mut hw = Recorder::default();
    let mut dest = ThreadState::default();
    sched.switch_to(a, &mut dest, &mut hw).unwrap();
    dest.rbx = 0xdead;

    let saved = *sched.thread(a).unwrap().state();
    let interrupted = dest;
    hw.calls.clear();
    hw.fail_space_switch = true;

    assert_eq!(
        sched.switch_to(c, &mut dest, &mut hw),
        Err(ExecError::Vmm(VmmError::Failed))
    );
    assert_eq!(dest, interrupted);
    assert_eq!(*sched.thread(a).unwrap().state(), saved);
    assert_eq!(sched.cpu().active_thread(), Some(a));
    assert_eq!(sched.cpu().kernel_stack_top(), stack(1).top());
    assert_eq!((p1.active_core_count(), p2.active_core_count()), (1, 0));
    assert!(hw.calls.is_empty());
}

#[test]
fn extended_state_follows_its_thread() {
    let p = Process::new(ProcessId(1), 0x1000);
    let mut sched = Scheduler::new(CpuData::new(0, 0));
    let a = spawn(&mut sched, &p, 1);
    let b = spawn(&mut sched, &p, 2);
    let plain = spawn(&mut sched, &p, 3);
    sched.introduce_next(a, b).unwrap();
    sched.introduce_next(b, plain).unwrap();
    sched.enable_extended_state(a).unwrap();
    sched.enable_extended_state(b).unwrap();

    let mut hw = Recorder::default();
    let mut dest = ThreadState::default();
    sched.switch_to(a, &mut dest, &mut hw).unwrap();
    hw.fpu = 0xAA;

    hw.calls.clear();
    sched.switch_to_next(&mut dest, &mut hw).unwrap();
    assert_eq!(
        hw.calls,
        [
            Call::Save(0xAA),
            Call::StackTop(stack(2).top().as_u64()),
            Call::Restore(0)
        ]
    );
    hw.fpu = 0xBB;

    // Threads without a save area leave the registers alone.
    hw.calls.clear();
    sched.switch_to_next(&mut dest, &mut hw).unwrap();
    assert_eq!(
        hw.calls,
        [Call::Save(0xBB), Call::StackTop(stack(3).top().as_u64())]
    );

    sched.switch_to_next(&mut dest, &mut hw).unwrap();
    assert_eq!(hw.fpu, 0xAA);
}

#[test]
fn a_process_cannot_switch_to_itself() {
    let p = Process::new(ProcessId(1), 0x1000);
    let mut hw = Recorder::default();
    assert_eq!(p.switch_to(&p, &mut hw), Err(ExecError::ArgumentOutOfRange));
    assert!(hw.calls.is_empty());
}

#[test]
fn switching_to_the_running_thread_is_a_no_op() {
    let p = Process::new(ProcessId(1), 0x1000);
    let mut sched = Scheduler::new(CpuData::new(0, 0));
    let a = spawn(&mut sched, &p, 1);
    let mut hw = Recorder::default();
    let mut dest = ThreadState::default();
    sched.switch_to(a, &mut dest, &mut hw).unwrap();

    dest.rax = 5;
    hw.calls.clear();
    sched.switch_to_next(&mut dest, &mut hw).unwrap();
    assert_eq!(dest.rax, 5);
    assert!(hw.calls.is_empty());
    assert_eq!(p.active_core_count(), 1);
}
