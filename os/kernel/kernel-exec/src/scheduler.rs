use crate::{
    CpuData, ExecError, ExtendedState, KernelStack, Process, SwitchPlatform, Thread, ThreadId,
    ThreadState, ThreadStatus,
};
use arrayvec::ArrayVec;
use kernel_sync::InterruptGuard;

/// The threads of one core and the ring they take turns in.
///
/// Owned by its core. Ring edits and switches run with interrupts off so
/// a timer tick never observes a half-linked ring.
pub struct Scheduler<'p, S, const N: usize = 64> {
    cpu: CpuData,
    threads: ArrayVec<Option<Thread<'p, S>>, N>,
}

impl<'p, S, const N: usize> Scheduler<'p, S, N> {
    pub const fn new(cpu: CpuData) -> Self {
        Self {
            cpu,
            threads: ArrayVec::new_const(),
        }
    }

    pub const fn cpu(&self) -> &CpuData {
        &self.cpu
    }

    pub const fn cpu_mut(&mut self) -> &mut CpuData {
        &mut self.cpu
    }

    /// # Errors
    /// [`ExecError::UnknownThread`] for ids not in this table.
    pub fn thread(&self, id: ThreadId) -> Result<&Thread<'p, S>, ExecError> {
        self.threads
            .get(id.slot())
            .and_then(Option::as_ref)
            .ok_or(ExecError::UnknownThread(id))
    }

    fn thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread<'p, S>, ExecError> {
        self.threads
            .get_mut(id.slot())
            .and_then(Option::as_mut)
            .ok_or(ExecError::UnknownThread(id))
    }

    /// The thread this core is running.
    pub fn current(&self) -> Option<&Thread<'p, S>> {
        self.cpu.active_thread.and_then(|id| self.thread(id).ok())
    }

    pub fn thread_count(&self) -> usize {
        self.threads.iter().flatten().count()
    }

    /// Adds an unlinked thread in [`ThreadStatus::Constructing`] whose
    /// first switch enters `entry(arg)`.
    ///
    /// # Errors
    /// [`ExecError::TooManyThreads`] when every slot is taken.
    pub fn create_thread(
        &mut self,
        owner: &'p Process<S>,
        stack: KernelStack,
        entry: u64,
        arg: u64,
    ) -> Result<ThreadId, ExecError> {
        let slot = match self.threads.iter().position(Option::is_none) {
            Some(free) => free,
            None if self.threads.is_full() => return Err(ExecError::TooManyThreads),
            None => {
                self.threads.push(None);
                self.threads.len() - 1
            }
        };
        let id = ThreadId::from_slot(slot).ok_or(ExecError::TooManyThreads)?;
        self.threads[slot] = Some(Thread::new(id, owner, stack, entry, arg));
        log::debug!("thread {id} created in process {:?} at {entry:#x}", owner.id());
        Ok(id)
    }

    /// Gives the thread an FPU/vector register save area.
    ///
    /// # Errors
    /// [`ExecError::UnknownThread`].
    pub fn enable_extended_state(&mut self, id: ThreadId) -> Result<(), ExecError> {
        self.thread_mut(id)?
            .extended
            .get_or_insert_with(ExtendedState::new);
        Ok(())
    }

    /// Moves a thread from construction into service.
    ///
    /// # Errors
    /// [`ExecError::InvalidTransition`] unless it is still constructing.
    pub fn activate(&mut self, id: ThreadId) -> Result<(), ExecError> {
        let thread = self.thread_mut(id)?;
        if thread.status != ThreadStatus::Constructing {
            return Err(ExecError::InvalidTransition {
                thread: id,
                status: thread.status,
            });
        }
        thread.status = ThreadStatus::Active;
        Ok(())
    }

    /// Stops a thread from being scheduled again.
    ///
    /// A thread that is not running leaves its ring at once. The running
    /// thread stays linked until [`switch_to_next`](Self::switch_to_next)
    /// moves this core past it.
    ///
    /// # Errors
    /// [`ExecError::InvalidTransition`] when it already terminates.
    pub fn terminate(&mut self, id: ThreadId) -> Result<(), ExecError> {
        let thread = self.thread_mut(id)?;
        if thread.status == ThreadStatus::Terminating {
            return Err(ExecError::InvalidTransition {
                thread: id,
                status: thread.status,
            });
        }
        thread.status = ThreadStatus::Terminating;
        if self.cpu.active_thread != Some(id) {
            self.unlink(id)?;
        }
        log::debug!("thread {id} terminating");
        Ok(())
    }

    /// Unlinks the thread and frees its slot.
    ///
    /// # Errors
    /// [`ExecError::ThreadRunning`] for the thread this core is running.
    pub fn destroy(&mut self, id: ThreadId) -> Result<(), ExecError> {
        if self.cpu.active_thread == Some(id) {
            return Err(ExecError::ThreadRunning(id));
        }
        self.unlink(id)?;
        self.threads[id.slot()] = None;
        log::debug!("thread {id} destroyed");
        Ok(())
    }

    /// Links `other` into the ring right after `this`.
    ///
    /// # Errors
    /// [`ExecError::ThreadAlreadyLinked`] when `other` is already in
    /// `this`'s ring or in a ring of its own; nothing changes then.
    pub fn introduce_next(&mut self, this: ThreadId, other: ThreadId) -> Result<(), ExecError> {
        let _irq = InterruptGuard::new();
        if !self.thread(other)?.is_alone() || self.ring(this).any(|id| id == other) {
            return Err(ExecError::ThreadAlreadyLinked);
        }

        let old_next = self.thread(this)?.next;
        self.thread_mut(this)?.next = other;
        self.thread_mut(old_next)?.prev = other;
        let inserted = self.thread_mut(other)?;
        inserted.prev = this;
        inserted.next = old_next;
        Ok(())
    }

    /// Takes the thread out of its ring, leaving it linked to itself.
    ///
    /// # Errors
    /// [`ExecError::UnknownThread`].
    pub fn unlink(&mut self, id: ThreadId) -> Result<(), ExecError> {
        let _irq = InterruptGuard::new();
        let thread = self.thread(id)?;
        let (prev, next) = (thread.prev, thread.next);
        self.thread_mut(prev)?.next = next;
        self.thread_mut(next)?.prev = prev;
        let thread = self.thread_mut(id)?;
        thread.prev = id;
        thread.next = id;
        Ok(())
    }

    /// Walks the ring once, starting at `start`.
    pub const fn ring(&self, start: ThreadId) -> Ring<'_, 'p, S, N> {
        Ring {
            scheduler: self,
            start,
            next: Some(start),
            left: N,
        }
    }

    /// Makes `target` the running thread once the current interrupt
    /// returns through `dest`.
    ///
    /// The address space is switched first. If that fails, the error is
    /// returned and neither `dest` nor any thread or core state changed.
    /// Otherwise `dest` is saved into the outgoing thread and replaced by
    /// `target`'s registers, keeping its vector and error code.
    ///
    /// # Errors
    /// - [`ExecError::UnknownThread`] and [`ExecError::InvalidTransition`]
    ///   for targets that cannot run.
    /// - Failures of [`Process::switch_to`].
    pub fn switch_to<P>(
        &mut self,
        target: ThreadId,
        dest: &mut ThreadState,
        platform: &mut P,
    ) -> Result<(), ExecError>
    where
        P: SwitchPlatform<Space = S>,
    {
        let _irq = InterruptGuard::new();
        let incoming = self.thread(target)?;
        if incoming.status != ThreadStatus::Active {
            return Err(ExecError::InvalidTransition {
                thread: target,
                status: incoming.status,
            });
        }
        let owner = incoming.owner;

        match self.cpu.active_thread {
            Some(current) if current == target => return Ok(()),
            Some(current) => {
                let from = self.thread(current)?.owner;
                if !core::ptr::eq(from, owner) {
                    from.switch_to(owner, platform)?;
                }
                let outgoing = self.thread_mut(current)?;
                outgoing.state = *dest;
                if let Some(area) = outgoing.extended.as_mut() {
                    platform.save_extended(area);
                }
            }
            None => owner.enter(platform)?,
        }

        let incoming = self.thread(target)?;
        let top = incoming.stack.top();
        platform.set_kernel_stack_top(top);

        let (vector, error_code) = (dest.vector, dest.error_code);
        *dest = incoming.state;
        dest.vector = vector;
        dest.error_code = error_code;
        if let Some(area) = incoming.extended.as_ref() {
            platform.restore_extended(area);
        }

        self.cpu.active_thread = Some(target);
        self.cpu.kernel_stack_top = top;
        log::trace!("core {}: switched to thread {target}", self.cpu.index);
        Ok(())
    }

    /// Switches to the thread after the current one in the ring.
    ///
    /// # Errors
    /// [`ExecError::NoActiveThread`] before the first switch, otherwise as
    /// [`switch_to`](Self::switch_to).
    pub fn switch_to_next<P>(&mut self, dest: &mut ThreadState, platform: &mut P) -> Result<(), ExecError>
    where
        P: SwitchPlatform<Space = S>,
    {
        let current = self.cpu.active_thread.ok_or(ExecError::NoActiveThread)?;
        let next = self.thread(current)?.next;
        self.switch_to(next, dest, platform)?;
        if self.thread(current)?.status == ThreadStatus::Terminating {
            self.unlink(current)?;
        }
        Ok(())
    }
}

/// Thread ids around a ring, each once.
pub struct Ring<'s, 'p, S, const N: usize> {
    scheduler: &'s Scheduler<'p, S, N>,
    start: ThreadId,
    next: Option<ThreadId>,
    left: usize,
}

impl<S, const N: usize> Iterator for Ring<'_, '_, S, N> {
    type Item = ThreadId;

    fn next(&mut self) -> Option<ThreadId> {
        let id = self.next?;
        let thread = self.scheduler.thread(id).ok()?;
        self.left = self.left.checked_sub(1)?;
        self.next = (thread.next != self.start).then_some(thread.next);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcessId;
    use kernel_vmem::VirtualAddress;

    struct Nop;

    impl SwitchPlatform for Nop {
        type Space = ();
        fn switch_address_space(&mut self, _: &()) -> Result<(), ExecError> {
            Ok(())
        }
        fn save_extended(&mut self, _: &mut ExtendedState) {}
        fn restore_extended(&mut self, _: &ExtendedState) {}
        fn set_kernel_stack_top(&mut self, _: VirtualAddress) {}
    }

    fn stack(n: u64) -> KernelStack {
        KernelStack::new(VirtualAddress::new(n * 0x1_0000), VirtualAddress::new(n * 0x1_0000 + 0x8000))
            .unwrap()
    }

    #[test]
    fn slots_are_reused() {
        let process = Process::new(ProcessId(1), ());
        let mut sched = Scheduler::<(), 4>::new(CpuData::new(0, 0));
        let a = sched.create_thread(&process, stack(1), 0x1000, 0).unwrap();
        let b = sched.create_thread(&process, stack(2), 0x1000, 0).unwrap();
        sched.destroy(a).unwrap();
        assert!(matches!(sched.thread(a), Err(ExecError::UnknownThread(id)) if id == a));
        let c = sched.create_thread(&process, stack(3), 0x1000, 0).unwrap();
        assert_eq!(c, a);
        assert_ne!(c, b);
        assert_eq!(sched.thread_count(), 2);
    }

    #[test]
    fn table_fills_up() {
        let process = Process::new(ProcessId(1), ());
        let mut sched = Scheduler::<(), 2>::new(CpuData::new(0, 0));
        sched.create_thread(&process, stack(1), 0x1000, 0).unwrap();
        sched.create_thread(&process, stack(2), 0x1000, 0).unwrap();
        assert_eq!(
            sched.create_thread(&process, stack(3), 0x1000, 0),
            Err(ExecError::TooManyThreads)
        );
    }

    #[test]
    fn activation_happens_once() {
        let process = Process::new(ProcessId(1), ());
        let mut sched = Scheduler::<()>::new(CpuData::new(0, 0));
        let a = sched.create_thread(&process, stack(1), 0x1000, 0).unwrap();
        let mut dest = ThreadState::default();

        assert_eq!(
            sched.switch_to(a, &mut dest, &mut Nop),
            Err(ExecError::InvalidTransition {
                thread: a,
                status: ThreadStatus::Constructing
            })
        );
        sched.activate(a).unwrap();
        assert_eq!(
            sched.activate(a),
            Err(ExecError::InvalidTransition {
                thread: a,
                status: ThreadStatus::Active
            })
        );
        sched.switch_to(a, &mut dest, &mut Nop).unwrap();
        assert_eq!(sched.destroy(a), Err(ExecError::ThreadRunning(a)));
    }

    #[test]
    fn termination_takes_threads_out_of_rotation() {
        let process = Process::new(ProcessId(1), ());
        let mut sched = Scheduler::<()>::new(CpuData::new(0, 0));
        let ids: Vec<_> = (1..=3)
            .map(|n| {
                let id = sched.create_thread(&process, stack(n), 0x1000 * n, 0).unwrap();
                sched.activate(id).unwrap();
                id
            })
            .collect();
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        sched.introduce_next(a, b).unwrap();
        sched.introduce_next(b, c).unwrap();
        let mut dest = ThreadState::default();
        sched.switch_to(a, &mut dest, &mut Nop).unwrap();

        // Not running: out of the ring right away.
        sched.terminate(b).unwrap();
        assert_eq!(sched.ring(a).collect::<Vec<_>>(), [a, c]);
        assert!(sched.thread(b).unwrap().is_alone());
        assert_eq!(
            sched.terminate(b),
            Err(ExecError::InvalidTransition {
                thread: b,
                status: ThreadStatus::Terminating
            })
        );
        assert!(sched.switch_to(b, &mut dest, &mut Nop).is_err());

        // Running: leaves once the core has moved on.
        sched.terminate(a).unwrap();
        assert_eq!(sched.ring(a).collect::<Vec<_>>(), [a, c]);
        sched.switch_to_next(&mut dest, &mut Nop).unwrap();
        assert_eq!(sched.current().map(Thread::id), Some(c));
        assert!(sched.thread(c).unwrap().is_alone());
        sched.destroy(a).unwrap();
        sched.destroy(b).unwrap();

        // A constructing thread may be abandoned too.
        let d = sched.create_thread(&process, stack(4), 0x4000, 0).unwrap();
        sched.terminate(d).unwrap();
        assert_eq!(sched.thread(d).unwrap().status(), ThreadStatus::Terminating);
        assert_eq!(sched.activate(d).map_err(|_| ()), Err(()));
    }
}
