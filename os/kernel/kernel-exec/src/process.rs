use crate::{ExecError, SwitchPlatform};
use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use kernel_info::memory::{USERLAND_END, USERLAND_START};
use kernel_sync::TicketMutex;
use kernel_vmem::{PAGE_SIZE, VirtualAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessStatus {
    Constructing = 0,
    Active = 1,
    Terminating = 2,
}

impl ProcessStatus {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Constructing,
            1 => Self::Active,
            _ => Self::Terminating,
        }
    }
}

/// An address space and the threads running in it.
///
/// Shared by every core that runs one of its threads.
pub struct Process<S> {
    id: ProcessId,
    space: S,
    status: AtomicU8,
    active_cores: AtomicUsize,
    /// End of the userland heap; grows upwards.
    heap_cursor: AtomicU64,
    heap_lock: TicketMutex<()>,
}

impl<S> Process<S> {
    /// A process in [`ProcessStatus::Constructing`] whose heap starts at the
    /// bottom of userland.
    pub const fn new(id: ProcessId, space: S) -> Self {
        Self {
            id,
            space,
            status: AtomicU8::new(ProcessStatus::Constructing as u8),
            active_cores: AtomicUsize::new(0),
            heap_cursor: AtomicU64::new(USERLAND_START),
            heap_lock: TicketMutex::new(()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ProcessId {
        self.id
    }

    #[must_use]
    pub const fn space(&self) -> &S {
        &self.space
    }

    #[must_use]
    pub fn status(&self) -> ProcessStatus {
        ProcessStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Moves the process from construction into service.
    ///
    /// # Errors
    /// [`ExecError::InvalidProcessTransition`] unless it is still constructing.
    pub fn activate(&self) -> Result<(), ExecError> {
        self.transition(ProcessStatus::Constructing, ProcessStatus::Active)
    }

    /// Marks the process as going away. Its heap stops growing and no core
    /// switches into it any more.
    ///
    /// # Errors
    /// [`ExecError::InvalidProcessTransition`] when it already is.
    pub fn terminate(&self) -> Result<(), ExecError> {
        let _heap = self.heap_lock.lock_uninterruptible();
        let mut status = self.status();
        loop {
            if status == ProcessStatus::Terminating {
                return Err(self.invalid(status));
            }
            match self.transition(status, ProcessStatus::Terminating) {
                Ok(()) => break,
                Err(_) => status = self.status(),
            }
        }
        log::debug!(
            "process {:?} terminating on {} cores",
            self.id,
            self.active_core_count()
        );
        Ok(())
    }

    fn transition(&self, from: ProcessStatus, to: ProcessStatus) -> Result<(), ExecError> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|now| self.invalid(ProcessStatus::from_u8(now)))
    }

    const fn invalid(&self, status: ProcessStatus) -> ExecError {
        ExecError::InvalidProcessTransition {
            process: self.id,
            status,
        }
    }

    /// Number of cores currently running one of this process's threads.
    #[must_use]
    pub fn active_core_count(&self) -> usize {
        self.active_cores.load(Ordering::Acquire)
    }

    /// First address past the userland heap.
    #[must_use]
    pub fn heap_cursor(&self) -> VirtualAddress {
        VirtualAddress::new(self.heap_cursor.load(Ordering::Acquire))
    }

    /// Grows the userland heap by `pages` pages.
    ///
    /// `back` receives the old cursor and the page count and must make the
    /// pages usable, typically by allocating them in the process's address
    /// space at exactly that address. The cursor only moves when it succeeds.
    /// Returns the start of the new pages.
    ///
    /// # Errors
    /// - [`ExecError::InvalidProcessTransition`] once the process terminates.
    /// - [`ExecError::ArgumentOutOfRange`] for no pages, or past the end of
    ///   userland.
    /// - Whatever `back` returns.
    pub fn extend_heap(
        &self,
        pages: usize,
        back: impl FnOnce(VirtualAddress, usize) -> Result<(), ExecError>,
    ) -> Result<VirtualAddress, ExecError> {
        let _heap = self.heap_lock.lock_uninterruptible();
        let status = self.status();
        if status == ProcessStatus::Terminating {
            return Err(self.invalid(status));
        }

        let start = self.heap_cursor.load(Ordering::Acquire);
        let end = (pages as u64)
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| start.checked_add(bytes))
            .filter(|&end| pages > 0 && end <= USERLAND_END)
            .ok_or(ExecError::ArgumentOutOfRange)?;

        let at = VirtualAddress::new(start);
        back(at, pages)?;
        self.heap_cursor.store(end, Ordering::Release);
        log::trace!("process {:?} heap grown to {end:#x}", self.id);
        Ok(at)
    }

    /// Leaves this process for `other` on the current core.
    ///
    /// # Errors
    /// - [`ExecError::ArgumentOutOfRange`] when `other` is this process.
    /// - [`ExecError::InvalidProcessTransition`] when `other` terminates.
    /// - Whatever the address space switch reports; the core counts are
    ///   only moved once it succeeded.
    pub fn switch_to<P>(&self, other: &Self, platform: &mut P) -> Result<(), ExecError>
    where
        P: SwitchPlatform<Space = S>,
    {
        if core::ptr::eq(self, other) {
            return Err(ExecError::ArgumentOutOfRange);
        }
        other.check_enterable()?;
        platform.switch_address_space(&other.space)?;
        other.active_cores.fetch_add(1, Ordering::AcqRel);
        self.leave();
        Ok(())
    }

    /// Starts running this process on a core that ran none before.
    pub(crate) fn enter<P>(&self, platform: &mut P) -> Result<(), ExecError>
    where
        P: SwitchPlatform<Space = S>,
    {
        self.check_enterable()?;
        platform.switch_address_space(&self.space)?;
        self.active_cores.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn check_enterable(&self) -> Result<(), ExecError> {
        match self.status() {
            ProcessStatus::Terminating => Err(self.invalid(ProcessStatus::Terminating)),
            _ => Ok(()),
        }
    }

    fn leave(&self) {
        let before = self.active_cores.fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(before, 0, "process {:?} left by an idle core", self.id);
    }
}

impl<S: core::fmt::Debug> core::fmt::Debug for Process<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("space", &self.space)
            .field("status", &self.status())
            .field("active_cores", &self.active_core_count())
            .field("heap_cursor", &self.heap_cursor())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_runs_forwards_only() {
        let p = Process::new(ProcessId(3), ());
        assert_eq!(p.status(), ProcessStatus::Constructing);
        p.activate().unwrap();
        assert_eq!(p.status(), ProcessStatus::Active);
        assert_eq!(
            p.activate(),
            Err(ExecError::InvalidProcessTransition {
                process: ProcessId(3),
                status: ProcessStatus::Active
            })
        );
        p.terminate().unwrap();
        assert_eq!(p.status(), ProcessStatus::Terminating);
        assert!(p.terminate().is_err());
        assert!(p.activate().is_err());

        // Construction may be abandoned too.
        let q = Process::new(ProcessId(4), ());
        q.terminate().unwrap();
        assert_eq!(q.status(), ProcessStatus::Terminating);
    }

    #[test]
    fn heap_grows_only_when_backed() {
        let p = Process::new(ProcessId(1), ());
        let base = VirtualAddress::new(USERLAND_START);
        assert_eq!(p.heap_cursor(), base);

        let at = p
            .extend_heap(2, |at, pages| {
                assert_eq!((at, pages), (base, 2));
                Ok(())
            })
            .unwrap();
        assert_eq!(at, base);
        assert_eq!(p.heap_cursor(), base + 2 * PAGE_SIZE);

        assert_eq!(
            p.extend_heap(1, |_, _| Err(ExecError::ArgumentOutOfRange)),
            Err(ExecError::ArgumentOutOfRange)
        );
        assert_eq!(p.heap_cursor(), base + 2 * PAGE_SIZE);

        assert_eq!(p.extend_heap(0, |_, _| Ok(())), Err(ExecError::ArgumentOutOfRange));
        assert_eq!(
            p.extend_heap(usize::MAX, |_, _| Ok(())),
            Err(ExecError::ArgumentOutOfRange)
        );
    }

    #[test]
    fn terminating_processes_stop_growing() {
        let p = Process::new(ProcessId(1), ());
        p.activate().unwrap();
        p.terminate().unwrap();
        let mut called = false;
        assert!(matches!(
            p.extend_heap(1, |_, _| {
                called = true;
                Ok(())
            }),
            Err(ExecError::InvalidProcessTransition { .. })
        ));
        assert!(!called);
        assert_eq!(p.heap_cursor(), VirtualAddress::new(USERLAND_START));
    }

    #[test]
    fn concurrent_growth_hands_out_disjoint_ranges() {
        use std::sync::{Arc, Barrier};

        let p = Process::new(ProcessId(1), ());
        let barrier = Arc::new(Barrier::new(4));
        let mut starts = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    let p = &p;
                    s.spawn(move || {
                        barrier.wait();
                        (0..8)
                            .map(|_| p.extend_heap(3, |_, _| Ok(())).unwrap().as_u64())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        starts.sort_unstable();
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], 3 * PAGE_SIZE);
        }
        assert_eq!(p.heap_cursor(), VirtualAddress::new(USERLAND_START + 32 * 3 * PAGE_SIZE));
    }
}
