use crate::{ExecError, Process};
use core::fmt;
use core::num::NonZeroU16;
use kernel_info::memory::STACK_ALIGN;
use kernel_interrupts::{IsrState, KERNEL_CS};
use kernel_vmem::VirtualAddress;

/// A thread's saved registers: exactly what the interrupt entry pushes.
pub type ThreadState = IsrState;

/// Kernel data selector used as `ss` for kernel threads.
pub const KERNEL_SS: u16 = 0x10;

const RFLAGS_RESERVED: u64 = 1 << 1;
const RFLAGS_IF: u64 = 1 << 9;

/// Slot in a [`Scheduler`](crate::Scheduler)'s thread table, plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroU16);

impl ThreadId {
    pub(crate) const fn from_slot(slot: usize) -> Option<Self> {
        if slot >= u16::MAX as usize {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        match NonZeroU16::new(slot as u16 + 1) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    pub(crate) const fn slot(self) -> usize {
        self.0.get() as usize - 1
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Constructing,
    Active,
    /// Never switched to again; leaves its ring once no core runs it.
    Terminating,
}

/// Bounds of a thread's kernel stack, 16-byte aligned inwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    bottom: VirtualAddress,
    top: VirtualAddress,
}

impl KernelStack {
    /// # Errors
    /// [`ExecError::InvalidStack`] for null bounds or when nothing is left
    /// after alignment.
    pub const fn new(bottom: VirtualAddress, top: VirtualAddress) -> Result<Self, ExecError> {
        let aligned_top = top.as_u64() & !(STACK_ALIGN - 1);
        let Some(aligned_bottom) = bottom.as_u64().checked_next_multiple_of(STACK_ALIGN) else {
            return Err(ExecError::InvalidStack { bottom, top });
        };
        if aligned_bottom == 0 || aligned_top <= aligned_bottom {
            return Err(ExecError::InvalidStack { bottom, top });
        }
        Ok(Self {
            bottom: VirtualAddress::new(aligned_bottom),
            top: VirtualAddress::new(aligned_top),
        })
    }

    #[must_use]
    pub const fn bottom(&self) -> VirtualAddress {
        self.bottom
    }

    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        self.top
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.top.as_u64() - self.bottom.as_u64()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `fxsave64` image of the FPU and SSE registers.
#[repr(C, align(16))]
#[derive(Clone, PartialEq, Eq)]
pub struct ExtendedState {
    pub area: [u8; 512],
}

impl ExtendedState {
    pub const fn new() -> Self {
        Self { area: [0; 512] }
    }
}

impl Default for ExtendedState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExtendedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedState").finish_non_exhaustive()
    }
}

/// Register image for a thread that has never run.
///
/// Resuming it looks like returning from an interrupt into `entry(arg)`
/// at the top of a clean kernel stack with interrupts enabled.
#[must_use]
pub const fn initialize_thread_state(entry: u64, arg: u64, stack: &KernelStack) -> ThreadState {
    ThreadState {
        r15: 0,
        r14: 0,
        r13: 0,
        r12: 0,
        r11: 0,
        r10: 0,
        r9: 0,
        r8: 0,
        rbp: 0,
        rdi: arg,
        rsi: 0,
        rdx: 0,
        rcx: 0,
        rbx: 0,
        rax: 0,
        vector: 0,
        error_code: 0,
        rip: entry,
        cs: KERNEL_CS as u64,
        rflags: RFLAGS_RESERVED | RFLAGS_IF,
        rsp: stack.top.as_u64(),
        ss: KERNEL_SS as u64,
    }
}

/// A unit of execution owned by a [`Process`].
pub struct Thread<'p, S> {
    pub(crate) id: ThreadId,
    pub(crate) owner: &'p Process<S>,
    pub(crate) status: ThreadStatus,
    pub(crate) stack: KernelStack,
    pub(crate) entry: u64,
    pub(crate) state: ThreadState,
    pub(crate) extended: Option<ExtendedState>,
    pub(crate) prev: ThreadId,
    pub(crate) next: ThreadId,
}

impl<'p, S> Thread<'p, S> {
    pub(crate) const fn new(
        id: ThreadId,
        owner: &'p Process<S>,
        stack: KernelStack,
        entry: u64,
        arg: u64,
    ) -> Self {
        Self {
            id,
            owner,
            status: ThreadStatus::Constructing,
            stack,
            entry,
            state: initialize_thread_state(entry, arg, &stack),
            extended: None,
            prev: id,
            next: id,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub const fn owner(&self) -> &'p Process<S> {
        self.owner
    }

    #[must_use]
    pub const fn status(&self) -> ThreadStatus {
        self.status
    }

    #[must_use]
    pub const fn stack(&self) -> &KernelStack {
        &self.stack
    }

    #[must_use]
    pub const fn entry_point(&self) -> u64 {
        self.entry
    }

    /// Registers as of the last time the thread was switched out.
    #[must_use]
    pub const fn state(&self) -> &ThreadState {
        &self.state
    }

    #[must_use]
    pub const fn extended_state(&self) -> Option<&ExtendedState> {
        self.extended.as_ref()
    }

    #[must_use]
    pub const fn next(&self) -> ThreadId {
        self.next
    }

    #[must_use]
    pub const fn previous(&self) -> ThreadId {
        self.prev
    }

    /// Whether the ring holds nothing but this thread.
    #[must_use]
    pub fn is_alone(&self) -> bool {
        self.next == self.id
    }
}

impl<S> fmt::Debug for Thread<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("owner", &self.owner.id())
            .field("status", &self.status)
            .field("rip", &format_args!("{:#x}", self.state.rip))
            .field("prev", &self.prev)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}
