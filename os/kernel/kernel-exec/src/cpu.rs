use crate::ThreadId;
use kernel_vmem::VirtualAddress;

/// State private to one core. Never locked; only its core touches it.
#[derive(Debug, Default)]
pub struct CpuData {
    /// Logical index, as handed out by the core index source.
    pub index: u32,
    pub apic_id: u32,
    /// Timer interrupts taken on this core.
    pub ticks: u64,
    pub(crate) active_thread: Option<ThreadId>,
    pub(crate) kernel_stack_top: VirtualAddress,
}

impl CpuData {
    #[must_use]
    pub const fn new(index: u32, apic_id: u32) -> Self {
        Self {
            index,
            apic_id,
            ticks: 0,
            active_thread: None,
            kernel_stack_top: VirtualAddress::new(0),
        }
    }

    #[must_use]
    pub const fn active_thread(&self) -> Option<ThreadId> {
        self.active_thread
    }

    /// Top of the active thread's kernel stack.
    #[must_use]
    pub const fn kernel_stack_top(&self) -> VirtualAddress {
        self.kernel_stack_top
    }
}
