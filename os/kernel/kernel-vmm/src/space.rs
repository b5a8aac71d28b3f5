use crate::Vas;
use kernel_alloc::PoolProvider;
use kernel_sync::TicketMutex;
use kernel_vmem::PhysicalAddress;

/// A process's page-table root and userland regions.
///
/// Created by [`Vmm::create_space`](crate::Vmm::create_space), which links
/// the kernel half in.
pub struct ProcessSpace<U: PoolProvider> {
    pub(crate) root: PhysicalAddress,
    /// Serializes changes to the user half of the tables.
    pub(crate) tables: TicketMutex<()>,
    pub(crate) vas: Vas<U>,
}

impl<U: PoolProvider> ProcessSpace<U> {
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn vas(&self) -> &Vas<U> {
        &self.vas
    }
}

impl<U: PoolProvider> core::fmt::Debug for ProcessSpace<U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessSpace")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
