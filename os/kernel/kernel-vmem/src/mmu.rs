use crate::{PhysicalAddress, VirtualAddress};

/// The processor's view of paging: which root is loaded and its TLB.
pub trait Mmu {
    /// Root table currently loaded (`cr3`).
    fn current_root(&self) -> PhysicalAddress;

    /// Loads `root` as the active page-table root.
    ///
    /// # Safety
    /// Code, stack and data in use must be mapped identically in `root`.
    unsafe fn load_root(&self, root: PhysicalAddress);

    /// Drops any cached translation for `va` on this core.
    fn invalidate_page(&self, va: VirtualAddress);
}

/// `cr3` / `invlpg`.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareMmu;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl Mmu for HardwareMmu {
    fn current_root(&self) -> PhysicalAddress {
        let cr3: u64;
        unsafe { core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags)) }
        PhysicalAddress::new(crate::align_down(cr3, crate::PAGE_SIZE))
    }

    unsafe fn load_root(&self, root: PhysicalAddress) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }
}
