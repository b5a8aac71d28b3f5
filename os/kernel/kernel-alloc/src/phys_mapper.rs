//! # HHDM-based `PhysMapper`
//!
//! Every physical address is reachable at `HHDM_BASE + pa` once the
//! higher-half direct map is installed.

use kernel_info::memory::HHDM_BASE;
use kernel_vmem::{PhysMapper, PhysicalAddress, VirtualAddress};

/// [`PhysMapper`] over the kernel's higher-half direct map.
///
/// # Safety
/// The direct map must cover every address passed in.
#[derive(Debug, Default, Clone, Copy)]
pub struct HhdmPhysMapper;

impl HhdmPhysMapper {
    #[inline]
    #[must_use]
    pub const fn virtual_of(pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(HHDM_BASE + pa.as_u64())
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = Self::virtual_of(pa).as_u64() as *mut T;
        // SAFETY: caller guarantees `pa` is covered by the direct map.
        unsafe { &mut *va }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_into_the_direct_map() {
        let va = HhdmPhysMapper::virtual_of(PhysicalAddress::new(0x1234_5000));
        assert_eq!(va.as_u64(), HHDM_BASE + 0x1234_5000);
        assert!(va.is_canonical());
    }
}
