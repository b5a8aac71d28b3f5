//! # Virtual and Physical Memory Addresses

use crate::PAGE_SIZE;
use core::fmt;
use core::ops::{Add, Sub};

/// A **virtual** address in some address space.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct VirtualAddress(u64);

/// A **physical** (bus) address.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct PhysicalAddress(u64);

macro_rules! address_common {
    ($t:ident, $tag:literal) => {
        impl $t {
            #[inline]
            #[must_use]
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            #[inline]
            #[must_use]
            pub const fn is_page_aligned(self) -> bool {
                self.0 & (PAGE_SIZE - 1) == 0
            }

            #[inline]
            #[must_use]
            pub const fn page_base(self) -> Self {
                Self(crate::align_down(self.0, PAGE_SIZE))
            }

            #[inline]
            #[must_use]
            pub const fn page_offset(self) -> u64 {
                self.0 & (PAGE_SIZE - 1)
            }
        }

        impl Add<u64> for $t {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$t> for $t {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: Self) -> u64 {
                self.0 - rhs.0
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "({:#018x})"), self.0)
            }
        }

        impl fmt::LowerHex for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

address_common!(VirtualAddress, "VA");
address_common!(PhysicalAddress, "PA");

impl VirtualAddress {
    /// Bits 63..48 must replicate bit 47.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn is_canonical(self) -> bool {
        (((self.0 << 16) as i64) >> 16) as u64 == self.0
    }

    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    /// Table indices for PML4, PDPT, PD and PT, in walk order.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_indices(self) -> [usize; 4] {
        let v = self.0;
        [
            ((v >> 39) & 0x1ff) as usize,
            ((v >> 30) & 0x1ff) as usize,
            ((v >> 21) & 0x1ff) as usize,
            ((v >> 12) & 0x1ff) as usize,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_split_the_address() {
        let va = VirtualAddress::new(0xFFFF_8888_0123_4567);
        assert_eq!(va.table_indices(), [0x111, 0x000, 0x009, 0x034]);
        assert_eq!(va.page_offset(), 0x567);
        assert_eq!(va.page_base(), VirtualAddress::new(0xFFFF_8888_0123_4000));
    }

    #[test]
    fn canonical_forms() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
    }

    #[test]
    fn debug_is_tagged() {
        assert_eq!(format!("{:?}", VirtualAddress::new(0x1000)), "VA(0x0000000000001000)");
        assert_eq!(format!("{:?}", PhysicalAddress::new(0x2000)), "PA(0x0000000000002000)");
    }
}
