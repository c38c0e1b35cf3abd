use crate::{PAGE_OFFSET_MASK, checked_align_up};
use core::fmt;
use core::ops::Add;

/// Principal raw memory address ([virtual](super::VirtualAddress) or [physical](super::PhysicalAddress)).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u64);

impl MemoryAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The base of the 4 KiB page containing this address (lower bits zeroed).
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }

    /// The offset of this address within its 4 KiB page.
    #[inline]
    #[must_use]
    pub const fn offset_in_page(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.offset_in_page() == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_sub(self, rhs: u64) -> Option<Self> {
        match self.0.checked_sub(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Round up to a multiple of `alignment` (a power of two).
    #[inline]
    #[must_use]
    pub const fn checked_align_up(self, alignment: u64) -> Option<Self> {
        match checked_align_up(self.0, alignment) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 0xHHHH_HHHH_HHHH_HHHH style
        write!(f, "MemoryAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for MemoryAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<MemoryAddress> for u64 {
    #[inline]
    fn from(a: MemoryAddress) -> Self {
        a.as_u64()
    }
}

impl Add<u64> for MemoryAddress {
    type Output = Self;

    /// # Panics
    /// Panics if the result does not fit into 64 bits.
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        match self.checked_add(rhs) {
            Some(v) => v,
            None => panic!("memory address overflow: {self} + {rhs:#x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_arithmetic() {
        let a = MemoryAddress::new(0x1000);
        assert_eq!(a.checked_add(0x10), Some(MemoryAddress::new(0x1010)));
        assert_eq!(a.checked_sub(0x2000), None);
        assert_eq!(MemoryAddress::new(u64::MAX).checked_add(1), None);
        assert_eq!(
            MemoryAddress::new(0x1001).checked_align_up(0x1000),
            Some(MemoryAddress::new(0x2000))
        );
    }

    #[test]
    #[should_panic(expected = "memory address overflow")]
    fn add_operator_does_not_wrap() {
        let _ = MemoryAddress::new(u64::MAX - 1) + 2;
    }
}
