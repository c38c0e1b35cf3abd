use crate::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use core::fmt;

/// A physical 4 KiB frame, identified by its page-aligned base address.
///
/// ### Invariants
/// - The low [`PAGE_SHIFT`] bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(PhysicalAddress);

impl PhysicalPage {
    /// Frame that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: PhysicalAddress) -> Self {
        Self(addr.page_base())
    }

    /// Create from an address that must already be page aligned.
    ///
    /// # Panics
    /// Panics if `addr` is not page aligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Self {
        assert!(addr.is_page_aligned(), "unaligned physical page address");
        Self(addr)
    }

    /// Frame number (`base / PAGE_SIZE`).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0.as_u64() >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    /// The frame `count` pages after this one.
    #[inline]
    #[must_use]
    pub const fn checked_offset(self, count: u64) -> Option<Self> {
        match count.checked_mul(PAGE_SIZE) {
            Some(bytes) => match self.0.checked_add(bytes) {
                Some(a) => Some(Self(a)),
                None => None,
            },
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage({:#018X})", self.0.as_u64())
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/4K", self.0.as_u64())
    }
}

/// A virtual 4 KiB page, identified by its page-aligned base address.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    /// Page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        Self(addr.page_base())
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage({:#018X})", self.0.as_u64())
    }
}

impl TryFrom<VirtualAddress> for VirtualPage {
    type Error = ();

    #[inline]
    fn try_from(va: VirtualAddress) -> Result<Self, ()> {
        if va.is_page_aligned() {
            Ok(Self(va))
        } else {
            Err(())
        }
    }
}

impl TryFrom<PhysicalAddress> for PhysicalPage {
    type Error = ();

    #[inline]
    fn try_from(pa: PhysicalAddress) -> Result<Self, ()> {
        if pa.is_page_aligned() {
            Ok(Self(pa))
        } else {
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_numbers_and_offsets() {
        let p = PhysicalPage::containing_address(PhysicalAddress::new(0x5432));
        assert_eq!(p.base().as_u64(), 0x5000);
        assert_eq!(p.number(), 5);
        assert_eq!(p.checked_offset(2).map(PhysicalPage::number), Some(7));
        assert_eq!(
            PhysicalPage::containing_address(PhysicalAddress::new(u64::MAX)).checked_offset(1),
            None
        );
    }

    #[test]
    fn try_from_requires_alignment() {
        assert!(VirtualPage::try_from(VirtualAddress::new(0x2000)).is_ok());
        assert!(VirtualPage::try_from(VirtualAddress::new(0x2001)).is_err());
        assert!(PhysicalPage::try_from(PhysicalAddress::new(0x3000)).is_ok());
    }
}
