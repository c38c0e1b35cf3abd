//! # HHDM-based `PhysMapper`
//!
//! With a higher-half direct map every physical address is visible at
//! `HHDM_BASE + pa`. This is the mapper the kernel hands to the memory
//! manager; hosted tests use their own.
//!
//! ```rust
//! use kernel_alloc::phys_mapper::hhdm_address;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let va = hhdm_address(PhysicalAddress::new(0x1234_0000)).unwrap();
//! assert_eq!(va.as_u64(), kernel_info::memory::HHDM_BASE + 0x1234_0000);
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// Virtual address under which the direct map shows `pa`.
///
/// `None` if the sum leaves the 64-bit address space.
#[inline]
#[must_use]
pub const fn hhdm_address(pa: PhysicalAddress) -> Option<VirtualAddress> {
    match HHDM_BASE.checked_add(pa.as_u64()) {
        Some(va) => Some(VirtualAddress::new(va)),
        None => None,
    }
}

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// # Safety
/// The HHDM must be installed and cover every frame passed in.
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = HHDM_BASE.wrapping_add(pa.as_u64()) as *mut T;
        // SAFETY: Caller guarantees the frame is mapped via the HHDM and unaliased.
        unsafe { &mut *va }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_offsets_by_base() {
        assert_eq!(
            hhdm_address(PhysicalAddress::zero()),
            Some(VirtualAddress::new(HHDM_BASE))
        );
        assert_eq!(hhdm_address(PhysicalAddress::new(u64::MAX)), None);
    }
}
