//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses, page frames and virtual
//! address ranges used throughout the memory manager.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`MemoryAddress`] | A raw 64-bit address, either physical or virtual. |
//! | [`VirtualAddress`] | An address in a (page-table translated) address space. |
//! | [`PhysicalAddress`] | An address on the physical bus (RAM or MMIO). |
//! | [`PhysicalPage`] / [`VirtualPage`] | A page-aligned base address of one 4 KiB page. |
//! | [`Range`] | A half-open `[base, base + size)` interval of virtual addresses. |
//!
//! The address wrappers are zero-cost `u64` newtypes that keep virtual and
//! physical values apart at compile time.
//!
//! ## Arithmetic
//!
//! Address arithmetic never wraps silently. The `checked_*` helpers return
//! `None` on overflow; the `+` operator panics instead of wrapping.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_7FFF_0000_1234);
//! assert_eq!(va.page_base().as_u64(), 0x0000_7FFF_0000_1000);
//! assert_eq!(va.offset_in_page(), 0x234);
//! assert!(VirtualAddress::new(u64::MAX).checked_add(1).is_none());
//! ```
//!
//! ## Ranges
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let outer = Range::new(VirtualAddress::new(0), 100);
//! let inner = Range::new(VirtualAddress::new(30), 20);
//! let parts: Vec<Range> = outer.carve(inner).iter().collect();
//! assert_eq!(parts, [Range::new(VirtualAddress::new(0), 30), Range::new(VirtualAddress::new(50), 50)]);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod memory_address;
mod page;
mod physical_address;
mod range;
mod virtual_address;

pub use memory_address::MemoryAddress;
pub use page::{PhysicalPage, VirtualPage};
pub use physical_address::PhysicalAddress;
pub use range::{Carved, Range};
pub use virtual_address::VirtualAddress;

/// Size of a hardware page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2([`PAGE_SIZE`]), i.e. the number of in-page offset bits.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits of an address.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Returns `true` if `value` is a multiple of [`PAGE_SIZE`].
#[inline]
#[must_use]
pub const fn is_page_multiple(value: u64) -> bool {
    value & PAGE_OFFSET_MASK == 0
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
///
/// Returns `None` if the result does not fit into a `u64`.
#[inline]
#[must_use]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert_eq!(a.page_base().as_u64(), 0x12000);
        assert_eq!(a.offset_in_page(), 0x345);
        assert!(!a.is_page_aligned());
        assert!(a.page_base().is_page_aligned());
    }

    #[test]
    fn align_up_checks_overflow() {
        assert_eq!(checked_align_up(0x1001, PAGE_SIZE), Some(0x2000));
        assert_eq!(checked_align_up(0x2000, PAGE_SIZE), Some(0x2000));
        assert_eq!(checked_align_up(u64::MAX - 10, PAGE_SIZE), None);
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
        assert_eq!(va.page_base().as_u64(), 0xFFFF_FFFF_8000_1000);
        assert_eq!(va.offset_in_page(), 0x234);

        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        assert_eq!(pa.page().base().as_u64(), 0x0000_0010_2000_0000);
        assert_eq!(pa.offset_in_page(), 0x42);
    }
}
