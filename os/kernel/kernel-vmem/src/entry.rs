//! # Translation Table Entries
//!
//! - [`PageEntry`]: the raw 64-bit entry, used at every level of the tree.
//! - [`PageFlags`]: the semantic permission/caching view a caller asks for.
//!
//! Non-leaf entries carry the permissions that apply to everything below
//! them; the tree links intermediate tables permissively and restricts at
//! the leaf.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress};
use utils_accessors_derive::Setters;

/// A single 64-bit translation table entry in its raw bitfield form.
///
/// | Bits   | Field            |
/// |--------|------------------|
/// | 0      | present          |
/// | 1      | writable         |
/// | 2      | user             |
/// | 3      | write-through    |
/// | 4      | cache disable    |
/// | 5      | accessed         |
/// | 6      | dirty (leaf)     |
/// | 7      | reserved, zero   |
/// | 8      | global (leaf)    |
/// | 9–11   | OS available     |
/// | 12–51  | frame bits 51:12 |
/// | 52–62  | OS available     |
/// | 63     | no-execute       |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntry;
/// let e = PageEntry::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_frame(PhysicalAddress::new(0x12_3000));
/// assert!(e.present());
/// assert_eq!(e.frame().as_u64(), 0x12_3000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    /// Set by the MMU on first access.
    pub accessed: bool,
    /// Set by the MMU on first write through a leaf.
    pub dirty: bool,
    #[bits(1)]
    __reserved: u8,
    pub global: bool,
    #[bits(3)]
    pub os_available_low: u8,
    #[bits(40)]
    frame_bits: u64,
    #[bits(11)]
    pub os_available_high: u16,
    pub no_execute: bool,
}

impl PageEntry {
    /// The all-zero, non-present entry.
    pub const EMPTY: Self = Self::new();

    /// Page-aligned physical base stored in the entry.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << PAGE_SHIFT)
    }

    #[inline]
    pub const fn set_frame(&mut self, frame: PhysicalAddress) {
        debug_assert!(frame.is_page_aligned());
        self.set_frame_bits(frame.as_u64() >> PAGE_SHIFT);
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(mut self, frame: PhysicalAddress) -> Self {
        self.set_frame(frame);
        self
    }

    /// Entry linking to a next-level table.
    ///
    /// Intermediate links are writable and executable; `user` opens the subtree
    /// to userspace. The leaf decides the effective permissions.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(table)
    }

    /// Leaf entry mapping one 4 KiB `frame` with `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalAddress, flags: PageFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.writable)
            .with_user(flags.user)
            .with_no_execute(flags.no_execute)
            .with_global(flags.global)
            .with_write_through(flags.write_through)
            .with_cache_disable(flags.cache_disable)
            .with_frame(frame)
    }

    /// The semantic permission view of this entry.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        PageFlags {
            writable: self.writable(),
            user: self.user(),
            no_execute: self.no_execute(),
            global: self.global(),
            write_through: self.write_through(),
            cache_disable: self.cache_disable(),
        }
    }
}

/// Permissions and caching policy of a leaf mapping.
///
/// Built with the generated `with_*` setters:
///
/// ```rust
/// # use kernel_vmem::PageFlags;
/// let f = PageFlags::user_read_only().with_writable(true);
/// assert!(f.user && f.writable && f.no_execute);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Setters)]
#[allow(clippy::struct_excessive_bools)]
pub struct PageFlags {
    pub writable: bool,
    pub user: bool,
    pub no_execute: bool,
    /// Survives address space switches; kernel mappings only.
    pub global: bool,
    pub write_through: bool,
    pub cache_disable: bool,
}

impl PageFlags {
    /// Kernel read/write data, not executable.
    #[inline]
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self {
            writable: true,
            user: false,
            no_execute: true,
            global: true,
            write_through: false,
            cache_disable: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn user_read_only() -> Self {
        Self {
            writable: false,
            user: true,
            no_execute: true,
            global: false,
            write_through: false,
            cache_disable: false,
        }
    }

    /// Device memory: uncached, never executable.
    #[inline]
    #[must_use]
    pub const fn uncached(self) -> Self {
        self.with_cache_disable(true)
            .with_write_through(true)
            .with_no_execute(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trips_flags() {
        let flags = PageFlags::user_read_only().with_writable(true);
        let e = PageEntry::leaf(PhysicalAddress::new(0x5555_0000), flags);
        assert!(e.present());
        assert_eq!(e.frame().as_u64(), 0x5555_0000);
        assert_eq!(e.flags(), flags);
        assert!(!e.global());
    }

    #[test]
    fn table_links_are_permissive() {
        let e = PageEntry::table_link(PhysicalAddress::new(0x7000), true);
        assert!(e.present() && e.writable() && e.user());
        assert!(!e.no_execute());
        assert_eq!(u64::from(e) & 0xFFF, 0b111);
    }

    #[test]
    fn frame_field_keeps_high_bits_clear() {
        let e = PageEntry::new().with_frame(PhysicalAddress::new(0x000F_FFFF_FFFF_F000));
        assert_eq!(u64::from(e), 0x000F_FFFF_FFFF_F000);
        assert!(!e.no_execute());
        assert_eq!(PageEntry::EMPTY, PageEntry::from(0));
    }
}
