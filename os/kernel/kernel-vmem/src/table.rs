//! # Translation Tables
//!
//! A [`PageTable`] is one 4 KiB-aligned node of the four-level tree. The
//! [`TableLevel`] of a node decides which nine address bits index into it:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! | Root  |  L3   |  L2   | Leaf  | Offset |
//! ```

use crate::PageEntry;
use kernel_info::memory::TABLE_ENTRIES;
use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress};

/// Bits of virtual address consumed per level.
const INDEX_BITS: u32 = 9;

/// One table of the translation tree: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    entries: [PageEntry; TABLE_ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// Create a fully zeroed table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::EMPTY; TABLE_ENTRIES],
        }
    }

    /// Clear all entries.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::EMPTY);
    }

    /// Read the entry at `i`.
    ///
    /// Plain load; does not imply any TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageEntry {
        self.entries[i]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: usize, e: PageEntry) {
        self.entries[i] = e;
    }

    /// `true` if no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    /// Indices and entries of all present slots.
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.present())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Level of a table in the tree, from the root down to the leaf tables.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum TableLevel {
    /// Leaf tables; entries map 4 KiB frames.
    L1 = 1,
    L2 = 2,
    L3 = 3,
    /// The root, whose physical address identifies the address space.
    Root = 4,
}

impl TableLevel {
    /// Table index for `va` at this level.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        let shift = PAGE_SHIFT + INDEX_BITS * (self as u32 - 1);
        ((va.as_u64() >> shift) & (TABLE_ENTRIES as u64 - 1)) as usize
    }

    /// Bytes of address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << (PAGE_SHIFT + INDEX_BITS * (self as u32 - 1))
    }

    /// The level below, or `None` for leaf tables.
    #[inline]
    #[must_use]
    pub const fn next_lower(self) -> Option<Self> {
        match self {
            Self::Root => Some(Self::L3),
            Self::L3 => Some(Self::L2),
            Self::L2 => Some(Self::L1),
            Self::L1 => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_split_the_address() {
        // root=0x1FF, l3=0x1FE, l2=0x000, l1=0x001, offset=0x234
        let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
        assert_eq!(TableLevel::Root.index_of(va), 511);
        assert_eq!(TableLevel::L3.index_of(va), 510);
        assert_eq!(TableLevel::L2.index_of(va), 0);
        assert_eq!(TableLevel::L1.index_of(va), 1);
    }

    #[test]
    fn spans_grow_by_512() {
        assert_eq!(TableLevel::L1.entry_span(), 4096);
        assert_eq!(TableLevel::L2.entry_span(), 2 * 1024 * 1024);
        assert_eq!(TableLevel::Root.entry_span(), 512 * 1024 * 1024 * 1024);
    }

    #[test]
    fn present_entries_skips_holes() {
        let mut t = PageTable::zeroed();
        assert!(t.is_empty());
        t.set(3, PageEntry::new().with_present(true));
        t.set(400, PageEntry::new().with_present(true));
        let idx: Vec<usize> = t.present_entries().map(|(i, _)| i).collect();
        assert_eq!(idx, [3, 400]);
        t.zero();
        assert!(t.is_empty());
    }
}
