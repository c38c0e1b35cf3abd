//! # Translation Tree
//!
//! [`TranslationTree`] owns the root frame and every intermediate table of one
//! address space and edits them through quickmap windows.
//!
//! ## Frame supply
//!
//! The tree never calls into an allocator. Missing intermediate tables are
//! taken from a [`TableFrames`] stash that the caller fills *before* taking
//! the lock protecting the tree, and tops up or returns afterwards. This keeps
//! the physical allocator's lock out of every critical section that holds a
//! tree lock.
//!
//! ## Ownership
//!
//! Leaf entries point at frames the tree does not own; [`unmap_page`](TranslationTree::unmap_page)
//! hands the frame back to the caller. Intermediate tables belong to the tree
//! and are released by [`release_tables`](TranslationTree::release_tables),
//! except for top-level slots shared with another tree.
//!
//! ## Windows
//!
//! Every edit holds at most one quickmap window at a time. A caller holding
//! one window while claiming a second could wait forever once all windows
//! are held by such callers.

use crate::quickmap::{QuickMap, QuickMapPool};
use crate::{FrameAlloc, PageEntry, PageFlags, PageTable, PhysMapper, TableLevel};
use core::ops::Range;
use kernel_info::memory::{TABLE_ENTRIES, TRANSLATION_LEVELS, VIRTUAL_ADDRESS_BITS};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::{trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no pre-allocated frame left for an intermediate table")]
    OutOfTableFrames,
    #[error("virtual address is already mapped")]
    AlreadyMapped,
    #[error("virtual address is not mapped")]
    NotMapped,
    #[error("virtual address is not canonical")]
    NonCanonical,
}

/// `true` if bits 63..=47 of `va` are all equal.
#[inline]
#[must_use]
pub const fn is_canonical(va: VirtualAddress) -> bool {
    let top = va.as_u64() >> (VIRTUAL_ADDRESS_BITS - 1);
    top == 0 || top == (1 << (65 - VIRTUAL_ADDRESS_BITS)) - 1
}

/// Access path to table frames: a [`PhysMapper`] plus the window pool.
pub struct TableAccess<'a, M: PhysMapper> {
    mapper: &'a M,
    windows: &'a QuickMapPool,
}

impl<'a, M: PhysMapper> TableAccess<'a, M> {
    pub const fn new(mapper: &'a M, windows: &'a QuickMapPool) -> Self {
        Self { mapper, windows }
    }

    /// View the frame at `pa` as a table.
    ///
    /// # Safety
    /// `pa` must be a table frame of a tree the caller has exclusive access to,
    /// or a frame the caller just allocated.
    #[inline]
    pub unsafe fn table(&self, pa: PhysicalAddress) -> QuickMap<'a, PageTable> {
        // SAFETY: forwarded; every bit pattern is a valid `PageTable`.
        unsafe { self.windows.map(self.mapper, pa) }
    }

    /// Zero the 4 KiB frame at `pa`.
    ///
    /// # Safety
    /// The caller must own the frame exclusively.
    #[inline]
    pub unsafe fn zero_frame(&self, pa: PhysicalAddress) {
        // SAFETY: forwarded.
        unsafe { self.table(pa) }.zero();
    }
}

/// Pre-allocated frames for the intermediate tables of one mapping.
///
/// A single 4 KiB mapping needs at most one new table per non-root level.
#[derive(Debug, Default)]
pub struct TableFrames {
    frames: [Option<PhysicalAddress>; Self::MAX],
}

impl TableFrames {
    /// Tables a single mapping may need.
    pub const MAX: usize = TRANSLATION_LEVELS - 1;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames: [None; Self::MAX],
        }
    }

    /// Top the stash up to [`MAX`](Self::MAX) frames.
    ///
    /// Returns `false` if the allocator ran dry; frames obtained so far stay
    /// in the stash.
    pub fn fill<A: FrameAlloc>(&mut self, alloc: &mut A) -> bool {
        for slot in self.frames.iter_mut().filter(|s| s.is_none()) {
            match alloc.alloc_4k() {
                Some(frame) => *slot = Some(frame),
                None => return false,
            }
        }
        true
    }

    /// Take one frame out of the stash.
    pub fn take(&mut self) -> Option<PhysicalAddress> {
        self.frames.iter_mut().find_map(Option::take)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Give every remaining frame back to `alloc`.
    pub fn release<A: FrameAlloc>(&mut self, alloc: &mut A) {
        while let Some(frame) = self.take() {
            alloc.free_4k(frame);
        }
    }
}

impl Drop for TableFrames {
    fn drop(&mut self) {
        if !self.is_empty() {
            warn!("dropping {} unused page-table frames", self.len());
        }
    }
}

/// The hardware translation tree of one address space.
#[derive(Debug)]
pub struct TranslationTree {
    root: PhysicalAddress,
    /// Intermediate tables this tree allocated (root excluded).
    tables: usize,
}

impl TranslationTree {
    /// Wrap a root frame. The frame must be zeroed or hold a valid root table.
    #[must_use]
    pub const fn new(root: PhysicalAddress) -> Self {
        Self { root, tables: 0 }
    }

    /// Physical address of the root table; identifies the address space.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Intermediate tables allocated through [`map_page`](Self::map_page).
    #[inline]
    #[must_use]
    pub const fn table_count(&self) -> usize {
        self.tables
    }

    /// Physical address of the leaf table covering `va`, if the path exists.
    fn leaf_table<M: PhysMapper>(
        &self,
        access: &TableAccess<'_, M>,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let mut table = self.root;
        let mut level = TableLevel::Root;
        while let Some(lower) = level.next_lower() {
            // SAFETY: `table` is part of this tree, and `&self` is held.
            let entry = unsafe { access.table(table) }.get(level.index_of(va));
            if !entry.present() {
                return None;
            }
            table = entry.frame();
            level = lower;
        }
        Some(table)
    }

    /// Walk to the leaf table covering `va`, linking missing tables from `frames`.
    fn leaf_table_or_create<M: PhysMapper>(
        &mut self,
        access: &TableAccess<'_, M>,
        va: VirtualAddress,
        user: bool,
        frames: &mut TableFrames,
    ) -> Result<PhysicalAddress, MapError> {
        if !is_canonical(va) {
            return Err(MapError::NonCanonical);
        }

        let mut table = self.root;
        let mut level = TableLevel::Root;
        while let Some(lower) = level.next_lower() {
            let idx = level.index_of(va);
            // SAFETY (all windows below): `table` belongs to this tree, and
            // `&mut self` is held.
            let entry = unsafe { access.table(table) }.get(idx);
            table = if entry.present() {
                if user && !entry.user() {
                    unsafe { access.table(table) }.set(idx, entry.with_user(true));
                }
                entry.frame()
            } else {
                let fresh = frames.take().ok_or(MapError::OutOfTableFrames)?;
                // SAFETY: the stash hands out frames nobody else references.
                unsafe { access.zero_frame(fresh) };
                unsafe { access.table(table) }.set(idx, PageEntry::table_link(fresh, user));
                self.tables += 1;
                trace!("linked {lower:?} table {fresh} under {table} for {va}");
                fresh
            };
            level = lower;
        }
        Ok(table)
    }

    /// Make sure every table on the path to `va` exists, without mapping a leaf.
    ///
    /// # Errors
    /// As [`map_page`](Self::map_page), minus [`MapError::AlreadyMapped`].
    pub fn prepare_path<M: PhysMapper>(
        &mut self,
        access: &TableAccess<'_, M>,
        va: VirtualAddress,
        user: bool,
        frames: &mut TableFrames,
    ) -> Result<(), MapError> {
        self.leaf_table_or_create(access, va, user, frames)
            .map(|_| ())
    }

    /// Install a 4 KiB mapping `va → pa`.
    ///
    /// Missing intermediate tables are zeroed frames taken from `frames`.
    ///
    /// # Errors
    /// - [`MapError::NonCanonical`] if `va` is outside the translated range.
    /// - [`MapError::OutOfTableFrames`] if `frames` ran out; tables linked
    ///   so far stay in the tree.
    /// - [`MapError::AlreadyMapped`] if a leaf for `va` is present.
    pub fn map_page<M: PhysMapper>(
        &mut self,
        access: &TableAccess<'_, M>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
        frames: &mut TableFrames,
    ) -> Result<(), MapError> {
        debug_assert!(va.is_page_aligned() && pa.is_page_aligned());
        let table = self.leaf_table_or_create(access, va, flags.user, frames)?;

        // SAFETY: leaf table of this tree.
        let mut leaf = unsafe { access.table(table) };
        let idx = TableLevel::L1.index_of(va);
        if leaf.get(idx).present() {
            return Err(MapError::AlreadyMapped);
        }
        leaf.set(idx, PageEntry::leaf(pa, flags));
        Ok(())
    }

    /// Remove the 4 KiB mapping at `va` and return the frame it pointed to.
    ///
    /// The caller owns the returned frame and must flush the TLB.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if no leaf exists for `va`.
    pub fn unmap_page<M: PhysMapper>(
        &mut self,
        access: &TableAccess<'_, M>,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, MapError> {
        let table = self.leaf_table(access, va).ok_or(MapError::NotMapped)?;
        // SAFETY: leaf table of this tree, and `&mut self` is held.
        let mut leaf = unsafe { access.table(table) };
        let idx = TableLevel::L1.index_of(va);
        let entry = leaf.get(idx);
        if !entry.present() {
            return Err(MapError::NotMapped);
        }
        leaf.set(idx, PageEntry::EMPTY);
        Ok(entry.frame())
    }

    /// Translate `va`, returning the physical address and the leaf permissions.
    #[must_use]
    pub fn query<M: PhysMapper>(
        &self,
        access: &TableAccess<'_, M>,
        va: VirtualAddress,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        if !is_canonical(va) {
            return None;
        }
        let table = self.leaf_table(access, va)?;
        // SAFETY: leaf table of this tree.
        let entry = unsafe { access.table(table) }.get(TableLevel::L1.index_of(va));
        if !entry.present() {
            return None;
        }
        Some((entry.frame() + va.offset_in_page(), entry.flags()))
    }

    /// Copy the root entries in `slots` from the tree rooted at `source`.
    ///
    /// The copied subtrees stay owned by `source`; pass the same `slots` to
    /// [`release_tables`](Self::release_tables) so they are never freed here.
    pub fn share_top_level_slots<M: PhysMapper>(
        &mut self,
        access: &TableAccess<'_, M>,
        source: PhysicalAddress,
        slots: Range<usize>,
    ) {
        debug_assert!(slots.end <= TABLE_ENTRIES);
        for slot in slots {
            // SAFETY: `source` is only read; our root is exclusively ours.
            let entry = unsafe { access.table(source) }.get(slot);
            unsafe { access.table(self.root) }.set(slot, entry);
        }
    }

    /// Free every table of this tree through `free`, root last.
    ///
    /// Subtrees under the root slots in `shared` belong to another tree and
    /// are skipped. Leaf frames are never passed to `free`.
    ///
    /// Returns the number of frames released.
    pub fn release_tables<M: PhysMapper>(
        self,
        access: &TableAccess<'_, M>,
        shared: Range<usize>,
        free: &mut impl FnMut(PhysicalAddress),
    ) -> usize {
        let mut released = 0;
        for slot in (0..TABLE_ENTRIES).filter(|s| !shared.contains(s)) {
            // SAFETY: root of this tree, consumed by value.
            let entry = unsafe { access.table(self.root) }.get(slot);
            if entry.present() {
                released += release_subtree(access, entry.frame(), TableLevel::L3, free);
            }
        }
        free(self.root);
        released + 1
    }
}

/// Free `table` (at `level`) and every table below it.
fn release_subtree<M: PhysMapper>(
    access: &TableAccess<'_, M>,
    table: PhysicalAddress,
    level: TableLevel,
    free: &mut impl FnMut(PhysicalAddress),
) -> usize {
    let mut released = 0;
    if let Some(lower) = level.next_lower() {
        for idx in 0..TABLE_ENTRIES {
            // One window at a time; recursion depth is bounded by the level count.
            // SAFETY: `table` is exclusively owned by the tree being released.
            let entry = unsafe { access.table(table) }.get(idx);
            if entry.present() {
                released += release_subtree(access, entry.frame(), lower, free);
            }
        }
    }
    free(table);
    released + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_addresses() {
        assert!(is_canonical(VirtualAddress::new(0x0000_7FFF_FFFF_F000)));
        assert!(is_canonical(VirtualAddress::new(0xFFFF_8000_0000_0000)));
        assert!(!is_canonical(VirtualAddress::new(0x0000_8000_0000_0000)));
        assert!(!is_canonical(VirtualAddress::new(0xFFFF_7FFF_FFFF_F000)));
    }

    struct Counter(u64);

    impl FrameAlloc for Counter {
        fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
            if self.0 == 0 {
                return None;
            }
            self.0 -= 1;
            Some(PhysicalAddress::new(self.0 << 12))
        }

        fn free_4k(&mut self, _frame: PhysicalAddress) {
            self.0 += 1;
        }
    }

    #[test]
    fn stash_fill_take_release() {
        let mut alloc = Counter(2);
        let mut frames = TableFrames::new();
        assert!(!frames.fill(&mut alloc));
        assert_eq!(frames.len(), 2);
        assert!(frames.take().is_some());
        frames.release(&mut alloc);
        assert!(frames.is_empty());
        assert_eq!(alloc.0, 1);

        let mut alloc = Counter(10);
        assert!(frames.fill(&mut alloc));
        assert_eq!(frames.len(), TableFrames::MAX);
        frames.release(&mut alloc);
    }
}
