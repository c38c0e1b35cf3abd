//! # Virtual Range Allocator
//!
//! Hands out page-granular virtual address ranges from one bounded interval.
//! Free space is a sorted list of disjoint holes; allocation carves a hole,
//! deallocation re-inserts and coalesces with touching neighbours, so two
//! holes never touch.

use alloc::vec::Vec;
use kernel_memory_addresses::{Range, VirtualAddress, is_page_multiple};
use log::{trace, warn};

/// Allocator of virtual address ranges within [`total_range`](Self::total_range).
///
/// # Invariants
/// - `available` is sorted by base, holes are disjoint and never touch.
/// - Every hole lies within `total_range`.
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    total_range: Range,
    available: Vec<Range>,
}

impl RangeAllocator {
    /// An allocator with an empty total range; initialize before use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            total_range: Range::new(VirtualAddress::zero(), 0),
            available: Vec::new(),
        }
    }

    /// Manage `[base, base + size)`, all of it free.
    ///
    /// # Panics
    /// Panics if the range is not page granular or overflows.
    pub fn initialize_with_range(&mut self, base: VirtualAddress, size: u64) {
        assert!(
            base.is_page_aligned() && is_page_multiple(size),
            "range allocator bounds must be page granular"
        );
        self.total_range = Range::new(base, size);
        self.available.clear();
        if size > 0 {
            self.available.push(self.total_range);
        }
        trace!("range allocator initialized with {}", self.total_range);
    }

    /// Take over the bounds of `parent` with the **full** range free.
    ///
    /// The parent's hole layout is not inherited.
    pub fn initialize_from_parent(&mut self, parent: &Self) {
        self.initialize_with_range(parent.total_range.base(), parent.total_range.size());
    }

    #[inline]
    #[must_use]
    pub const fn total_range(&self) -> Range {
        self.total_range
    }

    /// The free holes, sorted by base.
    #[inline]
    #[must_use]
    pub fn available_ranges(&self) -> &[Range] {
        &self.available
    }

    /// `true` if `range` lies within the managed bounds.
    #[inline]
    #[must_use]
    pub const fn contains(&self, range: &Range) -> bool {
        self.total_range.contains(range)
    }

    /// Free bytes over all holes.
    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        self.available.iter().map(Range::size).sum()
    }

    /// Reserve `size` bytes anywhere, with a base aligned to `alignment`.
    ///
    /// First fit: the lowest hole that can hold an aligned range of `size`
    /// is carved. Returns `None` on exhaustion, for `size == 0`, or when
    /// `size` or `alignment` is not page granular.
    pub fn allocate_anywhere(&mut self, size: u64, alignment: u64) -> Option<Range> {
        if size == 0 || !is_page_multiple(size) {
            return None;
        }
        if !alignment.is_power_of_two() || !is_page_multiple(alignment) {
            warn!("alignment {alignment:#x} is not a power-of-two page multiple");
            return None;
        }

        let found = self.available.iter().enumerate().find_map(|(i, hole)| {
            let base = hole.base().checked_align_up(alignment)?;
            let candidate = Range::checked_new(base, size)?;
            hole.contains(&candidate).then_some((i, candidate))
        });

        let Some((index, allocated)) = found else {
            warn!(
                "range allocator {}: no hole fits {size:#x} bytes aligned to {alignment:#x}",
                self.total_range
            );
            return None;
        };
        self.carve_hole(index, allocated);
        trace!("allocated {allocated}");
        Some(allocated)
    }

    /// Reserve exactly `[base, base + size)`.
    ///
    /// Returns `None` if any part of it is in use, outside the bounds, not
    /// page granular, or `size == 0`.
    pub fn allocate_specific(&mut self, base: VirtualAddress, size: u64) -> Option<Range> {
        if size == 0 || !base.is_page_aligned() || !is_page_multiple(size) {
            return None;
        }
        let wanted = Range::checked_new(base, size)?;

        let index = self.available.partition_point(|hole| hole.end() <= base);
        if !self
            .available
            .get(index)
            .is_some_and(|hole| hole.contains(&wanted))
        {
            warn!("range allocator: {wanted} is not free");
            return None;
        }
        self.carve_hole(index, wanted);
        trace!("allocated {wanted} at a fixed address");
        Some(wanted)
    }

    /// Replace hole `index` by what is left after removing `inner`.
    fn carve_hole(&mut self, index: usize, inner: Range) {
        let leftovers = self.available[index].carve(inner);
        self.available.splice(index..=index, leftovers);
    }

    /// Return `range` to the free holes, merging with touching neighbours.
    ///
    /// # Panics
    /// Panics if `range` is empty, not page granular, outside the bounds, or
    /// overlaps a hole (double free).
    pub fn deallocate(&mut self, range: Range) {
        assert!(!range.is_empty(), "deallocating an empty range");
        assert!(
            range.base().is_page_aligned() && is_page_multiple(range.size()),
            "deallocating non page granular {range}"
        );
        assert!(
            self.contains(&range),
            "{range} is outside of {}",
            self.total_range
        );

        let index = self.available.partition_point(|hole| hole.base() < range.base());
        let prev = index.checked_sub(1).map(|i| self.available[i]);
        let next = self.available.get(index).copied();
        assert!(
            !prev.is_some_and(|p| p.intersects(&range)) && !next.is_some_and(|n| n.intersects(&range)),
            "double free of {range} in range allocator {}",
            self.total_range
        );

        let merge_prev = prev.filter(|p| p.is_followed_by(&range));
        let merge_next = next.filter(|n| range.is_followed_by(n));
        match (merge_prev, merge_next) {
            (Some(p), Some(n)) => {
                self.available[index - 1] = Range::new(p.base(), p.size() + range.size() + n.size());
                self.available.remove(index);
            }
            (Some(p), None) => {
                self.available[index - 1] = Range::new(p.base(), p.size() + range.size());
            }
            (None, Some(n)) => {
                self.available[index] = Range::new(range.base(), range.size() + n.size());
            }
            (None, None) => self.available.insert(index, range),
        }
        trace!("released {range}");
    }
}

impl Default for RangeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PAGE_SIZE;

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn r(base: u64, size: u64) -> Range {
        Range::new(va(base), size)
    }

    fn allocator(base: u64, size: u64) -> RangeAllocator {
        let mut a = RangeAllocator::new();
        a.initialize_with_range(va(base), size);
        a
    }

    #[test]
    fn allocate_then_free_leaves_a_single_hole() {
        let mut a = allocator(0x1000, 0x10000);
        let got = a.allocate_anywhere(0x2000, PAGE_SIZE).unwrap();
        assert_eq!(got, r(0x1000, 0x2000));
        assert_eq!(a.available_ranges(), [r(0x3000, 0xE000)]);
        a.deallocate(got);
        assert_eq!(a.available_ranges(), [r(0x1000, 0x10000)]);
    }

    #[test]
    fn alignment_is_honoured_with_an_exact_fit() {
        let mut a = allocator(0x1000, 0x10000);
        let got = a.allocate_anywhere(0x4000, 0x4000).unwrap();
        assert_eq!(got, r(0x4000, 0x4000));
        assert_eq!(a.available_ranges(), [r(0x1000, 0x3000), r(0x8000, 0x9000)]);

        // [0x8000, 0x11000) holds exactly one more aligned 0x8000 block.
        let exact = a.allocate_anywhere(0x8000, 0x8000).unwrap();
        assert_eq!(exact, r(0x8000, 0x8000));
        assert!(a.allocate_anywhere(0x8000, 0x8000).is_none());
    }

    #[test]
    fn specific_allocations_detect_overlap() {
        let mut a = allocator(0x10_0000, 0x10_0000);
        assert!(a.allocate_specific(va(0x10_0000), 0x2000).is_some());
        assert!(a.allocate_specific(va(0x18_0000), 0x2000).is_some());
        assert!(a.allocate_specific(va(0x10_1000), 0x2000).is_none());
        assert!(a.allocate_specific(va(0x17_F000), 0x2000).is_none());
        assert!(a.allocate_specific(va(0x20_0000), 0x1000).is_none());
        assert!(a.allocate_specific(va(0x10_2000), 0).is_none());
        assert_eq!(a.available_ranges().len(), 2);
    }

    #[test]
    fn non_granular_requests_are_refused() {
        let mut a = allocator(0x10_0000, 0x10_0000);
        assert!(a.allocate_specific(va(0x10_0800), 0x1000).is_none());
        assert!(a.allocate_specific(va(0x10_0000), 0x1800).is_none());
        assert!(a.allocate_anywhere(0x1001, PAGE_SIZE).is_none());
        assert!(a.allocate_anywhere(0x1000, 0x3000).is_none());
        assert!(a.allocate_anywhere(0x1000, 0x800).is_none());
        assert_eq!(a.available_ranges(), [r(0x10_0000, 0x10_0000)]);
    }

    #[test]
    fn deallocation_merges_both_neighbours() {
        let mut a = allocator(0, 0x10000);
        let x = a.allocate_specific(va(0x2000), 0x1000).unwrap();
        let y = a.allocate_specific(va(0x3000), 0x1000).unwrap();
        let z = a.allocate_specific(va(0x4000), 0x1000).unwrap();
        assert_eq!(a.available_ranges(), [r(0, 0x2000), r(0x5000, 0xB000)]);

        a.deallocate(y);
        assert_eq!(a.available_ranges().len(), 3);
        a.deallocate(x);
        assert_eq!(a.available_ranges(), [r(0, 0x4000), r(0x5000, 0xB000)]);
        a.deallocate(z);
        assert_eq!(a.available_ranges(), [r(0, 0x10000)]);
    }

    #[test]
    fn exhaustion_and_zero_size_return_none() {
        let mut a = allocator(0x1000, 0x2000);
        assert!(a.allocate_anywhere(0, PAGE_SIZE).is_none());
        assert!(a.allocate_anywhere(0x3000, PAGE_SIZE).is_none());
        assert!(a.allocate_anywhere(0x2000, PAGE_SIZE).is_some());
        assert!(a.allocate_anywhere(0x1000, PAGE_SIZE).is_none());
        assert_eq!(a.available_bytes(), 0);
    }

    #[test]
    fn child_inherits_bounds_but_not_holes() {
        let mut parent = allocator(0x40_0000, 0x100_0000);
        let _ = parent.allocate_anywhere(0x10_0000, PAGE_SIZE).unwrap();

        let mut child = RangeAllocator::new();
        child.initialize_from_parent(&parent);
        assert_eq!(child.total_range(), parent.total_range());
        assert_eq!(child.available_ranges(), [parent.total_range()]);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut a = allocator(0, 0x10000);
        let x = a.allocate_anywhere(0x2000, PAGE_SIZE).unwrap();
        a.deallocate(x);
        a.deallocate(r(0x1000, 0x1000));
    }

    #[test]
    #[should_panic(expected = "outside of")]
    fn freeing_outside_bounds_panics() {
        let mut a = allocator(0x1000, 0x1000);
        a.deallocate(r(0x4000, 0x1000));
    }
}
