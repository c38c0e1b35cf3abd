//! Half-open virtual address intervals.

use crate::{PAGE_SIZE, VirtualAddress};
use core::fmt;

/// A half-open `[base, base + size)` interval of virtual addresses.
///
/// `Range` is a plain copy type; it is never mutated after construction.
/// The constructor guarantees that `base + size` does not overflow, so
/// [`end`](Self::end) is always representable.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Range {
    base: VirtualAddress,
    size: u64,
}

impl Range {
    /// Create a range.
    ///
    /// # Panics
    /// Panics if `base + size` overflows.
    #[inline]
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        match Self::checked_new(base, size) {
            Some(r) => r,
            None => panic!("range end overflows the address space"),
        }
    }

    /// Create a range, or `None` if `base + size` overflows.
    #[inline]
    #[must_use]
    pub const fn checked_new(base: VirtualAddress, size: u64) -> Option<Self> {
        match base.checked_add(size) {
            Some(_) => Some(Self { base, size }),
            None => None,
        }
    }

    /// Range spanning `[start, end)`; `None` if `end < start`.
    #[inline]
    #[must_use]
    pub const fn from_bounds(start: VirtualAddress, end: VirtualAddress) -> Option<Self> {
        match end.offset_from(start) {
            Some(size) => Some(Self { base: start, size }),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// One past the last address of the range.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of 4 KiB pages covered, rounding a partial trailing page up.
    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.size.div_ceil(PAGE_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn contains_address(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.end().as_u64()
    }

    /// `true` if `other` lies entirely within `self`.
    ///
    /// An empty `other` is contained iff its base lies within `[base, end]`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        other.base.as_u64() >= self.base.as_u64() && other.end().as_u64() <= self.end().as_u64()
    }

    /// `true` if the two ranges share at least one address.
    #[inline]
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.base.as_u64() < other.end().as_u64() && other.base.as_u64() < self.end().as_u64()
    }

    /// `true` if `other` starts exactly where `self` ends.
    #[inline]
    #[must_use]
    pub const fn is_followed_by(&self, other: &Self) -> bool {
        self.end().as_u64() == other.base.as_u64()
    }

    /// Subtract `inner` from `self`, returning the 0 to 2 remainder pieces in
    /// ascending address order. Empty pieces are never produced.
    ///
    /// # Panics
    /// Panics if `inner` is not contained in `self`.
    #[must_use]
    pub fn carve(&self, inner: Self) -> Carved {
        assert!(
            self.contains(&inner),
            "carve: {inner} is not contained in {self}"
        );

        let mut carved = Carved::default();
        if inner.base > self.base {
            carved.push(Self {
                base: self.base,
                size: inner.base.as_u64() - self.base.as_u64(),
            });
        }
        if inner.end() < self.end() {
            carved.push(Self {
                base: inner.end(),
                size: self.end().as_u64() - inner.end().as_u64(),
            });
        }
        carved
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Range[{:#x}, {:#x})", self.base.as_u64(), self.end().as_u64())
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.base, self.end())
    }
}

/// The remainder pieces produced by [`Range::carve`].
///
/// Holds at most two ranges inline, so carving never allocates.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct Carved {
    parts: [Option<Range>; 2],
}

impl Carved {
    fn push(&mut self, range: Range) {
        if self.parts[0].is_none() {
            self.parts[0] = Some(range);
        } else {
            debug_assert!(self.parts[1].is_none());
            self.parts[1] = Some(range);
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.iter().flatten().count()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.parts[0].is_none()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = Range> + '_ {
        self.parts.iter().flatten().copied()
    }
}

impl fmt::Debug for Carved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl IntoIterator for Carved {
    type Item = Range;
    type IntoIter = core::iter::Flatten<core::array::IntoIter<Option<Range>, 2>>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.into_iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(base: u64, size: u64) -> Range {
        Range::new(VirtualAddress::new(base), size)
    }

    #[test]
    fn carve_middle_leaves_both_sides() {
        let parts: Vec<Range> = r(0, 100).carve(r(30, 20)).iter().collect();
        assert_eq!(parts, [r(0, 30), r(50, 50)]);
    }

    #[test]
    fn carve_whole_leaves_nothing() {
        let carved = r(0, 100).carve(r(0, 100));
        assert!(carved.is_empty());
        assert_eq!(carved.len(), 0);
    }

    #[test]
    fn carve_prefix_and_suffix() {
        let parts: Vec<Range> = r(0, 100).carve(r(0, 50)).into_iter().collect();
        assert_eq!(parts, [r(50, 50)]);

        let parts: Vec<Range> = r(0, 100).carve(r(60, 40)).into_iter().collect();
        assert_eq!(parts, [r(0, 60)]);
    }

    #[test]
    #[should_panic(expected = "not contained")]
    fn carve_requires_containment() {
        let _ = r(0, 100).carve(r(90, 20));
    }

    #[test]
    fn containment_and_intersection() {
        let outer = r(0x1000, 0x3000);
        assert!(outer.contains(&r(0x1000, 0x3000)));
        assert!(outer.contains(&r(0x2000, 0x1000)));
        assert!(!outer.contains(&r(0x3000, 0x2000)));

        assert!(outer.intersects(&r(0x3FFF, 1)));
        assert!(!outer.intersects(&r(0x4000, 0x1000)));
        assert!(!outer.intersects(&r(0x2000, 0)));

        assert!(outer.contains_address(VirtualAddress::new(0x3FFF)));
        assert!(!outer.contains_address(VirtualAddress::new(0x4000)));
        assert!(outer.is_followed_by(&r(0x4000, 0x10)));
    }

    #[test]
    fn overflow_is_rejected() {
        assert!(Range::checked_new(VirtualAddress::new(u64::MAX), 2).is_none());
        assert!(Range::checked_new(VirtualAddress::new(u64::MAX - 1), 1).is_some());
        assert_eq!(
            Range::from_bounds(VirtualAddress::new(0x10), VirtualAddress::new(0x30)),
            Some(r(0x10, 0x20))
        );
        assert_eq!(
            Range::from_bounds(VirtualAddress::new(0x30), VirtualAddress::new(0x10)),
            None
        );
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(r(0, 0x1000).page_count(), 1);
        assert_eq!(r(0, 0x1001).page_count(), 2);
        assert_eq!(r(0, 0).page_count(), 0);
    }

    #[test]
    fn display_is_half_open() {
        assert_eq!(
            format!("{}", r(0x1000, 0x1000)),
            "[0x0000000000001000, 0x0000000000002000)"
        );
    }
}
