//! # Region Tree
//!
//! The regions of one space, keyed by base address, plus a one-entry cache
//! for exact-range lookups (the common `munmap(addr, len)` of a whole
//! mapping). The tree does no locking; [`Space`](crate::Space) wraps it in
//! its region lock.

use crate::{MemoryError, Region};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use kernel_memory_addresses::{Range, VirtualAddress};
use log::trace;

#[derive(Debug, Default)]
pub struct RegionTree {
    regions: BTreeMap<VirtualAddress, Arc<Region>>,
    /// Last successful [`find_region_from_range`](Self::find_region_from_range).
    cache: Option<(Range, Weak<Region>)>,
}

impl RegionTree {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            cache: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Region>> + '_ {
        self.regions.values()
    }

    /// Install `region` under its base address.
    ///
    /// # Panics
    /// Panics if a region with the same base exists; the range was reserved
    /// exclusively, so this means the space is corrupted.
    pub fn add_region(&mut self, region: impl Into<Arc<Region>>) -> Arc<Region> {
        let region = region.into();
        let base = region.range().base();
        assert!(
            !self.regions.contains_key(&base),
            "region tree already holds a region at {base}"
        );
        trace!("added region {} '{}'", region.range(), region.name());
        self.regions.insert(base, Arc::clone(&region));
        region
    }

    /// The region whose range is exactly `range`.
    pub fn find_region_from_range(&mut self, range: Range) -> Option<Arc<Region>> {
        if let Some((cached_range, cached)) = &self.cache
            && *cached_range == range
            && let Some(region) = cached.upgrade()
        {
            return Some(region);
        }

        let region = self
            .regions
            .get(&range.base())
            .filter(|r| r.range().size() == range.size())?;
        self.cache = Some((range, Arc::downgrade(region)));
        Some(Arc::clone(region))
    }

    /// The region that fully contains `range`.
    #[must_use]
    pub fn find_region_containing(&self, range: Range) -> Option<Arc<Region>> {
        self.regions
            .range(..=range.base())
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.range().contains(&range))
            .cloned()
    }

    /// Every region that shares at least one address with `range`, in
    /// address order.
    #[must_use]
    pub fn regions_intersecting(&self, range: Range) -> Vec<Arc<Region>> {
        let first = self
            .regions
            .range(..=range.base())
            .next_back()
            .filter(|(_, r)| r.range().intersects(&range))
            .map(|(base, _)| *base)
            .unwrap_or(range.base());
        self.regions
            .range(first..range.end())
            .map(|(_, region)| region)
            .filter(|region| region.range().intersects(&range))
            .cloned()
            .collect()
    }

    /// Remove `region` from the tree and hand it to the caller.
    ///
    /// The caller undoes the hardware mappings and releases the range.
    ///
    /// # Panics
    /// Panics if `region` is not installed in this tree.
    pub fn take_region(&mut self, region: &Arc<Region>) -> Arc<Region> {
        let base = region.range().base();
        let Some(taken) = self
            .regions
            .remove(&base)
            .filter(|taken| Arc::ptr_eq(taken, region))
        else {
            panic!("region {} is not in the region tree", region.range());
        };
        if self
            .cache
            .as_ref()
            .is_some_and(|(_, cached)| cached.ptr_eq(&Arc::downgrade(&taken)))
        {
            self.cache = None;
        }
        trace!("took region {} '{}'", taken.range(), taken.name());
        taken
    }

    /// Install the parts of `source` that lie outside `desired`.
    ///
    /// `source` must already have been taken out of the tree. Each leftover
    /// piece becomes a region over the same object with the offset shifted
    /// accordingly. Either every piece is installed or none is.
    ///
    /// Returns the installed pieces (0, 1 or 2) in address order.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidRange`] if `desired` is not inside `source`.
    /// - [`MemoryError::OutOfMemory`] if the result cannot be allocated.
    ///
    /// # Panics
    /// Panics if a piece would land on an occupied base address.
    pub fn try_split_region_around_range(
        &mut self,
        source: &Region,
        desired: Range,
    ) -> Result<Vec<Arc<Region>>, MemoryError> {
        if !source.range().contains(&desired) {
            return Err(MemoryError::InvalidRange);
        }

        let mut pieces = Vec::new();
        pieces
            .try_reserve_exact(2)
            .map_err(|_| MemoryError::OutOfMemory)?;
        for leftover in source.range().carve(desired) {
            pieces.push(source.clone_with_range(leftover)?);
        }
        let mut installed = Vec::new();
        installed
            .try_reserve_exact(pieces.len())
            .map_err(|_| MemoryError::OutOfMemory)?;

        for piece in &pieces {
            let base = piece.range().base();
            assert!(
                !self.regions.contains_key(&base),
                "split of {} collides with the region at {base}",
                source.range()
            );
        }
        installed.extend(pieces.into_iter().map(|piece| self.add_region(piece)));
        Ok(installed)
    }
}
