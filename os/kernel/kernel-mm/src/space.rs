//! # Address Spaces
//!
//! A [`Space`] is a process's address space: a [`PageDirectory`] and the
//! [`RegionTree`] of everything installed in it.
//!
//! ## Lock order
//!
//! 1. region tree (this module)
//! 2. range allocator ([`PageDirectory`])
//! 3. translation tree ([`PageDirectory`])
//! 4. VM object pages
//! 5. directory registry
//! 6. zone list (leaf)
//!
//! Nothing here takes the zone list lock while holding 1 to 3. Frames are
//! allocated before the region lock is taken, and regions removed under it
//! are dropped (possibly freeing their VM object) only after it is released.

use crate::{
    Access, MemoryError, MemoryManager, PageDirectory, Platform, Region, RegionFlags,
    RegionTree, VmObject,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Range, VirtualAddress, checked_align_up};
use kernel_sync::SpinLock;
use kernel_vmem::PageFlags;
use log::{debug, info};

pub struct Space<P: Platform> {
    mm: Arc<MemoryManager<P>>,
    directory: PageDirectory,
    pub(crate) regions: SpinLock<RegionTree>,
}

/// How a range maps onto the installed regions.
enum Coverage {
    /// One region contains the whole range.
    Within(Arc<Region>),
    /// The range covers each of these regions completely.
    Spans(Vec<Arc<Region>>),
}

impl<P: Platform> Space<P> {
    /// Create an empty address space and register it under its root.
    ///
    /// A child of `parent` inherits the parent's userspace bounds instead of
    /// getting a freshly randomized range.
    ///
    /// # Errors
    /// [`MemoryError::DirectoryConstruction`] if the page directory cannot
    /// be built; nothing stays allocated in that case.
    pub fn create(
        mm: &Arc<MemoryManager<P>>,
        parent: Option<&Self>,
    ) -> Result<Arc<Self>, MemoryError> {
        let parent_allocator = parent.map(|p| p.directory.range_allocator());
        let mut directory = PageDirectory::create_for_userspace(mm, parent_allocator.as_ref())?;
        let space = Arc::new_cyclic(|me| {
            directory.register(mm.registry(), me.clone());
            Self {
                mm: Arc::clone(mm),
                directory,
                regions: SpinLock::new(RegionTree::new()),
            }
        });
        info!(
            "address space {} created, userspace {}",
            space.root(),
            space.directory.total_range()
        );
        Ok(space)
    }

    /// Root of the translation tree; the key of this space in the registry.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.directory.root()
    }

    #[inline]
    #[must_use]
    pub const fn memory_manager(&self) -> &Arc<MemoryManager<P>> {
        &self.mm
    }

    #[inline]
    #[must_use]
    pub const fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.with_lock(|r| r.len())
    }

    /// Snapshot of all regions in address order.
    #[must_use]
    pub fn regions(&self) -> Vec<Arc<Region>> {
        self.regions.with_lock(|r| r.iter().cloned().collect())
    }

    /// Install `region`; its range must have been reserved in this space.
    ///
    /// # Panics
    /// Panics if a region already starts at the same address.
    pub fn add_region(&self, region: Region) -> Arc<Region> {
        self.regions.with_lock(|r| r.add_region(region))
    }

    #[must_use]
    pub fn find_region_from_range(&self, range: Range) -> Option<Arc<Region>> {
        self.regions.with_lock(|r| r.find_region_from_range(range))
    }

    #[must_use]
    pub fn find_region_containing(&self, range: Range) -> Option<Arc<Region>> {
        self.regions.with_lock(|r| r.find_region_containing(range))
    }

    /// As [`find_region_containing`](Self::find_region_containing), but
    /// gives up instead of waiting when the region lock is contended.
    #[must_use]
    pub fn try_find_region_containing(&self, range: Range) -> Option<Arc<Region>> {
        self.regions
            .try_lock()
            .and_then(|r| r.find_region_containing(range))
    }

    /// Remove `region`. Mappings and the range stay for the caller to undo.
    ///
    /// # Panics
    /// Panics if `region` is not installed in this space.
    pub fn take_region(&self, region: &Arc<Region>) -> Arc<Region> {
        self.regions.with_lock(|r| r.take_region(region))
    }

    /// Install the parts of the already taken `source` outside `desired`.
    ///
    /// # Errors
    /// As [`RegionTree::try_split_region_around_range`]; nothing is
    /// installed on error.
    pub fn try_split_region_around_range(
        &self,
        source: &Region,
        desired: Range,
    ) -> Result<Vec<Arc<Region>>, MemoryError> {
        self.regions
            .with_lock(|r| r.try_split_region_around_range(source, desired))
    }

    /// Reserve `size` bytes (rounded up to pages), at `requested` if given.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidRange`] for a zero size, an unaligned
    ///   `requested` address, or a requested range that is not free.
    /// - [`MemoryError::OutOfAddressSpace`] if no hole is large enough.
    pub fn allocate_range(
        &self,
        requested: Option<VirtualAddress>,
        size: u64,
    ) -> Result<Range, MemoryError> {
        let size = checked_align_up(size, PAGE_SIZE)
            .filter(|&s| s > 0)
            .ok_or(MemoryError::InvalidRange)?;
        match requested {
            Some(base) if !base.is_page_aligned() => Err(MemoryError::InvalidRange),
            Some(base) => self
                .directory
                .allocate_specific(base, size)
                .ok_or(MemoryError::InvalidRange),
            None => self
                .directory
                .allocate_anywhere(size, PAGE_SIZE)
                .ok_or(MemoryError::OutOfAddressSpace),
        }
    }

    /// Reserve a range and back it with fresh anonymous memory.
    ///
    /// # Errors
    /// As [`allocate_range`](Self::allocate_range).
    pub fn allocate_region(
        &self,
        requested: Option<VirtualAddress>,
        size: u64,
        access: Access,
        name: &str,
        flags: RegionFlags,
    ) -> Result<Arc<Region>, MemoryError> {
        let range = self.allocate_range(requested, size)?;
        let Ok(pages) = usize::try_from(range.page_count()) else {
            self.directory.deallocate(range);
            return Err(MemoryError::InvalidRange);
        };
        let object = VmObject::anonymous(Arc::clone(self.mm.zones()), pages);
        let region = Region::new(range, Arc::new(object), 0, access, name, flags);
        debug!("space {}: anonymous region {range} '{name}'", self.root());
        Ok(self.add_region(region))
    }

    /// Reserve a range and map `vmobject` into it, starting at `offset`.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidRange`] if `offset` is unaligned or the
    ///   window reaches past the end of `vmobject`.
    /// - As [`allocate_range`](Self::allocate_range).
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_region_with_vmobject(
        &self,
        requested: Option<VirtualAddress>,
        size: u64,
        vmobject: Arc<VmObject>,
        offset: u64,
        access: Access,
        name: &str,
        flags: RegionFlags,
    ) -> Result<Arc<Region>, MemoryError> {
        let fits = offset.is_multiple_of(PAGE_SIZE)
            && checked_align_up(size, PAGE_SIZE)
                .and_then(|s| s.checked_add(offset))
                .is_some_and(|end| end <= vmobject.size());
        if !fits {
            return Err(MemoryError::InvalidRange);
        }
        let range = self.allocate_range(requested, size)?;
        let region = Region::new(range, vmobject, offset, access, name, flags);
        debug!("space {}: object region {range} '{name}'", self.root());
        Ok(self.add_region(region))
    }

    /// Unmap `range`: remove it from its region (or remove the regions it
    /// covers), drop the hardware mappings and release the range.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidRange`] if `range` is not page granular, not
    ///   inside this space, or partially overlaps several regions.
    /// - [`MemoryError::NoSuchRegion`] if no region intersects `range`.
    /// - [`MemoryError::OutOfMemory`] if a split cannot be allocated; the
    ///   space is unchanged.
    pub fn unmap_range(&self, range: Range) -> Result<(), MemoryError> {
        self.check_range(range)?;

        let mut regions = self.regions.lock();
        let mut removed = Vec::new();
        let released = match coverage(&regions, range)? {
            Coverage::Within(region) => {
                let taken = regions.take_region(&region);
                split_or_restore(&mut regions, &taken, range)?;
                removed.push(taken);
                Vec::from([range])
            }
            Coverage::Spans(list) => {
                let mut ranges = Vec::with_capacity(list.len());
                for region in &list {
                    ranges.push(region.range());
                    removed.push(regions.take_region(region));
                }
                ranges
            }
        };

        let unmapped = self.directory.unmap_range(&self.mm, range);
        for freed in released {
            self.directory.deallocate(freed);
        }
        drop(regions);
        debug!(
            "space {}: unmapped {range} ({unmapped} pages were present)",
            self.root()
        );
        drop(removed);
        Ok(())
    }

    /// Change the access of `range`.
    ///
    /// The affected part becomes a region of its own. Its hardware mappings
    /// are removed; the next access faults them back in with the new
    /// permissions.
    ///
    /// # Errors
    /// As [`unmap_range`](Self::unmap_range).
    pub fn protect_range(&self, range: Range, access: Access) -> Result<(), MemoryError> {
        self.check_range(range)?;

        let mut regions = self.regions.lock();
        let mut replaced = Vec::new();
        match coverage(&regions, range)? {
            Coverage::Within(region) => {
                let middle = region.clone_with_range(range)?.with_access(access);
                let taken = regions.take_region(&region);
                split_or_restore(&mut regions, &taken, range)?;
                regions.add_region(middle);
                replaced.push(taken);
            }
            Coverage::Spans(list) => {
                for region in &list {
                    let taken = regions.take_region(region);
                    regions.add_region(taken.with_access(access));
                    replaced.push(taken);
                }
            }
        }
        let unmapped = self.directory.unmap_range(&self.mm, range);
        drop(regions);
        debug!(
            "space {}: protected {range} as {access:?} ({unmapped} pages refault)",
            self.root()
        );
        drop(replaced);
        Ok(())
    }

    /// Translate `va` through this space's tables.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
        self.directory.query(&self.mm, va)
    }

    /// `range` must be non-empty, page granular and inside this space.
    fn check_range(&self, range: Range) -> Result<(), MemoryError> {
        let granular = !range.is_empty()
            && range.base().is_page_aligned()
            && range.size().is_multiple_of(PAGE_SIZE);
        if granular && self.directory.total_range().contains(&range) {
            Ok(())
        } else {
            Err(MemoryError::InvalidRange)
        }
    }
}

/// Classify how `range` overlaps the installed regions.
fn coverage(regions: &RegionTree, range: Range) -> Result<Coverage, MemoryError> {
    let hits = regions.regions_intersecting(range);
    match hits.as_slice() {
        [] => Err(MemoryError::NoSuchRegion),
        [only] if only.range().contains(&range) => Ok(Coverage::Within(Arc::clone(only))),
        all if all.iter().all(|r| range.contains(&r.range())) => Ok(Coverage::Spans(hits)),
        _ => Err(MemoryError::InvalidRange),
    }
}

/// Split `taken` around `range`, putting it back on failure.
fn split_or_restore(
    regions: &mut RegionTree,
    taken: &Arc<Region>,
    range: Range,
) -> Result<(), MemoryError> {
    match regions.try_split_region_around_range(taken, range) {
        Ok(_) => Ok(()),
        Err(e) => {
            regions.add_region(Arc::clone(taken));
            Err(e)
        }
    }
}

impl<P: Platform> Drop for Space<P> {
    fn drop(&mut self) {
        let regions = core::mem::take(self.regions.get_mut());
        self.directory.release(&self.mm);
        debug!(
            "address space {} destroyed with {} regions",
            self.directory.root(),
            regions.len()
        );
        drop(regions);
    }
}

impl<P: Platform> core::fmt::Debug for Space<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Space")
            .field("directory", &self.directory)
            .field("regions", &self.region_count())
            .finish_non_exhaustive()
    }
}
