//! # VM Objects
//!
//! The memory behind a [`Region`](crate::Region). A region maps a window of
//! its object; several regions may map the same object (after a split, or
//! when a file is shared).
//!
//! Committed frames belong to the object, not to the regions or the
//! translation trees that map them, and go back to the zone allocator when
//! the last reference to the object is dropped.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use kernel_alloc::zones::ZoneAllocator;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::SpinLock;
use log::{debug, trace};

/// Identifier of a filesystem node; the VFS owns the meaning.
pub type InodeId = u64;

/// Backing memory of a region.
#[derive(Debug)]
pub enum VmObject {
    /// Zero-filled memory, committed one frame at a time on first touch.
    Anonymous(CommittedPages),
    /// Pages of a file. Frames are committed like anonymous memory; filling
    /// them with file contents is the VFS's business.
    File {
        inode: InodeId,
        /// Writes are visible to every mapping of the file.
        shared: bool,
        pages: CommittedPages,
    },
    /// A fixed, physically contiguous window such as device memory. Never
    /// allocated or freed by the memory manager.
    Physical {
        base: PhysicalAddress,
        page_count: usize,
    },
}

impl VmObject {
    #[must_use]
    pub fn anonymous(zones: Arc<ZoneAllocator>, page_count: usize) -> Self {
        Self::Anonymous(CommittedPages::new(zones, page_count))
    }

    #[must_use]
    pub fn file(zones: Arc<ZoneAllocator>, inode: InodeId, shared: bool, page_count: usize) -> Self {
        Self::File {
            inode,
            shared,
            pages: CommittedPages::new(zones, page_count),
        }
    }

    /// # Panics
    /// Panics if `base` is not page aligned.
    #[must_use]
    pub fn physical(base: PhysicalAddress, page_count: usize) -> Self {
        assert!(base.is_page_aligned(), "physical VM object base {base} is unaligned");
        Self::Physical { base, page_count }
    }

    /// Pages addressable through this object.
    #[must_use]
    pub fn page_count(&self) -> usize {
        match self {
            Self::Anonymous(pages) | Self::File { pages, .. } => pages.len(),
            Self::Physical { page_count, .. } => *page_count,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.page_count() as u64 * PAGE_SIZE
    }

    /// `true` for objects whose writes are visible through every mapping.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        match self {
            Self::Anonymous(_) => false,
            Self::File { shared, .. } => *shared,
            Self::Physical { .. } => true,
        }
    }

    /// `true` for device memory, which is mapped uncached.
    #[must_use]
    pub const fn is_physical(&self) -> bool {
        matches!(self, Self::Physical { .. })
    }

    /// Frames currently committed (device memory counts as fully committed).
    #[must_use]
    pub fn committed_pages(&self) -> usize {
        match self {
            Self::Anonymous(pages) | Self::File { pages, .. } => pages.committed(),
            Self::Physical { page_count, .. } => *page_count,
        }
    }

    /// The frame backing page `index`, if committed.
    #[must_use]
    pub fn frame_at(&self, index: usize) -> Option<PhysicalAddress> {
        match self {
            Self::Anonymous(pages) | Self::File { pages, .. } => pages.get(index),
            Self::Physical { base, page_count } => (index < *page_count)
                .then(|| *base + index as u64 * PAGE_SIZE),
        }
    }

    /// The frame backing page `index`, committing `spare` if there is none
    /// yet.
    ///
    /// `spare` must be a zeroed frame; it is taken only if it was installed.
    /// Nothing is allocated or freed here, so this may run under address
    /// space locks. Returns `None` if `index` is out of bounds, or if the
    /// page is uncommitted and no spare was given.
    pub fn commit_page(
        &self,
        index: usize,
        spare: &mut Option<PhysicalAddress>,
    ) -> Option<PhysicalAddress> {
        match self {
            Self::Anonymous(pages) | Self::File { pages, .. } => pages.commit(index, spare),
            Self::Physical { .. } => self.frame_at(index),
        }
    }
}

/// Lazily committed frames of an anonymous or file object.
pub struct CommittedPages {
    frames: SpinLock<Vec<Option<PhysicalAddress>>>,
    zones: Arc<ZoneAllocator>,
}

impl CommittedPages {
    fn new(zones: Arc<ZoneAllocator>, page_count: usize) -> Self {
        Self {
            frames: SpinLock::new(vec![None; page_count]),
            zones,
        }
    }

    fn len(&self) -> usize {
        self.frames.with_lock(|f| f.len())
    }

    fn committed(&self) -> usize {
        self.frames.with_lock(|f| f.iter().flatten().count())
    }

    fn get(&self, index: usize) -> Option<PhysicalAddress> {
        self.frames.with_lock(|f| f.get(index).copied().flatten())
    }

    fn commit(&self, index: usize, spare: &mut Option<PhysicalAddress>) -> Option<PhysicalAddress> {
        self.frames.with_lock(|frames| {
            let slot = frames.get_mut(index)?;
            if slot.is_none() {
                *slot = Some(spare.take()?);
                trace!("committed page {index}");
            }
            *slot
        })
    }
}

impl core::fmt::Debug for CommittedPages {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommittedPages")
            .field("pages", &self.len())
            .field("committed", &self.committed())
            .finish_non_exhaustive()
    }
}

impl Drop for CommittedPages {
    fn drop(&mut self) {
        let frames = core::mem::take(self.frames.get_mut());
        let mut released = 0usize;
        for frame in frames.into_iter().flatten() {
            self.zones.free_frame(frame);
            released += 1;
        }
        if released > 0 {
            debug!("released {released} committed frames");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::PhysicalMemoryRange;

    fn zones() -> Arc<ZoneAllocator> {
        Arc::new(ZoneAllocator::from_memory_map(&[PhysicalMemoryRange::usable(
            PhysicalAddress::new(0x10_0000),
            64 * PAGE_SIZE,
        )]))
    }

    #[test]
    fn commit_is_lazy_and_sticky() {
        let zones = zones();
        let object = VmObject::anonymous(Arc::clone(&zones), 4);
        assert_eq!(object.committed_pages(), 0);
        assert_eq!(object.frame_at(1), None);

        assert_eq!(object.commit_page(1, &mut None), None);

        let mut spare = zones.allocate_frame();
        let first = object.commit_page(1, &mut spare).unwrap();
        assert!(spare.is_none());

        let mut unused = zones.allocate_frame();
        let again = object.commit_page(1, &mut unused).unwrap();
        assert_eq!(first, again);
        assert!(unused.is_some());
        assert_eq!(object.committed_pages(), 1);
        assert_eq!(object.commit_page(4, &mut unused), None);
        zones.free_frame(unused.unwrap());
    }

    #[test]
    fn dropping_the_object_returns_its_frames() {
        let zones = zones();
        let before = zones.available_pages();
        let object = VmObject::file(Arc::clone(&zones), 7, true, 3);
        for i in 0..3 {
            object.commit_page(i, &mut zones.allocate_frame()).unwrap();
        }
        assert_eq!(zones.available_pages(), before - 3);
        assert!(object.is_shared());
        drop(object);
        assert_eq!(zones.available_pages(), before);
    }

    #[test]
    fn physical_objects_map_their_window() {
        let object = VmObject::physical(PhysicalAddress::new(0xFEE0_0000), 2);
        assert_eq!(object.frame_at(1), Some(PhysicalAddress::new(0xFEE0_1000)));
        assert_eq!(object.frame_at(2), None);
        assert_eq!(
            object.commit_page(0, &mut None),
            Some(PhysicalAddress::new(0xFEE0_0000))
        );
        assert!(object.is_physical());
        assert_eq!(object.size(), 2 * PAGE_SIZE);
    }
}
