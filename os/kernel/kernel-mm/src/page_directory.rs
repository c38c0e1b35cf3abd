//! # Page Directories
//!
//! A [`PageDirectory`] is the hardware side of one address space: its
//! [`TranslationTree`] and the [`RangeAllocator`] that hands out its virtual
//! ranges. The kernel directory is built once; every userspace directory
//! shares the kernel's top-level slots.
//!
//! ## Construction
//!
//! Construction is transactional. Every frame a directory needs up front is
//! allocated before anything is linked, and if any allocation fails all
//! frames taken so far are returned before the error is reported. A
//! directory value therefore always describes a complete tree.
//!
//! ## Teardown
//!
//! Tables are released explicitly through [`PageDirectory::release`] by the
//! owner (the [`Space`](crate::Space) or the memory manager), which also
//! removes the root from the [`DirectoryRegistry`]. Subtrees under shared
//! slots belong to the kernel directory and are never freed by a user
//! directory. Leaf frames belong to VM objects and are never freed here.

use crate::{DirectoryRegistry, MemoryError, MemoryManager, MemoryManagerConfig, Platform, Space};
use alloc::sync::Weak;
use alloc::vec::Vec;
use kernel_alloc::range_allocator::RangeAllocator;
use kernel_alloc::zones::ZoneAllocator;
use kernel_info::memory::{KERNEL_BASE, KERNEL_DYNAMIC_BASE};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Range, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{
    MapError, PageEntry, PageFlags, PhysMapper, TableAccess, TableFrames, TableLevel,
    TranslationTree,
};
use log::{debug, info, warn};

/// Translation tree plus virtual range allocator of one address space.
///
/// Lock order: the range allocator before the translation tree.
pub struct PageDirectory {
    root: PhysicalAddress,
    ranges: SpinLock<RangeAllocator>,
    tree: SpinLock<TranslationTree>,
    /// Root slots whose subtrees belong to another directory.
    shared_slots: core::ops::Range<usize>,
    registered: bool,
    released: bool,
}

impl PageDirectory {
    /// Build the kernel directory: a root plus one table per shared slot, so
    /// that every later kernel mapping is visible to every address space.
    ///
    /// # Errors
    /// [`MemoryError::DirectoryConstruction`] if the frames cannot be
    /// allocated; none stay allocated in that case.
    pub(crate) fn allocate_kernel_directory<M: PhysMapper>(
        access: &TableAccess<'_, M>,
        zones: &ZoneAllocator,
        config: &MemoryManagerConfig,
    ) -> Result<Self, MemoryError> {
        let slots = config.shared_slots();
        let frames = allocate_frames(zones, slots.len() + 1).ok_or_else(|| {
            warn!("not enough memory for the kernel page directory");
            MemoryError::DirectoryConstruction
        })?;

        let root = frames[0];
        for &frame in &frames {
            // SAFETY: freshly allocated, owned by nobody else.
            unsafe { access.zero_frame(frame) };
        }
        {
            // SAFETY: the root was just zeroed and is not shared yet.
            let mut table = unsafe { access.table(root) };
            for (slot, &frame) in slots.clone().zip(&frames[1..]) {
                table.set(slot, PageEntry::table_link(frame, false));
            }
        }

        let mut ranges = RangeAllocator::new();
        let dynamic = kernel_dynamic_range(&slots);
        ranges.initialize_with_range(dynamic.base(), dynamic.size());

        info!(
            "kernel page directory at {root}: {} shared slots, ranges {dynamic}",
            slots.len()
        );
        Ok(Self {
            root,
            ranges: SpinLock::new(ranges),
            tree: SpinLock::new(TranslationTree::new(root)),
            shared_slots: 0..0,
            registered: false,
            released: false,
        })
    }

    /// Build the directory of a new userspace address space.
    ///
    /// Without `parent_allocator` the userspace range starts at a random
    /// offset above the configured base. With one, its exact bounds are
    /// inherited (a fork does not re-randomize); its holes are not.
    ///
    /// # Errors
    /// [`MemoryError::DirectoryConstruction`] if a frame cannot be
    /// allocated; none stay allocated in that case.
    pub fn create_for_userspace<P: Platform>(
        mm: &MemoryManager<P>,
        parent_allocator: Option<&RangeAllocator>,
    ) -> Result<Self, MemoryError> {
        let zones = mm.zones();
        let mut alloc = &**zones;
        let access = mm.table_access();

        let Some(root) = zones.allocate_frame() else {
            warn!("no frame for a new page directory root");
            return Err(MemoryError::DirectoryConstruction);
        };
        let mut frames = TableFrames::new();
        if !frames.fill(&mut alloc) {
            frames.release(&mut alloc);
            zones.free_frame(root);
            warn!("no frames for the tables of a new page directory");
            return Err(MemoryError::DirectoryConstruction);
        }

        // SAFETY: freshly allocated root.
        unsafe { access.zero_frame(root) };
        let shared_slots = mm.config().shared_slots();
        let mut tree = TranslationTree::new(root);
        tree.share_top_level_slots(&access, mm.kernel_directory().root(), shared_slots.clone());

        let mut ranges = RangeAllocator::new();
        if let Some(parent) = parent_allocator {
            ranges.initialize_from_parent(parent);
        } else {
            let config = mm.config();
            let base = config.userspace_base + mm.aslr_offset();
            let Some(size) = config.userspace_ceiling.offset_from(base) else {
                tree.release_tables(&access, shared_slots, &mut |f| zones.free_frame(f));
                frames.release(&mut alloc);
                return Err(MemoryError::DirectoryConstruction);
            };
            ranges.initialize_with_range(base, size);
        }

        // The first mappings of a process land at the start of its range.
        let first = ranges.total_range().base();
        if let Err(e) = tree.prepare_path(&access, first, true, &mut frames) {
            warn!("cannot prepare the tables for {first}: {e}");
            tree.release_tables(&access, shared_slots, &mut |f| zones.free_frame(f));
            frames.release(&mut alloc);
            return Err(MemoryError::DirectoryConstruction);
        }
        frames.release(&mut alloc);

        debug!(
            "page directory at {root}: userspace {}, {} tables",
            ranges.total_range(),
            tree.table_count()
        );
        Ok(Self {
            root,
            ranges: SpinLock::new(ranges),
            tree: SpinLock::new(tree),
            shared_slots,
            registered: false,
            released: false,
        })
    }

    /// Physical address of the root table.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Make `space` findable through its root.
    pub(crate) fn register<P: Platform>(
        &mut self,
        registry: &DirectoryRegistry<P>,
        space: Weak<Space<P>>,
    ) {
        registry.register(self.root, space);
        self.registered = true;
    }

    /// Deregister and free every table this directory owns.
    pub fn release<P: Platform>(&mut self, mm: &MemoryManager<P>) {
        if self.registered {
            mm.registry().deregister(self.root);
            self.registered = false;
        }
        self.release_tables(&mm.table_access(), mm.zones());
    }

    /// Free every table this directory owns. Idempotent.
    pub(crate) fn release_tables<M: PhysMapper>(
        &mut self,
        access: &TableAccess<'_, M>,
        zones: &ZoneAllocator,
    ) {
        if self.released {
            return;
        }
        let tree = core::mem::replace(self.tree.get_mut(), TranslationTree::new(self.root));
        let freed = tree.release_tables(access, self.shared_slots.clone(), &mut |frame| {
            zones.free_frame(frame);
        });
        self.released = true;
        debug!("page directory {} released {freed} table frames", self.root);
    }

    /// Bounds of the virtual range allocator.
    #[must_use]
    pub fn total_range(&self) -> Range {
        self.ranges.with_lock(|r| r.total_range())
    }

    /// Free holes of the virtual range allocator, sorted by base.
    #[must_use]
    pub fn available_ranges(&self) -> Vec<Range> {
        self.ranges.with_lock(|r| r.available_ranges().to_vec())
    }

    /// Copy of the range allocator, as the parent of a forked directory.
    #[must_use]
    pub fn range_allocator(&self) -> RangeAllocator {
        self.ranges.with_lock(|r| r.clone())
    }

    pub fn allocate_anywhere(&self, size: u64, alignment: u64) -> Option<Range> {
        self.ranges
            .with_lock(|r| r.allocate_anywhere(size, alignment))
    }

    pub fn allocate_specific(&self, base: VirtualAddress, size: u64) -> Option<Range> {
        self.ranges.with_lock(|r| r.allocate_specific(base, size))
    }

    /// # Panics
    /// As [`RangeAllocator::deallocate`].
    pub fn deallocate(&self, range: Range) {
        self.ranges.with_lock(|r| r.deallocate(range));
    }

    /// Intermediate tables created since construction (diagnostics).
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tree.with_lock(|t| t.table_count())
    }

    /// Translate `va`.
    #[must_use]
    pub fn query<P: Platform>(
        &self,
        mm: &MemoryManager<P>,
        va: VirtualAddress,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        let access = mm.table_access();
        self.tree.with_lock(|t| t.query(&access, va))
    }

    /// Map one page, allocating intermediate tables as needed.
    ///
    /// Must not be called with an address space lock held: table frames come
    /// from the zone allocator.
    ///
    /// # Errors
    /// - [`MemoryError::OutOfMemory`] if a table frame cannot be allocated.
    /// - [`MemoryError::Map`] if `va` is mapped already or not canonical.
    pub fn map_page<P: Platform>(
        &self,
        mm: &MemoryManager<P>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MemoryError> {
        let mut frames = TableFrames::new();
        let result = self.map_page_with_frames(mm, va, pa, flags, &mut frames);
        if result != Err(MemoryError::Map(MapError::OutOfTableFrames)) {
            return result;
        }

        // A partly filled stash may still cover the missing tables.
        let mut alloc = &**mm.zones();
        let _ = frames.fill(&mut alloc);
        let result = match self.map_page_with_frames(mm, va, pa, flags, &mut frames) {
            Err(MemoryError::Map(MapError::OutOfTableFrames)) => Err(MemoryError::OutOfMemory),
            other => other,
        };
        frames.release(&mut alloc);
        result
    }

    /// Map one page, taking intermediate tables from `frames` only.
    ///
    /// Safe to call under address space locks.
    ///
    /// # Errors
    /// [`MemoryError::Map`] on any tree error, including an empty stash.
    pub fn map_page_with_frames<P: Platform>(
        &self,
        mm: &MemoryManager<P>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
        frames: &mut TableFrames,
    ) -> Result<(), MemoryError> {
        let access = mm.table_access();
        self.tree
            .with_lock(|t| t.map_page(&access, va, pa, flags, frames))
            .map_err(MemoryError::from)
    }

    /// Remove every mapping in `range` and flush the TLB for it.
    ///
    /// The unmapped frames are not freed. Returns how many pages were mapped.
    pub fn unmap_range<P: Platform>(&self, mm: &MemoryManager<P>, range: Range) -> u64 {
        let access = mm.table_access();
        let pages = range.page_count();
        let unmapped = self.tree.with_lock(|tree| {
            (0..pages)
                .map(|i| range.base() + i * PAGE_SIZE)
                .filter(|&va| tree.unmap_page(&access, va).is_ok())
                .count() as u64
        });
        if unmapped > 0 {
            mm.platform().flush_pages(self.root, range.base(), pages);
        }
        unmapped
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        if !self.released {
            warn!("page directory {} dropped without releasing its tables", self.root);
        }
    }
}

impl core::fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageDirectory")
            .field("root", &self.root)
            .field("shared_slots", &self.shared_slots)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

/// `count` frames, or none at all.
fn allocate_frames(zones: &ZoneAllocator, count: usize) -> Option<Vec<PhysicalAddress>> {
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        if let Some(frame) = zones.allocate_frame() {
            frames.push(frame);
        } else {
            for frame in frames {
                zones.free_frame(frame);
            }
            return None;
        }
    }
    Some(frames)
}

/// Canonical base address of root slot `slot`.
const fn slot_base(slot: usize) -> VirtualAddress {
    let raw = slot as u64 * TableLevel::Root.entry_span();
    if raw & (1 << 47) == 0 {
        VirtualAddress::new(raw)
    } else {
        VirtualAddress::new(raw | 0xFFFF_0000_0000_0000)
    }
}

/// The kernel's allocatable window: the shared slots, above the direct map
/// and below the kernel image.
fn kernel_dynamic_range(slots: &core::ops::Range<usize>) -> Range {
    let base = slot_base(slots.start).max(VirtualAddress::new(KERNEL_DYNAMIC_BASE));
    Range::from_bounds(base, VirtualAddress::new(KERNEL_BASE)).unwrap_or(Range::new(base, 0))
}
