//! # Memory Manager Context
//!
//! [`MemoryManager`] is built once at boot and owns everything that would
//! otherwise be global: the zone allocator, the quickmap windows, the
//! root → space registry, the kernel page directory and the ASLR generator.
//! Every [`Space`] holds an `Arc` to it.

use crate::{DirectoryRegistry, MemoryError, MemoryManagerConfig, PageDirectory, Platform, Space};
use alloc::sync::Arc;
use kernel_alloc::zones::ZoneAllocator;
use kernel_info::boot::PhysicalMemoryRange;
use kernel_info::memory::{ASLR_GRANULE, ASLR_MAX_OFFSET};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{PageFlags, QuickMapPool, TableAccess, TableLevel, is_canonical};
use log::{info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Point-in-time counters of the memory manager.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MemoryStats {
    pub total_pages: u64,
    pub available_pages: u64,
    pub zone_count: usize,
    pub address_spaces: usize,
}

pub struct MemoryManager<P: Platform> {
    platform: P,
    config: MemoryManagerConfig,
    zones: Arc<ZoneAllocator>,
    windows: QuickMapPool,
    registry: DirectoryRegistry<P>,
    kernel_directory: PageDirectory,
    aslr: SpinLock<ChaCha20Rng>,
}

impl<P: Platform> MemoryManager<P> {
    /// Bring up physical and virtual memory management.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidConfiguration`] if `config` does not validate.
    /// - [`MemoryError::OutOfMemory`] if `memory_map` has no usable page.
    /// - [`MemoryError::DirectoryConstruction`] if the kernel directory
    ///   cannot be built.
    pub fn new(
        platform: P,
        memory_map: &[PhysicalMemoryRange],
        config: MemoryManagerConfig,
    ) -> Result<Arc<Self>, MemoryError> {
        config.validate()?;

        let zones = Arc::new(ZoneAllocator::from_memory_map(memory_map));
        if zones.total_pages() == 0 {
            warn!("boot memory map has no usable pages");
            return Err(MemoryError::OutOfMemory);
        }

        let windows = QuickMapPool::new();
        let kernel_directory = PageDirectory::allocate_kernel_directory(
            &TableAccess::new(&platform, &windows),
            &zones,
            &config,
        )?;

        info!(
            "memory manager up: {} pages in {} zones, aslr {}",
            zones.total_pages(),
            zones.zone_count(),
            if config.aslr { "on" } else { "off" }
        );
        Ok(Arc::new(Self {
            platform,
            config,
            zones,
            windows,
            registry: DirectoryRegistry::new(),
            kernel_directory,
            aslr: SpinLock::new(ChaCha20Rng::seed_from_u64(config.aslr_seed)),
        }))
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    #[inline]
    #[must_use]
    pub const fn zones(&self) -> &Arc<ZoneAllocator> {
        &self.zones
    }

    #[inline]
    #[must_use]
    pub const fn registry(&self) -> &DirectoryRegistry<P> {
        &self.registry
    }

    #[inline]
    #[must_use]
    pub const fn kernel_directory(&self) -> &PageDirectory {
        &self.kernel_directory
    }

    /// Table access through this manager's platform and quickmap windows.
    #[inline]
    #[must_use]
    pub const fn table_access(&self) -> TableAccess<'_, P> {
        TableAccess::new(&self.platform, &self.windows)
    }

    /// The space whose translation tree is rooted at `root`.
    #[must_use]
    pub fn find_space(&self, root: PhysicalAddress) -> Option<Arc<Space<P>>> {
        self.registry.find_by_root(root)
    }

    /// Allocate one frame and fill it with zeros.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if no zone has a free page.
    pub fn allocate_zeroed_frame(&self) -> Result<PhysicalAddress, MemoryError> {
        let frame = self
            .zones
            .allocate_frame()
            .ok_or(MemoryError::OutOfMemory)?;
        // SAFETY: the frame was just allocated and is not referenced elsewhere.
        unsafe { self.table_access().zero_frame(frame) };
        Ok(frame)
    }

    /// Return a frame from [`allocate_zeroed_frame`](Self::allocate_zeroed_frame).
    pub fn free_frame(&self, frame: PhysicalAddress) {
        self.zones.free_frame(frame);
    }

    /// Map a page into the shared kernel half, visible in every space.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidRange`] if `va` is not in a shared slot.
    /// - As [`PageDirectory::map_page`].
    pub fn map_kernel_page(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MemoryError> {
        if !is_canonical(va)
            || !self
                .config
                .shared_slots()
                .contains(&TableLevel::Root.index_of(va))
        {
            return Err(MemoryError::InvalidRange);
        }
        self.kernel_directory.map_page(self, va, pa, flags)
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_pages: self.zones.total_pages(),
            available_pages: self.zones.available_pages(),
            zone_count: self.zones.zone_count(),
            address_spaces: self.registry.len(),
        }
    }

    /// Random offset for a new userspace range: whole granules below the
    /// maximum, or zero with ASLR disabled.
    pub(crate) fn aslr_offset(&self) -> u64 {
        if !self.config.aslr {
            return 0;
        }
        let granules = ASLR_MAX_OFFSET / ASLR_GRANULE;
        self.aslr.with_lock(|rng| rng.gen_range(0..granules)) * ASLR_GRANULE
    }
}

impl<P: Platform> Drop for MemoryManager<P> {
    fn drop(&mut self) {
        let access = TableAccess::new(&self.platform, &self.windows);
        self.kernel_directory.release_tables(&access, &self.zones);
    }
}

impl<P: Platform> core::fmt::Debug for MemoryManager<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("kernel_directory", &self.kernel_directory)
            .finish_non_exhaustive()
    }
}
