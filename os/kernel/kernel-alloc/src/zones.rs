//! # Zone Allocator
//!
//! Selects a [`PhysicalZone`] for every physical allocation. Zones are carved
//! out of the usable ranges of the boot memory map: as many
//! [`LARGE_ZONE_SIZE`] zones as fit, then [`SMALL_ZONE_SIZE`] zones, then one
//! zone for whatever is left.
//!
//! All zones sit behind one [`SpinLock`], the zone-list lock. It is a leaf
//! lock: nothing else is ever acquired while it is held, and callers must not
//! hold any address-space lock when calling in here.

use crate::zone::{PhysicalZone, order_for_pages};
use alloc::vec::Vec;
use kernel_info::boot::PhysicalMemoryRange;
use kernel_info::memory::{LARGE_ZONE_SIZE, SMALL_ZONE_SIZE};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::SpinLock;
use kernel_vmem::FrameAlloc;
use log::{debug, info, warn};

/// Order of a block holding exactly one page.
pub const FRAME_ORDER: usize = 1;

/// All physical zones of the machine.
pub struct ZoneAllocator {
    /// Sorted by base address.
    zones: SpinLock<Vec<PhysicalZone>>,
    total_pages: u64,
}

impl ZoneAllocator {
    /// Build zones over every usable range of `memory_map`.
    #[must_use]
    pub fn from_memory_map(memory_map: &[PhysicalMemoryRange]) -> Self {
        let mut usable: Vec<(PhysicalAddress, u64)> = memory_map
            .iter()
            .filter(|r| r.is_usable())
            .filter_map(PhysicalMemoryRange::page_aligned)
            .collect();
        usable.sort_unstable_by_key(|&(base, _)| base);

        let mut zones = Vec::new();
        for (base, pages) in usable {
            split_into_zones(base, pages, &mut zones);
        }
        let total_pages = zones.iter().map(PhysicalZone::page_count).sum();
        info!(
            "zone allocator: {} zones, {} KiB usable",
            zones.len(),
            total_pages * PAGE_SIZE / 1024
        );

        Self {
            zones: SpinLock::new(zones),
            total_pages,
        }
    }

    /// Allocate a block of `2^order` chunks from the first zone that has one.
    pub fn allocate_block(&self, order: usize) -> Option<PhysicalAddress> {
        let found = self
            .zones
            .with_lock(|zones| zones.iter_mut().find_map(|z| z.allocate_block(order)));
        if found.is_none() {
            warn!("no zone can satisfy an order {order} allocation");
        }
        found
    }

    /// Allocate one 4 KiB frame.
    pub fn allocate_frame(&self) -> Option<PhysicalAddress> {
        self.allocate_block(FRAME_ORDER)
    }

    /// Allocate at least `pages` physically contiguous pages.
    ///
    /// The block is rounded up to a power of two; free it with
    /// [`free_contiguous`](Self::free_contiguous) and the same `pages`.
    pub fn allocate_contiguous(&self, pages: u64) -> Option<PhysicalAddress> {
        if pages == 0 {
            return None;
        }
        let Some(order) = order_for_pages(pages) else {
            warn!("{pages} contiguous pages exceed the largest block");
            return None;
        };
        self.allocate_block(order)
    }

    /// Return a block to the zone that owns it.
    ///
    /// # Panics
    /// Panics if no zone owns `addr`, or on any zone-level misuse.
    pub fn deallocate_block(&self, addr: PhysicalAddress, order: usize) {
        self.zones.with_lock(|zones| {
            let idx = zones.partition_point(|z| z.base() <= addr);
            match idx.checked_sub(1).map(|i| &mut zones[i]) {
                Some(zone) if zone.contains(addr) => zone.deallocate_block(addr, order),
                _ => panic!("{addr} is not owned by any physical zone"),
            }
        });
    }

    pub fn free_frame(&self, addr: PhysicalAddress) {
        self.deallocate_block(addr, FRAME_ORDER);
    }

    /// Return a block obtained from [`allocate_contiguous`](Self::allocate_contiguous).
    ///
    /// # Panics
    /// Panics if `pages` does not name a valid block size.
    pub fn free_contiguous(&self, addr: PhysicalAddress, pages: u64) {
        let Some(order) = order_for_pages(pages).filter(|_| pages > 0) else {
            panic!("{pages} pages cannot have come from allocate_contiguous");
        };
        self.deallocate_block(addr, order);
    }

    /// Free pages over all zones.
    #[must_use]
    pub fn available_pages(&self) -> u64 {
        self.zones
            .with_lock(|zones| zones.iter().map(PhysicalZone::available).sum())
    }

    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    #[must_use]
    pub fn zone_count(&self) -> usize {
        self.zones.with_lock(|zones| zones.len())
    }

    /// `(base, page_count)` of every zone, in address order.
    #[must_use]
    pub fn zone_layout(&self) -> Vec<(PhysicalAddress, u64)> {
        self.zones
            .with_lock(|zones| zones.iter().map(|z| (z.base(), z.page_count())).collect())
    }
}

/// Split `pages` pages at `base` into large, then small, then one trailing zone.
fn split_into_zones(mut base: PhysicalAddress, mut pages: u64, zones: &mut Vec<PhysicalZone>) {
    for zone_pages in [LARGE_ZONE_SIZE / PAGE_SIZE, SMALL_ZONE_SIZE / PAGE_SIZE] {
        while pages >= zone_pages {
            zones.push(PhysicalZone::new(base, zone_pages));
            debug!("zone at {base}: {zone_pages} pages");
            base = base + zone_pages * PAGE_SIZE;
            pages -= zone_pages;
        }
    }
    if pages > 0 {
        debug!("zone at {base}: {pages} pages (remainder)");
        zones.push(PhysicalZone::new(base, pages));
    }
}

impl FrameAlloc for &ZoneAllocator {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.allocate_frame()
    }

    fn free_4k(&mut self, frame: PhysicalAddress) {
        self.free_frame(frame);
    }
}
