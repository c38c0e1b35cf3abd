//! # Page Faults
//!
//! Demand paging for userspace regions. The handler runs in fault context:
//! it never waits for the region lock and never allocates while holding it.
//!
//! 1. Find the space by translation root, then the region by address.
//! 2. Check the access against the region's permissions.
//! 3. Allocate a zeroed frame if the page is uncommitted, with no lock held.
//! 4. Under the region lock, re-check that the region is still installed,
//!    commit the frame to the VM object and install the leaf mapping.
//! 5. If the path to the page lacks tables, allocate them unlocked and
//!    repeat step 4.
//! 6. Give back whatever was not used.

use crate::{AccessKind, MemoryError, MemoryManager, Platform, Region, Space};
use alloc::sync::Arc;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Range, VirtualAddress};
use kernel_vmem::{MapError, TableFrames};
use log::{debug, trace, warn};

/// A page fault as reported by the trap handler.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub access: AccessKind,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, access: AccessKind) -> Self {
        Self { address, access }
    }
}

/// What the trap handler should do next.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PageFaultResponse {
    /// Resume the faulting instruction.
    Continue,
    /// The access was invalid; terminate the offender.
    ShouldCrash,
    /// The access was valid but no memory is left to back it.
    OutOfMemory,
}

impl<P: Platform> MemoryManager<P> {
    /// Resolve a fault that happened while `root` was the active tree.
    pub fn handle_page_fault(&self, root: PhysicalAddress, fault: PageFault) -> PageFaultResponse {
        let Some(space) = self.find_space(root) else {
            debug!("fault at {} in unknown address space {root}", fault.address);
            return PageFaultResponse::ShouldCrash;
        };
        space.handle_fault(fault)
    }
}

impl<P: Platform> Space<P> {
    pub(crate) fn handle_fault(&self, fault: PageFault) -> PageFaultResponse {
        let page = fault.address.page_base();
        let Some(range) = Range::checked_new(page, PAGE_SIZE) else {
            return PageFaultResponse::ShouldCrash;
        };

        let Some(lookup) = self.regions.try_lock().map(|r| r.find_region_containing(range))
        else {
            trace!("region lock contended while handling {}", fault.address);
            return PageFaultResponse::Continue;
        };
        let Some(region) = lookup else {
            debug!("fault at {}: no region", fault.address);
            return PageFaultResponse::ShouldCrash;
        };
        if !region.access().permits(fault.access) {
            debug!(
                "fault at {}: {:?} not permitted in '{}' ({:?})",
                fault.address,
                fault.access,
                region.name(),
                region.access()
            );
            return PageFaultResponse::ShouldCrash;
        }
        let Some(index) = region.vmobject_page_index(page) else {
            return PageFaultResponse::ShouldCrash;
        };

        let mm = self.memory_manager();
        let mut spare = if region.vmobject().frame_at(index).is_none() {
            match mm.allocate_zeroed_frame() {
                Ok(frame) => Some(frame),
                Err(_) => return PageFaultResponse::OutOfMemory,
            }
        } else {
            None
        };
        let mut frames = TableFrames::new();
        let mut alloc = &**mm.zones();
        let mut attempt = self.install_page(&region, range, index, &mut spare, &mut frames);
        if attempt.is_err() {
            if !frames.fill(&mut alloc) {
                debug!(
                    "fault at {}: only {} table frames available",
                    fault.address,
                    frames.len()
                );
            }
            attempt = self.install_page(&region, range, index, &mut spare, &mut frames);
        }
        let response = attempt.unwrap_or(PageFaultResponse::OutOfMemory);

        frames.release(&mut alloc);
        if let Some(unused) = spare {
            mm.free_frame(unused);
        }
        response
    }

    /// Step 4 of the fault path; runs under the region lock.
    ///
    /// Fails only with [`MapError::OutOfTableFrames`], when `frames` could
    /// not supply a missing table.
    fn install_page(
        &self,
        region: &Arc<Region>,
        range: Range,
        index: usize,
        spare: &mut Option<PhysicalAddress>,
        frames: &mut TableFrames,
    ) -> Result<PageFaultResponse, MapError> {
        let Some(regions) = self.regions.try_lock() else {
            return Ok(PageFaultResponse::Continue);
        };
        let still_installed = regions
            .find_region_containing(range)
            .is_some_and(|current| Arc::ptr_eq(&current, region));
        if !still_installed {
            // Unmapped or reprotected meanwhile; the retried access decides.
            return Ok(PageFaultResponse::Continue);
        }

        let Some(frame) = region.vmobject().commit_page(index, spare) else {
            return Ok(PageFaultResponse::OutOfMemory);
        };
        let page = range.base();
        let mm = self.memory_manager();
        let result = self
            .directory()
            .map_page_with_frames(mm, page, frame, region.page_flags(), frames);
        drop(regions);

        match result {
            Ok(()) => {
                trace!("mapped {page} -> {frame} for '{}'", region.name());
                Ok(PageFaultResponse::Continue)
            }
            Err(MemoryError::Map(MapError::AlreadyMapped)) => Ok(PageFaultResponse::Continue),
            Err(MemoryError::Map(MapError::OutOfTableFrames)) => Err(MapError::OutOfTableFrames),
            Err(e) => {
                warn!("cannot map {page} -> {frame}: {e}");
                Ok(PageFaultResponse::ShouldCrash)
            }
        }
    }
}
