//! # Boot Memory Map
//!
//! The physical memory map handed over by the bootloader, reduced to what the
//! memory manager needs to carve physical zones.

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, checked_align_up};

/// What a physical memory range may be used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRangeKind {
    /// Free RAM, available to the frame allocator.
    Usable,
    /// Firmware or device memory; never touched.
    Reserved,
    /// ACPI tables; reclaimable after the tables were parsed.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Memory reported defective by the firmware.
    BadMemory,
    /// The loaded kernel image and its boot-time structures.
    KernelImage,
}

/// One entry of the boot memory map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysicalMemoryRange {
    pub base: PhysicalAddress,
    pub size: u64,
    pub kind: MemoryRangeKind,
}

impl PhysicalMemoryRange {
    #[must_use]
    pub const fn new(base: PhysicalAddress, size: u64, kind: MemoryRangeKind) -> Self {
        Self { base, size, kind }
    }

    #[must_use]
    pub const fn usable(base: PhysicalAddress, size: u64) -> Self {
        Self::new(base, size, MemoryRangeKind::Usable)
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRangeKind::Usable)
    }

    /// The range shrunk inward to whole pages, as `(first page, page count)`.
    ///
    /// Returns `None` if no whole page fits or the range end overflows.
    #[must_use]
    pub const fn page_aligned(&self) -> Option<(PhysicalAddress, u64)> {
        let Some(end) = self.base.as_u64().checked_add(self.size) else {
            return None;
        };
        let Some(start) = checked_align_up(self.base.as_u64(), PAGE_SIZE) else {
            return None;
        };
        let end = end & !(PAGE_SIZE - 1);
        if end <= start {
            return None;
        }
        Some((PhysicalAddress::new(start), (end - start) / PAGE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment_shrinks_inward() {
        let r = PhysicalMemoryRange::usable(PhysicalAddress::new(0x1800), 0x3000);
        assert_eq!(r.page_aligned(), Some((PhysicalAddress::new(0x2000), 2)));

        let tiny = PhysicalMemoryRange::usable(PhysicalAddress::new(0x1001), 0x1000);
        assert_eq!(tiny.page_aligned(), None);
    }

    #[test]
    fn only_usable_ranges_are_usable() {
        let r = PhysicalMemoryRange::new(
            PhysicalAddress::new(0),
            0x1000,
            MemoryRangeKind::AcpiReclaimable,
        );
        assert!(!r.is_usable());
    }
}
