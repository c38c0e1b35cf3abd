//! Runtime options of the memory manager.

use crate::MemoryError;
use core::ops::Range;
use kernel_info::memory::{
    ASLR_MAX_OFFSET, KERNEL_SHARED_SLOTS, TABLE_ENTRIES, USERSPACE_RANGE_BASE,
    USERSPACE_RANGE_CEILING, VIRTUAL_ADDRESS_BITS,
};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::TableLevel;
use utils_accessors_derive::Setters;

/// Options fixed when the [`MemoryManager`](crate::MemoryManager) is built.
///
/// ```
/// # use kernel_mm::MemoryManagerConfig;
/// let config = MemoryManagerConfig::default()
///     .with_aslr_seed(0x5eed)
///     .with_kernel_shared_slots(4);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.shared_slots(), 508..512);
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Setters)]
pub struct MemoryManagerConfig {
    /// Randomize the base of every new userspace range (not inherited ones).
    pub aslr: bool,
    /// Seed for the ASLR generator; the kernel passes boot-time entropy.
    pub aslr_seed: u64,
    /// Top-level slots, counted from the end of the root table, shared by
    /// every address space with the kernel.
    pub kernel_shared_slots: usize,
    /// Lowest userspace address before the random offset is applied.
    pub userspace_base: VirtualAddress,
    /// One past the highest userspace address.
    pub userspace_ceiling: VirtualAddress,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            aslr: true,
            aslr_seed: 0,
            kernel_shared_slots: KERNEL_SHARED_SLOTS,
            userspace_base: VirtualAddress::new(USERSPACE_RANGE_BASE),
            userspace_ceiling: VirtualAddress::new(USERSPACE_RANGE_CEILING),
        }
    }
}

impl MemoryManagerConfig {
    /// Root table indices shared with the kernel directory.
    #[must_use]
    pub const fn shared_slots(&self) -> Range<usize> {
        TABLE_ENTRIES - self.kernel_shared_slots..TABLE_ENTRIES
    }

    /// Check that the options describe a usable layout.
    ///
    /// # Errors
    /// [`MemoryError::InvalidConfiguration`] if the userspace bounds are not
    /// page aligned, leave no room for the ASLR window, or reach into a
    /// shared slot, or if the shared slot count is outside `1..=256`.
    pub fn validate(&self) -> Result<(), MemoryError> {
        let base = self.userspace_base;
        let ceiling = self.userspace_ceiling;
        let aslr_room = if self.aslr { ASLR_MAX_OFFSET } else { 0 };

        let valid = (1..=TABLE_ENTRIES / 2).contains(&self.kernel_shared_slots)
            && base.is_page_aligned()
            && ceiling.is_page_aligned()
            && base
                .checked_add(aslr_room)
                .is_some_and(|lowest| lowest < ceiling)
            && ceiling.as_u64() <= 1 << (VIRTUAL_ADDRESS_BITS - 1)
            && TableLevel::Root.index_of(VirtualAddress::new(ceiling.as_u64() - 1))
                < self.shared_slots().start;

        if valid {
            Ok(())
        } else {
            Err(MemoryError::InvalidConfiguration)
        }
    }
}
