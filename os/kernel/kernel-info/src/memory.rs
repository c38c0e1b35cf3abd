//! # Memory Layout
//!
//! Compile-time constants describing the virtual address space and the
//! physical zone geometry. Runtime tunables derive their defaults from here.

/// Size of a hardware page.
pub const PAGE_SIZE: u64 = 4096;

/// Number of entries in one translation table of any level.
pub const TABLE_ENTRIES: usize = 512;

/// Number of translation levels (root included).
pub const TRANSLATION_LEVELS: usize = 4;

/// Lowest address handed out to userspace mappings (before ASLR).
pub const USERSPACE_RANGE_BASE: u64 = 0x0000_0000_0080_0000; // 8 MiB

/// One past the highest address usable by userspace mappings.
pub const USERSPACE_RANGE_CEILING: u64 = 0x0000_7fff_0000_0000;

/// First address of the kernel half; top-level slots from here on are shared.
pub const KERNEL_SPACE_BASE: u64 = 0xffff_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the kernel's dynamically allocated virtual ranges, above the HHDM.
pub const KERNEL_DYNAMIC_BASE: u64 = 0xffff_c900_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Top-level slots (counted from the end of the root table) that every
/// address space shares with the kernel directory.
pub const KERNEL_SHARED_SLOTS: usize = 256;

/// Upper bound (exclusive) of the randomized userspace base offset.
pub const ASLR_MAX_OFFSET: u64 = 32 * 1024 * 1024;

/// Granularity of the randomized userspace base offset.
pub const ASLR_GRANULE: u64 = 1024 * 1024;

/// Preferred size of a physical zone.
pub const LARGE_ZONE_SIZE: u64 = 16 * 1024 * 1024;

/// Size of the zones used to cover what large zones leave over.
pub const SMALL_ZONE_SIZE: u64 = 1024 * 1024;

/// Number of temporary windows for mapping page-table frames.
pub const QUICKMAP_WINDOWS: usize = 16;

/// Number of address bits resolved by the translation tree.
pub const VIRTUAL_ADDRESS_BITS: u32 = 48;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(TABLE_ENTRIES * 8 == PAGE_SIZE as usize);
    assert!(USERSPACE_RANGE_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_RANGE_CEILING.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_RANGE_BASE + ASLR_MAX_OFFSET < USERSPACE_RANGE_CEILING);
    assert!(USERSPACE_RANGE_CEILING <= KERNEL_SPACE_BASE);
    assert!(HHDM_BASE >= KERNEL_SPACE_BASE);
    assert!(KERNEL_DYNAMIC_BASE > HHDM_BASE);
    assert!(KERNEL_BASE > KERNEL_DYNAMIC_BASE);
    assert!(KERNEL_SHARED_SLOTS <= TABLE_ENTRIES / 2);
    assert!(ASLR_MAX_OFFSET.is_multiple_of(ASLR_GRANULE));
    assert!(ASLR_GRANULE.is_multiple_of(PAGE_SIZE));
    assert!(LARGE_ZONE_SIZE.is_multiple_of(SMALL_ZONE_SIZE));
    assert!(SMALL_ZONE_SIZE.is_multiple_of(PAGE_SIZE));
};
