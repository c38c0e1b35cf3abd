//! # Virtual Memory Support
//!
//! The hardware side of address spaces: a four-level, 512-entry translation
//! tree, edited through temporary quickmap windows.
//!
//! ## What you get
//! - [`PageEntry`] / [`PageFlags`]: raw table entries and the semantic
//!   permission view used by callers.
//! - [`PageTable`] and [`TableLevel`]: one 4 KiB node of the tree and the
//!   address bits that index it.
//! - [`QuickMapPool`]: a fixed pool of temporary windows with RAII release.
//! - [`TranslationTree`]: map / unmap / query of 4 KiB pages, sharing of
//!   top-level slots, and teardown.
//! - The platform seams [`FrameAlloc`], [`PhysMapper`] and [`TlbFlush`].
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! | Root  |  L3   |  L2   |  L1   | Offset |
//!
//!  Root  →  L3  →  L2  →  L1  →  4 KiB frame
//! ```
//!
//! Intermediate entries are created permissively (present, writable, user
//! when the leaf is user-accessible); the leaf entry restricts.
//!
//! The root's physical address identifies an address space. Top-level slots
//! covering the kernel half are copied from the kernel's root into every new
//! tree, so kernel mappings are visible everywhere without being duplicated.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod entry;
mod quickmap;
mod table;
mod tree;

pub use crate::entry::{PageEntry, PageFlags};
pub use crate::quickmap::{QuickMap, QuickMapPool};
pub use crate::table::{PageTable, TableLevel};
pub use crate::tree::{MapError, TableAccess, TableFrames, TranslationTree, is_canonical};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Source of **physical** 4 KiB frames for translation tables.
///
/// Returned frames **must** be 4 KiB aligned. Returns `None` on
/// out-of-memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalAddress);
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (e.g., via a higher-half direct map, HHDM).
///
/// Callers go through [`QuickMapPool::map`], which bounds how many frames
/// are in view at once.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable in the current address space for `'a`.
    /// - `T` must match the bytes at `pa`, and no other reference to them
    ///   may be live for `'a`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Invalidation of cached translations after a mapping was removed or
/// weakened.
pub trait TlbFlush {
    /// Invalidate `count` pages starting at `first` in the address space
    /// rooted at `root`, on every CPU that may cache them.
    fn flush_pages(&self, root: PhysicalAddress, first: VirtualAddress, count: u64);
}
