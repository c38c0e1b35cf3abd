//! # Kernel Memory Manager
//!
//! Address spaces on top of the physical and virtual allocators:
//!
//! ```text
//!  MemoryManager ── ZoneAllocator, QuickMapPool, ASLR generator
//!   ├── kernel PageDirectory (owns the shared top-level slots)
//!   └── DirectoryRegistry: root ──weak──► Space
//!                                          ├── PageDirectory
//!                                          │    ├── RangeAllocator
//!                                          │    └── TranslationTree
//!                                          └── RegionTree
//!                                               └── Region ──► VmObject
//! ```
//!
//! - [`MemoryManager`]: the context built once at boot; everything that
//!   would otherwise be global lives here.
//! - [`Space`]: one process's address space. Created with
//!   [`Space::create`], destroyed when the last `Arc` goes away.
//! - [`Region`] / [`VmObject`]: what is mapped where, and the memory
//!   behind it.
//! - [`MemoryManager::handle_page_fault`]: demand paging.
//!
//! ## Platform
//!
//! The hardware seams are the [`PhysMapper`] (how the kernel reaches a
//! physical frame) and [`TlbFlush`] (how stale translations are shot down).
//! Anything implementing both is a [`Platform`].
//!
//! ## Locking
//!
//! See [`space`] for the lock order. Every lock is a
//! [`kernel_sync::SpinLock`]; nothing in this crate sleeps.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod config;
mod error;
mod fault;
mod memory_manager;
mod page_directory;
mod region;
mod region_tree;
mod registry;
pub mod space;
mod vmobject;

pub use crate::config::MemoryManagerConfig;
pub use crate::error::MemoryError;
pub use crate::fault::{PageFault, PageFaultResponse};
pub use crate::memory_manager::{MemoryManager, MemoryStats};
pub use crate::page_directory::PageDirectory;
pub use crate::region::{Access, AccessKind, Region, RegionFlags};
pub use crate::region_tree::RegionTree;
pub use crate::registry::DirectoryRegistry;
pub use crate::space::Space;
pub use crate::vmobject::{CommittedPages, InodeId, VmObject};

use kernel_vmem::{PhysMapper, TlbFlush};

/// The hardware services the memory manager runs on.
pub trait Platform: PhysMapper + TlbFlush + Send + Sync {}

impl<T: PhysMapper + TlbFlush + Send + Sync> Platform for T {}
