//! # Physical Memory and Address Range Allocation
//!
//! The allocators underneath the memory manager:
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │        ZoneAllocator         │   │        RangeAllocator        │
//! │  sorted zones, one lock,     │   │  virtual holes per address   │
//! │  frame / contiguous requests │   │  space, first fit, coalesce  │
//! └──────────────┬───────────────┘   └──────────────────────────────┘
//!                │
//! ┌──────────────▼───────────────┐
//! │         PhysicalZone         │
//! │  binary buddy over 2 KiB     │
//! │  chunks, orders 0 to 12      │
//! └──────────────────────────────┘
//! ```
//!
//! - [`zone`]: one physically contiguous buddy zone. All metadata lives in
//!   fixed arrays sized at construction; allocation never recurses into the
//!   heap.
//! - [`zones`]: splits the boot memory map into 16 MiB and 1 MiB zones and
//!   routes requests. Implements [`kernel_vmem::FrameAlloc`] so translation
//!   tables can be fed from it.
//! - [`range_allocator`]: hands out page-granular virtual ranges.
//! - [`phys_mapper`]: the direct-map [`kernel_vmem::PhysMapper`].
//!
//! ## Locking
//! [`zones::ZoneAllocator`] owns a single spin lock and never calls out while
//! holding it, so it is always the innermost lock. [`range_allocator::RangeAllocator`]
//! does no locking of its own.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod phys_mapper;
pub mod range_allocator;
pub mod zone;
pub mod zones;
