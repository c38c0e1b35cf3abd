//! # Kernel Memory Configuration
//!
//! This crate defines the memory layout constants and the boot memory map
//! types shared by the memory management crates. It is the single source of
//! truth for the address space layout; runtime configuration derives its
//! defaults from here.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (48-bit, 4-level):
//!
//! 0x0000_0000_0000_0000  ┌─────────────────────────────────┐
//!                        │         (unmapped)              │
//! USERSPACE_RANGE_BASE   ├─────────────────────────────────┤ 0x0000_0000_0080_0000
//!                        │  + random offset [0, 32 MiB)    │
//!                        │         User Space              │
//! USERSPACE_RANGE_CEILING├─────────────────────────────────┤ 0x0000_7fff_0000_0000
//!                        │     Non-canonical hole          │
//! KERNEL_SPACE_BASE      ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                        │  Shared kernel top-level slots  │
//! HHDM_BASE              ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                        │   Higher Half Direct Mapping    │
//! KERNEL_DYNAMIC_BASE    ├─────────────────────────────────┤ 0xffff_c900_0000_0000
//!                        │  Kernel range allocator window  │
//! KERNEL_BASE            ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                        │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF  └─────────────────────────────────┘
//! ```
//!
//! ### Boot Memory Map ([`boot`])
//! * [`PhysicalMemoryRange`](boot::PhysicalMemoryRange): one typed entry of
//!   the bootloader's physical memory map.
//! * Only [`Usable`](boot::MemoryRangeKind::Usable) ranges are handed to the
//!   physical zone allocator.
//!
//! ### Memory Layout ([`memory`])
//! * Address space bounds for userspace and the shared kernel half.
//! * Physical zone geometry and the ASLR window.
//! * Compile-time assertions keep the constants consistent.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
