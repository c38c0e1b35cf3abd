//! # Kernel synchronization primitives
//!
//! A single primitive: a fair ticket [`SpinLock`]. Every lock of the memory
//! manager is one of these; none of them is ever held across a blocking wait.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
