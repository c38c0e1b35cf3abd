//! # Quickmap Windows
//!
//! Page-table frames are not permanently mapped anywhere the kernel can
//! write them. To edit one, the kernel borrows one of a small, fixed number of
//! temporary windows, points it at the frame, and gives it back when done.
//!
//! [`QuickMapPool::map`] hands out a [`QuickMap`] guard; dropping the guard
//! releases the window, so a window can never leak on an early return.

use crate::PhysMapper;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::QUICKMAP_WINDOWS;
use kernel_memory_addresses::PhysicalAddress;

/// A fixed pool of temporary mapping windows.
pub struct QuickMapPool {
    in_use: [AtomicBool; QUICKMAP_WINDOWS],
}

impl QuickMapPool {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            in_use: [const { AtomicBool::new(false) }; QUICKMAP_WINDOWS],
        }
    }

    /// Claim a free window, if any.
    fn try_claim(&self) -> Option<usize> {
        self.in_use.iter().position(|slot| {
            slot.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        })
    }

    /// Claim a window, spinning while all are taken.
    ///
    /// Windows are only held for the duration of a single table edit, so the
    /// wait is bounded.
    fn claim(&self) -> usize {
        loop {
            if let Some(slot) = self.try_claim() {
                return slot;
            }
            spin_loop();
        }
    }

    /// Point a window at `pa` and view the frame as a `T`.
    ///
    /// # Safety
    /// - `pa` must be a frame the caller exclusively owns for the lifetime
    ///   of the guard (a table frame under the tree lock, or a fresh frame).
    /// - The bytes of the frame must be a valid `T`.
    pub unsafe fn map<'a, M: PhysMapper, T>(
        &'a self,
        mapper: &M,
        pa: PhysicalAddress,
    ) -> QuickMap<'a, T> {
        debug_assert!(pa.is_page_aligned());
        let slot = self.claim();
        // SAFETY: forwarded from the caller.
        let target = unsafe { mapper.phys_to_mut::<T>(pa) };
        QuickMap {
            pool: self,
            slot,
            target,
        }
    }

    /// Number of windows currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed))
            .count()
    }
}

impl Default for QuickMapPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A borrowed window onto one physical frame; released on drop.
pub struct QuickMap<'a, T> {
    pool: &'a QuickMapPool,
    slot: usize,
    target: &'a mut T,
}

impl<T> QuickMap<'_, T> {
    /// Index of the window in its pool.
    #[must_use]
    pub const fn window(&self) -> usize {
        self.slot
    }
}

impl<T> Deref for QuickMap<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.target
    }
}

impl<T> DerefMut for QuickMap<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.target
    }
}

impl<T> Drop for QuickMap<'_, T> {
    fn drop(&mut self) {
        self.pool.in_use[self.slot].store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::UnsafeCell;

    /// Four fake frames, addressed by frame number.
    struct Frames([UnsafeCell<u64>; 4]);

    impl Frames {
        fn new() -> Self {
            Self([const { UnsafeCell::new(0) }; 4])
        }
    }

    impl PhysMapper for Frames {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = usize::try_from(pa.as_u64() >> 12).unwrap();
            unsafe { &mut *self.0[idx].get().cast::<T>() }
        }
    }

    fn frame(n: u64) -> PhysicalAddress {
        PhysicalAddress::new(n << 12)
    }

    #[test]
    fn windows_are_released_on_drop() {
        let pool = QuickMapPool::new();
        let frames = Frames::new();
        {
            let mut a: QuickMap<'_, u64> = unsafe { pool.map(&frames, frame(0)) };
            *a = 42;
            assert_eq!(pool.in_use(), 1);
            assert_eq!(a.window(), 0);
        }
        assert_eq!(pool.in_use(), 0);

        let a: QuickMap<'_, u64> = unsafe { pool.map(&frames, frame(0)) };
        assert_eq!(*a, 42);
    }

    #[test]
    fn distinct_windows_while_held() {
        let pool = QuickMapPool::new();
        let frames = Frames::new();
        let a: QuickMap<'_, u64> = unsafe { pool.map(&frames, frame(1)) };
        let b: QuickMap<'_, u64> = unsafe { pool.map(&frames, frame(2)) };
        assert_ne!(a.window(), b.window());
        drop(a);
        let c: QuickMap<'_, u64> = unsafe { pool.map(&frames, frame(3)) };
        assert_eq!(c.window(), 0);
        drop((b, c));
        assert_eq!(pool.in_use(), 0);
    }
}
