#![allow(dead_code)]

use kernel_info::boot::{MemoryRangeKind, PhysicalMemoryRange};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_mm::{MemoryManager, MemoryManagerConfig};
use kernel_vmem::{PageTable, PhysMapper, TlbFlush};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A 4 KiB-aligned raw frame of test RAM.
#[repr(align(4096))]
pub struct Aligned4K(pub [u8; 4096]);

/// Test RAM: physical address `n * 4096` is frame `n`. Also counts TLB
/// flushes.
pub struct TestPlatform {
    frames: Vec<UnsafeCell<Aligned4K>>,
    flushed_pages: AtomicU64,
    flushes: Mutex<Vec<(PhysicalAddress, VirtualAddress, u64)>>,
}

// SAFETY: frames are only touched through the memory manager, which
// serializes access to every frame it hands out.
unsafe impl Sync for TestPlatform {}

impl TestPlatform {
    pub fn with_frames(n: usize) -> Self {
        Self {
            frames: (0..n).map(|_| UnsafeCell::new(Aligned4K([0; 4096]))).collect(),
            flushed_pages: AtomicU64::new(0),
            flushes: Mutex::new(Vec::new()),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Copy of the bytes of the frame at `pa`.
    pub fn read_frame(&self, pa: PhysicalAddress) -> Vec<u8> {
        let frame: &mut Aligned4K = unsafe { self.phys_to_mut(pa.page_base()) };
        frame.0.to_vec()
    }

    /// Overwrite the frame at `pa` with `byte`.
    pub fn fill_frame(&self, pa: PhysicalAddress, byte: u8) {
        let frame: &mut Aligned4K = unsafe { self.phys_to_mut(pa.page_base()) };
        frame.0.fill(byte);
    }

    /// Copy of the table at `pa`.
    pub fn read_table(&self, pa: PhysicalAddress) -> PageTable {
        let table: &mut PageTable = unsafe { self.phys_to_mut(pa) };
        table.clone()
    }

    pub fn flushed_pages(&self) -> u64 {
        self.flushed_pages.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> Vec<(PhysicalAddress, VirtualAddress, u64)> {
        self.flushes.lock().unwrap().clone()
    }
}

impl PhysMapper for TestPlatform {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let idx = usize::try_from(pa.as_u64() / PAGE_SIZE).unwrap();
        assert_eq!(pa.offset_in_page(), 0);
        unsafe { &mut *self.frames[idx].get().cast::<T>() }
    }
}

impl TlbFlush for TestPlatform {
    fn flush_pages(&self, root: PhysicalAddress, first: VirtualAddress, count: u64) {
        self.flushed_pages.fetch_add(count, Ordering::Relaxed);
        self.flushes.lock().unwrap().push((root, first, count));
    }
}

/// Frames of test RAM; frame 0 is reserved so a zero entry never aliases
/// a real table.
pub const FRAMES: usize = 256;

/// Kernel slots shared in tests; keeps the kernel directory small.
pub const SHARED_SLOTS: usize = 2;

pub fn test_config() -> MemoryManagerConfig {
    MemoryManagerConfig::default()
        .with_kernel_shared_slots(SHARED_SLOTS)
        .with_aslr_seed(0x5EED)
}

pub fn memory_map(frames: usize) -> Vec<PhysicalMemoryRange> {
    vec![
        PhysicalMemoryRange::new(PhysicalAddress::zero(), PAGE_SIZE, MemoryRangeKind::Reserved),
        PhysicalMemoryRange::usable(PhysicalAddress::new(PAGE_SIZE), (frames as u64 - 1) * PAGE_SIZE),
    ]
}

pub fn manager_with(config: MemoryManagerConfig) -> Arc<MemoryManager<TestPlatform>> {
    MemoryManager::new(TestPlatform::with_frames(FRAMES), &memory_map(FRAMES), config)
        .expect("memory manager")
}

pub fn manager() -> Arc<MemoryManager<TestPlatform>> {
    manager_with(test_config())
}

/// Allocate frames until only `keep` pages are left; returns them for release.
pub fn exhaust(mm: &MemoryManager<TestPlatform>, keep: u64) -> Vec<PhysicalAddress> {
    let mut taken = Vec::new();
    while mm.zones().available_pages() > keep {
        taken.push(mm.zones().allocate_frame().expect("frame"));
    }
    taken
}
