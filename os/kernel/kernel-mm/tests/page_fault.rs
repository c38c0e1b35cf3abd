mod common;

use common::{exhaust, manager};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_mm::{
    Access, AccessKind, PageFault, PageFaultResponse, RegionFlags, Space, VmObject,
};
use std::sync::Arc;

fn fault_at(va: VirtualAddress, access: AccessKind) -> PageFault {
    PageFault::new(va, access)
}

#[test]
fn anonymous_faults_map_zeroed_frames() {
    let mm = manager();
    let space = Space::create(&mm, None).unwrap();
    let region = space
        .allocate_region(None, 4 * PAGE_SIZE, Access::READ_WRITE, "heap", RegionFlags::default())
        .unwrap();

    // Dirty every free frame first.
    let dirty = exhaust(&mm, 0);
    for &frame in &dirty {
        mm.platform().fill_frame(frame, 0xCC);
    }
    for frame in dirty {
        mm.free_frame(frame);
    }

    let va = region.range().base() + 2 * PAGE_SIZE + 0x123;
    assert_eq!(
        mm.handle_page_fault(space.root(), fault_at(va, AccessKind::Read)),
        PageFaultResponse::Continue
    );
    let (pa, flags) = space.query(va).unwrap();
    assert_eq!(pa.offset_in_page(), 0x123);
    assert!(flags.user && flags.writable && flags.no_execute);
    assert!(mm.platform().read_frame(pa).iter().all(|&b| b == 0));
    assert_eq!(region.vmobject().committed_pages(), 1);
    assert_eq!(region.vmobject().frame_at(2), Some(pa.page_base()));
}

#[test]
fn repeated_faults_reuse_the_committed_frame() {
    let mm = manager();
    let space = Space::create(&mm, None).unwrap();
    let region = space
        .allocate_region(None, PAGE_SIZE, Access::READ_WRITE, "stack", RegionFlags::default().with_stack(true))
        .unwrap();
    let va = region.range().base();

    let fault = fault_at(va, AccessKind::Write);
    assert_eq!(mm.handle_page_fault(space.root(), fault), PageFaultResponse::Continue);
    let (first, _) = space.query(va).unwrap();
    let available = mm.zones().available_pages();

    // A second CPU raced on the same page.
    assert_eq!(mm.handle_page_fault(space.root(), fault), PageFaultResponse::Continue);
    assert_eq!(space.query(va).map(|(pa, _)| pa), Some(first));
    assert_eq!(mm.zones().available_pages(), available);
    assert_eq!(region.vmobject().committed_pages(), 1);
}

#[test]
fn invalid_accesses_crash() {
    let mm = manager();
    let space = Space::create(&mm, None).unwrap();
    let text = space
        .allocate_region(None, PAGE_SIZE, Access::READ_EXECUTE, "text", RegionFlags::default())
        .unwrap();
    let data = space
        .allocate_region(None, PAGE_SIZE, Access::READ_ONLY, "rodata", RegionFlags::default())
        .unwrap();
    let root = space.root();

    let crash = |va, access| mm.handle_page_fault(root, fault_at(va, access));
    assert_eq!(crash(text.range().base(), AccessKind::Write), PageFaultResponse::ShouldCrash);
    assert_eq!(crash(data.range().base(), AccessKind::Execute), PageFaultResponse::ShouldCrash);
    assert_eq!(crash(data.range().end(), AccessKind::Read), PageFaultResponse::ShouldCrash);
    assert_eq!(crash(VirtualAddress::new(0), AccessKind::Read), PageFaultResponse::ShouldCrash);
    assert!(space.query(text.range().base()).is_none());

    assert_eq!(crash(text.range().base(), AccessKind::Execute), PageFaultResponse::Continue);
}

#[test]
fn unknown_roots_crash() {
    let mm = manager();
    let space = Space::create(&mm, None).unwrap();
    let region = space
        .allocate_region(None, PAGE_SIZE, Access::READ_WRITE, "heap", RegionFlags::default())
        .unwrap();
    let fault = fault_at(region.range().base(), AccessKind::Read);

    assert_eq!(
        mm.handle_page_fault(PhysicalAddress::new(0xDEAD_0000), fault),
        PageFaultResponse::ShouldCrash
    );
    assert_eq!(
        mm.handle_page_fault(mm.kernel_directory().root(), fault),
        PageFaultResponse::ShouldCrash
    );
}

#[test]
fn exhausted_memory_is_reported() {
    let mm = manager();
    let space = Space::create(&mm, None).unwrap();
    let region = space
        .allocate_region(None, PAGE_SIZE, Access::READ_WRITE, "heap", RegionFlags::default())
        .unwrap();
    let taken = exhaust(&mm, 0);

    let fault = fault_at(region.range().base(), AccessKind::Write);
    assert_eq!(mm.handle_page_fault(space.root(), fault), PageFaultResponse::OutOfMemory);
    assert_eq!(region.vmobject().committed_pages(), 0);
    assert_eq!(mm.zones().available_pages(), 0);

    for frame in taken {
        mm.free_frame(frame);
    }
    assert_eq!(mm.handle_page_fault(space.root(), fault), PageFaultResponse::Continue);
}

#[test]
fn shared_objects_map_the_same_frame_everywhere() {
    let mm = manager();
    let a = Space::create(&mm, None).unwrap();
    let b = Space::create(&mm, None).unwrap();
    let object = Arc::new(VmObject::file(Arc::clone(mm.zones()), 7, true, 2));

    let map = |space: &Space<common::TestPlatform>| {
        space
            .allocate_region_with_vmobject(
                None,
                2 * PAGE_SIZE,
                Arc::clone(&object),
                0,
                Access::READ_WRITE,
                "shm",
                RegionFlags::default().with_shared(true).with_mmap(true),
            )
            .unwrap()
    };
    let ra = map(&a);
    let rb = map(&b);

    let va_a = ra.range().base() + PAGE_SIZE;
    let va_b = rb.range().base() + PAGE_SIZE;
    assert_eq!(
        mm.handle_page_fault(a.root(), fault_at(va_a, AccessKind::Write)),
        PageFaultResponse::Continue
    );
    assert_eq!(
        mm.handle_page_fault(b.root(), fault_at(va_b, AccessKind::Read)),
        PageFaultResponse::Continue
    );
    assert_eq!(a.query(va_a).map(|(pa, _)| pa), b.query(va_b).map(|(pa, _)| pa));
    assert_eq!(object.committed_pages(), 1);
}

#[test]
fn concurrent_faults_commit_each_page_once() {
    let mm = manager();
    let space = Space::create(&mm, None).unwrap();
    let region = space
        .allocate_region(None, 16 * PAGE_SIZE, Access::READ_WRITE, "heap", RegionFlags::default())
        .unwrap();
    let base = region.range().base();

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let mm = &mm;
            let space = &space;
            let root = space.root();
            s.spawn(move || {
                for i in 0..16 {
                    let va = base + ((i + t * 4) % 16) * PAGE_SIZE;
                    // A contended region lock asks for a retry.
                    while mm.handle_page_fault(root, fault_at(va, AccessKind::Write))
                        == PageFaultResponse::Continue
                        && space.query(va).is_none()
                    {}
                }
            });
        }
    });

    let mut frames: Vec<PhysicalAddress> = (0..16)
        .map(|i| space.query(base + i * PAGE_SIZE).unwrap().0)
        .collect();
    frames.sort();
    frames.dedup();
    assert_eq!(frames.len(), 16);
    assert_eq!(region.vmobject().committed_pages(), 16);
}

#[test]
fn the_last_free_frame_backs_a_page_under_existing_tables() {
    let mm = manager();
    let space = Space::create(&mm, None).unwrap();
    let region = space
        .allocate_region(None, 2 * PAGE_SIZE, Access::READ_WRITE, "heap", RegionFlags::default())
        .unwrap();
    let base = region.range().base();
    assert_eq!(
        mm.handle_page_fault(space.root(), fault_at(base, AccessKind::Write)),
        PageFaultResponse::Continue
    );
    let tables = space.directory().table_count();

    let taken = exhaust(&mm, 1);
    let second = base + PAGE_SIZE;
    assert_eq!(
        mm.handle_page_fault(space.root(), fault_at(second, AccessKind::Write)),
        PageFaultResponse::Continue
    );
    assert!(space.query(second).is_some());
    assert_eq!(space.directory().table_count(), tables);
    assert_eq!(mm.zones().available_pages(), 0);

    for frame in taken {
        mm.free_frame(frame);
    }
}

#[test]
fn a_missing_table_is_allocated_on_demand() {
    let mm = manager();
    let space = Space::create(&mm, None).unwrap();
    // The next 2 MiB boundary needs a leaf table of its own.
    let start = space.directory().total_range().base().as_u64();
    let requested = VirtualAddress::new((start + 0x20_0000).next_multiple_of(0x20_0000));
    let region = space
        .allocate_region(Some(requested), PAGE_SIZE, Access::READ_WRITE, "far", RegionFlags::default())
        .unwrap();
    let tables = space.directory().table_count();

    // One frame for the page, one for the table.
    let taken = exhaust(&mm, 2);
    let va = region.range().base();
    assert_eq!(
        mm.handle_page_fault(space.root(), fault_at(va, AccessKind::Read)),
        PageFaultResponse::Continue
    );
    assert!(space.query(va).is_some());
    assert_eq!(space.directory().table_count(), tables + 1);
    assert_eq!(mm.zones().available_pages(), 0);
    for frame in taken {
        mm.free_frame(frame);
    }

    // With only the page frame left, the missing table is a real shortage.
    let other = space
        .allocate_region(
            Some(requested + 0x20_0000),
            PAGE_SIZE,
            Access::READ_WRITE,
            "farther",
            RegionFlags::default(),
        )
        .unwrap();
    let taken = exhaust(&mm, 1);
    assert_eq!(
        mm.handle_page_fault(space.root(), fault_at(other.range().base(), AccessKind::Read)),
        PageFaultResponse::OutOfMemory
    );
    // The page keeps its frame; only the table is missing on retry.
    assert_eq!(other.vmobject().committed_pages(), 1);
    assert!(space.query(other.range().base()).is_none());
    for frame in taken {
        mm.free_frame(frame);
    }
    assert_eq!(
        mm.handle_page_fault(space.root(), fault_at(other.range().base(), AccessKind::Read)),
        PageFaultResponse::Continue
    );
}
