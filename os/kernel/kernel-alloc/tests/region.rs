mod common;

use common::{bitmap, frame_map, paging, ram};
use kernel_alloc::RegionError;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::PageEntryBits;

#[test]
fn allocate_then_free_returns_every_frame() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();
    let start = VirtualAddress::new(0x0800_0000);

    // the page table belongs to the directory, not to the region
    vmm.get_entry(&mut frames, dir, start, true).unwrap();
    let before = frame_map(&frames);

    vmm.allocate_region(&mut frames, dir, start, 16 * PAGE_SIZE, PageEntryBits::user_rw())
        .unwrap();
    for i in 0..16 {
        assert!(vmm.query(dir, start + i * PAGE_SIZE).is_some());
    }
    let used_before = u32::try_from(before.iter().filter(|free| !**free).count()).unwrap();
    assert_eq!(frames.used_frames(), used_before + 16);

    assert_eq!(vmm.free_region(&mut frames, dir, start, 16 * PAGE_SIZE), Ok(16));
    assert_eq!(frame_map(&frames), before);
    assert!(vmm.query(dir, start).is_none());
}

#[test]
fn partial_region_can_be_undone() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();
    let start = VirtualAddress::new(0x0040_0000);
    vmm.get_entry(&mut frames, dir, start, true).unwrap();

    let mut hoard = Vec::new();
    while frames.free_frames() > 5 {
        hoard.push(frames.allocate_frame().unwrap());
    }
    let before = frame_map(&frames);

    let err = vmm
        .allocate_region(&mut frames, dir, start, 8 * PAGE_SIZE, PageEntryBits::user_rw())
        .unwrap_err();
    assert_eq!(
        err,
        RegionError::OutOfMemory {
            mapped_until: start + 5 * PAGE_SIZE
        }
    );
    assert_eq!(vmm.free_region(&mut frames, dir, start, 8 * PAGE_SIZE), Ok(5));
    assert_eq!(frame_map(&frames), before);
}

#[test]
fn sub_page_sizes_round_up() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();
    let start = VirtualAddress::new(0x0040_0000);

    vmm.allocate_region(&mut frames, dir, start, PAGE_SIZE + 1, PageEntryBits::user_rw())
        .unwrap();
    assert!(vmm.query(dir, start + PAGE_SIZE).is_some());
    assert!(vmm.query(dir, start + 2 * PAGE_SIZE).is_none());
    assert_eq!(vmm.free_region(&mut frames, dir, start, 0), Ok(0));
    assert_eq!(vmm.free_region(&mut frames, dir, start, 3 * PAGE_SIZE), Ok(2));
}
