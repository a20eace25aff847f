mod common;

use common::{bitmap, frame_map, manager, paging, ram};
use kernel_alloc::{MemoryError, VmmError};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::PageEntryBits;

#[test]
fn clone_is_independent_in_user_half_and_shared_in_kernel_half() {
    let ram = ram();
    let mut storage = bitmap();
    let mut mm = manager(&ram, &mut storage);

    let parent = mm.create_directory().unwrap();
    let user = VirtualAddress::new(0x0040_0000);
    mm.allocate_region(parent, user, 2 * PAGE_SIZE, PageEntryBits::user_rw())
        .unwrap();
    mm.vmm().write_bytes(parent, user + 0xFFC, b"parent!!").unwrap();

    let child = mm.clone_directory(parent).unwrap();
    let mut buf = [0u8; 8];
    mm.vmm().read_bytes(child, user + 0xFFC, &mut buf).unwrap();
    assert_eq!(&buf, b"parent!!");

    mm.vmm().write_bytes(child, user + 0xFFC, b"child!!!").unwrap();
    mm.vmm().read_bytes(parent, user + 0xFFC, &mut buf).unwrap();
    assert_eq!(&buf, b"parent!!");

    mm.vmm().write_bytes(parent, user, b"P").unwrap();
    mm.vmm().read_bytes(child, user, &mut buf[..1]).unwrap();
    assert_eq!(buf[0], 0);

    let shared = mm.alloc(16).unwrap();
    mm.vmm().write_bytes(child, shared, b"kernel").unwrap();
    let mut k = [0u8; 6];
    mm.vmm().read_bytes(parent, shared, &mut k).unwrap();
    assert_eq!(&k, b"kernel");
    let kernel = mm.vmm().kernel_directory();
    mm.vmm().read_bytes(kernel, shared, &mut k).unwrap();
    assert_eq!(&k, b"kernel");
}

#[test]
fn free_directory_returns_every_frame() {
    let ram = ram();
    let mut storage = bitmap();
    let mut mm = manager(&ram, &mut storage);
    let before = frame_map(mm.frames());

    let dir = mm.create_directory().unwrap();
    let low = VirtualAddress::new(0x0800_0000);
    let high = VirtualAddress::new(0x4000_0000);
    mm.allocate_region(dir, low, 5 * PAGE_SIZE, PageEntryBits::user_rw())
        .unwrap();
    mm.allocate_region(dir, high, PAGE_SIZE, PageEntryBits::user_ro())
        .unwrap();
    let clone = mm.clone_directory(dir).unwrap();

    mm.free_directory(clone).unwrap();
    mm.free_directory(dir).unwrap();
    assert_eq!(frame_map(mm.frames()), before);
}

#[test]
fn switching_loads_the_root() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();

    vmm.switch_directory(dir);
    assert_eq!(vmm.current_directory(), dir);
    assert_eq!(vmm.mmu().root, Some(dir.root()));
    assert_eq!(vmm.mmu().loads, 2);

    // pages mapped into the loaded directory are invalidated
    let page = VirtualAddress::new(0x0010_0000).page();
    vmm.map_fresh(&mut frames, dir, page, PageEntryBits::user_rw()).unwrap();
    assert_eq!(vmm.mmu().invalidated, vec![page]);
    vmm.unmap(dir, page).unwrap();
    assert_eq!(vmm.mmu().invalidated, vec![page, page]);
}

#[test]
fn loaded_and_kernel_directories_cannot_be_freed() {
    let ram = ram();
    let mut storage = bitmap();
    let mut mm = manager(&ram, &mut storage);
    let dir = mm.create_directory().unwrap();
    mm.switch_directory(dir);
    assert_eq!(
        mm.free_directory(dir),
        Err(MemoryError::Vmm(VmmError::DirectoryInUse(dir)))
    );
    let kernel = mm.vmm().kernel_directory();
    mm.switch_directory(kernel);
    assert_eq!(
        mm.free_directory(kernel),
        Err(MemoryError::Vmm(VmmError::KernelDirectory))
    );
    assert_eq!(mm.free_directory(dir), Ok(()));
}

#[test]
fn failed_clone_leaks_nothing() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, vmm) = paging(&ram, &mut storage);
    let src = vmm.create_directory(&mut frames).unwrap();
    for i in 0..4 {
        let page = VirtualAddress::new(0x0100_0000 + i * 0x0040_0000).page();
        let frame = frames.allocate_frame().unwrap();
        vmm.address_space(src)
            .map(&mut frames, page, frame, PageEntryBits::user_rw())
            .unwrap();
    }

    // leave room for the directory, a table and one page only
    let mut hoard = Vec::new();
    while frames.free_frames() > 3 {
        hoard.push(frames.allocate_frame().unwrap());
    }
    let before = frame_map(&frames);
    assert_eq!(
        vmm.clone_directory(&mut frames, src),
        Err(VmmError::OutOfMemory)
    );
    assert_eq!(frame_map(&frames), before);
}
