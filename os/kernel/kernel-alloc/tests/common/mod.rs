#![allow(dead_code)]

use kernel_alloc::{BitmapFrameAlloc, MemoryConfig, MemoryManager, Vmm};
use kernel_info::boot::BootMemoryInfo;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::sim::{RecordingMmu, SimulatedRam};

/// 8 MiB of simulated RAM.
pub const RAM_FRAMES: u32 = 2048;

/// End of the pretend kernel image.
pub const KERNEL_END: u32 = 0x20_0000;

pub type SimVmm<'r> = Vmm<&'r SimulatedRam, RecordingMmu>;
pub type SimManager<'a> = MemoryManager<'a, &'a SimulatedRam, RecordingMmu>;

pub fn ram() -> SimulatedRam {
    SimulatedRam::new(RAM_FRAMES)
}

pub fn bitmap() -> Vec<u64> {
    vec![0; BitmapFrameAlloc::words_for(RAM_FRAMES)]
}

pub fn boot(ram: &SimulatedRam) -> BootMemoryInfo {
    BootMemoryInfo::new(ram.total_bytes(), KERNEL_END)
}

/// A small heap window so tests reach growth quickly.
pub fn config() -> MemoryConfig {
    MemoryConfig {
        heap_start: VirtualAddress::new(0xD000_0000),
        heap_initial_size: 0x4000,
        heap_max: VirtualAddress::new(0xD010_0000),
        placement_pool_size: 0x1_0000,
        ..MemoryConfig::default()
    }
}

/// Frame allocator plus a bootstrapped kernel directory, without a heap.
pub fn paging<'a>(
    ram: &'a SimulatedRam,
    bitmap: &'a mut [u64],
) -> (BitmapFrameAlloc<'a>, SimVmm<'a>) {
    let mut frames =
        BitmapFrameAlloc::new(bitmap, ram.frame_count(), PhysicalAddress::new(KERNEL_END));
    let vmm = Vmm::bootstrap(ram, RecordingMmu::default(), &mut frames, 0).unwrap();
    (frames, vmm)
}

/// A manager with an active heap.
pub fn manager<'a>(ram: &'a SimulatedRam, bitmap: &'a mut [u64]) -> SimManager<'a> {
    let mut m =
        MemoryManager::init(&boot(ram), config(), bitmap, ram, RecordingMmu::default()).unwrap();
    m.activate_heap().unwrap();
    m
}

/// Free/used state of every frame.
pub fn frame_map(frames: &BitmapFrameAlloc<'_>) -> Vec<bool> {
    (0..frames.total_frames())
        .map(|i| frames.is_free(kernel_memory_addresses::PhysicalPage::from_index(i)))
        .collect()
}
