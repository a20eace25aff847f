//! # Host-side doubles for physical memory and the MMU
//!
//! [`SimulatedRam`] hands out physical frames backed by ordinary heap memory,
//! addressed from physical address `0`. [`RecordingMmu`] remembers root loads
//! and invalidations instead of touching `CR3`. [`BumpAlloc`] is the simplest
//! possible [`FrameAlloc`].

use crate::{FrameAlloc, Mmu, PhysMapper};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualPage};

/// A 4 KiB-aligned raw frame.
#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; PAGE_SIZE as usize]>);

/// Simulated physical memory: `frames` zeroed 4 KiB frames starting at PA 0.
pub struct SimulatedRam {
    frames: Vec<Frame>,
}

impl SimulatedRam {
    #[must_use]
    pub fn new(frames: u32) -> Self {
        let frames = (0..frames)
            .map(|_| Frame(UnsafeCell::new([0; PAGE_SIZE as usize])))
            .collect();
        Self { frames }
    }

    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let n = self.frames.len() as u32;
        n
    }

    /// Size in bytes, as a platform probe would report it.
    #[inline]
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        u64::from(self.frame_count()) * u64::from(PAGE_SIZE)
    }

    fn ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let idx = pa.page().index() as usize;
        assert!(
            idx < self.frames.len(),
            "physical access beyond simulated RAM: {pa:?}"
        );
        // SAFETY: the offset is below PAGE_SIZE.
        unsafe { self.frames[idx].0.get().cast::<u8>().add(pa.offset().as_usize()) }
    }

    /// Copy physical memory into `buf`; may span frames.
    pub fn read_phys(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let at = pa + i as u32;
            // SAFETY: in-bounds byte read of owned memory.
            *b = unsafe { self.ptr(at).read() };
        }
    }

    /// Copy `data` into physical memory; may span frames.
    pub fn write_phys(&self, pa: PhysicalAddress, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let at = pa + i as u32;
            // SAFETY: in-bounds byte write of owned memory.
            unsafe { self.ptr(at).write(*b) };
        }
    }
}

impl PhysMapper for SimulatedRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(
            pa.offset().as_usize() + size_of::<T>() <= PAGE_SIZE as usize,
            "mapped object crosses a frame boundary"
        );
        // SAFETY: the caller promises `T` matches the bytes at `pa`.
        unsafe { &mut *self.ptr(pa).cast::<T>() }
    }
}

/// An [`Mmu`] that records what the directory manager asked it to do.
#[derive(Debug, Default)]
pub struct RecordingMmu {
    /// The last root loaded.
    pub root: Option<PhysicalPage>,
    /// Number of root loads.
    pub loads: usize,
    /// Every page invalidated, in order.
    pub invalidated: Vec<VirtualPage>,
}

impl Mmu for RecordingMmu {
    fn load_root(&mut self, root: PhysicalPage) {
        self.root = Some(root);
        self.loads += 1;
    }

    fn invalidate_page(&mut self, page: VirtualPage) {
        self.invalidated.push(page);
    }
}

/// A trivial **bump** allocator: always hands out the next frame index.
///
/// It only keeps a cursor and "bumps" it on each alloc. Freed frames are
/// recorded but never reused.
#[derive(Debug)]
pub struct BumpAlloc {
    next: u32,
    end: u32,
    freed: Vec<PhysicalPage>,
}

impl BumpAlloc {
    /// Hands out frame indices `start..end`.
    #[must_use]
    pub const fn new(start: u32, end: u32) -> Self {
        Self {
            next: start,
            end,
            freed: Vec::new(),
        }
    }

    #[must_use]
    pub fn freed(&self) -> &[PhysicalPage] {
        &self.freed
    }
}

impl FrameAlloc for BumpAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        if self.next >= self.end {
            return None;
        }
        let p = PhysicalPage::from_index(self.next);
        self.next += 1;
        Some(p)
    }

    fn free_4k(&mut self, frame: PhysicalPage) {
        self.freed.push(frame);
    }
}
