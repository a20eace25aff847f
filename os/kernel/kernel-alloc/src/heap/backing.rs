//! Where heap bytes live.

use super::HeapError;
use crate::vmm::{Directory, Vmm};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::{FrameAlloc, Mmu, PageEntryBits, PhysMapper};

/// Read access to the memory underneath a [`Heap`](super::Heap).
///
/// The heap never dereferences its own addresses; tags and copies go through
/// this trait so the same code runs against real page tables and simulated RAM.
pub trait HeapMemory {
    /// # Errors
    /// If any byte of the range is not mapped.
    fn read(&self, at: VirtualAddress, buf: &mut [u8]) -> Result<(), HeapError>;
}

/// Memory the heap may also write to and extend.
pub trait HeapBacking: HeapMemory {
    /// Make `pages` pages starting at `at` usable.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] when frames run out. Pages mapped before
    /// the failure are released again.
    fn grow(&mut self, at: VirtualAddress, pages: u32) -> Result<(), HeapError>;

    /// # Errors
    /// If any byte of the range is not mapped.
    fn write(&mut self, at: VirtualAddress, data: &[u8]) -> Result<(), HeapError>;
}

/// Read-only view of the heap through the kernel directory, for statistics
/// and validation.
pub struct VmmView<'v, M: PhysMapper, H: Mmu> {
    vmm: &'v Vmm<M, H>,
    dir: Directory,
}

impl<'v, M: PhysMapper, H: Mmu> VmmView<'v, M, H> {
    pub const fn new(vmm: &'v Vmm<M, H>) -> Self {
        let dir = vmm.kernel_directory();
        Self { vmm, dir }
    }
}

impl<M: PhysMapper, H: Mmu> HeapMemory for VmmView<'_, M, H> {
    fn read(&self, at: VirtualAddress, buf: &mut [u8]) -> Result<(), HeapError> {
        Ok(self.vmm.read_bytes(self.dir, at, buf)?)
    }
}

/// Backs the heap with fresh kernel pages in the kernel directory.
pub struct VmmBacking<'v, M: PhysMapper, H: Mmu, F: FrameAlloc + ?Sized> {
    vmm: &'v mut Vmm<M, H>,
    frames: &'v mut F,
    dir: Directory,
}

impl<'v, M: PhysMapper, H: Mmu, F: FrameAlloc + ?Sized> VmmBacking<'v, M, H, F> {
    pub const fn new(vmm: &'v mut Vmm<M, H>, frames: &'v mut F) -> Self {
        let dir = vmm.kernel_directory();
        Self { vmm, frames, dir }
    }

    fn release(&mut self, at: VirtualAddress, pages: u32) {
        for i in 0..pages {
            let page = (at + i * PAGE_SIZE).page();
            if let Some(frame) = self.vmm.unmap(self.dir, page) {
                self.frames.free_4k(frame);
            }
        }
    }
}

impl<M: PhysMapper, H: Mmu, F: FrameAlloc + ?Sized> HeapBacking for VmmBacking<'_, M, H, F> {
    fn grow(&mut self, at: VirtualAddress, pages: u32) -> Result<(), HeapError> {
        if pages == 0 {
            return Ok(());
        }
        pages
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| at.checked_add(bytes - 1))
            .ok_or(HeapError::InvalidLayout)?;

        for i in 0..pages {
            let page = (at + i * PAGE_SIZE).page();
            if let Err(e) =
                self.vmm
                    .map_fresh(self.frames, self.dir, page, PageEntryBits::kernel_rw())
            {
                log::debug!("heap growth at {at} failed after {i} pages: {e}");
                self.release(at, i);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn write(&mut self, at: VirtualAddress, data: &[u8]) -> Result<(), HeapError> {
        Ok(self.vmm.write_bytes(self.dir, at, data)?)
    }
}

impl<M: PhysMapper, H: Mmu, F: FrameAlloc + ?Sized> HeapMemory for VmmBacking<'_, M, H, F> {
    fn read(&self, at: VirtualAddress, buf: &mut [u8]) -> Result<(), HeapError> {
        Ok(self.vmm.read_bytes(self.dir, at, buf)?)
    }
}
