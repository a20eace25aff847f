//! # Region helper
//!
//! Bulk map/unmap of page ranges, used by process creation for stacks and
//! user heaps. A failed [`Vmm::allocate_region`] leaves the pages it already
//! mapped in place; callers undo it with [`Vmm::free_region`] over the same
//! range, which skips any slot that is not present.

use crate::vmm::{Directory, Vmm};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, pages_for};
use kernel_vmem::{FrameAlloc, Mmu, PageEntryBits, PhysMapper};

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum RegionError {
    #[error("out of memory; pages below {mapped_until} are mapped")]
    OutOfMemory { mapped_until: VirtualAddress },
    #[error("region start {0} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("region starting at {0} wraps the address space")]
    OutOfRange(VirtualAddress),
}

/// Page bases of `[start, start + size)`.
fn pages(
    start: VirtualAddress,
    size: u32,
) -> Result<impl Iterator<Item = VirtualAddress>, RegionError> {
    if !start.is_page_aligned() {
        return Err(RegionError::Unaligned(start));
    }
    let count = pages_for(size);
    if count > 0 {
        start
            .checked_add((count - 1) * PAGE_SIZE)
            .ok_or(RegionError::OutOfRange(start))?;
    }
    Ok((0..count).map(move |i| start + i * PAGE_SIZE))
}

impl<M: PhysMapper, H: Mmu> Vmm<M, H> {
    /// Back every page of `[start, start + size)` with a fresh zeroed frame
    /// mapped with `flags`.
    ///
    /// A page that is already present keeps its frame and contents but takes
    /// `flags`; from then on it belongs to the region like every other page,
    /// so [`free_region`](Self::free_region) releases its frame as well.
    ///
    /// # Errors
    /// - [`RegionError::Unaligned`] / [`RegionError::OutOfRange`] for a bad range.
    /// - [`RegionError::OutOfMemory`] on the first failed allocation; pages
    ///   below `mapped_until` remain mapped.
    pub fn allocate_region<F: FrameAlloc + ?Sized>(
        &mut self,
        frames: &mut F,
        dir: Directory,
        start: VirtualAddress,
        size: u32,
        flags: PageEntryBits,
    ) -> Result<(), RegionError> {
        for va in pages(start, size)? {
            let mapped = match self.query(dir, va) {
                Some(pa) => self.map(frames, dir, va.page(), pa.page(), flags),
                None => self.map_fresh(frames, dir, va.page(), flags).map(|_| ()),
            };
            if mapped.is_err() {
                log::debug!("region {start}+{size:#x} stopped at {va}: out of memory");
                return Err(RegionError::OutOfMemory { mapped_until: va });
            }
        }
        log::debug!("region {start}+{size:#x} mapped in {dir:?}");
        Ok(())
    }

    /// Unmap every present page of `[start, start + size)` and release its
    /// frame. Returns the number of pages released.
    ///
    /// # Errors
    /// [`RegionError::Unaligned`] / [`RegionError::OutOfRange`] for a bad range.
    pub fn free_region<F: FrameAlloc + ?Sized>(
        &mut self,
        frames: &mut F,
        dir: Directory,
        start: VirtualAddress,
        size: u32,
    ) -> Result<u32, RegionError> {
        let mut released = 0;
        for va in pages(start, size)? {
            if self.query(dir, va).is_none() {
                continue;
            }
            if let Some(frame) = self.unmap(dir, va.page()) {
                frames.free_4k(frame);
                released += 1;
            }
        }
        log::debug!("region {start}+{size:#x} released {released} pages in {dir:?}");
        Ok(released)
    }
}
