//! # Address Space (32-bit x86, directory-rooted)
//!
//! Strongly-typed helpers to inspect and mutate a **single** virtual address
//! space: the tree rooted at one [`PageDirectory`].
//!
//! ## Highlights
//!
//! - [`AddressSpace::get_entry`] / [`AddressSpace::get_entry_or_create`] to
//!   locate a leaf slot, allocating and zeroing a missing page table on demand.
//! - [`AddressSpace::map`] to install one 4 KiB mapping (overwrites allowed).
//! - [`AddressSpace::unmap`] to clear one mapping and hand back its frame.
//! - [`AddressSpace::query`] to translate a VA to a PA.
//! - [`AddressSpace::read_bytes`] / [`AddressSpace::write_bytes`] for byte
//!   access through the mappings, crossing page boundaries as needed.
//!
//! ## Ownership
//!
//! Neither `map` nor `unmap` touches frame ownership of the *mapped* pages:
//! overwriting does not free the old frame and unmapping only returns it.
//! Page-table frames created here are owned by the directory.
//!
//! ## Safety
//!
//! Mutating the live directory requires TLB maintenance (`invlpg` per page or
//! a root reload); that is the caller's job, see [`Mmu`](crate::Mmu).

use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry};
use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
use crate::{
    FrameAlloc, PageEntryBits, PhysMapper, get_directory, get_table, split_indices, zero_frame,
};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage,
};

/// Errors raised while walking or populating an address space.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum AddressSpaceError {
    #[error("no physical frame available for a page table")]
    OutOfMemory,
    #[error("virtual address {0} is not mapped")]
    NotMapped(VirtualAddress),
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// View the address space rooted at directory frame `root`.
    #[inline]
    pub const fn new(mapper: &'m M, root: PhysicalPage) -> Self {
        Self { root, mapper }
    }

    /// Physical frame of the page directory.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    fn directory(&self) -> &'m mut PageDirectory {
        // SAFETY: `root` is a page directory by construction of this handle;
        // each use is short-lived and never overlaps another reference to it.
        unsafe { get_directory(self.mapper, self.root) }
    }

    #[inline]
    fn table(&self, frame: PhysicalPage) -> &'m mut PageTable {
        // SAFETY: `frame` was read from a present PDE of this directory.
        unsafe { get_table(self.mapper, frame) }
    }

    /// Read directory slot `i`.
    #[inline]
    #[must_use]
    pub fn pde(&self, i: DirectoryIndex) -> PdEntry {
        self.directory().get(i)
    }

    /// Overwrite directory slot `i`.
    #[inline]
    pub fn set_pde(&self, i: DirectoryIndex, e: PdEntry) {
        self.directory().set(i, e);
    }

    /// Locate the leaf slot for `va` without creating anything.
    ///
    /// Returns `None` when the containing page table does not exist.
    #[must_use]
    pub fn get_entry(&self, va: VirtualAddress) -> Option<PtEntry> {
        let (di, ti) = split_indices(va);
        let table = self.pde(di).table()?;
        Some(self.table(table).get(ti))
    }

    /// Locate the leaf slot for `va`, creating the page table if missing.
    ///
    /// A new table is taken from `alloc`, zeroed, and installed as
    /// present/writable/user in the directory.
    ///
    /// # Errors
    /// [`AddressSpaceError::OutOfMemory`] if no frame is available for the table.
    pub fn get_entry_or_create<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PtEntry, AddressSpaceError> {
        let table = self.ensure_table(alloc, va)?;
        Ok(self.table(table).get(TableIndex::from(va)))
    }

    fn ensure_table<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PhysicalPage, AddressSpaceError> {
        let di = DirectoryIndex::from(va);
        if let Some(table) = self.pde(di).table() {
            return Ok(table);
        }

        let frame = alloc.alloc_4k().ok_or(AddressSpaceError::OutOfMemory)?;
        zero_frame(self.mapper, frame);
        self.set_pde(di, PdEntry::make_table(frame));
        log::trace!("page table {frame:?} installed for slot {}", di.as_usize());
        Ok(frame)
    }

    /// Map `page` to `frame` with `flags`, creating the page table if needed.
    ///
    /// An existing mapping is overwritten; its frame is **not** released.
    ///
    /// # Errors
    /// [`AddressSpaceError::OutOfMemory`] if a page table had to be created
    /// and no frame was available.
    pub fn map<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        page: VirtualPage,
        frame: PhysicalPage,
        flags: PageEntryBits,
    ) -> Result<(), AddressSpaceError> {
        let va = page.base();
        let table = self.ensure_table(alloc, va)?;
        self.table(table)
            .set(TableIndex::from(va), PtEntry::make_4k(frame, flags));
        log::trace!("map {page:?} -> {frame:?}");
        Ok(())
    }

    /// Clear the mapping of `page`, returning the frame it referenced.
    ///
    /// The frame is **not** released; ownership moves to the caller.
    pub fn unmap(&self, page: VirtualPage) -> Option<PhysicalPage> {
        let va = page.base();
        let (di, ti) = split_indices(va);
        let table = self.table(self.pde(di).table()?);
        let (frame, _) = table.get(ti).page_4k()?;
        table.set(ti, PtEntry::zero());
        log::trace!("unmap {page:?} (was {frame:?})");
        Some(frame)
    }

    /// Translate a VA to PA if mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (frame, _) = self.get_entry(va)?.page_4k()?;
        Some(frame.join(va.offset()))
    }

    /// Copy `buf.len()` bytes starting at `va` into `buf`.
    ///
    /// # Errors
    /// [`AddressSpaceError::NotMapped`] with the first unmapped address; the
    /// buffer may be partially filled in that case.
    pub fn read_bytes(
        &self,
        va: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), AddressSpaceError> {
        self.for_each_chunk(va, buf.len(), |frame_bytes, done| {
            let n = frame_bytes.len();
            buf[done..done + n].copy_from_slice(frame_bytes);
        })
    }

    /// Copy `data` into memory starting at `va`.
    ///
    /// # Errors
    /// [`AddressSpaceError::NotMapped`] with the first unmapped address; the
    /// prefix before it has already been written.
    pub fn write_bytes(
        &self,
        va: VirtualAddress,
        data: &[u8],
    ) -> Result<(), AddressSpaceError> {
        self.for_each_chunk(va, data.len(), |frame_bytes, done| {
            let n = frame_bytes.len();
            frame_bytes.copy_from_slice(&data[done..done + n]);
        })
    }

    /// Visit `[va, va + len)` one page-bounded chunk at a time.
    ///
    /// The callback receives the physical bytes of the chunk and the number
    /// of bytes already visited.
    fn for_each_chunk(
        &self,
        va: VirtualAddress,
        len: usize,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), AddressSpaceError> {
        let mut done = 0usize;
        while done < len {
            #[allow(clippy::cast_possible_truncation)]
            let cur = va
                .checked_add(done as u32)
                .ok_or(AddressSpaceError::NotMapped(va))?;
            let pa = self.query(cur).ok_or(AddressSpaceError::NotMapped(cur))?;
            let off = pa.offset().as_usize();
            let n = (PAGE_SIZE as usize - off).min(len - done);
            // SAFETY: `pa.page()` is a mapped data frame, never a paging
            // structure in use by this walk.
            let bytes = unsafe { crate::frame_bytes(self.mapper, pa.page()) };
            f(&mut bytes[off..off + n], done);
            done += n;
        }
        Ok(())
    }

    /// Frames of every present page table in the user half.
    pub fn user_tables(&self) -> impl Iterator<Item = (DirectoryIndex, PhysicalPage)> + '_ {
        DirectoryIndex::user_half().filter_map(|i| self.pde(i).table().map(|t| (i, t)))
    }

    /// Present leaf entries of the table at `frame`.
    pub fn table_entries(
        &self,
        frame: PhysicalPage,
    ) -> impl Iterator<Item = (TableIndex, PtEntry)> + 'm {
        let table: &'m PageTable = self.table(frame);
        table.present()
    }

    /// Write leaf slot `ti` of the table at `frame`.
    #[inline]
    pub fn set_table_entry(&self, frame: PhysicalPage, ti: TableIndex, e: PtEntry) {
        self.table(frame).set(ti, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{BumpAlloc, SimulatedRam};

    fn fresh(ram: &SimulatedRam, alloc: &mut BumpAlloc) -> PhysicalPage {
        let root = alloc.alloc_4k().unwrap();
        zero_frame(ram, root);
        root
    }

    #[test]
    fn get_entry_without_table_is_none() {
        let ram = SimulatedRam::new(16);
        let mut alloc = BumpAlloc::new(0, 16);
        let root = fresh(&ram, &mut alloc);
        let aspace = AddressSpace::new(&ram, root);

        assert!(aspace.get_entry(VirtualAddress::new(0x0040_0000)).is_none());
        // a missing table is created on demand, the slot itself stays empty
        let e = aspace
            .get_entry_or_create(&mut alloc, VirtualAddress::new(0x0040_0000))
            .unwrap();
        assert!(!e.is_present());
        let pde = aspace.pde(DirectoryIndex::new(1));
        assert!(pde.is_present());
        assert!(pde.flags().writable());
        assert!(pde.flags().user_access());
    }

    #[test]
    fn map_creates_table_and_leaf() {
        let ram = SimulatedRam::new(16);
        let mut alloc = BumpAlloc::new(0, 16);
        let root = fresh(&ram, &mut alloc);
        let aspace = AddressSpace::new(&ram, root);

        let va = VirtualAddress::new(0x0800_3000);
        let frame = PhysicalPage::from_index(12);
        aspace
            .map(&mut alloc, va.page(), frame, PageEntryBits::user_rw())
            .unwrap();

        let e = aspace.get_entry(va).unwrap();
        let (f, flags) = e.page_4k().unwrap();
        assert_eq!(f, frame);
        assert!(flags.writable());
        assert!(flags.user_access());
        assert_eq!(
            aspace.query(VirtualAddress::new(0x0800_3ABC)),
            Some(PhysicalAddress::new(12 * 4096 + 0xABC))
        );
    }

    #[test]
    fn map_overwrites_without_freeing() {
        let ram = SimulatedRam::new(16);
        let mut alloc = BumpAlloc::new(0, 16);
        let root = fresh(&ram, &mut alloc);
        let aspace = AddressSpace::new(&ram, root);
        let page = VirtualAddress::new(0x1000).page();

        aspace
            .map(&mut alloc, page, PhysicalPage::from_index(10), PageEntryBits::kernel_rw())
            .unwrap();
        aspace
            .map(&mut alloc, page, PhysicalPage::from_index(11), PageEntryBits::kernel_rw())
            .unwrap();
        assert_eq!(aspace.unmap(page), Some(PhysicalPage::from_index(11)));
        assert_eq!(aspace.unmap(page), None);
        assert!(alloc.freed().is_empty());
    }

    #[test]
    fn map_fails_when_no_frame_for_table() {
        let ram = SimulatedRam::new(2);
        let mut alloc = BumpAlloc::new(0, 1);
        let root = fresh(&ram, &mut alloc);
        let aspace = AddressSpace::new(&ram, root);

        let err = aspace
            .map(
                &mut alloc,
                VirtualAddress::new(0x1000).page(),
                PhysicalPage::from_index(1),
                PageEntryBits::kernel_rw(),
            )
            .unwrap_err();
        assert_eq!(err, AddressSpaceError::OutOfMemory);
        assert!(!aspace.pde(DirectoryIndex::new(0)).is_present());
    }

    #[test]
    fn bytes_cross_page_boundaries() {
        let ram = SimulatedRam::new(16);
        let mut alloc = BumpAlloc::new(0, 16);
        let root = fresh(&ram, &mut alloc);
        let aspace = AddressSpace::new(&ram, root);

        // two virtually adjacent pages backed by non-adjacent frames
        aspace
            .map(&mut alloc, VirtualAddress::new(0x2000).page(), PhysicalPage::from_index(9), PageEntryBits::kernel_rw())
            .unwrap();
        aspace
            .map(&mut alloc, VirtualAddress::new(0x3000).page(), PhysicalPage::from_index(5), PageEntryBits::kernel_rw())
            .unwrap();

        let data: Vec<u8> = (0..64).collect();
        aspace.write_bytes(VirtualAddress::new(0x2FE0), &data).unwrap();

        let mut back = vec![0u8; 64];
        aspace.read_bytes(VirtualAddress::new(0x2FE0), &mut back).unwrap();
        assert_eq!(back, data);

        let mut tail = [0u8; 4];
        ram.read_phys(PhysicalAddress::new(5 * 4096), &mut tail);
        assert_eq!(tail, [32, 33, 34, 35]);
    }

    #[test]
    fn read_reports_first_unmapped_address() {
        let ram = SimulatedRam::new(16);
        let mut alloc = BumpAlloc::new(0, 16);
        let root = fresh(&ram, &mut alloc);
        let aspace = AddressSpace::new(&ram, root);
        aspace
            .map(&mut alloc, VirtualAddress::new(0x2000).page(), PhysicalPage::from_index(9), PageEntryBits::kernel_rw())
            .unwrap();

        let mut buf = [0u8; 32];
        let err = aspace.read_bytes(VirtualAddress::new(0x2FF0), &mut buf).unwrap_err();
        assert_eq!(err, AddressSpaceError::NotMapped(VirtualAddress::new(0x3000)));
    }
}
