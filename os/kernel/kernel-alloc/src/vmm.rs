//! # Page Table / Directory Manager
//!
//! Owns the kernel directory, tracks which directory is loaded, and performs
//! every mutation of the translation structures on behalf of the rest of the
//! kernel. Frames for new tables and pages come from a caller-supplied
//! [`FrameAlloc`]; the CPU side (root loads, TLB shootdown) goes through an
//! [`Mmu`].
//!
//! ## Kernel half
//!
//! [`Vmm::bootstrap`] allocates every kernel-half page table up front. Every
//! directory created afterwards copies those directory entries verbatim, so a
//! kernel mapping made through *any* directory is visible in *all* of them and
//! kernel tables are never created, copied or freed per process.
//!
//! ## Frame ownership
//!
//! [`Vmm::map`] and [`Vmm::unmap`] never release the frame of a mapped page.
//! [`Vmm::free_directory`] is the only place that returns user frames, tables
//! and the directory frame to the allocator.

use kernel_info::memory::{DIRECT_MAP_LIMIT, KERNEL_VIRTUAL_BASE};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage,
};
use kernel_vmem::{
    AddressSpace, AddressSpaceError, DirectoryIndex, FrameAlloc, Mmu, PageEntryBits, PdEntry,
    PhysMapper, PtEntry, copy_frame, zero_frame,
};

/// Handle to a page directory, identified by its physical frame.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Directory(PhysicalPage);

impl Directory {
    #[inline]
    #[must_use]
    pub const fn root(self) -> PhysicalPage {
        self.0
    }
}

impl core::fmt::Debug for Directory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Directory({:?})", self.0)
    }
}

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum VmmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("{0:?} is currently loaded")]
    DirectoryInUse(Directory),
    #[error("the kernel directory cannot be freed")]
    KernelDirectory,
    #[error("access to unmapped memory at {0}")]
    NotMapped(VirtualAddress),
}

impl From<AddressSpaceError> for VmmError {
    fn from(value: AddressSpaceError) -> Self {
        match value {
            AddressSpaceError::OutOfMemory => Self::OutOfMemory,
            AddressSpaceError::NotMapped(va) => Self::NotMapped(va),
        }
    }
}

/// Kernel virtual memory manager.
pub struct Vmm<M: PhysMapper, H: Mmu> {
    mapper: M,
    mmu: H,
    kernel: Directory,
    current: Directory,
}

impl<M: PhysMapper, H: Mmu> Vmm<M, H> {
    /// Build the kernel directory and load it.
    ///
    /// Every kernel-half page table is allocated and installed here. The first
    /// `direct_map_frames` physical frames (capped at [`DIRECT_MAP_LIMIT`]) are
    /// mapped at `KERNEL_VIRTUAL_BASE + pa`; those mappings do not own their
    /// frames.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if the allocator cannot supply the tables.
    pub fn bootstrap<F: FrameAlloc + ?Sized>(
        mapper: M,
        mut mmu: H,
        frames: &mut F,
        direct_map_frames: u32,
    ) -> Result<Self, VmmError> {
        let root = frames.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        zero_frame(&mapper, root);

        let aspace = AddressSpace::new(&mapper, root);
        for slot in DirectoryIndex::kernel_half() {
            let table = frames.alloc_4k().ok_or(VmmError::OutOfMemory)?;
            zero_frame(&mapper, table);
            aspace.set_pde(slot, PdEntry::make_table(table));
        }

        let direct = direct_map_frames.min(DIRECT_MAP_LIMIT / PAGE_SIZE);
        for index in 0..direct {
            let frame = PhysicalPage::from_index(index);
            let page = VirtualAddress::new(KERNEL_VIRTUAL_BASE + index * PAGE_SIZE).page();
            aspace.map(frames, page, frame, PageEntryBits::kernel_rw())?;
        }

        mmu.load_root(root);
        let kernel = Directory(root);
        log::info!(
            "kernel directory {kernel:?} loaded, {direct} frames direct-mapped at {:#010x}",
            KERNEL_VIRTUAL_BASE
        );
        Ok(Self {
            mapper,
            mmu,
            kernel,
            current: kernel,
        })
    }

    #[inline]
    #[must_use]
    pub const fn kernel_directory(&self) -> Directory {
        self.kernel
    }

    #[inline]
    #[must_use]
    pub const fn current_directory(&self) -> Directory {
        self.current
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &H {
        &self.mmu
    }

    /// Typed view of `dir` for walking and byte access.
    #[inline]
    #[must_use]
    pub const fn address_space(&self, dir: Directory) -> AddressSpace<'_, M> {
        AddressSpace::new(&self.mapper, dir.0)
    }

    /// A new directory sharing the kernel half, with an empty user half.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is available for the directory.
    pub fn create_directory<F: FrameAlloc + ?Sized>(
        &self,
        frames: &mut F,
    ) -> Result<Directory, VmmError> {
        let root = frames.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        zero_frame(&self.mapper, root);

        let kernel = self.address_space(self.kernel);
        let aspace = AddressSpace::new(&self.mapper, root);
        for slot in DirectoryIndex::kernel_half() {
            aspace.set_pde(slot, kernel.pde(slot));
        }

        let dir = Directory(root);
        log::debug!("created {dir:?}");
        Ok(dir)
    }

    /// Fork-style copy of `src`: the user half is duplicated into fresh
    /// tables and frames with identical entry flags; the kernel half is shared.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if any frame allocation fails. Everything
    /// allocated for the partial clone is released before returning.
    pub fn clone_directory<F: FrameAlloc + ?Sized>(
        &self,
        frames: &mut F,
        src: Directory,
    ) -> Result<Directory, VmmError> {
        let dst = self.create_directory(frames)?;
        if let Err(e) = self.copy_user_half(frames, src, dst) {
            log::warn!("cloning {src:?} failed: {e}; releasing partial clone {dst:?}");
            self.release_directory(frames, dst);
            return Err(e);
        }
        log::debug!("cloned {src:?} into {dst:?}");
        Ok(dst)
    }

    fn copy_user_half<F: FrameAlloc + ?Sized>(
        &self,
        frames: &mut F,
        src: Directory,
        dst: Directory,
    ) -> Result<(), VmmError> {
        let from = self.address_space(src);
        let to = self.address_space(dst);

        for (slot, src_table) in from.user_tables() {
            let table = frames.alloc_4k().ok_or(VmmError::OutOfMemory)?;
            zero_frame(&self.mapper, table);
            // Installed before it is filled so a failed clone can find it.
            let flags = from.pde(slot).flags().with_frame_page(table);
            to.set_pde(slot, PdEntry::from_raw(flags.into()));

            for (ti, entry) in from.table_entries(src_table) {
                let Some((src_frame, flags)) = entry.page_4k() else {
                    continue;
                };
                let frame = frames.alloc_4k().ok_or(VmmError::OutOfMemory)?;
                copy_frame(&self.mapper, frame, src_frame);
                to.set_table_entry(table, ti, PtEntry::make_4k(frame, flags));
            }
        }
        Ok(())
    }

    /// Release every frame owned by `dir`: mapped user pages, then the user
    /// page tables, then the directory frame itself.
    ///
    /// # Errors
    /// - [`VmmError::DirectoryInUse`] if `dir` is the loaded directory.
    /// - [`VmmError::KernelDirectory`] for the kernel directory.
    pub fn free_directory<F: FrameAlloc + ?Sized>(
        &self,
        frames: &mut F,
        dir: Directory,
    ) -> Result<(), VmmError> {
        if dir == self.kernel {
            return Err(VmmError::KernelDirectory);
        }
        if dir == self.current {
            return Err(VmmError::DirectoryInUse(dir));
        }
        self.release_directory(frames, dir);
        Ok(())
    }

    fn release_directory<F: FrameAlloc + ?Sized>(&self, frames: &mut F, dir: Directory) {
        let aspace = self.address_space(dir);
        let mut pages = 0u32;
        let mut tables = 0u32;
        for (slot, table) in aspace.user_tables() {
            for (_, entry) in aspace.table_entries(table) {
                if let Some((frame, _)) = entry.page_4k() {
                    frames.free_4k(frame);
                    pages += 1;
                }
            }
            frames.free_4k(table);
            aspace.set_pde(slot, PdEntry::zero());
            tables += 1;
        }
        frames.free_4k(dir.0);
        log::debug!("freed {dir:?}: {pages} pages, {tables} tables");
    }

    /// Load `dir` as the current directory.
    ///
    /// The caller guarantees `dir` is not concurrently being freed.
    pub fn switch_directory(&mut self, dir: Directory) {
        self.current = dir;
        self.mmu.load_root(dir.0);
        log::trace!("switched to {dir:?}");
    }

    /// Locate the leaf slot for `va` in `dir`.
    ///
    /// With `create == false` a missing table yields `Ok(None)`. With
    /// `create == true` the table is allocated, zeroed and installed.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if a table had to be created and no frame was available.
    pub fn get_entry<F: FrameAlloc + ?Sized>(
        &self,
        frames: &mut F,
        dir: Directory,
        va: VirtualAddress,
        create: bool,
    ) -> Result<Option<PtEntry>, VmmError> {
        let aspace = self.address_space(dir);
        if create {
            Ok(Some(aspace.get_entry_or_create(frames, va)?))
        } else {
            Ok(aspace.get_entry(va))
        }
    }

    /// Install a present mapping `page -> frame`.
    ///
    /// Overwriting an existing mapping is allowed and does **not** free the
    /// old frame.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if a page table could not be allocated.
    pub fn map<F: FrameAlloc + ?Sized>(
        &mut self,
        frames: &mut F,
        dir: Directory,
        page: VirtualPage,
        frame: PhysicalPage,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        self.address_space(dir).map(frames, page, frame, flags)?;
        self.invalidate(dir, page);
        Ok(())
    }

    /// Allocate a zeroed frame and map it at `page`.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if the frame or a page table could not be
    /// allocated; the frame is returned to the allocator in the latter case.
    pub fn map_fresh<F: FrameAlloc + ?Sized>(
        &mut self,
        frames: &mut F,
        dir: Directory,
        page: VirtualPage,
        flags: PageEntryBits,
    ) -> Result<PhysicalPage, VmmError> {
        let frame = frames.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        zero_frame(&self.mapper, frame);
        if let Err(e) = self.map(frames, dir, page, frame, flags) {
            frames.free_4k(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Clear the mapping of `page`, returning the frame it referenced.
    ///
    /// The frame is **not** released; the caller decides what to do with it.
    pub fn unmap(&mut self, dir: Directory, page: VirtualPage) -> Option<PhysicalPage> {
        let frame = self.address_space(dir).unmap(page);
        if frame.is_some() {
            self.invalidate(dir, page);
        } else {
            log::warn!("unmap of absent page {page:?} in {dir:?}");
        }
        frame
    }

    /// Translate `va` through `dir`.
    #[inline]
    #[must_use]
    pub fn query(&self, dir: Directory, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.address_space(dir).query(va)
    }

    /// Copy bytes out of `dir`'s address space.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] at the first unmapped address.
    pub fn read_bytes(
        &self,
        dir: Directory,
        va: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), VmmError> {
        Ok(self.address_space(dir).read_bytes(va, buf)?)
    }

    /// Copy bytes into `dir`'s address space.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] at the first unmapped address.
    pub fn write_bytes(
        &self,
        dir: Directory,
        va: VirtualAddress,
        data: &[u8],
    ) -> Result<(), VmmError> {
        Ok(self.address_space(dir).write_bytes(va, data)?)
    }

    /// TLB maintenance after changing `page` in `dir`.
    ///
    /// Kernel-half entries live in shared tables, so they are stale in the
    /// loaded directory no matter which directory was used to change them.
    fn invalidate(&mut self, dir: Directory, page: VirtualPage) {
        if dir == self.current || DirectoryIndex::from(page.base()).is_kernel_half() {
            self.mmu.invalidate_page(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::sim::{BumpAlloc, RecordingMmu, SimulatedRam};

    fn setup(ram: &SimulatedRam) -> (Vmm<&SimulatedRam, RecordingMmu>, BumpAlloc) {
        let mut frames = BumpAlloc::new(0, ram.frame_count());
        let vmm = Vmm::bootstrap(ram, RecordingMmu::default(), &mut frames, 16).unwrap();
        (vmm, frames)
    }

    #[test]
    fn bootstrap_loads_root_and_direct_maps() {
        let ram = SimulatedRam::new(512);
        let (vmm, _) = setup(&ram);
        let k = vmm.kernel_directory();
        assert_eq!(vmm.mmu().root, Some(k.root()));
        assert_eq!(vmm.current_directory(), k);
        assert_eq!(
            vmm.query(k, VirtualAddress::new(0xC000_5123)),
            Some(PhysicalAddress::new(0x5123))
        );
        assert_eq!(vmm.query(k, VirtualAddress::new(0xC001_0000)), None);
    }

    #[test]
    fn map_on_current_directory_invalidates() {
        let ram = SimulatedRam::new(512);
        let (mut vmm, mut frames) = setup(&ram);
        let k = vmm.kernel_directory();
        let other = vmm.create_directory(&mut frames).unwrap();
        let page = VirtualAddress::new(0x0040_0000).page();

        vmm.map_fresh(&mut frames, other, page, PageEntryBits::user_rw()).unwrap();
        assert!(vmm.mmu().invalidated.is_empty());

        vmm.map_fresh(&mut frames, k, page, PageEntryBits::kernel_rw()).unwrap();
        assert_eq!(vmm.mmu().invalidated, vec![page]);
    }

    #[test]
    fn refuses_to_free_loaded_or_kernel_directory() {
        let ram = SimulatedRam::new(512);
        let (mut vmm, mut frames) = setup(&ram);
        let dir = vmm.create_directory(&mut frames).unwrap();
        vmm.switch_directory(dir);
        assert_eq!(
            vmm.free_directory(&mut frames, dir),
            Err(VmmError::DirectoryInUse(dir))
        );
        let k = vmm.kernel_directory();
        vmm.switch_directory(k);
        assert_eq!(vmm.free_directory(&mut frames, k), Err(VmmError::KernelDirectory));
        assert_eq!(vmm.free_directory(&mut frames, dir), Ok(()));
    }

    #[test]
    fn get_entry_create_flag() {
        let ram = SimulatedRam::new(512);
        let (vmm, mut frames) = setup(&ram);
        let dir = vmm.create_directory(&mut frames).unwrap();
        let va = VirtualAddress::new(0x0123_4000);
        assert_eq!(vmm.get_entry(&mut frames, dir, va, false), Ok(None));
        let e = vmm.get_entry(&mut frames, dir, va, true).unwrap().unwrap();
        assert!(!e.is_present());
        assert!(vmm.get_entry(&mut frames, dir, va, false).unwrap().is_some());
    }
}
