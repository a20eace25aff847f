//! # Memory mapping entries (VMAs)
//!
//! A VMA records that a range of a process's address space is *meant* to be
//! mapped, without mapping it yet. The page-fault handler consults the list
//! and populates pages on first touch: zero-filled for anonymous mappings, or
//! read through a [`FileBacking`] for file-backed ones.

use arrayvec::ArrayVec;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualPage, pages_for};
use kernel_vmem::PageEntryBits;

/// Maximum number of mappings per process.
pub const MAX_VMAS: usize = 64;

/// Access rights of a mapping.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    /// Accessible from user mode.
    pub user: bool,
    #[bits(4)]
    __: u8,
}

impl Protection {
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new().with_read(true).with_write(true).with_user(true)
    }

    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new().with_read(true).with_user(true)
    }

    /// Leaf-entry flags for a page of this mapping.
    #[inline]
    #[must_use]
    pub const fn page_flags(self) -> PageEntryBits {
        PageEntryBits::new()
            .with_present(true)
            .with_writable(self.write())
            .with_user_access(self.user())
    }
}

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum FileReadError {
    #[error("device error while reading")]
    Io,
    #[error("the backing file was closed")]
    Closed,
}

/// Read access to whatever backs a file mapping.
pub trait FileBacking {
    /// Read up to `buf.len()` bytes at `offset`, returning the count read.
    /// A short read means end of file; the rest of the page stays zero.
    ///
    /// # Errors
    /// Any device or descriptor failure.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileReadError>;
}

/// The file half of a file-backed mapping.
#[derive(Copy, Clone)]
pub struct FileMapping<'f> {
    pub file: &'f dyn FileBacking,
    /// File offset corresponding to the first byte of the mapping.
    pub offset: u64,
}

impl core::fmt::Debug for FileMapping<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileMapping")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// One `mmap`-style region.
#[derive(Debug, Copy, Clone)]
pub struct Vma<'f> {
    start: VirtualAddress,
    len: u32,
    pub prot: Protection,
    pub file: Option<FileMapping<'f>>,
}

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum VmaError {
    #[error("mapping start {0} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("empty or wrapping mapping at {0}")]
    InvalidLength(VirtualAddress),
    #[error("mapping at {0} overlaps an existing one")]
    Overlap(VirtualAddress),
    #[error("too many mappings")]
    Full,
}

impl<'f> Vma<'f> {
    /// An anonymous (zero-filled) mapping of `len` bytes rounded up to pages.
    ///
    /// # Errors
    /// [`VmaError::Unaligned`] or [`VmaError::InvalidLength`].
    pub fn anonymous(start: VirtualAddress, len: u32, prot: Protection) -> Result<Self, VmaError> {
        if !start.is_page_aligned() {
            return Err(VmaError::Unaligned(start));
        }
        let pages = pages_for(len);
        let len = pages
            .checked_mul(PAGE_SIZE)
            .filter(|&l| l > 0)
            .ok_or(VmaError::InvalidLength(start))?;
        // the last byte must be addressable
        start
            .checked_add(len - 1)
            .ok_or(VmaError::InvalidLength(start))?;
        Ok(Self {
            start,
            len,
            prot,
            file: None,
        })
    }

    /// A mapping populated from `file` starting at file offset `offset`.
    ///
    /// # Errors
    /// As for [`Vma::anonymous`].
    pub fn file_backed(
        start: VirtualAddress,
        len: u32,
        prot: Protection,
        file: &'f dyn FileBacking,
        offset: u64,
    ) -> Result<Self, VmaError> {
        let mut vma = Self::anonymous(start, len, prot)?;
        vma.file = Some(FileMapping { file, offset });
        Ok(vma)
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// Length in bytes (a page multiple).
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u32() >= self.start.as_u32() && va.as_u32() - self.start.as_u32() < self.len
    }

    /// Last byte covered, inclusive.
    #[inline]
    const fn last(&self) -> u32 {
        self.start.as_u32() + (self.len - 1)
    }

    const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u32() <= other.last() && other.start.as_u32() <= self.last()
    }

    /// File offset backing `page`, for file mappings.
    #[must_use]
    pub fn file_offset(&self, page: VirtualPage) -> Option<u64> {
        let file = self.file?;
        let delta = page.base().checked_distance_from(self.start)?;
        Some(file.offset + u64::from(delta))
    }
}

/// A process's mappings, kept sorted by start address.
#[derive(Debug, Default)]
pub struct VmaList<'f> {
    vmas: ArrayVec<Vma<'f>, MAX_VMAS>,
}

impl<'f> VmaList<'f> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            vmas: ArrayVec::new_const(),
        }
    }

    /// Add a mapping.
    ///
    /// # Errors
    /// [`VmaError::Overlap`] if it intersects an existing mapping,
    /// [`VmaError::Full`] if the list is at capacity.
    pub fn insert(&mut self, vma: Vma<'f>) -> Result<(), VmaError> {
        if self.vmas.iter().any(|v| v.overlaps(&vma)) {
            return Err(VmaError::Overlap(vma.start));
        }
        let at = self
            .vmas
            .iter()
            .position(|v| v.start > vma.start)
            .unwrap_or(self.vmas.len());
        self.vmas.try_insert(at, vma).map_err(|_| VmaError::Full)?;
        log::debug!("vma {}+{:#x} inserted", vma.start, vma.len);
        Ok(())
    }

    /// Remove the mapping starting exactly at `start`.
    pub fn remove(&mut self, start: VirtualAddress) -> Option<Vma<'f>> {
        let at = self.vmas.iter().position(|v| v.start == start)?;
        Some(self.vmas.remove(at))
    }

    /// The mapping covering `va`, if any.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&Vma<'f>> {
        self.vmas.iter().find(|v| v.contains(va))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma<'f>> {
        self.vmas.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }
}
