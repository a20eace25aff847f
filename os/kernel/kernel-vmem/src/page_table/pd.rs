//! # Page Directory (root level)
//!
//! - [`DirectoryIndex`]: index type for VA bits `[31:22]`.
//! - [`PdEntry`]: a directory entry pointing to a [`PageTable`](super::pt::PageTable).
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 entries.
//!
//! Slots `KERNEL_DIRECTORY_SPLIT..1024` form the kernel half. Their entries
//! reference the same table frames in every directory of the system.

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use kernel_info::memory::KERNEL_DIRECTORY_SPLIT;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl DirectoryIndex {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new((va.as_u32() >> 22) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Whether this slot belongs to the shared kernel half.
    #[inline]
    #[must_use]
    pub const fn is_kernel_half(self) -> bool {
        self.as_usize() >= KERNEL_DIRECTORY_SPLIT
    }

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }

    /// All slots of the process-private half.
    pub fn user_half() -> impl Iterator<Item = Self> {
        #[allow(clippy::cast_possible_truncation)]
        (0..KERNEL_DIRECTORY_SPLIT).map(|i| Self::new(i as u16))
    }

    /// All slots of the shared kernel half.
    pub fn kernel_half() -> impl Iterator<Item = Self> {
        #[allow(clippy::cast_possible_truncation)]
        (KERNEL_DIRECTORY_SPLIT..ENTRIES).map(|i| Self::new(i as u16))
    }
}

impl PdEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    /// Entry pointing at a page table, present/writable/user.
    ///
    /// Permissions are enforced at the table level; the directory level is
    /// kept permissive so a single table can hold both kinds of pages.
    #[inline]
    #[must_use]
    pub const fn make_table(table: PhysicalPage) -> Self {
        Self(PageEntryBits::user_rw().with_frame_page(table))
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    /// If present, the frame of the referenced page table.
    #[inline]
    #[must_use]
    pub const fn table(self) -> Option<PhysicalPage> {
        if self.is_present() {
            Some(self.0.frame_page())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0.into()
    }

    #[inline]
    #[must_use]
    pub fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from(v))
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_entry_is_permissive() {
        let e = PdEntry::make_table(PhysicalPage::from_index(7));
        assert_eq!(e.table(), Some(PhysicalPage::from_index(7)));
        assert!(e.flags().writable());
        assert!(e.flags().user_access());
        assert_eq!(PdEntry::zero().table(), None);
    }

    #[test]
    fn halves_partition_the_directory() {
        assert_eq!(DirectoryIndex::user_half().count(), KERNEL_DIRECTORY_SPLIT);
        assert_eq!(
            DirectoryIndex::kernel_half().count(),
            ENTRIES - KERNEL_DIRECTORY_SPLIT
        );
        assert!(DirectoryIndex::kernel_half().all(DirectoryIndex::is_kernel_half));
    }
}
