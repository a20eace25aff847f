//! # Two-level page tables
//!
//! A 32-bit virtual address is split into a 10-bit directory index, a 10-bit
//! table index and a 12-bit page offset.

pub mod pd;
pub mod pt;

use crate::page_table::pd::DirectoryIndex;
use crate::page_table::pt::TableIndex;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in a page directory or page table.
pub const ENTRIES: usize = 1024;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirectoryIndex, TableIndex) {
    (DirectoryIndex::from(va), TableIndex::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let (d, t) = split_indices(VirtualAddress::new(0xC012_3456));
        assert_eq!(d.as_usize(), 0x300);
        assert_eq!(t.as_usize(), 0x123);
        assert!(d.is_kernel_half());
    }

    #[test]
    fn user_half_index() {
        let (d, t) = split_indices(VirtualAddress::new(0x0040_1000));
        assert_eq!(d.as_usize(), 1);
        assert_eq!(t.as_usize(), 1);
        assert!(!d.is_kernel_half());
    }
}
