//! # Virtual Memory Support
//!
//! 32-bit x86 paging for the kernel's memory core.
//!
//! ## What you get
//! - An [`address space`](address_space) view over one page directory.
//! - x86 paging-entry flags as a [`PageEntryBits`] bitfield.
//! - 4 KiB-aligned [`PageDirectory`] / [`PageTable`] wrappers and index helpers.
//! - The seams the rest of the kernel plugs into: [`FrameAlloc`] for physical
//!   frames, [`PhysMapper`] for touching physical memory and [`Mmu`] for the
//!   translation root and the TLB.
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  CR3 → PD  →  PT  →  Physical Page
//!         │      │
//!         │      └───► PTE  (Page Table Entry)     → maps 4 KiB page
//!         └──────────► PDE  (Page Directory Entry) → points to a PT
//! ```
//!
//! Both levels hold 1024 entries of 4 bytes; each table therefore covers
//! 4 MiB and the directory covers the full 4 GiB. Directory slots from
//! [`KERNEL_DIRECTORY_SPLIT`](kernel_info::memory::KERNEL_DIRECTORY_SPLIT)
//! upwards are the kernel half and are shared by all address spaces.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "simulated-ram"))]
extern crate alloc;

pub mod address_space;
mod mmu;
mod page_entry_bits;
pub mod page_table;
#[cfg(any(test, feature = "simulated-ram"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, AddressSpaceError};
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use crate::mmu::X86Mmu;
pub use crate::mmu::Mmu;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry};
pub use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
pub use crate::page_table::split_indices;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};

/// Source of **physical** 4 KiB frames.
///
/// The implementation decides where frames come from (bitmap, bump pool,
/// test double). Returned frames are 4 KiB aligned by construction.
pub trait FrameAlloc {
    /// Allocate one frame. Returns `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalPage>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage);
}

/// Converts physical addresses to usable references in the current virtual
/// address space (e.g. via the kernel's direct map).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be reachable through this mapper and writable.
    /// - The lifetime `'a` is unchecked; the mapping must stay valid for `'a`.
    /// - `T` must match the bytes at `pa`, and no other live reference may
    ///   alias the same memory while the returned one is used.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

impl<M: PhysMapper> PhysMapper for &M {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }
}

/// Map a physical page-table frame and return a mutable reference to it.
///
/// # Safety
/// - `frame` must hold a page table (or be about to be initialized as one).
/// - No other reference to the same frame may be live.
#[inline]
pub unsafe fn get_table<'a, M: PhysMapper>(m: &M, frame: PhysicalPage) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(frame.base()) }
}

/// Map a physical page-directory frame and return a mutable reference to it.
///
/// # Safety
/// Same contract as [`get_table`], for a page directory.
#[inline]
pub unsafe fn get_directory<'a, M: PhysMapper>(
    m: &M,
    frame: PhysicalPage,
) -> &'a mut PageDirectory {
    unsafe { m.phys_to_mut::<PageDirectory>(frame.base()) }
}

/// Raw byte view of a whole frame.
///
/// # Safety
/// No other reference to the same frame may be live.
#[inline]
pub unsafe fn frame_bytes<'a, M: PhysMapper>(
    m: &M,
    frame: PhysicalPage,
) -> &'a mut [u8; PAGE_SIZE as usize] {
    unsafe { m.phys_to_mut::<[u8; PAGE_SIZE as usize]>(frame.base()) }
}

/// Fill a frame with zeros.
#[inline]
pub fn zero_frame<M: PhysMapper>(m: &M, frame: PhysicalPage) {
    // SAFETY: the caller owns `frame` (fresh from the frame allocator).
    unsafe { frame_bytes(m, frame) }.fill(0);
}

/// Copy a whole frame.
#[inline]
pub fn copy_frame<M: PhysMapper>(m: &M, dst: PhysicalPage, src: PhysicalPage) {
    if dst == src {
        return;
    }
    // SAFETY: distinct frames; neither is referenced elsewhere during the copy.
    let (d, s) = unsafe { (frame_bytes(m, dst), frame_bytes(m, src)) };
    d.copy_from_slice(s);
}
