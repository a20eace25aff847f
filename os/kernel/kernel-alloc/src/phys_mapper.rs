//! # Direct-map `PhysMapper` for the kernel
//!
//! Once [`Vmm::bootstrap`](crate::vmm::Vmm::bootstrap) has run, every physical
//! address below [`DIRECT_MAP_LIMIT`] is reachable at
//! `KERNEL_VIRTUAL_BASE + pa` in every address space. Page tables, the frame
//! bitmap and freshly allocated frames are all touched through this window.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::HigherHalfPhysMapper;
//! use kernel_memory_addresses::PhysicalPage;
//! use kernel_vmem::{PageTable, get_table};
//!
//! let mapper = HigherHalfPhysMapper::default();
//! unsafe {
//!     let table: &mut PageTable = get_table(&mapper, PhysicalPage::from_index(0x123));
//!     table.zero();
//! }
//! ```

use kernel_info::memory::{DIRECT_MAP_LIMIT, KERNEL_VIRTUAL_BASE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for the higher-half direct map.
///
/// Addresses at or above `limit` are not mapped and are refused outright
/// rather than wrapped into the kernel heap window.
///
/// # Safety
/// - The direct map must be installed and cover `[0, limit)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HigherHalfPhysMapper {
    limit: u32,
}

impl Default for HigherHalfPhysMapper {
    fn default() -> Self {
        Self::new(DIRECT_MAP_LIMIT)
    }
}

impl HigherHalfPhysMapper {
    /// A mapper for the first `limit` bytes, capped at [`DIRECT_MAP_LIMIT`].
    #[inline]
    #[must_use]
    pub const fn new(limit: u32) -> Self {
        let limit = if limit < DIRECT_MAP_LIMIT {
            limit
        } else {
            DIRECT_MAP_LIMIT
        };
        Self { limit }
    }

    #[inline]
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Kernel virtual address of `pa` inside the direct map.
    #[inline]
    #[must_use]
    pub const fn virtual_address(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        if pa.as_u32() < self.limit {
            Some(VirtualAddress::new(KERNEL_VIRTUAL_BASE + pa.as_u32()))
        } else {
            None
        }
    }
}

impl PhysMapper for HigherHalfPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let Some(va) = self.virtual_address(pa) else {
            panic!("{pa} is outside the {:#x} byte direct map", self.limit);
        };
        // SAFETY: Caller must ensure the physical address is valid; it is direct-mapped.
        unsafe { &mut *(va.as_u32() as usize as *mut T) }
    }
}
