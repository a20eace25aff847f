use crate::{MemoryAddressOffset, MemoryPage, PhysicalAddress};
use core::fmt;

/// Physical page base, i.e. a 4 KiB **frame**.
///
/// A `PhysicalPage` represents the page-aligned base of a physical frame. The
/// frame allocator identifies frames by their [`index`](Self::index)
/// (`base / 4096`).
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalPage::from_index(0x80);
/// assert_eq!(frame.base().as_u32(), 0x8_0000);
/// assert_eq!(PhysicalAddress::new(0x8_0FFF).page(), frame);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(pub(crate) MemoryPage);

impl PhysicalPage {
    #[inline]
    #[must_use]
    pub const fn from_addr(p: PhysicalAddress) -> Self {
        Self::from_page(MemoryPage::from_addr(p.0))
    }

    #[inline]
    #[must_use]
    pub const fn from_page(p: MemoryPage) -> Self {
        Self(p)
    }

    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(MemoryPage::from_index(index))
    }

    /// Frame index (`base / 4096`).
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0.index()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset) -> PhysicalAddress {
        PhysicalAddress(self.0.join(off))
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame#{}(0x{:08X})", self.index(), self.base().as_u32())
    }
}

impl From<MemoryPage> for PhysicalPage {
    #[inline]
    fn from(p: MemoryPage) -> Self {
        Self(p)
    }
}
