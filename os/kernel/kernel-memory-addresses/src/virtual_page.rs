use crate::{MemoryAddressOffset, MemoryPage, VirtualAddress};
use core::fmt;

/// Virtual page base (4 KiB aligned).
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(pub(crate) MemoryPage);

impl VirtualPage {
    /// The page containing `va` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing_address(va: VirtualAddress) -> Self {
        Self(MemoryPage::from_addr(va.0))
    }

    #[inline]
    #[must_use]
    pub const fn from_page(p: MemoryPage) -> Self {
        Self(p)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset) -> VirtualAddress {
        VirtualAddress(self.0.join(off))
    }

    /// The following page, or `None` at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_next() {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:08X})", self.base().as_u32())
    }
}

impl From<MemoryPage> for VirtualPage {
    #[inline]
    fn from(p: MemoryPage) -> Self {
        Self(p)
    }
}
