use crate::{MemoryAddress, MemoryAddressOffset, PAGE_SHIFT, PAGE_SIZE};
use core::fmt;

/// A 4 KiB page base address (lower [`PAGE_SHIFT`] bits are zero).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryPage(u32);

impl MemoryPage {
    /// Create from an address, aligning down to the page boundary.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        Self(addr.as_u32() & !(PAGE_SIZE - 1))
    }

    /// Page number `index` (i.e. the page starting at `index * PAGE_SIZE`).
    ///
    /// Indices must be `< 2^20`; larger values are truncated.
    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> MemoryAddress {
        MemoryAddress::new(self.0)
    }

    /// Combine with an offset to form a full address.
    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset) -> MemoryAddress {
        MemoryAddress::new(self.0 | off.as_u32())
    }

    /// The following page, or `None` at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(PAGE_SIZE) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Display for MemoryPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/4K", self.0)
    }
}

impl fmt::Debug for MemoryPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryPage(0x{:08X})", self.0)
    }
}
