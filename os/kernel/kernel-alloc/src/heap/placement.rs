//! Bump allocation for the window before the heap exists.

use super::HeapError;
use super::block::ALIGN;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_up};

/// Hands out memory from a fixed, already mapped pool and never reclaims it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PlacementAllocator {
    start: VirtualAddress,
    next: VirtualAddress,
    end: VirtualAddress,
}

impl PlacementAllocator {
    /// A pool covering `[start, end)`.
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self {
            start,
            next: start,
            end,
        }
    }

    /// Bump out `size` bytes, aligned to 8 bytes or to a page.
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`] for `size == 0`, [`HeapError::OutOfMemory`]
    /// once the pool is used up.
    pub fn alloc(&mut self, size: u32, page_aligned: bool) -> Result<VirtualAddress, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let align = if page_aligned { PAGE_SIZE } else { ALIGN };
        let base = align_up(self.next.as_u32(), align).ok_or(HeapError::OutOfMemory)?;
        let next = base
            .checked_add(size)
            .filter(|&n| n <= self.end.as_u32())
            .ok_or(HeapError::OutOfMemory)?;
        self.next = VirtualAddress::new(next);
        log::trace!("placement alloc {size} bytes at {base:#010x}");
        Ok(VirtualAddress::new(base))
    }

    #[inline]
    #[must_use]
    pub const fn used(&self) -> u32 {
        self.next.as_u32() - self.start.as_u32()
    }

    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.end.as_u32() - self.next.as_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bumps_with_alignment() {
        let mut p =
            PlacementAllocator::new(VirtualAddress::new(0xC020_0004), VirtualAddress::new(0xC020_3000));
        assert_eq!(p.alloc(5, false), Ok(VirtualAddress::new(0xC020_0008)));
        assert_eq!(p.alloc(8, false), Ok(VirtualAddress::new(0xC020_0010)));
        assert_eq!(p.alloc(16, true), Ok(VirtualAddress::new(0xC020_1000)));
        assert_eq!(p.used(), 0x100C);
        assert_eq!(p.alloc(0x2000, true), Err(HeapError::OutOfMemory));
        assert_eq!(p.alloc(0, false), Err(HeapError::ZeroSize));
        assert_eq!(p.remaining(), 0x3000 - 0x1010);
    }
}
