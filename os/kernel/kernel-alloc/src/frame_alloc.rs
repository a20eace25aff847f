//! # Physical Frame Allocator
//!
//! One bit per 4 KiB frame, set while the frame is in use. The bitmap is the
//! sole authority on whether a physical frame is free; it does not know who
//! owns a used frame (that is implicit in the page tables).
//!
//! Allocation scans for the lowest clear bit, so the frame sequence is
//! deterministic for a given history.

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, align_up, PAGE_SIZE};
use kernel_vmem::FrameAlloc;

const BITS: u32 = u64::BITS;

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum FrameAllocError {
    #[error("no free physical frame left")]
    Exhausted,
    #[error("frame {0:?} is outside of managed memory")]
    OutOfRange(PhysicalPage),
}

/// Bitmap allocator over caller-provided storage.
pub struct BitmapFrameAlloc<'a> {
    bitmap: &'a mut [u64],
    total: u32,
    used: u32,
    /// Word index below which no clear bit exists.
    hint: usize,
}

impl<'a> BitmapFrameAlloc<'a> {
    /// Number of `u64` words needed to track `frames` frames.
    #[inline]
    #[must_use]
    pub const fn words_for(frames: u32) -> usize {
        frames.div_ceil(BITS) as usize
    }

    /// Track `total_frames` frames in `storage`.
    ///
    /// Every frame below `reserved_end` (the kernel image and early boot
    /// structures) is marked used and never handed out. If `storage` is too
    /// small, only the frames it can describe are managed.
    pub fn new(storage: &'a mut [u64], total_frames: u32, reserved_end: PhysicalAddress) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let capacity = (storage.len() as u64 * u64::from(BITS)).min(u64::from(u32::MAX)) as u32;
        let total = if total_frames > capacity {
            log::warn!(
                "frame bitmap holds {capacity} frames, {total_frames} reported; ignoring the rest"
            );
            capacity
        } else {
            total_frames
        };

        storage.fill(0);
        let mut this = Self {
            bitmap: storage,
            total,
            used: 0,
            hint: 0,
        };

        let reserved = align_up(reserved_end.as_u32(), PAGE_SIZE)
            .map_or(total, |end| end / PAGE_SIZE)
            .min(total);
        for index in 0..reserved {
            this.set(index);
        }
        this.used = reserved;

        log::info!(
            "frame allocator: {total} frames ({} KiB), {reserved} reserved",
            u64::from(total) * u64::from(PAGE_SIZE) / 1024
        );
        this
    }

    #[inline]
    const fn locate(index: u32) -> (usize, u64) {
        ((index / BITS) as usize, 1u64 << (index % BITS))
    }

    #[inline]
    fn set(&mut self, index: u32) {
        let (w, m) = Self::locate(index);
        self.bitmap[w] |= m;
    }

    #[inline]
    fn clear(&mut self, index: u32) {
        let (w, m) = Self::locate(index);
        self.bitmap[w] &= !m;
    }

    #[inline]
    fn test(&self, index: u32) -> bool {
        let (w, m) = Self::locate(index);
        self.bitmap[w] & m != 0
    }

    /// Take the lowest free frame.
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] if every managed frame is in use.
    pub fn allocate_frame(&mut self) -> Result<PhysicalPage, FrameAllocError> {
        let words = Self::words_for(self.total);
        for w in self.hint..words {
            let word = self.bitmap[w];
            if word == u64::MAX {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let index = w as u32 * BITS + (!word).trailing_zeros();
            if index >= self.total {
                break;
            }
            self.set(index);
            self.used += 1;
            self.hint = w;
            return Ok(PhysicalPage::from_index(index));
        }
        self.hint = words;
        Err(FrameAllocError::Exhausted)
    }

    /// Return `frame` to the pool.
    ///
    /// Freeing an already free frame leaves the bitmap unchanged; the
    /// allocator cannot tell who owned it and does not try to.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfRange`] if the frame is not managed here.
    pub fn free_frame(&mut self, frame: PhysicalPage) -> Result<(), FrameAllocError> {
        let index = frame.index();
        if index >= self.total {
            return Err(FrameAllocError::OutOfRange(frame));
        }
        if self.test(index) {
            self.clear(index);
            self.used -= 1;
            self.hint = self.hint.min(Self::locate(index).0);
        } else {
            log::debug!("free of already free {frame:?}");
        }
        Ok(())
    }

    /// Whether `frame` is currently free. Unmanaged frames are never free.
    #[inline]
    #[must_use]
    pub fn is_free(&self, frame: PhysicalPage) -> bool {
        frame.index() < self.total && !self.test(frame.index())
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> u32 {
        self.used
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.total - self.used
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.allocate_frame().ok()
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalPage) {
        if let Err(e) = self.free_frame(frame) {
            log::error!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_frames_are_never_handed_out() {
        let mut storage = [0u64; 2];
        let mut f = BitmapFrameAlloc::new(&mut storage, 100, PhysicalAddress::new(0x3001));
        assert_eq!(f.used_frames(), 4);
        assert!(!f.is_free(PhysicalPage::from_index(3)));
        assert_eq!(f.allocate_frame(), Ok(PhysicalPage::from_index(4)));
    }

    #[test]
    fn lowest_frame_first_and_reuse() {
        let mut storage = [0u64; 1];
        let mut f = BitmapFrameAlloc::new(&mut storage, 64, PhysicalAddress::zero());
        let a = f.allocate_frame().unwrap();
        let b = f.allocate_frame().unwrap();
        let c = f.allocate_frame().unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        f.free_frame(b).unwrap();
        assert_eq!(f.allocate_frame(), Ok(b));
    }

    #[test]
    fn exhaustion_respects_total_not_word_size() {
        let mut storage = [0u64; 1];
        let mut f = BitmapFrameAlloc::new(&mut storage, 3, PhysicalAddress::zero());
        for _ in 0..3 {
            f.allocate_frame().unwrap();
        }
        assert_eq!(f.allocate_frame(), Err(FrameAllocError::Exhausted));
        assert_eq!(f.free_frames(), 0);
    }

    #[test]
    fn double_free_is_idempotent() {
        let mut storage = [0u64; 1];
        let mut f = BitmapFrameAlloc::new(&mut storage, 8, PhysicalAddress::zero());
        let a = f.allocate_frame().unwrap();
        f.free_frame(a).unwrap();
        f.free_frame(a).unwrap();
        assert_eq!(f.used_frames(), 0);
        assert!(f.is_free(a));
    }

    #[test]
    fn out_of_range_free_is_rejected() {
        let mut storage = [0u64; 1];
        let mut f = BitmapFrameAlloc::new(&mut storage, 8, PhysicalAddress::zero());
        let far = PhysicalPage::from_index(8);
        assert_eq!(f.free_frame(far), Err(FrameAllocError::OutOfRange(far)));
        assert!(!f.is_free(far));
    }

    #[test]
    fn small_storage_clamps_total() {
        let mut storage = [0u64; 1];
        let f = BitmapFrameAlloc::new(&mut storage, 1000, PhysicalAddress::zero());
        assert_eq!(f.total_frames(), 64);
    }
}
