//! # Kernel Heap
//!
//! Variable-size allocation over a growable, paged virtual range.
//!
//! Blocks tile `[start, end)` without gaps and are described only by the
//! 16-byte tag at their start (see [`Block`]). The block after another begins
//! where it ends and each tag records where the block before it begins, so
//! the list order is address order by construction and the number of blocks
//! is bounded by the heap size alone. The tag also sits right before the
//! pointer handed out, which is how `free` finds a block again and how stray
//! writes and double frees are caught.
//!
//! Allocation is best-fit (smallest sufficient block, lowest address on ties).
//! When nothing fits the heap grows by whole pages up to its ceiling and the
//! search is retried once. Freed blocks merge with free neighbors right away.
//!
//! Before paging is ready the kernel allocates from a bump pool instead; see
//! [`KernelHeap`].

mod backing;
mod block;
mod placement;

pub use backing::{HeapBacking, HeapMemory, VmmBacking, VmmView};
pub use block::{ALIGN, Block, BlockState, HEADER_SIZE, MIN_PAYLOAD, POISON};
pub use placement::PlacementAllocator;

use crate::vmm::VmmError;
use block::{TagCheck, poisoned_tag};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, pages_for};

const COPY_CHUNK: u32 = 256;

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum HeapError {
    #[error("out of heap memory")]
    OutOfMemory,
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("double free of {0}")]
    DoubleFree(VirtualAddress),
    #[error("corrupted block tag at {at}")]
    Corrupted { at: VirtualAddress },
    #[error("{0} was not handed out by this heap")]
    InvalidPointer(VirtualAddress),
    #[error("the heap is not active yet")]
    NotActive,
    #[error("the heap is already active")]
    AlreadyActive,
    #[error("heap bounds must be page aligned with start < initial end <= max")]
    InvalidLayout,
    #[error(transparent)]
    Memory(VmmError),
}

impl From<VmmError> for HeapError {
    fn from(e: VmmError) -> Self {
        match e {
            VmmError::OutOfMemory => Self::OutOfMemory,
            other => Self::Memory(other),
        }
    }
}

/// Snapshot of the block list.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    /// Largest free block, tag included.
    pub largest_free: u32,
    pub free_bytes: u32,
    pub used_bytes: u32,
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub max: VirtualAddress,
}

/// Total block size for a `size`-byte request.
fn block_size_for(size: u32) -> Result<u32, HeapError> {
    if size == 0 {
        return Err(HeapError::ZeroSize);
    }
    size.checked_add(ALIGN - 1)
        .map(|s| s & !(ALIGN - 1))
        .and_then(|s| s.checked_add(HEADER_SIZE))
        .ok_or(HeapError::OutOfMemory)
}

#[derive(Debug)]
pub struct Heap {
    start: VirtualAddress,
    end: VirtualAddress,
    max: VirtualAddress,
    /// Start of the highest block.
    last: VirtualAddress,
}

impl Heap {
    /// Map `[start, initial_end)` and describe it as one free block.
    ///
    /// The heap may later grow up to `max`, never beyond.
    ///
    /// # Errors
    /// [`HeapError::InvalidLayout`] for unaligned or inverted bounds, or the
    /// backing's error if the initial range cannot be mapped.
    pub fn create<B: HeapBacking + ?Sized>(
        backing: &mut B,
        start: VirtualAddress,
        initial_end: VirtualAddress,
        max: VirtualAddress,
    ) -> Result<Self, HeapError> {
        let aligned =
            start.is_page_aligned() && initial_end.is_page_aligned() && max.is_page_aligned();
        if !aligned || start.is_null() || start >= initial_end || initial_end > max {
            return Err(HeapError::InvalidLayout);
        }
        let size = initial_end.as_u32() - start.as_u32();
        backing.grow(start, size / PAGE_SIZE)?;

        let heap = Self {
            start,
            end: initial_end,
            max,
            last: start,
        };
        heap.store(
            backing,
            &Block {
                start,
                size,
                state: BlockState::Free,
                prev: None,
            },
        )?;

        log::info!("kernel heap at {start}..{initial_end}, ceiling {max}");
        Ok(heap)
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// End of the currently mapped extent.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn max(&self) -> VirtualAddress {
        self.max
    }

    /// Blocks in address order.
    ///
    /// A tag that cannot be trusted ends the walk with
    /// [`HeapError::Corrupted`].
    pub fn blocks<'h, M: HeapMemory + ?Sized>(
        &'h self,
        mem: &'h M,
    ) -> impl Iterator<Item = Result<Block, HeapError>> + 'h {
        let mut cursor = Some(self.start);
        core::iter::from_fn(move || {
            let block = self.load(mem, cursor.take()?);
            if let Ok(b) = &block {
                cursor = self.next_start(b);
            }
            Some(block)
        })
    }

    /// Allocate `size` bytes, 8-byte aligned.
    ///
    /// # Errors
    /// - [`HeapError::ZeroSize`] for `size == 0`.
    /// - [`HeapError::OutOfMemory`] if no block fits and the heap cannot grow
    ///   far enough; the block list is left as it was.
    /// - [`HeapError::Corrupted`] if a tag on the way is damaged.
    pub fn alloc<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        size: u32,
    ) -> Result<VirtualAddress, HeapError> {
        let need = block_size_for(size)?;
        let mut block = if let Some(b) = self.best_fit(&*backing, need)? {
            b
        } else {
            self.grow_for(backing, need)?;
            self.best_fit(&*backing, need)?
                .ok_or(HeapError::OutOfMemory)?
        };

        self.split(backing, &mut block, need)?;
        block.state = BlockState::Used;
        self.store(backing, &block)?;

        let ptr = block.payload();
        log::trace!("heap alloc {size} bytes -> {ptr}");
        Ok(ptr)
    }

    /// Release the block behind `ptr`. Freeing null does nothing.
    ///
    /// A damaged tag or a block that is already free is reported and left
    /// alone; no neighbor is touched in that case.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`], [`HeapError::Corrupted`] or
    /// [`HeapError::DoubleFree`].
    pub fn free<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        ptr: VirtualAddress,
    ) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut block = self.resolve(&*backing, ptr)?;
        block.state = BlockState::Free;
        self.store(backing, &block)?;
        self.coalesce(backing, block)?;
        log::trace!("heap free {ptr}");
        Ok(())
    }

    /// Resize the block behind `ptr`, moving it if it cannot stay in place.
    ///
    /// A null `ptr` behaves like [`alloc`](Self::alloc).
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`] for `size == 0`, [`HeapError::OutOfMemory`] if
    /// a larger block cannot be found (the old block stays allocated), or any
    /// error [`free`](Self::free) reports for `ptr`.
    pub fn realloc<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        ptr: VirtualAddress,
        size: u32,
    ) -> Result<VirtualAddress, HeapError> {
        if ptr.is_null() {
            return self.alloc(backing, size);
        }
        let need = block_size_for(size)?;
        let mut block = self.resolve(&*backing, ptr)?;

        if block.size >= need {
            if let Some(rest) = self.split(backing, &mut block, need)? {
                self.coalesce(backing, rest)?;
            }
            return Ok(ptr);
        }

        let moved = self.alloc(backing, size)?;
        copy(backing, ptr, moved, block.payload_size().min(size))?;
        self.free(backing, ptr)?;
        log::trace!("heap realloc {ptr} -> {moved} ({size} bytes)");
        Ok(moved)
    }

    /// # Errors
    /// [`HeapError::Corrupted`] if the walk hits a damaged tag.
    pub fn stats<M: HeapMemory + ?Sized>(&self, mem: &M) -> Result<HeapStats, HeapError> {
        let mut stats = HeapStats {
            start: self.start,
            end: self.end,
            max: self.max,
            ..HeapStats::default()
        };
        for block in self.blocks(mem) {
            let block = block?;
            stats.total_blocks += 1;
            if block.is_free() {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
                stats.largest_free = stats.largest_free.max(block.size);
            } else {
                stats.used_blocks += 1;
                stats.used_bytes += block.size;
            }
        }
        Ok(stats)
    }

    /// Walk every block and check tags, back links and tiling.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] at the first inconsistent block.
    pub fn validate<M: HeapMemory + ?Sized>(&self, mem: &M) -> Result<(), HeapError> {
        let mut prev: Option<Block> = None;
        for block in self.blocks(mem) {
            let block = block?;
            let linked = block.prev == prev.map(|p| p.start);
            let adjacent_free = prev.is_some_and(|p| p.is_free() && block.is_free());
            if !linked || adjacent_free {
                return Err(corrupted(block.start));
            }
            prev = Some(block);
        }
        match prev {
            Some(last) if last.start == self.last && last.end() == self.end.as_u32() => Ok(()),
            _ => Err(corrupted(self.last)),
        }
    }

    /// Read and sanity-check the tag at `at`.
    fn load<M: HeapMemory + ?Sized>(
        &self,
        mem: &M,
        at: VirtualAddress,
    ) -> Result<Block, HeapError> {
        let mut raw = [0u8; HEADER_SIZE as usize];
        mem.read(at, &mut raw)?;
        match Block::decode(at, raw) {
            TagCheck::Valid(block) if self.fits(&block) => Ok(block),
            _ => Err(corrupted(at)),
        }
    }

    fn store<B: HeapBacking + ?Sized>(
        &self,
        backing: &mut B,
        block: &Block,
    ) -> Result<(), HeapError> {
        backing.write(block.start, &block.encode())
    }

    /// Whether a decoded block can describe part of this heap.
    fn fits(&self, block: &Block) -> bool {
        let at = block.start.as_u32();
        block.size >= HEADER_SIZE + MIN_PAYLOAD
            && block.size.is_multiple_of(ALIGN)
            && at >= self.start.as_u32()
            && at
                .checked_add(block.size)
                .is_some_and(|end| end <= self.end.as_u32())
            && block
                .prev
                .is_none_or(|p| p >= self.start && p < block.start)
    }

    fn next_start(&self, block: &Block) -> Option<VirtualAddress> {
        (block.end() < self.end.as_u32()).then(|| VirtualAddress::new(block.end()))
    }

    fn best_fit<M: HeapMemory + ?Sized>(
        &self,
        mem: &M,
        need: u32,
    ) -> Result<Option<Block>, HeapError> {
        let mut best: Option<Block> = None;
        for block in self.blocks(mem) {
            let block = block?;
            if block.is_free() && block.size >= need && best.is_none_or(|b| block.size < b.size) {
                best = Some(block);
            }
        }
        Ok(best)
    }

    /// Cut `block` down to `need` bytes if the rest is worth its own block.
    /// Returns the free remainder.
    fn split<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        block: &mut Block,
        need: u32,
    ) -> Result<Option<Block>, HeapError> {
        let rest = block.size - need;
        if rest <= HEADER_SIZE + MIN_PAYLOAD {
            return Ok(None);
        }
        let tail = Block {
            start: block.start + need,
            size: rest,
            state: BlockState::Free,
            prev: Some(block.start),
        };
        self.relink_after(backing, &tail)?;
        block.size = need;
        self.store(backing, &tail)?;
        self.store(backing, block)?;
        Ok(Some(tail))
    }

    /// Point whatever follows `block` back at it.
    fn relink_after<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        block: &Block,
    ) -> Result<(), HeapError> {
        let Some(at) = self.next_start(block) else {
            self.last = block.start;
            return Ok(());
        };
        let mut next = self.load(&*backing, at)?;
        next.prev = Some(block.start);
        self.store(backing, &next)
    }

    /// Map enough pages at the end for a `need`-byte block.
    fn grow_for<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        need: u32,
    ) -> Result<(), HeapError> {
        let pages = pages_for(need);
        let bytes = pages.checked_mul(PAGE_SIZE).ok_or(HeapError::OutOfMemory)?;
        let Some(new_end) = self
            .end
            .checked_add(bytes)
            .filter(|&e| e <= self.max)
        else {
            log::debug!("heap cannot grow by {bytes} bytes past {}", self.end);
            return Err(HeapError::OutOfMemory);
        };

        let last = self.load(&*backing, self.last)?;
        backing.grow(self.end, pages)?;
        let old_end = self.end;
        self.end = new_end;

        let block = if last.is_free() {
            Block {
                size: last.size + bytes,
                ..last
            }
        } else {
            self.last = old_end;
            Block {
                start: old_end,
                size: bytes,
                state: BlockState::Free,
                prev: Some(last.start),
            }
        };

        log::debug!("heap grown by {pages} pages to {new_end}");
        self.store(backing, &block)
    }

    /// Merge the free `block` with free neighbors; returns the survivor.
    fn coalesce<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        mut block: Block,
    ) -> Result<Block, HeapError> {
        if let Some(at) = self.next_start(&block) {
            let next = self.load(&*backing, at)?;
            if next.is_free() {
                self.absorb(backing, &mut block, &next)?;
            }
        }
        if let Some(at) = block.prev {
            let mut prev = self.load(&*backing, at)?;
            if prev.is_free() {
                self.absorb(backing, &mut prev, &block)?;
                return Ok(prev);
            }
        }
        Ok(block)
    }

    /// Fold `victim`, the block right after `keep`, into `keep`.
    fn absorb<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        keep: &mut Block,
        victim: &Block,
    ) -> Result<(), HeapError> {
        keep.size += victim.size;
        self.relink_after(backing, keep)?;
        backing.write(victim.start, &poisoned_tag())?;
        self.store(backing, keep)
    }

    /// Find the used block whose payload starts at `ptr`.
    ///
    /// Both neighbors have to agree with the tag before it is trusted.
    fn resolve<M: HeapMemory + ?Sized>(
        &self,
        mem: &M,
        ptr: VirtualAddress,
    ) -> Result<Block, HeapError> {
        let p = ptr.as_u32();
        if !p.is_multiple_of(ALIGN)
            || p < self.start.as_u32() + HEADER_SIZE
            || p >= self.end.as_u32()
        {
            log::warn!("heap: {ptr} is not a heap pointer");
            return Err(HeapError::InvalidPointer(ptr));
        }

        let at = VirtualAddress::new(p - HEADER_SIZE);
        let mut raw = [0u8; HEADER_SIZE as usize];
        mem.read(at, &mut raw)?;
        let block = match Block::decode(at, raw) {
            TagCheck::Valid(block) if self.fits(&block) => block,
            TagCheck::Poisoned => {
                log::error!("heap: double free of {ptr} (block was merged)");
                return Err(HeapError::DoubleFree(ptr));
            }
            _ => return Err(corrupted(at)),
        };

        let prev_agrees = match block.prev {
            None => at == self.start,
            Some(prev) => self
                .load(mem, prev)
                .is_ok_and(|b| b.end() == at.as_u32()),
        };
        let next_agrees = match self.next_start(&block) {
            None => at == self.last,
            Some(next) => self.load(mem, next).is_ok_and(|b| b.prev == Some(at)),
        };
        if !prev_agrees || !next_agrees {
            return Err(corrupted(at));
        }

        if block.is_free() {
            log::error!("heap: double free of {ptr}");
            return Err(HeapError::DoubleFree(ptr));
        }
        Ok(block)
    }
}

fn corrupted(at: VirtualAddress) -> HeapError {
    log::error!("heap: corrupted block tag at {at}");
    HeapError::Corrupted { at }
}

fn copy<B: HeapBacking + ?Sized>(
    backing: &mut B,
    from: VirtualAddress,
    to: VirtualAddress,
    len: u32,
) -> Result<(), HeapError> {
    let mut buf = [0u8; COPY_CHUNK as usize];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(COPY_CHUNK);
        let chunk = &mut buf[..n as usize];
        backing.read(from + done, chunk)?;
        backing.write(to + done, chunk)?;
        done += n;
    }
    Ok(())
}

/// The kernel heap across its two lives.
///
/// Starts out bump-allocating from the placement pool and switches exactly
/// once to a real [`Heap`] when paging is up.
#[derive(Debug)]
pub enum KernelHeap {
    Uninitialized(PlacementAllocator),
    Active(Heap),
}

impl KernelHeap {
    #[must_use]
    pub const fn new(placement: PlacementAllocator) -> Self {
        Self::Uninitialized(placement)
    }

    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// # Errors
    /// See [`Heap::alloc`] and [`PlacementAllocator::alloc`].
    pub fn alloc<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        size: u32,
    ) -> Result<VirtualAddress, HeapError> {
        match self {
            Self::Uninitialized(placement) => placement.alloc(size, false),
            Self::Active(heap) => heap.alloc(backing, size),
        }
    }

    /// Page-aligned early allocation, e.g. for the frame bitmap.
    ///
    /// # Errors
    /// [`HeapError::AlreadyActive`] once the heap runs.
    pub fn placement_alloc(
        &mut self,
        size: u32,
        page_aligned: bool,
    ) -> Result<VirtualAddress, HeapError> {
        match self {
            Self::Uninitialized(placement) => placement.alloc(size, page_aligned),
            Self::Active(_) => Err(HeapError::AlreadyActive),
        }
    }

    /// Placement memory is never reclaimed; such frees are ignored.
    ///
    /// # Errors
    /// See [`Heap::free`].
    pub fn free<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        ptr: VirtualAddress,
    ) -> Result<(), HeapError> {
        match self {
            Self::Uninitialized(_) => {
                if !ptr.is_null() {
                    log::warn!("free of {ptr} before the heap is active ignored");
                }
                Ok(())
            }
            Self::Active(heap) => heap.free(backing, ptr),
        }
    }

    /// # Errors
    /// [`HeapError::NotActive`] before activation, otherwise see [`Heap::realloc`].
    pub fn realloc<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        ptr: VirtualAddress,
        size: u32,
    ) -> Result<VirtualAddress, HeapError> {
        match self {
            Self::Uninitialized(_) => Err(HeapError::NotActive),
            Self::Active(heap) => heap.realloc(backing, ptr, size),
        }
    }

    /// Create the real heap and leave the placement phase for good.
    ///
    /// # Errors
    /// [`HeapError::AlreadyActive`] on a second call, otherwise see [`Heap::create`].
    pub fn activate<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        start: VirtualAddress,
        initial_end: VirtualAddress,
        max: VirtualAddress,
    ) -> Result<(), HeapError> {
        let Self::Uninitialized(placement) = self else {
            return Err(HeapError::AlreadyActive);
        };
        let used = placement.used();
        let heap = Heap::create(backing, start, initial_end, max)?;
        *self = Self::Active(heap);
        log::info!("kernel heap active; placement pool used {used} bytes");
        Ok(())
    }

    /// `None` during the placement phase.
    ///
    /// # Errors
    /// See [`Heap::stats`].
    pub fn stats<M: HeapMemory + ?Sized>(&self, mem: &M) -> Result<Option<HeapStats>, HeapError> {
        match self {
            Self::Uninitialized(_) => Ok(None),
            Self::Active(heap) => heap.stats(mem).map(Some),
        }
    }

    /// # Errors
    /// [`HeapError::NotActive`] before activation, otherwise see [`Heap::validate`].
    pub fn validate<M: HeapMemory + ?Sized>(&self, mem: &M) -> Result<(), HeapError> {
        match self {
            Self::Uninitialized(_) => Err(HeapError::NotActive),
            Self::Active(heap) => heap.validate(mem),
        }
    }
}
