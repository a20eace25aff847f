//! # Memory manager
//!
//! Owns the frame bitmap, the directory manager and the kernel heap, and
//! wires them together the way the rest of the kernel uses them.
//! [`KernelMemory`] is the process-wide home for one manager: every entry
//! point takes the lock with interrupts disabled, so a heap growth that walks
//! heap, page tables and bitmap is one critical section.

use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocError};
use crate::heap::{HeapError, HeapStats, KernelHeap, PlacementAllocator, VmmBacking, VmmView};
use crate::page_fault::{
    FaultCause, FaultInfo, FaultReport, FaultResolution, ProcessContext, handle_page_fault,
};
use crate::region::RegionError;
use crate::vmm::{Directory, Vmm, VmmError};
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::{
    DIRECT_MAP_LIMIT, KERNEL_HEAP_INITIAL_SIZE, KERNEL_HEAP_MAX, KERNEL_HEAP_START,
    KERNEL_VIRTUAL_BASE, MAX_STACK_SIZE, PLACEMENT_POOL_SIZE,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_sync::SpinMutex;
use kernel_vmem::{Mmu, PageEntryBits, PhysMapper};

/// Runtime layout knobs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryConfig {
    pub heap_start: VirtualAddress,
    pub heap_initial_size: u32,
    /// Exclusive ceiling of heap growth.
    pub heap_max: VirtualAddress,
    /// Bytes after the kernel image used before the heap is active.
    pub placement_pool_size: u32,
    /// Physical bytes mapped at `KERNEL_VIRTUAL_BASE`. Memory above it is
    /// never handed out.
    pub direct_map_limit: u32,
    /// Largest size a stack may reach by fault-driven growth.
    pub max_stack_size: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            heap_start: VirtualAddress::new(KERNEL_HEAP_START),
            heap_initial_size: KERNEL_HEAP_INITIAL_SIZE,
            heap_max: VirtualAddress::new(KERNEL_HEAP_MAX),
            placement_pool_size: PLACEMENT_POOL_SIZE,
            direct_map_limit: DIRECT_MAP_LIMIT,
            max_stack_size: MAX_STACK_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum MemoryError {
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
    #[error(transparent)]
    Vmm(#[from] VmmError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error("the placement pool after the kernel image at {0} is outside the direct map")]
    KernelTooLarge(PhysicalAddress),
    #[error("memory manager is not initialized")]
    NotInitialized,
    #[error("memory manager is already initialized")]
    AlreadyInitialized,
}

/// Frame and heap figures in one place.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryStats {
    pub total_frames: u32,
    pub free_frames: u32,
    pub used_frames: u32,
    /// `None` while the heap is still in its placement phase.
    pub heap: Option<HeapStats>,
}

pub struct MemoryManager<'a, M: PhysMapper, H: Mmu> {
    config: MemoryConfig,
    frames: BitmapFrameAlloc<'a>,
    vmm: Vmm<M, H>,
    heap: KernelHeap,
}

impl<'a, M: PhysMapper, H: Mmu> MemoryManager<'a, M, H> {
    /// Bring up frame tracking and paging from what the boot layer reported.
    ///
    /// Frames below the end of the placement pool (kernel image included)
    /// are marked used. The heap starts in its placement phase; call
    /// [`activate_heap`](Self::activate_heap) to switch it over.
    ///
    /// # Errors
    /// [`MemoryError::KernelTooLarge`] if the placement pool does not fit the
    /// direct map, or [`MemoryError::Vmm`] if the kernel directory cannot be
    /// built.
    pub fn init(
        boot: &BootMemoryInfo,
        config: MemoryConfig,
        bitmap: &'a mut [u64],
        mapper: M,
        mmu: H,
    ) -> Result<Self, MemoryError> {
        let window = config.direct_map_limit.min(DIRECT_MAP_LIMIT);
        let kernel_end = boot.kernel_end();
        let reserved_end = kernel_end
            .checked_add(config.placement_pool_size)
            .filter(|end| end.as_u32() <= window)
            .ok_or(MemoryError::KernelTooLarge(kernel_end))?;

        // Frames are only ever touched through the direct map.
        let total = boot.total_frames().min(window / PAGE_SIZE);
        if total < boot.total_frames() {
            log::warn!(
                "{} frames above the {window:#x} direct map are left unmanaged",
                boot.total_frames() - total
            );
        }
        let mut frames = BitmapFrameAlloc::new(bitmap, total, reserved_end);
        log::info!(
            "{} of {} frames free, reserved below {reserved_end}",
            frames.free_frames(),
            frames.total_frames()
        );

        let vmm = Vmm::bootstrap(mapper, mmu, &mut frames, total)?;

        let pool_start = VirtualAddress::new(KERNEL_VIRTUAL_BASE + kernel_end.as_u32());
        let pool_end = VirtualAddress::new(KERNEL_VIRTUAL_BASE + reserved_end.as_u32());
        let heap = KernelHeap::new(PlacementAllocator::new(pool_start, pool_end));

        Ok(Self {
            config,
            frames,
            vmm,
            heap,
        })
    }

    /// Map the initial heap window and leave the placement phase.
    ///
    /// # Errors
    /// [`HeapError::AlreadyActive`], [`HeapError::InvalidLayout`] or
    /// [`HeapError::OutOfMemory`], wrapped in [`MemoryError::Heap`].
    pub fn activate_heap(&mut self) -> Result<(), MemoryError> {
        let start = self.config.heap_start;
        let initial_end = start
            .checked_add(self.config.heap_initial_size)
            .ok_or(HeapError::InvalidLayout)?;
        let mut backing = VmmBacking::new(&mut self.vmm, &mut self.frames);
        self.heap
            .activate(&mut backing, start, initial_end, self.config.heap_max)?;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &BitmapFrameAlloc<'a> {
        &self.frames
    }

    #[inline]
    #[must_use]
    pub const fn vmm(&self) -> &Vmm<M, H> {
        &self.vmm
    }

    #[inline]
    #[must_use]
    pub const fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    /// # Errors
    /// [`FrameAllocError::Exhausted`].
    pub fn allocate_frame(&mut self) -> Result<PhysicalPage, MemoryError> {
        Ok(self.frames.allocate_frame()?)
    }

    /// # Errors
    /// [`FrameAllocError::OutOfRange`].
    pub fn free_frame(&mut self, frame: PhysicalPage) -> Result<(), MemoryError> {
        Ok(self.frames.free_frame(frame)?)
    }

    /// # Errors
    /// See [`KernelHeap::alloc`].
    pub fn alloc(&mut self, size: u32) -> Result<VirtualAddress, MemoryError> {
        let mut backing = VmmBacking::new(&mut self.vmm, &mut self.frames);
        Ok(self.heap.alloc(&mut backing, size)?)
    }

    /// Early allocation from the placement pool.
    ///
    /// # Errors
    /// See [`KernelHeap::placement_alloc`].
    pub fn placement_alloc(
        &mut self,
        size: u32,
        page_aligned: bool,
    ) -> Result<VirtualAddress, MemoryError> {
        Ok(self.heap.placement_alloc(size, page_aligned)?)
    }

    /// # Errors
    /// See [`KernelHeap::free`].
    pub fn free(&mut self, ptr: VirtualAddress) -> Result<(), MemoryError> {
        let mut backing = VmmBacking::new(&mut self.vmm, &mut self.frames);
        Ok(self.heap.free(&mut backing, ptr)?)
    }

    /// # Errors
    /// See [`KernelHeap::realloc`].
    pub fn realloc(&mut self, ptr: VirtualAddress, size: u32) -> Result<VirtualAddress, MemoryError> {
        let mut backing = VmmBacking::new(&mut self.vmm, &mut self.frames);
        Ok(self.heap.realloc(&mut backing, ptr, size)?)
    }

    /// # Errors
    /// See [`KernelHeap::validate`].
    pub fn validate_heap(&self) -> Result<(), MemoryError> {
        Ok(self.heap.validate(&VmmView::new(&self.vmm))?)
    }

    /// # Errors
    /// [`HeapError::Corrupted`] if the heap walk hits a damaged tag.
    pub fn stats(&self) -> Result<MemoryStats, MemoryError> {
        Ok(MemoryStats {
            total_frames: self.frames.total_frames(),
            free_frames: self.frames.free_frames(),
            used_frames: self.frames.used_frames(),
            heap: self.heap.stats(&VmmView::new(&self.vmm))?,
        })
    }

    /// # Errors
    /// [`VmmError::OutOfMemory`].
    pub fn create_directory(&mut self) -> Result<Directory, MemoryError> {
        Ok(self.vmm.create_directory(&mut self.frames)?)
    }

    /// # Errors
    /// [`VmmError::OutOfMemory`]; nothing is leaked on failure.
    pub fn clone_directory(&mut self, src: Directory) -> Result<Directory, MemoryError> {
        Ok(self.vmm.clone_directory(&mut self.frames, src)?)
    }

    /// # Errors
    /// [`VmmError::KernelDirectory`] or [`VmmError::DirectoryInUse`].
    pub fn free_directory(&mut self, dir: Directory) -> Result<(), MemoryError> {
        Ok(self.vmm.free_directory(&mut self.frames, dir)?)
    }

    pub fn switch_directory(&mut self, dir: Directory) {
        self.vmm.switch_directory(dir);
    }

    /// # Errors
    /// See [`Vmm::allocate_region`].
    pub fn allocate_region(
        &mut self,
        dir: Directory,
        start: VirtualAddress,
        size: u32,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        Ok(self
            .vmm
            .allocate_region(&mut self.frames, dir, start, size, flags)?)
    }

    /// # Errors
    /// See [`Vmm::free_region`].
    pub fn free_region(
        &mut self,
        dir: Directory,
        start: VirtualAddress,
        size: u32,
    ) -> Result<u32, MemoryError> {
        Ok(self.vmm.free_region(&mut self.frames, dir, start, size)?)
    }

    pub fn handle_page_fault(
        &mut self,
        process: Option<&mut ProcessContext<'_>>,
        fault: &FaultInfo,
    ) -> FaultResolution {
        handle_page_fault(&mut self.vmm, &mut self.frames, process, fault)
    }
}

/// Process-wide memory manager with an explicit init/teardown life.
///
/// ```rust,no_run
/// use kernel_alloc::manager::{KernelMemory, MemoryConfig};
/// use kernel_alloc::phys_mapper::HigherHalfPhysMapper;
/// use kernel_info::boot::BootMemoryInfo;
/// # struct Hw;
/// # impl kernel_vmem::Mmu for Hw {
/// #     fn load_root(&mut self, _: kernel_memory_addresses::PhysicalPage) {}
/// #     fn invalidate_page(&mut self, _: kernel_memory_addresses::VirtualPage) {}
/// # }
///
/// static MEMORY: KernelMemory<'static, HigherHalfPhysMapper, Hw> = KernelMemory::new();
/// static mut BITMAP: [u64; 2048] = [0; 2048];
///
/// let boot = BootMemoryInfo::new(64 << 20, 0x30_0000);
/// let bitmap = unsafe { &mut *core::ptr::addr_of_mut!(BITMAP) };
/// let config = MemoryConfig::default();
/// let mapper = HigherHalfPhysMapper::new(config.direct_map_limit);
/// MEMORY.init(&boot, config, bitmap, mapper, Hw).unwrap();
/// let p = MEMORY.alloc(128).unwrap();
/// MEMORY.free(p).unwrap();
/// ```
pub struct KernelMemory<'a, M: PhysMapper, H: Mmu> {
    inner: SpinMutex<Option<MemoryManager<'a, M, H>>>,
}

impl<M: PhysMapper, H: Mmu> Default for KernelMemory<'_, M, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, M: PhysMapper, H: Mmu> KernelMemory<'a, M, H> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(None),
        }
    }

    /// Build the manager and activate the heap.
    ///
    /// # Errors
    /// [`MemoryError::AlreadyInitialized`], or whatever
    /// [`MemoryManager::init`] and [`MemoryManager::activate_heap`] report.
    pub fn init(
        &self,
        boot: &BootMemoryInfo,
        config: MemoryConfig,
        bitmap: &'a mut [u64],
        mapper: M,
        mmu: H,
    ) -> Result<(), MemoryError> {
        self.inner.with_irq(|slot| {
            if slot.is_some() {
                return Err(MemoryError::AlreadyInitialized);
            }
            let mut manager = MemoryManager::init(boot, config, bitmap, mapper, mmu)?;
            manager.activate_heap()?;
            *slot = Some(manager);
            Ok(())
        })
    }

    /// Hand the manager back, leaving this instance uninitialized.
    pub fn teardown(&self) -> Option<MemoryManager<'a, M, H>> {
        self.inner.with_irq(Option::take)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.with_irq(|slot| slot.is_some())
    }

    /// Run `f` on the manager with interrupts disabled.
    ///
    /// # Errors
    /// [`MemoryError::NotInitialized`].
    pub fn with<R>(&self, f: impl FnOnce(&mut MemoryManager<'a, M, H>) -> R) -> Result<R, MemoryError> {
        self.inner
            .with_irq(|slot| slot.as_mut().map(f).ok_or(MemoryError::NotInitialized))
    }

    /// # Errors
    /// See [`MemoryManager::alloc`].
    pub fn alloc(&self, size: u32) -> Result<VirtualAddress, MemoryError> {
        self.with(|m| m.alloc(size))?
    }

    /// # Errors
    /// See [`MemoryManager::free`].
    pub fn free(&self, ptr: VirtualAddress) -> Result<(), MemoryError> {
        self.with(|m| m.free(ptr))?
    }

    /// # Errors
    /// See [`MemoryManager::realloc`].
    pub fn realloc(&self, ptr: VirtualAddress, size: u32) -> Result<VirtualAddress, MemoryError> {
        self.with(|m| m.realloc(ptr, size))?
    }

    /// # Errors
    /// [`MemoryError::NotInitialized`], otherwise see [`MemoryManager::stats`].
    pub fn stats(&self) -> Result<MemoryStats, MemoryError> {
        self.with(|m| m.stats())?
    }

    /// Entry point for the page-fault trap.
    ///
    /// A fault raised while the manager itself is locked cannot be served and
    /// halts, as does a fault before initialization.
    pub fn handle_page_fault(
        &self,
        process: Option<&mut ProcessContext<'_>>,
        fault: &FaultInfo,
    ) -> FaultResolution {
        let pid = process.as_deref().map(|p| p.pid);
        let Some(mut guard) = self.inner.try_lock() else {
            return halt(fault, pid, FaultCause::Reentrant);
        };
        match guard.as_mut() {
            Some(manager) => manager.handle_page_fault(process, fault),
            None => halt(fault, pid, FaultCause::NotInitialized),
        }
    }
}

fn halt(fault: &FaultInfo, pid: Option<u32>, cause: FaultCause) -> FaultResolution {
    let report = FaultReport::new(fault, pid, cause);
    report.log();
    FaultResolution::Halt(report)
}
