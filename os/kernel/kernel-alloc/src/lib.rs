//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! This crate is the memory core of the kernel: it decides which physical
//! frames are in use, builds and mutates the two-level page tables of every
//! address space, resolves page faults, and carves the kernel heap out of a
//! growable paged window. Every other subsystem allocates through it, so it
//! has to be usable before any of them initialize.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          KernelMemory / MemoryManager               │
//! │    • init / teardown, interrupt-safe entry points   │
//! └───────┬──────────────────┬──────────────────┬───────┘
//!         │                  │                  │
//! ┌───────▼───────┐  ┌───────▼───────┐  ┌───────▼───────┐
//! │  Kernel Heap  │  │  Page Fault   │  │ Region / VMA  │
//! │ best fit,     │  │ lazy mapping, │  │ bulk map and  │
//! │ tags, growth  │  │ stack growth  │  │ unmap         │
//! └───────┬───────┘  └───────┬───────┘  └───────┬───────┘
//!         │                  │                  │
//! ┌───────▼──────────────────▼──────────────────▼───────┐
//! │          Page Table / Directory Manager (Vmm)       │
//! │    • kernel half shared, user half owned            │
//! │    • create / clone / free / switch directories     │
//! └─────────────────────────┬───────────────────────────┘
//!                           │
//! ┌─────────────────────────▼───────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • one bit per 4 KiB frame                        │
//! │    • sole authority on frame ownership              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Physical Frame Allocator ([`frame_alloc`])
//!
//! A bitmap over all physical frames. Frames below the end of the kernel image
//! and the placement pool are reserved at construction. Allocation returns the
//! lowest free frame; freeing is idempotent.
//!
//! ### Physical Mapper ([`phys_mapper`])
//!
//! Physical memory below [`DIRECT_MAP_LIMIT`](kernel_info::memory::DIRECT_MAP_LIMIT)
//! is mapped at `KERNEL_VIRTUAL_BASE + pa` in every address space; page
//! tables and fresh frames are reached through that window.
//!
//! ### Virtual Memory Manager ([`vmm`], [`region`])
//!
//! * **Kernel directory**: built once by [`Vmm::bootstrap`]; all 256
//!   kernel-half tables exist from the start, so copying the upper directory
//!   slots is enough to share the kernel with every process.
//! * **Process directories**: created empty, cloned (user pages deep-copied),
//!   freed (user tables and frames released) and switched with TLB upkeep.
//! * **Regions**: allocate or free a page range in one call.
//!
//! ### Page Fault Handler ([`page_fault`], [`vma`])
//!
//! Lazily populates registered mappings, grows stacks down to a fixed floor
//! and otherwise decides between terminating the process and halting.
//!
//! ### Kernel Heap ([`heap`])
//!
//! Best-fit allocation with immediate coalescing over `[start, end)`, grown a
//! page at a time up to a hard ceiling. Before paging is ready it runs as a
//! bump allocator over the placement pool.
//!
//! ## Memory Layout Integration
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │        User Space               │
//!             │  (stack grows down from the top)│
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_VIRTUAL_BASE
//!             │   Direct map of physical memory │
//!             │   (kernel image, placement pool)│
//! 0xD000_0000 ├─────────────────────────────────┤ KERNEL_HEAP_START
//!             │        Kernel Heap              │
//! 0xE000_0000 ├─────────────────────────────────┤ KERNEL_HEAP_MAX
//!             │        unused                   │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! The core is single-core. Interrupts are the only source of reentrancy, so
//! [`KernelMemory`] takes its lock with interrupts disabled for the whole
//! operation, heap growth included.
//!
//! ## Usage Patterns
//!
//! ```rust
//! use kernel_alloc::frame_alloc::BitmapFrameAlloc;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let mut bitmap = [0u64; BitmapFrameAlloc::words_for(1024)];
//! let mut frames = BitmapFrameAlloc::new(&mut bitmap, 1024, PhysicalAddress::new(0x20_0000));
//! let frame = frames.allocate_frame().unwrap();
//! assert_eq!(frame.index(), 0x200);
//! frames.free_frame(frame).unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod frame_alloc;
pub mod heap;
pub mod manager;
pub mod page_fault;
pub mod phys_mapper;
pub mod region;
pub mod vma;
pub mod vmm;

pub use frame_alloc::{BitmapFrameAlloc, FrameAllocError};
pub use heap::{
    Heap, HeapBacking, HeapError, HeapMemory, HeapStats, KernelHeap, PlacementAllocator,
    VmmBacking, VmmView,
};
pub use manager::{KernelMemory, MemoryConfig, MemoryError, MemoryManager, MemoryStats};
pub use page_fault::{
    FaultCause, FaultInfo, FaultReport, FaultResolution, PageFaultError, ProcessContext,
    StackRegion, handle_page_fault,
};
pub use region::RegionError;
pub use vma::{FileBacking, FileMapping, FileReadError, Protection, Vma, VmaError, VmaList};
pub use vmm::{Directory, Vmm, VmmError};
