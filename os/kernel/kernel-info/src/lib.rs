//! # Kernel Memory Configuration and Boot Interface
//!
//! This crate is the authoritative source for the kernel's virtual memory
//! layout and for the record the boot layer hands to the memory core. Both the
//! memory manager and its tests read their defaults from here so the layout
//! cannot drift between components.
//!
//! ## Virtual Memory Architecture
//!
//! The kernel uses a classic 32-bit higher-half split. The page directory's
//! upper quarter (slots `768..1024`) is the kernel half and is shared by every
//! address space; the lower part is private to each process.
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │          User Space             │
//!             │   (private, per page directory) │
//!             │                ▲ stack grows ▼  │
//! USER_STACK_TOP / KERNEL_VIRTUAL_BASE ─────────┤ 0xC000_0000
//!             │   Direct map of physical RAM    │
//!             │   (kernel image, page tables)   │
//! KERNEL_HEAP_START ───────────────────────────┤ 0xD000_0000
//!             │         Kernel Heap             │
//!             │   (grows up to KERNEL_HEAP_MAX) │
//! KERNEL_HEAP_MAX ─────────────────────────────┤ 0xE000_0000
//!             │          (unused)               │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Boot Protocol
//!
//! The boot layer probes the platform and fills in a
//! [`BootMemoryInfo`](boot::BootMemoryInfo): total usable RAM and the physical
//! end of the statically used kernel image. Frames below that boundary (plus
//! the placement pool) are never handed out by the frame allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod memory;
