//! # Memory Layout

/// Start of the kernel half of every address space.
///
/// Physical memory is direct-mapped here: `KERNEL_VIRTUAL_BASE + pa` reaches
/// physical address `pa` for `pa < DIRECT_MAP_LIMIT`.
pub const KERNEL_VIRTUAL_BASE: u32 = 0xC000_0000;

/// First page-directory slot belonging to the kernel half.
pub const KERNEL_DIRECTORY_SPLIT: usize = (KERNEL_VIRTUAL_BASE >> 22) as usize;

/// End of userspace VA range after which kernel space begins.
pub const USERSPACE_END: u32 = KERNEL_VIRTUAL_BASE;

/// Amount of physical memory reachable through the direct map.
pub const DIRECT_MAP_LIMIT: u32 = 0x1000_0000; // 256 MiB

/// Where the kernel image is loaded in *physical* memory.
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// Bytes after the kernel image handed out by the placement allocator
/// before the kernel heap is active.
pub const PLACEMENT_POOL_SIZE: u32 = 0x0010_0000; // 1 MiB

/// Base of the kernel heap window.
pub const KERNEL_HEAP_START: u32 = 0xD000_0000;

/// Bytes mapped for the kernel heap at activation time.
pub const KERNEL_HEAP_INITIAL_SIZE: u32 = 0x0010_0000; // 1 MiB

/// Hard ceiling of the kernel heap window (exclusive).
pub const KERNEL_HEAP_MAX: u32 = 0xE000_0000;

/// Exclusive top of a user stack; stacks grow downwards from here.
pub const USER_STACK_TOP: u32 = USERSPACE_END;

/// Upper bound of fault-driven stack growth.
pub const MAX_STACK_SIZE: u32 = 0x0080_0000; // 8 MiB

const _: () = {
    assert!(KERNEL_VIRTUAL_BASE.is_multiple_of(1 << 22));
    assert!(KERNEL_VIRTUAL_BASE as u64 + DIRECT_MAP_LIMIT as u64 <= KERNEL_HEAP_START as u64);
    assert!(KERNEL_HEAP_START < KERNEL_HEAP_MAX);
    assert!(KERNEL_HEAP_INITIAL_SIZE.is_multiple_of(4096));
    assert!(KERNEL_HEAP_START as u64 + KERNEL_HEAP_INITIAL_SIZE as u64 <= KERNEL_HEAP_MAX as u64);
    assert!(MAX_STACK_SIZE.is_multiple_of(4096));
    assert!(MAX_STACK_SIZE < USER_STACK_TOP);
};
