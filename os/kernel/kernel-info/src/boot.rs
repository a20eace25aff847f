//! # Kernel Boot Information

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Memory facts the boot layer passes to the memory core.
///
/// Keep this `#[repr(C)]`; it crosses the assembly/boot boundary.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootMemoryInfo {
    /// Total usable physical memory in **bytes**, as reported by the platform probe.
    pub total_memory_bytes: u64,

    /// Physical address of the first byte after the statically used kernel
    /// memory (image, boot stack, early structures).
    pub kernel_end: u32,
}

impl BootMemoryInfo {
    #[must_use]
    pub const fn new(total_memory_bytes: u64, kernel_end: u32) -> Self {
        Self {
            total_memory_bytes,
            kernel_end,
        }
    }

    /// Number of whole 4 KiB frames covered by usable memory.
    ///
    /// Memory beyond the 32-bit physical address space is ignored.
    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        let max = 1u64 << 32;
        let bytes = if self.total_memory_bytes > max {
            max
        } else {
            self.total_memory_bytes
        };
        #[allow(clippy::cast_possible_truncation)]
        let frames = (bytes / PAGE_SIZE as u64) as u32;
        frames
    }

    #[must_use]
    pub const fn kernel_end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.kernel_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_frames_truncates_partial_frames() {
        let info = BootMemoryInfo::new(16 * 1024 * 1024 + 100, 0x20_0000);
        assert_eq!(info.total_frames(), 4096);
    }

    #[test]
    fn total_frames_clamps_to_32_bit_space() {
        let info = BootMemoryInfo::new(8 * 1024 * 1024 * 1024, 0x20_0000);
        assert_eq!(info.total_frames(), 1 << 20);
    }
}
