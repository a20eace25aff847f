use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// A single 32-bit x86 paging entry in its raw bitfield form.
///
/// Page-directory entries and page-table entries share this layout; the
/// directory-level meaning of `large_page` (4 MiB pages) is never used here.
///
/// ### Bit layout
///
/// | Bits   | Name / Mnemonic | Meaning |
/// |--------|-----------------|---------|
/// | 0      | `P`             | Valid entry if set |
/// | 1      | `RW`            | Writable if set |
/// | 2      | `US`            | User-mode accessible if set |
/// | 3      | `PWT`           | Write-through caching |
/// | 4      | `PCD`           | Disable caching |
/// | 5      | `A`             | Accessed (set by the CPU) |
/// | 6      | `D`             | Dirty (set by the CPU, leaf only) |
/// | 7      | `PS` / `PAT`    | Large page in a PDE, PAT in a PTE |
/// | 8      | `G`             | Global (leaf only) |
/// | 9–11   | OS avail        | Ignored by hardware |
/// | 12–31  | `frame`         | Physical frame index |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::PageEntryBits;
/// # use kernel_memory_addresses::PhysicalPage;
/// let e = PageEntryBits::kernel_rw().with_frame_page(PhysicalPage::from_index(0x123));
/// assert!(e.present());
/// assert!(e.writable());
/// assert_eq!(u32::from(e), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Clear implies a not-present entry; any access through it faults.
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Set to allow ring-3 access; clear restricts to the kernel.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Hardware-maintained.
    pub accessed: bool,

    /// Dirty (D, bit 6). Hardware-maintained, leaf only.
    pub dirty: bool,

    /// Page Size (PS, bit 7) in a directory entry; always clear here.
    pub large_page: bool,

    /// Global (G, bit 8), leaf only.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame index (bits 12..=31).
    #[bits(20)]
    pub frame: u32,
}

impl PageEntryBits {
    /// Present, writable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, writable, user-accessible.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::kernel_rw().with_user_access(true)
    }

    /// Present, read-only, user-accessible.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }

    #[inline]
    #[must_use]
    pub const fn frame_page(self) -> PhysicalPage {
        PhysicalPage::from_index(self.frame())
    }

    #[inline]
    #[must_use]
    pub const fn with_frame_page(self, frame: PhysicalPage) -> Self {
        self.with_frame(frame.index())
    }

    /// Permission bits only; frame, hardware-maintained and OS bits cleared.
    #[inline]
    #[must_use]
    pub const fn permissions(self) -> Self {
        Self::new()
            .with_present(self.present())
            .with_writable(self.writable())
            .with_user_access(self.user_access())
            .with_write_through(self.write_through())
            .with_cache_disabled(self.cache_disabled())
            .with_global_translation(self.global_translation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_hardware() {
        let e = PageEntryBits::user_rw().with_frame_page(PhysicalPage::from_index(0xABCDE));
        assert_eq!(u32::from(e), 0xABCD_E007);
        assert_eq!(e.frame_page().index(), 0xABCDE);
    }

    #[test]
    fn permissions_drop_frame_and_status_bits() {
        let e = PageEntryBits::kernel_rw()
            .with_accessed(true)
            .with_dirty(true)
            .with_frame(42);
        let p = e.permissions();
        assert!(p.present());
        assert!(p.writable());
        assert!(!p.accessed());
        assert!(!p.dirty());
        assert_eq!(p.frame(), 0);
    }

    #[test]
    fn read_only_user_flags() {
        let e = PageEntryBits::user_ro();
        assert!(e.present());
        assert!(!e.writable());
        assert!(e.user_access());
    }
}
