use kernel_memory_addresses::{PhysicalPage, VirtualPage};

/// The CPU side of address translation.
///
/// The directory manager calls [`load_root`](Mmu::load_root) when switching
/// directories and [`invalidate_page`](Mmu::invalidate_page) after every
/// change to a mapping of the currently loaded directory.
pub trait Mmu {
    /// Make `root` the current page directory (`CR3` on x86).
    fn load_root(&mut self, root: PhysicalPage);

    /// Drop any cached translation of `page` (`invlpg` on x86).
    fn invalidate_page(&mut self, page: VirtualPage);
}

/// The real thing: writes `CR3` and issues `invlpg`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

#[cfg(all(target_arch = "x86", target_os = "none"))]
impl Mmu for X86Mmu {
    #[inline]
    fn load_root(&mut self, root: PhysicalPage) {
        let cr3 = root.base().as_u32();
        // SAFETY: `root` is a fully initialized page directory whose kernel
        // half maps the code currently executing.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn invalidate_page(&mut self, page: VirtualPage) {
        let va = page.base().as_u32();
        // SAFETY: invlpg has no memory side effects beyond the TLB.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }
}
