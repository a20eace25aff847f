//! The interrupt flag, saved and restored around critical sections.

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// On bare-metal x86 this snapshots `IF` (bit 9 of `EFLAGS`) and issues
/// `cli`/`sti`. On every other target the interrupt flag is simulated by a
/// nesting counter so hosted tests can observe the critical sections.
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = arch::save_and_disable();
        Self { were_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        arch::restore(self.were_enabled);
    }
}

/// Returns whether maskable interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::enabled()
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod arch {
    const IF: u32 = 1 << 9;

    #[inline]
    fn eflags() -> u32 {
        let r: u32;
        unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r
    }

    #[inline]
    pub fn enabled() -> bool {
        eflags() & IF != 0
    }

    #[inline]
    pub fn save_and_disable() -> bool {
        let was = enabled();
        if was {
            unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
        }
        was
    }

    #[inline]
    pub fn restore(were_enabled: bool) {
        if were_enabled {
            unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod arch {
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Number of live guards; interrupts count as enabled only at zero.
    static DISABLE_DEPTH: AtomicUsize = AtomicUsize::new(0);

    #[inline]
    pub fn enabled() -> bool {
        DISABLE_DEPTH.load(Ordering::Acquire) == 0
    }

    #[inline]
    pub fn save_and_disable() -> bool {
        DISABLE_DEPTH.fetch_add(1, Ordering::AcqRel) == 0
    }

    #[inline]
    pub fn restore(_were_enabled: bool) {
        DISABLE_DEPTH.fetch_sub(1, Ordering::AcqRel);
    }
}
