use crate::IrqGuard;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Spin lock whose critical sections always run with interrupts disabled.
///
/// There is no plain `lock`: an interrupt handler that touches the same data
/// would otherwise spin forever on a lock its own CPU holds.
///
/// # Examples
///
/// ```
/// use kernel_sync::{SpinMutex, interrupts_enabled};
///
/// static FRAMES: SpinMutex<u32> = SpinMutex::new(0);
///
/// {
///     let mut g = FRAMES.lock_irq();
///     *g += 1;
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(FRAMES.with_irq(|n| *n), 1);
/// ```
pub struct SpinMutex<T> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the value is only reached through a guard, and there is one guard at a time.
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    fn acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Disable interrupts, then spin until the lock is ours.
    #[inline]
    pub fn lock_irq(&self) -> SpinGuard<'_, T> {
        let irq = IrqGuard::new();
        while !self.acquire() {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinGuard { lock: self, _irq: irq }
    }

    /// Take the lock only if it is free right now.
    ///
    /// Interrupts stay disabled for as long as the returned guard lives. On
    /// failure the interrupt state is restored before returning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        let irq = IrqGuard::new();
        self.acquire().then(|| SpinGuard { lock: self, _irq: irq })
    }

    /// Runs `f` on the protected value inside an interrupt-free critical section.
    #[inline]
    pub fn with_irq<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut g = self.lock_irq();
        f(&mut g)
    }
}

/// Access to a locked [`SpinMutex`].
///
/// Dropping it releases the lock first and restores interrupts after.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinMutex<T>,
    // Dropped after `Drop::drop` has released the lock.
    _irq: IrqGuard,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}
