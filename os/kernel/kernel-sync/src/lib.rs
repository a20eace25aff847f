//! # Kernel synchronization primitives
//!
//! The memory core is single-core; the only concurrency it has to survive is
//! an interrupt (or a page fault) arriving in the middle of a mutation. Every
//! way into a [`SpinMutex`] therefore disables interrupts first and keeps
//! them off until the guard is gone.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod irq;
mod spin;

pub use irq::{IrqGuard, interrupts_enabled};
pub use spin::{SpinGuard, SpinMutex};
