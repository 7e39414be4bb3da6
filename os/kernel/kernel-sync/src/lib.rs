//! # Kernel synchronization primitives
//!
//! The kernel runs on a single CPU; the only source of concurrency is the
//! timer interrupt. Global kernel state therefore sits behind a [`SpinLock`]
//! that is taken with interrupts disabled ([`SpinLock::lock_irq`]), so an
//! interrupt handler can never observe, or deadlock on, a half-finished
//! critical section.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(target_arch = "x86")]
pub mod irq;
mod spin_lock;

#[cfg(target_arch = "x86")]
pub use irq::IrqGuard;
#[cfg(target_arch = "x86")]
pub use spin_lock::IrqSpinLockGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
