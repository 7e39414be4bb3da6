//! Interrupt flag control for i386.
//!
//! Every operation here executes `cli`/`sti` and therefore requires ring 0.

use kernel_registers::LoadRegister;
use kernel_registers::eflags::Eflags;

/// Disables maskable interrupts (`cli`).
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables maskable interrupts (`sti`).
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Whether `EFLAGS.IF` is currently set.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    Eflags::load().interrupt_enable()
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots `EFLAGS.IF`. If interrupts were enabled, it
/// executes `cli`; on drop it executes `sti` **only** if they were enabled
/// before, so guards nest.
pub struct IrqGuard {
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
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
