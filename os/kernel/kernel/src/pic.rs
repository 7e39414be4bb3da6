//! # 8259 PIC and 8253 PIT
//!
//! The boot code remaps the master PIC so that IRQ 0 arrives at vector 32
//! and leaves every line masked. [`start_timer`] programs PIT channel 0 as
//! a rate generator and unmasks IRQ 0; the timer handler acknowledges each
//! tick with [`end_of_interrupt`].

use bitfield_struct::bitfield;

pub const PIC1_COMMAND: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;

/// Non-specific end-of-interrupt command (OCW2).
pub const PIC_EOI: u8 = 0x20;

pub const PIT_CHANNEL0: u16 = 0x40;
pub const PIT_COMMAND: u16 = 0x43;

/// Input clock of the PIT.
pub const PIT_BASE_FREQUENCY_HZ: u32 = 1_193_182;

/// PIT mode/command register (port 0x43).
#[bitfield(u8)]
pub struct PitCommand {
    /// Bit 0 — BCD instead of binary counting.
    pub bcd: bool,

    /// Bits 1–3 — Operating mode (2 = rate generator, 3 = square wave).
    #[bits(3)]
    pub mode: u8,

    /// Bits 4–5 — Access mode (3 = low byte, then high byte).
    #[bits(2)]
    pub access: u8,

    /// Bits 6–7 — Channel.
    #[bits(2)]
    pub channel: u8,
}

impl PitCommand {
    /// Channel 0, rate generator, 16-bit reload value.
    #[must_use]
    pub const fn periodic() -> Self {
        Self::new().with_channel(0).with_access(3).with_mode(2)
    }
}

/// Reload value for a tick rate of `hz`.
///
/// The counter is 16 bits wide and `0` encodes 65536, so rates below about
/// 19 Hz are clamped to the slowest possible rate.
#[must_use]
pub fn pit_divisor(hz: u32) -> u16 {
    match PIT_BASE_FREQUENCY_HZ / hz.max(1) {
        0 => 1,
        divisor => u16::try_from(divisor).unwrap_or(0),
    }
}

/// Acknowledge an interrupt from the master PIC.
///
/// # Safety
/// Only from an IRQ handler for a master PIC line.
#[cfg(target_arch = "x86")]
pub unsafe fn end_of_interrupt() {
    unsafe { crate::ports::outb(PIC1_COMMAND, PIC_EOI) };
}

/// Program the timer for `hz` ticks per second and unmask IRQ 0.
///
/// # Safety
/// The IRQ 0 vector must already route to the timer handler.
#[cfg(target_arch = "x86")]
pub unsafe fn start_timer(hz: u32) {
    use crate::ports::{inb, outb};

    let [low, high] = pit_divisor(hz).to_le_bytes();
    unsafe {
        outb(PIT_COMMAND, PitCommand::periodic().into_bits());
        outb(PIT_CHANNEL0, low);
        outb(PIT_CHANNEL0, high);
        let mask = inb(PIC1_DATA);
        outb(PIC1_DATA, mask & !1);
    }
    log::info!("timer running at {hz} Hz");
}
