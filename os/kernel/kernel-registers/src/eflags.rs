#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::LoadRegister;
use bitfield_struct::bitfield;

/// EFLAGS in 32-bit protected mode.
#[bitfield(u32)]
pub struct Eflags {
    /// Bit 0 — Carry Flag.
    pub cf: bool,
    /// Bit 1 — Reserved, reads as 1.
    #[bits(default = true)]
    _reserved_1: bool,
    /// Bit 2 — Parity Flag.
    pub pf: bool,
    #[bits(default = false)]
    _reserved_3: bool,
    /// Bit 4 — Auxiliary Carry Flag.
    pub af: bool,
    #[bits(default = false)]
    _reserved_5: bool,
    /// Bit 6 — Zero Flag.
    pub zf: bool,
    /// Bit 7 — Sign Flag.
    pub sf: bool,
    /// Bit 8 — Trap Flag.
    pub tf: bool,
    /// Bit 9 — Interrupt Enable Flag. Maskable interrupts are delivered while set.
    pub interrupt_enable: bool,
    /// Bit 10 — Direction Flag.
    pub df: bool,
    /// Bit 11 — Overflow Flag.
    pub of: bool,
    /// Bits 12–13 — I/O Privilege Level.
    #[bits(2)]
    pub iopl: u8,
    /// Bit 14 — Nested Task.
    pub nt: bool,
    #[bits(default = false)]
    _reserved_15: bool,
    /// Bit 16 — Resume Flag.
    pub rf: bool,
    /// Bit 17 — Virtual-8086 Mode.
    pub vm: bool,
    /// Bit 18 — Alignment Check.
    pub ac: bool,
    /// Bit 19 — Virtual Interrupt Flag.
    pub vif: bool,
    /// Bit 20 — Virtual Interrupt Pending.
    pub vip: bool,
    /// Bit 21 — CPUID available.
    pub id: bool,
    #[bits(10, default = 0)]
    _reserved_22_31: u16,
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegister for Eflags {
    fn load() -> Self {
        let flags: u32;
        unsafe {
            core::arch::asm!("pushfd", "pop {}", out(reg) flags, options(nomem, preserves_flags));
        }
        Self::from_bits(flags)
    }
}
