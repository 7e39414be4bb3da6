//! # i386 I/O Port Access
//!
//! Thin wrappers around `in`/`out` for the legacy devices the kernel talks
//! to directly:
//!
//! ```text
//! 0x0020-0x0021   PIC #1 (command, data)
//! 0x0040-0x0043   PIT (channel 0..2, command)
//! 0x0402          QEMU debug console (see kernel-qemu)
//! ```

/// Write one byte to an I/O port (`out dx, al`).
///
/// # Safety
/// - Must run at CPL 0, or with I/O permission for `port`.
/// - `port` must belong to the intended device and the device must be in a
///   state that accepts this write. A wrong write can wedge the PIC or the
///   timer.
/// - Multi-byte device protocols must not be interleaved with interrupt
///   handlers touching the same device.
#[inline]
pub unsafe fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") val, options(nomem, nostack, preserves_flags));
    }
}

/// Read one byte from an I/O port (`in al, dx`).
///
/// # Safety
/// As for [`outb`]; `port` must be a readable register of the device.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let mut v: u8;
    unsafe {
        core::arch::asm!("in al, dx", in("dx") port, out("al") v, options(nomem, nostack, preserves_flags));
    }
    v
}
