//! # Panic Reporting
//!
//! Every unrecoverable condition in the kernel ends here: the report goes to
//! the debug console, interrupts are masked and the CPU halts for good.

use core::fmt;

/// Write the panic report: the message with its source location, then the
/// halt notice.
///
/// # Errors
/// Propagates errors of the underlying writer.
pub fn write_report(out: &mut impl fmt::Write, message: &dyn fmt::Display, location: Option<(&str, u32)>) -> fmt::Result {
    match location {
        Some((file, line)) => writeln!(out, "KERNEL PANIC at {file}:{line}: {message}")?,
        None => writeln!(out, "KERNEL PANIC: {message}")?,
    }
    writeln!(out, "System halted.")
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    struct Report<'a>(&'a core::panic::PanicInfo<'a>);

    impl fmt::Display for Report<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let location = self.0.location().map(|l| (l.file(), l.line()));
            write_report(f, &self.0.message(), location)
        }
    }

    kernel_sync::irq::cli_stop_interrupts();
    kernel_qemu::qemu_trace!("{}", Report(info));
    loop {
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_names_the_location() {
        let mut out = String::new();
        write_report(&mut out, &"bad heap magic", Some(("heap.rs", 42))).unwrap();
        assert_eq!(out, "KERNEL PANIC at heap.rs:42: bad heap magic\nSystem halted.\n");
    }

    #[test]
    fn report_without_location() {
        let mut out = String::new();
        write_report(&mut out, &format_args!("out of physical memory ({} frames in use)", 7), None).unwrap();
        assert_eq!(out, "KERNEL PANIC: out of physical memory (7 frames in use)\nSystem halted.\n");
    }
}
