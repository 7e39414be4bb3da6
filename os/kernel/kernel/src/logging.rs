//! Kernel log output: the `log` facade, routed to the QEMU debug console.

use kernel_qemu::{QemuLogger, qemu_trace};
use log::LevelFilter;

const MAX_LEVEL: LevelFilter = if cfg!(debug_assertions) {
    LevelFilter::Debug
} else {
    LevelFilter::Info
};

static LOGGER: QemuLogger = QemuLogger::new(MAX_LEVEL);

/// Install the kernel logger. Later calls leave the first logger in place.
pub fn init() {
    match LOGGER.install() {
        Ok(()) => log::info!("logging at {MAX_LEVEL} and above"),
        Err(e) => qemu_trace!("logger not installed: {e}\n"),
    }
}
