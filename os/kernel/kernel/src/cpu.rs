//! The processor as seen by the memory manager and the scheduler.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::StoreRegisterUnsafe;
use kernel_registers::cr3::Cr3;
use kernel_sched::Cpu;
use kernel_sync::IrqGuard;
use kernel_vmem::PagingHardware;

/// Handle to the single CPU. Carries no state; all of it lives in registers.
#[derive(Debug, Default)]
pub struct I386Cpu;

/// Drop the TLB entry for `va`.
#[inline]
pub fn invlpg(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
}

impl PagingHardware for I386Cpu {
    unsafe fn load_directory(&mut self, directory: PhysicalAddress) {
        unsafe { Cr3::from_directory_phys(directory, false, false).store_unsafe() };
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        invlpg(va);
    }
}

impl Cpu for I386Cpu {
    fn acknowledge_timer(&mut self) {
        // SAFETY: only called from the timer path.
        unsafe { crate::pic::end_of_interrupt() };
    }

    fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let _irq = IrqGuard::new();
        f(self)
    }
}
