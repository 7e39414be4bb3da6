//! # Kernel Initialization
//!
//! The boot code calls [`init`] once, on its own stack, with paging enabled
//! and the first part of physical memory mapped at
//! [`KERNEL_BASE`](kernel_info::memory::KERNEL_BASE). From there:
//!
//! 1. The global allocator serves from a static bootstrap arena.
//! 2. A fresh kernel directory is built: the kernel image at its usual
//!    higher-half address, the copy-window table and the initial heap at
//!    `KERNEL_HEAP_START`. Its tables and the frame bitmap's first region
//!    bitmaps come from the arena.
//! 3. The new directory is loaded, the heap takes over and the global
//!    allocator is promoted.
//! 4. The scheduler adopts the caller as the bootstrap process and the timer
//!    starts.

use kernel_info::boot::BootMemoryMap;
use kernel_info::memory::KERNEL_BASE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sched::StackRegion;

/// What the boot code hands over.
#[derive(Clone, Debug)]
pub struct BootHandoff {
    /// Usable RAM. Must exclude anything the boot code still needs, such as
    /// loaded modules.
    pub memory_map: BootMemoryMap,
    /// Physical end of the kernel image, including `.bss`.
    pub image_end: PhysicalAddress,
    /// The stack [`init`] is called on; it becomes the bootstrap process's.
    pub boot_stack: StackRegion,
}

/// Physical frame behind a kernel-image address.
#[must_use]
pub fn image_frame(va: usize) -> Option<PhysicalPage<Size4K>> {
    let offset = u32::try_from(va).ok()?.checked_sub(KERNEL_BASE)?;
    Some(PhysicalPage::containing_address(PhysicalAddress::new(offset)))
}

/// Every page of low memory up to `image_end`, at its higher-half address.
pub fn image_pages(image_end: PhysicalAddress) -> impl Iterator<Item = (VirtualAddress, PhysicalPage<Size4K>)> {
    let frames = image_end.as_u32().div_ceil(4096);
    (0..frames).map(|frame| {
        let page = PhysicalPage::from_frame_number(frame);
        (VirtualAddress::new(KERNEL_BASE + page.base().as_u32()), page)
    })
}

#[cfg(target_arch = "x86")]
pub use machine::{KERNEL_MEMORY, KernelScheduler, SCHEDULER, init, with_scheduler};

#[cfg(target_arch = "x86")]
mod machine {
    use super::{BootHandoff, image_frame, image_pages};
    use crate::cpu::I386Cpu;
    use crate::vfs::MountTable;
    use crate::window::WindowMapper;
    use core::ptr::NonNull;
    use kernel_alloc::{FrameBitmap, Heap, HeapBacking, KernelMemory, LockedKernelMemory, PagedHeap, RegionBitmap, Vmm};
    use kernel_info::memory::{KERNEL_HEAP_INITIAL_SIZE, KERNEL_HEAP_START, PAGE_SIZE, TIMER_FREQUENCY_HZ};
    use kernel_registers::cr0::Cr0;
    use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
    use kernel_sched::Scheduler;
    use kernel_sync::SpinLock;
    use kernel_vmem::{PageDirectory, RawTable, TableFrame};

    /// Size of the bootstrap arena.
    const BOOT_ARENA_SIZE: usize = 64 * 1024;

    #[repr(align(4096))]
    struct Arena<const N: usize>([u8; N]);

    static mut BOOT_ARENA: Arena<BOOT_ARENA_SIZE> = Arena([0; BOOT_ARENA_SIZE]);

    #[cfg_attr(target_os = "none", global_allocator)]
    pub static KERNEL_MEMORY: LockedKernelMemory<WindowMapper, PagedHeap> = LockedKernelMemory::new();

    pub type KernelScheduler = Scheduler<&'static LockedKernelMemory<WindowMapper, PagedHeap>, MountTable>;

    pub static SCHEDULER: SpinLock<Option<KernelScheduler>> = SpinLock::new(None);

    /// Run `f` on the scheduler with interrupts disabled.
    ///
    /// # Panics
    /// Before [`init`].
    pub fn with_scheduler<R>(f: impl FnOnce(&mut KernelScheduler, &mut I386Cpu) -> R) -> R {
        let mut guard = SCHEDULER.lock_irq();
        let scheduler = guard
            .as_mut()
            .unwrap_or_else(|| panic!("scheduler used before initialization"));
        f(scheduler, &mut I386Cpu)
    }

    fn early_block(size: usize, align: usize) -> NonNull<u8> {
        KERNEL_MEMORY
            .bootstrap_allocate(size, align)
            .unwrap_or_else(|| panic!("bootstrap arena exhausted"))
    }

    fn early_table() -> TableFrame<RawTable> {
        let block = early_block(PAGE_SIZE as usize, PAGE_SIZE as usize);
        let frame = image_frame(block.as_ptr().addr())
            .unwrap_or_else(|| panic!("bootstrap arena at {block:p} is outside the kernel image"));
        // SAFETY: a page of the arena, never handed out again.
        unsafe { TableFrame::new(block.cast(), frame) }
    }

    fn refill_reserves(frames: &mut FrameBitmap) {
        while frames.needs_reserve() > 0 {
            let block = early_block(size_of::<RegionBitmap>(), align_of::<RegionBitmap>());
            // SAFETY: arena memory, owned by the bitmap from here on.
            unsafe { frames.install_reserve(block.cast()) };
        }
    }

    /// Top up what mapping a page may consume.
    fn refill_early(vmm: &mut Vmm<WindowMapper>) {
        refill_reserves(vmm.frames_mut());
        while vmm.needs_spare_tables() > 0 {
            // SAFETY: fresh arena page.
            unsafe { vmm.install_spare_table(early_table()) };
        }
    }

    /// Bring up memory management and scheduling.
    ///
    /// # Safety
    /// Call once, with interrupts disabled, on `handoff.boot_stack`, after
    /// the IDT routes IRQ 0 to [`crate::interrupts::timer_interrupt`].
    ///
    /// # Panics
    /// If paging is off or memory cannot be set up; there is no way to
    /// continue without it.
    pub unsafe fn init(handoff: &BootHandoff, fs: MountTable) {
        // SAFETY: the arena is only ever touched through the allocator.
        unsafe {
            let arena = NonNull::new(&raw mut BOOT_ARENA).unwrap_or_else(|| unreachable!());
            KERNEL_MEMORY.bootstrap(arena.cast(), BOOT_ARENA_SIZE);
        }
        crate::logging::init();
        log::info!(
            "{} KiB usable RAM in {} ranges, kernel image ends at {}",
            handoff.memory_map.total_bytes() / 1024,
            handoff.memory_map.len(),
            handoff.image_end
        );

        let mut frames = FrameBitmap::new(handoff.memory_map.clone());
        refill_reserves(&mut frames);

        // SAFETY: fresh arena page.
        let kernel = unsafe { PageDirectory::new(early_table()) };
        let mut vmm = Vmm::new(frames, WindowMapper, kernel);
        // SAFETY: fresh arena page.
        unsafe { vmm.install_window_table(early_table()) };
        for (va, frame) in image_pages(handoff.image_end) {
            refill_early(&mut vmm);
            vmm.map_kernel_page(va, frame)
                .unwrap_or_else(|e| panic!("cannot map the kernel image: {e}"));
        }

        // The heap window is not reachable before the new directory is
        // live, so nothing may be carved from it yet: the arena tops up
        // before every page.
        let mut backing = PagedHeap::new();
        let mut heap_end = KERNEL_HEAP_START as usize;
        while heap_end < (KERNEL_HEAP_START + KERNEL_HEAP_INITIAL_SIZE) as usize {
            refill_early(&mut vmm);
            heap_end += backing
                .grow(&mut vmm, heap_end, PAGE_SIZE as usize)
                .unwrap_or_else(|e| panic!("cannot map the initial heap: {e}"));
        }
        refill_early(&mut vmm);

        // SAFETY: CR0 is readable in ring 0.
        let cr0 = unsafe { Cr0::load_unsafe() };
        assert!(cr0.pg_paging(), "the boot code must enable paging");
        let mut cpu = I386Cpu;
        vmm.switch_to_kernel(&mut cpu);
        // SAFETY: supervisor writes honor read-only pages from now on.
        unsafe { cr0.with_wp_write_protect(true).store_unsafe() };

        // SAFETY: freshly mapped, owned by the heap from here on.
        let heap = unsafe {
            let base = NonNull::new(KERNEL_HEAP_START as usize as *mut u8).unwrap_or_else(|| unreachable!());
            Heap::new(base, KERNEL_HEAP_INITIAL_SIZE as usize)
        };
        KERNEL_MEMORY.promote(KernelMemory::new(heap, vmm, backing));

        *SCHEDULER.lock_irq() = Some(Scheduler::new(&KERNEL_MEMORY, fs, handoff.boot_stack));
        // SAFETY: the caller installed the IRQ 0 gate.
        unsafe { crate::pic::start_timer(TIMER_FREQUENCY_HZ) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_pages_cover_a_partial_last_page() {
        let pages: Vec<_> = image_pages(PhysicalAddress::new(0x2001)).collect();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], (VirtualAddress::new(0xC000_0000), PhysicalPage::from_frame_number(0)));
        assert_eq!(pages[2], (VirtualAddress::new(0xC000_2000), PhysicalPage::from_frame_number(2)));
    }

    #[test]
    fn image_frames_are_offset_by_the_kernel_base() {
        assert_eq!(image_frame(0xC012_3456), Some(PhysicalPage::from_frame_number(0x123)));
        assert_eq!(image_frame(0x0012_3456), None);
    }
}
