//! # Memory Layout

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u32 = 4096;

/// Where the kernel executes (VMA). Everything at or above this address is
/// kernel space and is mapped identically into every process.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// First virtual address of the kernel heap.
pub const KERNEL_HEAP_START: u32 = 0xD000_0000;

/// Exclusive upper bound of the kernel heap window.
pub const KERNEL_HEAP_END: u32 = 0xE000_0000;

/// Bytes mapped into the heap at boot.
pub const KERNEL_HEAP_INITIAL_SIZE: u32 = 0x10_0000; // 1 MiB

/// Minimum number of bytes the heap grows by when no block fits.
pub const HEAP_GROWTH_INCREMENT: u32 = 0x4_0000; // 256 KiB

/// Sanity value stored in every heap block header.
pub const HEAP_MAGIC: u32 = 0xFEAF_2004;

/// Exclusive top of every process stack; stacks grow down from here.
pub const PROCESS_STACK_TOP: u32 = KERNEL_BASE;

/// Stack size used when a caller does not ask for a specific one.
pub const DEFAULT_STACK_SIZE: u32 = 16 * 1024;

/// Base of the two-page window used to alias arbitrary physical frames.
pub const COPY_WINDOW: u32 = 0xFFBF_E000;

/// Number of alias slots in the copy window.
pub const COPY_WINDOW_SLOTS: u32 = 2;

/// Size of the stack the kernel switches to while tearing down an exiting process.
pub const IDLE_STACK_SIZE: usize = 16 * 1024;

/// Upper bound on open file descriptors per process.
pub const MAX_FILE_DESCRIPTORS: usize = 256;

/// Programmable interval timer frequency driving the scheduler.
pub const TIMER_FREQUENCY_HZ: u32 = 100;

const _: () = {
    assert!(KERNEL_HEAP_START.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_END > KERNEL_HEAP_START);
    assert!(KERNEL_HEAP_START >= KERNEL_BASE);
    assert!(KERNEL_HEAP_INITIAL_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(HEAP_GROWTH_INCREMENT.is_multiple_of(PAGE_SIZE));
    assert!(DEFAULT_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(PROCESS_STACK_TOP <= KERNEL_BASE);
    assert!(COPY_WINDOW >= KERNEL_HEAP_END);
    assert!(COPY_WINDOW.is_multiple_of(PAGE_SIZE));
    // Both slots live in the same page table.
    assert!(COPY_WINDOW >> 22 == (COPY_WINDOW + (COPY_WINDOW_SLOTS - 1) * PAGE_SIZE) >> 22);
    assert!(IDLE_STACK_SIZE.is_multiple_of(16));
};
