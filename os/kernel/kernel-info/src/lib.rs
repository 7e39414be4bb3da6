//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the boot-time description of physical memory
//! shared by the allocator, the paging code and the scheduler.
//!
//! ## Virtual Memory Architecture
//!
//! The kernel runs in the upper gigabyte of every 32-bit address space. Each
//! process directory carries copies of the kernel's directory entries for
//! that region, so kernel code, data and heap stay reachable after a
//! directory switch.
//!
//! ```text
//! Virtual Address Space Layout (32-bit, non-PAE):
//!
//! 0x0000_0000         ┌─────────────────────────────────┐
//!                     │   Process image (ELF segments)  │
//!                     │                                 │
//! PROCESS_STACK_TOP   ├─────────────────────────────────┤ 0xC000_0000
//!   - stack size      │   Process stack (grows down)    │
//! KERNEL_BASE         ├─────────────────────────────────┤ 0xC000_0000
//!                     │   Kernel image + low memory     │
//! KERNEL_HEAP_START   ├─────────────────────────────────┤ 0xD000_0000
//!                     │   Kernel heap (grows up)        │
//! KERNEL_HEAP_END     ├─────────────────────────────────┤ 0xE000_0000
//!                     │   (unused)                      │
//! COPY_WINDOW         ├─────────────────────────────────┤ 0xFFBF_E000
//!                     │   Two physical alias slots      │
//! 0xFFFF_FFFF         └─────────────────────────────────┘
//! ```
//!
//! ## Boot Protocol
//!
//! The external boot code translates the multiboot memory map into a
//! [`BootMemoryMap`](boot::BootMemoryMap) of usable physical ranges. The frame
//! allocator never hands out a frame outside those ranges.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
