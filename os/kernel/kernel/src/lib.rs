//! # i386 Kernel Glue
//!
//! Binds the portable memory and scheduling crates to the machine:
//!
//! ```text
//!   boot code ──► boot::init ──► KERNEL_MEMORY (global allocator)
//!                     │               │
//!                     │               ├─ Vmm<WindowMapper>   copy window via PTE writes + invlpg
//!                     │               └─ PagedHeap           heap growth maps fresh frames
//!                     ▼
//!                 SCHEDULER ◄── timer_interrupt (IRQ 0) ──► switch::{resume, enter, idle}
//! ```
//!
//! The boot sequence itself (multiboot, GDT, IDT, PIC remapping) lives
//! outside this crate. It enters [`boot::init`] with paging enabled and the
//! kernel image mapped at [`KERNEL_BASE`](kernel_info::memory::KERNEL_BASE),
//! and routes IRQ 0 to [`interrupts::timer_interrupt`].
//!
//! Everything that executes privileged instructions is compiled for
//! `target_arch = "x86"` only; the remaining modules build and test on the
//! host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod boot;
#[cfg(target_arch = "x86")]
pub mod cpu;
#[cfg(target_arch = "x86")]
pub mod interrupts;
pub mod logging;
pub mod panic;
pub mod pic;
#[cfg(target_arch = "x86")]
pub mod ports;
#[cfg(target_arch = "x86")]
pub mod switch;
pub mod vfs;
pub mod window;
