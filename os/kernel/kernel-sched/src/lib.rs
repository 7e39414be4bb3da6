//! # Processes and Scheduling
//!
//! Process control blocks, their descriptor tables, and the timer-driven
//! round-robin dispatcher.
//!
//! ```text
//!   timer IRQ ──► Scheduler::timer_tick ──► Dispatch ──► architecture code
//!                      │                       │
//!                      │ switch address space  ├─ Enter:  call entry(argc, argv, envp)
//!                      ▼                       ├─ Jump:   continue a forked child
//!                 KernelMemory                 ├─ Resume: return into a preempted process
//!                                              └─ Idle:   wait for the next tick
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!   create_task ──► Initialized ──┐
//!                                 ├─► Running ◄──► Waiting / Stopped
//!   fork ─────────► Forked ───────┘      │
//!                                        ▼
//!                                 free_process ──► Finished ──► reap
//! ```
//!
//! The bootstrap process (pid 0) is the kernel itself. It runs in the kernel
//! directory, is never freed and cannot fork.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod args;
pub mod context;
pub mod fs;
pub mod pid;
pub mod platform;
pub mod process;
pub mod scheduler;

pub use args::{ArgumentImage, TaskArgs};
pub use context::{Dispatch, EntryFrame, Resumption, SavedContext};
pub use fs::{
    DescriptorError, DescriptorTable, FileError, FileSystem, FsError, FsId, OpenFile, OpenFlags, SeekFrom,
};
pub use pid::Pid;
pub use platform::{Cpu, MemoryContext};
pub use process::{Process, ProcessCode, ProcessStatus, StackRegion};
pub use scheduler::{Scheduler, TaskError, TaskSpec};
