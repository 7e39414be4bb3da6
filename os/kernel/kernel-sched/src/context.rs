//! Execution contexts and the scheduler's dispatch decision.
//!
//! The architecture code owns the actual register save and restore. This
//! module only fixes the layout both sides agree on:
//!
//! * `suspend(&mut SavedContext) -> Resumption` stores the callee-saved
//!   registers plus a resume address and returns [`Resumption::Suspended`];
//!   when the context is later resumed, the same call returns again with
//!   [`Resumption::Resumed`].
//! * `resume(&SavedContext) -> !` restores a context.
//! * `enter(&EntryFrame) -> !` starts a process at its entry point.

use core::mem::offset_of;

/// Registers preserved across a context switch.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SavedContext {
    pub eip: u32,
    pub esp: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
}

impl SavedContext {
    pub const EIP: usize = offset_of!(Self, eip);
    pub const ESP: usize = offset_of!(Self, esp);
    pub const EBP: usize = offset_of!(Self, ebp);
    pub const EBX: usize = offset_of!(Self, ebx);
    pub const ESI: usize = offset_of!(Self, esi);
    pub const EDI: usize = offset_of!(Self, edi);
}

/// Which return of `suspend` the caller is seeing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Resumption {
    /// First return: the context was just saved.
    Suspended = 0,
    /// Second return: someone resumed the context.
    Resumed = 1,
}

/// Everything needed to call a process's entry point for the first time as
/// `entry(argc, argv, envp)`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EntryFrame {
    pub entry: u32,
    /// 16-byte aligned, below the argument strings and arrays.
    pub stack_pointer: u32,
    pub argc: u32,
    pub argv: u32,
    pub envp: u32,
}

impl EntryFrame {
    pub const ENTRY: usize = offset_of!(Self, entry);
    pub const STACK_POINTER: usize = offset_of!(Self, stack_pointer);
    pub const ARGC: usize = offset_of!(Self, argc);
    pub const ARGV: usize = offset_of!(Self, argv);
    pub const ENVP: usize = offset_of!(Self, envp);
}

/// What the timer handler must do after [`Scheduler::timer_tick`].
///
/// [`Scheduler::timer_tick`]: crate::Scheduler::timer_tick
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// Call a process's entry point for the first time.
    Enter(EntryFrame),
    /// Continue a forked child where its parent called fork.
    Jump(SavedContext),
    /// Return into a preempted process.
    Resume(SavedContext),
    /// Nothing is runnable.
    Idle,
}
