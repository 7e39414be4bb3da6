//! # Context Switch Primitives
//!
//! The register-level half of [`kernel_sched::Dispatch`]. All processes run
//! in ring 0, so a switch is a change of stack pointer, callee-saved
//! registers and instruction pointer; no privilege transition is involved.
//!
//! Process stacks share one virtual range, so none of these may be called
//! on a process stack after the target address space has been made live.
//! The timer path runs on [`INTERRUPT_STACK`](crate::interrupts) instead.

use core::arch::naked_asm;
use kernel_info::memory::IDLE_STACK_SIZE;
use kernel_sched::{EntryFrame, Resumption, SavedContext};

#[repr(align(16))]
struct Aligned<const N: usize>([u8; N]);

/// Stack of the idle loop, in kernel memory.
static mut IDLE_STACK: Aligned<IDLE_STACK_SIZE> = Aligned([0; IDLE_STACK_SIZE]);

/// Save the callee-saved registers and the caller's continuation into
/// `context`, then return [`Resumption::Suspended`].
///
/// When `context` is later handed to [`resume`], this call returns a second
/// time, with [`Resumption::Resumed`].
///
/// # Safety
/// Like `setjmp`: locals of the calling frame that change between the two
/// returns hold unspecified values after the second one. Keep the calling
/// frame small and branch on the result immediately.
#[unsafe(naked)]
pub unsafe extern "C" fn suspend(context: *mut SavedContext) -> Resumption {
    naked_asm!(
        "mov eax, [esp + 4]",
        "mov edx, [esp]",           // return address
        "mov [eax + {eip}], edx",
        "lea edx, [esp + 4]",       // esp as seen by the caller after `ret`
        "mov [eax + {esp}], edx",
        "mov [eax + {ebp}], ebp",
        "mov [eax + {ebx}], ebx",
        "mov [eax + {esi}], esi",
        "mov [eax + {edi}], edi",
        "mov eax, {suspended}",
        "ret",
        eip = const SavedContext::EIP,
        esp = const SavedContext::ESP,
        ebp = const SavedContext::EBP,
        ebx = const SavedContext::EBX,
        esi = const SavedContext::ESI,
        edi = const SavedContext::EDI,
        suspended = const Resumption::Suspended as u32,
    );
}

/// Continue `context` with `eax` set to [`Resumption::Resumed`].
///
/// # Safety
/// `context` must have been produced by [`suspend`] or by the timer entry
/// stub, and its stack must be mapped in the live address space.
#[unsafe(naked)]
pub unsafe extern "C" fn resume(context: *const SavedContext) -> ! {
    naked_asm!(
        "mov ecx, [esp + 4]",
        "mov ebp, [ecx + {ebp}]",
        "mov ebx, [ecx + {ebx}]",
        "mov esi, [ecx + {esi}]",
        "mov edi, [ecx + {edi}]",
        "mov edx, [ecx + {eip}]",
        "mov esp, [ecx + {esp}]",
        "mov eax, {resumed}",
        "jmp edx",
        eip = const SavedContext::EIP,
        esp = const SavedContext::ESP,
        ebp = const SavedContext::EBP,
        ebx = const SavedContext::EBX,
        esi = const SavedContext::ESI,
        edi = const SavedContext::EDI,
        resumed = const Resumption::Resumed as u32,
    );
}

/// Call a new process's entry point as `entry(argc, argv, envp)` on its own
/// stack, with interrupts enabled. Returning from the entry point ends the
/// process through [`crate::interrupts::process_return`].
///
/// # Safety
/// The process's address space must be live and its argument image written.
#[unsafe(naked)]
pub unsafe extern "C" fn enter(frame: *const EntryFrame) -> ! {
    naked_asm!(
        "mov ecx, [esp + 4]",
        "mov esp, [ecx + {sp}]",
        "sub esp, 4",               // 16-byte alignment at the call boundary
        "push dword ptr [ecx + {envp}]",
        "push dword ptr [ecx + {argv}]",
        "push dword ptr [ecx + {argc}]",
        "push offset {exit}",
        "mov eax, [ecx + {entry}]",
        "xor ebp, ebp",
        "sti",
        "jmp eax",
        sp = const EntryFrame::STACK_POINTER,
        envp = const EntryFrame::ENVP,
        argv = const EntryFrame::ARGV,
        argc = const EntryFrame::ARGC,
        entry = const EntryFrame::ENTRY,
        exit = sym crate::interrupts::process_return,
    );
}

/// Wait for the next tick on the idle stack, abandoning the current one.
///
/// # Safety
/// Nothing on the current stack may be needed anymore.
#[unsafe(naked)]
pub unsafe extern "C" fn idle() -> ! {
    naked_asm!(
        "lea esp, [{stack} + {size}]",
        "xor ebp, ebp",
        "2:",
        "sti",
        "hlt",
        "jmp 2b",
        stack = sym IDLE_STACK,
        size = const IDLE_STACK_SIZE,
    );
}
