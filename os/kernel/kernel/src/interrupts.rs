//! # Timer Interrupt and Process Exit
//!
//! ```text
//!  IRQ 0 ──► timer_interrupt: pushad, move to INTERRUPT_STACK
//!                 │
//!                 ▼
//!            timer_entry ──► Scheduler::timer_tick ──► Enter  ──► switch::enter
//!                                                  ├─► Jump   ──► switch::resume (forked child)
//!                                                  ├─► Resume ──► switch::resume ──► interrupt_return: popad, iretd
//!                                                  └─► Idle   ──► switch::idle
//! ```
//!
//! A preempted process is saved as a context whose instruction pointer is
//! [`interrupt_return`] and whose stack pointer addresses the registers the
//! stub pushed, so resuming it unwinds the interrupt exactly once.

use crate::boot::with_scheduler;
use crate::switch;
use core::arch::naked_asm;
use kernel_sched::{Dispatch, Pid, Resumption, SavedContext};

/// Stack for the timer path and for process teardown. Kernel memory, so it
/// stays mapped while the scheduler switches address spaces.
const INTERRUPT_STACK_SIZE: usize = 16 * 1024;

#[repr(align(16))]
struct Aligned<const N: usize>([u8; N]);

static mut INTERRUPT_STACK: Aligned<INTERRUPT_STACK_SIZE> = Aligned([0; INTERRUPT_STACK_SIZE]);

/// IRQ 0 handler; install it as an interrupt gate for the timer vector.
#[unsafe(naked)]
pub extern "C" fn timer_interrupt() {
    naked_asm!(
        "pushad",
        "cld",
        "mov eax, esp",
        "lea esp, [{stack} + {size}]",
        "push eax",
        "call {entry}",
        "ud2",
        stack = sym INTERRUPT_STACK,
        size = const INTERRUPT_STACK_SIZE,
        entry = sym timer_entry,
    );
}

/// Unwind what [`timer_interrupt`] pushed and return to the interrupted code.
#[unsafe(naked)]
unsafe extern "C" fn interrupt_return() -> ! {
    naked_asm!("popad", "iretd");
}

/// Address of a code label as the 32-bit value stored in a context.
#[allow(clippy::cast_possible_truncation)]
fn code_address(f: unsafe extern "C" fn() -> !) -> u32 {
    f as usize as u32
}

extern "C" fn timer_entry(saved_registers: u32) -> ! {
    let interrupted = SavedContext {
        eip: code_address(interrupt_return),
        esp: saved_registers,
        ..SavedContext::default()
    };

    // The guard must be gone before control leaves this frame for good.
    let dispatch = with_scheduler(|scheduler, cpu| scheduler.timer_tick(cpu, interrupted));

    // SAFETY: timer_tick made the target address space live; this frame is
    // on the interrupt stack, which every address space maps.
    unsafe {
        match dispatch {
            Dispatch::Enter(frame) => switch::enter(&raw const frame),
            Dispatch::Jump(context) | Dispatch::Resume(context) => switch::resume(&raw const context),
            Dispatch::Idle => switch::idle(),
        }
    }
}

/// Where a process's entry point returns to; the return value in `eax`
/// becomes the exit code.
#[unsafe(naked)]
pub unsafe extern "C" fn process_return() -> ! {
    naked_asm!(
        "cli",
        "lea esp, [{stack} + {size}]",
        "push eax",
        "call {exit}",
        "ud2",
        stack = sym INTERRUPT_STACK,
        size = const INTERRUPT_STACK_SIZE,
        exit = sym process_exit,
    );
}

/// End the calling process with `code`.
///
/// # Safety
/// Must be called by a process, not by the bootstrap process or an
/// interrupt handler.
#[unsafe(naked)]
pub unsafe extern "C" fn exit(code: i32) -> ! {
    naked_asm!(
        "mov eax, [esp + 4]",
        "jmp {process_return}",
        process_return = sym process_return,
    );
}

extern "C" fn process_exit(code: i32) -> ! {
    with_scheduler(|scheduler, cpu| scheduler.exit_current(cpu, code));
    // SAFETY: the process and its stack are gone; the next tick picks a
    // successor.
    unsafe { switch::idle() }
}

/// Duplicate the calling process.
///
/// Returns the child's pid in the parent and `None` in the child.
///
/// # Panics
/// When called from the bootstrap process.
#[inline(never)]
pub fn fork() -> Option<Pid> {
    let mut context = SavedContext::default();
    // SAFETY: nothing in this frame changes before the result is examined.
    if unsafe { switch::suspend(&raw mut context) } == Resumption::Resumed {
        // The child was dispatched from the timer path with interrupts masked.
        kernel_sync::irq::sti_enable_interrupts();
        return None;
    }
    Some(with_scheduler(|scheduler, cpu| scheduler.fork(cpu, context)))
}
