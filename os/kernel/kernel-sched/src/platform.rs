//! What the scheduler needs from the machine and the memory manager.

use kernel_alloc::{HeapBacking, KernelMemory, LockedKernelMemory};
use kernel_vmem::{PagingHardware, PhysMapper};

/// The processor, as far as scheduling is concerned.
pub trait Cpu: PagingHardware {
    /// Signal end of interrupt for the timer.
    fn acknowledge_timer(&mut self);

    /// Run `f` with maskable interrupts disabled, restoring the previous
    /// state afterwards.
    fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R;
}

/// Access to the kernel memory, either owned or behind the global lock.
///
/// The closure must not allocate through the global allocator: the lock is
/// held while it runs.
pub trait MemoryContext {
    type Mapper: PhysMapper;
    type Backing: HeapBacking<Self::Mapper>;

    fn with_memory<R>(&mut self, f: impl FnOnce(&mut KernelMemory<Self::Mapper, Self::Backing>) -> R) -> R;
}

impl<M: PhysMapper, B: HeapBacking<M>> MemoryContext for KernelMemory<M, B> {
    type Mapper = M;
    type Backing = B;

    fn with_memory<R>(&mut self, f: impl FnOnce(&mut KernelMemory<M, B>) -> R) -> R {
        f(self)
    }
}

impl<M: PhysMapper, B: HeapBacking<M>> MemoryContext for &'static LockedKernelMemory<M, B> {
    type Mapper = M;
    type Backing = B;

    fn with_memory<R>(&mut self, f: impl FnOnce(&mut KernelMemory<M, B>) -> R) -> R {
        LockedKernelMemory::with_memory(self, f)
    }
}
