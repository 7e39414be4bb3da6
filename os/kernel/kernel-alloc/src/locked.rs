//! The kernel's global allocator.
//!
//! [`LockedKernelMemory`] starts out as a bump allocator over a static arena
//! and is promoted to the full [`KernelMemory`] once paging and the heap are
//! up. Memory handed out during bootstrap is never returned.

use crate::bump::BumpAllocator;
use crate::kernel_memory::{HeapBacking, KernelMemory};
use core::alloc::{GlobalAlloc, Layout};
use core::ops::Range;
use core::ptr::{NonNull, null_mut};
use kernel_sync::SpinLock;
use kernel_vmem::PhysMapper;

enum KernelState<M: PhysMapper, B: HeapBacking<M>> {
    Bootstrap(BumpAllocator),
    Ready {
        memory: KernelMemory<M, B>,
        /// Arena of the bootstrap allocator; frees into it are ignored.
        early: Range<usize>,
    },
}

/// Kernel memory behind a spin lock, usable as `#[global_allocator]`.
pub struct LockedKernelMemory<M: PhysMapper, B: HeapBacking<M>> {
    state: SpinLock<KernelState<M, B>>,
}

impl<M: PhysMapper, B: HeapBacking<M>> LockedKernelMemory<M, B> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(KernelState::Bootstrap(BumpAllocator::empty())),
        }
    }

    fn locked<R>(&self, f: impl FnOnce(&mut KernelState<M, B>) -> R) -> R {
        #[cfg(target_arch = "x86")]
        let mut guard = self.state.lock_irq();
        #[cfg(not(target_arch = "x86"))]
        let mut guard = self.state.lock();
        f(&mut *guard)
    }

    /// Serve allocations from `[arena, arena + len)` until
    /// [`promote`](Self::promote) is called.
    ///
    /// # Safety
    /// See [`BumpAllocator::new`].
    ///
    /// # Panics
    /// After promotion.
    pub unsafe fn bootstrap(&self, arena: NonNull<u8>, len: usize) {
        self.locked(|state| match state {
            KernelState::Bootstrap(bump) => *bump = unsafe { BumpAllocator::new(arena, len) },
            KernelState::Ready { .. } => panic!("kernel memory is already initialized"),
        });
    }

    /// Allocate from the bootstrap arena. `None` once promoted or when the
    /// arena is used up.
    pub fn bootstrap_allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.locked(|state| match state {
            KernelState::Bootstrap(bump) => bump.allocate(size, align),
            KernelState::Ready { .. } => None,
        })
    }

    /// Switch from the bootstrap arena to `memory`.
    ///
    /// # Panics
    /// If called twice.
    pub fn promote(&self, memory: KernelMemory<M, B>) {
        self.locked(|state| {
            let KernelState::Bootstrap(bump) = state else {
                panic!("kernel memory is already initialized");
            };
            log::info!("bootstrap allocator retired after {} bytes", bump.used());
            let early = bump.range();
            *state = KernelState::Ready { memory, early };
        });
    }

    pub fn is_ready(&self) -> bool {
        self.locked(|state| matches!(state, KernelState::Ready { .. }))
    }

    /// Run `f` on the kernel memory with the lock held.
    ///
    /// # Panics
    /// Before [`promote`](Self::promote).
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut KernelMemory<M, B>) -> R) -> R {
        self.locked(|state| match state {
            KernelState::Ready { memory, .. } => f(memory),
            KernelState::Bootstrap(_) => panic!("kernel memory used before initialization"),
        })
    }
}

impl<M: PhysMapper, B: HeapBacking<M>> Default for LockedKernelMemory<M, B> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<M: PhysMapper, B: HeapBacking<M>> GlobalAlloc for LockedKernelMemory<M, B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.locked(|state| match state {
            KernelState::Bootstrap(bump) => bump
                .allocate(layout.size(), layout.align())
                .map_or(null_mut(), NonNull::as_ptr),
            KernelState::Ready { memory, .. } => memory
                .allocate(layout.size(), layout.align())
                .map_or(null_mut(), NonNull::as_ptr),
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        self.locked(|state| match state {
            KernelState::Bootstrap(_) => {}
            KernelState::Ready { early, .. } if early.contains(&ptr.as_ptr().addr()) => {}
            // SAFETY: GlobalAlloc contract; `ptr` came from `alloc`.
            KernelState::Ready { memory, .. } => unsafe { memory.free(ptr) },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, HostHeap, SimPhys};

    type Locked = LockedKernelMemory<SimPhys, HostHeap>;

    fn arena() -> (NonNull<u8>, usize) {
        let block: &'static mut [u8] = Box::leak(vec![0u8; 4096].into_boxed_slice());
        let len = block.len();
        (NonNull::from(block).cast(), len)
    }

    #[test]
    fn bootstrap_serves_from_the_arena_and_ignores_frees() {
        let locked = Locked::new();
        let (base, len) = arena();
        unsafe { locked.bootstrap(base, len) };

        let layout = Layout::from_size_align(64, 16).unwrap();
        let a = unsafe { locked.alloc(layout) };
        assert!(!a.is_null());
        assert!((base.as_ptr().addr()..base.as_ptr().addr() + len).contains(&a.addr()));
        unsafe { locked.dealloc(a, layout) };
        let b = unsafe { locked.alloc(layout) };
        assert_ne!(a, b);
        assert!(!locked.is_ready());
    }

    #[test]
    fn unbootstrapped_allocation_fails_cleanly() {
        let locked = Locked::new();
        let layout = Layout::from_size_align(8, 8).unwrap();
        assert!(unsafe { locked.alloc(layout) }.is_null());
    }

    #[test]
    fn promotion_switches_to_the_heap() {
        let locked = Locked::new();
        let (base, len) = arena();
        unsafe { locked.bootstrap(base, len) };
        let early = locked.bootstrap_allocate(128, 8).unwrap();

        locked.promote(testing::kernel_memory());
        assert!(locked.is_ready());
        assert!(locked.bootstrap_allocate(8, 8).is_none());

        let layout = Layout::from_size_align(100, 32).unwrap();
        let p = unsafe { locked.alloc(layout) };
        assert!(!p.is_null());
        assert!(p.addr().is_multiple_of(32));
        assert!(locked.with_memory(|m| m.heap().contains(NonNull::new(p).unwrap())));

        // Early blocks are silently kept.
        unsafe { locked.dealloc(early.as_ptr(), Layout::from_size_align(128, 8).unwrap()) };
        unsafe { locked.dealloc(p, layout) };
        let q = unsafe { locked.alloc(layout) };
        assert_eq!(p, q);
    }

    #[test]
    #[should_panic(expected = "kernel memory used before initialization")]
    fn memory_access_before_promotion_panics() {
        let locked = Locked::new();
        locked.with_memory(|m| m.heap().end());
    }
}
