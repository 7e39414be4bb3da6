//! # Bootstrap Allocator
//!
//! Before the heap exists the kernel still needs a little memory: region
//! bitmaps, the first page tables, the heap bookkeeping itself. A
//! [`BumpAllocator`] hands out consecutive pieces of a fixed arena and never
//! takes anything back.

use core::ops::Range;
use core::ptr::NonNull;
use kernel_memory_addresses::align_up;

/// Upward-bumping allocator over a fixed arena.
pub struct BumpAllocator {
    arena: Option<NonNull<u8>>,
    len: usize,
    next: usize,
}

// Safety: the arena is exclusively owned by the allocator.
unsafe impl Send for BumpAllocator {}

impl BumpAllocator {
    /// An allocator without an arena; every request fails.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            arena: None,
            len: 0,
            next: 0,
        }
    }

    /// Hand out memory from `[arena, arena + len)`.
    ///
    /// # Safety
    /// The arena must be valid and writable for the rest of the kernel's
    /// lifetime and not be used by anything else.
    #[must_use]
    pub const unsafe fn new(arena: NonNull<u8>, len: usize) -> Self {
        Self {
            arena: Some(arena),
            len,
            next: 0,
        }
    }

    /// `size` bytes aligned to `align`, or `None` once the arena is used up.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let arena = self.arena?;
        let base = arena.as_ptr().addr();
        let start = align_up(base.checked_add(self.next)?, align) - base;
        let end = start.checked_add(size.max(1))?;
        if end > self.len {
            return None;
        }
        self.next = end;
        // SAFETY: `start` lies inside the arena.
        Some(unsafe { arena.add(start) })
    }

    /// Whether `ptr` was (or could have been) handed out by this allocator.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.range().contains(&ptr.as_ptr().addr())
    }

    /// Address range of the arena.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.arena.map_or(0..0, |a| {
            let base = a.as_ptr().addr();
            base..base + self.len
        })
    }

    /// Bytes handed out so far, including alignment padding.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(4096))]
    struct Arena([u8; 8192]);

    #[test]
    fn allocations_are_consecutive_and_aligned() {
        let arena = Box::leak(Box::new(Arena([0; 8192])));
        let base = NonNull::from(&mut arena.0).cast::<u8>();
        let mut bump = unsafe { BumpAllocator::new(base, 8192) };

        let a = bump.allocate(3, 1).unwrap();
        let b = bump.allocate(8, 8).unwrap();
        let c = bump.allocate(4096, 4096).unwrap();
        assert_eq!(a, base);
        assert_eq!(b.as_ptr().addr() - base.as_ptr().addr(), 8);
        assert_eq!(c.as_ptr().addr() - base.as_ptr().addr(), 4096);
        assert!(bump.contains(b));
        assert_eq!(bump.used(), 8192);
        assert!(bump.allocate(1, 1).is_none());
    }

    #[test]
    fn empty_allocator_refuses_everything() {
        let mut bump = BumpAllocator::empty();
        assert!(bump.allocate(1, 1).is_none());
        assert_eq!(bump.range(), 0..0);
    }
}
