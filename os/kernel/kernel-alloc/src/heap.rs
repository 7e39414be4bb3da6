//! # Kernel Heap
//!
//! A first-fit allocator over one contiguous, growable virtual range. Every
//! block, free or allocated, starts with a [`BlockHeader`] and the headers
//! form a doubly linked list in address order:
//!
//! ```text
//! start                                                            end
//! ┌────────┬─────────┬────────┬──────────────┬────────┬────────────┐
//! │ header │ payload │ header │ payload      │ header │ payload    │
//! │ used   │         │ free   │              │ used   │            │
//! └────────┴─────────┴────────┴──────────────┴────────┴────────────┘
//! ```
//!
//! An allocation's header always sits immediately before the pointer handed
//! out, so `free` finds it by subtracting [`HEADER`]. Aligned requests that
//! leave a gap in front of the payload turn that gap into its own free block;
//! gaps too small to hold a header are skipped by moving to the next aligned
//! address.
//!
//! No two address-adjacent blocks are ever both free after `free` returns.

use crate::kernel_memory::HeapBacking;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use kernel_info::memory::{HEAP_GROWTH_INCREMENT, HEAP_MAGIC};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_up};
use kernel_vmem::MapError;

#[repr(C)]
struct BlockHeader {
    magic: u32,
    length: usize,
    free: bool,
    next: Option<NonNull<BlockHeader>>,
    prev: Option<NonNull<BlockHeader>>,
}

/// Bytes taken by a block header.
pub const HEADER: usize = size_of::<BlockHeader>();

/// Every payload address and length is a multiple of this.
pub const MIN_ALIGN: usize = align_of::<BlockHeader>();

const _: () = assert!(HEADER.is_multiple_of(MIN_ALIGN));

/// Why the heap could not serve a request.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted while allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("heap address {0:#x} has no physical translation")]
    Untranslatable(usize),
    #[error("failed to map heap memory: {0}")]
    Map(#[from] MapError),
}

/// Where the heap gets more memory from.
///
/// [`HeapBacking`] is the long-lived version of this; the kernel builds a
/// short-lived `HeapGrowth` around it for each heap call.
pub trait HeapGrowth {
    /// Make memory starting at `at` usable, at least `min_bytes` of it.
    /// Returns the number of bytes actually added.
    ///
    /// # Errors
    /// When the heap cannot grow any further.
    fn grow(&mut self, at: usize, min_bytes: usize) -> Result<usize, HeapError>;

    /// Physical address behind the heap address `va`.
    fn translate(&self, va: usize) -> Option<PhysicalAddress>;
}

/// One block as seen by [`Heap::blocks`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockInfo {
    /// Address of the payload.
    pub address: usize,
    /// Payload length in bytes.
    pub length: usize,
    pub free: bool,
}

/// The block list.
pub struct Heap {
    base: Option<NonNull<u8>>,
    size: usize,
    head: Option<NonNull<BlockHeader>>,
    tail: Option<NonNull<BlockHeader>>,
}

// Safety: the heap memory is exclusively owned and only reached through `&mut self`.
unsafe impl Send for Heap {}

#[inline]
fn addr<T>(ptr: NonNull<T>) -> usize {
    ptr.as_ptr().addr()
}

#[inline]
fn end_of(block: NonNull<BlockHeader>) -> usize {
    // SAFETY: callers only pass live headers.
    addr(block) + HEADER + unsafe { block.as_ref() }.length
}

impl Heap {
    /// A heap that owns nothing yet.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            base: None,
            size: 0,
            head: None,
            tail: None,
        }
    }

    /// Manage `[base, base + len)` as one free block.
    ///
    /// # Safety
    /// The range must be valid, writable and exclusively owned by the heap,
    /// and stay so for the heap's lifetime. Growth continues at its end.
    ///
    /// # Panics
    /// If `base` is not aligned to [`MIN_ALIGN`] or `len` cannot hold a header.
    #[must_use]
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        assert!(addr(base).is_multiple_of(MIN_ALIGN), "heap base {base:p} is misaligned");
        let len = len - len % MIN_ALIGN;
        assert!(len > HEADER, "heap of {len} bytes cannot hold a block");
        let block = base.cast::<BlockHeader>();
        unsafe {
            block.write(BlockHeader {
                magic: HEAP_MAGIC,
                length: len - HEADER,
                free: true,
                next: None,
                prev: None,
            });
        }
        Self {
            base: Some(base),
            size: len,
            head: Some(block),
            tail: Some(block),
        }
    }

    /// First address of the heap.
    #[must_use]
    pub fn start(&self) -> usize {
        self.base.map_or(0, addr)
    }

    /// Exclusive end of the memory currently owned by the heap.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    /// Whether `ptr` points into the heap.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        (self.start()..self.end()).contains(&addr(ptr))
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// Grows the heap through `growth` when no free block fits and retries.
    ///
    /// # Errors
    /// [`HeapError`] if growing fails.
    pub fn allocate(
        &mut self,
        size: usize,
        align: usize,
        growth: &mut impl HeapGrowth,
    ) -> Result<NonNull<u8>, HeapError> {
        debug_assert!(align.is_power_of_two());
        let size = align_up(size.max(1), MIN_ALIGN);
        let align = align.max(MIN_ALIGN);

        loop {
            if let Some(ptr) = self.first_fit(size, align) {
                return Ok(ptr);
            }
            // Enough for the payload, a front gap and a split tail.
            let needed = size
                .checked_add(2 * (align + HEADER))
                .ok_or(HeapError::OutOfMemory { requested: size })?;
            self.expand(needed, growth)?;
        }
    }

    /// Allocate like [`allocate`](Self::allocate) and also report the
    /// physical address of the first byte.
    ///
    /// # Errors
    /// [`HeapError`] if growing fails, or the memory is not backed by a
    /// known frame; the block is released again in the latter case.
    pub fn allocate_physical(
        &mut self,
        size: usize,
        align: usize,
        growth: &mut impl HeapGrowth,
    ) -> Result<(NonNull<u8>, PhysicalAddress), HeapError> {
        let ptr = self.allocate(size, align, growth)?;
        if let Some(phys) = growth.translate(addr(ptr)) {
            return Ok((ptr, phys));
        }
        // SAFETY: just allocated above.
        unsafe { self.free(ptr) };
        Err(HeapError::Untranslatable(addr(ptr)))
    }

    fn first_fit(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut cursor = self.head;
        while let Some(block) = cursor {
            // SAFETY: list nodes are live headers.
            let header = unsafe { block.as_ref() };
            if header.free
                && header.length >= size
                && let Some(ptr) = self.carve(block, size, align)
            {
                return Some(ptr);
            }
            cursor = header.next;
        }
        None
    }

    /// Place an allocation inside the free `block`, splitting off a free
    /// front gap and a free tail where there is room for them.
    fn carve(&mut self, mut block: NonNull<BlockHeader>, size: usize, align: usize) -> Option<NonNull<u8>> {
        let start = addr(block);
        let block_end = end_of(block);

        let mut payload = align_up(start + HEADER, align);
        let mut gap = payload - HEADER - start;
        while gap != 0 && gap <= HEADER {
            payload = payload.checked_add(align)?;
            gap = payload - HEADER - start;
        }
        if payload.checked_add(size)? > block_end {
            return None;
        }

        let mut alloc = block;
        if gap > 0 {
            // SAFETY: `gap` lies within the free block.
            let new = unsafe { block.byte_add(gap) };
            unsafe {
                new.write(BlockHeader {
                    magic: HEAP_MAGIC,
                    length: block_end - payload,
                    free: true,
                    next: block.as_ref().next,
                    prev: Some(block),
                });
            }
            self.link_after(block, new);
            // SAFETY: the front piece keeps its header at `block`.
            unsafe { block.as_mut() }.length = gap - HEADER;
            alloc = new;
        }

        // SAFETY: `alloc` is a live header.
        let header = unsafe { alloc.as_mut() };
        let rest = header.length - size;
        if rest > HEADER {
            let tail = unsafe { alloc.byte_add(HEADER + size) };
            unsafe {
                tail.write(BlockHeader {
                    magic: HEAP_MAGIC,
                    length: rest - HEADER,
                    free: true,
                    next: header.next,
                    prev: Some(alloc),
                });
            }
            header.length = size;
            self.link_after(alloc, tail);
        }

        // SAFETY: as above.
        unsafe { alloc.as_mut() }.free = false;
        // SAFETY: the payload follows the header inside the block.
        Some(unsafe { alloc.byte_add(HEADER) }.cast())
    }

    /// Hook `new`, whose own `next`/`prev` are already set, in after `block`.
    fn link_after(&mut self, mut block: NonNull<BlockHeader>, new: NonNull<BlockHeader>) {
        // SAFETY: both are live headers.
        unsafe {
            match block.as_ref().next {
                Some(mut next) => next.as_mut().prev = Some(new),
                None => self.tail = Some(new),
            }
            block.as_mut().next = Some(new);
        }
    }

    /// Grow the heap by at least `min_bytes`.
    fn expand(&mut self, min_bytes: usize, growth: &mut impl HeapGrowth) -> Result<(), HeapError> {
        let Some(base) = self.base else {
            return Err(HeapError::OutOfMemory { requested: min_bytes });
        };
        let wanted = align_up(min_bytes.max(HEAP_GROWTH_INCREMENT as usize), PAGE_SIZE);
        let old_end = self.end();
        let added = growth.grow(old_end, wanted)?;
        let added = added - added % MIN_ALIGN;
        if added <= HEADER {
            return Err(HeapError::OutOfMemory { requested: min_bytes });
        }
        self.size += added;
        log::debug!("heap grown by {added:#x} bytes to {:#x}", self.end());

        match self.tail {
            Some(mut tail) if unsafe { tail.as_ref() }.free && end_of(tail) == old_end => {
                // SAFETY: live header.
                unsafe { tail.as_mut() }.length += added;
            }
            previous => {
                // SAFETY: the new memory starts at `old_end`, inside the heap range.
                let block = unsafe { base.byte_add(old_end - addr(base)) }.cast::<BlockHeader>();
                unsafe {
                    block.write(BlockHeader {
                        magic: HEAP_MAGIC,
                        length: added - HEADER,
                        free: true,
                        next: None,
                        prev: previous,
                    });
                }
                match previous {
                    // SAFETY: live header.
                    Some(mut tail) => unsafe { tail.as_mut() }.next = Some(block),
                    None => self.head = Some(block),
                }
                self.tail = Some(block);
            }
        }
        Ok(())
    }

    /// Release an allocation.
    ///
    /// # Safety
    /// `ptr` must have been returned by this heap and not be used afterwards.
    ///
    /// # Panics
    /// If `ptr` is outside the heap or not a possible payload address, if
    /// its header carries a bad magic number, or if the block is already
    /// free.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let at = addr(ptr);
        assert!(
            at >= self.start() + HEADER && at < self.end(),
            "free of {at:#x} outside the heap"
        );
        assert!(at.is_multiple_of(MIN_ALIGN), "free of misaligned {at:#x}");
        let mut block = unsafe { ptr.byte_sub(HEADER) }.cast::<BlockHeader>();
        // SAFETY: inside the heap; the magic check rejects anything that is not a header.
        let header = unsafe { block.as_mut() };
        assert!(
            header.magic == HEAP_MAGIC,
            "heap corruption: bad magic {:#010x} in front of {at:#x}",
            header.magic
        );
        assert!(!header.free, "double free of {at:#x}");
        header.free = true;

        if let Some(next) = header.next
            && unsafe { next.as_ref() }.free
            && end_of(block) == addr(next)
        {
            self.absorb(block, next);
        }
        if let Some(prev) = unsafe { block.as_ref() }.prev
            && unsafe { prev.as_ref() }.free
            && end_of(prev) == addr(block)
        {
            self.absorb(prev, block);
        }
    }

    /// Merge `next` into the free block `block` directly in front of it.
    fn absorb(&mut self, mut block: NonNull<BlockHeader>, mut next: NonNull<BlockHeader>) {
        // SAFETY: both are live, distinct headers.
        unsafe {
            let gone = next.as_mut();
            let keep = block.as_mut();
            keep.length += HEADER + gone.length;
            keep.next = gone.next;
            match gone.next {
                Some(mut after) => after.as_mut().prev = Some(block),
                None => self.tail = Some(block),
            }
            gone.magic = 0;
        }
    }

    /// Payload length of the live allocation at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this heap.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { ptr.byte_sub(HEADER).cast::<BlockHeader>().as_ref() }.length
    }

    /// Every block in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let block = cursor?;
            // SAFETY: list nodes are live headers.
            let header = unsafe { block.as_ref() };
            cursor = header.next;
            Some(BlockInfo {
                address: addr(block) + HEADER,
                length: header.length,
                free: header.free,
            })
        })
    }

    /// Total payload bytes in free blocks.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.blocks().filter(|b| b.free).map(|b| b.length).sum()
    }

    /// Log every block.
    pub fn dump(&self) {
        log::debug!("heap {:#x}..{:#x}:", self.start(), self.end());
        for block in self.blocks() {
            log::debug!(
                "  {:#010x} {:8} bytes {}",
                block.address,
                block.length,
                if block.free { "free" } else { "used" }
            );
        }
    }
}

/// Adapts a [`HeapBacking`] and the memory manager it needs into a
/// [`HeapGrowth`] for one heap call.
pub(crate) struct Growth<'a, M: kernel_vmem::PhysMapper, B: HeapBacking<M>> {
    pub(crate) backing: &'a mut B,
    pub(crate) vmm: &'a mut crate::vmm::Vmm<M>,
}

impl<M: kernel_vmem::PhysMapper, B: HeapBacking<M>> HeapGrowth for Growth<'_, M, B> {
    fn grow(&mut self, at: usize, min_bytes: usize) -> Result<usize, HeapError> {
        self.backing.grow(self.vmm, at, min_bytes)
    }

    fn translate(&self, va: usize) -> Option<PhysicalAddress> {
        self.backing.translate(self.vmm, va)
    }
}
