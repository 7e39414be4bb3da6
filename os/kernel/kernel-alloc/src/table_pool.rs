//! A stack of free page-table blocks, linked through the blocks themselves.
//!
//! Operations that need page tables are handed a pool that was filled from
//! the heap beforehand, so the paging code never calls back into the heap.

use core::ptr::NonNull;
use kernel_memory_addresses::PhysicalPage;
use kernel_vmem::{RawTable, TableAlloc, TableFrame};

#[repr(C)]
struct Link {
    next: Option<NonNull<RawTable>>,
    next_frame: u32,
}

/// Free 4 KiB table blocks.
pub struct TablePool {
    head: Option<TableFrame<RawTable>>,
    len: usize,
}

// Safety: the pooled blocks are exclusively owned by the pool.
unsafe impl Send for TablePool {}

impl TablePool {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add a block.
    ///
    /// # Safety
    /// `frame` must satisfy the contract of [`TableFrame::new`] and be owned
    /// by nobody else.
    pub unsafe fn push(&mut self, frame: TableFrame<RawTable>) {
        let link = Link {
            next: self.head.map(|h| h.virt()),
            next_frame: self.head.map_or(0, |h| h.phys().frame_number()),
        };
        unsafe { frame.virt().cast::<Link>().write(link) };
        self.head = Some(frame);
        self.len += 1;
    }

    /// Take the most recently added block.
    pub fn pop(&mut self) -> Option<TableFrame<RawTable>> {
        let head = self.head?;
        // SAFETY: pooled blocks start with a link written by `push`.
        let link = unsafe { head.virt().cast::<Link>().read() };
        self.head = link.next.map(|virt| {
            // SAFETY: the link was created from a valid frame in `push`.
            unsafe { TableFrame::new(virt, PhysicalPage::from_frame_number(link.next_frame)) }
        });
        self.len -= 1;
        Some(head)
    }
}

impl Default for TablePool {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl TableAlloc for TablePool {
    fn alloc_table(&mut self) -> Option<TableFrame<RawTable>> {
        self.pop()
    }

    unsafe fn free_table(&mut self, table: TableFrame<RawTable>) {
        unsafe { self.push(table) };
    }
}
