//! # Kernel Memory Allocation and Address Spaces
//!
//! This crate owns every byte of memory the kernel hands out: physical
//! frames, the kernel heap, and the page tables of each address space.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          LockedKernelMemory (global allocator)      │
//! │    • bump arena during early boot                   │
//! │    • spin lock, interrupts off on i386              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                  KernelMemory                       │
//! │    • kernel heap (first fit, split and merge)       │
//! │    • page-table pools carved from the heap          │
//! │    • reserve refill after every operation           │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │             Virtual Memory Manager                  │
//! │    • kernel directory and the live directory        │
//! │    • clone, free and switch address spaces          │
//! │    • two-slot copy window for foreign frames        │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Bitmap                     │
//! │    • one bitmap per 4 MiB region, on demand         │
//! │    • reserve bitmaps so marking never allocates     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Physical Frame Bitmap ([`frame_alloc`])
//!
//! Tracks every 4 KiB frame below 4 GiB. Region bitmaps exist only for
//! regions that hold used frames; installing one never calls into the heap,
//! it comes from a reserve the owner stocks before each operation.
//!
//! ### Kernel Heap ([`heap`])
//!
//! A doubly linked list of blocks in address order, each headed by a magic
//! number. Allocation is first fit with alignment, freeing merges with both
//! neighbours, and the heap grows at its end through a [`HeapGrowth`].
//!
//! ### Virtual Memory Manager ([`vmm`])
//!
//! Holds the kernel directory, knows which directory is live, and copies
//! memory between address spaces through a fixed window. Kernel mappings
//! reach every address space: immediately for the live directory, at the
//! next switch for the others.
//!
//! ### Kernel Memory ([`kernel_memory`]) and the Global Allocator ([`locked`])
//!
//! Ties the pieces together and breaks their cycle: page tables come from
//! the heap, the heap grows through the memory manager. No paging code ever
//! calls the heap; it draws from pools filled beforehand.
//!
//! ## Memory Layout Integration
//!
//! ```text
//! 0x0000_0000 ┌──────────────────────────────┐
//!             │  User space (private pages)  │
//! 0xC000_0000 ├──────────────────────────────┤ KERNEL_BASE
//!             │  Kernel image                │
//! 0xD000_0000 ├──────────────────────────────┤ KERNEL_HEAP_START
//!             │  Kernel heap                 │
//! 0xE000_0000 ├──────────────────────────────┤ KERNEL_HEAP_END
//!             │  ...                         │
//! 0xFFBF_E000 ├──────────────────────────────┤ COPY_WINDOW
//!             │  Two copy slots              │
//! 0xFFFF_FFFF └──────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

pub mod bump;
pub mod frame_alloc;
pub mod heap;
pub mod kernel_memory;
pub mod locked;
pub mod table_pool;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod vmm;

pub use bump::BumpAllocator;
pub use frame_alloc::{FrameBitmap, RegionBitmap};
pub use heap::{BlockInfo, Heap, HeapError, HeapGrowth};
pub use kernel_memory::{HeapBacking, KernelMemory, PagedHeap};
pub use locked::LockedKernelMemory;
pub use table_pool::TablePool;
pub use vmm::Vmm;
