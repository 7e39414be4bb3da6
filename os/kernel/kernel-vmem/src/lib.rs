//! # Virtual Memory Support
//!
//! Two-level, non-PAE i386 paging for the kernel.
//!
//! ## What you get
//! - [`PageEntryBits`]: the raw 32-bit entry layout, including the ownership
//!   tag kept in an OS-available bit.
//! - [`PageTable`] / [`DirectoryTable`]: the hardware structures.
//! - [`PageDirectory`]: one address space. It pairs the hardware directory
//!   with a shadow array of the virtual addresses of its page tables (the
//!   kernel cannot follow physical pointers) and per-table "is full" flags.
//! - The seams the address-space code needs from the rest of the kernel:
//!   [`FrameAlloc`] for physical frames, [`TableAlloc`] for the memory that
//!   holds paging structures, [`PhysMapper`] for temporarily aliasing
//!   physical frames, and [`PagingHardware`] for CR3.
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22     | 21‒12  | 11‒0   |
//! | Directory | Table  | Offset |
//! ```
//!
//! The directory entry selects a page table; the table entry selects a 4 KiB
//! frame; the offset selects the byte.
//!
//! ## Frame ownership
//!
//! Every leaf mapping is tagged when it is created:
//!
//! | Tag | Created by | Clone | Teardown |
//! |-----|------------|-------|----------|
//! | [`FrameOwnership::SharedWithKernel`] | kernel mappings | entry copied by value | frame kept |
//! | [`FrameOwnership::OwnedPrivate`] | process mappings | frame copied eagerly | frame released |

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod page_directory;
mod page_entry_bits;
mod page_table;

pub use crate::page_directory::{PageDirectory, Released};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{
    DirectoryTable, PageTable, PagingStructure, PdEntry, PtEntry, RawTable,
};

use core::marker::PhantomData;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Who owns the frame behind a leaf mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameOwnership {
    /// The frame belongs to this address space alone.
    OwnedPrivate,
    /// The frame belongs to the kernel and appears in every address space.
    SharedWithKernel,
}

/// How a page gets mapped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MapFlags {
    /// Install a new page table if the directory slot is empty.
    pub create_table: bool,
    /// Deny ring-3 access.
    pub supervisor_only: bool,
    pub writable: bool,
    pub ownership: FrameOwnership,
}

impl MapFlags {
    /// Writable kernel memory shared with every address space.
    pub const KERNEL: Self = Self {
        create_table: true,
        supervisor_only: true,
        writable: true,
        ownership: FrameOwnership::SharedWithKernel,
    };

    /// Writable memory private to one process.
    pub const PRIVATE: Self = Self {
        create_table: true,
        supervisor_only: false,
        writable: true,
        ownership: FrameOwnership::OwnedPrivate,
    };

    #[must_use]
    pub const fn read_only(self) -> Self {
        Self {
            writable: false,
            ..self
        }
    }

    #[must_use]
    pub const fn without_table_creation(self) -> Self {
        Self {
            create_table: false,
            ..self
        }
    }
}

/// Recoverable mapping failures. Double mappings are not among them: they
/// indicate a kernel bug and panic.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no page table covers {0} and table creation was not requested")]
    MissingTable(VirtualAddress),
    #[error("{0} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
}

/// Source of physical 4 KiB frames.
///
/// Every frame referenced by a present page-table entry must be marked used;
/// the address-space code calls [`mark_used`](Self::mark_used) for frames it
/// maps and [`free_frame`](Self::free_frame) for private frames it drops.
pub trait FrameAlloc {
    /// Hand out a free frame and mark it used.
    ///
    /// # Panics
    /// Implementations panic when physical memory is exhausted; there is no
    /// recovery path.
    fn alloc_frame(&mut self) -> PhysicalPage<Size4K>;

    /// Record that `frame` is referenced by a mapping.
    fn mark_used(&mut self, frame: PhysicalPage<Size4K>);

    /// Return `frame` to the pool.
    fn free_frame(&mut self, frame: PhysicalPage<Size4K>);
}

/// A paging structure reachable both through the kernel's virtual address
/// space (`virt`) and by the MMU (`phys`).
pub struct TableFrame<T> {
    virt: NonNull<T>,
    phys: PhysicalPage<Size4K>,
    _owns: PhantomData<T>,
}

impl<T> Clone for TableFrame<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TableFrame<T> {}

impl<T> core::fmt::Debug for TableFrame<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TableFrame")
            .field("virt", &self.virt)
            .field("phys", &self.phys)
            .finish()
    }
}

impl<T: PagingStructure> TableFrame<T> {
    /// # Safety
    /// `virt` must point to a 4 KiB block, valid for reads and writes for as
    /// long as the frame is in use, whose physical address is `phys`.
    #[inline]
    #[must_use]
    pub const unsafe fn new(virt: NonNull<T>, phys: PhysicalPage<Size4K>) -> Self {
        Self {
            virt,
            phys,
            _owns: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn virt(&self) -> NonNull<T> {
        self.virt
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalPage<Size4K> {
        self.phys
    }

    /// Reinterpret the same frame as another paging structure.
    #[inline]
    #[must_use]
    pub const fn cast<U: PagingStructure>(self) -> TableFrame<U> {
        TableFrame {
            virt: self.virt.cast(),
            phys: self.phys,
            _owns: PhantomData,
        }
    }

    /// Fill the frame with zeros.
    ///
    /// # Safety
    /// No references into the frame may be alive.
    #[inline]
    pub unsafe fn zero(&self) {
        unsafe { self.virt.cast::<u8>().write_bytes(0, 4096) }
    }
}

/// Storage for paging structures.
///
/// The kernel carves tables out of its heap; the allocator must therefore
/// never need a *new* page table itself while serving this call.
///
/// # Safety
/// Every block returned by [`alloc_table`](Self::alloc_table) must satisfy
/// the contract of [`TableFrame::new`] and must not be handed out again
/// before it was freed.
pub unsafe trait TableAlloc {
    /// A page-aligned 4 KiB block and its physical address, or `None` when
    /// exhausted. Contents are unspecified; callers zero it.
    fn alloc_table(&mut self) -> Option<TableFrame<RawTable>>;

    /// Give a block back.
    ///
    /// # Safety
    /// The block came from this allocator and nothing references it anymore.
    unsafe fn free_table(&mut self, table: TableFrame<RawTable>);
}

/// One of the two fixed virtual pages used to alias arbitrary frames.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WindowSlot {
    First,
    Second,
}

impl WindowSlot {
    /// Virtual address of the slot.
    #[must_use]
    pub const fn address(self) -> VirtualAddress {
        match self {
            Self::First => VirtualAddress::new(info::COPY_WINDOW),
            Self::Second => VirtualAddress::new(info::COPY_WINDOW + info::PAGE_SIZE),
        }
    }
}

/// Temporary access to physical frames that are not otherwise mapped into
/// the kernel's view, for example the frames of an inactive address space.
pub trait PhysMapper {
    /// Alias `frame` at `slot` and return a pointer to its first byte.
    ///
    /// `window` is the page table of the *active* directory that covers the
    /// copy window, if the directory has one.
    ///
    /// # Safety
    /// The slot must be unmapped, and must be released with
    /// [`unmap_window`](Self::unmap_window) before it is mapped again.
    /// `window`, if given, must be the live table covering the copy window.
    unsafe fn map_window(
        &mut self,
        slot: WindowSlot,
        frame: PhysicalPage<Size4K>,
        window: Option<NonNull<PageTable>>,
    ) -> NonNull<u8>;

    /// Remove the alias at `slot`.
    ///
    /// # Safety
    /// No pointer obtained from the matching `map_window` may be used afterwards.
    unsafe fn unmap_window(&mut self, slot: WindowSlot, window: Option<NonNull<PageTable>>);
}

/// The CPU's page-directory base register.
pub trait PagingHardware {
    /// Make `directory` the live address space.
    ///
    /// # Safety
    /// `directory` must be a complete page directory that maps the currently
    /// executing code and stack.
    unsafe fn load_directory(&mut self, directory: PhysicalAddress);

    /// Drop any cached translation of `va`.
    fn invalidate_page(&mut self, va: VirtualAddress);
}
