//! # Page Directory Table
//!
//! The top paging level: 1024 entries, each pointing to one [`PageTable`]
//! that covers 4 MiB of virtual address space. Large (4 MiB) pages are not
//! used, so `PS` is always clear.
//!
//! [`PageTable`]: crate::PageTable

use crate::{MapFlags, PageEntryBits};
use kernel_memory_addresses::{DirectoryIndex, PhysicalPage, Size4K};

/// A single page-directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The hardware page directory: 1024 entries, 4 KiB-aligned. Its physical
/// address is what gets loaded into CR3.
#[repr(C, align(4096))]
pub struct DirectoryTable {
    entries: [PdEntry; 1024],
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    /// Present entry pointing at the page table in `table`.
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalPage<Size4K>, flags: MapFlags) -> Self {
        Self(
            PageEntryBits::new()
                .with_present(true)
                .with_writable(flags.writable)
                .with_user_access(!flags.supervisor_only)
                .with_physical_address(table.base()),
        )
    }

    /// Widen the permissions so that a mapping with `flags` is reachable.
    ///
    /// Effective rights are the intersection of PDE and PTE, so a table that
    /// holds both supervisor and user pages needs a permissive PDE.
    #[inline]
    #[must_use]
    pub const fn permit(self, flags: MapFlags) -> Self {
        Self(
            self.0
                .with_writable(self.0.writable() || flags.writable)
                .with_user_access(self.0.user_access() || !flags.supervisor_only),
        )
    }

    /// Same flags, pointing at another table.
    #[inline]
    #[must_use]
    pub const fn with_table_frame(self, table: PhysicalPage<Size4K>) -> Self {
        Self(self.0.with_physical_address(table.base()))
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, the frame holding the page table.
    #[inline]
    #[must_use]
    pub const fn table_frame(self) -> Option<PhysicalPage<Size4K>> {
        if self.is_present() {
            Some(self.0.frame())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

impl DirectoryTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); 1024],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }
}
