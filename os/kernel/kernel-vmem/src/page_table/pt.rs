//! # Page Table
//!
//! The second paging level: 1024 entries, each mapping one 4 KiB page.
//!
//! - [`PtEntry`]: a page-table entry (PTE), always a 4 KiB leaf.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 PTEs.
//!
//! After modifying active mappings, the caller must perform any required TLB maintenance.

use crate::{FrameOwnership, MapFlags, PageEntryBits};
use kernel_memory_addresses::{PhysicalPage, Size4K, TableIndex};

/// A single Page Table entry (PTE).
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

/// The Page Table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; 1024],
}

impl PtEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    /// Present leaf entry for `frame` carrying the permission and ownership bits of `flags`.
    #[inline]
    #[must_use]
    pub const fn map(frame: PhysicalPage<Size4K>, flags: MapFlags) -> Self {
        Self(
            PageEntryBits::new()
                .with_present(true)
                .with_writable(flags.writable)
                .with_user_access(!flags.supervisor_only)
                .with_ownership(flags.ownership)
                .with_physical_address(frame.base()),
        )
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    /// Expose the underlying bitfield.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, the mapped frame.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> Option<PhysicalPage<Size4K>> {
        if self.is_present() {
            Some(self.0.frame())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn ownership(self) -> FrameOwnership {
        self.0.ownership()
    }

    /// Same flags, different frame.
    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalPage<Size4K>) -> Self {
        Self(self.0.with_physical_address(frame.base()))
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl PageTable {
    /// Create a fully zeroed Page Table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); 1024],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Copy of every entry, detached from the table memory.
    #[inline]
    #[must_use]
    pub const fn snapshot(&self) -> [PtEntry; 1024] {
        self.entries
    }

    /// Whether all 1024 slots are present.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.iter().all(|e| e.is_present())
    }

    /// Number of present slots.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_entry_carries_flags() {
        let frame = PhysicalPage::from_frame_number(0x42);
        let e = PtEntry::map(frame, MapFlags::KERNEL);
        assert!(e.is_present());
        assert!(e.flags().writable());
        assert!(!e.flags().user_access());
        assert_eq!(e.ownership(), FrameOwnership::SharedWithKernel);
        assert_eq!(e.frame(), Some(frame));
    }

    #[test]
    fn table_fill_tracking() {
        let mut t = Box::new(PageTable::zeroed());
        assert_eq!(t.present_count(), 0);
        let e = PtEntry::map(PhysicalPage::from_frame_number(1), MapFlags::PRIVATE);
        for i in 0..1024 {
            t.set(TableIndex::from_usize(i), e);
        }
        assert!(t.is_full());
        t.set(TableIndex::new(7), PtEntry::zero());
        assert!(!t.is_full());
        assert_eq!(t.present_count(), 1023);
    }
}
