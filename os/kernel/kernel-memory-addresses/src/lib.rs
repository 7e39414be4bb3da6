//! # Virtual and Physical Memory Address Types (i386)
//!
//! Strongly typed wrappers for raw 32-bit addresses and page bases used by the
//! paging and allocation code.
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory. |
//!
//! ## Page Sizes
//!
//! Non-PAE 32-bit paging knows two page sizes:
//!
//! - [`Size4K`] — 4 KiB pages, mapped by a page-table entry
//! - [`Size4M`] — 4 MiB pages, i.e. the span of one page-directory entry
//!
//! A virtual address splits into a 10-bit [`DirectoryIndex`], a 10-bit
//! [`TableIndex`] and a 12-bit in-page offset:
//!
//! ```text
//!  31            22 21            12 11                0
//! +----------------+----------------+-------------------+
//! | directory idx  |   table idx    |    page offset    |
//! +----------------+----------------+-------------------+
//! ```
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC010_2345);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0xC010_2000);
//! assert_eq!(off.as_u32(), 0x345);
//! assert_eq!(va.directory_index().as_usize(), 0x300);
//! assert_eq!(va.table_index().as_usize(), 0x102);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use memory_address_offset::MemoryAddressOffset;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::{DirectoryIndex, TableIndex, VirtualAddress};
pub use virtual_page::VirtualPage;

/// Number of bytes in a base page.
pub const PAGE_SIZE: usize = Size4K::SIZE as usize;

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let va = VirtualAddress::new(0xDEAD_BEEF);
        let (page, off) = va.split::<Size4K>();
        assert_eq!(page.base().as_u32(), 0xDEAD_B000);
        assert_eq!(off.as_u32(), 0xEEF);
        assert_eq!(page.join(off), va);
    }

    #[test]
    fn split_and_join_4m() {
        let pa = PhysicalAddress::new(0x0123_4567);
        let (page, off) = pa.split::<Size4M>();
        assert_eq!(page.base().as_u32(), 0x0100_0000);
        assert_eq!(off.as_u32(), 0x23_4567);
        assert_eq!(page.join(off), pa);
    }

    #[test]
    fn directory_and_table_indices() {
        let va = VirtualAddress::new(0xC040_3000);
        assert_eq!(va.directory_index(), DirectoryIndex::new(0x301));
        assert_eq!(va.table_index(), TableIndex::new(0x003));
        let rebuilt = VirtualAddress::from_indices(va.directory_index(), va.table_index());
        assert_eq!(rebuilt, va);
    }

    #[test]
    fn frame_numbers() {
        let page = PhysicalPage::<Size4K>::from_frame_number(0x1234);
        assert_eq!(page.base().as_u32(), 0x0123_4000);
        assert_eq!(page.frame_number(), 0x1234);
    }

    #[test]
    fn page_iteration_steps_one_page() {
        let page = VirtualPage::<Size4K>::containing_address(VirtualAddress::new(0x1FFF));
        assert_eq!(page.base().as_u32(), 0x1000);
        assert_eq!(page.next().base().as_u32(), 0x2000);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(8191, 4096), 4096);
    }

    #[test]
    fn debug_formatting() {
        let pa = PhysicalAddress::new(0x1000);
        assert_eq!(format!("{pa:?}"), "PA(0x0000_1000)");
        let va = VirtualAddress::new(0xC000_0000);
        assert_eq!(format!("{va}"), "0xC000_0000");
    }
}
