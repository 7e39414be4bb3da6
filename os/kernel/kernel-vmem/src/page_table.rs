//! # i386 Paging Structures
//!
//! Both levels are one 4 KiB page holding 1024 32-bit entries:
//!
//! ```text
//!  CR3 ──► DirectoryTable ──► PageTable ──► 4 KiB frame
//!          [VA 31:22]         [VA 21:12]    [VA 11:0]
//! ```

mod pd;
mod pt;

pub use pd::{DirectoryTable, PdEntry};
pub use pt::{PageTable, PtEntry};

/// A page-sized, page-aligned block of raw memory that can become a
/// [`PageTable`] or a [`DirectoryTable`].
#[repr(C, align(4096))]
pub struct RawTable(pub [u8; 4096]);

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::PageTable {}
    impl Sealed for super::DirectoryTable {}
    impl Sealed for super::RawTable {}
}

/// Types that occupy exactly one zero-initializable 4 KiB frame.
pub trait PagingStructure: sealed::Sealed {}

impl PagingStructure for PageTable {}
impl PagingStructure for DirectoryTable {}
impl PagingStructure for RawTable {}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(size_of::<DirectoryTable>() == 4096);
    assert!(size_of::<RawTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};
