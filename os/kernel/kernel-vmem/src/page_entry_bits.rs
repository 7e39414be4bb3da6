use crate::FrameOwnership;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A single 32-bit i386 paging entry in its raw bitfield form.
///
/// Models the common superset of a page-directory entry (PDE) and a
/// page-table entry (PTE) in non-PAE mode.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (PTE only) |
/// | 7         | `PS` / `PAT`      | 4 MiB page in a PDE, PAT in a PTE |
/// | 8         | `G`               | Global (PTE only) |
/// | 9         | shared-with-kernel | OS-defined: frame belongs to the kernel |
/// | 10–11     | OS avail          | Reserved for OS use |
/// | 12–31     | `addr`            | Physical frame bits [31:12] |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_physical_address(PhysicalAddress::new(0x0012_3000));
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Effective only if every level of the walk allows writes.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Clear restricts the mapping to supervisor (ring 0) access.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a PTE.
    pub dirty: bool,

    /// Page Size (PS, bit 7) in a PDE; PAT in a PTE. Always clear here.
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global_translation: bool,

    /// OS-defined bit 9: the mapped frame belongs to the kernel and is shared
    /// by every address space.
    ///
    /// Decided when the mapping is created. Directory cloning copies such
    /// entries by value and directory teardown never releases their frames.
    pub shared_with_kernel: bool,

    /// OS-available (bits 10..=11).
    #[bits(2)]
    pub os_available: u8,

    /// Physical address bits [31:12].
    #[bits(20)]
    frame_number: u32,
}

impl PageEntryBits {
    /// Physical base address stored in the entry.
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_number() << 12)
    }

    /// Set the physical base address; the low 12 bits are discarded.
    #[inline]
    pub fn set_physical_address(&mut self, pa: PhysicalAddress) {
        *self = self.with_physical_address(pa);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame_number(pa.as_u32() >> 12)
    }

    /// The referenced 4 KiB frame.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(self.frame_number())
    }

    /// Ownership tag of the referenced frame.
    #[inline]
    #[must_use]
    pub const fn ownership(self) -> FrameOwnership {
        if self.shared_with_kernel() {
            FrameOwnership::SharedWithKernel
        } else {
            FrameOwnership::OwnedPrivate
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_ownership(self, ownership: FrameOwnership) -> Self {
        self.with_shared_with_kernel(matches!(ownership, FrameOwnership::SharedWithKernel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bits_sit_above_flags() {
        let e = PageEntryBits::new().with_physical_address(PhysicalAddress::new(0xFFFF_F123));
        assert_eq!(e.into_bits(), 0xFFFF_F000);
        assert_eq!(e.physical_address(), PhysicalAddress::new(0xFFFF_F000));
        assert_eq!(e.frame().frame_number(), 0xF_FFFF);
    }

    #[test]
    fn ownership_tag_is_bit_9() {
        let e = PageEntryBits::new().with_ownership(FrameOwnership::SharedWithKernel);
        assert_eq!(e.into_bits(), 1 << 9);
        assert_eq!(e.ownership(), FrameOwnership::SharedWithKernel);
        assert_eq!(PageEntryBits::new().ownership(), FrameOwnership::OwnedPrivate);
    }
}
