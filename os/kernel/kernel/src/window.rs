//! The copy window: two kernel pages whose page-table entries are rewritten
//! to alias whatever frame the memory manager needs to touch.
//!
//! Every address space holds its own copy of the window's page table, taken
//! when the space is cloned. Slots are therefore set in the table of the
//! live directory, which the memory manager passes in, and are only visible
//! while that directory stays live.

use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_vmem::{MapFlags, PageTable, PtEntry, WindowSlot};

/// Point `slot` at `frame`, or unmap it for `None`.
pub fn set_slot(table: &mut PageTable, slot: WindowSlot, frame: Option<PhysicalPage<Size4K>>) {
    let entry = frame.map_or(PtEntry::zero(), |frame| PtEntry::map(frame, MapFlags::KERNEL));
    table.set(slot.address().table_index(), entry);
}

#[cfg(target_arch = "x86")]
pub use mapper::WindowMapper;

#[cfg(target_arch = "x86")]
mod mapper {
    use super::set_slot;
    use crate::cpu::invlpg;
    use core::ptr::NonNull;
    use kernel_memory_addresses::{PhysicalPage, Size4K};
    use kernel_vmem::{PageTable, PhysMapper, WindowSlot};

    /// [`PhysMapper`] over the live directory's copy-window table.
    #[derive(Debug, Default)]
    pub struct WindowMapper;

    fn window_table(window: Option<NonNull<PageTable>>) -> NonNull<PageTable> {
        window.unwrap_or_else(|| panic!("the live directory has no copy-window table"))
    }

    impl PhysMapper for WindowMapper {
        unsafe fn map_window(
            &mut self,
            slot: WindowSlot,
            frame: PhysicalPage<Size4K>,
            window: Option<NonNull<PageTable>>,
        ) -> NonNull<u8> {
            let mut table = window_table(window);
            unsafe { set_slot(table.as_mut(), slot, Some(frame)) };
            let va = slot.address();
            invlpg(va);
            let ptr = core::ptr::with_exposed_provenance_mut::<u8>(va.as_u32() as usize);
            NonNull::new(ptr).unwrap_or_else(|| unreachable!("window slots are never at address zero"))
        }

        unsafe fn unmap_window(&mut self, slot: WindowSlot, window: Option<NonNull<PageTable>>) {
            let mut table = window_table(window);
            unsafe { set_slot(table.as_mut(), slot, None) };
            invlpg(slot.address());
        }
    }
}
