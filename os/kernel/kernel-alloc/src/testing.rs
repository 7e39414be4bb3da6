//! Host stand-ins for the hardware seams, for unit tests of this crate and
//! of the crates built on it.

use crate::frame_alloc::{FrameBitmap, RegionBitmap};
use crate::heap::{Heap, HeapError};
use crate::kernel_memory::{HeapBacking, KernelMemory, PagedHeap};
use crate::vmm::Vmm;
use alloc::alloc::{Layout, alloc_zeroed};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_info::boot::{BootMemoryMap, MemoryRange};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{PageDirectory, PageTable, PagingHardware, PhysMapper, TableFrame, WindowSlot};

/// Physical address the host heap pretends to live at.
pub const HOST_HEAP_PHYS: u32 = 0x0800_0000;

/// Frame number of the kernel directory used by [`kernel_memory`].
pub const KERNEL_DIRECTORY_FRAME: u32 = 0xFF00;

/// First frame number handed to spare tables seeded from the host.
pub const HOST_TABLE_FRAMES: u32 = 0xFE00;

/// Bytes of host memory standing in for the heap window in [`paged_parts`].
pub const PAGED_WINDOW: usize = 0x100_0000;

/// Physical memory simulated as a sparse set of host pages, created zeroed
/// on first access.
#[derive(Default)]
pub struct SimPhys {
    frames: BTreeMap<u32, Box<[u8; PAGE_SIZE]>>,
    slots: [Option<u32>; 2],
}

impl SimPhys {
    /// Contents of `frame`, if it was ever touched.
    #[must_use]
    pub fn frame(&self, frame: PhysicalPage<Size4K>) -> Option<&[u8; PAGE_SIZE]> {
        self.frames.get(&frame.frame_number()).map(|page| &**page)
    }

    const fn slot_index(slot: WindowSlot) -> usize {
        match slot {
            WindowSlot::First => 0,
            WindowSlot::Second => 1,
        }
    }
}

impl PhysMapper for SimPhys {
    unsafe fn map_window(
        &mut self,
        slot: WindowSlot,
        frame: PhysicalPage<Size4K>,
        _window: Option<NonNull<PageTable>>,
    ) -> NonNull<u8> {
        let index = Self::slot_index(slot);
        assert!(self.slots[index].is_none(), "window slot {slot:?} already in use");
        self.slots[index] = Some(frame.frame_number());
        let page = self
            .frames
            .entry(frame.frame_number())
            .or_insert_with(|| Box::new([0; PAGE_SIZE]));
        NonNull::from(&mut **page).cast()
    }

    unsafe fn unmap_window(&mut self, slot: WindowSlot, _window: Option<NonNull<PageTable>>) {
        let index = Self::slot_index(slot);
        assert!(self.slots[index].take().is_some(), "window slot {slot:?} not in use");
    }
}

/// Heap backing over one page-aligned host buffer, committed on demand.
pub struct HostHeap {
    base: NonNull<u8>,
    capacity: usize,
    committed: usize,
}

// Safety: the buffer is exclusively owned.
unsafe impl Send for HostHeap {}

impl HostHeap {
    /// A buffer of `capacity` bytes with a heap over its first `initial`.
    ///
    /// # Panics
    /// If the host is out of memory.
    #[must_use]
    pub fn new(capacity: usize, initial: usize) -> (Self, Heap) {
        let layout = Layout::from_size_align(capacity, PAGE_SIZE).expect("heap layout");
        // The buffer is leaked: heap blocks outlive any single test value.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host memory");
        let heap = unsafe { Heap::new(base, initial) };
        let backing = Self {
            base,
            capacity,
            committed: initial,
        };
        (backing, heap)
    }

    #[must_use]
    pub const fn committed(&self) -> usize {
        self.committed
    }
}

impl<M: PhysMapper> HeapBacking<M> for HostHeap {
    fn grow(&mut self, _vmm: &mut Vmm<M>, at: usize, bytes: usize) -> Result<usize, HeapError> {
        assert_eq!(at, self.base.as_ptr().addr() + self.committed, "heap grew out of order");
        if self.committed + bytes > self.capacity {
            return Err(HeapError::OutOfMemory { requested: bytes });
        }
        self.committed += bytes;
        Ok(bytes)
    }

    fn translate(&self, _vmm: &Vmm<M>, va: usize) -> Option<PhysicalAddress> {
        let offset = va.checked_sub(self.base.as_ptr().addr())?;
        if offset >= self.committed {
            return None;
        }
        Some(PhysicalAddress::new(HOST_HEAP_PHYS + u32::try_from(offset).ok()?))
    }
}

/// Records what would have reached the MMU.
#[derive(Debug, Default)]
pub struct RecordingHardware {
    pub loads: Vec<PhysicalAddress>,
    pub invalidated: Vec<VirtualAddress>,
}

impl PagingHardware for RecordingHardware {
    unsafe fn load_directory(&mut self, directory: PhysicalAddress) {
        self.loads.push(directory);
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        self.invalidated.push(va);
    }
}

/// 1 MiB to 16 MiB of usable RAM.
#[must_use]
pub fn memory_map() -> BootMemoryMap {
    BootMemoryMap::from_ranges(&[MemoryRange::new(0x10_0000, 0x100_0000)])
}

/// 1 MiB to 64 MiB of usable RAM.
#[must_use]
pub fn large_memory_map() -> BootMemoryMap {
    BootMemoryMap::from_ranges(&[MemoryRange::new(0x10_0000, 0x400_0000)])
}

pub type TestMemory = KernelMemory<SimPhys, HostHeap>;

pub type PagedTestMemory = KernelMemory<SimPhys, PagedHeap>;

fn host_page() -> NonNull<u8> {
    let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("table layout");
    NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host memory")
}

/// A frame bitmap over `map` with its reserve filled from the host.
fn frames(map: BootMemoryMap) -> FrameBitmap {
    let mut frames = FrameBitmap::new(map);
    while frames.needs_reserve() > 0 {
        let bitmap = Box::leak(Box::new(RegionBitmap::new()));
        unsafe { frames.install_reserve(NonNull::from(bitmap)) };
    }
    frames
}

fn kernel_directory() -> PageDirectory {
    let frame = PhysicalPage::from_frame_number(KERNEL_DIRECTORY_FRAME);
    unsafe { PageDirectory::new(TableFrame::new(host_page().cast(), frame)) }
}

/// A ready kernel memory context over [`memory_map`] with a 1 MiB heap
/// that may grow to 16 MiB.
#[must_use]
pub fn kernel_memory() -> TestMemory {
    let (backing, heap) = HostHeap::new(0x100_0000, 0x10_0000);
    let vmm = Vmm::new(frames(memory_map()), SimPhys::default(), kernel_directory());
    KernelMemory::new(heap, vmm, backing)
}

/// A memory manager over `map` with its reserve and spare tables seeded
/// from the host, and a [`PagedHeap`] whose first [`PAGED_WINDOW`] bytes
/// of window are a host buffer, returned as well.
///
/// # Panics
/// If the host is out of memory.
#[must_use]
pub fn paged_parts(map: BootMemoryMap) -> (Vmm<SimPhys>, PagedHeap, NonNull<u8>) {
    let mut vmm = Vmm::new(frames(map), SimPhys::default(), kernel_directory());
    let mut frame = HOST_TABLE_FRAMES;
    while vmm.needs_spare_tables() > 0 {
        let table = unsafe { TableFrame::new(host_page().cast(), PhysicalPage::from_frame_number(frame)) };
        unsafe { vmm.install_spare_table(table) };
        frame += 1;
    }
    let layout = Layout::from_size_align(PAGED_WINDOW, PAGE_SIZE).expect("window layout");
    // Leaked like the host heap.
    let window = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host memory");
    let backing = unsafe { PagedHeap::with_window(window, PAGED_WINDOW) };
    (vmm, backing, window)
}

/// A ready kernel memory context over [`large_memory_map`] whose heap is
/// paged into the kernel directory, starting at 1 MiB.
///
/// # Panics
/// If the initial heap cannot be mapped.
#[must_use]
pub fn paged_kernel_memory() -> PagedTestMemory {
    const INITIAL: usize = 0x10_0000;
    let (mut vmm, mut backing, window) = paged_parts(large_memory_map());
    backing
        .grow(&mut vmm, window.addr().get(), INITIAL)
        .expect("initial heap");
    let heap = unsafe { Heap::new(window, INITIAL) };
    KernelMemory::new(heap, vmm, backing)
}
