//! # Kernel Memory Context
//!
//! [`KernelMemory`] bundles the heap, the memory manager and the heap's
//! backing into the one object every memory operation goes through. It is
//! the only place that knows how the pieces feed each other:
//!
//! ```text
//!          ┌───────────── page tables, region bitmaps ─────────────┐
//!          │                                                        ▼
//!   ┌──────┴─────┐   grow / translate   ┌─────────────┐   frames  ┌───────┐
//!   │    Heap    │ ───────────────────► │ HeapBacking │ ────────► │  Vmm  │
//!   └────────────┘                      └─────────────┘           └───────┘
//! ```
//!
//! Paging structures are carved from the heap, but the paging code never
//! calls the heap itself. Each operation first fills a [`TablePool`] with as
//! many tables as it can possibly need and stocks the frame bitmap's reserve
//! for every region its new frames may open, runs, and hands the leftover
//! tables back. Region bitmaps and spare kernel tables are topped up again
//! after every operation. Heap growth, which runs in the middle of all this,
//! provides for itself: see [`PagedHeap`].

use crate::frame_alloc::{RESERVE_MINIMUM, RegionBitmap};
use crate::heap::{Growth, Heap, HeapError};
use crate::table_pool::TablePool;
use crate::vmm::Vmm;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use kernel_info::memory::{KERNEL_HEAP_END, KERNEL_HEAP_START};
use kernel_memory_addresses::{
    DirectoryIndex, PAGE_SIZE, PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};
use kernel_vmem::{
    FrameAlloc, FrameOwnership, MapError, MapFlags, PageDirectory, PagingHardware, PhysMapper, RawTable,
    Released, TableFrame,
};

/// Where the heap's memory comes from.
pub trait HeapBacking<M: PhysMapper> {
    /// Make `[at, at + bytes)` usable. Returns the number of bytes added.
    ///
    /// # Errors
    /// When the heap window is exhausted or mapping fails.
    fn grow(&mut self, vmm: &mut Vmm<M>, at: usize, bytes: usize) -> Result<usize, HeapError>;

    /// Physical address behind the heap address `va`.
    fn translate(&self, vmm: &Vmm<M>, va: usize) -> Option<PhysicalAddress>;
}

/// Region bitmaps cut from one carved page.
const BITMAPS_PER_PAGE: usize = PAGE_SIZE / size_of::<RegionBitmap>();

/// Heap memory mapped page by page into the kernel directory.
///
/// The heap grows up from [`KERNEL_HEAP_START`]. What the manager needs to
/// map those pages, spare page tables and region bitmaps, is carved a page
/// at a time from the top of the window, so growing never waits on the heap
/// it is growing:
///
/// ```text
/// KERNEL_HEAP_START                                        KERNEL_HEAP_END
///   ├── heap ──►            free             ◄── carved ──┤
///                                          limit
/// ```
#[derive(Debug)]
pub struct PagedHeap {
    /// First byte of the window, as the heap addresses it.
    base: NonNull<u8>,
    /// Lowest carved byte; the heap may grow up to here.
    limit: usize,
}

// Safety: the window is exclusively owned.
unsafe impl Send for PagedHeap {}

impl PagedHeap {
    /// The whole heap window, at its kernel address.
    #[must_use]
    pub fn new() -> Self {
        let base = NonNull::new(KERNEL_HEAP_START as usize as *mut u8).unwrap_or_else(|| unreachable!());
        Self {
            base,
            limit: KERNEL_HEAP_END as usize,
        }
    }

    /// The first `len` bytes of the heap window, addressed at `base`.
    /// Page `n` of the buffer is backed by the frame mapped at page `n` of
    /// the window.
    ///
    /// # Safety
    /// `[base, base + len)` must be valid for reads and writes and used by
    /// nothing but this backing and the heap on top of it.
    ///
    /// # Panics
    /// If `len` is not a page multiple or exceeds the window.
    #[must_use]
    pub unsafe fn with_window(base: NonNull<u8>, len: usize) -> Self {
        assert!(
            len.is_multiple_of(PAGE_SIZE) && len <= (KERNEL_HEAP_END - KERNEL_HEAP_START) as usize,
            "heap window of {len:#x} bytes"
        );
        Self {
            base,
            limit: base.addr().get() + len,
        }
    }

    /// Where carved bookkeeping starts; the heap cannot grow past it.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Kernel address of the heap address `at`.
    fn window_va(&self, at: usize) -> Option<VirtualAddress> {
        let offset = at.checked_sub(self.base.addr().get())?;
        let va = (KERNEL_HEAP_START as usize).checked_add(offset)?;
        u32::try_from(va).ok().map(VirtualAddress::new)
    }

    /// Map one more page below the limit, never below `floor`.
    fn carve<M: PhysMapper>(
        &mut self,
        vmm: &mut Vmm<M>,
        floor: usize,
    ) -> Result<(NonNull<u8>, PhysicalPage<Size4K>), HeapError> {
        let out_of_memory = HeapError::OutOfMemory { requested: PAGE_SIZE };
        let at = self
            .limit
            .checked_sub(PAGE_SIZE)
            .filter(|at| *at >= floor)
            .ok_or(out_of_memory)?;
        let va = self.window_va(at).ok_or(out_of_memory)?;
        let frame = map_fresh(vmm, va)?;
        self.limit = at;
        // SAFETY: inside the window.
        let block = unsafe { self.base.byte_add(at - self.base.addr().get()) };
        Ok((block, frame))
    }

    /// Top up the frame bitmap reserve and the spare kernel tables from
    /// carved pages.
    ///
    /// Every carve starts with at least one reserve bitmap and, since
    /// carves only cross into a new page table once per call, with at least
    /// two spare tables whenever it needs any.
    fn provision<M: PhysMapper>(&mut self, vmm: &mut Vmm<M>, floor: usize) -> Result<(), HeapError> {
        loop {
            if vmm.frames().needs_reserve() > 0 {
                let (block, _) = self.carve(vmm, floor)?;
                for index in 0..BITMAPS_PER_PAGE {
                    // SAFETY: disjoint pieces of a fresh page, owned by the bitmap from here on.
                    unsafe {
                        let bitmap = block.byte_add(index * size_of::<RegionBitmap>()).cast();
                        vmm.frames_mut().install_reserve(bitmap);
                    }
                }
                log::trace!("carved {BITMAPS_PER_PAGE} region bitmaps at {block:p}");
            } else if vmm.needs_spare_tables() > 0 {
                let (block, frame) = self.carve(vmm, floor)?;
                // SAFETY: a fresh page and the frame behind it.
                unsafe { vmm.install_spare_table(TableFrame::new(block.cast(), frame)) };
            } else {
                return Ok(());
            }
        }
    }

    /// Remove the pages mapped for `[from, to)`.
    fn unmap<M: PhysMapper>(&self, vmm: &mut Vmm<M>, from: usize, to: usize) {
        for at in (from..to).step_by(PAGE_SIZE) {
            if let Some(va) = self.window_va(at) {
                vmm.unmap_kernel_page(va);
            }
        }
    }
}

impl Default for PagedHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Back the kernel page at `va` with a fresh frame.
fn map_fresh<M: PhysMapper>(vmm: &mut Vmm<M>, va: VirtualAddress) -> Result<PhysicalPage<Size4K>, HeapError> {
    let frame = vmm.frames_mut().alloc_frame();
    if let Err(e) = vmm.map_kernel_page(va, frame) {
        vmm.frames_mut().free_frame(frame);
        return Err(e.into());
    }
    Ok(frame)
}

impl<M: PhysMapper> HeapBacking<M> for PagedHeap {
    /// All or nothing: pages mapped before a failure are unmapped again.
    fn grow(&mut self, vmm: &mut Vmm<M>, at: usize, bytes: usize) -> Result<usize, HeapError> {
        let out_of_memory = HeapError::OutOfMemory { requested: bytes };
        let end = at
            .checked_add(bytes)
            .filter(|end| *end <= self.limit)
            .ok_or(out_of_memory)?;
        let mut next = at;
        while next < end {
            let mapped = self.provision(vmm, end).and_then(|()| {
                let va = self.window_va(next).ok_or(out_of_memory)?;
                map_fresh(vmm, va)
            });
            if let Err(e) = mapped {
                log::warn!("heap growth at {at:#x} failed after {:#x} bytes: {e}", next - at);
                self.unmap(vmm, at, next);
                return Err(e);
            }
            next += PAGE_SIZE;
        }
        Ok(bytes)
    }

    fn translate(&self, vmm: &Vmm<M>, va: usize) -> Option<PhysicalAddress> {
        vmm.kernel().translate(self.window_va(va)?)
    }
}

/// The kernel's memory: heap, memory manager and heap backing.
pub struct KernelMemory<M: PhysMapper, B: HeapBacking<M>> {
    heap: Heap,
    vmm: Vmm<M>,
    backing: B,
}

impl<M: PhysMapper, B: HeapBacking<M>> KernelMemory<M, B> {
    /// Assemble the kernel memory context.
    ///
    /// The frame bitmap's reserve and the manager's spare tables must
    /// already be full: the heap may have to grow while the remaining
    /// bookkeeping is allocated.
    ///
    /// # Panics
    /// If the heap cannot supply the copy-window table or the reserves.
    pub fn new(heap: Heap, vmm: Vmm<M>, backing: B) -> Self {
        let mut memory = Self { heap, vmm, backing };
        memory.refill_reserves();
        if !memory.vmm.has_window_table() {
            let table = memory.allocate_table();
            // SAFETY: fresh heap block, exclusively owned from here on.
            unsafe { memory.vmm.install_window_table(table) };
        }
        memory.refill_reserves();
        log::info!(
            "kernel memory ready: heap {:#x}..{:#x}, {} frames in use",
            memory.heap.start(),
            memory.heap.end(),
            memory.vmm.frames().used_frames()
        );
        memory
    }

    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    #[must_use]
    pub const fn vmm(&self) -> &Vmm<M> {
        &self.vmm
    }

    pub const fn vmm_mut(&mut self) -> &mut Vmm<M> {
        &mut self.vmm
    }

    fn raw_allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        let mut growth = Growth {
            backing: &mut self.backing,
            vmm: &mut self.vmm,
        };
        self.heap.allocate(size, align, &mut growth)
    }

    fn raw_allocate_physical(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<(NonNull<u8>, PhysicalAddress), HeapError> {
        let mut growth = Growth {
            backing: &mut self.backing,
            vmm: &mut self.vmm,
        };
        self.heap.allocate_physical(size, align, &mut growth)
    }

    /// Heap allocation.
    ///
    /// # Errors
    /// [`HeapError`] when the heap cannot grow any further.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        let ptr = self.raw_allocate(size, align);
        self.refill_reserves();
        ptr
    }

    /// Heap allocation that also reports the physical address of the first
    /// byte.
    ///
    /// # Errors
    /// [`HeapError`] when the heap cannot grow or the block has no
    /// physical translation.
    pub fn allocate_physical(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<(NonNull<u8>, PhysicalAddress), HeapError> {
        let result = self.raw_allocate_physical(size, align);
        self.refill_reserves();
        result
    }

    /// Release a heap allocation.
    ///
    /// # Safety
    /// See [`Heap::free`].
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.heap.free(ptr) };
    }

    /// Top up the frame bitmap reserve and the spare kernel tables.
    ///
    /// # Panics
    /// If the heap is exhausted.
    pub fn refill_reserves(&mut self) {
        while self.vmm.frames().needs_reserve() > 0 {
            self.install_bitmap();
        }
        while self.vmm.needs_spare_tables() > 0 {
            let table = self.allocate_table();
            // SAFETY: fresh heap block, exclusively owned by the manager.
            unsafe { self.vmm.install_spare_table(table) };
        }
    }

    fn install_bitmap(&mut self) {
        let block = self
            .raw_allocate(size_of::<RegionBitmap>(), align_of::<RegionBitmap>())
            .unwrap_or_else(|e| panic!("cannot refill the frame bitmap reserve: {e}"));
        // SAFETY: fresh heap block, never freed.
        unsafe { self.vmm.frames_mut().install_reserve(block.cast()) };
    }

    fn allocate_table(&mut self) -> TableFrame<RawTable> {
        let (block, phys) = self
            .raw_allocate_physical(PAGE_SIZE, PAGE_SIZE)
            .unwrap_or_else(|e| panic!("no memory for a page table: {e}"));
        // SAFETY: a page-aligned, page-sized heap block and its frame.
        unsafe { TableFrame::new(block.cast(), PhysicalPage::containing_address(phys)) }
    }

    /// Fill `pool` until it holds `tables(vmm)` tables and stock the frame
    /// bitmap's reserve for `frames` allocations. Both are asked again after
    /// each heap allocation since the heap may grow meanwhile.
    fn prepare(&mut self, pool: &mut TablePool, tables: impl Fn(&Vmm<M>) -> usize, frames: usize) {
        loop {
            let bitmaps = RESERVE_MINIMUM + self.vmm.frames().regions_to_open(frames);
            if pool.len() < tables(&self.vmm) {
                let table = self.allocate_table();
                // SAFETY: fresh heap block.
                unsafe { pool.push(table) };
            } else if self.vmm.frames().reserved() < bitmaps {
                self.install_bitmap();
            } else {
                return;
            }
        }
    }

    fn release_pool(&mut self, mut pool: TablePool) {
        while let Some(table) = pool.pop() {
            // SAFETY: every pooled table is a heap block owned by the pool.
            unsafe { self.heap.free(table.virt().cast()) };
        }
    }

    /// Map a page into the kernel directory and thereby into every address
    /// space.
    ///
    /// # Errors
    /// See [`Vmm::map_kernel_page`].
    pub fn map_kernel_page(&mut self, va: VirtualAddress, frame: PhysicalPage<Size4K>) -> Result<(), MapError> {
        let result = self.vmm.map_kernel_page(va, frame);
        self.refill_reserves();
        result
    }

    /// Map one page into `dir`.
    ///
    /// # Errors
    /// See [`PageDirectory::map_page`].
    pub fn map_page(
        &mut self,
        dir: &mut PageDirectory,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        self.vmm.adopt_active(dir);
        let mut pool = TablePool::new();
        let needed = usize::from(flags.create_table && dir.table(va.directory_index()).is_none());
        self.prepare(&mut pool, |_| needed, 0);
        let result = self.vmm.map_page(dir, va, frame, flags, &mut pool);
        self.release_pool(pool);
        self.refill_reserves();
        result
    }

    /// Back `pages` pages at `va` in `dir` with fresh frames.
    ///
    /// # Errors
    /// See [`Vmm::map_anonymous`].
    pub fn map_anonymous(
        &mut self,
        dir: &mut PageDirectory,
        va: VirtualAddress,
        pages: u32,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        self.vmm.adopt_active(dir);
        let mut pool = TablePool::new();
        let needed = if flags.create_table {
            missing_tables(dir, va, pages)
        } else {
            0
        };
        let frames = usize::try_from(pages).unwrap_or(usize::MAX);
        self.prepare(&mut pool, |_| needed, frames);
        let result = self.vmm.map_anonymous(dir, va, pages, flags, &mut pool);
        self.release_pool(pool);
        self.refill_reserves();
        result
    }

    /// Unmap `pages` pages at `va` in `dir`.
    pub fn unmap_range(
        &mut self,
        dir: &mut PageDirectory,
        va: VirtualAddress,
        pages: u32,
        hw: &mut impl PagingHardware,
    ) -> usize {
        self.vmm.unmap_range(dir, va, pages, hw)
    }

    /// A fresh address space containing only the kernel mappings.
    pub fn new_address_space(&mut self) -> PageDirectory {
        let mut pool = TablePool::new();
        self.prepare(&mut pool, |vmm| vmm.kernel().present_tables() + 1, 0);
        let dir = self.vmm.clone_kernel(&mut pool);
        self.release_pool(pool);
        self.refill_reserves();
        log::debug!("new address space {}", dir.physical_address());
        dir
    }

    /// Duplicate `source`, private frames included.
    ///
    /// `source` may be the live directory.
    pub fn clone_directory(&mut self, source: &mut PageDirectory) -> PageDirectory {
        self.vmm.adopt_active(source);
        // While the pool fills, the live directory may gain mirrored kernel
        // tables; it is only reached through the manager until the copy.
        let live = self.vmm.is_active(source);
        let tables = source.present_tables();
        let private = source
            .mappings()
            .filter(|(_, entry)| entry.ownership() == FrameOwnership::OwnedPrivate)
            .count();
        let mut pool = TablePool::new();
        self.prepare(
            &mut pool,
            |vmm| 1 + if live { vmm.active().present_tables() } else { tables },
            private,
        );
        let dir = self.vmm.clone_directory(source, &mut pool);
        self.release_pool(pool);
        self.refill_reserves();
        log::debug!("cloned {} into {}", source.physical_address(), dir.physical_address());
        dir
    }

    /// Tear down `dir`, returning its frames and tables.
    ///
    /// # Panics
    /// If `dir` is the live directory.
    pub fn free_directory(&mut self, dir: PageDirectory) -> Released {
        let mut pool = TablePool::new();
        let released = self.vmm.free_directory(dir, &mut pool);
        self.release_pool(pool);
        released
    }

    /// Make `dir` the live address space.
    ///
    /// # Safety
    /// See [`Vmm::switch_to`].
    pub unsafe fn switch_to(&mut self, dir: &mut PageDirectory, hw: &mut impl PagingHardware) {
        self.vmm.adopt_active(dir);
        let mut pool = TablePool::new();
        self.prepare(&mut pool, |vmm| vmm.tables_for_switch(dir), 0);
        unsafe { self.vmm.switch_to(dir, hw, &mut pool) };
        self.release_pool(pool);
        self.refill_reserves();
    }

    /// Make the kernel directory live.
    pub fn switch_to_kernel(&mut self, hw: &mut impl PagingHardware) {
        self.vmm.switch_to_kernel(hw);
    }

    /// See [`Vmm::write_bytes`].
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if part of the range is unmapped.
    pub fn write_bytes(&mut self, dir: &PageDirectory, va: VirtualAddress, bytes: &[u8]) -> Result<(), MapError> {
        self.vmm.write_bytes(dir, va, bytes)
    }

    /// See [`Vmm::read_bytes`].
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if part of the range is unmapped.
    pub fn read_bytes(&mut self, dir: &PageDirectory, va: VirtualAddress, buf: &mut [u8]) -> Result<(), MapError> {
        self.vmm.read_bytes(dir, va, buf)
    }

    /// See [`Vmm::copy_range`].
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if either side lacks a page of the range.
    pub fn copy_range(
        &mut self,
        src: &PageDirectory,
        dst: &PageDirectory,
        va: VirtualAddress,
        len: usize,
    ) -> Result<(), MapError> {
        self.vmm.copy_range(src, dst, va, len)
    }

    /// Log the heap and the frame bitmap.
    pub fn dump(&self) {
        self.heap.dump();
        self.vmm.frames().dump();
    }
}

/// Number of page tables `dir` lacks for `pages` pages starting at `va`.
fn missing_tables(dir: &PageDirectory, va: VirtualAddress, pages: u32) -> usize {
    if pages == 0 {
        return 0;
    }
    let first = va.directory_index().as_usize();
    let last_page = u64::from(va.as_u32()) + u64::from(pages - 1) * u64::from(Size4K::SIZE);
    let last = VirtualAddress::new(u32::try_from(last_page).unwrap_or(u32::MAX))
        .directory_index()
        .as_usize();
    (first..=last)
        .filter(|di| dir.table(DirectoryIndex::from_usize(*di)).is_none())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, RecordingHardware, SimPhys};

    fn frame(n: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(n)
    }

    #[test]
    fn construction_installs_the_window_and_reserves() {
        let memory = testing::kernel_memory();
        assert!(memory.vmm().has_window_table());
        assert_eq!(memory.vmm().frames().needs_reserve(), 0);
        assert_eq!(memory.vmm().needs_spare_tables(), 0);
    }

    #[test]
    fn heap_round_trip_reuses_the_block() {
        let mut memory = testing::kernel_memory();
        let a = memory.allocate(256, 16).unwrap();
        unsafe { memory.free(a) };
        let b = memory.allocate(256, 16).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn physical_allocation_is_page_aligned_for_tables() {
        let mut memory = testing::kernel_memory();
        let (ptr, phys) = memory.allocate_physical(4096, 4096).unwrap();
        assert!(ptr.as_ptr().addr().is_multiple_of(4096));
        assert!(phys.is_aligned::<Size4K>());
    }

    #[test]
    fn anonymous_pages_get_fresh_private_frames() {
        let mut memory = testing::kernel_memory();
        let mut dir = memory.new_address_space();
        let used = memory.vmm().frames().used_frames();

        memory
            .map_anonymous(&mut dir, VirtualAddress::new(0x0040_0000), 3, MapFlags::PRIVATE)
            .unwrap();

        assert_eq!(memory.vmm().frames().used_frames(), used + 3);
        for i in 0..3 {
            let entry = dir.entry(VirtualAddress::new(0x0040_0000 + i * 4096)).unwrap();
            assert_eq!(entry.ownership(), kernel_vmem::FrameOwnership::OwnedPrivate);
        }
    }

    #[test]
    fn bytes_written_through_the_window_read_back() {
        let mut memory = testing::kernel_memory();
        let mut dir = memory.new_address_space();
        let va = VirtualAddress::new(0x0040_0FF0);
        memory
            .map_anonymous(&mut dir, VirtualAddress::new(0x0040_0000), 2, MapFlags::PRIVATE)
            .unwrap();

        let message = b"crosses a page boundary";
        memory.write_bytes(&dir, va, message).unwrap();
        let mut back = [0u8; 23];
        memory.read_bytes(&dir, va, &mut back).unwrap();
        assert_eq!(&back, message);

        assert_eq!(
            memory.write_bytes(&dir, VirtualAddress::new(0x0080_0000), b"x"),
            Err(MapError::NotMapped(VirtualAddress::new(0x0080_0000)))
        );
    }

    #[test]
    fn cloned_directory_has_equal_bytes_in_distinct_frames() {
        let mut memory = testing::kernel_memory();
        let mut parent = memory.new_address_space();
        let va = VirtualAddress::new(0x0800_0000);
        memory.map_anonymous(&mut parent, va, 1, MapFlags::PRIVATE).unwrap();
        memory.write_bytes(&parent, va, b"parent data").unwrap();

        let child = memory.clone_directory(&mut parent);

        let mut seen = [0u8; 11];
        memory.read_bytes(&child, va, &mut seen).unwrap();
        assert_eq!(&seen, b"parent data");
        assert_ne!(child.translate(va), parent.translate(va));

        memory.write_bytes(&child, va, b"child").unwrap();
        memory.read_bytes(&parent, va, &mut seen).unwrap();
        assert_eq!(&seen, b"parent data");
    }

    #[test]
    fn copy_range_moves_bytes_between_spaces() {
        let mut memory = testing::kernel_memory();
        let mut a = memory.new_address_space();
        let mut b = memory.new_address_space();
        let va = VirtualAddress::new(0x0040_0000);
        memory.map_anonymous(&mut a, va, 2, MapFlags::PRIVATE).unwrap();
        memory.map_anonymous(&mut b, va, 2, MapFlags::PRIVATE).unwrap();
        let data: Vec<u8> = (0..6000u32).map(|i| u8::try_from(i % 251).unwrap()).collect();
        memory.write_bytes(&a, va, &data).unwrap();

        memory.copy_range(&a, &b, va, data.len()).unwrap();

        let mut back = vec![0u8; data.len()];
        memory.read_bytes(&b, va, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn freeing_a_clone_keeps_kernel_frames() {
        let mut memory = testing::kernel_memory();
        let kernel_va = VirtualAddress::new(0xC010_0000);
        let kernel_frame = frame(0x200);
        memory.map_kernel_page(kernel_va, kernel_frame).unwrap();

        let mut dir = memory.new_address_space();
        memory
            .map_anonymous(&mut dir, VirtualAddress::new(0x0040_0000), 4, MapFlags::PRIVATE)
            .unwrap();
        let clone = memory.clone_directory(&mut dir);
        let used = memory.vmm().frames().used_frames();

        let released = memory.free_directory(clone);

        assert_eq!(released.frames, 4);
        assert_eq!(memory.vmm().frames().used_frames(), used - 4);
        assert!(memory.vmm().frames().is_used(kernel_frame));
        assert_eq!(dir.entry(kernel_va).and_then(kernel_vmem::PtEntry::frame), Some(kernel_frame));
    }

    #[test]
    #[should_panic(expected = "attempt to free the active page directory")]
    fn freeing_the_live_directory_panics() {
        let mut memory = testing::kernel_memory();
        let mut hw = RecordingHardware::default();
        let mut dir = Box::new(memory.new_address_space());
        unsafe { memory.switch_to(&mut dir, &mut hw) };
        let dir = *dir;
        memory.free_directory(dir);
    }

    #[test]
    fn switching_loads_cr3_and_catches_up_on_kernel_mappings() {
        let mut memory = testing::kernel_memory();
        let mut hw = RecordingHardware::default();
        let mut dir = Box::new(memory.new_address_space());

        // Mapped after the clone: must show up once the space is switched to.
        let late = VirtualAddress::new(0xC040_0000);
        memory.map_kernel_page(late, frame(0x300)).unwrap();
        assert!(dir.entry(late).is_none());

        unsafe { memory.switch_to(&mut dir, &mut hw) };
        assert_eq!(hw.loads.last(), Some(&dir.physical_address()));
        assert_eq!(dir.entry(late), memory.vmm().kernel().entry(late));

        // While live, new kernel mappings are mirrored immediately.
        let later = VirtualAddress::new(0xC040_1000);
        memory.map_kernel_page(later, frame(0x301)).unwrap();
        assert_eq!(dir.entry(later), memory.vmm().kernel().entry(later));

        memory.switch_to_kernel(&mut hw);
        assert_eq!(hw.loads.last(), Some(&memory.vmm().kernel().physical_address()));
    }

    #[test]
    fn unmapping_the_live_space_invalidates_the_tlb() {
        let mut memory = testing::kernel_memory();
        let mut hw = RecordingHardware::default();
        let mut dir = Box::new(memory.new_address_space());
        let va = VirtualAddress::new(0x0040_0000);
        memory.map_anonymous(&mut dir, va, 2, MapFlags::PRIVATE).unwrap();
        unsafe { memory.switch_to(&mut dir, &mut hw) };

        assert_eq!(memory.unmap_range(&mut dir, va, 4, &mut hw), 2);
        assert_eq!(hw.invalidated, vec![va, VirtualAddress::new(0x0040_1000)]);
        memory.switch_to_kernel(&mut hw);
    }

    #[test]
    fn paged_heap_maps_frames_into_the_kernel_directory() {
        let (mut vmm, mut backing, window) = testing::paged_parts(testing::memory_map());
        let at = window.addr().get() + 0x10_0000;

        let added = backing.grow(&mut vmm, at, 0x2000).unwrap();

        assert_eq!(added, 0x2000);
        let va = VirtualAddress::new(KERNEL_HEAP_START + 0x10_0000);
        let first = HeapBacking::<SimPhys>::translate(&backing, &vmm, at + 0x10).unwrap();
        assert_eq!(Some(first), vmm.kernel().translate(va.checked_add(0x10).unwrap()));
        assert!(vmm.frames().is_used(PhysicalPage::containing_address(first)));
        let end = window.addr().get() + testing::PAGED_WINDOW;
        assert!(backing.grow(&mut vmm, end - 0x1000, 0x2000).is_err());
    }

    #[test]
    fn missing_tables_counts_uncovered_slots() {
        let mut memory = testing::kernel_memory();
        let mut dir = memory.new_address_space();
        assert_eq!(missing_tables(&dir, VirtualAddress::new(0x003F_F000), 2), 2);
        memory
            .map_anonymous(&mut dir, VirtualAddress::new(0x003F_F000), 2, MapFlags::PRIVATE)
            .unwrap();
        assert_eq!(missing_tables(&dir, VirtualAddress::new(0x003F_F000), 2), 0);
        assert_eq!(missing_tables(&dir, VirtualAddress::new(0), 0), 0);
    }

    #[test]
    fn large_anonymous_mapping_opens_many_regions() {
        let mut memory = testing::kernel_memory();
        let mut dir = memory.new_address_space();
        let used = memory.vmm().frames().used_frames();

        // 10 MiB of frames from 1 MiB upwards: physical regions 0, 1 and 2.
        memory
            .map_anonymous(&mut dir, VirtualAddress::new(0x0040_0000), 2560, MapFlags::PRIVATE)
            .unwrap();

        assert_eq!(memory.vmm().frames().used_frames(), used + 2560);
        assert!((0..3).all(|region| memory.vmm().frames().has_region(region)));
        assert_eq!(memory.vmm().frames().needs_reserve(), 0);
        assert!(dir.is_mapped(VirtualAddress::new(0x0040_0000 + 2559 * 4096)));
    }

    #[test]
    fn paged_heap_grows_across_tables_and_regions() {
        let (mut vmm, mut backing, window) = testing::paged_parts(testing::large_memory_map());
        let at = window.addr().get() + 0x10_0000;

        // 12 MiB: four kernel page tables and four physical regions.
        let added = backing.grow(&mut vmm, at, 0xC0_0000).unwrap();

        assert_eq!(added, 0xC0_0000);
        for offset in (0..0xC0_0000).step_by(0x40_0000) {
            assert!(HeapBacking::<SimPhys>::translate(&backing, &vmm, at + offset).is_some());
        }
        assert!(vmm.frames().used_frames() > 3072);
        assert!((0..4).all(|region| vmm.frames().has_region(region)));
        assert!(backing.limit() < window.addr().get() + testing::PAGED_WINDOW);
        assert!(backing.limit() >= at + 0xC0_0000);
    }

    #[test]
    fn failed_growth_leaves_nothing_mapped() {
        let (mut vmm, mut backing, window) = testing::paged_parts(testing::large_memory_map());
        let at = window.addr().get();

        // Everything but the last page: one carve fits, the second does not.
        let result = backing.grow(&mut vmm, at, testing::PAGED_WINDOW - 0x1000);

        assert_eq!(result, Err(HeapError::OutOfMemory { requested: 0x1000 }));
        assert_eq!(HeapBacking::<SimPhys>::translate(&backing, &vmm, at), None);
        assert!(!vmm.frames().is_used(frame(0x100)));
        // Only the carved bookkeeping page stays.
        assert_eq!(vmm.frames().used_frames(), 1);

        assert_eq!(backing.grow(&mut vmm, at, 0x1000), Ok(0x1000));
        assert!(HeapBacking::<SimPhys>::translate(&backing, &vmm, at).is_some());
    }

    #[test]
    fn paged_memory_serves_a_large_allocation() {
        let mut memory = testing::paged_kernel_memory();

        let block = memory.allocate(0xC0_0000, 16).unwrap();
        unsafe {
            block.write(1);
            block.add(0xC0_0000 - 1).write(2);
        }

        assert!(memory.heap().end() - memory.heap().start() > 0xC0_0000);
        assert_eq!(memory.vmm().frames().needs_reserve(), 0);
        assert_eq!(memory.vmm().needs_spare_tables(), 0);
        unsafe { memory.free(block) };
    }

    #[test]
    fn paged_memory_maps_a_large_anonymous_range() {
        let mut memory = testing::paged_kernel_memory();
        let mut dir = memory.new_address_space();
        let used = memory.vmm().frames().used_frames();

        memory
            .map_anonymous(&mut dir, VirtualAddress::new(0x0040_0000), 2560, MapFlags::PRIVATE)
            .unwrap();

        assert_eq!(memory.vmm().frames().used_frames(), used + 2560);
        assert_eq!(memory.vmm().frames().needs_reserve(), 0);
    }

    #[test]
    fn paged_memory_clones_a_large_directory() {
        let mut memory = testing::paged_kernel_memory();
        let mut parent = memory.new_address_space();
        let va = VirtualAddress::new(0x0040_0000);
        let last = VirtualAddress::new(0x0040_0000 + 2599 * 4096);
        memory.map_anonymous(&mut parent, va, 2600, MapFlags::PRIVATE).unwrap();
        memory.write_bytes(&parent, last, b"last page").unwrap();
        let used = memory.vmm().frames().used_frames();

        let child = memory.clone_directory(&mut parent);

        assert!(memory.vmm().frames().used_frames() >= used + 2600);
        let mut seen = [0u8; 9];
        memory.read_bytes(&child, last, &mut seen).unwrap();
        assert_eq!(&seen, b"last page");
        assert_ne!(child.translate(last), parent.translate(last));
    }

    #[test]
    fn cloning_the_live_directory_sees_heap_growth() {
        let mut memory = testing::paged_kernel_memory();
        let mut hw = RecordingHardware::default();
        let mut dir = Box::new(memory.new_address_space());
        let va = VirtualAddress::new(0x0040_0000);
        memory.map_anonymous(&mut dir, va, 1, MapFlags::PRIVATE).unwrap();
        unsafe { memory.switch_to(&mut dir, &mut hw) };

        // Grows the heap into kernel page tables the clone has not seen.
        let block = memory.allocate(0x50_0000, 16).unwrap();
        let child = memory.clone_directory(&mut dir);

        let top = memory.heap().end() - memory.heap().start() - 0x1000;
        let top = VirtualAddress::new(KERNEL_HEAP_START + u32::try_from(top).unwrap());
        assert!(memory.vmm().kernel().is_mapped(top));
        assert_eq!(dir.entry(top), memory.vmm().kernel().entry(top));
        assert_eq!(child.entry(top), memory.vmm().kernel().entry(top));
        assert!(child.is_mapped(va));

        unsafe { memory.free(block) };
        memory.switch_to_kernel(&mut hw);
    }

    #[test]
    fn each_address_space_has_its_own_window_table() {
        let mut memory = testing::kernel_memory();
        let a = memory.new_address_space();
        let b = memory.new_address_space();

        let index = kernel_vmem::WindowSlot::First.address().directory_index();
        let kernel = memory.vmm().kernel().table_ptr(index).unwrap();
        let (ours, theirs) = (a.table_ptr(index).unwrap(), b.table_ptr(index).unwrap());
        assert_ne!(ours, kernel);
        assert_ne!(ours, theirs);
    }

    #[test]
    fn kernel_mappings_in_new_tables_reach_the_live_space() {
        let mut memory = testing::kernel_memory();
        let mut hw = RecordingHardware::default();
        let mut dir = Box::new(memory.new_address_space());
        unsafe { memory.switch_to(&mut dir, &mut hw) };

        // Each page lands in a page table neither directory has yet.
        for slot in 0..6 {
            let va = VirtualAddress::new(0xC040_0000 + slot * 0x40_0000);
            memory.map_kernel_page(va, frame(0x200 + slot * 0x100)).unwrap();
            assert_eq!(dir.entry(va), memory.vmm().kernel().entry(va));
        }
        assert_eq!(memory.vmm().needs_spare_tables(), 0);
        memory.switch_to_kernel(&mut hw);
    }
}
