//! # Virtual Memory Manager
//!
//! Owns the physical frame bitmap, the kernel's page directory and the
//! notion of which directory is live in CR3.
//!
//! Kernel mappings are copied into process directories by value when they
//! are cloned. To keep those copies current the manager counts kernel
//! mapping changes in a *generation*: a change is mirrored into the active
//! directory immediately, and any other directory is brought up to date when
//! it is switched to.
//!
//! Frames that are not mapped anywhere in the kernel's view (the frames of
//! an inactive address space) are reached through the two-slot copy window
//! at [`COPY_WINDOW`](kernel_info::memory::COPY_WINDOW).
//!
//! # Example
//! ```ignore
//! let mut vmm = Vmm::new(frames, WindowMapper, kernel_directory);
//! vmm.map_kernel_page(va, frame)?;
//! let clone = vmm.clone_directory(&mut process_dir, &mut pool);
//! ```

use crate::frame_alloc::FrameBitmap;
use crate::table_pool::TablePool;
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SIZE, PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{
    FrameAlloc, MapError, MapFlags, PageDirectory, PageTable, PagingHardware, PhysMapper, PtEntry,
    RawTable, Released, TableAlloc, TableFrame, WindowSlot,
};

/// Page tables kept ready for kernel mappings. A single kernel mapping may
/// take two: one for the kernel directory, one for the live directory.
pub const SPARE_TABLES: usize = 4;

/// Kernel memory manager.
pub struct Vmm<M: PhysMapper> {
    frames: FrameBitmap,
    mapper: M,
    kernel: PageDirectory,
    active: Option<NonNull<PageDirectory>>,
    /// Physical address last loaded into CR3.
    live: PhysicalAddress,
    spare: TablePool,
    generation: u64,
}

// Safety: `active` is only dereferenced while the owner guarantees the
// directory is alive (see `switch_to`).
unsafe impl<M: PhysMapper + Send> Send for Vmm<M> {}

impl<M: PhysMapper> Vmm<M> {
    /// Take over `kernel` as the kernel directory, assumed to be live.
    #[must_use]
    pub const fn new(frames: FrameBitmap, mapper: M, kernel: PageDirectory) -> Self {
        Self {
            frames,
            mapper,
            live: kernel.physical_address(),
            kernel,
            active: None,
            spare: TablePool::new(),
            generation: 0,
        }
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameBitmap {
        &self.frames
    }

    pub const fn frames_mut(&mut self) -> &mut FrameBitmap {
        &mut self.frames
    }

    #[must_use]
    pub const fn kernel(&self) -> &PageDirectory {
        &self.kernel
    }

    /// Number of kernel mapping changes so far.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The directory currently loaded in CR3.
    #[must_use]
    pub fn active(&self) -> &PageDirectory {
        match self.active {
            // SAFETY: kept alive by the contract of `switch_to`.
            Some(dir) => unsafe { dir.as_ref() },
            None => &self.kernel,
        }
    }

    /// Whether `dir` is the live directory.
    #[must_use]
    pub fn is_active(&self, dir: &PageDirectory) -> bool {
        self.live == dir.physical_address()
    }

    /// Reach the live directory through `dir` from now on, if `dir` is the
    /// live directory. Operations handed the live directory by `&mut` call
    /// this before anything can mirror a kernel mapping into it.
    pub fn adopt_active(&mut self, dir: &mut PageDirectory) {
        if self.active.is_some() && self.is_active(dir) {
            self.active = Some(NonNull::from(dir));
        }
    }

    /// Whether the kernel directory is live.
    #[must_use]
    pub const fn kernel_is_active(&self) -> bool {
        self.active.is_none()
    }

    /// Number of spare tables missing.
    #[must_use]
    pub const fn needs_spare_tables(&self) -> usize {
        SPARE_TABLES.saturating_sub(self.spare.len())
    }

    /// Give the manager a table block for future kernel mappings.
    ///
    /// # Safety
    /// See [`TablePool::push`].
    pub unsafe fn install_spare_table(&mut self, table: TableFrame<RawTable>) {
        unsafe { self.spare.push(table) };
    }

    /// Map a kernel page, shared with every address space.
    ///
    /// The mapping is mirrored into the active directory right away.
    ///
    /// # Errors
    /// [`MapError::Unaligned`] for an unaligned `va`.
    ///
    /// # Panics
    /// If `va` is already mapped, or a page table is needed and no spare
    /// table is left.
    pub fn map_kernel_page(&mut self, va: VirtualAddress, frame: PhysicalPage<Size4K>) -> Result<(), MapError> {
        let Self {
            frames,
            kernel,
            spare,
            active,
            generation,
            ..
        } = self;
        kernel.map_page(va, frame, MapFlags::KERNEL, frames, || spare.pop())?;
        *generation += 1;
        kernel.set_generation(*generation);

        if let Some(mut dir) = *active {
            // SAFETY: kept alive by the contract of `switch_to`.
            let dir = unsafe { dir.as_mut() };
            dir.sync_shared_page(kernel, va, || spare.pop());
            dir.set_generation(*generation);
        }
        Ok(())
    }

    /// Remove a kernel mapping and release its frame, which is returned.
    ///
    /// The live directory loses the mapping right away, the others at their
    /// next switch. TLB invalidation is left to the caller.
    pub fn unmap_kernel_page(&mut self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        let Self {
            frames,
            kernel,
            spare,
            active,
            generation,
            ..
        } = self;
        let frame = kernel.unmap_page(va, &mut *frames)?.frame()?;
        frames.free_frame(frame);
        *generation += 1;
        kernel.set_generation(*generation);

        if let Some(mut dir) = *active {
            // SAFETY: kept alive by the contract of `switch_to`.
            let dir = unsafe { dir.as_mut() };
            dir.sync_shared_page(kernel, va, || spare.pop());
            dir.set_generation(*generation);
        }
        Some(frame)
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
        tables: &mut impl TableAlloc,
    ) -> Result<(), MapError> {
        dir.map_page(va, frame, flags, &mut self.frames, || tables.alloc_table())
    }

    /// Back `pages` consecutive pages at `va` with fresh frames.
    ///
    /// # Errors
    /// See [`PageDirectory::map_page`]. Pages mapped before the failure stay
    /// mapped.
    ///
    /// # Panics
    /// If the frame bitmap's reserve cannot cover the regions the new
    /// frames open, see [`FrameBitmap::regions_to_open`].
    pub fn map_anonymous(
        &mut self,
        dir: &mut PageDirectory,
        va: VirtualAddress,
        pages: u32,
        flags: MapFlags,
        tables: &mut impl TableAlloc,
    ) -> Result<(), MapError> {
        for page in 0..pages {
            let at = page_at(va, page)?;
            let frame = self.frames.alloc_frame();
            if let Err(e) = self.map_page(dir, at, frame, flags, tables) {
                self.frames.free_frame(frame);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmap `pages` consecutive pages at `va`, releasing private frames.
    /// Returns the number of pages that were mapped.
    pub fn unmap_range(
        &mut self,
        dir: &mut PageDirectory,
        va: VirtualAddress,
        pages: u32,
        hw: &mut impl PagingHardware,
    ) -> usize {
        let live = self.is_active(dir);
        let mut removed = 0;
        for page in 0..pages {
            let Ok(at) = page_at(va, page) else {
                break;
            };
            if dir.unmap_page(at, &mut self.frames).is_some() {
                removed += 1;
                if live {
                    hw.invalidate_page(at);
                }
            }
        }
        removed
    }

    /// Page table of the live directory that covers the copy window.
    fn window_table(&self) -> Option<NonNull<PageTable>> {
        self.active()
            .table_ptr(WindowSlot::First.address().directory_index())
    }

    /// Run `f` on the contents of `frame`.
    pub fn with_frame<R>(&mut self, frame: PhysicalPage<Size4K>, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let window = self.window_table();
        // SAFETY: the slot is released before returning and the pointer
        // does not escape.
        unsafe {
            let page = self.mapper.map_window(WindowSlot::First, frame, window);
            let result = f(page.cast::<[u8; PAGE_SIZE]>().as_mut());
            self.mapper.unmap_window(WindowSlot::First, window);
            result
        }
    }

    /// Copy the contents of one frame into another.
    pub fn copy_frame(&mut self, src: PhysicalPage<Size4K>, dst: PhysicalPage<Size4K>) {
        let window = self.window_table();
        // SAFETY: as in `with_frame`; the two slots never alias each other.
        unsafe { copy_through_window(&mut self.mapper, window, src, dst) };
    }

    /// Copy `bytes` into `dir` at `va`.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if part of the range is not mapped; bytes
    /// before that page have been written.
    pub fn write_bytes(&mut self, dir: &PageDirectory, va: VirtualAddress, bytes: &[u8]) -> Result<(), MapError> {
        let mut done = 0;
        while done < bytes.len() {
            let at = offset_by(va, done)?;
            let (frame, offset) = resolve(dir, at)?;
            let n = (PAGE_SIZE - offset).min(bytes.len() - done);
            self.with_frame(frame, |page| page[offset..offset + n].copy_from_slice(&bytes[done..done + n]));
            done += n;
        }
        Ok(())
    }

    /// Copy from `dir` at `va` into `buf`.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if part of the range is not mapped.
    pub fn read_bytes(&mut self, dir: &PageDirectory, va: VirtualAddress, buf: &mut [u8]) -> Result<(), MapError> {
        let mut done = 0;
        while done < buf.len() {
            let at = offset_by(va, done)?;
            let (frame, offset) = resolve(dir, at)?;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            self.with_frame(frame, |page| buf[done..done + n].copy_from_slice(&page[offset..offset + n]));
            done += n;
        }
        Ok(())
    }

    /// Copy `len` bytes at `va` from one address space into the same
    /// addresses of another, frame to frame through the copy window.
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
        let window = self.window_table();
        let mut done = 0;
        while done < len {
            let at = offset_by(va, done)?;
            let (from, offset) = resolve(src, at)?;
            let (to, _) = resolve(dst, at)?;
            let n = (PAGE_SIZE - offset).min(len - done);
            // SAFETY: both slots are released before the next iteration.
            unsafe {
                let a = self.mapper.map_window(WindowSlot::First, from, window);
                let b = self.mapper.map_window(WindowSlot::Second, to, window);
                core::ptr::copy_nonoverlapping(a.add(offset).as_ptr(), b.add(offset).as_ptr(), n);
                self.mapper.unmap_window(WindowSlot::Second, window);
                self.mapper.unmap_window(WindowSlot::First, window);
            }
            done += n;
        }
        Ok(())
    }

    /// A new address space holding the current kernel mappings.
    ///
    /// # Panics
    /// If `tables` runs short; it needs [`PageDirectory::present_tables`]
    /// of the kernel directory plus one.
    pub fn clone_kernel(&mut self, tables: &mut impl TableAlloc) -> PageDirectory {
        let window = self.window_table();
        let Self {
            frames,
            mapper,
            kernel,
            ..
        } = self;
        // SAFETY: the kernel directory holds no private frames, so the
        // window is never used here.
        let mut dir = kernel.clone_into(frames, tables, |src, dst| unsafe {
            copy_through_window(mapper, window, src, dst);
        });
        dir.set_generation(self.generation);
        dir
    }

    /// Duplicate `source`, copying its private frames eagerly.
    ///
    /// # Panics
    /// If `tables` runs short; it needs `source.present_tables() + 1`.
    /// If the frame bitmap's reserve cannot cover the regions the copies
    /// open, see [`FrameBitmap::regions_to_open`].
    pub fn clone_directory(&mut self, source: &mut PageDirectory, tables: &mut impl TableAlloc) -> PageDirectory {
        self.adopt_active(source);
        let window = self.window_table();
        let Self { frames, mapper, .. } = self;
        // SAFETY: each frame copy releases its window slots before the next.
        source.clone_into(frames, tables, |src, dst| unsafe {
            copy_through_window(mapper, window, src, dst);
        })
    }

    /// Tear down `dir`. Its tables and directory block go to `tables`.
    ///
    /// # Panics
    /// If `dir` is the live directory.
    pub fn free_directory(&mut self, dir: PageDirectory, tables: &mut impl TableAlloc) -> Released {
        assert!(
            !self.is_active(&dir),
            "attempt to free the active page directory {}",
            dir.physical_address()
        );
        // SAFETY: not live, checked above.
        unsafe { dir.free(&mut self.frames, tables) }
    }

    /// Tables [`switch_to`](Self::switch_to) will need to bring `dir` up
    /// to date with the kernel.
    #[must_use]
    pub fn tables_for_switch(&self, dir: &PageDirectory) -> usize {
        if dir.generation() == self.generation {
            0
        } else {
            dir.missing_shared_tables(&self.kernel)
        }
    }

    /// Make `dir` the live address space.
    ///
    /// Kernel mappings added since `dir` last saw them are synchronised
    /// first, with page tables taken from `tables`.
    ///
    /// # Safety
    /// `dir` must stay at its address and alive until another directory is
    /// switched to. Interrupts must be disabled.
    pub unsafe fn switch_to(
        &mut self,
        dir: &mut PageDirectory,
        hw: &mut impl PagingHardware,
        tables: &mut impl TableAlloc,
    ) {
        if dir.generation() != self.generation {
            let changed = dir.sync_shared(&self.kernel, tables);
            dir.set_generation(self.generation);
            log::trace!("synchronised {changed} kernel entries into {}", dir.physical_address());
        }
        self.active = Some(NonNull::from(&mut *dir));
        self.live = dir.physical_address();
        unsafe { hw.load_directory(self.live) };
    }

    /// Make the kernel directory live.
    pub fn switch_to_kernel(&mut self, hw: &mut impl PagingHardware) {
        self.active = None;
        self.live = self.kernel.physical_address();
        // SAFETY: the kernel directory maps all kernel code and data.
        unsafe { hw.load_directory(self.kernel.physical_address()) };
    }

    /// Install a table for the copy window in the kernel directory.
    ///
    /// # Safety
    /// See [`PageDirectory::install_table`].
    pub unsafe fn install_window_table(&mut self, table: TableFrame<RawTable>) {
        let index = WindowSlot::First.address().directory_index();
        unsafe { self.kernel.install_table(index, table, MapFlags::KERNEL) };
        self.generation += 1;
        self.kernel.set_generation(self.generation);
    }

    /// Whether the kernel directory has a table for the copy window.
    #[must_use]
    pub fn has_window_table(&self) -> bool {
        self.kernel
            .table(WindowSlot::First.address().directory_index())
            .is_some()
    }
}

/// Copy one frame into another through the two window slots.
///
/// # Safety
/// Both slots must be free; `window` must be the live window table.
unsafe fn copy_through_window<M: PhysMapper>(
    mapper: &mut M,
    window: Option<NonNull<PageTable>>,
    src: PhysicalPage<Size4K>,
    dst: PhysicalPage<Size4K>,
) {
    unsafe {
        let a = mapper.map_window(WindowSlot::First, src, window);
        let b = mapper.map_window(WindowSlot::Second, dst, window);
        core::ptr::copy_nonoverlapping(a.as_ptr(), b.as_ptr(), PAGE_SIZE);
        mapper.unmap_window(WindowSlot::Second, window);
        mapper.unmap_window(WindowSlot::First, window);
    }
}

fn page_at(va: VirtualAddress, page: u32) -> Result<VirtualAddress, MapError> {
    page.checked_mul(Size4K::SIZE)
        .and_then(|offset| va.checked_add(offset))
        .ok_or(MapError::NotMapped(va))
}

fn offset_by(va: VirtualAddress, bytes: usize) -> Result<VirtualAddress, MapError> {
    u32::try_from(bytes)
        .ok()
        .and_then(|offset| va.checked_add(offset))
        .ok_or(MapError::NotMapped(va))
}

fn resolve(dir: &PageDirectory, va: VirtualAddress) -> Result<(PhysicalPage<Size4K>, usize), MapError> {
    let frame = dir
        .entry(va)
        .and_then(PtEntry::frame)
        .ok_or(MapError::NotMapped(va))?;
    Ok((frame, va.offset::<Size4K>().as_usize()))
}
