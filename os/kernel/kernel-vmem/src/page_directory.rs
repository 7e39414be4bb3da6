//! # Address spaces
//!
//! A [`PageDirectory`] is one address space: the hardware directory table
//! plus the bookkeeping the kernel needs to edit it.

use crate::{
    DirectoryTable, FrameAlloc, FrameOwnership, MapError, MapFlags, PageTable, PdEntry, PtEntry,
    RawTable, TableAlloc, TableFrame,
};
use core::fmt;
use core::ptr::NonNull;
use kernel_memory_addresses::{
    DirectoryIndex, PhysicalAddress, PhysicalPage, Size4K, Size4M, TableIndex, VirtualAddress,
    PageSize,
};

/// One address space.
///
/// ```text
///  directory (hw)         tables (shadow)           full
///  [PDE 0] ─phys─► PT     [Some(virt, phys)] ─► PT   [false]
///  [PDE 1]  ·             [None]                     [false]
///  ...                    ...                        ...
/// ```
///
/// The directory table and every page table are owned by this value and
/// released by [`free`](Self::free). Leaf frames are owned only when tagged
/// [`FrameOwnership::OwnedPrivate`].
pub struct PageDirectory {
    directory: TableFrame<DirectoryTable>,
    tables: [Option<TableFrame<PageTable>>; DirectoryIndex::COUNT],
    full: [bool; DirectoryIndex::COUNT],
    generation: u64,
}

// Safety: the structures behind the raw pointers are exclusively owned by
// this value and only reached through `&self`/`&mut self`.
unsafe impl Send for PageDirectory {}

/// What [`PageDirectory::free`] gave back.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Released {
    pub frames: usize,
    pub tables: usize,
}

impl PageDirectory {
    /// Take `frame` as the directory table of a new, empty address space.
    ///
    /// # Safety
    /// `frame` must satisfy the contract of [`TableFrame::new`] and be owned
    /// by nobody else.
    #[must_use]
    pub unsafe fn new(frame: TableFrame<RawTable>) -> Self {
        unsafe { frame.zero() };
        Self {
            directory: frame.cast(),
            tables: [const { None }; DirectoryIndex::COUNT],
            full: [false; DirectoryIndex::COUNT],
            generation: 0,
        }
    }

    /// The value to load into CR3.
    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        self.directory.phys().base()
    }

    #[inline]
    fn hw(&self) -> &DirectoryTable {
        // SAFETY: owned by `self`, valid per construction.
        unsafe { self.directory.virt().as_ref() }
    }

    #[inline]
    fn hw_mut(&mut self) -> &mut DirectoryTable {
        // SAFETY: owned by `self`, valid per construction.
        unsafe { self.directory.virt().as_mut() }
    }

    #[inline]
    #[must_use]
    pub fn directory_entry(&self, index: DirectoryIndex) -> PdEntry {
        self.hw().get(index)
    }

    /// The page table for `index`, through its shadow virtual address.
    #[inline]
    #[must_use]
    pub fn table(&self, index: DirectoryIndex) -> Option<&PageTable> {
        // SAFETY: installed tables are owned by `self`.
        self.tables[index.as_usize()].map(|t| unsafe { t.virt().as_ref() })
    }

    #[inline]
    fn table_mut(&mut self, index: DirectoryIndex) -> Option<&mut PageTable> {
        // SAFETY: installed tables are owned by `self`.
        self.tables[index.as_usize()].map(|t| unsafe { t.virt().as_mut() })
    }

    /// Raw pointer to the page table for `index`, for code that edits the
    /// table without borrowing the directory.
    #[inline]
    #[must_use]
    pub fn table_ptr(&self, index: DirectoryIndex) -> Option<NonNull<PageTable>> {
        self.tables[index.as_usize()].map(|t| t.virt())
    }

    /// Whether every slot of the table for `index` is present.
    #[inline]
    #[must_use]
    pub const fn is_table_full(&self, index: DirectoryIndex) -> bool {
        self.full[index.as_usize()]
    }

    /// Kernel mapping generation this directory's shared entries reflect.
    #[inline]
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub const fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Number of installed page tables.
    #[must_use]
    pub fn present_tables(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }

    /// The present leaf entry mapping `va`, if any.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PtEntry> {
        let entry = self.table(va.directory_index())?.get(va.table_index());
        entry.is_present().then_some(entry)
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.entry(va).is_some()
    }

    /// Physical address `va` resolves to.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let frame = self.entry(va)?.frame()?;
        Some(frame.join(va.offset::<Size4K>()))
    }

    /// Every present leaf mapping, in ascending virtual order.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtualAddress, PtEntry)> + '_ {
        (0..DirectoryIndex::COUNT).flat_map(move |di| {
            let di = DirectoryIndex::from_usize(di);
            self.table(di).into_iter().flat_map(move |table| {
                (0..TableIndex::COUNT).filter_map(move |ti| {
                    let ti = TableIndex::from_usize(ti);
                    let entry = table.get(ti);
                    entry
                        .is_present()
                        .then(|| (VirtualAddress::from_indices(di, ti), entry))
                })
            })
        })
    }

    /// Install `frame` as the (empty) page table for `index`.
    ///
    /// # Safety
    /// `frame` must satisfy the contract of [`TableFrame::new`] and be owned
    /// by nobody else.
    ///
    /// # Panics
    /// If the slot already holds a table.
    pub unsafe fn install_table(
        &mut self,
        index: DirectoryIndex,
        frame: TableFrame<RawTable>,
        flags: MapFlags,
    ) {
        assert!(
            self.tables[index.as_usize()].is_none(),
            "directory slot {} already holds a page table",
            index.as_usize()
        );
        unsafe { frame.zero() };
        self.tables[index.as_usize()] = Some(frame.cast());
        self.full[index.as_usize()] = false;
        self.hw_mut().set(index, PdEntry::table(frame.phys(), flags));
    }

    /// Map the page at `va` to `frame`.
    ///
    /// A missing page table is created from `new_table` when
    /// `flags.create_table` is set. The frame is recorded as used in `frames`.
    ///
    /// # Errors
    /// [`MapError::MissingTable`] when no table exists and creation was not
    /// requested; [`MapError::Unaligned`] for an unaligned `va`.
    ///
    /// # Panics
    /// If `va` is already mapped, or `new_table` has no memory left.
    pub fn map_page<F: FrameAlloc>(
        &mut self,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        flags: MapFlags,
        frames: &mut F,
        new_table: impl FnOnce() -> Option<TableFrame<RawTable>>,
    ) -> Result<(), MapError> {
        if !va.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned(va));
        }
        let di = va.directory_index();
        let ti = va.table_index();

        if self.tables[di.as_usize()].is_none() {
            if !flags.create_table {
                return Err(MapError::MissingTable(va));
            }
            let table = new_table().unwrap_or_else(|| panic!("no memory for a page table covering {va}"));
            // SAFETY: fresh block from the table allocator.
            unsafe { self.install_table(di, table, flags) };
        } else {
            let pde = self.hw().get(di).permit(flags);
            self.hw_mut().set(di, pde);
        }

        let Some(table) = self.table_mut(di) else {
            unreachable!("table was installed above");
        };
        let existing = table.get(ti);
        assert!(
            !existing.is_present(),
            "double mapping of {va}: already maps {:?}",
            existing.frame()
        );
        table.set(ti, PtEntry::map(frame, flags));
        let now_full = table.is_full();
        self.full[di.as_usize()] = now_full;
        frames.mark_used(frame);
        Ok(())
    }

    /// Remove the mapping at `va`, releasing the frame if it was private.
    ///
    /// Returns the removed entry. The caller is responsible for TLB
    /// invalidation if this directory is live.
    pub fn unmap_page<F: FrameAlloc>(&mut self, va: VirtualAddress, frames: &mut F) -> Option<PtEntry> {
        let di = va.directory_index();
        let table = self.table_mut(di)?;
        let entry = table.get(va.table_index());
        let frame = entry.frame()?;
        table.set(va.table_index(), PtEntry::zero());
        self.full[di.as_usize()] = false;
        if entry.ownership() == FrameOwnership::OwnedPrivate {
            frames.free_frame(frame);
        }
        Some(entry)
    }

    /// Lowest address in `[start, end)` that begins a run of `pages`
    /// unmapped pages. Tables flagged full are skipped without inspection.
    #[must_use]
    pub fn find_unmapped(&self, start: VirtualAddress, end: u64, pages: u32) -> Option<VirtualAddress> {
        const PAGE: u64 = Size4K::SIZE as u64;
        const SPAN: u64 = Size4M::SIZE as u64;

        if pages == 0 {
            return Some(start);
        }
        let end = end.min(1 << 32);
        let mut va = u64::from(start.as_u32()).next_multiple_of(PAGE);
        let mut run_start = va;
        let mut run = 0u64;

        while va < end {
            #[allow(clippy::cast_possible_truncation)]
            let addr = VirtualAddress::new(va as u32);
            let di = addr.directory_index();
            let table_end = ((va / SPAN) + 1) * SPAN;

            if self.full[di.as_usize()] {
                run = 0;
                va = table_end;
                continue;
            }

            if self.tables[di.as_usize()].is_none() {
                let stop = table_end.min(end);
                if run == 0 {
                    run_start = va;
                }
                run += (stop - va) / PAGE;
                va = stop;
            } else if self.is_mapped(addr) {
                run = 0;
                va += PAGE;
            } else {
                if run == 0 {
                    run_start = va;
                }
                run += 1;
                va += PAGE;
            }

            if run >= u64::from(pages) {
                #[allow(clippy::cast_possible_truncation)]
                return Some(VirtualAddress::new(run_start as u32));
            }
        }
        None
    }

    /// Number of tables [`sync_shared`](Self::sync_shared) would have to
    /// create to mirror `kernel`.
    #[must_use]
    pub fn missing_shared_tables(&self, kernel: &Self) -> usize {
        self.tables
            .iter()
            .zip(kernel.tables.iter())
            .filter(|(own, theirs)| own.is_none() && theirs.is_some())
            .count()
    }

    /// Make every kernel-shared entry of this directory match `kernel`.
    ///
    /// Private entries are never touched. Shared entries that the kernel
    /// no longer maps are removed. Returns the number of changed entries.
    ///
    /// # Panics
    /// If `tables` cannot supply a missing page table.
    pub fn sync_shared<T: TableAlloc>(&mut self, kernel: &Self, tables: &mut T) -> usize {
        let mut changed = 0;
        for di in 0..DirectoryIndex::COUNT {
            let index = DirectoryIndex::from_usize(di);
            if kernel.tables[di].is_none() {
                continue;
            }
            for ti in 0..TableIndex::COUNT {
                let va = VirtualAddress::from_indices(index, TableIndex::from_usize(ti));
                if self.sync_shared_page(kernel, va, || tables.alloc_table()) {
                    changed += 1;
                }
            }
        }
        self.generation = kernel.generation;
        changed
    }

    /// Mirror the kernel's mapping of the single page at `va`.
    ///
    /// Returns whether the entry changed.
    ///
    /// # Panics
    /// If a page table has to be created and `new_table` has none.
    pub fn sync_shared_page(
        &mut self,
        kernel: &Self,
        va: VirtualAddress,
        new_table: impl FnOnce() -> Option<TableFrame<RawTable>>,
    ) -> bool {
        let di = va.directory_index();
        let ti = va.table_index();
        let Some(source) = kernel.table(di) else {
            return false;
        };
        let theirs = source.get(ti);
        let wanted = if theirs.is_present() && theirs.ownership() == FrameOwnership::SharedWithKernel {
            theirs
        } else {
            PtEntry::zero()
        };

        if self.tables[di.as_usize()].is_none() {
            if !wanted.is_present() {
                return false;
            }
            let table = new_table().unwrap_or_else(|| panic!("no memory for a page table covering {va}"));
            // SAFETY: fresh block from the table allocator.
            unsafe { self.install_table(di, table, MapFlags::KERNEL) };
        }

        let Some(table) = self.table_mut(di) else {
            unreachable!("table was installed above");
        };
        let ours = table.get(ti);
        if ours == wanted || (ours.is_present() && ours.ownership() == FrameOwnership::OwnedPrivate) {
            return false;
        }
        table.set(ti, wanted);
        let now_full = table.is_full();
        self.full[di.as_usize()] = now_full;
        true
    }

    /// Build a new address space with the same mappings.
    ///
    /// Every present page table gets a fresh copy. Entries tagged
    /// [`FrameOwnership::SharedWithKernel`] are copied by value, so both
    /// spaces keep referring to the kernel's frames. Private frames are
    /// duplicated eagerly: a new frame is taken from `frames` and
    /// `copy_frame(source, destination)` fills it.
    ///
    /// # Panics
    /// If `tables` runs out of memory, or `frames` out of frames.
    pub fn clone_into<F: FrameAlloc, T: TableAlloc>(
        &self,
        frames: &mut F,
        tables: &mut T,
        mut copy_frame: impl FnMut(PhysicalPage<Size4K>, PhysicalPage<Size4K>),
    ) -> Self {
        let root = tables
            .alloc_table()
            .unwrap_or_else(|| panic!("no memory for a page directory"));
        // SAFETY: fresh block from the table allocator.
        let mut clone = unsafe { Self::new(root) };

        for di in 0..DirectoryIndex::COUNT {
            let index = DirectoryIndex::from_usize(di);
            let Some(source) = self.tables[di] else {
                continue;
            };

            // Detach from the source table: the copy window may live in it.
            // SAFETY: owned by `self`.
            let entries = unsafe { source.virt().as_ref() }.snapshot();

            let frame = tables
                .alloc_table()
                .unwrap_or_else(|| panic!("no memory for a page table"));
            // SAFETY: fresh block from the table allocator, zeroed before use.
            unsafe { frame.zero() };
            let target: TableFrame<PageTable> = frame.cast();
            // SAFETY: exclusively owned by `clone` from here on.
            let table = unsafe { target.virt().as_mut() };

            for (ti, entry) in entries.iter().enumerate().filter(|(_, e)| e.is_present()) {
                let ti = TableIndex::from_usize(ti);
                match (entry.ownership(), entry.frame()) {
                    (FrameOwnership::SharedWithKernel, _) | (_, None) => table.set(ti, *entry),
                    (FrameOwnership::OwnedPrivate, Some(src)) => {
                        let dst = frames.alloc_frame();
                        copy_frame(src, dst);
                        table.set(ti, entry.with_frame(dst));
                    }
                }
            }

            clone.tables[di] = Some(target);
            clone.generation = self.generation;
            clone.full[di] = self.full[di];
            let pde = self.hw().get(index).with_table_frame(target.phys());
            clone.hw_mut().set(index, pde);
        }

        log::trace!(
            "cloned {} into {} ({} tables)",
            self.physical_address(),
            clone.physical_address(),
            clone.present_tables()
        );
        clone
    }

    /// Tear the address space down.
    ///
    /// Private frames go back to `frames`; every page table and the
    /// directory table itself go back to `tables`. Kernel frames are left
    /// alone.
    ///
    /// # Safety
    /// The directory must not be live in the CPU.
    pub unsafe fn free<F: FrameAlloc, T: TableAlloc>(self, frames: &mut F, tables: &mut T) -> Released {
        let mut released = Released::default();
        for table in self.tables.iter().flatten() {
            // SAFETY: owned by `self`.
            let entries = unsafe { table.virt().as_ref() };
            for ti in 0..TableIndex::COUNT {
                let entry = entries.get(TableIndex::from_usize(ti));
                if let (Some(frame), FrameOwnership::OwnedPrivate) = (entry.frame(), entry.ownership()) {
                    frames.free_frame(frame);
                    released.frames += 1;
                }
            }
            // SAFETY: no longer referenced; `self` is consumed.
            unsafe { tables.free_table(table.cast()) };
            released.tables += 1;
        }
        // SAFETY: as above.
        unsafe { tables.free_table(self.directory.cast()) };
        released.tables += 1;
        log::trace!(
            "released address space {}: {} frames, {} tables",
            self.physical_address(),
            released.frames,
            released.tables
        );
        released
    }
}

impl fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageDirectory")
            .field("physical", &self.physical_address())
            .field("tables", &self.present_tables())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    /// Page-aligned host blocks standing in for table memory, with made-up
    /// physical addresses starting at 64 MiB.
    #[derive(Default)]
    struct HostTables {
        next: u32,
        live: BTreeMap<u32, Box<RawTable>>,
        freed: usize,
    }

    unsafe impl TableAlloc for HostTables {
        fn alloc_table(&mut self) -> Option<TableFrame<RawTable>> {
            let mut block = Box::new(RawTable([0xAA; 4096]));
            let number = 0x4000 + self.next;
            self.next += 1;
            let virt = NonNull::from(&mut *block);
            self.live.insert(number, block);
            Some(unsafe { TableFrame::new(virt, PhysicalPage::from_frame_number(number)) })
        }

        unsafe fn free_table(&mut self, table: TableFrame<RawTable>) {
            assert!(self.live.remove(&table.phys().frame_number()).is_some());
            self.freed += 1;
        }
    }

    #[derive(Default)]
    struct Frames {
        used: BTreeSet<u32>,
    }

    impl FrameAlloc for Frames {
        fn alloc_frame(&mut self) -> PhysicalPage<Size4K> {
            let n = (0x100..).find(|n| !self.used.contains(n)).unwrap();
            self.used.insert(n);
            PhysicalPage::from_frame_number(n)
        }

        fn mark_used(&mut self, frame: PhysicalPage<Size4K>) {
            self.used.insert(frame.frame_number());
        }

        fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
            assert!(self.used.remove(&frame.frame_number()), "freed a free frame");
        }
    }

    fn empty(tables: &mut HostTables) -> PageDirectory {
        unsafe { PageDirectory::new(tables.alloc_table().unwrap()) }
    }

    fn frame(n: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(n)
    }

    #[test]
    fn map_page_installs_table_and_leaf() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut dir = empty(&mut tables);

        let va = VirtualAddress::new(0x0804_8000);
        dir.map_page(va, frame(0x300), MapFlags::PRIVATE, &mut frames, || tables.alloc_table())
            .unwrap();

        assert_eq!(dir.present_tables(), 1);
        assert!(dir.directory_entry(va.directory_index()).is_present());
        assert_eq!(dir.entry(va).and_then(PtEntry::frame), Some(frame(0x300)));
        assert_eq!(
            dir.translate(VirtualAddress::new(0x0804_8123)),
            Some(PhysicalAddress::new(0x0030_0123))
        );
        assert!(frames.used.contains(&0x300));
        assert_eq!(dir.translate(VirtualAddress::new(0x0804_9000)), None);
    }

    #[test]
    #[should_panic(expected = "double mapping")]
    fn double_mapping_panics() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut dir = empty(&mut tables);
        let va = VirtualAddress::new(0x1000);
        dir.map_page(va, frame(1), MapFlags::PRIVATE, &mut frames, || tables.alloc_table())
            .unwrap();
        let _ = dir.map_page(va, frame(2), MapFlags::PRIVATE, &mut frames, || tables.alloc_table());
    }

    #[test]
    fn missing_table_is_reported_when_creation_is_off() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut dir = empty(&mut tables);
        let va = VirtualAddress::new(0x40_0000);
        let result = dir.map_page(
            va,
            frame(1),
            MapFlags::PRIVATE.without_table_creation(),
            &mut frames,
            || panic!("must not allocate"),
        );
        assert_eq!(result, Err(MapError::MissingTable(va)));
        assert!(frames.used.is_empty());
    }

    #[test]
    fn unaligned_addresses_are_rejected() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut dir = empty(&mut tables);
        let va = VirtualAddress::new(0x1001);
        assert_eq!(
            dir.map_page(va, frame(1), MapFlags::PRIVATE, &mut frames, || tables.alloc_table()),
            Err(MapError::Unaligned(va))
        );
    }

    #[test]
    fn full_tables_are_flagged_and_skipped() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut dir = empty(&mut tables);

        let base = 0x40_0000u32;
        for i in 0..1024 {
            let va = VirtualAddress::new(base + i * 4096);
            dir.map_page(va, frame(0x1000 + i), MapFlags::PRIVATE, &mut frames, || tables.alloc_table())
                .unwrap();
        }
        let di = VirtualAddress::new(base).directory_index();
        assert!(dir.is_table_full(di));
        assert_eq!(
            dir.find_unmapped(VirtualAddress::new(base), 0x100_0000, 4),
            Some(VirtualAddress::new(0x80_0000))
        );

        dir.unmap_page(VirtualAddress::new(base + 0x5000), &mut frames).unwrap();
        assert!(!dir.is_table_full(di));
        assert_eq!(
            dir.find_unmapped(VirtualAddress::new(base), 0x100_0000, 1),
            Some(VirtualAddress::new(base + 0x5000))
        );
    }

    #[test]
    fn find_unmapped_spans_tables() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut dir = empty(&mut tables);
        // Leave only the last page of the first table free, then ask for a run
        // that must continue into the untouched second table.
        for i in 0..1023 {
            let va = VirtualAddress::new(i * 4096);
            dir.map_page(va, frame(0x2000 + i), MapFlags::PRIVATE, &mut frames, || tables.alloc_table())
                .unwrap();
        }
        assert_eq!(
            dir.find_unmapped(VirtualAddress::zero(), 0x80_0000, 3),
            Some(VirtualAddress::new(0x3F_F000))
        );
        assert_eq!(dir.find_unmapped(VirtualAddress::zero(), 0x40_0000, 3), None);
    }

    #[test]
    fn unmap_releases_only_private_frames() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut dir = empty(&mut tables);
        let private = VirtualAddress::new(0x1000);
        let shared = VirtualAddress::new(0xC000_0000);
        dir.map_page(private, frame(5), MapFlags::PRIVATE, &mut frames, || tables.alloc_table())
            .unwrap();
        dir.map_page(shared, frame(6), MapFlags::KERNEL, &mut frames, || tables.alloc_table())
            .unwrap();

        assert!(dir.unmap_page(private, &mut frames).is_some());
        assert!(dir.unmap_page(shared, &mut frames).is_some());
        assert!(!frames.used.contains(&5));
        assert!(frames.used.contains(&6));
        assert!(dir.unmap_page(private, &mut frames).is_none());
    }

    #[test]
    fn clone_shares_kernel_frames_and_copies_private_frames() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut dir = empty(&mut tables);
        let kernel_va = VirtualAddress::new(0xC000_0000);
        let user_va = VirtualAddress::new(0x0040_1000);
        dir.map_page(kernel_va, frame(0x10), MapFlags::KERNEL, &mut frames, || tables.alloc_table())
            .unwrap();
        dir.map_page(user_va, frame(0x11), MapFlags::PRIVATE, &mut frames, || tables.alloc_table())
            .unwrap();

        let mut copies = Vec::new();
        let clone = dir.clone_into(&mut frames, &mut tables, |src, dst| copies.push((src, dst)));

        assert_ne!(clone.physical_address(), dir.physical_address());
        assert_eq!(clone.present_tables(), 2);
        assert_ne!(
            clone.directory_entry(kernel_va.directory_index()).table_frame(),
            dir.directory_entry(kernel_va.directory_index()).table_frame(),
            "page tables are never shared"
        );
        assert_eq!(clone.entry(kernel_va), dir.entry(kernel_va));

        let copied = clone.entry(user_va).and_then(PtEntry::frame).unwrap();
        assert_ne!(copied, frame(0x11));
        assert_eq!(copies, vec![(frame(0x11), copied)]);
        assert_eq!(clone.entry(user_va).unwrap().ownership(), FrameOwnership::OwnedPrivate);
    }

    #[test]
    fn freeing_a_clone_never_releases_kernel_frames() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut kernel = empty(&mut tables);
        for i in 0..8 {
            let va = VirtualAddress::new(0xC000_0000 + i * 4096);
            kernel
                .map_page(va, frame(0x10 + i), MapFlags::KERNEL, &mut frames, || tables.alloc_table())
                .unwrap();
        }
        let mut process = kernel.clone_into(&mut frames, &mut tables, |_, _| {});
        process
            .map_page(VirtualAddress::new(0x1000), frames.alloc_frame(), MapFlags::PRIVATE, &mut frames, || {
                tables.alloc_table()
            })
            .unwrap();
        let used_before = frames.used.len();
        let live_before = tables.live.len();

        let released = unsafe { process.free(&mut frames, &mut tables) };

        assert_eq!(released, Released { frames: 1, tables: 3 });
        assert_eq!(frames.used.len(), used_before - 1);
        for i in 0..8 {
            assert!(frames.used.contains(&(0x10 + i)));
        }
        assert_eq!(tables.live.len(), live_before - 3);
        assert!(kernel.is_mapped(VirtualAddress::new(0xC000_0000)));
    }

    #[test]
    fn sync_shared_mirrors_kernel_growth_and_keeps_private_entries() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut kernel = empty(&mut tables);
        kernel
            .map_page(VirtualAddress::new(0xD000_0000), frame(0x20), MapFlags::KERNEL, &mut frames, || {
                tables.alloc_table()
            })
            .unwrap();
        let mut process = kernel.clone_into(&mut frames, &mut tables, |_, _| {});
        process
            .map_page(VirtualAddress::new(0x1000), frame(0x30), MapFlags::PRIVATE, &mut frames, || {
                tables.alloc_table()
            })
            .unwrap();

        // The kernel grows inside an existing table and into a new one.
        for va in [0xD000_1000u32, 0xD040_0000] {
            kernel
                .map_page(VirtualAddress::new(va), frames.alloc_frame(), MapFlags::KERNEL, &mut frames, || {
                    tables.alloc_table()
                })
                .unwrap();
        }
        kernel.set_generation(7);
        assert_eq!(process.missing_shared_tables(&kernel), 1);

        let changed = process.sync_shared(&kernel, &mut tables);

        assert_eq!(changed, 2);
        assert_eq!(process.generation(), 7);
        for va in [0xD000_0000u32, 0xD000_1000, 0xD040_0000] {
            let va = VirtualAddress::new(va);
            assert_eq!(process.entry(va), kernel.entry(va));
        }
        assert_eq!(process.entry(VirtualAddress::new(0x1000)).and_then(PtEntry::frame), Some(frame(0x30)));
        assert_eq!(process.missing_shared_tables(&kernel), 0);
        assert_eq!(process.sync_shared(&kernel, &mut tables), 0);
    }

    #[test]
    fn mappings_iterate_in_address_order() {
        let mut tables = HostTables::default();
        let mut frames = Frames::default();
        let mut dir = empty(&mut tables);
        for va in [0xC000_0000u32, 0x2000, 0x40_0000] {
            dir.map_page(VirtualAddress::new(va), frames.alloc_frame(), MapFlags::PRIVATE, &mut frames, || {
                tables.alloc_table()
            })
            .unwrap();
        }
        let vas: Vec<u32> = dir.mappings().map(|(va, _)| va.as_u32()).collect();
        assert_eq!(vas, vec![0x2000, 0x40_0000, 0xC000_0000]);
    }
}
