//! # Physical Frame Allocator
//!
//! Physical memory is tracked per 4 MiB region. Each region that was ever
//! touched owns a [`RegionBitmap`] of 1024 bits, one per 4 KiB frame:
//!
//! ```text
//! regions[0]    ──► [u32; 32] + full   frames 0x0000_0000 ‥ 0x003F_FFFF
//! regions[1]    ──► [u32; 32] + full   frames 0x0040_0000 ‥ 0x007F_FFFF
//! regions[2]        (absent: never touched, every frame free)
//! ...
//! regions[1023]
//! ```
//!
//! Bitmaps for new regions are taken from a reserve so that marking a frame
//! never has to call into the heap, which may itself be in the middle of
//! growing. The reserve is a stack of spare blocks linked through their own
//! memory. The owner keeps at least [`RESERVE_MINIMUM`] blocks in it and
//! stocks up with [`FrameBitmap::regions_to_open`] before operations that
//! allocate many frames at once.

use core::ptr::NonNull;
use kernel_info::boot::BootMemoryMap;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_vmem::FrameAlloc;

/// Number of 4 MiB regions in the 32-bit physical address space.
pub const REGION_COUNT: usize = 1024;

/// Frames per region.
pub const FRAMES_PER_REGION: usize = 1024;

const WORD_BITS: usize = u32::BITS as usize;
const WORDS_PER_REGION: usize = FRAMES_PER_REGION / WORD_BITS;

/// Region bitmaps the reserve is topped up to between operations.
pub const RESERVE_MINIMUM: usize = 2;

/// Occupancy of the 1024 frames of one 4 MiB region.
#[derive(Clone, Debug)]
#[repr(C)]
pub struct RegionBitmap {
    words: [u32; WORDS_PER_REGION],
    full: bool,
}

impl RegionBitmap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [0; WORDS_PER_REGION],
            full: false,
        }
    }

    #[inline]
    const fn is_set(&self, bit: usize) -> bool {
        self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    /// Number of used frames in this region.
    #[must_use]
    pub fn used(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.full
    }
}

impl Default for RegionBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// The physical page allocator.
///
/// A bit is set exactly while the frame is referenced by some page-table
/// entry (or otherwise claimed, like the kernel image). Frames outside the
/// boot memory map are never handed out.
pub struct FrameBitmap {
    regions: [Option<NonNull<RegionBitmap>>; REGION_COUNT],
    /// Top of the reserve stack; each block holds the pointer to the next.
    reserve: Option<NonNull<RegionBitmap>>,
    reserved: usize,
    usable: BootMemoryMap,
    used: usize,
}

// Safety: the bitmaps are exclusively owned and only reached through `&self`/`&mut self`.
unsafe impl Send for FrameBitmap {}

impl FrameBitmap {
    /// An allocator with every frame free and no reserve.
    #[must_use]
    pub const fn new(usable: BootMemoryMap) -> Self {
        Self {
            regions: [None; REGION_COUNT],
            reserve: None,
            reserved: 0,
            usable,
            used: 0,
        }
    }

    /// Usable physical memory as reported at boot.
    #[must_use]
    pub const fn usable(&self) -> &BootMemoryMap {
        &self.usable
    }

    /// Number of frames currently marked used.
    #[must_use]
    pub const fn used_frames(&self) -> usize {
        self.used
    }

    /// Number of blocks in the reserve.
    #[must_use]
    pub const fn reserved(&self) -> usize {
        self.reserved
    }

    /// Number of blocks missing from the reserve's minimum.
    #[must_use]
    pub const fn needs_reserve(&self) -> usize {
        RESERVE_MINIMUM.saturating_sub(self.reserved)
    }

    /// Hand a block to the reserve.
    ///
    /// # Safety
    /// `bitmap` must be valid for reads and writes of a [`RegionBitmap`] for
    /// the lifetime of this allocator and must not be used by anyone else.
    pub unsafe fn install_reserve(&mut self, bitmap: NonNull<RegionBitmap>) {
        // SAFETY: the block is ours; it is not a bitmap until taken.
        unsafe { bitmap.cast::<Option<NonNull<RegionBitmap>>>().write_unaligned(self.reserve) };
        self.reserve = Some(bitmap);
        self.reserved += 1;
    }

    fn take_reserve(&mut self) -> Option<NonNull<RegionBitmap>> {
        let bitmap = self.reserve?;
        // SAFETY: written by `install_reserve`.
        self.reserve = unsafe { bitmap.cast::<Option<NonNull<RegionBitmap>>>().read_unaligned() };
        self.reserved -= 1;
        // SAFETY: owned by `self` from here on.
        unsafe { bitmap.write(RegionBitmap::new()) };
        Some(bitmap)
    }

    /// Number of regions without a bitmap that the next `frames`
    /// allocations would open, if nothing is freed meanwhile.
    #[must_use]
    pub fn regions_to_open(&self, frames: usize) -> usize {
        let mut left = frames;
        let mut opened = 0;
        for region in 0..REGION_COUNT {
            if left == 0 {
                break;
            }
            let free = self.free_in_region(region);
            if free > 0 && self.regions[region].is_none() {
                opened += 1;
            }
            left = left.saturating_sub(free);
        }
        opened
    }

    fn free_in_region(&self, region: usize) -> usize {
        let bitmap = self.region(region);
        if bitmap.is_some_and(RegionBitmap::is_full) || self.region_unusable(region) {
            return 0;
        }
        (0..FRAMES_PER_REGION)
            .filter(|bit| !bitmap.is_some_and(|b| b.is_set(*bit)))
            .filter(|bit| self.usable.is_usable(Self::join(region, *bit)))
            .count()
    }

    /// Whether region `index` has a bitmap.
    #[must_use]
    pub fn has_region(&self, index: usize) -> bool {
        self.regions[index].is_some()
    }

    #[inline]
    fn region(&self, index: usize) -> Option<&RegionBitmap> {
        // SAFETY: region bitmaps are owned by `self`.
        self.regions[index].map(|r| unsafe { r.as_ref() })
    }

    #[inline]
    const fn split(frame: PhysicalPage<Size4K>) -> (usize, usize) {
        let n = frame.frame_number() as usize;
        (n / FRAMES_PER_REGION, n % FRAMES_PER_REGION)
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    const fn join(region: usize, bit: usize) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number((region * FRAMES_PER_REGION + bit) as u32)
    }

    fn region_unusable(&self, region: usize) -> bool {
        let start = Self::join(region, 0).base();
        let end = u64::from(start.as_u32()) + (FRAMES_PER_REGION as u64) * 4096;
        self.usable.is_unusable_span(start, end)
    }

    /// Whether `frame` is marked used.
    #[must_use]
    pub fn is_used(&self, frame: PhysicalPage<Size4K>) -> bool {
        let (region, bit) = Self::split(frame);
        self.region(region).is_some_and(|r| r.is_set(bit))
    }

    /// First usable free frame, or `None` when physical memory is exhausted.
    ///
    /// Regions are visited in ascending order, then words, then bits.
    /// Nothing is modified.
    #[must_use]
    pub fn try_find_free_frame(&self) -> Option<PhysicalPage<Size4K>> {
        for region in 0..REGION_COUNT {
            let bitmap = self.region(region);
            if bitmap.is_some_and(RegionBitmap::is_full) || self.region_unusable(region) {
                continue;
            }
            for word in 0..WORDS_PER_REGION {
                let bits = bitmap.map_or(0, |b| b.words[word]);
                if bits == u32::MAX {
                    continue;
                }
                for bit in 0..WORD_BITS {
                    if bits & (1 << bit) != 0 {
                        continue;
                    }
                    let frame = Self::join(region, word * WORD_BITS + bit);
                    if self.usable.is_usable(frame) {
                        return Some(frame);
                    }
                }
            }
        }
        None
    }

    /// First usable free frame.
    ///
    /// # Panics
    /// When no usable frame is left. Physical exhaustion is not recoverable.
    #[must_use]
    pub fn find_free_frame(&self) -> PhysicalPage<Size4K> {
        self.try_find_free_frame()
            .unwrap_or_else(|| panic!("out of physical memory ({} frames in use)", self.used))
    }

    /// Set the bit for `frame`. Marking a used frame again is a no-op.
    ///
    /// # Panics
    /// If the frame's region has no bitmap yet and the reserve is empty.
    pub fn mark_used(&mut self, frame: PhysicalPage<Size4K>) {
        let (region, bit) = Self::split(frame);
        let mut bitmap = match self.regions[region] {
            Some(bitmap) => bitmap,
            None => {
                let Some(bitmap) = self.take_reserve() else {
                    panic!("no reserve bitmap left for physical region {region}");
                };
                log::trace!("frame bitmap for region {region} created");
                self.regions[region] = Some(bitmap);
                bitmap
            }
        };

        // SAFETY: owned by `self`.
        let bitmap = unsafe { bitmap.as_mut() };
        let word = &mut bitmap.words[bit / WORD_BITS];
        let mask = 1 << (bit % WORD_BITS);
        if *word & mask != 0 {
            return;
        }
        *word |= mask;
        self.used += 1;
        if *word == u32::MAX {
            bitmap.full = bitmap.words.iter().all(|w| *w == u32::MAX);
        }
    }

    /// Clear the bit for `frame`. Freeing a free frame is a no-op.
    pub fn mark_free(&mut self, frame: PhysicalPage<Size4K>) {
        let (region, bit) = Self::split(frame);
        let Some(mut bitmap) = self.regions[region] else {
            return;
        };
        // SAFETY: owned by `self`.
        let bitmap = unsafe { bitmap.as_mut() };
        let word = &mut bitmap.words[bit / WORD_BITS];
        let mask = 1 << (bit % WORD_BITS);
        if *word & mask == 0 {
            return;
        }
        *word &= !mask;
        bitmap.full = false;
        self.used -= 1;
    }

    /// Log one line per populated region.
    pub fn dump(&self) {
        log::debug!("frame bitmap: {} frames in use", self.used);
        for (index, bitmap) in (0..REGION_COUNT).filter_map(|i| self.region(i).map(|b| (i, b))) {
            log::debug!(
                "  region {index:4} @ {:#010x}: {:4} used{}",
                index * FRAMES_PER_REGION * 4096,
                bitmap.used(),
                if bitmap.full { " (full)" } else { "" }
            );
        }
    }
}

impl FrameAlloc for FrameBitmap {
    fn alloc_frame(&mut self) -> PhysicalPage<Size4K> {
        let frame = self.find_free_frame();
        self.mark_used(frame);
        frame
    }

    fn mark_used(&mut self, frame: PhysicalPage<Size4K>) {
        Self::mark_used(self, frame);
    }

    fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        self.mark_free(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRange;

    fn leaked() -> NonNull<RegionBitmap> {
        NonNull::from(Box::leak(Box::new(RegionBitmap::new())))
    }

    fn bitmap(ranges: &[MemoryRange]) -> FrameBitmap {
        let mut frames = FrameBitmap::new(BootMemoryMap::from_ranges(ranges));
        unsafe {
            frames.install_reserve(leaked());
            frames.install_reserve(leaked());
        }
        frames
    }

    fn frame(n: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(n)
    }

    #[test]
    fn first_usable_frame_is_returned() {
        let frames = bitmap(&[MemoryRange::new(0x0010_0000, 0x0020_0000)]);
        assert_eq!(frames.find_free_frame(), frame(0x100));
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn used_frames_are_skipped_until_freed() {
        let mut frames = bitmap(&[MemoryRange::new(0x0010_0000, 0x0020_0000)]);
        frames.mark_used(frame(0x100));
        frames.mark_used(frame(0x101));
        assert_eq!(frames.find_free_frame(), frame(0x102));
        assert!(frames.is_used(frame(0x101)));

        frames.mark_free(frame(0x100));
        assert_eq!(frames.find_free_frame(), frame(0x100));
        assert_eq!(frames.used_frames(), 1);
    }

    #[test]
    fn marking_twice_counts_once() {
        let mut frames = bitmap(&[MemoryRange::new(0, 0x0040_0000)]);
        frames.mark_used(frame(3));
        frames.mark_used(frame(3));
        assert_eq!(frames.used_frames(), 1);
        frames.mark_free(frame(3));
        frames.mark_free(frame(3));
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn regions_are_created_from_the_reserve() {
        let mut frames = bitmap(&[MemoryRange::new(0, 0x0100_0000)]);
        assert_eq!(frames.needs_reserve(), 0);
        frames.mark_used(frame(0));
        assert!(frames.has_region(0));
        assert_eq!(frames.needs_reserve(), 1);

        unsafe { frames.install_reserve(leaked()) };
        frames.mark_used(frame(1024));
        assert!(frames.has_region(1));
        assert_eq!(frames.needs_reserve(), 1);
    }

    #[test]
    fn reserve_grows_past_its_minimum() {
        let mut frames = bitmap(&[MemoryRange::new(0, 0x0140_0000)]);
        for _ in 0..3 {
            unsafe { frames.install_reserve(leaked()) };
        }
        assert_eq!(frames.reserved(), 5);

        // One frame in each of five regions, all from the reserve.
        for region in 0..5 {
            frames.mark_used(frame(region * 1024 + 9));
        }
        assert_eq!(frames.reserved(), 0);
        assert_eq!(frames.needs_reserve(), 2);
        assert!((0..5).all(|region| frames.region(region).unwrap().used() == 1));
    }

    #[test]
    fn regions_to_open_follows_the_allocation_order() {
        // Region 0 holds 0x300 usable frames, region 1 is outside the map.
        let mut frames = bitmap(&[
            MemoryRange::new(0x0010_0000, 0x0040_0000),
            MemoryRange::new(0x0080_0000, 0x0100_0000),
        ]);
        assert_eq!(frames.regions_to_open(0), 0);
        assert_eq!(frames.regions_to_open(1), 1);
        assert_eq!(frames.regions_to_open(0x300), 1);
        assert_eq!(frames.regions_to_open(0x301), 2);
        assert_eq!(frames.regions_to_open(0x300 + 2048), 3);

        frames.mark_used(frame(0x100));
        assert_eq!(frames.regions_to_open(0x2FF), 0);
        assert_eq!(frames.regions_to_open(0x300), 1);
    }

    #[test]
    #[should_panic(expected = "no reserve bitmap left")]
    fn running_out_of_reserve_panics() {
        let mut frames = FrameBitmap::new(BootMemoryMap::from_ranges(&[MemoryRange::new(0, 0x0100_0000)]));
        frames.mark_used(frame(0));
    }

    #[test]
    fn full_regions_are_flagged_and_skipped() {
        let mut frames = bitmap(&[MemoryRange::new(0, 0x0080_0000)]);
        for n in 0..1024 {
            frames.mark_used(frame(n));
        }
        assert!(frames.region(0).unwrap().is_full());
        assert_eq!(frames.find_free_frame(), frame(1024));

        frames.mark_free(frame(77));
        assert!(!frames.region(0).unwrap().is_full());
        assert_eq!(frames.find_free_frame(), frame(77));
    }

    #[test]
    fn frames_outside_the_memory_map_are_never_returned() {
        let frames = bitmap(&[MemoryRange::new(0x0090_0000, 0x0090_2000)]);
        assert_eq!(frames.find_free_frame(), frame(0x900));
        let mut frames = frames;
        frames.mark_used(frame(0x900));
        frames.mark_used(frame(0x901));
        assert_eq!(frames.try_find_free_frame(), None);
    }

    #[test]
    fn exhaustion_panics_without_touching_the_bitmap() {
        let mut frames = bitmap(&[MemoryRange::new(0x0010_0000, 0x0010_4000)]);
        for n in 0x100..0x104 {
            frames.mark_used(frame(n));
        }
        let before: Vec<u32> = frames.region(0).unwrap().words.to_vec();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| frames.alloc_frame()));

        let message = result.unwrap_err();
        let message = message.downcast_ref::<String>().unwrap();
        assert!(message.starts_with("out of physical memory"));
        assert_eq!(frames.region(0).unwrap().words.to_vec(), before);
        assert_eq!(frames.used_frames(), 4);
    }

    #[test]
    fn frame_alloc_marks_what_it_returns() {
        let mut frames = bitmap(&[MemoryRange::new(0x0010_0000, 0x0020_0000)]);
        let a = FrameAlloc::alloc_frame(&mut frames);
        let b = FrameAlloc::alloc_frame(&mut frames);
        assert_eq!((a, b), (frame(0x100), frame(0x101)));
        FrameAlloc::free_frame(&mut frames, a);
        assert!(!frames.is_used(a));
    }
}
