//! # Boot Memory Map
//!
//! The list of physical ranges the boot code reported as usable RAM.

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Maximum number of usable ranges recorded.
pub const MAX_MEMORY_RANGES: usize = 32;

/// A half-open range `[start, end)` of usable physical memory.
///
/// Bounds are kept as `u64` so that a range may end exactly at 4 GiB.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether the whole 4 KiB frame lies inside this range.
    #[must_use]
    pub fn contains_frame(&self, frame: PhysicalPage<Size4K>) -> bool {
        let base = u64::from(frame.base().as_u32());
        base >= self.start && base + 4096 <= self.end
    }
}

/// Usable physical memory as reported at boot.
#[derive(Clone, Debug)]
pub struct BootMemoryMap {
    ranges: [MemoryRange; MAX_MEMORY_RANGES],
    len: usize,
}

impl Default for BootMemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl BootMemoryMap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ranges: [MemoryRange::new(0, 0); MAX_MEMORY_RANGES],
            len: 0,
        }
    }

    /// Record a usable range. Empty ranges are ignored.
    ///
    /// Returns `false` when the map is already full.
    pub const fn push(&mut self, range: MemoryRange) -> bool {
        if range.is_empty() {
            return true;
        }
        if self.len == MAX_MEMORY_RANGES {
            return false;
        }
        self.ranges[self.len] = range;
        self.len += 1;
        true
    }

    /// Build a map from a list of ranges, dropping whatever does not fit.
    #[must_use]
    pub fn from_ranges(ranges: &[MemoryRange]) -> Self {
        let mut map = Self::new();
        for range in ranges {
            if !map.push(*range) {
                break;
            }
        }
        map
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRange> {
        self.ranges[..self.len].iter()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the frame is entirely inside a usable range.
    #[must_use]
    pub fn is_usable(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.iter().any(|r| r.contains_frame(frame))
    }

    /// Whether the whole span `[start, end)` contains no usable frame.
    #[must_use]
    pub fn is_unusable_span(&self, start: PhysicalAddress, end: u64) -> bool {
        let start = u64::from(start.as_u32());
        self.iter().all(|r| r.end <= start || r.start >= end)
    }

    /// Total number of usable bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.iter().map(MemoryRange::len).sum()
    }
}
