use std::ptr;
use crate::freelist::FreeList;


/// A contiguous span of the managed range that is not in use.
///
/// Free regions are owned by the [`FreeList`] while they are unallocated. Once
/// a region is handed out, the allocator forgets about it: the only record of
/// its size is the [`crate::block::Block`] header written at its start.
///
/// ```text
///   start                                   start + size
///     |                                          |
///     v                                          v
///     +------------------------------------------+
///     |               Free Region                |
///     +------------------------------------------+
/// ```
///
/// A region of size `0` is the "no region" sentinel, see [`FreeRegion::NONE`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FreeRegion {
    /// Size of the region in bytes. Always a multiple of [`crate::memalloc::GRANULARITY`].
    pub size: usize,
    /// First byte of the region.
    pub start: *mut u8,
}

impl FreeRegion {
    /// Sentinel returned when there is no region to give.
    pub const NONE: FreeRegion = FreeRegion { size: 0, start: ptr::null_mut() };

    pub const fn new(start: *mut u8, size: usize) -> Self {
        Self { size, start }
    }

    /// Whether this is the [`FreeRegion::NONE`] sentinel.
    #[inline]
    pub fn is_none(&self) -> bool {
        self.size == 0
    }

    /// One past the last byte of the region.
    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.start.wrapping_add(self.size)
    }

    /// Whether `self` and `other` share at least one byte.
    pub fn overlaps(&self, other: &FreeRegion) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Cuts `needed` bytes off the front of the region. The excess, if any, is
    /// returned as a new region starting right after the kept part.
    pub fn split(self, needed: usize) -> (FreeRegion, Option<FreeRegion>) {
        debug_assert!(needed <= self.size);

        if self.size == needed {
            return (self, None);
        }

        let kept = FreeRegion::new(self.start, needed);
        let excess = FreeRegion::new(self.start.wrapping_add(needed), self.size - needed);

        (kept, Some(excess))
    }
}

/// Tries to merge `region` with a free region that ends exactly where `region`
/// begins. The neighbour is taken out of the `free_list` and `region` grows
/// backwards to cover it.
pub(crate) fn merge_with_prev(region: &mut FreeRegion, free_list: &mut FreeList) {
    if let Some(index) = free_list.find_by_end(region.start) {
        let prev = free_list.remove_at(index);

        region.start = prev.start;
        region.size += prev.size;
    }
}

/// Tries to merge `region` with a free region that starts exactly where
/// `region` ends.
pub(crate) fn merge_with_next(region: &mut FreeRegion, free_list: &mut FreeList) {
    if let Some(index) = free_list.find_by_start(region.end()) {
        let next = free_list.remove_at(index);

        region.size += next.size;
    }
}
