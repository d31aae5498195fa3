//! Helper functions that don't belong to any concrete module of the allocator.


/// It aligns `to_be_aligned` up to the next multiple of `aligment`, which must be
/// a power of two.
///
/// Used to normalize requested sizes to [`crate::memalloc::GRANULARITY`] and to
/// pad the program break before the managed range is extended.
#[inline]
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around when
/// `to_be_aligned` is too close to `usize::MAX`.
#[inline]
pub const fn checked_align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    match to_be_aligned.checked_add(aligment - 1) {
        Some(padded) => Some(padded & !(aligment - 1)),
        None => None,
    }
}
