use std::slice;

use log::{trace, warn};

use crate::{error::AllocError, region::FreeRegion};

/// Initial number of entries the list can hold before it has to grow.
const INITIAL_CAPACITY: usize = 64;

/// Registry of free [`FreeRegion`]s.
///
/// The regions are kept in a binary min-heap ordered by size and stored in a
/// plain array, so the smallest free region is always at index `0`:
///
/// ```text
///                     +------+
///                     |  16  |                 index 0
///                     +------+
///                    /        \
///             +------+        +------+
///             |  48  |        |  32  |         index 1, 2
///             +------+        +------+
///            /        \
///     +------+        +------+
///     | 1024 |        |  64  |                 index 3, 4
///     +------+        +------+
///
///     storage: [ 16 | 48 | 32 | 1024 | 64 ]
/// ```
///
/// Children of the entry at `i` live at `2i + 1` and `2i + 2`. Inserting and
/// extracting the minimum both take logarithmic time. Searches by address or
/// by "first region big enough" walk the storage array in order, which has
/// nothing to do with the heap order and is linear.
pub(crate) struct FreeList {
    items: Vec<FreeRegion>,
}

impl FreeList {
    /// Creates a new empty FreeList. No memory is reserved until the first insertion.
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Regions in storage order.
    pub fn iter(&self) -> slice::Iter<'_, FreeRegion> {
        self.items.iter()
    }

    /// Sum of the sizes of every free region.
    pub fn total_free(&self) -> usize {
        self.items.iter().map(|region| region.size).sum()
    }

    /// Inserts `region` and restores the heap order by moving it towards the
    /// root while it is smaller than its parent.
    ///
    /// When the storage is full its capacity is doubled. If that fails the
    /// region is not inserted and [`AllocError::OutOfMemory`] is returned, so
    /// the caller still owns it.
    pub fn insert(&mut self, region: FreeRegion) -> Result<(), AllocError> {
        debug_assert!(!region.is_none(), "sentinel inserted into the free list");

        if self.items.len() == self.items.capacity() {
            let additional = std::cmp::max(self.items.capacity(), INITIAL_CAPACITY);
            self.items.try_reserve_exact(additional)?;
        }

        self.items.push(region);
        self.sift_up(self.items.len() - 1);

        trace!("free list insert {:?} (+{}), {} entries", region.start, region.size, self.len());

        Ok(())
    }

    /// Removes and returns the smallest region.
    ///
    /// Fails with [`AllocError::Underflow`] if the list is empty.
    pub fn pop_min(&mut self) -> Result<FreeRegion, AllocError> {
        if self.is_empty() {
            return Err(AllocError::Underflow);
        }

        Ok(self.remove_at(0))
    }

    /// Removes and returns the smallest region, or [`FreeRegion::NONE`] if
    /// the list is empty. Callers must check for the sentinel.
    pub fn extract_minimum(&mut self) -> FreeRegion {
        self.pop_min().unwrap_or_else(|err| {
            warn!("{err}");
            FreeRegion::NONE
        })
    }

    /// Removes the region stored at `index`.
    ///
    /// The last entry takes its place and is moved down or up, whichever the
    /// heap order needs.
    ///
    /// ### Panics
    /// If `index` is out of bounds.
    pub fn remove_at(&mut self, index: usize) -> FreeRegion {
        let removed = self.items.swap_remove(index);

        if index < self.items.len() {
            let index = self.sift_down(index);
            self.sift_up(index);
        }

        trace!("free list remove {:?} (+{}), {} entries", removed.start, removed.size, self.len());

        removed
    }

    /// Index of the first region in storage order that can hold `size` bytes.
    ///
    /// This is a first-fit search: the region found is the first one we walk
    /// over, not necessarily the smallest one that fits.
    pub fn find_first_fit(&self, size: usize) -> Option<usize> {
        self.items.iter().position(|region| region.size >= size)
    }

    /// Index of the region that starts at `addr`.
    pub fn find_by_start(&self, addr: *mut u8) -> Option<usize> {
        self.items.iter().position(|region| region.start == addr)
    }

    /// Index of the region that ends right before `addr`.
    pub fn find_by_end(&self, addr: *mut u8) -> Option<usize> {
        self.items.iter().position(|region| region.end() == addr)
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;

            if self.items[index].size >= self.items[parent].size {
                break;
            }

            self.items.swap(index, parent);
            index = parent;
        }

        index
    }

    fn sift_down(&mut self, mut index: usize) -> usize {
        let len = self.items.len();

        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;

            if left < len && self.items[left].size < self.items[smallest].size {
                smallest = left;
            }
            if right < len && self.items[right].size < self.items[smallest].size {
                smallest = right;
            }
            if smallest == index {
                return index;
            }

            self.items.swap(index, smallest);
            index = smallest;
        }
    }
}
