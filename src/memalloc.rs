use std::{cmp, ptr::{self, NonNull}};

use log::{debug, error};

use crate::{
    block::{BLOCK_HEADER_SIZE, Block},
    error::AllocError,
    freelist::FreeList,
    kernel::{Kernel, PlatformMemory, ProgramBreak},
    region::{self, FreeRegion},
    utils::checked_align,
};

/// Bytes requested from the system when the heap is initialized, and the
/// minimum amount it grows by afterwards.
pub const DEFAULT_EXTENT: usize = 1024;

/// Every size handed out by the allocator is a multiple of this, and every
/// address it returns is aligned to it.
pub const GRANULARITY: usize = 16;

/// The allocator. It hands out blocks of memory carved out of the managed
/// range and takes them back for reuse.
///
/// ```text
///                                   Managed range
///
///   +--------+-----------+--------+--------------+--------+-------------------+
///   | Header |  Content  | Header |   Content    |  Free  |       Free        |
///   +--------+-----------+--------+--------------+--------+-------------------+
///            ^                    ^                  ^             ^
///            |                    |                  |             |
///     returned to user     returned to user          +-------------+
///                                                       FreeList
/// ```
///
/// Allocation searches the [`FreeList`] for the first region big enough for
/// the content plus its [`Block`] header, splits off what it doesn't need and
/// gives the rest back. If nothing fits, the heap is grown through the
/// [`PlatformMemory`] and the search runs once more.
///
/// Release reads the header to know the size of the block, merges it with
/// free neighbours and hands it back to the [`FreeList`].
///
/// The allocator is single threaded: every operation takes `&mut self`.
pub struct MemAlloc<P: PlatformMemory = ProgramBreak> {
    /// Heap region manager.
    kernel: Kernel<P>,
    /// Regions of the managed range not in use.
    free_list: FreeList,
}

impl MemAlloc<ProgramBreak> {
    /// Creates an allocator that grows the process heap. Nothing is requested
    /// from the system until the first allocation.
    pub const fn new() -> Self {
        Self::with_platform(ProgramBreak::new())
    }
}

impl Default for MemAlloc<ProgramBreak> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PlatformMemory> MemAlloc<P> {
    /// Creates an allocator on top of `platform`.
    pub const fn with_platform(platform: P) -> Self {
        Self {
            kernel: Kernel::new(platform),
            free_list: FreeList::new(),
        }
    }

    /// Requests the initial [`DEFAULT_EXTENT`] bytes from the system. Called
    /// by every allocation, so there is usually no need to call it directly.
    pub fn initialize(&mut self) -> Result<(), AllocError> {
        self.kernel.initialize(&mut self.free_list)
    }

    pub fn is_initialized(&self) -> bool {
        self.kernel.is_initialized()
    }

    /// Start of the managed range, once initialized.
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.kernel.base()
    }

    /// Bytes obtained from the system so far. It never decreases.
    pub fn extent(&self) -> usize {
        self.kernel.extent()
    }

    /// Free regions, in storage order.
    pub fn free_regions(&self) -> impl Iterator<Item = &FreeRegion> {
        self.free_list.iter()
    }

    /// Bytes of the managed range not in use.
    pub fn total_free(&self) -> usize {
        self.free_list.total_free()
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// The block is [`GRANULARITY`] aligned and its size is `size` rounded up
    /// to [`GRANULARITY`]. `size == 0` yields a valid, empty block.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.initialize()?;

        let size = checked_align(size, GRANULARITY).ok_or(AllocError::OutOfMemory)?;
        let needed = size.checked_add(BLOCK_HEADER_SIZE).ok_or(AllocError::OutOfMemory)?;

        let index = match self.free_list.find_first_fit(needed) {
            Some(index) => index,
            None => {
                self.grow(needed)?;
                self.free_list.find_first_fit(needed).ok_or(AllocError::OutOfMemory)?
            }
        };

        let (block, excess) = self.free_list.remove_at(index).split(needed);

        // We just removed one entry, there is room for the excess.
        if let Some(excess) = excess {
            self.free_list.insert(excess)?;
        }

        let start = NonNull::new(block.start).ok_or(AllocError::OutOfMemory)?;
        let addr = unsafe { Block::write(start, size) };

        debug!("allocate({size}) -> {addr:?}");

        Ok(addr)
    }

    /// Gives the block at `ptr` back to the allocator. A null `ptr` does nothing.
    ///
    /// **SAFETY**: `ptr` must be null or an address returned by this allocator
    /// that hasn't been released yet.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(addr) = NonNull::new(ptr) else {
            return;
        };

        let (start, footprint) = unsafe {
            let header = Block::from_content(addr);
            (Block::start(addr), header.as_ref().footprint())
        };

        debug!("release({addr:?}), {footprint} bytes");

        if let Err(err) = self.give_back(FreeRegion::new(start.as_ptr(), footprint)) {
            error!("{footprint} bytes at {start:?} lost on release: {err}");
        }
    }

    /// Moves the block at `ptr` to a new block of `new_size` bytes, keeping the
    /// first `min(old size, new_size)` bytes of content.
    ///
    /// A null `ptr` behaves like [`MemAlloc::allocate`]. A `new_size` of `0`
    /// behaves like [`MemAlloc::release`] and returns `None`. If the new block
    /// can't be allocated the old one is left untouched.
    ///
    /// **SAFETY**: same as [`MemAlloc::release`].
    pub unsafe fn resize(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(addr) = NonNull::new(ptr) else {
            return self.allocate(new_size).map(Some);
        };

        if new_size == 0 {
            unsafe { self.release(ptr) };
            return Ok(None);
        }

        let old_size = unsafe { Block::from_content(addr).as_ref().size };
        let new_addr = self.allocate(new_size)?;

        unsafe {
            ptr::copy_nonoverlapping(addr.as_ptr(), new_addr.as_ptr(), cmp::min(old_size, new_size));
            self.release(ptr);
        }

        debug!("resize({addr:?}, {new_size}) -> {new_addr:?}");

        Ok(Some(new_addr))
    }

    /// Usable size of the block at `addr`.
    ///
    /// **SAFETY**: `addr` must be a live block of this allocator.
    pub unsafe fn block_size(&self, addr: NonNull<u8>) -> usize {
        unsafe { Block::from_content(addr).as_ref().size }
    }

    /// Grows the heap so that a region of `needed` bytes is free.
    fn grow(&mut self, needed: usize) -> Result<(), AllocError> {
        let len = cmp::max(needed, DEFAULT_EXTENT);
        let start = self.kernel.extend(len)?;

        self.give_back(FreeRegion::new(start.as_ptr(), len)).inspect_err(|err| {
            error!("{len} bytes at {start:?} lost after growing the heap: {err}");
        })
    }

    /// Merges `region` with its free neighbours and inserts the result.
    fn give_back(&mut self, mut freed: FreeRegion) -> Result<(), AllocError> {
        region::merge_with_prev(&mut freed, &mut self.free_list);
        region::merge_with_next(&mut freed, &mut self.free_list);

        self.free_list.insert(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::FixedArena;

    use rand::{Rng, SeedableRng, rngs::StdRng};
    use test_env_log::test;

    fn arena_alloc(capacity: usize) -> MemAlloc<FixedArena> {
        MemAlloc::with_platform(FixedArena::new(capacity))
    }

    /// Checks that free regions and live blocks never share a byte and that
    /// they all lie inside the managed range.
    fn assert_disjoint(allocator: &MemAlloc<FixedArena>, live: &[NonNull<u8>]) {
        let mut spans: Vec<FreeRegion> = allocator.free_regions().copied().collect();

        for addr in live {
            unsafe {
                let header = Block::from_content(*addr);
                spans.push(FreeRegion::new(Block::start(*addr).as_ptr(), header.as_ref().footprint()));
            }
        }

        let base = allocator.base().unwrap().as_ptr();
        let end = base.wrapping_add(allocator.extent());

        for (i, a) in spans.iter().enumerate() {
            assert!(a.start >= base && a.end() <= end, "{a:?} outside the managed range");

            for b in &spans[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn nothing_is_requested_before_first_allocation() {
        let allocator = arena_alloc(4096);

        assert!(!allocator.is_initialized());
        assert_eq!(0, allocator.extent());
    }

    #[test]
    fn first_allocation_splits_initial_region() {
        let mut allocator = arena_alloc(4096);

        let addr = allocator.allocate(10).unwrap();

        let regions: Vec<_> = allocator.free_regions().collect();
        assert_eq!(1, regions.len());
        assert_eq!(DEFAULT_EXTENT - GRANULARITY - BLOCK_HEADER_SIZE, regions[0].size);
        assert_eq!(unsafe { allocator.base().unwrap().add(BLOCK_HEADER_SIZE) }, addr);
    }

    #[test]
    fn sizes_are_rounded_and_addresses_aligned() {
        let mut allocator = arena_alloc(1 << 16);

        for size in [0, 1, 15, 16, 17, 31, 33, 100, 1000] {
            let addr = allocator.allocate(size).unwrap();

            assert_eq!(0, addr.as_ptr() as usize % GRANULARITY);
            assert_eq!(size.div_ceil(GRANULARITY) * GRANULARITY, unsafe { allocator.block_size(addr) });
        }
    }

    #[test]
    fn miss_grows_heap_once() {
        let mut allocator = arena_alloc(1 << 16);
        allocator.initialize().unwrap();

        let largest = allocator.free_regions().map(|r| r.size).max().unwrap();
        assert_eq!(DEFAULT_EXTENT, largest);

        let addr = allocator.allocate(2000).unwrap();

        assert!(allocator.extent() >= DEFAULT_EXTENT + 2000);
        assert_eq!(DEFAULT_EXTENT + 2000 + BLOCK_HEADER_SIZE, allocator.extent());
        assert_eq!(2000, unsafe { allocator.block_size(addr) });

        unsafe { ptr::write_bytes(addr.as_ptr(), 0x5a, 2000) };
        assert_disjoint(&allocator, &[addr]);
    }

    #[test]
    fn released_block_is_reused() {
        let mut allocator = arena_alloc(4096);

        let first = allocator.allocate(16).unwrap();
        unsafe { allocator.release(first.as_ptr()) };
        let second = allocator.allocate(16).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn release_merges_neighbours() {
        let mut allocator = arena_alloc(4096);

        let a = allocator.allocate(32).unwrap();
        let b = allocator.allocate(64).unwrap();
        let c = allocator.allocate(16).unwrap();

        unsafe {
            allocator.release(a.as_ptr());
            allocator.release(c.as_ptr());
            allocator.release(b.as_ptr());
        }

        let regions: Vec<_> = allocator.free_regions().collect();
        assert_eq!(1, regions.len());
        assert_eq!(DEFAULT_EXTENT, regions[0].size);
        assert_eq!(allocator.base().unwrap().as_ptr(), regions[0].start);
    }

    #[test]
    fn release_null_does_nothing() {
        let mut allocator = arena_alloc(4096);
        allocator.allocate(16).unwrap();
        let before: Vec<FreeRegion> = allocator.free_regions().copied().collect();

        unsafe { allocator.release(ptr::null_mut()) };

        let after: Vec<FreeRegion> = allocator.free_regions().copied().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn allocation_takes_the_region_that_fits() {
        let mut allocator = arena_alloc(4096);

        // Leave a small hole at the front of the heap, smaller than the next request.
        let small = allocator.allocate(16).unwrap();
        let guard = allocator.allocate(16).unwrap();
        unsafe { allocator.release(small.as_ptr()) };

        let big = allocator.allocate(256).unwrap();

        assert_eq!(256, unsafe { allocator.block_size(big) });
        assert_ne!(small, big);
        assert_disjoint(&allocator, &[guard, big]);
    }

    #[test]
    fn out_of_memory_when_system_declines() {
        let mut allocator = arena_alloc(DEFAULT_EXTENT);

        assert_eq!(Err(AllocError::OutOfMemory), allocator.allocate(DEFAULT_EXTENT));
        assert_eq!(DEFAULT_EXTENT, allocator.extent());

        // What was already there is still usable.
        assert!(allocator.allocate(DEFAULT_EXTENT - BLOCK_HEADER_SIZE).is_ok());
    }

    #[test]
    fn out_of_memory_on_failed_initialization() {
        let mut allocator = arena_alloc(256);

        assert_eq!(Err(AllocError::OutOfMemory), allocator.allocate(8));
    }

    #[test]
    fn huge_requests_do_not_overflow() {
        let mut allocator = arena_alloc(4096);

        assert_eq!(Err(AllocError::OutOfMemory), allocator.allocate(usize::MAX));
        assert_eq!(Err(AllocError::OutOfMemory), allocator.allocate(usize::MAX - BLOCK_HEADER_SIZE));
    }

    #[test]
    fn resize_null_allocates() {
        let mut allocator = arena_alloc(4096);

        let addr = unsafe { allocator.resize(ptr::null_mut(), 40) }.unwrap().unwrap();

        assert_eq!(48, unsafe { allocator.block_size(addr) });
    }

    #[test]
    fn resize_to_zero_releases() {
        let mut allocator = arena_alloc(4096);
        let addr = allocator.allocate(100).unwrap();

        let resized = unsafe { allocator.resize(addr.as_ptr(), 0) }.unwrap();

        assert!(resized.is_none());
        assert_eq!(DEFAULT_EXTENT, allocator.total_free());
    }

    #[test]
    fn resize_up_keeps_content() {
        let mut allocator = arena_alloc(1 << 16);
        let addr = allocator.allocate(50).unwrap();

        unsafe {
            for i in 0..50 {
                addr.add(i).write(i as u8);
            }

            let grown = allocator.resize(addr.as_ptr(), 3000).unwrap().unwrap();

            assert_eq!(3008, allocator.block_size(grown));
            for i in 0..50 {
                assert_eq!(i as u8, grown.add(i).read());
            }
        }
    }

    #[test]
    fn resize_down_keeps_prefix() {
        let mut allocator = arena_alloc(4096);
        let addr = allocator.allocate(200).unwrap();

        unsafe {
            for i in 0..200 {
                addr.add(i).write(!(i as u8));
            }

            let shrunk = allocator.resize(addr.as_ptr(), 20).unwrap().unwrap();

            assert_eq!(32, allocator.block_size(shrunk));
            for i in 0..20 {
                assert_eq!(!(i as u8), shrunk.add(i).read());
            }
        }
    }

    #[test]
    fn failed_resize_keeps_old_block() {
        let mut allocator = arena_alloc(DEFAULT_EXTENT);
        let addr = allocator.allocate(64).unwrap();

        unsafe {
            addr.write(7);

            assert_eq!(Err(AllocError::OutOfMemory), allocator.resize(addr.as_ptr(), 4096));
            assert_eq!(7, addr.read());
            assert_eq!(64, allocator.block_size(addr));
        }
    }

    #[test]
    fn random_traffic_keeps_blocks_disjoint() {
        let mut allocator = arena_alloc(1 << 24);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        let mut extent = 0;

        for round in 0..300 {
            let size = if rng.gen_ratio(1, 10) {
                rng.gen_range(1024..=16 * 1024)
            } else {
                rng.gen_range(1..=80)
            };

            let addr = allocator.allocate(size).unwrap();
            let tag = round as u8;
            unsafe { ptr::write_bytes(addr.as_ptr(), tag, size) };
            live.push((addr, size, tag));

            if rng.gen_bool(0.5) {
                let (addr, _, _) = live.swap_remove(rng.gen_range(0..live.len()));
                unsafe { allocator.release(addr.as_ptr()) };
            }

            if !live.is_empty() && rng.gen_ratio(1, 5) {
                let i = rng.gen_range(0..live.len());
                let (addr, size, tag) = live[i];
                let new_size = rng.gen_range(1..=size * 2);

                let moved = unsafe { allocator.resize(addr.as_ptr(), new_size) }.unwrap().unwrap();
                let kept = cmp::min(size, new_size);
                for offset in 0..kept {
                    assert_eq!(tag, unsafe { moved.add(offset).read() });
                }
                unsafe { ptr::write_bytes(moved.as_ptr(), tag, new_size) };
                live[i] = (moved, new_size, tag);
            }

            assert!(allocator.extent() >= extent);
            extent = allocator.extent();

            let addrs: Vec<_> = live.iter().map(|(addr, _, _)| *addr).collect();
            assert_disjoint(&allocator, &addrs);
        }

        for (addr, size, tag) in live.drain(..) {
            for offset in 0..size {
                assert_eq!(tag, unsafe { addr.add(offset).read() });
            }
            unsafe { allocator.release(addr.as_ptr()) };
        }

        assert_eq!(allocator.extent(), allocator.total_free());
        assert_eq!(1, allocator.free_regions().count());
    }
}
