use std::ptr::{self, NonNull};

use log::{debug, error};

use crate::{
    error::AllocError,
    freelist::FreeList,
    memalloc::{DEFAULT_EXTENT, GRANULARITY},
    region::FreeRegion,
    utils::checked_align,
};

#[cfg(unix)]
pub use self::unix::ProgramBreak;
#[cfg(windows)]
pub use self::windows::ProgramBreak;

/// This trait provides an abstraction over the low level primitive used to grow
/// the heap. As the allocator, our top level view of this has nothing to do
/// with the concrete syscalls offered by each kernel.
pub trait PlatformMemory {
    /// Grows the heap by `len` bytes. Returns a pointer to the first byte of
    /// the new span or `None` if the system declines.
    ///
    /// The returned pointer is aligned to [`GRANULARITY`]. `len` is always a
    /// multiple of [`GRANULARITY`].
    ///
    /// **SAFETY**: the caller becomes the only owner of the returned span.
    unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>>;
}

/// The heap region manager. It owns the managed range: the memory obtained
/// from the [`PlatformMemory`] so far.
///
/// ```text
///   base                                        base + extent
///     |                                                |
///     v                                                v
///     +------------+------------------+----------------+
///     |  initial   |   extension #1   |  extension #2  |  --> grows upwards
///     +------------+------------------+----------------+
/// ```
///
/// The range only ever grows. Nothing is given back to the system until the
/// process (or, for a [`FixedArena`], the arena) goes away.
pub(crate) struct Kernel<P> {
    /// Primitive used to grow the heap.
    platform: P,
    /// Start of the first span. `None` until initialized.
    base: Option<NonNull<u8>>,
    /// Bytes obtained from `platform` so far.
    extent: usize,
}

impl<P: PlatformMemory> Kernel<P> {
    pub(crate) const fn new(platform: P) -> Self {
        Self {
            platform,
            base: None,
            extent: 0,
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.base.is_some()
    }

    #[inline]
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    #[inline]
    pub fn extent(&self) -> usize {
        self.extent
    }

    /// Requests the initial [`DEFAULT_EXTENT`] bytes and hands them to
    /// `free_list` as a single region. Does nothing once initialized.
    pub fn initialize(&mut self, free_list: &mut FreeList) -> Result<(), AllocError> {
        if self.is_initialized() {
            return Ok(());
        }

        let start = self.extend(DEFAULT_EXTENT).inspect_err(|_| {
            error!("heap initialization failed");
        })?;

        free_list.insert(FreeRegion::new(start.as_ptr(), DEFAULT_EXTENT)).inspect_err(|err| {
            error!("initial region at {start:?} lost: {err}");
        })
    }

    /// Grows the managed range by `len` bytes, rounded up to [`GRANULARITY`],
    /// and returns the start of the new span.
    ///
    /// The new span is not necessarily adjacent to the previous ones: other
    /// code in the process may have moved the program break in between.
    pub fn extend(&mut self, len: usize) -> Result<NonNull<u8>, AllocError> {
        let len = checked_align(len, GRANULARITY).ok_or(AllocError::OutOfMemory)?;

        let Some(start) = (unsafe { self.platform.request_memory(len) }) else {
            error!("system declined to grow the heap by {len} bytes");
            return Err(AllocError::OutOfMemory);
        };

        debug_assert_eq!(0, start.as_ptr() as usize % GRANULARITY);

        if self.base.is_none() {
            self.base = Some(start);
        }
        self.extent += len;

        debug!("heap extended by {len} bytes at {start:?}, extent {}", self.extent);

        Ok(start)
    }
}

#[cfg(unix)]
mod unix {
    use super::PlatformMemory;
    use crate::{memalloc::GRANULARITY, utils::align};

    use libc::{intptr_t, sbrk};

    use std::{os::raw::c_void, ptr::NonNull};

    /// Grows the heap by moving the program break with `sbrk(2)`.
    #[derive(Default, Debug)]
    pub struct ProgramBreak {
        _private: (),
    }

    impl ProgramBreak {
        pub const fn new() -> Self {
            Self { _private: () }
        }
    }

    #[inline]
    fn failed(addr: *mut c_void) -> bool {
        addr as isize == -1
    }

    impl PlatformMemory for ProgramBreak {
        unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let current = sbrk(0);
                if failed(current) {
                    return None;
                }

                // Someone else may have left the break unaligned.
                let padding = align(current as usize, GRANULARITY) - current as usize;
                let increment = intptr_t::try_from(len.checked_add(padding)?).ok()?;

                let addr = sbrk(increment);
                if failed(addr) {
                    return None;
                }

                NonNull::new(addr.cast::<u8>().add(padding))
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::PlatformMemory;

    use std::{os::raw::c_void, ptr::{self, NonNull}};

    use windows::Win32::System::Memory;

    /// Address space reserved up front. Commits happen inside of it.
    const RESERVATION: usize = 1 << 30;

    /// Windows has no program break, so we build one: a large range of address
    /// space is reserved once and committed upwards as the heap grows.
    #[derive(Debug)]
    pub struct ProgramBreak {
        base: *mut u8,
        committed: usize,
    }

    impl ProgramBreak {
        pub const fn new() -> Self {
            Self { base: ptr::null_mut(), committed: 0 }
        }
    }

    impl Default for ProgramBreak {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PlatformMemory for ProgramBreak {
        unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe {
                if self.base.is_null() {
                    let addr = Memory::VirtualAlloc(
                        None,
                        RESERVATION,
                        Memory::MEM_RESERVE,
                        Memory::PAGE_READWRITE,
                    );
                    self.base = NonNull::new(addr.cast::<u8>())?.as_ptr();
                }

                let end = self.committed.checked_add(len)?;
                if end > RESERVATION {
                    return None;
                }

                let start = self.base.add(self.committed);
                let addr = Memory::VirtualAlloc(
                    Some(start as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );
                if addr.is_null() {
                    return None;
                }

                self.committed = end;
                NonNull::new(start)
            }
        }
    }
}

/// One granule of arena storage. Keeps the arena aligned to [`GRANULARITY`].
#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct Granule([u8; GRANULARITY]);

/// A heap of fixed capacity carved out of a buffer owned by the arena.
///
/// Growing past `capacity` is declined just like the system would decline a
/// `sbrk` call, which makes it handy for bounded heaps and for tests. Blocks
/// allocated from an arena are gone once the arena is dropped.
pub struct FixedArena {
    storage: NonNull<Granule>,
    granules: usize,
    used: usize,
}

impl FixedArena {
    /// Creates an arena holding `capacity` bytes, rounded up to [`GRANULARITY`].
    pub fn new(capacity: usize) -> Self {
        let granules = capacity.div_ceil(GRANULARITY);
        let storage = vec![Granule([0; GRANULARITY]); granules].into_boxed_slice();

        Self {
            storage: NonNull::from(Box::leak(storage)).cast(),
            granules,
            used: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.granules * GRANULARITY
    }

    /// Bytes handed out so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }
}

impl PlatformMemory for FixedArena {
    unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
        let end = self.used.checked_add(len)?;
        if end > self.capacity() {
            return None;
        }

        let start = unsafe { self.storage.cast::<u8>().add(self.used) };
        self.used = end;

        Some(start)
    }
}

impl Drop for FixedArena {
    fn drop(&mut self) {
        unsafe {
            let storage = ptr::slice_from_raw_parts_mut(self.storage.as_ptr(), self.granules);
            drop(Box::from_raw(storage));
        }
    }
}
