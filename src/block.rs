use std::{mem, ptr::NonNull};
use crate::memalloc::GRANULARITY;


/// Header size of a block. The header takes a full granule so the address we
/// hand out right after it keeps the granularity alignment.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

const _: () = assert!(BLOCK_HEADER_SIZE == GRANULARITY);

/// This is the structure of an allocated block. The header is its metadata,
/// content is placed right after it.
///
/// ```text
/// +---------------------+ <------+  <- block start (inside a former FreeRegion)
/// |        size         |        |
/// +---------------------+        | -> Header (one granule)
/// |       padding       |        |
/// +---------------------+ <------+  <- address returned to the user
/// |       Content       |        |
/// |         ...         |        | -> `size` bytes of addressable content
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
///
/// Free regions carry no header: only blocks that are in use have one. When a
/// block is released the header is read back to know how much memory goes back
/// to the [`crate::freelist::FreeList`], header included.
#[repr(C, align(16))]
pub(crate) struct Block {
    /// Size of the content of the block, a multiple of [`GRANULARITY`].
    pub size: usize,
}

impl Block {
    /// Writes a header for a block of `size` content bytes at `start` and
    /// returns the address of the content.
    ///
    /// **SAFETY**: `start` must be valid for writes of `BLOCK_HEADER_SIZE + size`
    /// bytes and aligned to [`GRANULARITY`].
    pub unsafe fn write(start: NonNull<u8>, size: usize) -> NonNull<u8> {
        unsafe {
            start.cast::<Block>().write(Block { size });
            start.add(BLOCK_HEADER_SIZE)
        }
    }

    /// Returns the header of the block whose content starts at `addr`.
    ///
    /// **SAFETY**: `addr` must have been returned by [`Block::write`] and the
    /// block must still be in use.
    pub unsafe fn from_content(addr: NonNull<u8>) -> NonNull<Block> {
        unsafe { addr.sub(BLOCK_HEADER_SIZE).cast() }
    }

    /// First byte of the block, header included.
    pub unsafe fn start(addr: NonNull<u8>) -> NonNull<u8> {
        unsafe { addr.sub(BLOCK_HEADER_SIZE) }
    }

    /// Bytes the block takes from the managed range, header included.
    #[inline]
    pub fn footprint(&self) -> usize {
        BLOCK_HEADER_SIZE + self.size
    }
}
