//! # brkalloc
//!
//! A user-space memory allocator. It grows a managed range of memory from the
//! system (the program break on unix, a reserved range of address space on
//! windows) and hands out blocks of it, taking them back for reuse.
//!
//! ```text
//!   brkalloc
//!   ├── kernel     - Heap region manager: grows the managed range
//!   ├── freelist   - Size ordered registry of free regions (min-heap)
//!   ├── region     - Free regions, splitting and merging
//!   ├── block      - Header stored in front of every allocated block
//!   └── memalloc   - MemAlloc: allocate, release, resize
//! ```
//!
//! ```rust,no_run
//! use brkalloc::MemAlloc;
//!
//! let mut allocator = MemAlloc::new();
//!
//! let addr = allocator.allocate(10).unwrap();
//! unsafe {
//!     addr.write(42);
//!     let addr = allocator.resize(addr.as_ptr(), 100).unwrap().unwrap();
//!     assert_eq!(42, addr.read());
//!     allocator.release(addr.as_ptr());
//! }
//! ```
//!
//! The allocator is single threaded and never gives memory back to the system.

mod block;
mod error;
mod freelist;
mod kernel;
mod memalloc;
mod region;
mod utils;

pub use error::AllocError;
pub use kernel::{FixedArena, PlatformMemory, ProgramBreak};
pub use memalloc::{DEFAULT_EXTENT, GRANULARITY, MemAlloc};
pub use region::FreeRegion;
