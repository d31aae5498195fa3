//! Drives the allocator with random allocate / release / resize traffic.
//!
//! ```text
//! cargo run --example memtest [-- "string to copy into every block"]
//! cargo run --example memtest --features system-malloc
//! ```
//!
//! With the `system-malloc` feature the same traffic goes to the platform's
//! `malloc`, `free` and `realloc` instead, for comparison. Set `RUST_LOG=debug`
//! to also see what the allocator itself is doing.

use std::{cmp, env, ffi::CStr, process, ptr};

use log::{error, info};
use rand::Rng;

/// Number of blocks the test juggles.
const TEST_SIZE: usize = 30;

const DEFAULT_TEST_STRING: &str =
    "Now is the time for all good people to come to the aid of their country.";

#[cfg(not(feature = "system-malloc"))]
mod heap {
    use brkalloc::MemAlloc;

    pub struct Heap(MemAlloc);

    impl Heap {
        pub fn new() -> Self {
            Self(MemAlloc::new())
        }

        pub fn malloc(&mut self, size: usize) -> *mut u8 {
            self.0.allocate(size).map_or(std::ptr::null_mut(), |addr| addr.as_ptr())
        }

        pub unsafe fn free(&mut self, ptr: *mut u8) {
            unsafe { self.0.release(ptr) }
        }

        pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
            match unsafe { self.0.resize(ptr, size) } {
                Ok(Some(addr)) => addr.as_ptr(),
                Ok(None) | Err(_) => std::ptr::null_mut(),
            }
        }
    }
}

#[cfg(feature = "system-malloc")]
mod heap {
    pub struct Heap;

    impl Heap {
        pub fn new() -> Self {
            Self
        }

        pub fn malloc(&mut self, size: usize) -> *mut u8 {
            unsafe { libc::malloc(size).cast() }
        }

        pub unsafe fn free(&mut self, ptr: *mut u8) {
            unsafe { libc::free(ptr.cast()) }
        }

        pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
            unsafe { libc::realloc(ptr.cast(), size).cast() }
        }
    }
}

/// Reads the NUL terminated string stored at `ptr`.
unsafe fn contents<'a>(ptr: *mut u8) -> std::borrow::Cow<'a, str> {
    unsafe { CStr::from_ptr(ptr.cast()).to_string_lossy() }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let test_string = env::args().nth(1).unwrap_or_else(|| DEFAULT_TEST_STRING.to_string());
    let test_string = test_string.as_bytes();

    let mut rng = rand::thread_rng();
    let mut heap = heap::Heap::new();

    let mut ptrs = [ptr::null_mut::<u8>(); TEST_SIZE];
    let mut sizes = [0usize; TEST_SIZE];

    for ix in 0..TEST_SIZE {
        // 10% chance to allocate a large chunk.
        let size = if rng.gen_ratio(1, 10) {
            rng.gen_range(1024..=1024 * 1024)
        } else {
            rng.gen_range(1..=test_string.len() + 1)
        };
        sizes[ix] = size;
        info!("[{ix}] size: {size}");

        ptrs[ix] = heap.malloc(size);
        if ptrs[ix].is_null() {
            error!("[{ix}] malloc failed");
            process::exit(1);
        }

        let len_to_copy = cmp::min(test_string.len(), size - 1);

        unsafe {
            ptr::copy_nonoverlapping(test_string.as_ptr(), ptrs[ix], len_to_copy);
            ptrs[ix].add(len_to_copy).write(0);

            info!("[{ix}] '{}'", contents(ptrs[ix]));

            let index_to_free = rng.gen_range(0..=ix);
            if !ptrs[index_to_free].is_null() {
                info!(
                    "[{index_to_free}] randomly freeing {:?} ('{}')",
                    ptrs[index_to_free],
                    contents(ptrs[index_to_free])
                );
                heap.free(ptrs[index_to_free]);
                info!("[{index_to_free}] freed {:?}", ptrs[index_to_free]);
                ptrs[index_to_free] = ptr::null_mut();
            }

            // 20% chance to realloc.
            if rng.gen_ratio(1, 5) {
                let new_size = rng.gen_range(1..=sizes[ix] * 2);
                info!("[{ix}] reallocating {:?} to new size {new_size}", ptrs[ix]);

                ptrs[ix] = heap.realloc(ptrs[ix], new_size);
                if ptrs[ix].is_null() {
                    error!("[{ix}] realloc failed");
                    process::exit(1);
                }
                // A shrink may have cut the terminator off.
                ptrs[ix].add(cmp::min(len_to_copy, new_size - 1)).write(0);

                sizes[ix] = new_size;
                info!("[{ix}] reallocated {:?} to new size {new_size}", ptrs[ix]);
            }
        }
    }

    for (ix, ptr) in ptrs.iter().enumerate() {
        if ptr.is_null() {
            info!("[{ix}] already freed");
            continue;
        }

        unsafe {
            info!("[{ix}] freeing {ptr:?} ({})", contents(*ptr));
            heap.free(*ptr);
        }
        info!("[{ix}] freed {ptr:?}");
    }
}
