use std::{collections::TryReserveError, error::Error, fmt};

/// Failures reported by the allocator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// The operating system declined to grow the managed range, or the
    /// free region registry could not grow its own storage.
    OutOfMemory,
    /// Extraction from an empty free region registry.
    Underflow,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => f.write_str("out of memory"),
            AllocError::Underflow => f.write_str("free region registry underflow"),
        }
    }
}

impl Error for AllocError {}

impl From<TryReserveError> for AllocError {
    fn from(_: TryReserveError) -> Self {
        AllocError::OutOfMemory
    }
}
