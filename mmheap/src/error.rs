//! Errno-style error indicator for the allocator entry points.
//!
//! The allocator reports failure through null returns; the indicator
//! records *why* the last failure happened. It is thread-local, like the
//! errno it models, so concurrent heaps in different threads cannot
//! clobber each other's reports.

use core::fmt;
use std::cell::Cell;

/// Why an allocator entry point failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The free list was exhausted and the arena refused to grow.
    OutOfMemory,
    /// A pointer handed to release or resize does not identify a currently
    /// allocated block. Double frees land here: the identification step
    /// rejects a header whose allocated bit is already clear.
    BadAddress,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory => write!(f, "arena cannot be grown"),
            HeapError::BadAddress => write!(f, "pointer does not identify an allocated block"),
        }
    }
}

thread_local! {
    static LAST_ERROR: Cell<Option<HeapError>> = const { Cell::new(None) };
}

pub(crate) fn set_error(err: HeapError) {
    LAST_ERROR.set(Some(err));
}

/// Returns the most recent failure without clearing it.
pub fn last_error() -> Option<HeapError> {
    LAST_ERROR.get()
}

/// Returns and clears the most recent failure.
pub fn take_error() -> Option<HeapError> {
    LAST_ERROR.replace(None)
}

/// Clears the indicator.
pub fn clear_error() {
    LAST_ERROR.set(None);
}
