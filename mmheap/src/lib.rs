//! mmheap - A Boundary-Tagged Free-List Heap
//!
//! An explicit-lifetime allocator over a private, growable arena. Every
//! block carries its size and allocation state in a header and a footer so
//! physical neighbors are reachable from either direction, and free blocks
//! are threaded onto a circular doubly-linked list anchored at a permanent
//! sentinel. Placement is first-fit or best-fit, splits carve the allocated
//! piece from the high-address end of the chosen block, and releases
//! coalesce eagerly with both physical neighbors.
//!
//! The arena itself comes from [`membrk`], which models the program break:
//! the heap grows by whole pages and never returns memory to the host until
//! it is torn down.
//!
//! # Quick start
//!
//! ```rust
//! use mmheap::MmHeap;
//!
//! let mut heap = MmHeap::new();
//! unsafe {
//!     let p = heap.malloc(64);
//!     assert!(!p.is_null());
//!     p.write_bytes(0xA5, 64);
//!     heap.free(p);
//! }
//! ```
//!
//! The process-level entry points (`mm_malloc` and friends) route to one
//! process-wide heap; see [`global`].
//!
//! # Thread safety
//!
//! [`MmHeap`] is single-threaded: every operation takes `&mut self` and no
//! locks are held inside the core. The process-wide wrapper serializes its
//! one instance behind a spin mutex; anything fancier is the caller's job.
#![warn(missing_debug_implementations)]
#![forbid(unsafe_op_in_unsafe_fn)]

use core::sync::atomic::{AtomicBool, Ordering};

#[macro_use]
#[allow(unused_macros)]
pub(crate) mod alog;

pub mod error;
pub mod global;
pub mod heap;

pub use error::{clear_error, last_error, take_error, HeapError};
pub use global::{mm_deinit, mm_free, mm_init, mm_malloc, mm_realloc, mm_reset, GlobalHeap};
pub use heap::allocator::{HeapStats, MmHeap, Placement};

pub(crate) static ALLOC_LOG: AtomicBool = AtomicBool::new(false);

/// Enables logging for the allocator.
pub fn enable_logging() {
    ALLOC_LOG.store(true, Ordering::Relaxed);
}

/// Disables logging for the allocator.
pub fn disable_logging() {
    ALLOC_LOG.store(false, Ordering::Relaxed);
}

pub(crate) fn should_log() -> bool {
    ALLOC_LOG.load(Ordering::Relaxed)
}
