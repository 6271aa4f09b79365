//! membrk - Simulated Break-Pointer Arena
//!
//! Reserves one page-aligned region from the host up front and commits it
//! monotonically through a private break offset, giving allocator crates an
//! `sbrk`-shaped growth primitive they can exhaust deterministically in
//! tests. The region never moves and is never returned to the host until
//! [`MemArena::deinit`] or drop.
#![warn(missing_debug_implementations)]
#![forbid(unsafe_op_in_unsafe_fn)]

mod arena;

pub use arena::{MemArena, DEFAULT_CAPACITY};
