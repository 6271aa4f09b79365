//! Process-level entry points over one shared heap.
//!
//! The `mm_*` functions route every call to a single process-wide
//! [`MmHeap`] behind a spin mutex, so callers get the classic
//! malloc/free/realloc surface without threading a heap handle around. The
//! wrapper also implements [`GlobalAlloc`] for layouts whose alignment
//! fits the header/footer unit.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt::Debug;
use core::ptr;

use spin::{Mutex, MutexGuard, Once};

use crate::heap::allocator::{HeapStats, MmHeap, Placement};
use crate::heap::tag::UNIT_BYTES;

static PROCESS_HEAP: GlobalHeap = GlobalHeap::new();

/// A lazily constructed heap behind a spin mutex, safe to keep in a
/// static.
///
/// Payload pointers are naturally aligned to the header/footer unit, so
/// the [`GlobalAlloc`] impl serves any layout up to that alignment and
/// refuses stronger ones with null.
///
/// The backing arena is reserved *from the host allocator*, so a
/// `GlobalHeap` must not be registered as the `#[global_allocator]` of the
/// process that backs it; it is meant for explicit use.
pub struct GlobalHeap {
    inner: Once<Mutex<MmHeap>>,
}

impl GlobalHeap {
    /// Creates an empty wrapper. The heap is constructed on first use.
    pub const fn new() -> Self {
        Self { inner: Once::new() }
    }

    fn get(&self) -> MutexGuard<'_, MmHeap> {
        self.inner.call_once(|| Mutex::new(MmHeap::new())).lock()
    }

    /// Bootstraps the heap if it is not already bootstrapped.
    pub fn init(&self) {
        self.get().init();
    }

    /// Rewinds the heap to its bootstrap state.
    pub fn reset(&self) {
        self.get().reset();
    }

    /// Tears the heap down; the next call re-bootstraps.
    pub fn deinit(&self) {
        self.get().deinit();
    }

    /// See [`MmHeap::malloc`].
    ///
    /// # Safety
    /// As [`MmHeap::malloc`].
    #[must_use = "leaks the block unless freed"]
    pub unsafe fn malloc(&self, bytes: usize) -> *mut u8 {
        unsafe { self.get().malloc(bytes) }
    }

    /// See [`MmHeap::free`].
    ///
    /// # Safety
    /// As [`MmHeap::free`].
    pub unsafe fn free(&self, p: *mut u8) {
        unsafe { self.get().free(p) }
    }

    /// See [`MmHeap::realloc`].
    ///
    /// # Safety
    /// As [`MmHeap::realloc`].
    #[must_use = "the block may move; the old pointer is then dead"]
    pub unsafe fn realloc(&self, p: *mut u8, bytes: usize) -> *mut u8 {
        unsafe { self.get().realloc(p, bytes) }
    }

    /// The placement strategy in effect.
    pub fn placement(&self) -> Placement {
        self.get().placement()
    }

    /// Changes the placement strategy.
    pub fn set_placement(&self, placement: Placement) {
        self.get().set_placement(placement);
    }

    /// See [`MmHeap::stats`].
    pub fn stats(&self) -> HeapStats {
        self.get().stats()
    }

    /// See [`MmHeap::check_consistency`].
    pub fn check_consistency(&self) {
        self.get().check_consistency();
    }
}

impl Default for GlobalHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for GlobalHeap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.inner.get() {
            Some(mutex) => match mutex.try_lock() {
                Some(heap) => heap.fmt(f),
                None => write!(f, "GlobalHeap {{ <locked> }}"),
            },
            None => write!(f, "GlobalHeap {{ <unconstructed> }}"),
        }
    }
}

unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > UNIT_BYTES {
            return ptr::null_mut();
        }
        unsafe { self.malloc(layout.size()) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > UNIT_BYTES {
            return ptr::null_mut();
        }
        unsafe { GlobalHeap::realloc(self, ptr, new_size) }
    }
}

/// Bootstraps the process-wide heap if it is not already bootstrapped.
pub fn mm_init() {
    PROCESS_HEAP.init();
}

/// Rewinds the process-wide heap to its bootstrap state.
pub fn mm_reset() {
    PROCESS_HEAP.reset();
}

/// Tears the process-wide heap down; the next call re-bootstraps.
pub fn mm_deinit() {
    PROCESS_HEAP.deinit();
}

/// Allocates from the process-wide heap.
///
/// # Safety
/// As [`MmHeap::malloc`].
#[must_use = "leaks the block unless freed"]
pub unsafe fn mm_malloc(bytes: usize) -> *mut u8 {
    unsafe { PROCESS_HEAP.malloc(bytes) }
}

/// Releases a block of the process-wide heap.
///
/// # Safety
/// As [`MmHeap::free`].
pub unsafe fn mm_free(p: *mut u8) {
    unsafe { PROCESS_HEAP.free(p) }
}

/// Resizes a block of the process-wide heap.
///
/// # Safety
/// As [`MmHeap::realloc`].
#[must_use = "the block may move; the old pointer is then dead"]
pub unsafe fn mm_realloc(p: *mut u8, bytes: usize) -> *mut u8 {
    unsafe { PROCESS_HEAP.realloc(p, bytes) }
}
