use core::fmt::Debug;
use core::ptr::{self, NonNull};
use std::alloc::{self, Layout};

/// Reservation size used by [`MemArena::new`].
pub const DEFAULT_CAPACITY: usize = 20 * 1024 * 1024;

/// A linear arena that models the program break.
///
/// The full capacity is reserved from the host in [`init`](Self::init) and
/// committed by [`sbrk`](Self::sbrk) in monotonically increasing chunks.
/// The break only moves backwards through [`reset_brk`](Self::reset_brk),
/// which rewinds it to zero without releasing the reservation.
pub struct MemArena {
    /// Base of the reservation. Null while deinitialized.
    base: *mut u8,
    /// Committed bytes from `base`.
    brk: usize,
    /// Reserved bytes behind `base`.
    capacity: usize,
    /// Host page size, cached at construction.
    page_size: usize,
}

// SAFETY: The arena exclusively owns the reservation behind `base`.
unsafe impl Send for MemArena {}

impl MemArena {
    /// Creates an arena with [`DEFAULT_CAPACITY`]. No memory is reserved
    /// until [`init`](Self::init).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an arena with an explicit reservation size. Small capacities
    /// make growth refusal reachable in tests.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "arena capacity must be non-zero");
        Self {
            base: ptr::null_mut(),
            brk: 0,
            capacity,
            page_size: host_page_size(),
        }
    }

    /// Reserves the backing region. A no-op when already initialized.
    ///
    /// The base is aligned to the host page size. Aborts via
    /// [`alloc::handle_alloc_error`] if the host refuses the reservation.
    pub fn init(&mut self) {
        if !self.base.is_null() {
            return;
        }
        let layout = self.layout();
        // SAFETY: `layout` has non-zero size and power-of-two alignment.
        let base = unsafe { alloc::alloc(layout) };
        if base.is_null() {
            alloc::handle_alloc_error(layout);
        }
        self.base = base;
        self.brk = 0;
        log::debug!(
            "arena reserved: base={:p} capacity={:#x} page_size={:#x}",
            base,
            self.capacity,
            self.page_size
        );
    }

    /// Releases the backing region. All pointers into the arena are dead
    /// after this call. A no-op when not initialized.
    pub fn deinit(&mut self) {
        if self.base.is_null() {
            return;
        }
        log::debug!("arena released: base={:p} brk={:#x}", self.base, self.brk);
        // SAFETY: `base` came from `alloc::alloc` with this same layout.
        unsafe { alloc::dealloc(self.base, self.layout()) };
        self.base = ptr::null_mut();
        self.brk = 0;
    }

    /// Rewinds the break to the base without releasing the reservation.
    pub fn reset_brk(&mut self) {
        self.brk = 0;
    }

    /// Moves the break forward by `incr` bytes and returns the start of the
    /// newly committed range, or `None` when the reservation is exhausted.
    ///
    /// `sbrk(0)` returns the current break.
    pub fn sbrk(&mut self, incr: usize) -> Option<NonNull<u8>> {
        debug_assert!(!self.base.is_null(), "sbrk before init");
        if incr > self.capacity - self.brk {
            log::warn!(
                "sbrk refused: incr={:#x} brk={:#x} capacity={:#x}",
                incr,
                self.brk,
                self.capacity
            );
            return None;
        }
        // SAFETY: `brk <= capacity`, so the offset stays inside the
        // reservation.
        let old = unsafe { self.base.add(self.brk) };
        self.brk += incr;
        log::trace!("sbrk: incr={:#x} old_brk={:p}", incr, old);
        NonNull::new(old)
    }

    /// First byte of the committed arena. Null while deinitialized.
    pub fn heap_lo(&self) -> *mut u8 {
        self.base
    }

    /// Last committed byte of the arena. Equals [`heap_lo`](Self::heap_lo)
    /// while nothing is committed.
    pub fn heap_hi(&self) -> *mut u8 {
        if self.brk == 0 {
            return self.base;
        }
        // SAFETY: `brk <= capacity`, so `brk - 1` is inside the reservation.
        unsafe { self.base.add(self.brk - 1) }
    }

    /// Committed bytes between [`heap_lo`](Self::heap_lo) and the break.
    pub fn heap_size(&self) -> usize {
        self.brk
    }

    /// Reservation size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Host page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the backing region is currently reserved.
    pub fn is_initialized(&self) -> bool {
        !self.base.is_null()
    }

    fn layout(&self) -> Layout {
        Layout::from_size_align(self.capacity, self.page_size)
            .expect("arena capacity overflows a layout")
    }
}

impl Default for MemArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemArena {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl Debug for MemArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemArena")
            .field("base", &self.base)
            .field("brk", &self.brk)
            .field("capacity", &self.capacity)
            .field("page_size", &self.page_size)
            .finish()
    }
}

fn host_page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw <= 0 { 4096 } else { raw as usize }
}
