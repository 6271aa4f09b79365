use core::fmt::Debug;
use core::ptr;

use membrk::MemArena;

use super::tag::{
    bytes_for_units, footer, header_of_payload, next_neighbor, payload, prev_neighbor,
    set_block_tags, units_for_bytes, HeadFoot, MIN_BLOCK_UNITS, UNIT_BYTES,
};
use crate::error::{self, HeapError};

/// Strategy used to pick a free block for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Walk the free list from the anchor and take the first block that
    /// fits. Fast, tends to fragment near the anchor.
    #[default]
    FirstFit,
    /// Walk the entire free list and take the smallest block that fits,
    /// ties to the first encountered. Always a full walk.
    BestFit,
}

/// Point-in-time census of the arena, sentinels excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Committed arena size in header/footer units, sentinels included.
    pub arena_units: usize,
    /// Blocks between the sentinels.
    pub total_blocks: usize,
    /// Blocks currently handed out.
    pub allocated_blocks: usize,
    /// Blocks on the free list.
    pub free_blocks: usize,
    /// Units covered by free blocks.
    pub free_units: usize,
    /// Size of the largest free block in units.
    pub largest_free_units: usize,
}

/// The free-list heap.
///
/// Owns its arena outright. The anchor points into the circular free list
/// whenever the heap is bootstrapped; the leading sentinel keeps that list
/// permanently non-empty. All operations are synchronous and
/// single-threaded.
pub struct MmHeap {
    arena: MemArena,
    /// Current position in the circular free list. Null until bootstrap.
    anchor: *mut HeadFoot,
    placement: Placement,
    /// Mallocs minus frees that have succeeded so far.
    allocation_balance: isize,
}

// SAFETY: The heap exclusively owns its arena and every pointer into it.
unsafe impl Send for MmHeap {}

impl MmHeap {
    /// Creates a heap over a default-capacity arena. Nothing is reserved
    /// until first use.
    pub fn new() -> Self {
        Self::with_arena(MemArena::new())
    }

    /// Creates a heap with an explicit placement strategy.
    pub fn with_placement(placement: Placement) -> Self {
        let mut heap = Self::new();
        heap.placement = placement;
        heap
    }

    /// Creates a heap over a caller-provided arena. Small arenas make
    /// growth refusal reachable in tests.
    pub fn with_arena(arena: MemArena) -> Self {
        Self {
            arena,
            anchor: ptr::null_mut(),
            placement: Placement::default(),
            allocation_balance: 0,
        }
    }

    /// The placement strategy in effect.
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Changes the placement strategy. Takes effect on the next allocation.
    pub fn set_placement(&mut self, placement: Placement) {
        self.placement = placement;
    }

    /// The arena backing this heap.
    pub fn arena(&self) -> &MemArena {
        &self.arena
    }

    /// Mallocs minus frees that have succeeded so far.
    pub fn allocation_balance(&self) -> isize {
        self.allocation_balance
    }

    /// Reserves the arena and installs the sentinels, if and only if the
    /// heap is not already bootstrapped. Every allocation entry point calls
    /// this, so explicit initialization is optional.
    pub fn init(&mut self) {
        if self.anchor.is_null() {
            self.arena.init();
            self.bootstrap();
        }
    }

    /// Rewinds the arena to its bootstrap size and reinstalls the
    /// sentinels. Every outstanding payload pointer is dead afterwards.
    pub fn reset(&mut self) {
        if self.anchor.is_null() {
            self.init();
        } else {
            self.arena.reset_brk();
            self.bootstrap();
        }
    }

    /// Releases the arena. The next operation re-bootstraps from scratch.
    pub fn deinit(&mut self) {
        self.arena.deinit();
        self.anchor = ptr::null_mut();
        self.allocation_balance = 0;
    }

    /// Installs the boundary sentinels over a fresh break.
    ///
    /// The leading sentinel is a minimum-size allocated pseudo-block whose
    /// links close the free list onto itself; it doubles as the permanent
    /// anchor member. The trailing sentinel is a single allocated unit that
    /// terminates neighbor walks at the high end.
    fn bootstrap(&mut self) {
        let bytes = (MIN_BLOCK_UNITS + 1) * UNIT_BYTES;
        let Some(base) = self.arena.sbrk(bytes) else {
            aerror!("arena too small to bootstrap ({} bytes needed)", bytes);
            return;
        };
        let lead = base.as_ptr().cast::<HeadFoot>();
        unsafe {
            lead.write(HeadFoot::new(MIN_BLOCK_UNITS, true));
            (*lead).prev_free = lead;
            (*lead).next_free = lead;
            lead.add(MIN_BLOCK_UNITS - 1)
                .write(HeadFoot::new(MIN_BLOCK_UNITS, true));
            lead.add(MIN_BLOCK_UNITS).write(HeadFoot::new(1, true));
        }
        self.anchor = lead;
        self.allocation_balance = 0;
        adebug!("heap bootstrapped at {:p}", lead);
    }

    /// Allocates `bytes` and returns the payload address, or null with the
    /// out-of-memory indicator set.
    ///
    /// A zero-byte request yields a minimum-size block whose pointer
    /// round-trips through [`free`](Self::free).
    ///
    /// # Safety
    ///
    /// The returned memory is uninitialized and its lifetime ends at the
    /// matching `free`/`realloc` or at `reset`/`deinit`; the caller must
    /// not touch it past that point.
    #[must_use = "leaks the block unless freed"]
    pub unsafe fn malloc(&mut self, bytes: usize) -> *mut u8 {
        self.init();
        if self.anchor.is_null() {
            error::set_error(HeapError::OutOfMemory);
            return ptr::null_mut();
        }
        self.debug_check();
        let units = Self::request_units(bytes);
        let block = match self.placement {
            Placement::FirstFit => self.place_first_fit(units),
            Placement::BestFit => self.place_best_fit(units),
        };
        let Some(block) = block else {
            aerror!("malloc({}) failed: arena cannot be grown", bytes);
            error::set_error(HeapError::OutOfMemory);
            return ptr::null_mut();
        };
        self.allocation_balance += 1;
        self.debug_check();
        let p = unsafe { payload(block) };
        atrace!("malloc({}) -> {:p} ({} units)", bytes, p, unsafe {
            (*block).size_units()
        });
        p
    }

    /// Releases a payload pointer obtained from this heap.
    ///
    /// Null is a no-op. A pointer that does not land inside a currently
    /// allocated block is refused with the bad-address indicator set;
    /// interior pointers are accepted and resolve to their enclosing block.
    ///
    /// # Safety
    ///
    /// The caller must not use the block after this call. Passing a pointer
    /// into a block that is still in use elsewhere frees it out from under
    /// that user.
    pub unsafe fn free(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        self.debug_check();
        let Some(block) = self.identify(p) else {
            awarn!("free({:p}) refused: not an allocated block", p);
            error::set_error(HeapError::BadAddress);
            return;
        };
        unsafe { self.release_block(block) };
        self.allocation_balance -= 1;
        self.debug_check();
        atrace!("free({:p})", p);
    }

    /// Resizes the block under `p` to at least `bytes` payload bytes.
    ///
    /// Null behaves like [`malloc`](Self::malloc). A block that already
    /// fits is returned unchanged (there is no shrink in place). Otherwise
    /// the payload moves to a fresh block, `min(old payload, bytes)` bytes
    /// are copied, and the old block is released. On failure the old block
    /// is left untouched and null is returned with the indicator set.
    ///
    /// # Safety
    ///
    /// As [`malloc`](Self::malloc) and [`free`](Self::free): the old
    /// pointer is dead whenever the result differs from it.
    #[must_use = "the block may move; the old pointer is then dead"]
    pub unsafe fn realloc(&mut self, p: *mut u8, bytes: usize) -> *mut u8 {
        if p.is_null() {
            return unsafe { self.malloc(bytes) };
        }
        let Some(block) = self.identify(p) else {
            awarn!("realloc({:p}) refused: not an allocated block", p);
            error::set_error(HeapError::BadAddress);
            return ptr::null_mut();
        };
        let have = unsafe { (*block).size_units() };
        if have >= units_for_bytes(bytes) + 2 {
            return p;
        }
        let new = unsafe { self.malloc(bytes) };
        if new.is_null() {
            // Indicator already set; the old block survives.
            return ptr::null_mut();
        }
        let old_payload = bytes_for_units(have - 2).expect("block size was validated");
        unsafe {
            ptr::copy_nonoverlapping(p, new, old_payload.min(bytes));
            self.free(p);
        }
        atrace!("realloc({:p}, {}) -> {:p}", p, bytes, new);
        new
    }

    /// Units a request for `bytes` payload bytes occupies, header and
    /// footer included, floored at the minimum block size.
    fn request_units(bytes: usize) -> usize {
        (units_for_bytes(bytes) + 2).max(MIN_BLOCK_UNITS)
    }

    /// First-fit placement: takes the first free block of at least `units`
    /// reachable from the anchor, growing the arena when the walk wraps
    /// without a hit.
    fn place_first_fit(&mut self, units: usize) -> Option<*mut HeadFoot> {
        unsafe {
            let mut block = self.anchor;
            loop {
                if !(*block).is_allocated() && (*block).size_units() >= units {
                    return Some(self.carve(block, units));
                }
                block = (*block).next_free;
                if block == self.anchor {
                    self.grow(units)?;
                    // The grown block joined the list at the anchor.
                    block = self.anchor;
                }
            }
        }
    }

    /// Best-fit placement: full walk for the smallest adequate block,
    /// growing the arena when nothing fits.
    fn place_best_fit(&mut self, units: usize) -> Option<*mut HeadFoot> {
        unsafe {
            loop {
                if let Some(best) = self.find_best_fit(units) {
                    return Some(self.carve(best, units));
                }
                self.grow(units)?;
            }
        }
    }

    unsafe fn find_best_fit(&self, units: usize) -> Option<*mut HeadFoot> {
        unsafe {
            let mut best: Option<*mut HeadFoot> = None;
            let mut cursor = self.anchor;
            loop {
                if !(*cursor).is_allocated()
                    && (*cursor).size_units() >= units
                    && best.map_or(true, |b| (*cursor).size_units() < (*b).size_units())
                {
                    best = Some(cursor);
                }
                cursor = (*cursor).next_free;
                if cursor == self.anchor {
                    return best;
                }
            }
        }
    }

    /// Takes `units` out of the free block at `block`.
    ///
    /// A block without room for a minimum-size remainder is consumed whole
    /// and unlinked. Otherwise the allocated piece is carved from the
    /// *high-address* end: the remainder keeps the block's list position,
    /// so no links are rewritten.
    ///
    /// # Safety
    /// `block` must be a free block on the list with `size >= units`.
    unsafe fn carve(&mut self, block: *mut HeadFoot, units: usize) -> *mut HeadFoot {
        unsafe {
            let have = (*block).size_units();
            debug_assert!(have >= units);
            if have < units + MIN_BLOCK_UNITS {
                if block == self.anchor {
                    self.anchor = (*block).prev_free;
                }
                Self::unlink(block);
                set_block_tags(block, have, true);
                block
            } else {
                let remainder = have - units;
                set_block_tags(block, remainder, false);
                let carved = block.add(remainder);
                set_block_tags(carved, units, true);
                carved
            }
        }
    }

    /// Extends the arena by at least `min_units`, rounded up to a whole
    /// page, and feeds the new block through the release path so it merges
    /// with a trailing free block and joins the list.
    fn grow(&mut self, min_units: usize) -> Option<()> {
        let units = min_units.max(units_for_bytes(self.arena.page_size()));
        let incr = self.arena.sbrk(bytes_for_units(units)?)?;
        unsafe {
            // The old trailing sentinel's unit becomes the new header.
            let block = incr.as_ptr().cast::<HeadFoot>().sub(1);
            set_block_tags(block, units, false);
            block.add(units).write(HeadFoot::new(1, true));
            adebug!("arena grown by {} units", units);
            self.release_block(block);
        }
        Some(())
    }

    /// Splices `block` out of the free list.
    ///
    /// # Safety
    /// `block` must be on the list and must not be the anchor.
    unsafe fn unlink(block: *mut HeadFoot) {
        unsafe {
            let next = (*block).next_free;
            let prev = (*block).prev_free;
            (*prev).next_free = next;
            (*next).prev_free = prev;
        }
    }

    /// Inserts `block` right after the anchor and makes it the new anchor
    /// (LIFO discipline).
    ///
    /// # Safety
    /// `block` must be a free block that is not on the list.
    unsafe fn insert_after_anchor(&mut self, block: *mut HeadFoot) {
        unsafe {
            let anchor = self.anchor;
            let after = (*anchor).next_free;
            (*block).prev_free = anchor;
            (*block).next_free = after;
            (*after).prev_free = block;
            (*anchor).next_free = block;
        }
        self.anchor = block;
    }

    /// Marks `block` free, merges it with free physical neighbors and
    /// leaves the anchor on the coalesced block.
    ///
    /// The lower merge runs first: a free predecessor is already on the
    /// list, so the block melts into it in place. Only an isolated block is
    /// inserted. The upper merge then absorbs a free successor after
    /// unlinking it, so at most one list entry is ever added.
    ///
    /// # Safety
    /// `block` must be a validly tagged block that is not on the free list.
    unsafe fn release_block(&mut self, block: *mut HeadFoot) {
        unsafe {
            let mut block = block;
            let mut units = (*block).size_units();
            set_block_tags(block, units, false);
            if !(*block.sub(1)).is_allocated() {
                let pred = prev_neighbor(block);
                units += (*pred).size_units();
                block = pred;
                set_block_tags(block, units, false);
            } else {
                self.insert_after_anchor(block);
            }
            self.anchor = block;
            let next = next_neighbor(block);
            if !(*next).is_allocated() {
                Self::unlink(next);
                units += (*next).size_units();
                set_block_tags(block, units, false);
            }
        }
    }

    /// Resolves a caller pointer to the header of its enclosing allocated
    /// block.
    ///
    /// Unit-aligned pointers are tried as payload addresses first: the
    /// candidate header one unit below must be allocated, of legal size and
    /// in agreement with its footer. Anything else falls back to walking
    /// the block chain from the leading sentinel, which accepts interior
    /// pointers. Both paths refuse the sentinels.
    fn identify(&self, p: *mut u8) -> Option<*mut HeadFoot> {
        if p.is_null() || self.anchor.is_null() {
            return None;
        }
        let lo = self.arena.heap_lo();
        let hi = self.arena.heap_hi();
        if p <= lo || p >= hi {
            return None;
        }
        unsafe {
            if (p as usize) % UNIT_BYTES == 0 {
                let candidate = header_of_payload(p);
                if self.is_coherent_block(candidate) {
                    return Some(candidate);
                }
            }
            let mut block = lo.cast::<HeadFoot>();
            let mut next = next_neighbor(block);
            while next.cast::<u8>() <= p {
                block = next;
                next = next_neighbor(block);
            }
            if (*block).is_allocated() && !self.is_sentinel(block) {
                Some(block)
            } else {
                None
            }
        }
    }

    /// Whether `candidate` looks like the header of a live allocated
    /// block: allocated, of legal size, footer inside the arena and in
    /// full agreement.
    ///
    /// # Safety
    /// `candidate` must point at a readable unit inside the arena.
    unsafe fn is_coherent_block(&self, candidate: *mut HeadFoot) -> bool {
        unsafe {
            if self.is_sentinel(candidate) || !(*candidate).is_allocated() {
                return false;
            }
            let units = (*candidate).size_units();
            if units < MIN_BLOCK_UNITS {
                return false;
            }
            // Bound the footer before reading through a garbage size.
            let Some(span) = bytes_for_units(units - 1) else {
                return false;
            };
            let hi = self.arena.heap_hi() as usize;
            let foot_end = (candidate as usize)
                .checked_add(span)
                .and_then(|addr| addr.checked_add(UNIT_BYTES));
            match foot_end {
                Some(end) if end <= hi + 1 => {
                    let foot = candidate.cast::<u8>().add(span).cast::<HeadFoot>();
                    (*foot).size_units() == units && (*foot).is_allocated()
                }
                _ => false,
            }
        }
    }

    /// # Safety
    /// `block` must point at a readable unit inside the arena.
    unsafe fn is_sentinel(&self, block: *mut HeadFoot) -> bool {
        block.cast::<u8>() == self.arena.heap_lo()
            || unsafe { (*block).size_units() } < MIN_BLOCK_UNITS
    }

    /// Walks the arena and reports its census. Zeroed before bootstrap.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        if self.anchor.is_null() {
            return stats;
        }
        stats.arena_units = self.arena.heap_size() / UNIT_BYTES;
        unsafe {
            let lo = self.arena.heap_lo().cast::<HeadFoot>();
            let tail = lo.add(stats.arena_units - 1);
            let mut block = lo.add(MIN_BLOCK_UNITS);
            while block < tail {
                let units = (*block).size_units();
                stats.total_blocks += 1;
                if (*block).is_allocated() {
                    stats.allocated_blocks += 1;
                } else {
                    stats.free_blocks += 1;
                    stats.free_units += units;
                    stats.largest_free_units = stats.largest_free_units.max(units);
                }
                block = block.add(units);
            }
        }
        stats
    }

    /// Logs a one-line census through the gated macros.
    pub fn print_state(&self) {
        let stats = self.stats();
        ainfo!(
            "heap: {} units committed, {} blocks ({} allocated, {} free over {} units, largest {}), balance {}",
            stats.arena_units,
            stats.total_blocks,
            stats.allocated_blocks,
            stats.free_blocks,
            stats.free_units,
            stats.largest_free_units,
            self.allocation_balance
        );
    }

    /// Verifies every structural invariant of the arena and panics on the
    /// first violation. Debug builds run this at the public entry points;
    /// tests call it after every operation.
    #[track_caller]
    pub fn check_consistency(&self) {
        if self.anchor.is_null() {
            return;
        }
        let unit_total = self.arena.heap_size() / UNIT_BYTES;
        assert!(
            unit_total > MIN_BLOCK_UNITS,
            "arena smaller than its sentinels"
        );
        unsafe {
            let lo = self.arena.heap_lo().cast::<HeadFoot>();
            let tail = lo.add(unit_total - 1);

            assert!(
                (*lo).is_allocated() && (*lo).size_units() == MIN_BLOCK_UNITS,
                "leading sentinel header corrupted"
            );
            assert!(
                (*footer(lo)).is_allocated() && (*footer(lo)).size_units() == MIN_BLOCK_UNITS,
                "leading sentinel footer corrupted"
            );
            assert!(
                (*tail).is_allocated() && (*tail).size_units() == 1,
                "trailing sentinel corrupted"
            );

            let mut block = lo.add(MIN_BLOCK_UNITS);
            let mut walked = MIN_BLOCK_UNITS + 1;
            let mut free_blocks = 0usize;
            let mut prev_was_free = false;
            while block < tail {
                let units = (*block).size_units();
                assert!(units >= MIN_BLOCK_UNITS, "undersized block at {block:p}");
                let foot = footer(block);
                assert!(foot < tail, "block at {block:p} runs past the arena");
                assert_eq!(
                    (*foot).size_units(),
                    units,
                    "header/footer size mismatch at {block:p}"
                );
                assert_eq!(
                    (*foot).is_allocated(),
                    (*block).is_allocated(),
                    "header/footer state mismatch at {block:p}"
                );
                if (*block).is_allocated() {
                    prev_was_free = false;
                } else {
                    assert!(!prev_was_free, "uncoalesced free neighbors at {block:p}");
                    prev_was_free = true;
                    free_blocks += 1;
                }
                walked += units;
                block = block.add(units);
            }
            assert_eq!(block, tail, "block walk missed the trailing sentinel");
            assert_eq!(walked, unit_total, "block sizes do not cover the arena");

            let mut listed_free = 0usize;
            let mut listed_sentinels = 0usize;
            let mut cursor = self.anchor;
            loop {
                assert_eq!(
                    (*(*cursor).next_free).prev_free,
                    cursor,
                    "free-list links broken at {cursor:p}"
                );
                if cursor == lo {
                    listed_sentinels += 1;
                } else {
                    assert!(
                        !(*cursor).is_allocated(),
                        "allocated block {cursor:p} on the free list"
                    );
                    listed_free += 1;
                }
                assert!(
                    listed_free + listed_sentinels <= unit_total,
                    "free list does not close"
                );
                cursor = (*cursor).next_free;
                if cursor == self.anchor {
                    break;
                }
            }
            assert_eq!(listed_sentinels, 1, "list anchor sentinel missing");
            assert_eq!(
                listed_free, free_blocks,
                "free list disagrees with the block walk"
            );
        }
    }

    fn debug_check(&self) {
        if cfg!(debug_assertions) {
            self.check_consistency();
        }
    }
}

impl Default for MmHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MmHeap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmHeap")
            .field("arena", &self.arena)
            .field("anchor", &self.anchor)
            .field("placement", &self.placement)
            .field("allocation_balance", &self.allocation_balance)
            .field("stats", &self.stats())
            .finish()
    }
}
