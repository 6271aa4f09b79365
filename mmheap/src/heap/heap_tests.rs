use core::ptr;

use membrk::MemArena;

use super::allocator::{MmHeap, Placement};
use super::tag::{MIN_BLOCK_UNITS, UNIT_BYTES};
use crate::error::{clear_error, take_error, HeapError};

/// Bytes the bootstrap commits for the two sentinels.
const BOOTSTRAP_BYTES: usize = (MIN_BLOCK_UNITS + 1) * UNIT_BYTES;

#[ctor::ctor]
static INIT: () = {
    let _ = env_logger::builder().is_test(true).try_init();
    crate::enable_logging();
};

/// A bootstrapped heap whose arena can grow exactly `pages` times.
fn test_heap(pages: usize) -> MmHeap {
    let page = MemArena::new().page_size();
    let mut heap = MmHeap::with_arena(MemArena::with_capacity(BOOTSTRAP_BYTES + pages * page));
    heap.init();
    heap.check_consistency();
    heap
}

fn page_units(heap: &MmHeap) -> usize {
    heap.arena().page_size() / UNIT_BYTES
}

#[track_caller]
fn fill(p: *mut u8, len: usize, seed: u8) {
    for i in 0..len {
        unsafe { p.add(i).write((i as u8).wrapping_mul(31).wrapping_add(seed)) };
    }
}

#[track_caller]
fn verify(p: *mut u8, len: usize, seed: u8) {
    for i in 0..len {
        let got = unsafe { p.add(i).read() };
        assert_eq!(
            got,
            (i as u8).wrapping_mul(31).wrapping_add(seed),
            "payload byte {} corrupted",
            i
        );
    }
}

#[test]
fn bootstrap_commits_only_the_sentinels() {
    let heap = test_heap(1);
    let stats = heap.stats();
    assert_eq!(stats.arena_units, MIN_BLOCK_UNITS + 1);
    assert_eq!(stats.total_blocks, 0);
    assert_eq!(stats.free_blocks, 0);
    assert_eq!(heap.allocation_balance(), 0);
}

#[test]
fn malloc_returns_a_writable_unit_aligned_payload() {
    let mut heap = test_heap(1);
    unsafe {
        let p = heap.malloc(100);
        assert!(!p.is_null());
        assert_eq!(p as usize % UNIT_BYTES, 0);

        fill(p, 100, 7);
        heap.check_consistency();
        verify(p, 100, 7);

        heap.free(p);
    }
    heap.check_consistency();
    assert_eq!(heap.allocation_balance(), 0);
}

#[test]
fn first_malloc_grows_the_arena_by_one_page() {
    let mut heap = test_heap(1);
    let pu = page_units(&heap);
    unsafe {
        let p = heap.malloc(64);
        assert!(!p.is_null());
    }
    let stats = heap.stats();
    assert_eq!(stats.arena_units, MIN_BLOCK_UNITS + 1 + pu);
    assert_eq!(stats.allocated_blocks, 1);
    assert_eq!(stats.free_blocks, 1);
    heap.check_consistency();
}

#[test]
fn payloads_do_not_bleed_into_each_other() {
    let mut heap = test_heap(2);
    let sizes = [64usize, 100, 256, 1, 32, 500];
    let mut ptrs = Vec::new();
    unsafe {
        for (i, &size) in sizes.iter().enumerate() {
            let p = heap.malloc(size);
            assert!(!p.is_null());
            fill(p, size, i as u8);
            ptrs.push(p);
            heap.check_consistency();
        }
        for (i, &size) in sizes.iter().enumerate() {
            verify(ptrs[i], size, i as u8);
        }
        for &p in &ptrs {
            heap.free(p);
            heap.check_consistency();
        }
    }
    // Everything coalesced back into a single span.
    let stats = heap.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_units, stats.arena_units - (MIN_BLOCK_UNITS + 1));
    assert_eq!(heap.allocation_balance(), 0);
}

#[test]
fn released_block_is_reused_lifo() {
    let mut heap = test_heap(1);
    unsafe {
        let a = heap.malloc(64);
        let _b = heap.malloc(64);
        heap.free(a);
        heap.check_consistency();
        let c = heap.malloc(64);
        assert_eq!(c, a);
    }
    heap.check_consistency();
}

#[test]
fn second_release_coalesces_forward() {
    let mut heap = test_heap(1);
    unsafe {
        let a = heap.malloc(64);
        let b = heap.malloc(64);
        heap.free(a);
        heap.check_consistency();
        heap.free(b);
    }
    let stats = heap.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_units, stats.arena_units - (MIN_BLOCK_UNITS + 1));
    heap.check_consistency();
}

#[test]
fn second_release_coalesces_backward() {
    let mut heap = test_heap(1);
    unsafe {
        let a = heap.malloc(64);
        let b = heap.malloc(64);
        heap.free(b);
        heap.check_consistency();
        heap.free(a);
    }
    let stats = heap.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_units, stats.arena_units - (MIN_BLOCK_UNITS + 1));
    heap.check_consistency();
}

#[test]
fn split_carves_from_the_high_address_end() {
    let mut heap = test_heap(1);
    unsafe {
        let a = heap.malloc(64);
        let b = heap.malloc(64);
        // Both come out of one page block, top first.
        assert!((b as usize) < (a as usize));
        assert_eq!(a as usize - b as usize, MIN_BLOCK_UNITS * UNIT_BYTES);
    }
    heap.check_consistency();
}

#[test]
fn block_without_room_for_a_remainder_is_consumed_whole() {
    let mut heap = test_heap(1);
    unsafe {
        let x = heap.malloc(96); // five units: one more than the next request needs
        let _guard = heap.malloc(64);
        heap.free(x);
        let before = heap.stats();

        let y = heap.malloc(64); // four units; a one-unit remainder would be illegal
        assert_eq!(y, x);
        let after = heap.stats();
        assert_eq!(before.free_units - after.free_units, 5);
        assert_eq!(before.free_blocks - after.free_blocks, 1);
    }
    heap.check_consistency();
}

#[test]
fn exhausting_the_arena_triggers_growth() {
    let mut heap = test_heap(2);
    let pu = page_units(&heap);
    unsafe {
        // Consume the first grown page exactly.
        let first = heap.malloc((pu - 2) * UNIT_BYTES);
        assert!(!first.is_null());
        let grown = heap.stats();
        assert_eq!(grown.arena_units, MIN_BLOCK_UNITS + 1 + pu);
        assert_eq!(grown.free_blocks, 0);

        // Nothing left: the next allocation must grow again and succeed.
        let second = heap.malloc(64);
        assert!(!second.is_null());
    }
    let stats = heap.stats();
    let pu_total = 2 * pu;
    assert_eq!(stats.arena_units, MIN_BLOCK_UNITS + 1 + pu_total);
    // Block sizes cover the arena minus the sentinels.
    assert_eq!(
        stats.free_units + pu + MIN_BLOCK_UNITS,
        stats.arena_units - (MIN_BLOCK_UNITS + 1)
    );
    heap.check_consistency();
}

#[test]
fn refused_growth_reports_out_of_memory_and_changes_nothing() {
    let mut heap = test_heap(1);
    let pu = page_units(&heap);
    unsafe {
        let a = heap.malloc(64);
        assert!(!a.is_null());
        let before = heap.stats();

        clear_error();
        let b = heap.malloc(pu * UNIT_BYTES); // cannot fit and cannot grow
        assert!(b.is_null());
        assert_eq!(take_error(), Some(HeapError::OutOfMemory));
        assert_eq!(heap.stats(), before);
        assert_eq!(heap.allocation_balance(), 1);
    }
    heap.check_consistency();
}

#[test]
fn zero_byte_allocation_round_trips_through_free() {
    let mut heap = test_heap(1);
    clear_error();
    unsafe {
        let p = heap.malloc(0);
        assert!(!p.is_null());
        heap.check_consistency();
        heap.free(p);
    }
    assert_eq!(take_error(), None);
    assert_eq!(heap.allocation_balance(), 0);
    heap.check_consistency();
}

#[test]
fn free_null_is_a_no_op() {
    let mut heap = test_heap(1);
    clear_error();
    unsafe { heap.free(ptr::null_mut()) };
    assert_eq!(take_error(), None);
    assert_eq!(heap.allocation_balance(), 0);
}

#[test]
fn interior_pointer_releases_the_enclosing_block() {
    let mut heap = test_heap(1);
    clear_error();
    unsafe {
        let a = heap.malloc(100);
        let _b = heap.malloc(64);
        heap.free(a.add(10)); // unaligned interior pointer, slow path
        assert_eq!(take_error(), None);
        heap.check_consistency();

        let c = heap.malloc(100);
        assert_eq!(c, a);
    }
    heap.check_consistency();
}

#[test]
fn unit_aligned_interior_pointer_falls_back_to_the_walk() {
    let mut heap = test_heap(1);
    clear_error();
    unsafe {
        let a = heap.malloc(4 * UNIT_BYTES);
        a.write_bytes(0, 4 * UNIT_BYTES);
        let _b = heap.malloc(64);

        // Aligned like a payload but pointing into the middle of one: the
        // fast path must refuse it and the walk must still resolve it.
        heap.free(a.add(UNIT_BYTES));
        assert_eq!(take_error(), None);
        heap.check_consistency();

        let c = heap.malloc(4 * UNIT_BYTES);
        assert_eq!(c, a);
    }
    heap.check_consistency();
}

#[test]
fn double_free_sets_the_bad_address_indicator() {
    let mut heap = test_heap(1);
    unsafe {
        let a = heap.malloc(64);
        heap.free(a);
        assert_eq!(take_error(), None);

        heap.free(a);
        assert_eq!(take_error(), Some(HeapError::BadAddress));
    }
    assert_eq!(heap.allocation_balance(), 0);
    heap.check_consistency();
}

#[test]
fn pointers_outside_the_arena_are_refused() {
    let mut heap = test_heap(1);
    unsafe {
        let _a = heap.malloc(64); // commit some arena to have real bounds
        let mut local = 0u8;

        clear_error();
        heap.free(&mut local as *mut u8);
        assert_eq!(take_error(), Some(HeapError::BadAddress));

        heap.free(heap.arena().heap_lo());
        assert_eq!(take_error(), Some(HeapError::BadAddress));
    }
    heap.check_consistency();
}

#[test]
fn realloc_of_null_allocates() {
    let mut heap = test_heap(1);
    unsafe {
        let p = heap.realloc(ptr::null_mut(), 64);
        assert!(!p.is_null());
        heap.free(p);
    }
    assert_eq!(heap.allocation_balance(), 0);
    heap.check_consistency();
}

#[test]
fn realloc_is_in_place_when_the_block_already_fits() {
    let mut heap = test_heap(1);
    unsafe {
        let a = heap.malloc(1024);
        assert!(!a.is_null());
        let before = heap.stats();

        // No shrink in place: the block keeps its size.
        let r = heap.realloc(a, 128);
        assert_eq!(r, a);
        assert_eq!(heap.stats(), before);
    }
    heap.check_consistency();
}

#[test]
fn realloc_moves_and_preserves_the_payload_prefix() {
    let mut heap = test_heap(2);
    unsafe {
        let a = heap.malloc(64);
        fill(a, 62, 3);

        let b = heap.realloc(a, 1024);
        assert!(!b.is_null());
        assert_ne!(b, a);
        verify(b, 62, 3);
        heap.check_consistency();

        // The old payload is dead.
        clear_error();
        heap.free(a);
        assert_eq!(take_error(), Some(HeapError::BadAddress));

        heap.free(b);
    }
    assert_eq!(heap.allocation_balance(), 0);
    heap.check_consistency();
}

#[test]
fn failed_realloc_leaves_the_old_block_untouched() {
    let mut heap = test_heap(1);
    unsafe {
        let a = heap.malloc(64);
        fill(a, 64, 11);

        clear_error();
        let r = heap.realloc(a, heap.arena().capacity());
        assert!(r.is_null());
        assert_eq!(take_error(), Some(HeapError::OutOfMemory));

        verify(a, 64, 11);
        heap.free(a);
        assert_eq!(take_error(), None);
    }
    heap.check_consistency();
}

#[test]
fn realloc_of_a_foreign_pointer_is_refused() {
    let mut heap = test_heap(1);
    unsafe {
        let _a = heap.malloc(64);
        let mut local = 0u8;

        clear_error();
        let r = heap.realloc(&mut local as *mut u8, 128);
        assert!(r.is_null());
        assert_eq!(take_error(), Some(HeapError::BadAddress));
    }
    heap.check_consistency();
}

/// Frees `a` (ten units) and `b` (five units) with allocated guards between
/// them, leaving the anchor on `a`'s block.
unsafe fn two_free_blocks(heap: &mut MmHeap) -> (*mut u8, *mut u8) {
    unsafe {
        let a = heap.malloc(8 * UNIT_BYTES);
        let _g1 = heap.malloc(64);
        let b = heap.malloc(3 * UNIT_BYTES);
        let _g2 = heap.malloc(64);
        heap.free(b);
        heap.free(a);
        heap.check_consistency();
        (a, b)
    }
}

#[test]
fn best_fit_takes_the_smallest_adequate_block() {
    let mut heap = test_heap(1);
    heap.set_placement(Placement::BestFit);
    unsafe {
        let (_a, b) = two_free_blocks(&mut heap);
        // Five units needed: the five-unit block wins over the ten-unit
        // block encountered first.
        let p = heap.malloc(3 * UNIT_BYTES);
        assert_eq!(p, b);
    }
    heap.check_consistency();
}

#[test]
fn first_fit_takes_the_first_adequate_block() {
    let mut heap = test_heap(1);
    unsafe {
        let (a, b) = two_free_blocks(&mut heap);
        // The anchor sits on the ten-unit block; first fit splits its top.
        let p = heap.malloc(3 * UNIT_BYTES);
        assert_ne!(p, b);
        assert_eq!(p as usize, a as usize + 5 * UNIT_BYTES);
    }
    heap.check_consistency();
}

#[test]
fn placement_defaults_to_first_fit() {
    let heap = MmHeap::new();
    assert_eq!(heap.placement(), Placement::FirstFit);

    let mut heap = MmHeap::with_placement(Placement::BestFit);
    assert_eq!(heap.placement(), Placement::BestFit);
    heap.set_placement(Placement::FirstFit);
    assert_eq!(heap.placement(), Placement::FirstFit);
}

#[test]
fn reset_rewinds_to_the_bootstrap_state() {
    let mut heap = test_heap(2);
    unsafe {
        let _a = heap.malloc(64);
        let b = heap.malloc(256);
        heap.free(b);
    }
    heap.reset();
    let stats = heap.stats();
    assert_eq!(stats.arena_units, MIN_BLOCK_UNITS + 1);
    assert_eq!(stats.total_blocks, 0);
    assert_eq!(heap.allocation_balance(), 0);
    heap.check_consistency();

    unsafe {
        let p = heap.malloc(64);
        assert!(!p.is_null());
    }
    heap.check_consistency();
}

#[test]
fn deinit_then_use_rebootstraps() {
    let mut heap = test_heap(1);
    unsafe {
        let _a = heap.malloc(64);
    }
    heap.deinit();
    assert_eq!(heap.stats(), Default::default());

    unsafe {
        let p = heap.malloc(64);
        assert!(!p.is_null());
        heap.free(p);
    }
    heap.check_consistency();
}

#[test]
fn repeated_cycles_do_not_leak_arena() {
    let mut heap = test_heap(1);
    let mut first = ptr::null_mut();
    unsafe {
        for i in 0..100 {
            let p = heap.malloc(64);
            assert!(!p.is_null());
            if i == 0 {
                first = p;
            } else {
                // The same block comes back every round.
                assert_eq!(p, first);
            }
            heap.free(p);
        }
    }
    let stats = heap.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(heap.allocation_balance(), 0);
    heap.check_consistency();
}

#[test]
fn fast_and_slow_identification_agree_on_every_payload() {
    let sizes = [16usize, 64, 200, 96];

    // One heap released through exact payload pointers (fast path)...
    let mut fast = test_heap(1);
    unsafe {
        let ptrs: Vec<_> = sizes.iter().map(|&s| fast.malloc(s)).collect();
        for &p in &ptrs {
            fast.free(p);
            fast.check_consistency();
        }
    }

    // ...and one through interior pointers (slow path) must end up in the
    // same fully coalesced state.
    let mut slow = test_heap(1);
    unsafe {
        let ptrs: Vec<_> = sizes.iter().map(|&s| slow.malloc(s)).collect();
        for (&p, &s) in ptrs.iter().zip(&sizes) {
            slow.free(p.add(s / 2 + 1));
            slow.check_consistency();
        }
    }

    assert_eq!(take_error(), None);
    assert_eq!(fast.stats(), slow.stats());
    assert_eq!(fast.stats().free_blocks, 1);
}
