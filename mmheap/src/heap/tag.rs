//! The header/footer unit and the arithmetic over it.
//!
//! Every block begins and ends with a [`HeadFoot`]: the same record serves
//! as header at the block's low end and footer at its high end, and one
//! unit is also the allocator's alignment quantum. All unchecked index
//! arithmetic over the arena lives in this module; everything above it
//! deals in whole blocks.

use core::mem;
use core::ptr;

/// Smallest legal block: header + two payload units + footer.
pub const MIN_BLOCK_UNITS: usize = 4;

/// Bytes per header/footer unit.
pub const UNIT_BYTES: usize = mem::size_of::<HeadFoot>();

/// One boundary-tag unit.
///
/// `tag` packs the block size in units into all but the lowest bit of the
/// word; bit 0 is the allocated flag. The link fields are meaningful only
/// in the *header* of a *free* block. A footer's links are never read.
#[repr(C, align(32))]
#[derive(Debug)]
pub struct HeadFoot {
    pub(crate) prev_free: *mut HeadFoot,
    pub(crate) next_free: *mut HeadFoot,
    tag: usize,
}

impl HeadFoot {
    pub(crate) fn new(units: usize, allocated: bool) -> Self {
        Self {
            prev_free: ptr::null_mut(),
            next_free: ptr::null_mut(),
            tag: pack(units, allocated),
        }
    }

    /// Block size in whole units, header and footer included.
    pub fn size_units(&self) -> usize {
        self.tag >> 1
    }

    /// Whether the containing block is currently handed out.
    pub fn is_allocated(&self) -> bool {
        self.tag & 1 == 1
    }
}

fn pack(units: usize, allocated: bool) -> usize {
    debug_assert!(units < usize::MAX >> 1, "block size overflows the tag");
    units << 1 | allocated as usize
}

/// Units needed to hold `bytes` payload bytes.
pub fn units_for_bytes(bytes: usize) -> usize {
    bytes.div_ceil(UNIT_BYTES)
}

/// Byte count of `units` whole units, or `None` on overflow.
pub fn bytes_for_units(units: usize) -> Option<usize> {
    units.checked_mul(UNIT_BYTES)
}

/// First payload byte of `block`.
///
/// # Safety
/// `block` must be the header of a block of at least two units.
pub unsafe fn payload(block: *mut HeadFoot) -> *mut u8 {
    unsafe { block.add(1).cast() }
}

/// Header of the block whose payload starts at `p`.
///
/// # Safety
/// `p` must be one unit past a block header.
pub unsafe fn header_of_payload(p: *mut u8) -> *mut HeadFoot {
    unsafe { p.cast::<HeadFoot>().sub(1) }
}

/// Footer of `block`, one unit below its high end.
///
/// # Safety
/// `block` must be the header of a block whose tag is initialized and whose
/// full span lies inside the arena.
pub unsafe fn footer(block: *mut HeadFoot) -> *mut HeadFoot {
    unsafe { block.add((*block).size_units() - 1) }
}

/// Header of the physical successor of `block`.
///
/// The trailing sentinel guarantees the result is always a readable header.
///
/// # Safety
/// As [`footer`].
pub unsafe fn next_neighbor(block: *mut HeadFoot) -> *mut HeadFoot {
    unsafe { block.add((*block).size_units()) }
}

/// Header of the physical predecessor of `block`, located through the
/// predecessor's footer at `block[-1]`.
///
/// The leading sentinel guarantees that footer is always readable.
///
/// # Safety
/// `block` must be a block header strictly above the leading sentinel.
pub unsafe fn prev_neighbor(block: *mut HeadFoot) -> *mut HeadFoot {
    unsafe { block.sub((*block.sub(1)).size_units()) }
}

/// Rewrites the boundary tags of a block in agreement: the header keeps its
/// link fields, the footer unit is initialized outright.
///
/// # Safety
/// `block` must point at a readable header and `units` must not run past
/// the arena's trailing sentinel.
pub(crate) unsafe fn set_block_tags(block: *mut HeadFoot, units: usize, allocated: bool) {
    unsafe {
        (*block).tag = pack(units, allocated);
        if units > 1 {
            block.add(units - 1).write(HeadFoot::new(units, allocated));
        }
    }
}
