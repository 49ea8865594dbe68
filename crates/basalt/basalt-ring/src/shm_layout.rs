//! Shared memory layout of a single bucket ring.
//!
//! A ring is position independent: it holds no pointers, only cursors and
//! `u32` slot values, so every process can map it at a different address.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────── producer line (64B) ─────────────────────────┐
//! │  head: AtomicU32  │  tail: AtomicU32  │  mask: u32  │  padding        │
//! ├──────────────────────── consumer line (64B) ─────────────────────────┤
//! │  head: AtomicU32  │  tail: AtomicU32  │  padding                      │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │  slots: [AtomicU32; entries]                                          │
//! │  (rounded up to a whole number of cache lines)                        │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Producer and consumer cursors live on separate cache lines so the two
//! sides do not false-share. Padding the slot array keeps whatever follows
//! the ring (the next ring, or the buffer slab) on a cache-line boundary.

use std::mem::size_of;
use crate::sync::AtomicU32;

/// Cache line size assumed by every layout computation.
pub const CACHE_LINE: usize = 64;

/// Low bits that must be zero in a cache-line aligned address.
pub const CACHE_LINE_MASK: usize = CACHE_LINE - 1;

/// Size of one slot of the ring (an opaque `u32` reference).
pub const SLOT_SIZE: usize = size_of::<AtomicU32>();

/// Producer-side cursors plus the immutable capacity mask.
#[repr(C, align(64))]
pub struct ProducerLine {
    /// Next cursor a producer will try to reserve.
    pub head: AtomicU32,
    /// Every cursor below this one is published to consumers.
    pub tail: AtomicU32,
    /// `entries - 1`; written once by the creator.
    pub mask: u32,
}

/// Consumer-side cursors.
#[repr(C, align(64))]
pub struct ConsumerLine {
    /// Next cursor a consumer will try to reserve.
    pub head: AtomicU32,
    /// Every slot below this cursor has been read and may be overwritten.
    pub tail: AtomicU32,
}

/// Header stored at the start of every ring.
#[repr(C)]
pub struct RingHeader {
    pub prod: ProducerLine,
    pub cons: ConsumerLine,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(size_of::<RingHeader>() == 2 * CACHE_LINE);

/// Rounds `n` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Returns true if `addr` sits on a cache-line boundary.
#[inline]
pub const fn is_cache_aligned(addr: usize) -> bool {
    addr & CACHE_LINE_MASK == 0
}

/// Bytes taken by the slot array of a ring with `entries` slots.
pub const fn slot_bytes(entries: usize) -> usize {
    align_up(entries * SLOT_SIZE, CACHE_LINE)
}

/// Calculates the total bytes required for one ring.
///
/// The total size is `header_size + align_up(entries × slot_size, 64)` and is
/// always a multiple of [`CACHE_LINE`].
///
/// # Example
/// ```
/// use basalt_ring::shm_layout::bytes_for_ring;
/// assert_eq!(bytes_for_ring(1024), 128 + 4096);
/// assert_eq!(bytes_for_ring(2), 128 + 64);
/// ```
pub const fn bytes_for_ring(entries: usize) -> usize {
    size_of::<RingHeader>() + slot_bytes(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "loom"))]
    fn cursor_lines_do_not_share_a_cache_line() {
        assert_eq!(std::mem::offset_of!(RingHeader, cons), CACHE_LINE);
        assert_eq!(size_of::<ProducerLine>(), CACHE_LINE);
    }

    #[test]
    fn ring_size_is_cache_line_multiple() {
        for shift in 1..16 {
            assert!(is_cache_aligned(bytes_for_ring(1 << shift)));
        }
    }
}
