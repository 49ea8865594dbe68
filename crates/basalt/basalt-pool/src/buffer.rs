//! Buffer cells and the ownership tag protocol.
//!
//! The slab is an array of [`BufferCell`]s addressed by index ("offset"),
//! never by pointer, so the same offset names the same cell in every process.
//! Each cell carries an owner tag:
//!
//! | tag            | meaning                                      |
//! |----------------|----------------------------------------------|
//! | `0..buckets`   | queued in that bucket                        |
//! | [`IN_FLIGHT`]  | held by exactly one process between get/put  |
//! | [`UNUSED`]     | the gap cell that never circulates           |
//!
//! Tags are written in every build but only verified when [`OWNER_CHECKS`]
//! is on; a mismatch is a bug in the caller and panics.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

/// Payload bytes per buffer.
pub const BUFFER_SIZE: usize = 8192;

/// Owner tag of a buffer held between `get` and `put`.
pub const IN_FLIGHT: i32 = -1;

/// Owner tag of the one cell that is never seeded.
pub const UNUSED: i32 = -2;

/// Whether ownership tags are verified on every get and put.
pub const OWNER_CHECKS: bool = cfg!(any(debug_assertions, feature = "owner-check"));

/// One slot of the slab.
#[repr(C, align(64))]
pub struct BufferCell {
    /// Payload length recorded by the last [`Pool::write`](crate::Pool::write).
    pub len: u32,
    pub owner: AtomicI32,
    pub data: [u8; BUFFER_SIZE],
}

/// Exclusive handle to one buffer taken out of a bucket.
///
/// Not `Clone`: giving it back through `put` consumes it, so the same handle
/// cannot be queued twice.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a buffer that is dropped instead of put back is lost to the pool"]
pub struct Buffer {
    offset: u32,
}

impl Buffer {
    pub(crate) fn new(offset: u32) -> Self {
        Self { offset }
    }

    /// Index of the cell in the slab.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Display adapter for owner tags in panic messages.
pub(crate) struct Tag(pub i32);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            IN_FLIGHT => f.write_str("in flight"),
            UNUSED => f.write_str("unused"),
            b => write!(f, "bucket {b}"),
        }
    }
}

/// Moves `owner` from `from` to `to`.
///
/// With checks enabled the move is a CAS and any other current value panics.
/// Without checks the tag is simply overwritten.
#[inline]
pub(crate) fn transition(owner: &AtomicI32, offset: u32, from: i32, to: i32) {
    if OWNER_CHECKS {
        if let Err(actual) = owner.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire) {
            panic!(
                "buffer ownership violation on buffer {offset}: expected {}, found {}",
                Tag(from),
                Tag(actual)
            );
        }
    } else {
        owner.store(to, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_ring::shm_layout::CACHE_LINE;

    #[test]
    fn cells_are_cache_line_multiples() {
        assert_eq!(std::mem::size_of::<BufferCell>() % CACHE_LINE, 0);
        assert!(std::mem::size_of::<BufferCell>() >= BUFFER_SIZE + 8);
    }

    #[test]
    fn tag_display() {
        assert_eq!(Tag(IN_FLIGHT).to_string(), "in flight");
        assert_eq!(Tag(UNUSED).to_string(), "unused");
        assert_eq!(Tag(3).to_string(), "bucket 3");
    }

    #[test]
    fn transition_moves_tag() {
        let owner = AtomicI32::new(0);
        transition(&owner, 7, 0, IN_FLIGHT);
        assert_eq!(owner.load(Ordering::Relaxed), IN_FLIGHT);
    }

    #[test]
    #[cfg_attr(not(any(debug_assertions, feature = "owner-check")), ignore)]
    #[should_panic(expected = "buffer ownership violation on buffer 7: expected in flight, found bucket 0")]
    fn transition_from_wrong_owner_panics() {
        let owner = AtomicI32::new(0);
        transition(&owner, 7, IN_FLIGHT, 1);
    }
}
