//! Byte layout of a pool segment.
//!
//! Every process that maps a pool derives all offsets from
//! [`PoolLayout::compute`], so the creator and every attacher agree on where
//! each bucket and the slab start without storing any pointer in the segment.
//!
//! # Memory Layout
//!
//! ```text
//! offset 0            ┌───────────────────────────────────────────────┐
//!                     │ PoolHeader (128B)                             │
//!                     │  size │ entries │ buckets │ notifications     │
//!                     │  refcnt (atomic) │ name[100]                  │
//! bucket_offsets[0]   ├───────────────────────────────────────────────┤
//!                     │ RingHeader (128B) + slots (entries × 4B, pad) │
//! bucket_offsets[1]   ├───────────────────────────────────────────────┤
//!                     │ RingHeader + slots                            │
//!                     ├───────────────────────────────────────────────┤
//!                     │ ...                                           │
//! slab_offset         ├───────────────────────────────────────────────┤
//!                     │ BufferCell[0]  (64B aligned)                  │
//!                     │ BufferCell[1]                                 │
//!                     │ ...                                           │
//!                     │ BufferCell[entries - 1]                       │
//! total_size          └───────────────────────────────────────────────┘
//! ```
//!
//! There is no magic or version field: creator and attachers must be built
//! from the same definitions. Attachers cross-check what they can (size,
//! masks, alignment) and refuse to attach on any difference.

use crate::buffer::BufferCell;
use crate::error::PoolError;
use crate::{MAX_BUCKETS, MAX_ENTRIES, MAX_NAME};
use basalt_ring::shm_layout::{bytes_for_ring, is_cache_aligned};
use std::mem::size_of;
use std::sync::atomic::AtomicU32;

/// Header at offset 0 of every pool segment.
#[repr(C, align(64))]
pub struct PoolHeader {
    /// Total segment size in bytes, fixed at creation.
    pub size: u64,
    /// Slots per bucket ring (power of two).
    pub entries: u32,
    /// Number of bucket rings.
    pub buckets: u32,
    /// Number of notification counters the creator made.
    pub notifications: u32,
    /// Attached processes. 0 until the creator finished initialising.
    pub refcnt: AtomicU32,
    /// Pool name, NUL padded.
    pub name: [u8; MAX_NAME],
}

/// Offsets of every region inside a pool segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLayout {
    pub entries: u32,
    pub buckets: usize,
    /// Bytes taken by one ring header plus its padded slot array.
    pub ring_stride: usize,
    pub bucket_offsets: Vec<usize>,
    pub slab_offset: usize,
    pub total_size: usize,
}

impl PoolLayout {
    /// Computes the layout for a validated geometry (see [`check_geometry`]).
    ///
    /// Bucket 0 starts right after the header and bucket *i* right after
    /// bucket *i − 1*; the slab follows the last bucket.
    pub fn compute(entries: u32, buckets: usize) -> Self {
        let ring_stride = bytes_for_ring(entries as usize);

        let mut bucket_offsets = Vec::with_capacity(buckets);
        let mut cursor = size_of::<PoolHeader>();
        for _ in 0..buckets {
            bucket_offsets.push(cursor);
            cursor += ring_stride;
        }
        let slab_offset = cursor;
        let total_size = slab_offset + entries as usize * size_of::<BufferCell>();

        Self {
            entries,
            buckets,
            ring_stride,
            bucket_offsets,
            slab_offset,
            total_size,
        }
    }

    /// Returns the first region whose address is not cache-line aligned when
    /// the segment is mapped at `base`.
    pub fn misaligned(&self, base: usize) -> Option<(&'static str, usize)> {
        if !is_cache_aligned(base) {
            return Some(("header", base));
        }
        if let Some(&off) = self
            .bucket_offsets
            .iter()
            .find(|&&off| !is_cache_aligned(base + off))
        {
            return Some(("bucket", base + off));
        }
        let slab = base + self.slab_offset;
        (!is_cache_aligned(slab)).then_some(("slab", slab))
    }
}

/// Validates `entries` and `buckets` against the supported ranges.
pub fn check_geometry(entries: u32, buckets: usize) -> Result<(), PoolError> {
    if entries < 2 || entries > MAX_ENTRIES || !entries.is_power_of_two() {
        return Err(PoolError::InvalidEntries {
            entries,
            max: MAX_ENTRIES,
        });
    }
    if !(2..=MAX_BUCKETS).contains(&buckets) {
        return Err(PoolError::InvalidBuckets {
            buckets,
            max: MAX_BUCKETS,
        });
    }
    Ok(())
}

/// Validates a pool name: non-empty, shorter than [`MAX_NAME`], no `/` other
/// than one leading slash, no NUL.
pub fn check_name(name: &str) -> Result<(), PoolError> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || name.len() >= MAX_NAME || bare.contains(['/', '\0']) {
        return Err(PoolError::InvalidName(name.to_owned()));
    }
    Ok(())
}

pub(crate) fn encode_name(name: &str) -> [u8; MAX_NAME] {
    let mut out = [0u8; MAX_NAME];
    let n = name.len().min(MAX_NAME - 1);
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}
