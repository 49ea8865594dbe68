//! Ring configuration and cursor arithmetic.
//!
//! Every bucket ring has a power-of-two number of entries so that a cursor
//! maps onto a slot with a single bitmask instead of a division. Cursors are
//! free-running `u32` counters; only the low bits select the slot.

use crate::shm_layout::bytes_for_ring;

/// Configuration for a bucket ring.
///
/// `entries` must be a power of two and at least 2. One slot is always kept
/// empty to tell "full" apart from "empty", so a ring of `entries` slots holds
/// at most `entries - 1` references.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Number of slots in the ring. Must be a power of 2.
    pub entries: u32,
}

impl RingConfig {
    /// Creates a new ring configuration with the specified number of slots.
    ///
    /// # Panics
    /// Panics if `entries` is not a power of 2 or is smaller than 2.
    ///
    /// # Example
    /// ```
    /// use basalt_ring::RingConfig;
    /// let cfg = RingConfig::new(1024); // OK: 1024 = 2^10
    /// // RingConfig::new(1000);        // Would panic: not a power of 2
    /// ```
    pub fn new(entries: u32) -> Self {
        match Self::try_new(entries) {
            Some(cfg) => cfg,
            None => panic!("ring entries must be a power of 2 and at least 2, got {entries}"),
        }
    }

    /// Fallible variant of [`RingConfig::new`].
    pub fn try_new(entries: u32) -> Option<Self> {
        (entries >= 2 && entries.is_power_of_two()).then_some(Self { entries })
    }

    /// Returns the bitmask for slot selection, `entries - 1`.
    ///
    /// # Example
    /// ```
    /// use basalt_ring::RingConfig;
    /// let cfg = RingConfig::new(8);
    /// assert_eq!(cfg.mask(), 7);  // 0b111 in binary
    /// ```
    #[inline(always)]
    pub fn mask(&self) -> u32 {
        self.entries - 1
    }

    /// Maximum number of references the ring can hold at once.
    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.mask()
    }

    /// Bytes occupied by the ring header plus its slot array.
    pub fn bytes(&self) -> usize {
        bytes_for_ring(self.entries as usize)
    }
}

/// Converts a free-running cursor to a slot index.
///
/// With `entries = 8` (mask = 7 = `0b111`):
/// ```text
/// cursor =  5          → 5
/// cursor =  8          → 0  (wraps around)
/// cursor = u32::MAX    → 7
/// cursor = u32::MAX+1  → 0  (counter wrap lines up with slot wrap)
/// ```
///
/// Because `entries` divides 2^32, the counter wrapping at `u32::MAX` never
/// breaks the slot sequence.
#[inline(always)]
pub fn slot_index(cursor: u32, mask: u32) -> usize {
    (cursor & mask) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(RingConfig::try_new(1000).is_none());
        assert!(RingConfig::try_new(0).is_none());
        assert!(RingConfig::try_new(1).is_none());
        assert_eq!(RingConfig::try_new(2), Some(RingConfig { entries: 2 }));
    }

    #[test]
    #[should_panic(expected = "power of 2")]
    fn new_panics_on_bad_entries() {
        RingConfig::new(12);
    }

    #[test]
    fn slot_index_wraps_with_counter() {
        let mask = RingConfig::new(8).mask();
        assert_eq!(slot_index(u32::MAX, mask), 7);
        assert_eq!(slot_index(u32::MAX.wrapping_add(1), mask), 0);
    }
}
