//! Lock-free multi-producer, multi-consumer (MPMC) bounded ring.
//!
//! The ring stores opaque `u32` references (buffer offsets in practice) and
//! lives in caller-provided memory, typically a shared memory mapping, so
//! producers and consumers may be threads of one process or separate
//! processes.
//!
//! # Algorithm
//!
//! Four free-running cursors drive the ring:
//!
//! ```text
//!            cons.tail   cons.head          prod.tail   prod.head
//!                │           │                  │           │
//!   ... ─────────┼───────────┼──────────────────┼───────────┼────── ...
//!       recycled │ being read│   readable items │ being     │ free
//!                │           │                  │ written   │
//! ```
//!
//! **put**
//! 1. Load `prod.head` and `cons.tail`; the ring is full when
//!    `mask + cons.tail - prod.head == 0`.
//! 2. CAS `prod.head` forward by one. Winning the CAS reserves the slot.
//! 3. Write the value into the reserved slot.
//! 4. Spin until `prod.tail` equals the reserved cursor, then advance it.
//!    Reservations may finish out of order; publication never does.
//!
//! **get** mirrors this with `cons.head` against `prod.tail`.
//!
//! # Liveness
//!
//! The publish spin in step 4 waits only for reservations made earlier on the
//! same side. A thread (or process) that stalls or dies between steps 2 and 4
//! wedges every later participant on that side. Nothing here retries around
//! that.
//!
//! # Memory Ordering
//!
//! - Slot accesses are `Relaxed`; they are ordered by the tail cursors.
//! - Tail stores are `Release`, and every tail load that gates a slot access
//!   (or a later tail store) is `Acquire`, so publication is transitive along
//!   the chain of waiting producers/consumers.

use crate::ring::slot_index;
use crate::shm_layout::{ConsumerLine, ProducerLine, RingHeader, is_cache_aligned};
use crate::sync::{AtomicU32, Ordering, spin_loop};
use std::fmt;
use std::mem::size_of;
use std::ptr::{self, NonNull};

/// Returned by [`MpmcRing::try_put`] when every usable slot is occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

impl fmt::Display for RingFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ring is full")
    }
}

impl std::error::Error for RingFull {}

/// A process-local view of a ring living in (possibly shared) memory.
///
/// The view caches the capacity mask and holds raw pointers into the mapping;
/// it does not own the memory. Whoever created the view must keep the
/// mapping alive for as long as the view is used.
pub struct MpmcRing {
    header: NonNull<RingHeader>,
    slots: NonNull<AtomicU32>,
    mask: u32,
}

// SAFETY: all shared state is accessed through atomics; the view itself is
// just a pair of pointers and a copy of the immutable mask.
unsafe impl Send for MpmcRing {}
unsafe impl Sync for MpmcRing {}

impl MpmcRing {
    /// Initializes an empty ring at `base` and returns a view of it.
    ///
    /// # Safety
    /// - `base` must be cache-line aligned and valid for reads and writes of
    ///   [`bytes_for_ring(entries)`](crate::shm_layout::bytes_for_ring) bytes
    ///   for as long as any view of the ring exists.
    /// - No other thread or process may access the ring during
    ///   initialization.
    /// - `entries` must be a power of two, at least 2.
    pub unsafe fn init(base: *mut u8, entries: u32) -> Self {
        debug_assert!(entries >= 2 && entries.is_power_of_two());
        debug_assert!(is_cache_aligned(base as usize));

        // SAFETY: the caller guarantees exclusive access to a region large
        // enough for the header and the padded slot array.
        unsafe {
            ptr::write(
                base as *mut RingHeader,
                RingHeader {
                    prod: ProducerLine {
                        head: AtomicU32::new(0),
                        tail: AtomicU32::new(0),
                        mask: entries - 1,
                    },
                    cons: ConsumerLine {
                        head: AtomicU32::new(0),
                        tail: AtomicU32::new(0),
                    },
                },
            );
            let slots = base.add(size_of::<RingHeader>()) as *mut AtomicU32;
            for i in 0..entries as usize {
                ptr::write(slots.add(i), AtomicU32::new(0));
            }
            Self::attach(base)
        }
    }

    /// Returns a view of a ring previously set up by [`MpmcRing::init`],
    /// possibly by another process.
    ///
    /// The mask is read from the shared header. Callers attaching to memory
    /// they did not initialize should compare [`MpmcRing::entries`] with the
    /// value they expect before touching any slot.
    ///
    /// # Safety
    /// `base` must point to an initialized ring that stays mapped for the
    /// lifetime of the view, and the mapping must cover the whole slot array.
    pub unsafe fn attach(base: *mut u8) -> Self {
        // SAFETY: the caller guarantees `base` points at an initialized ring.
        unsafe {
            let header = NonNull::new_unchecked(base as *mut RingHeader);
            let mask = header.as_ref().prod.mask;
            let slots = NonNull::new_unchecked(base.add(size_of::<RingHeader>()) as *mut AtomicU32);
            Self {
                header,
                slots,
                mask,
            }
        }
    }

    #[inline(always)]
    fn header(&self) -> &RingHeader {
        // SAFETY: valid for the lifetime of the view (see `init`/`attach`)
        unsafe { self.header.as_ref() }
    }

    #[inline(always)]
    fn slot(&self, cursor: u32) -> &AtomicU32 {
        // SAFETY: the index is masked into `0..entries`
        unsafe { &*self.slots.as_ptr().add(slot_index(cursor, self.mask)) }
    }

    /// Attempts to enqueue `value`.
    ///
    /// Returns [`RingFull`] without side effects when `entries - 1` values
    /// are already queued. Never blocks beyond the publish-order spin.
    #[inline]
    pub fn try_put(&self, value: u32) -> Result<(), RingFull> {
        let h = self.header();
        let mut head = h.prod.head.load(Ordering::Relaxed);

        loop {
            // Acquire: consumers finished reading the slot we may overwrite.
            let cons_tail = h.cons.tail.load(Ordering::Acquire);
            if self.mask.wrapping_add(cons_tail).wrapping_sub(head) == 0 {
                return Err(RingFull);
            }
            match h.prod.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        self.slot(head).store(value, Ordering::Relaxed);

        // Publish in reservation order.
        while h.prod.tail.load(Ordering::Acquire) != head {
            spin_loop();
        }
        h.prod.tail.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Attempts to dequeue the oldest value.
    ///
    /// Returns `None` when the ring is empty. Never blocks beyond the
    /// publish-order spin.
    #[inline]
    pub fn try_get(&self) -> Option<u32> {
        let h = self.header();
        let mut head = h.cons.head.load(Ordering::Relaxed);

        loop {
            // Acquire: the producer's slot write is visible once published.
            let prod_tail = h.prod.tail.load(Ordering::Acquire);
            if head == prod_tail {
                return None;
            }
            match h.cons.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        let value = self.slot(head).load(Ordering::Relaxed);

        while h.cons.tail.load(Ordering::Acquire) != head {
            spin_loop();
        }
        h.cons.tail.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Number of published, not yet consumed values.
    ///
    /// A snapshot: under concurrent use it may be stale by the time it
    /// returns.
    pub fn len(&self) -> usize {
        let h = self.header();
        // Consumer side first so the difference cannot go negative.
        let cons_tail = h.cons.tail.load(Ordering::Acquire);
        let prod_tail = h.prod.tail.load(Ordering::Acquire);
        prod_tail.wrapping_sub(cons_tail).min(self.mask) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Maximum number of values the ring holds at once (`entries - 1`).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask as usize
    }

    /// Number of slots, including the reserved gap slot.
    #[inline]
    pub fn entries(&self) -> u32 {
        self.mask.wrapping_add(1)
    }

    /// True when no reservation is outstanding on either side.
    ///
    /// A ring that is not quiescent while nobody is using it was abandoned
    /// between reservation and publication.
    pub fn is_quiescent(&self) -> bool {
        let h = self.header();
        h.prod.head.load(Ordering::Acquire) == h.prod.tail.load(Ordering::Acquire)
            && h.cons.head.load(Ordering::Acquire) == h.cons.tail.load(Ordering::Acquire)
    }

    /// Moves all four cursors to `cursor`, emptying the ring.
    #[cfg(all(test, not(feature = "loom")))]
    pub(crate) fn reset_cursors(&self, cursor: u32) {
        let h = self.header();
        for c in [&h.prod.head, &h.prod.tail, &h.cons.head, &h.cons.tail] {
            c.store(cursor, Ordering::SeqCst);
        }
    }

    /// Leaves a producer reservation that is never published.
    #[cfg(any(test, feature = "test-util"))]
    pub fn abandon_reservation(&self) {
        self.header().prod.head.fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MpmcRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.header();
        f.debug_struct("MpmcRing")
            .field("entries", &self.entries())
            .field("prod_head", &h.prod.head.load(Ordering::Relaxed))
            .field("prod_tail", &h.prod.tail.load(Ordering::Relaxed))
            .field("cons_head", &h.cons.head.load(Ordering::Relaxed))
            .field("cons_tail", &h.cons.tail.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use crate::{HeapRing, RingConfig, RingFull};

    #[test]
    fn put_then_get_returns_same_value() {
        let ring = HeapRing::new(RingConfig::new(8));
        ring.try_put(42).unwrap();
        assert_eq!(ring.try_get(), Some(42));
        assert_eq!(ring.try_get(), None);
    }

    #[test]
    fn full_after_entries_minus_one_puts() {
        let ring = HeapRing::new(RingConfig::new(16));
        for i in 0..15 {
            assert_eq!(ring.try_put(i), Ok(()), "put {i}");
        }
        assert!(ring.is_full());
        assert_eq!(ring.len(), 15);
        assert_eq!(ring.try_put(99), Err(RingFull));

        assert_eq!(ring.try_get(), Some(0));
        assert!(!ring.is_full());
        ring.try_put(99).unwrap();
        assert_eq!(ring.try_put(100), Err(RingFull));
    }

    #[test]
    fn empty_ring_reports_none() {
        let ring = HeapRing::new(RingConfig::new(4));
        assert!(ring.is_empty());
        assert_eq!(ring.try_get(), None);
        assert!(ring.is_quiescent());
    }

    #[test]
    fn fifo_across_many_laps() {
        let ring = HeapRing::new(RingConfig::new(4));
        let mut next_out = 0;
        for v in 0..1_000u32 {
            if ring.try_put(v).is_err() {
                assert_eq!(ring.try_get(), Some(next_out));
                next_out += 1;
                ring.try_put(v).unwrap();
            }
        }
        while let Some(v) = ring.try_get() {
            assert_eq!(v, next_out);
            next_out += 1;
        }
        assert_eq!(next_out, 1_000);
    }

    #[test]
    fn cursor_wraparound_keeps_fifo_and_fullness() {
        let ring = HeapRing::new(RingConfig::new(8));
        ring.reset_cursors(u32::MAX - 3);

        for v in 0..7 {
            ring.try_put(v).unwrap();
        }
        assert_eq!(ring.try_put(7), Err(RingFull));
        assert_eq!(ring.len(), 7);

        for v in 0..7 {
            assert_eq!(ring.try_get(), Some(v));
        }
        assert_eq!(ring.try_get(), None);
        assert!(ring.is_quiescent());
    }

    #[test]
    fn abandoned_reservation_is_not_quiescent() {
        let ring = HeapRing::new(RingConfig::new(8));
        ring.abandon_reservation();
        assert!(!ring.is_quiescent());
    }
}
