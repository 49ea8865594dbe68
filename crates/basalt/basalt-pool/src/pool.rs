//! Process-local handle to a shared buffer pool.

use crate::buffer::{self, BUFFER_SIZE, Buffer, BufferCell, IN_FLIGHT, UNUSED};
use crate::error::PoolError;
use crate::layout::{PoolHeader, PoolLayout, check_geometry, check_name, encode_name};
use crate::notify::Notifier;
use crate::{MAX_FDS, OWNER_CHECKS};
use basalt_mmap::{ShmSegment, UnlinkGuard};
use basalt_ring::MpmcRing;
use basalt_ring::shm_layout::is_cache_aligned;
use std::fmt;
use std::io;
use std::mem::size_of;
use std::os::fd::OwnedFd;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Bucket 0 holds every free buffer.
pub const FREE_LIST: usize = 0;

/// Outcome of detaching from a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    /// Other holders remain; the segment stays alive.
    Released { remaining: u32 },
    /// This was the last holder; the segment name is gone.
    Destroyed,
}

/// Outcome of [`Pool::transfer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Transfer {
    Moved,
    SourceEmpty,
    /// The destination had no room; the buffer is still in flight.
    DestinationFull(Buffer),
}

/// A mapped pool: header, bucket rings and buffer slab.
///
/// Every handle holds one reference on the shared refcount. Dropping the
/// handle releases it; the holder that releases the last reference unlinks
/// the segment.
pub struct Pool {
    name: String,
    base: NonNull<u8>,
    layout: PoolLayout,
    rings: Vec<MpmcRing>,
    slab: NonNull<BufferCell>,
    notifiers: Vec<Notifier>,
    detached: bool,
    // Must outlive every pointer above.
    _segment: ShmSegment,
}

// SAFETY: the raw pointers point into `_segment`, which lives as long as the
// handle; all state shared between threads is atomic or owned by exactly one
// buffer holder at a time.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Creates and initialises a new pool segment named `name`.
    ///
    /// Bucket 0 starts out holding buffers `0..entries - 1`. The segment only
    /// becomes attachable once everything is written.
    pub fn create(
        name: &str,
        entries: u32,
        buckets: usize,
        notifications: usize,
    ) -> Result<Self, PoolError> {
        check_name(name)?;
        check_geometry(entries, buckets)?;
        if notifications > MAX_FDS {
            return Err(PoolError::TooManyNotifications {
                requested: notifications,
                max: MAX_FDS,
            });
        }

        let layout = PoolLayout::compute(entries, buckets);
        let mut segment =
            ShmSegment::create(name, layout.total_size).map_err(|source| PoolError::Resource {
                op: "shm create",
                name: name.to_owned(),
                source,
            })?;
        let mut unlink = UnlinkGuard::new(name);

        let base = segment.as_mut_ptr();
        if let Some((region, addr)) = layout.misaligned(base as usize) {
            tracing::error!(
                name,
                region,
                addr = format_args!("{addr:#x}"),
                "pool region is not cache-line aligned"
            );
            drop(unlink);
            std::process::abort();
        }

        let notifiers = (0..notifications)
            .map(|_| Notifier::new())
            .collect::<io::Result<Vec<_>>>()
            .map_err(|source| PoolError::Resource {
                op: "eventfd",
                name: name.to_owned(),
                source,
            })?;

        // SAFETY: the mapping is fresh, exclusively ours, covers
        // `layout.total_size` bytes and every region is cache aligned.
        let rings = unsafe {
            ptr::write(
                base as *mut PoolHeader,
                PoolHeader {
                    size: layout.total_size as u64,
                    entries,
                    buckets: buckets as u32,
                    notifications: notifications as u32,
                    refcnt: AtomicU32::new(0),
                    name: encode_name(name),
                },
            );
            layout
                .bucket_offsets
                .iter()
                .map(|&off| MpmcRing::init(base.add(off), entries))
                .collect::<Vec<_>>()
        };

        // SAFETY: in bounds and aligned, checked above
        let slab = unsafe { NonNull::new_unchecked(base.add(layout.slab_offset) as *mut BufferCell) };
        for offset in 0..entries {
            let tag = if offset == entries - 1 { UNUSED } else { FREE_LIST as i32 };
            // SAFETY: `offset < entries`; nobody else sees the segment yet
            unsafe {
                let cell = slab.as_ptr().add(offset as usize);
                ptr::addr_of_mut!((*cell).len).write(0);
                ptr::addr_of_mut!((*cell).owner).write(AtomicI32::new(tag));
            }
        }
        for offset in 0..entries - 1 {
            if rings[FREE_LIST].try_put(offset).is_err() {
                return Err(PoolError::Layout {
                    name: name.to_owned(),
                    reason: format!("free list overflowed while seeding buffer {offset}"),
                });
            }
        }

        // SAFETY: header written above
        let header = unsafe { &*(base as *const PoolHeader) };
        header.refcnt.store(1, Ordering::Release);
        unlink.disarm();

        let pool = Self {
            name: name.to_owned(),
            // SAFETY: mmap never returns null on success
            base: unsafe { NonNull::new_unchecked(base) },
            layout,
            rings,
            slab,
            notifiers,
            detached: false,
            _segment: segment,
        };
        pool.trace_layout("pool created");
        Ok(pool)
    }

    /// Attaches to an existing pool created by another handle or process.
    ///
    /// The layout is recomputed from the header and cross-checked against the
    /// mapping; on any mismatch the refcount increment is rolled back.
    /// Notification counters are not inherited, see
    /// [`Pool::adopt_notifiers`].
    pub fn register(name: &str) -> Result<Self, PoolError> {
        check_name(name)?;
        let mut segment = ShmSegment::open(name).map_err(|source| PoolError::Resource {
            op: "shm open",
            name: name.to_owned(),
            source,
        })?;
        let mapped = segment.len();
        let base = segment.as_mut_ptr();
        let layout_err = |reason: String| PoolError::Layout {
            name: name.to_owned(),
            reason,
        };

        // A creator that has not sized the object yet is still initialising.
        if mapped < size_of::<PoolHeader>() {
            return Err(PoolError::NotAttachable {
                name: name.to_owned(),
            });
        }
        if !is_cache_aligned(base as usize) {
            return Err(layout_err(format!("segment mapped at unaligned address {base:p}")));
        }

        // SAFETY: the mapping covers at least a header and is aligned
        let header = unsafe { &*(base as *const PoolHeader) };
        acquire_ref(&header.refcnt).ok_or_else(|| PoolError::NotAttachable {
            name: name.to_owned(),
        })?;
        let mut rollback = RefcountGuard {
            refcnt: &header.refcnt,
            name,
            armed: true,
        };

        let entries = header.entries;
        let buckets = header.buckets as usize;
        check_geometry(entries, buckets).map_err(|e| layout_err(e.to_string()))?;

        let layout = PoolLayout::compute(entries, buckets);
        if header.size != layout.total_size as u64 {
            return Err(layout_err(format!(
                "header size {} != computed size {}",
                header.size, layout.total_size
            )));
        }
        if mapped != layout.total_size {
            return Err(layout_err(format!(
                "mapped {mapped} bytes, expected {}",
                layout.total_size
            )));
        }
        if let Some((region, addr)) = layout.misaligned(base as usize) {
            return Err(layout_err(format!("{region} at {addr:#x} is not cache-line aligned")));
        }

        // SAFETY: every bucket offset lies inside the checked mapping
        let rings = layout
            .bucket_offsets
            .iter()
            .map(|&off| unsafe { MpmcRing::attach(base.add(off)) })
            .collect::<Vec<_>>();
        if let Some((i, ring)) = rings.iter().enumerate().find(|(_, r)| r.entries() != entries) {
            return Err(layout_err(format!(
                "bucket {i} has {} entries, header says {entries}",
                ring.entries()
            )));
        }

        rollback.armed = false;
        let pool = Self {
            name: name.to_owned(),
            // SAFETY: mmap never returns null on success
            base: unsafe { NonNull::new_unchecked(base) },
            // SAFETY: slab offset checked against the mapping above
            slab: unsafe { NonNull::new_unchecked(base.add(layout.slab_offset) as *mut BufferCell) },
            layout,
            rings,
            notifiers: Vec::new(),
            detached: false,
            _segment: segment,
        };
        pool.trace_layout("pool attached");
        Ok(pool)
    }

    /// Releases this handle's reference and reports whether the segment was
    /// destroyed. Dropping the handle does the same.
    pub fn unregister(mut self) -> Detach {
        self.detach()
    }

    fn detach(&mut self) -> Detach {
        self.detached = true;
        let prev = self.header().refcnt.fetch_sub(1, Ordering::AcqRel);
        if prev > 1 {
            tracing::debug!(name = %self.name, remaining = prev - 1, "pool released");
            return Detach::Released { remaining: prev - 1 };
        }

        let stuck: Vec<usize> = self
            .rings
            .iter()
            .enumerate()
            .filter(|(_, ring)| !ring.is_quiescent())
            .map(|(i, _)| i)
            .collect();
        for &bucket in &stuck {
            tracing::error!(
                name = %self.name,
                bucket,
                ring = ?self.rings[bucket],
                "bucket stuck mid-operation at teardown"
            );
        }
        if let Err(e) = ShmSegment::unlink(&self.name) {
            tracing::warn!(name = %self.name, error = %e, "failed to unlink pool segment");
        }
        tracing::debug!(name = %self.name, "pool destroyed");

        if OWNER_CHECKS && !stuck.is_empty() && !std::thread::panicking() {
            panic!(
                "pool '{}' destroyed with buckets {stuck:?} stuck mid-operation",
                self.name
            );
        }
        Detach::Destroyed
    }

    /// Takes the oldest buffer out of `bucket`, or `None` if it is empty.
    ///
    /// # Panics
    /// If `bucket` is out of range, or (with ownership checks) if the buffer
    /// was not tagged as belonging to `bucket`.
    #[inline]
    pub fn get(&self, bucket: usize) -> Option<Buffer> {
        let offset = self.ring(bucket).try_get()?;
        buffer::transition(self.owner(offset), offset, bucket as i32, IN_FLIGHT);
        Some(Buffer::new(offset))
    }

    /// Queues `buf` on `bucket`. Hands the buffer back if the bucket is full.
    ///
    /// # Panics
    /// If `bucket` is out of range, or (with ownership checks) if the buffer
    /// is not in flight.
    #[inline]
    pub fn put(&self, bucket: usize, buf: Buffer) -> Result<(), Buffer> {
        let ring = self.ring(bucket);
        let owner = self.owner(buf.offset());
        buffer::transition(owner, buf.offset(), IN_FLIGHT, bucket as i32);
        match ring.try_put(buf.offset()) {
            Ok(()) => Ok(()),
            Err(_) => {
                buffer::transition(owner, buf.offset(), bucket as i32, IN_FLIGHT);
                Err(buf)
            }
        }
    }

    /// Takes a buffer from the free list.
    #[inline]
    pub fn allocate(&self) -> Option<Buffer> {
        self.get(FREE_LIST)
    }

    /// Returns a buffer to the free list.
    #[inline]
    pub fn free(&self, buf: Buffer) -> Result<(), Buffer> {
        self.put(FREE_LIST, buf)
    }

    /// Moves the oldest buffer of `from` to `to`.
    pub fn transfer(&self, from: usize, to: usize) -> Transfer {
        let Some(buf) = self.get(from) else {
            return Transfer::SourceEmpty;
        };
        match self.put(to, buf) {
            Ok(()) => Transfer::Moved,
            Err(buf) => Transfer::DestinationFull(buf),
        }
    }

    /// Whole data area of a held buffer.
    pub fn data<'a>(&'a self, buf: &'a Buffer) -> &'a [u8] {
        // SAFETY: the holder of `buf` has exclusive use of the cell
        unsafe {
            let cell = self.cell(buf.offset());
            slice::from_raw_parts(ptr::addr_of!((*cell).data).cast::<u8>(), BUFFER_SIZE)
        }
    }

    pub fn data_mut<'a>(&'a self, buf: &'a mut Buffer) -> &'a mut [u8] {
        // SAFETY: the holder of `buf` has exclusive use of the cell
        unsafe {
            let cell = self.cell(buf.offset());
            slice::from_raw_parts_mut(ptr::addr_of_mut!((*cell).data).cast::<u8>(), BUFFER_SIZE)
        }
    }

    /// Copies as much of `bytes` as fits and records it as the payload.
    /// Returns the number of bytes copied.
    pub fn write(&self, buf: &mut Buffer, bytes: &[u8]) -> usize {
        let n = bytes.len().min(BUFFER_SIZE);
        self.data_mut(buf)[..n].copy_from_slice(&bytes[..n]);
        self.set_payload_len(buf, n);
        n
    }

    /// Records the payload length after filling [`Pool::data_mut`] directly.
    pub fn set_payload_len(&self, buf: &mut Buffer, len: usize) {
        let len = len.min(BUFFER_SIZE) as u32;
        // SAFETY: the holder of `buf` has exclusive use of the cell
        unsafe { ptr::addr_of_mut!((*self.cell(buf.offset())).len).write(len) };
    }

    /// The bytes recorded by the last write.
    pub fn payload<'a>(&'a self, buf: &'a Buffer) -> &'a [u8] {
        // SAFETY: the holder of `buf` has exclusive use of the cell
        let len = unsafe { ptr::addr_of!((*self.cell(buf.offset())).len).read() } as usize;
        &self.data(buf)[..len.min(BUFFER_SIZE)]
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> u32 {
        self.layout.entries
    }

    /// Buffers that circulate (`entries - 1`).
    pub fn capacity(&self) -> usize {
        self.layout.entries as usize - 1
    }

    pub fn buckets(&self) -> usize {
        self.layout.buckets
    }

    /// Buffers currently queued on `bucket` (a snapshot).
    pub fn len(&self, bucket: usize) -> usize {
        self.ring(bucket).len()
    }

    pub fn is_empty(&self, bucket: usize) -> bool {
        self.ring(bucket).is_empty()
    }

    pub fn is_full(&self, bucket: usize) -> bool {
        self.ring(bucket).is_full()
    }

    pub fn bucket_offsets(&self) -> &[usize] {
        &self.layout.bucket_offsets
    }

    pub fn slab_offset(&self) -> usize {
        self.layout.slab_offset
    }

    /// Segment size in bytes.
    pub fn size(&self) -> usize {
        self.layout.total_size
    }

    /// Current number of attached handles across all processes.
    pub fn refcount(&self) -> u32 {
        self.header().refcnt.load(Ordering::Acquire)
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    /// Notification counters the creator made, as recorded in the header.
    pub fn notifications(&self) -> usize {
        self.header().notifications as usize
    }

    /// Counters this handle holds: all of them for the creator, whatever
    /// was adopted for attachers.
    pub fn notifiers(&self) -> &[Notifier] {
        &self.notifiers
    }

    pub fn notifier(&self, index: usize) -> Option<&Notifier> {
        self.notifiers.get(index)
    }

    /// Duplicates every counter descriptor for handing to another process.
    pub fn notifier_fds(&self) -> io::Result<Vec<OwnedFd>> {
        self.notifiers.iter().map(Notifier::try_clone_fd).collect()
    }

    /// Installs counters received from the creator, replacing any held ones.
    pub fn adopt_notifiers(&mut self, fds: Vec<OwnedFd>) {
        let expected = self.notifications();
        if fds.len() != expected {
            tracing::warn!(
                name = %self.name,
                received = fds.len(),
                expected,
                "notification counter count differs from pool header"
            );
        }
        self.notifiers = fds.into_iter().take(MAX_FDS).map(Notifier::from_fd).collect();
    }

    /// Ring view of `bucket`, for diagnostics and fault injection in tests.
    pub fn ring(&self, bucket: usize) -> &MpmcRing {
        match self.rings.get(bucket) {
            Some(ring) => ring,
            None => panic!(
                "bucket {bucket} out of range for pool '{}' with {} buckets",
                self.name,
                self.rings.len()
            ),
        }
    }

    #[inline]
    fn header(&self) -> &PoolHeader {
        // SAFETY: the header was written before the segment became visible
        unsafe { self.base.cast::<PoolHeader>().as_ref() }
    }

    #[inline]
    fn cell(&self, offset: u32) -> *mut BufferCell {
        assert!(
            offset < self.layout.entries,
            "buffer offset {offset} outside pool '{}' ({} entries)",
            self.name,
            self.layout.entries
        );
        // SAFETY: bounds checked above
        unsafe { self.slab.as_ptr().add(offset as usize) }
    }

    #[inline]
    fn owner(&self, offset: u32) -> &AtomicI32 {
        // SAFETY: cell is in bounds; the tag is only accessed atomically
        unsafe { &*ptr::addr_of!((*self.cell(offset)).owner) }
    }

    fn trace_layout(&self, msg: &'static str) {
        tracing::debug!(
            name = %self.name,
            entries = self.layout.entries,
            buckets = self.layout.buckets,
            size = self.layout.total_size,
            ring_stride = self.layout.ring_stride,
            bucket_offsets = ?self.layout.bucket_offsets,
            slab_offset = self.layout.slab_offset,
            refcnt = self.refcount(),
            "{msg}"
        );
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if !self.detached {
            self.detach();
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("entries", &self.layout.entries)
            .field("size", &self.layout.total_size)
            .field("refcnt", &self.refcount())
            .field("notifiers", &self.notifiers.len())
            .field("buckets", &self.rings)
            .finish()
    }
}

/// Increments a refcount unless it is zero.
fn acquire_ref(refcnt: &AtomicU32) -> Option<u32> {
    let mut cur = refcnt.load(Ordering::Acquire);
    loop {
        if cur == 0 {
            return None;
        }
        match refcnt.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Some(cur + 1),
            Err(actual) => cur = actual,
        }
    }
}

/// Gives back a reference taken during a failed attach.
struct RefcountGuard<'a> {
    refcnt: &'a AtomicU32,
    name: &'a str,
    armed: bool,
}

impl Drop for RefcountGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.refcnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Every other holder left while we were checking.
            tracing::warn!(name = self.name, "last reference dropped by a failed attach");
            if let Err(e) = ShmSegment::unlink(self.name) {
                tracing::warn!(name = self.name, error = %e, "failed to unlink pool segment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("basalt_pool_unit_{tag}_{}", std::process::id())
    }

    #[test]
    fn acquire_ref_refuses_zero() {
        let rc = AtomicU32::new(0);
        assert_eq!(acquire_ref(&rc), None);
        rc.store(2, Ordering::Relaxed);
        assert_eq!(acquire_ref(&rc), Some(3));
    }

    #[test]
    fn seeds_all_but_the_gap_cell() {
        let pool = Pool::create(&unique("seed"), 16, 2, 0).unwrap();
        assert_eq!(pool.len(FREE_LIST), 15);
        assert_eq!(pool.capacity(), 15);
        assert!(pool.is_full(FREE_LIST));
        assert_eq!(pool.owner(15).load(Ordering::Relaxed), UNUSED);
        let first = pool.allocate().unwrap();
        assert_eq!(first.offset(), 0);
        pool.free(first).unwrap();
    }

    #[test]
    fn payload_tracks_last_write() {
        let pool = Pool::create(&unique("payload"), 8, 2, 0).unwrap();
        let mut buf = pool.allocate().unwrap();
        assert_eq!(pool.write(&mut buf, b"hello"), 5);
        assert_eq!(pool.payload(&buf), b"hello");
        assert_eq!(pool.data(&buf).len(), BUFFER_SIZE);

        let big = vec![7u8; BUFFER_SIZE + 10];
        assert_eq!(pool.write(&mut buf, &big), BUFFER_SIZE);
        assert_eq!(pool.payload(&buf).len(), BUFFER_SIZE);
        pool.free(buf).unwrap();
    }

    #[test]
    fn transfer_reports_each_outcome() {
        let pool = Pool::create(&unique("transfer"), 4, 2, 0).unwrap();
        assert_eq!(pool.transfer(1, 0), Transfer::SourceEmpty);
        for _ in 0..3 {
            assert_eq!(pool.transfer(0, 1), Transfer::Moved);
        }
        assert!(pool.is_full(1));

        let extra = Buffer::new(3);
        pool.owner(3).store(IN_FLIGHT, Ordering::Relaxed);
        let Err(back) = pool.put(1, extra) else {
            panic!("put into a full bucket succeeded");
        };
        assert_eq!(back.offset(), 3);
        assert_eq!(pool.owner(3).load(Ordering::Relaxed), IN_FLIGHT);
    }

    #[test]
    fn rejected_free_hands_the_buffer_back() {
        let pool = Pool::create(&unique("freefull"), 4, 2, 0).unwrap();
        assert!(pool.is_full(FREE_LIST));

        // Cell 3 is the one that never circulates; forge it to overfill.
        let extra = Buffer::new(3);
        pool.owner(3).store(IN_FLIGHT, Ordering::Relaxed);
        let back = pool.free(extra).expect_err("free into a full free list succeeded");
        assert_eq!(back.offset(), 3);
        assert_eq!(pool.owner(3).load(Ordering::Relaxed), IN_FLIGHT);
        assert_eq!(pool.len(FREE_LIST), 3);

        // Still owned by the caller, so it can go elsewhere.
        pool.put(1, back).unwrap();
        assert_eq!(pool.len(1), 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn bad_bucket_panics() {
        let pool = Pool::create(&unique("badbucket"), 4, 2, 0).unwrap();
        let _ = pool.get(2);
    }

    #[test]
    #[cfg_attr(not(any(debug_assertions, feature = "owner-check")), ignore)]
    #[should_panic(expected = "buffer ownership violation")]
    fn double_put_is_detected() {
        let pool = Pool::create(&unique("doubleput"), 8, 2, 0).unwrap();
        let buf = pool.allocate().unwrap();
        let forged = Buffer::new(buf.offset());
        pool.free(buf).unwrap();
        let _ = pool.free(forged);
    }

    #[test]
    #[cfg_attr(not(any(debug_assertions, feature = "owner-check")), ignore)]
    #[should_panic(expected = "stuck mid-operation")]
    fn abandoned_reservation_panics_at_teardown() {
        let pool = Pool::create(&unique("stuck"), 8, 2, 0).unwrap();
        pool.ring(1).abandon_reservation();
        let _ = pool.unregister();
    }
}
