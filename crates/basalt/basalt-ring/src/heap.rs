use crate::mpmc::MpmcRing;
use crate::ring::RingConfig;
use crate::shm_layout::CACHE_LINE;
use std::ops::Deref;
use std::ptr::NonNull;

#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct CacheLine([u8; CACHE_LINE]);

/// A ring backed by a private, cache-aligned heap allocation.
///
/// Same algorithm as a ring inside a shared segment, useful for threads of a
/// single process and for tests.
pub struct HeapRing {
    storage: NonNull<[CacheLine]>,
    ring: MpmcRing,
}

impl HeapRing {
    pub fn new(cfg: RingConfig) -> Self {
        let lines = cfg.bytes() / CACHE_LINE;
        let boxed: Box<[CacheLine]> = vec![CacheLine([0; CACHE_LINE]); lines].into_boxed_slice();
        let storage = NonNull::from(Box::leak(boxed));
        // SAFETY: the allocation is aligned, sized by `cfg.bytes()`, not yet
        // shared, and released only in `Drop` after the view is gone.
        let ring = unsafe { MpmcRing::init(storage.as_ptr() as *mut u8, cfg.entries) };
        Self { storage, ring }
    }
}

impl Deref for HeapRing {
    type Target = MpmcRing;

    fn deref(&self) -> &MpmcRing {
        &self.ring
    }
}

impl Drop for HeapRing {
    fn drop(&mut self) {
        // SAFETY: `storage` came from `Box::leak` in `new` and is freed once.
        drop(unsafe { Box::from_raw(self.storage.as_ptr()) });
    }
}

// SAFETY: the allocation is owned exclusively by this value and only reached
// through the ring's atomics.
unsafe impl Send for HeapRing {}
unsafe impl Sync for HeapRing {}
