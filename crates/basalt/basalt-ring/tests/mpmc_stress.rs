//! Multi-threaded stress tests for the MPMC ring.
//!
//! Producers tag every value with their id in the high byte so consumers can
//! check two properties without a global log:
//! - each value comes out exactly once (no loss, no duplication)
//! - values of a single producer come out in the order they went in
#![cfg(not(feature = "loom"))]

use basalt_ring::{HeapRing, RingConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

const PRODUCERS: u32 = 4;
const CONSUMERS: usize = 4;
/// 500_000 puts + 500_000 gets = 1_000_000 ring operations.
const PER_PRODUCER: u32 = 125_000;

fn tag(producer: u32, seq: u32) -> u32 {
    (producer << 24) | seq
}

fn untag(value: u32) -> (usize, u32) {
    ((value >> 24) as usize, value & 0x00FF_FFFF)
}

fn run_stress(entries: u32, per_producer: u32) {
    let ring = HeapRing::new(RingConfig::new(entries));
    let total = (PRODUCERS * per_producer) as usize;
    let consumed = AtomicUsize::new(0);

    let received: Vec<Vec<u32>> = thread::scope(|s| {
        for p in 0..PRODUCERS {
            let ring = &ring;
            s.spawn(move || {
                for seq in 0..per_producer {
                    while ring.try_put(tag(p, seq)).is_err() {
                        thread::yield_now();
                    }
                }
            });
        }

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let ring = &ring;
                let consumed = &consumed;
                s.spawn(move || {
                    let mut got = Vec::new();
                    while consumed.load(Ordering::Relaxed) < total {
                        match ring.try_get() {
                            Some(v) => {
                                got.push(v);
                                consumed.fetch_add(1, Ordering::Relaxed);
                            }
                            None => thread::yield_now(),
                        }
                    }
                    got
                })
            })
            .collect();

        consumers.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Per-consumer, per-producer order must be increasing.
    for got in &received {
        let mut last = [None::<u32>; PRODUCERS as usize];
        for &v in got {
            let (p, seq) = untag(v);
            if let Some(prev) = last[p] {
                assert!(seq > prev, "producer {p}: {seq} after {prev}");
            }
            last[p] = Some(seq);
        }
    }

    let mut seen = vec![false; total];
    for &v in received.iter().flatten() {
        let (p, seq) = untag(v);
        let idx = p * per_producer as usize + seq as usize;
        assert!(!seen[idx], "value {v:#x} delivered twice");
        seen[idx] = true;
    }
    assert!(seen.iter().all(|&s| s), "some values were lost");

    assert_eq!(ring.len(), 0);
    assert!(ring.is_quiescent());
}

#[test]
fn four_by_four_large_ring() {
    run_stress(1024, PER_PRODUCER);
}

#[test]
fn four_by_four_tiny_ring_high_contention() {
    run_stress(4, 20_000);
}
