//! Measurement helpers shared by `perf_report` and the criterion benches.

use nix::sys::resource::{UsageWho, getrusage};
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Instant;

// ─── Statistics ─────────────────────────────────────────────────────────────

/// Distribution of a set of samples, percentiles by nearest rank.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub count: usize,
    pub min: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub max: u64,
    pub mean: f64,
}

impl Stats {
    /// Sorts `samples` in place. `None` when there are no samples.
    pub fn from_samples(samples: &mut [u64]) -> Option<Self> {
        samples.sort_unstable();
        let (&min, &max) = (samples.first()?, samples.last()?);
        let count = samples.len();
        let rank = |pct: usize| samples[(count * pct).div_ceil(100).saturating_sub(1)];
        Some(Self {
            count,
            min,
            p50: rank(50),
            p90: rank(90),
            p99: rank(99),
            max,
            mean: samples.iter().map(|&s| s as f64).sum::<f64>() / count as f64,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchResult {
    pub name: String,
    pub unit: &'static str,
    pub stats: Stats,
}

// ─── Measurement Harness ────────────────────────────────────────────────────

/// Runs `f` in `batches` timed batches of `batch_size` calls, after `warmup`
/// untimed batches, and reports the per-call cost of each batch.
pub fn measure_batched<F: FnMut()>(
    name: &str,
    batches: usize,
    batch_size: usize,
    warmup: usize,
    mut f: F,
) -> BenchResult {
    let mut batch = || {
        let start = Instant::now();
        for _ in 0..batch_size {
            f();
        }
        start.elapsed()
    };
    for _ in 0..warmup {
        batch();
    }
    let mut samples: Vec<u64> = (0..batches)
        .map(|_| (batch().as_nanos() / batch_size.max(1) as u128).max(1) as u64)
        .collect();

    BenchResult {
        name: name.to_string(),
        unit: "ns/op",
        stats: Stats::from_samples(&mut samples).unwrap_or_default(),
    }
}

/// Nanoseconds since the first call in this process. Comparable across
/// threads, which is all the cross-thread latency section needs.
#[inline]
pub fn now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

// ─── Resource Usage ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceSnapshot {
    pub max_rss_bytes: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,
}

impl ResourceSnapshot {
    /// Usage of this process so far; all zeros if `getrusage` fails.
    pub fn capture() -> Self {
        let Ok(usage) = getrusage(UsageWho::RUSAGE_SELF) else {
            return Self::default();
        };
        Self {
            // Linux reports KiB.
            max_rss_bytes: usage.max_rss() as u64 * 1024,
            minor_faults: usage.minor_page_faults() as u64,
            major_faults: usage.major_page_faults() as u64,
            voluntary_switches: usage.voluntary_context_switches() as u64,
            involuntary_switches: usage.involuntary_context_switches() as u64,
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Pool name unique to this process, so parallel bench runs do not collide.
pub fn temp_pool_name(label: &str) -> String {
    format!("basalt_bench_{label}_{}", std::process::id())
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn print_table_header() {
    println!(
        "  {:<30} {:>9} {:>8} {:>8} {:>8} {:>8} {:>9}  unit",
        "operation", "samples", "min", "p50", "p90", "p99", "max",
    );
    println!("  {}", "─".repeat(94));
}

pub fn print_result_row(r: &BenchResult) {
    let s = &r.stats;
    println!(
        "  {:<30} {:>9} {:>8} {:>8} {:>8} {:>8} {:>9}  {}",
        r.name, s.count, s.min, s.p50, s.p90, s.p99, s.max, r.unit,
    );
}

pub fn section_header(title: &str) {
    let rule = "─".repeat(90);
    println!("\n{rule}\n  {title}\n{rule}\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_percentiles() {
        let mut samples: Vec<u64> = (1..=100).rev().collect();
        let s = Stats::from_samples(&mut samples).unwrap();
        assert_eq!((s.count, s.min, s.max), (100, 1, 100));
        assert_eq!((s.p50, s.p90, s.p99), (50, 90, 99));
        assert!((s.mean - 50.5).abs() < 1e-9);
    }

    #[test]
    fn one_sample_is_every_percentile() {
        let s = Stats::from_samples(&mut [7]).unwrap();
        assert_eq!((s.min, s.p50, s.p99, s.max), (7, 7, 7, 7));
    }

    #[test]
    fn no_samples_no_stats() {
        assert!(Stats::from_samples(&mut []).is_none());
    }

    #[test]
    fn clock_moves_forward() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(8 * 1024 * 1024), "8.0 MB");
    }

    #[test]
    fn batches_report_per_call_cost() {
        let mut calls = 0;
        let r = measure_batched("noop", 5, 10, 2, || calls += 1);
        assert_eq!(calls, 70);
        assert_eq!(r.stats.count, 5);
        assert!(r.stats.min >= 1);
    }
}
