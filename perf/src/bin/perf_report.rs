use std::hint::black_box;
use std::mem::size_of;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use basalt_perf::*;
use basalt_pool::{BufferCell, FREE_LIST, Pool, PoolHeader, PoolLayout};
use basalt_ring::shm_layout::{RingHeader, bytes_for_ring};
use basalt_ring::{HeapRing, RingConfig};

const ENTRIES: u32 = 4096;
const CROSS_THREAD_MSGS: u64 = 1_000_000;
const STAGE: usize = 1;

fn main() {
    let rusage_start = ResourceSnapshot::capture();
    let mut results: Vec<BenchResult> = Vec::new();

    print_banner();
    section_memory_layout();
    section_single_thread(&mut results);
    let cross = section_cross_thread(&mut results);
    let rusage_end = ResourceSnapshot::capture();
    section_resources(&rusage_start, &rusage_end);
    save_results(&results, cross.as_ref(), &rusage_start, &rusage_end);
}

fn print_banner() {
    let bar = "\u{2550}".repeat(90);
    let ncpu = thread::available_parallelism().map(|n| n.get()).unwrap_or(0);
    println!("\n{bar}");
    println!("  basalt perf report   (cpus: {ncpu}, entries per bucket: {ENTRIES})");
    println!("{bar}");
}

fn section_memory_layout() {
    section_header("MEMORY LAYOUT");
    let layout = PoolLayout::compute(ENTRIES, 2);
    println!("  PoolHeader:                  {} B", size_of::<PoolHeader>());
    println!("  RingHeader:                  {} B", size_of::<RingHeader>());
    println!("  BufferCell:                  {} B", size_of::<BufferCell>());
    println!("  ring stride:                 {} B", bytes_for_ring(ENTRIES as usize));
    println!("  bucket offsets:              {:?}", layout.bucket_offsets);
    println!("  slab offset:                 {}", layout.slab_offset);
    println!(
        "  segment (2 buckets):         {}",
        format_bytes(layout.total_size as u64)
    );
}

fn section_single_thread(results: &mut Vec<BenchResult>) {
    section_header("SINGLE THREAD");
    print_table_header();

    let ring = HeapRing::new(RingConfig::new(ENTRIES));
    let r = measure_batched("ring put+get", 1000, 10_000, 100, || {
        let _ = ring.try_put(black_box(7));
        black_box(ring.try_get());
    });
    print_result_row(&r);
    results.push(r);

    let r = measure_batched("ring get (empty)", 1000, 10_000, 100, || {
        black_box(ring.try_get());
    });
    print_result_row(&r);
    results.push(r);

    let name = temp_pool_name("report_st");
    let pool = match Pool::create(&name, ENTRIES, 2, 0) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("  [skipping pool benchmarks: {e}]");
            return;
        }
    };

    let r = measure_batched("pool allocate+free", 1000, 10_000, 100, || {
        if let Some(buf) = pool.allocate() {
            let _ = pool.free(black_box(buf));
        }
    });
    print_result_row(&r);
    results.push(r);

    let r = measure_batched("pool transfer 0->1->0", 1000, 10_000, 100, || {
        black_box(pool.transfer(FREE_LIST, STAGE));
        black_box(pool.transfer(STAGE, FREE_LIST));
    });
    print_result_row(&r);
    results.push(r);

    let payload = [0xA5u8; 256];
    let r = measure_batched("pool write 256B", 1000, 10_000, 100, || {
        if let Some(mut buf) = pool.allocate() {
            black_box(pool.write(&mut buf, &payload));
            let _ = pool.free(buf);
        }
    });
    print_result_row(&r);
    results.push(r);
}

/// Producer thread stamps buffers with a send time; consumer thread records
/// the one-way latency of every buffer it receives.
fn section_cross_thread(results: &mut Vec<BenchResult>) -> Option<Stats> {
    section_header("CROSS-THREAD PIPELINE (allocate -> put(1) -> get(1) -> free)");

    let name = temp_pool_name("report_xt");
    let pool = match Pool::create(&name, ENTRIES, 2, 0) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("  [skipping cross-thread pipeline: {e}]");
            return None;
        }
    };
    let start_line = Barrier::new(2);

    let start = Instant::now();
    let mut latencies = thread::scope(|s| {
        s.spawn(|| {
            start_line.wait();
            for _ in 0..CROSS_THREAD_MSGS {
                let mut buf = loop {
                    if let Some(b) = pool.allocate() {
                        break b;
                    }
                    std::hint::spin_loop();
                };
                pool.write(&mut buf, &now_ns().to_le_bytes());
                let _ = pool.put(STAGE, buf);
            }
        });

        let consumer = s.spawn(|| {
            let mut lat = Vec::with_capacity(CROSS_THREAD_MSGS as usize);
            start_line.wait();
            while (lat.len() as u64) < CROSS_THREAD_MSGS {
                let Some(buf) = pool.get(STAGE) else {
                    std::hint::spin_loop();
                    continue;
                };
                let sent = pool
                    .payload(&buf)
                    .try_into()
                    .map(u64::from_le_bytes)
                    .unwrap_or(0);
                lat.push(now_ns().saturating_sub(sent));
                let _ = pool.free(buf);
            }
            lat
        });
        consumer.join().unwrap_or_default()
    });
    let elapsed = start.elapsed();

    let stats = Stats::from_samples(&mut latencies)?;
    let rate = CROSS_THREAD_MSGS as f64 / elapsed.as_secs_f64();
    println!("  buffers:                     {CROSS_THREAD_MSGS}");
    println!("  throughput:                  {rate:.0} buffers/s");
    print_table_header();
    let r = BenchResult {
        name: "one-way latency".into(),
        unit: "ns",
        stats: stats.clone(),
    };
    print_result_row(&r);
    results.push(r);
    Some(stats)
}

fn section_resources(start: &ResourceSnapshot, end: &ResourceSnapshot) {
    section_header("RESOURCE USAGE");
    println!(
        "  Peak RSS:                    {}",
        format_bytes(end.max_rss_bytes)
    );
    println!(
        "  Minor page faults:           {}",
        end.minor_faults.saturating_sub(start.minor_faults)
    );
    println!(
        "  Voluntary ctx switches:      {}",
        end.voluntary_switches.saturating_sub(start.voluntary_switches)
    );
    println!(
        "  Involuntary ctx switches:    {}",
        end.involuntary_switches.saturating_sub(start.involuntary_switches)
    );
}

fn save_results(
    results: &[BenchResult],
    cross: Option<&Stats>,
    rusage_start: &ResourceSnapshot,
    rusage_end: &ResourceSnapshot,
) {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let results_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/results");
    let _ = std::fs::create_dir_all(results_dir);
    let json_path = format!("{results_dir}/{timestamp}_report.json");

    let output = serde_json::json!({
        "report_type": "pool",
        "timestamp": timestamp,
        "entries": ENTRIES,
        "benchmarks": results,
        "cross_thread_latency": cross,
        "resources": {
            "start": rusage_start,
            "end": rusage_end,
        },
    });

    let rendered = match serde_json::to_string_pretty(&output) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("\n  [failed to render results: {e}]\n");
            return;
        }
    };
    let bar = "\u{2550}".repeat(90);
    match std::fs::write(&json_path, rendered) {
        Ok(()) => {
            println!("\n{bar}");
            println!("  Results saved to: {json_path}");
            println!("{bar}\n");
        }
        Err(e) => eprintln!("\n  [failed to save results: {e}]\n"),
    }
}
