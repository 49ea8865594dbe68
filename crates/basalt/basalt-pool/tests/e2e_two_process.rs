//! End-to-end two-process test for the shared buffer pool.
//!
//! The test binary spawns itself twice. The producer creates the pool and
//! streams numbered buffers through bucket 1; the consumer attaches by name,
//! checks every buffer arrives in order and frees it back to bucket 0.
//!
//! ```text
//! [Producer] --[create]--[allocate, stamp, put(1)...]------------[unregister]
//!                 |              |                                    ^
//!                 v              v                                    |
//!             /dev/shm/...   bucket 1 ---> [Consumer] get(1), free    |
//!                 ^                                     |             |
//! [Consumer] ---[register]------------------------------+-[unregister]
//! ```
//!
//! Only `entries - 1` buffers exist, so the producer cannot finish unless
//! the consumer keeps returning them.
//!
//! ```bash
//! cargo test -p basalt-pool --test e2e_two_process -- --nocapture
//! ```

use basalt_pool::{Detach, Pool, PoolError};
use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Writes to stderr with immediate flush to bypass test output capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "BASALT_E2E_ROLE";
const ENV_NAME: &str = "BASALT_E2E_POOL";
const ROLE_PRODUCER: &str = "producer";
const ROLE_CONSUMER: &str = "consumer";

const BUFFER_COUNT: u32 = 10_000;
const ENTRIES: u32 = 1024;
const STAGE: usize = 1;
const DEADLINE: Duration = Duration::from_secs(20);

fn run_producer(name: &str) {
    log!("[PRODUCER] creating pool {name} ({ENTRIES} entries)");
    let pool = Pool::create(name, ENTRIES, 2, 0).expect("producer: create failed");
    let deadline = Instant::now() + DEADLINE;

    for seq in 0..BUFFER_COUNT {
        let mut buf = loop {
            if let Some(b) = pool.allocate() {
                break b;
            }
            assert!(Instant::now() < deadline, "producer: free list stayed empty");
            thread::yield_now();
        };
        pool.write(&mut buf, &seq.to_le_bytes());
        pool.put(STAGE, buf).expect("producer: stage full");
    }
    log!("[PRODUCER] queued {BUFFER_COUNT} buffers, waiting for consumer to detach");

    while pool.refcount() > 1 {
        assert!(Instant::now() < deadline, "producer: consumer never detached");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(pool.len(0), pool.capacity(), "buffers leaked");
    assert_eq!(pool.unregister(), Detach::Destroyed);
    log!("[PRODUCER] done");
}

fn run_consumer(name: &str) {
    let deadline = Instant::now() + DEADLINE;
    let pool = loop {
        match Pool::register(name) {
            Ok(p) => break p,
            Err(PoolError::Resource { .. } | PoolError::NotAttachable { .. })
                if Instant::now() < deadline =>
            {
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("[CONSUMER] failed to register: {e}"),
        }
    };
    log!("[CONSUMER] attached, refcount {}", pool.refcount());

    let start = Instant::now();
    let mut expected = 0u32;
    while expected < BUFFER_COUNT {
        let Some(buf) = pool.get(STAGE) else {
            assert!(Instant::now() < deadline, "consumer: stalled at {expected}");
            std::hint::spin_loop();
            continue;
        };
        let seq = u32::from_le_bytes(pool.payload(&buf).try_into().expect("4 byte payload"));
        assert_eq!(seq, expected, "consumer: out of order");
        expected += 1;
        pool.free(buf).expect("consumer: free list full");
    }

    log!("[CONSUMER] received {expected} buffers in {:?}", start.elapsed());
    assert!(matches!(pool.unregister(), Detach::Released { .. }));
}

#[test]
fn e2e_two_process_pool() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let name = env::var(ENV_NAME).expect("pool name not set");
        match role.as_str() {
            ROLE_PRODUCER => run_producer(&name),
            ROLE_CONSUMER => run_consumer(&name),
            other => panic!("Unknown role: {other}"),
        }
        return;
    }

    let name = format!("basalt_e2e_{}", std::process::id());
    let exe = env::current_exe().expect("Failed to get current executable path");
    let spawn = |role: &str| {
        Command::new(&exe)
            .arg("--exact")
            .arg("e2e_two_process_pool")
            .arg("--nocapture")
            .env(ENV_ROLE, role)
            .env(ENV_NAME, &name)
            .stderr(Stdio::inherit())
            .spawn()
            .expect("Failed to spawn child process")
    };

    let mut producer = spawn(ROLE_PRODUCER);
    let mut consumer = spawn(ROLE_CONSUMER);
    let producer_status = producer.wait().expect("Failed to wait for producer");
    let consumer_status = consumer.wait().expect("Failed to wait for consumer");

    // Best effort in case a child died before unregistering.
    let _ = basalt_mmap::ShmSegment::unlink(&name);

    assert!(producer_status.success(), "producer failed: {producer_status}");
    assert!(consumer_status.success(), "consumer failed: {consumer_status}");
}
