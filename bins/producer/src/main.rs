use anyhow::{Context, anyhow};
use basalt_broker::Broker;
use basalt_broker::signals::{block_termination_signals, spawn_watcher};
use basalt_config::PipelineConfig;
use basalt_mmap::ShmSegment;
use basalt_pool::{BUFFER_SIZE, Pool};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Bucket the consumer drains.
const STAGE: usize = 1;

fn main() -> anyhow::Result<()> {
    let cfg = PipelineConfig::load_or_default(std::env::args().nth(1))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Before any thread exists, so all of them inherit the mask.
    let signals = block_termination_signals().context("blocking termination signals")?;

    if cfg.replace_existing && ShmSegment::exists(&cfg.pool_name) {
        tracing::warn!(name = %cfg.pool_name, "removing leftover pool segment");
        ShmSegment::unlink(&cfg.pool_name).context("unlinking leftover pool")?;
    }

    let pool = Pool::create(&cfg.pool_name, cfg.entries, cfg.buckets, cfg.notifications)
        .with_context(|| format!("creating pool '{}'", cfg.pool_name))?;
    let broker = Broker::for_pool(&cfg.socket_dir, &pool).context("starting broker")?;
    let shutdown = broker.shutdown_handle();
    let _watcher = spawn_watcher(signals, shutdown.clone())?;
    tracing::info!(
        name = %cfg.pool_name,
        entries = cfg.entries,
        buckets = cfg.buckets,
        socket = %broker.path().display(),
        "producer ready"
    );
    let broker_thread = thread::spawn(move || broker.serve());

    let consumer = pool.notifier(0);
    let notify_every = cfg.notify_every.max(1);
    let mut sent: u64 = 0;
    let mut last = Instant::now();
    let mut since_report: u64 = 0;

    while !shutdown.is_requested() {
        let Some(mut buf) = pool.allocate() else {
            // Free list dry: the consumer is behind, make sure it is awake.
            if let Some(n) = consumer {
                n.notify()?;
            }
            thread::yield_now();
            continue;
        };

        pool.data_mut(&mut buf)[..8].copy_from_slice(&sent.to_le_bytes());
        pool.set_payload_len(&mut buf, BUFFER_SIZE);
        if let Err(buf) = pool.put(STAGE, buf) {
            tracing::warn!(offset = buf.offset(), "stage full, recycling buffer");
            if let Err(buf) = pool.free(buf) {
                tracing::warn!(offset = buf.offset(), "free list full, dropping buffer");
            }
            continue;
        }
        sent += 1;
        since_report += 1;

        if sent % notify_every == 0 {
            if let Some(n) = consumer {
                n.notify()?;
            }
        }
        if last.elapsed() >= Duration::from_secs(1) {
            tracing::info!(rate = since_report, sent, "buffers/s");
            since_report = 0;
            last = Instant::now();
        }
    }

    tracing::info!(sent, "producer stopping");
    shutdown.request();
    broker_thread
        .join()
        .map_err(|_| anyhow!("broker thread panicked"))?
        .context("broker failed")?;
    let detach = pool.unregister();
    tracing::info!(?detach, "pool detached");
    Ok(())
}
