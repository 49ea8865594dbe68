use anyhow::Context;
use basalt_broker::signals::{block_termination_signals, spawn_watcher};
use basalt_broker::{ShutdownHandle, request_fds_within, socket_path};
use basalt_config::PipelineConfig;
use basalt_pool::Pool;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Bucket the producer fills.
const STAGE: usize = 1;

fn main() -> anyhow::Result<()> {
    let cfg = PipelineConfig::load_or_default(std::env::args().nth(1))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let signals = block_termination_signals().context("blocking termination signals")?;
    let shutdown = ShutdownHandle::new();
    let _watcher = spawn_watcher(signals, shutdown.clone())?;

    let mut pool = Pool::register(&cfg.pool_name)
        .with_context(|| format!("attaching to pool '{}'", cfg.pool_name))?;
    if pool.notifications() > 0 {
        let path = socket_path(&cfg.socket_dir, &cfg.pool_name);
        let fds = request_fds_within(&path, Duration::from_secs(5))
            .with_context(|| format!("fetching descriptors from {}", path.display()))?;
        pool.adopt_notifiers(fds);
    }
    tracing::info!(name = %cfg.pool_name, notifiers = pool.notifiers().len(), "consumer attached");

    let start = Instant::now();
    let deadline = (cfg.duration_secs > 0).then(|| start + Duration::from_secs(cfg.duration_secs));
    let mut bytes: u64 = 0;
    let mut buffers: u64 = 0;
    let mut next_seq: u64 = 0;
    let mut gaps: u64 = 0;

    while !shutdown.is_requested() && deadline.is_none_or(|d| Instant::now() < d) {
        while let Some(buf) = pool.get(STAGE) {
            let payload = pool.payload(&buf);
            bytes += payload.len() as u64;
            buffers += 1;
            if let Some(head) = payload.get(..8) {
                let seq = u64::from_le_bytes(head.try_into()?);
                if seq != next_seq {
                    gaps += 1;
                }
                next_seq = seq + 1;
            }
            if let Err(buf) = pool.free(buf) {
                tracing::warn!(offset = buf.offset(), "free list full, dropping buffer");
            }
        }
        match pool.notifier(0) {
            Some(n) => {
                n.wait_timeout(Duration::from_millis(100))?;
            }
            None => thread::sleep(Duration::from_millis(1)),
        }
    }

    let secs = start.elapsed().as_secs_f64();
    tracing::info!(
        bytes,
        buffers,
        gaps,
        secs = format_args!("{secs:.3}"),
        mb_per_s = format_args!("{:.1}", bytes as f64 / secs / 1e6),
        "consumer done"
    );
    let detach = pool.unregister();
    tracing::info!(?detach, "pool detached");
    Ok(())
}
