//! Synchronous SIGINT/SIGTERM handling.
//!
//! The signals are blocked in every thread and collected by one watcher
//! thread with `sigwait`, which turns them into a [`ShutdownHandle`] request.
//! Nothing runs in async-signal context.
//!
//! [`block_termination_signals`] must run before any other thread is spawned
//! so that every thread inherits the mask.

use crate::server::ShutdownHandle;
use nix::sys::signal::{SigSet, Signal};
use std::io;
use std::thread::{self, JoinHandle};

/// The set of blocked termination signals.
#[derive(Debug, Clone)]
pub struct SignalSet(SigSet);

/// Blocks SIGINT and SIGTERM in the calling thread (and every thread it
/// spawns afterwards).
pub fn block_termination_signals() -> io::Result<SignalSet> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block()?;
    Ok(SignalSet(set))
}

/// Spawns the thread that waits for a blocked signal and requests shutdown.
///
/// Every further signal requests shutdown again, which is a no-op.
pub fn spawn_watcher(set: SignalSet, handle: ShutdownHandle) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || {
            loop {
                match set.0.wait() {
                    Ok(sig) => {
                        tracing::info!(signal = sig.as_str(), "termination signal received, shutting down");
                        handle.request();
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "sigwait failed");
                        return;
                    }
                }
            }
        })
}
