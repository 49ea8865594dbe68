use crate::client::send_quit;
use crate::protocol::{Command, read_opcode, socket_path};
use basalt_pool::Pool;
use passfd::FdPassingExt;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long a connected peer may take to send its opcode. A peer that stays
/// silent past this is dropped so the accept loop can reach a pending `QUIT`.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(1);

/// Cloneable shutdown token shared by the broker, the signal watcher and the
/// harness loops.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    wake: Option<Arc<PathBuf>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks shutdown and, if tied to a broker, wakes its accept loop.
    pub fn request(&self) {
        if self.requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(path) = &self.wake {
            if let Err(e) = send_quit(path.as_path()) {
                tracing::debug!(path = %path.display(), error = %e, "broker already gone");
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Hands out descriptors to every peer that asks until told to quit.
pub struct Broker {
    path: PathBuf,
    listener: UnixListener,
    fds: Vec<OwnedFd>,
    shutdown: ShutdownHandle,
}

impl Broker {
    /// Binds a socket at `path`, replacing a stale one left by a previous run.
    pub fn bind(path: impl AsRef<Path>, fds: Vec<OwnedFd>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale broker socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        tracing::debug!(path = %path.display(), fds = fds.len(), "broker listening");

        let shutdown = ShutdownHandle {
            requested: Arc::new(AtomicBool::new(false)),
            wake: Some(Arc::new(path.clone())),
        };
        Ok(Self {
            path,
            listener,
            fds,
            shutdown,
        })
    }

    /// Binds the broker for `pool` in `dir`, serving duplicates of its
    /// notification counters.
    pub fn for_pool(dir: impl AsRef<Path>, pool: &Pool) -> io::Result<Self> {
        Self::bind(socket_path(dir, pool.name()), pool.notifier_fds()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept loop. Returns after a `QUIT` request or a shutdown request.
    ///
    /// Failures on one connection are logged and do not stop the loop.
    pub fn serve(&self) -> io::Result<()> {
        for conn in self.listener.incoming() {
            if self.shutdown.is_requested() {
                break;
            }
            let stream = match conn {
                Ok(s) => s,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "broker accept failed");
                    continue;
                }
            };
            match self.handle(stream) {
                Ok(Some(Command::Quit)) => {
                    tracing::debug!(path = %self.path.display(), "broker quit requested");
                    self.shutdown.requested.store(true, Ordering::Release);
                    break;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "broker connection failed"),
            }
        }
        Ok(())
    }

    fn handle(&self, mut stream: UnixStream) -> io::Result<Option<Command>> {
        stream.set_read_timeout(Some(PEER_TIMEOUT))?;
        stream.set_write_timeout(Some(PEER_TIMEOUT))?;
        let op = read_opcode(&mut stream)?;
        let cmd = match Command::try_from(op) {
            Ok(cmd) => cmd,
            Err(op) => {
                tracing::warn!(op, "unknown broker opcode");
                return Ok(None);
            }
        };
        if cmd == Command::SendFds {
            for fd in &self.fds {
                stream.as_raw_fd().send_fd(fd.as_raw_fd())?;
            }
            tracing::debug!(count = self.fds.len(), "descriptors sent");
        }
        Ok(Some(cmd))
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove broker socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_handle_only_flags() {
        let h = ShutdownHandle::new();
        let c = h.clone();
        assert!(!c.is_requested());
        h.request();
        assert!(c.is_requested());
        h.request();
    }

    #[test]
    fn bind_replaces_stale_socket() {
        use std::os::unix::fs::FileTypeExt;

        let path = std::env::temp_dir().join(format!("basalt_stale_{}.sock", std::process::id()));
        fs::write(&path, b"stale").unwrap();
        let broker = Broker::bind(&path, Vec::new()).unwrap();
        assert!(fs::metadata(&path).unwrap().file_type().is_socket());
        drop(broker);
        assert!(!path.exists());
    }

    #[test]
    fn silent_peer_does_not_block_shutdown() {
        use std::sync::mpsc;
        use std::thread;

        let path = std::env::temp_dir().join(format!("basalt_silent_{}.sock", std::process::id()));
        let broker = Broker::bind(&path, Vec::new()).unwrap();
        let handle = broker.shutdown_handle();
        let (done_tx, done_rx) = mpsc::channel();
        let server = thread::spawn(move || {
            let res = broker.serve();
            done_tx.send(res.is_ok()).unwrap();
        });

        // Connected but never sends an opcode.
        let _silent = UnixStream::connect(&path).unwrap();
        handle.request();

        let served = done_rx.recv_timeout(PEER_TIMEOUT * 3);
        assert_eq!(served, Ok(true), "serve() still running after shutdown request");
        server.join().unwrap();
        assert!(!path.exists());
    }
}
