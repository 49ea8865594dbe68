//! Peer side of the broker protocol.

use crate::protocol::Command;
use basalt_pool::MAX_FDS;
use passfd::FdPassingExt;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Asks the broker at `path` for its descriptors.
///
/// Reads until the broker closes the connection or [`MAX_FDS`] descriptors
/// arrived, whichever comes first.
pub fn request_fds(path: impl AsRef<Path>) -> io::Result<Vec<OwnedFd>> {
    let mut stream = UnixStream::connect(path)?;
    stream.write_all(&Command::SendFds.to_bytes())?;

    let mut fds = Vec::new();
    while fds.len() < MAX_FDS {
        match stream.as_raw_fd().recv_fd() {
            // SAFETY: recv_fd hands over a freshly installed descriptor
            Ok(fd) => fds.push(unsafe { OwnedFd::from_raw_fd(fd) }),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    tracing::debug!(count = fds.len(), "descriptors received");
    Ok(fds)
}

/// Like [`request_fds`], retrying while the broker socket does not exist yet.
pub fn request_fds_within(path: impl AsRef<Path>, timeout: Duration) -> io::Result<Vec<OwnedFd>> {
    let path = path.as_ref();
    let deadline = Instant::now() + timeout;
    loop {
        match request_fds(path) {
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) && Instant::now() < deadline =>
            {
                thread::sleep(Duration::from_millis(10));
            }
            other => return other,
        }
    }
}

/// Tells the broker at `path` to remove its socket and stop serving.
pub fn send_quit(path: impl AsRef<Path>) -> io::Result<()> {
    let mut stream = UnixStream::connect(path)?;
    stream.write_all(&Command::Quit.to_bytes())
}
