//! Advisory wakeups on Linux `eventfd` counters.
//!
//! A producer bumps the counter after queuing work; a waiting consumer wakes,
//! resets it and then drains the bucket with non-blocking gets. Signals
//! coalesce, so one wakeup may stand for any number of queued buffers.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::eventfd::{EfdFlags, eventfd};
use nix::unistd::{read, write};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    /// Creates a fresh non-blocking, close-on-exec counter.
    pub fn new() -> io::Result<Self> {
        let fd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Self { fd })
    }

    /// Wraps a counter received from another process.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Adds one to the counter. A saturated counter already guarantees a
    /// wakeup, so `EAGAIN` counts as success.
    pub fn notify(&self) -> io::Result<()> {
        let one = 1u64.to_ne_bytes();
        loop {
            match write(self.fd.as_raw_fd(), &one) {
                Ok(_) | Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads and resets the counter without waiting.
    pub fn try_read(&self) -> io::Result<Option<u64>> {
        let mut buf = [0u8; 8];
        loop {
            match read(self.fd.as_raw_fd(), &mut buf) {
                Ok(_) => return Ok(Some(u64::from_ne_bytes(buf))),
                Err(Errno::EAGAIN) => return Ok(None),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Blocks until the counter is non-zero, then resets it and returns the
    /// accumulated count.
    pub fn wait(&self) -> io::Result<u64> {
        loop {
            self.poll_readable(-1)?;
            // Another waiter may have reset the counter in between.
            if let Some(n) = self.try_read()? {
                return Ok(n);
            }
        }
    }

    /// Like [`Notifier::wait`] but gives up after `timeout`, never earlier.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<Option<u64>> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            // Rounded up: a sub-millisecond remainder must not become 0.
            let ms = left.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32;
            if !self.poll_readable(ms)? {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                continue;
            }
            if let Some(n) = self.try_read()? {
                return Ok(Some(n));
            }
            if left.is_zero() {
                return Ok(None);
            }
        }
    }

    /// Duplicates the descriptor, e.g. for handing to the broker.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    fn poll_readable(&self, timeout_ms: i32) -> io::Result<bool> {
        let mut fds = [PollFd::new(&self.fd, PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, timeout_ms) {
                Ok(n) => return Ok(n > 0),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsFd for Notifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
