//! Out-of-band distribution of a pool's notification descriptors.
//!
//! Descriptors cannot travel through shared memory, so the pool creator runs
//! a small [`Broker`] on a Unix stream socket next to the pool. Peers connect,
//! ask for the descriptors and receive them one `SCM_RIGHTS` message at a
//! time.

pub mod client;
pub mod protocol;
mod server;
pub mod signals;

pub use client::{request_fds, request_fds_within, send_quit};
pub use protocol::{Command, DEFAULT_SOCKET_DIR, socket_path};
pub use server::{Broker, PEER_TIMEOUT, ShutdownHandle};
