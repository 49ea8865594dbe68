//! Shared-memory buffer pool.
//!
//! A pool is one named shared memory segment holding a header, `buckets`
//! lock-free rings and a slab of fixed-size buffers. Buffers travel between
//! buckets (pipeline stages) as `u32` offsets; the payload never moves.
//! Bucket 0 is the free list.
//!
//! ```no_run
//! use basalt_pool::Pool;
//!
//! let pool = Pool::create("frames", 1024, 2, 1)?;
//! let mut buf = pool.allocate().expect("free list empty");
//! pool.write(&mut buf, b"payload");
//! pool.put(1, buf).expect("stage full");
//!
//! // elsewhere, usually in another process:
//! let peer = Pool::register("frames")?;
//! if let Some(buf) = peer.get(1) {
//!     assert_eq!(peer.payload(&buf), b"payload");
//!     peer.free(buf).expect("free list full");
//! }
//! # Ok::<(), basalt_pool::PoolError>(())
//! ```

mod buffer;
mod error;
mod layout;
mod notify;
mod pool;

pub use buffer::{BUFFER_SIZE, Buffer, BufferCell, IN_FLIGHT, OWNER_CHECKS, UNUSED};
pub use error::PoolError;
pub use layout::{PoolHeader, PoolLayout, check_geometry, check_name};
pub use notify::Notifier;
pub use pool::{Detach, FREE_LIST, Pool, Transfer};

/// Maximum slots per bucket ring.
pub const MAX_ENTRIES: u32 = 1 << 20;

/// Maximum number of buckets in one pool.
pub const MAX_BUCKETS: usize = 16;

/// Maximum number of notification counters per pool.
pub const MAX_FDS: usize = 16;

/// Size of the name field in the header, including the terminating NUL.
pub const MAX_NAME: usize = 100;
