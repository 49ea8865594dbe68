//! Atomics and spin hints used by the ring, switched to loom's versions
//! under the `loom` feature.

#[cfg(not(feature = "loom"))]
pub use std::hint::spin_loop;
#[cfg(feature = "loom")]
pub use loom::hint::spin_loop;

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicU32, Ordering};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, Ordering};

#[cfg(all(test, feature = "loom"))]
pub use loom::thread;
