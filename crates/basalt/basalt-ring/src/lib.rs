//! Lock-free bounded MPMC ring for shared memory.
//!
//! [`MpmcRing`] is a view over a ring laid out by [`shm_layout`]; the memory
//! can come from a shared mapping (see `basalt-pool`) or from a [`HeapRing`].
//!
//! The `loom` feature routes every ring atomic through loom so the
//! interleavings in `loom_tests` are checked exhaustively:
//!
//! ```bash
//! cargo test -p basalt-ring --features loom --lib
//! ```

mod heap;
mod mpmc;
mod ring;
pub mod shm_layout;
mod sync;


pub use heap::HeapRing;
pub use mpmc::{MpmcRing, RingFull};
pub use ring::{RingConfig, slot_index};
