// crates/evs-server/src/fsio/mod.rs
// Atomic file primitives: advisory lock, stability wait, atomic replace.

pub mod atomic;
pub mod lock;
pub mod stable;

pub use atomic::{atomic_write, check_guard};
pub use lock::{LockGuard, acquire, acquire_with_wait};
pub use stable::{stat_token, wait_stable};
