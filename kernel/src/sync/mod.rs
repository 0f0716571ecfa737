//! Blocking synchronization primitives layered on top of [`keos::sync::SpinLock`].
//!
//! These are ambient infrastructure: the frame table, buffer cache, and
//! inode/directory overlay below all need a lock that can actually sleep a
//! contending thread rather than spin, so this module builds one instead of
//! leaving it unimplemented.

pub mod condition_variable;
pub mod mutex;
pub mod semaphore;

pub use condition_variable::ConditionVariable;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{Semaphore, SemaphorePermits};
