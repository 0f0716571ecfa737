//! Synchronization primitives available to kernel code.
//!
//! [`SpinLock`] is the busy-waiting primitive suitable for short critical
//! sections; [`RwLock`] adds reader/writer distinction; [`atomic`] exposes
//! lock-free primitives for single flags and counters.

pub mod atomic;
pub mod rwlock;
pub mod spinlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
