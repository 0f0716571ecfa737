//! A blocking mutex, built on top of [`keos::sync::SpinLock`] and the
//! thread park/unpark primitives.
//!
//! Every core component below (frame table, buffer cache) holds at least one
//! of these for longer than a spinlock's busy-wait budget allows, so the
//! mutex has to actually sleep the waiter rather than spin.

use alloc::collections::vec_deque::VecDeque;
use core::ops::{Deref, DerefMut};
use keos::{
    sync::{SpinLock, SpinLockGuard, WouldBlock},
    thread::{Current, ParkHandle},
};

/// A mutual exclusion primitive that parks contending threads instead of
/// spinning.
pub struct Mutex<T> {
    t: SpinLock<T>,
    waiters: SpinLock<VecDeque<ParkHandle>>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state.
    pub const fn new(t: T) -> Mutex<T> {
        Mutex {
            t: SpinLock::new(t),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Acquires the mutex, blocking the current thread until it is free.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            if let Ok(guard) = self.t.try_lock() {
                return MutexGuard {
                    guard: Some(guard),
                    lock: self,
                };
            }
            Current::park_with(|handle| {
                let mut waiters = self.waiters.lock();
                waiters.push_back(handle);
                waiters.unlock();
            });
        }
    }

    /// Attempts to acquire the mutex without blocking.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        self.t.try_lock().map(|guard| MutexGuard {
            guard: Some(guard),
            lock: self,
        })
    }

    /// Consumes the mutex, returning the underlying data.
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.t.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

/// A scoped lock guard for [`Mutex`]. Must be released with
/// [`MutexGuard::unlock`]; dropping it unreleased panics.
pub struct MutexGuard<'a, T: 'a> {
    guard: Option<SpinLockGuard<'a, T>>,
    lock: &'a Mutex<T>,
}

impl<T> !Send for MutexGuard<'_, T> {}
unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> MutexGuard<'_, T> {
    /// Releases the mutex, waking one waiting thread if any is queued.
    pub fn unlock(mut self) {
        let lock = self.lock;
        self.guard.take().unwrap().unlock();
        let mut waiters = lock.waiters.lock();
        let next = waiters.pop_front();
        waiters.unlock();
        if let Some(handle) = next {
            handle.unpark();
        }
        core::mem::forget(self);
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        panic!("`.unlock()` must be explicitly called for MutexGuard.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{sync::Arc, vec::Vec};
    use keos::{sync::atomic::AtomicUsize, thread::ThreadBuilder};

    pub fn concurrent_increments_are_serialized() {
        const THREADS: usize = 32;
        let counter = Arc::new(Mutex::new(0usize));
        let started = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = counter.clone();
                let started = started.clone();
                ThreadBuilder::new("mutex-smoke").spawn(move || {
                    started.fetch_add(1);
                    let mut guard = counter.lock();
                    *guard += 1;
                    guard.unlock();
                })
            })
            .collect();
        for h in handles {
            h.join();
        }
        let guard = counter.lock();
        assert_eq!(*guard, THREADS);
        guard.unlock();
    }

    pub fn try_lock_fails_while_held() {
        let mutex = Mutex::new(());
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_err());
        guard.unlock();
        assert!(mutex.try_lock().is_ok());
    }
}
