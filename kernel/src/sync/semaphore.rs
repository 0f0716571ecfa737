//! A counting semaphore built from [`Mutex`] and [`ConditionVariable`].
//!
//! Used by the buffer cache to cap the number of in-flight asynchronous
//! write-back workers and by the filesystem's open-file table to bound the
//! number of concurrently open handles.

use super::{condition_variable::ConditionVariable, mutex::Mutex};
use core::ops::Deref;

/// A semaphore wrapping a protected resource `T`.
pub struct Semaphore<T> {
    resource: Mutex<T>,
    permits: Mutex<usize>,
    cond: ConditionVariable,
}

impl<T> Semaphore<T> {
    /// Creates a semaphore with `permits` initial permits guarding `resource`.
    pub const fn new(permits: usize, resource: T) -> Self {
        Self {
            resource: Mutex::new(resource),
            permits: Mutex::new(permits),
            cond: ConditionVariable::new(),
        }
    }

    /// Blocks until a permit is available, then returns an RAII guard that
    /// releases the permit on drop.
    pub fn wait(&self) -> SemaphorePermits<'_, T> {
        let mut guard = self.cond.wait_while(&self.permits, |n| *n == 0);
        *guard -= 1;
        guard.unlock();
        SemaphorePermits { sema: self }
    }

    /// Releases a permit, waking one waiter if any is blocked in
    /// [`wait`](Self::wait).
    pub fn signal(&self) {
        let mut guard = self.permits.lock();
        *guard += 1;
        self.cond.signal(guard);
    }
}

/// RAII guard returned by [`Semaphore::wait`]; releases the permit on drop.
pub struct SemaphorePermits<'a, T> {
    sema: &'a Semaphore<T>,
}

impl<T> Deref for SemaphorePermits<'_, T> {
    type Target = Mutex<T>;
    fn deref(&self) -> &Self::Target {
        &self.sema.resource
    }
}

impl<T> Drop for SemaphorePermits<'_, T> {
    fn drop(&mut self) {
        self.sema.signal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use keos::{sync::atomic::AtomicUsize, thread::ThreadBuilder};

    pub fn permits_cap_concurrent_holders() {
        const PERMITS: usize = 2;
        const WORKERS: usize = 8;
        let sema = Arc::new(Semaphore::new(PERMITS, ()));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: alloc::vec::Vec<_> = (0..WORKERS)
            .map(|_| {
                let sema = sema.clone();
                let concurrent = concurrent.clone();
                let max_seen = max_seen.clone();
                ThreadBuilder::new("sema-worker").spawn(move || {
                    let _permit = sema.wait();
                    let now = concurrent.fetch_add(1) + 1;
                    if now > max_seen.load() {
                        max_seen.store(now);
                    }
                    concurrent.fetch_sub(1);
                })
            })
            .collect();
        for h in handles {
            h.join();
        }
        assert!(max_seen.load() <= PERMITS);
    }
}
