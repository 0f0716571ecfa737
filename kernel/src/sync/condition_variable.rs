//! Condition variable paired with [`Mutex`], used by the buffer cache to
//! wait for an evicting block to finish writing back.

use super::mutex::{Mutex, MutexGuard};
use alloc::collections::vec_deque::VecDeque;
use keos::{sync::SpinLock, thread::{Current, ParkHandle}};

/// A condition variable. Must always be waited on with the same [`Mutex`].
#[derive(Default)]
pub struct ConditionVariable {
    waiters: SpinLock<VecDeque<ParkHandle>>,
}

impl ConditionVariable {
    /// Creates a new, empty condition variable.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Blocks the current thread while `predicate(&mut T)` holds, re-checking
    /// it every time the thread is woken.
    pub fn wait_while<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        predicate: impl Fn(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        let mut guard = mutex.lock();
        while predicate(&mut guard) {
            guard.unlock();
            Current::park_with(|handle| {
                let mut waiters = self.waiters.lock();
                waiters.push_back(handle);
                waiters.unlock();
            });
            guard = mutex.lock();
        }
        guard
    }

    /// Wakes one thread blocked in [`wait_while`](Self::wait_while).
    pub fn signal<T>(&self, guard: MutexGuard<'_, T>) {
        guard.unlock();
        let mut waiters = self.waiters.lock();
        let next = waiters.pop_front();
        waiters.unlock();
        if let Some(handle) = next {
            handle.unpark();
        }
    }

    /// Wakes every thread blocked in [`wait_while`](Self::wait_while).
    pub fn broadcast<T>(&self, guard: MutexGuard<'_, T>) {
        guard.unlock();
        let mut waiters = self.waiters.lock();
        let all: VecDeque<ParkHandle> = core::mem::take(&mut *waiters);
        waiters.unlock();
        for handle in all {
            handle.unpark();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use keos::thread::ThreadBuilder;

    pub fn wait_while_blocks_until_the_predicate_clears() {
        let ready = Arc::new(Mutex::new(false));
        let cond = Arc::new(ConditionVariable::new());

        let waiter = {
            let ready = ready.clone();
            let cond = cond.clone();
            ThreadBuilder::new("waiter").spawn(move || {
                let guard = cond.wait_while(&ready, |r| !*r);
                assert!(*guard);
                guard.unlock();
            })
        };

        let mut guard = ready.lock();
        *guard = true;
        cond.signal(guard);
        waiter.join();
    }

    pub fn broadcast_wakes_every_waiter() {
        const WAITERS: usize = 8;
        let ready = Arc::new(Mutex::new(false));
        let cond = Arc::new(ConditionVariable::new());

        let handles: alloc::vec::Vec<_> = (0..WAITERS)
            .map(|_| {
                let ready = ready.clone();
                let cond = cond.clone();
                ThreadBuilder::new("broadcast-waiter").spawn(move || {
                    let guard = cond.wait_while(&ready, |r| !*r);
                    guard.unlock();
                })
            })
            .collect();

        let mut guard = ready.lock();
        *guard = true;
        cond.broadcast(guard);
        for h in handles {
            h.join();
        }
    }
}
