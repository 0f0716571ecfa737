//! Frame table: the physical-memory half of demand paging.
//!
//! Tracks every user-owned physical frame in a single FIFO-ordered resident
//! list. [`FrameTable::allocate`] never returns "out of memory" for a valid
//! request — once the underlying physical allocator is exhausted it runs the
//! clock algorithm over the resident list instead, evicting the first frame
//! whose hardware accessed bit is clear.

use crate::sync::Mutex;
use alloc::{boxed::Box, collections::vec_deque::VecDeque};
use keos::mm::{ContigPages, Page};

/// Something a frame can be evicted from: the owning page table entry plus
/// enough context to persist the frame's content before it is reused.
///
/// Implemented by [`crate::mm::pager::PageOwner`], which bridges this trait
/// back to a specific process's page table and its file/swap backing.
pub trait EvictionTarget: Send {
    /// Hardware accessed bit for the mapping this frame backs.
    fn accessed(&self) -> bool;
    /// Hardware dirty bit for the mapping this frame backs.
    fn dirty(&self) -> bool;
    /// Clear the hardware accessed bit (used by the clock sweep's second
    /// chance).
    fn clear_accessed(&mut self);
    /// Persist the frame's content (swap-out or write-back as appropriate)
    /// and unmap it from the owning page table, returning the now-orphaned
    /// physical page for reuse.
    fn evict(&mut self) -> Page;
}

struct Resident {
    target: Box<dyn EvictionTarget>,
}

/// The system-wide frame table. One instance, protected by a single mutex
/// (spec's `frame_lock`).
pub struct FrameTable {
    resident: VecDeque<Resident>,
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTable {
    /// Creates an empty frame table.
    pub const fn new() -> Self {
        Self {
            resident: VecDeque::new(),
        }
    }

    /// Allocates a fresh zeroed physical frame. If the physical allocator is
    /// exhausted, runs the clock eviction algorithm to reclaim one instead —
    /// this call does not fail for a request that would otherwise succeed
    /// once a victim is evicted.
    pub fn allocate(&mut self) -> Page {
        if let Some(c) = ContigPages::new(0x1000) {
            let pa = c.kva().into_pa();
            // `Page::from_pa` re-derives ownership from the same arena slot;
            // forgetting `c` avoids double-releasing the refcount it holds.
            core::mem::forget(c);
            return unsafe { Page::from_pa(pa) };
        }
        self.evict_one()
    }

    /// Registers a newly-mapped frame as resident, making it eligible for
    /// future eviction. Must be called immediately after the frame is
    /// installed into a page table.
    pub fn register(&mut self, target: Box<dyn EvictionTarget>) {
        self.resident.push_back(Resident { target });
    }

    /// Runs the clock algorithm: pop the front of the FIFO list, give it a
    /// second chance if accessed, otherwise evict it.
    ///
    /// `pub(crate)` instead of private so tests can force a deterministic
    /// eviction directly, without actually exhausting physical memory to
    /// drive it through [`allocate`](Self::allocate).
    pub(crate) fn evict_one(&mut self) -> Page {
        loop {
            let mut front = self
                .resident
                .pop_front()
                .expect("frame table exhausted: no resident frames to evict");
            if front.target.accessed() {
                front.target.clear_accessed();
                self.resident.push_back(front);
                continue;
            }
            keos::debug!("frame table: evicting a resident frame");
            return front.target.evict();
        }
    }

    /// Drops every resident entry without writing anything back — used
    /// during process exit, after the process's own mappings have already
    /// been invalidated under the frame lock.
    pub fn forget_all(&mut self, mut matches: impl FnMut(&dyn EvictionTarget) -> bool) {
        self.resident.retain(|r| !matches(&*r.target));
    }
}

/// The system-wide frame table singleton.
pub static FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable::new());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Mutex as KMutex;
    use alloc::sync::Arc;

    /// An eviction target whose accessed bit and evict-count are driven
    /// directly by the test instead of hardware.
    struct FakeTarget {
        accessed: bool,
        evictions: Arc<KMutex<alloc::vec::Vec<&'static str>>>,
        name: &'static str,
    }

    impl EvictionTarget for FakeTarget {
        fn accessed(&self) -> bool {
            self.accessed
        }

        fn dirty(&self) -> bool {
            false
        }

        fn clear_accessed(&mut self) {
            self.accessed = false;
        }

        fn evict(&mut self) -> Page {
            let mut log = self.evictions.lock();
            log.push(self.name);
            log.unlock();
            Page::new()
        }
    }

    pub fn clock_gives_accessed_frames_a_second_chance() {
        let mut table = FrameTable::new();
        let log: Arc<KMutex<alloc::vec::Vec<&'static str>>> = Arc::new(KMutex::new(alloc::vec::Vec::new()));

        table.register(alloc::boxed::Box::new(FakeTarget {
            accessed: true,
            evictions: log.clone(),
            name: "a",
        }));
        table.register(alloc::boxed::Box::new(FakeTarget {
            accessed: false,
            evictions: log.clone(),
            name: "b",
        }));

        // `a` is accessed, so the sweep clears its bit and requeues it
        // behind `b` before evicting `b` on the same pass.
        table.evict_one();

        let out = log.lock();
        assert_eq!(&**out, &["b"]);
        out.unlock();

        // `a`'s accessed bit was cleared by the first sweep, so the next
        // eviction takes it.
        table.evict_one();
        let out = log.lock();
        assert_eq!(&**out, &["b", "a"]);
        out.unlock();
    }
}
