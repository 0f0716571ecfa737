//! Buffer cache: a sector-granular, write-back cache for the filesystem
//! block device.
//!
//! Mirrors the clock-algorithm cache the inode layer is built on: a
//! FIFO-ordered resident list gives every block a second chance before
//! eviction, and an evicted dirty block is written back by a short-lived
//! worker thread rather than blocking the evictor. A block being written
//! back this way sits in a separate "evicting" set; anyone who asks for that
//! sector again waits on a [`ConditionVariable`] until the worker finishes
//! instead of racing it.

use crate::sync::{ConditionVariable, Mutex, Semaphore};
use abyss::dev::{BlockOps, Sector, get_bdev};
use alloc::collections::{btree_map::BTreeMap, btree_set::BTreeSet, vec_deque::VecDeque};
use keos::{KernelError, thread::ThreadBuilder};

/// Slot of the filesystem's backing block device.
const FS_DEVICE_SLOT: usize = 1;

/// Maximum number of sectors held resident at once.
pub const CAPACITY: usize = 64;

/// Maximum number of write-back workers in flight at once.
const MAX_WRITEBACK_WORKERS: usize = 4;

struct Block {
    data: [u8; 512],
    dirty: bool,
    accessed: bool,
    in_use: usize,
}

struct State {
    blocks: BTreeMap<usize, Block>,
    order: VecDeque<usize>,
    evicting: BTreeSet<usize>,
}

pub struct BufferCache {
    state: Mutex<State>,
    evict_done: ConditionVariable,
    writeback_slots: Semaphore<()>,
}

fn device() -> &'static dyn BlockOps {
    get_bdev(FS_DEVICE_SLOT).expect("filesystem device not registered")
}

impl BufferCache {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State {
                blocks: BTreeMap::new(),
                order: VecDeque::new(),
                evicting: BTreeSet::new(),
            }),
            evict_done: ConditionVariable::new(),
            writeback_slots: Semaphore::new(MAX_WRITEBACK_WORKERS, ()),
        }
    }

    /// Ensures `sector` is resident, blocking until any in-flight eviction of
    /// it finishes, then marks it in-use and returns. `read` requests that
    /// the block's content be loaded from disk if it wasn't already
    /// resident; pass `false` for writes that will overwrite the whole
    /// sector anyway.
    fn get_block(&'static self, sector: Sector, read: bool) -> usize {
        let mut guard = self
            .evict_done
            .wait_while(&self.state, |s| s.evicting.contains(&sector.0));

        if !guard.blocks.contains_key(&sector.0) {
            if guard.blocks.len() >= CAPACITY {
                self.evict_one(&mut guard);
            }
            let mut data = [0u8; 512];
            if read {
                assert!(device().read(sector, &mut data), "buffer cache: disk read failed");
            }
            guard.blocks.insert(
                sector.0,
                Block {
                    data,
                    dirty: false,
                    accessed: false,
                    in_use: 0,
                },
            );
            guard.order.push_back(sector.0);
        }
        guard.blocks.get_mut(&sector.0).unwrap().in_use += 1;
        sector.0
    }

    /// Runs the clock sweep until a resident block is actually reclaimed.
    /// Blocks currently in use, or blocks the sweep has already given a
    /// second chance to in this pass, are requeued rather than evicted.
    fn evict_one(&'static self, state: &mut State) {
        loop {
            let Some(idx) = state.order.pop_front() else {
                return;
            };
            let Some(block) = state.blocks.get_mut(&idx) else {
                continue;
            };
            if block.accessed {
                block.accessed = false;
                state.order.push_back(idx);
                continue;
            }
            if block.in_use != 0 {
                state.order.push_back(idx);
                continue;
            }
            let block = state.blocks.remove(&idx).unwrap();
            state.evicting.insert(idx);
            self.spawn_writeback(idx, block.dirty, block.data);
            return;
        }
    }

    fn spawn_writeback(&'static self, sector: usize, dirty: bool, data: [u8; 512]) {
        // Held by the worker closure, not this function, so the permit
        // stays taken until the write-back itself finishes rather than
        // being dropped the moment the thread is merely launched.
        let permit = self.writeback_slots.wait();
        ThreadBuilder::new("cache-writeback").spawn(move || {
            let _permit = permit;
            if dirty {
                assert!(
                    device().write(Sector(sector), &data),
                    "buffer cache: write-back failed"
                );
            }
            let mut guard = self.state.lock();
            guard.evicting.remove(&sector);
            self.evict_done.broadcast(guard);
        });
    }

    /// Reads `len` bytes at `ofs` within `sector` into `buf`.
    pub fn read(
        &'static self,
        sector: Sector,
        buf: &mut [u8],
        ofs: usize,
        len: usize,
    ) -> Result<(), KernelError> {
        let idx = self.get_block(sector, true);
        let mut guard = self.state.lock();
        let block = guard.blocks.get_mut(&idx).ok_or(KernelError::IOError)?;
        buf[..len].copy_from_slice(&block.data[ofs..ofs + len]);
        block.accessed = true;
        block.in_use -= 1;
        guard.unlock();
        Ok(())
    }

    /// Writes `len` bytes at `ofs` within `sector` from `buf`. When the
    /// write doesn't cover the whole sector and the caller didn't already
    /// read it, the sector is zeroed first rather than leaving stale
    /// neighboring bytes.
    pub fn write(
        &'static self,
        sector: Sector,
        buf: &[u8],
        ofs: usize,
        len: usize,
        read_before_write: bool,
    ) -> Result<(), KernelError> {
        let full_sector = ofs == 0 && len == 512;
        let idx = self.get_block(sector, read_before_write || full_sector);
        let mut guard = self.state.lock();
        let block = guard.blocks.get_mut(&idx).ok_or(KernelError::IOError)?;
        if !read_before_write && !full_sector {
            block.data = [0u8; 512];
        }
        block.data[ofs..ofs + len].copy_from_slice(&buf[..len]);
        block.accessed = true;
        block.dirty = true;
        block.in_use -= 1;
        guard.unlock();
        Ok(())
    }

    /// Synchronously writes back every dirty resident block and drops the
    /// cache's contents. Used at filesystem unmount; unlike ordinary
    /// eviction this never hands work to an async worker.
    pub fn release_all(&self) {
        let mut guard = self.state.lock();
        for (sector, block) in guard.blocks.iter() {
            if block.dirty {
                assert!(
                    device().write(Sector(*sector), &block.data),
                    "buffer cache: release write-back failed"
                );
            }
        }
        guard.blocks.clear();
        guard.order.clear();
        guard.unlock();
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The system-wide buffer cache singleton.
pub static BUFFER_CACHE: BufferCache = BufferCache::new();

#[cfg(test)]
mod tests {
    use super::*;
    use abyss::dev::Sector;

    /// `read_blocks_on_a_sector_currently_being_evicted` drives `BUFFER_CACHE`
    /// against the real filesystem block device, so it assumes the standard
    /// boot environment has one registered at `FS_DEVICE_SLOT` — the same
    /// assumption the rest of this crate's disk-backed code makes (see
    /// `crate::init`). The other test below seeds `State` directly and never
    /// calls `device()`, so it has no such dependency.

    /// The clock sweep must skip a block that's still `in_use` rather than
    /// reclaim it, even after giving it a second chance for its accessed
    /// bit. Seeds the state directly instead of going through `read`/`write`,
    /// since both release their own `in_use` claim before returning and so
    /// can't otherwise produce a block that's in-use from the outside.
    pub fn clock_sweep_never_evicts_an_in_use_block() {
        let held = Block {
            data: [0u8; 512],
            dirty: false,
            accessed: false,
            in_use: 1,
        };
        let free = Block {
            data: [0u8; 512],
            dirty: false,
            accessed: false,
            in_use: 0,
        };
        let mut state = State {
            blocks: BTreeMap::new(),
            order: VecDeque::new(),
            evicting: BTreeSet::new(),
        };
        state.blocks.insert(0, held);
        state.blocks.insert(1, free);
        state.order.push_back(0);
        state.order.push_back(1);

        BUFFER_CACHE.evict_one(&mut state);

        assert!(state.blocks.contains_key(&0), "in-use block must not be evicted");
        assert!(!state.blocks.contains_key(&1), "the free block should have been the victim");
        assert!(state.evicting.contains(&1));
        // Requeued after being skipped, not dropped from the sweep.
        assert!(state.order.contains(&0));
    }

    /// A thread reading a sector that's mid-eviction must block until the
    /// write-back worker finishes, then see a fresh read from disk rather
    /// than racing the in-memory content the evictor was writing out.
    pub fn read_blocks_on_a_sector_currently_being_evicted() {
        BUFFER_CACHE.release_all();
        let sector = Sector(0);
        let mut buf = [0xAAu8; 512];
        BUFFER_CACHE.write(sector, &buf, 0, 512, false).unwrap();

        {
            let mut guard = BUFFER_CACHE.state.lock();
            BUFFER_CACHE.evict_one(&mut guard);
            assert!(guard.evicting.contains(&0));
            guard.unlock();
        }

        // Blocks until the write-back worker removes sector 0 from
        // `evicting`, then re-reads it from disk.
        BUFFER_CACHE.read(sector, &mut buf, 0, 512).unwrap();
        assert_eq!(buf, [0xAAu8; 512]);
        let guard = BUFFER_CACHE.state.lock();
        assert!(!guard.evicting.contains(&0));
        guard.unlock();
        BUFFER_CACHE.release_all();
    }
}
