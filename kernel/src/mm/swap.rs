//! Swap store: a first-fit bitmap allocator over a dedicated swap block
//! device, used to park anonymous pages that the frame table has evicted.
//!
//! Swap I/O bypasses the buffer cache entirely — a swap slot is always
//! read or written in full, so there is nothing for a block cache to
//! coalesce.

use crate::sync::Mutex;
use abyss::dev::{BlockOps, Sector, get_bdev};
use keos::{KernelError, mm::Page};

/// Slot index of the swap block device, as registered with `abyss`. The
/// kernel image occupies slot 0 and the filesystem disk occupies slot 1;
/// the swap device is the next one.
const SWAP_DEVICE_SLOT: usize = 2;

/// Sectors per page-sized swap slot.
const SECTORS_PER_SLOT: usize = 4096 / 512;

/// An index into the swap bitmap identifying one page-sized slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(pub usize);

/// The swap store: a bitmap of free/used page-sized slots over the swap
/// device.
pub struct SwapStore {
    // `true` means free.
    bitmap: alloc::vec::Vec<bool>,
}

impl SwapStore {
    /// Builds a swap store sized to the capacity of the swap block device.
    pub fn new() -> Self {
        let slots = get_bdev(SWAP_DEVICE_SLOT)
            .map(|dev| dev.block_cnt() / SECTORS_PER_SLOT)
            .unwrap_or(0);
        Self {
            bitmap: alloc::vec![true; slots],
        }
    }

    fn device(&self) -> &'static dyn BlockOps {
        get_bdev(SWAP_DEVICE_SLOT).expect("swap device not registered")
    }

    fn first_fit(&self) -> Option<usize> {
        self.bitmap.iter().position(|free| *free)
    }

    /// Writes `page`'s content to a freshly-allocated swap slot. Running out
    /// of swap space is fatal: a valid eviction must always be able to make
    /// progress, and there is no further fallback once swap itself is full.
    pub fn swap_out(&mut self, page: &Page) -> SwapSlot {
        let idx = self
            .first_fit()
            .expect("swap space exhausted: no free swap slot for eviction");
        self.bitmap[idx] = false;
        let dev = self.device();
        let base = idx * SECTORS_PER_SLOT;
        let content = page.inner();
        for i in 0..SECTORS_PER_SLOT {
            let mut buf = [0u8; 512];
            buf.copy_from_slice(&content[i * 512..(i + 1) * 512]);
            assert!(dev.write(Sector(base + i), &buf), "swap write failed");
        }
        SwapSlot(idx)
    }

    /// Reads a swap slot's content back into `page` and frees the slot. Per
    /// the original semantics, the page is considered dirty again after a
    /// swap-in, since its only copy was the one this call just overwrote in
    /// memory with data that previously required saving.
    pub fn swap_in(&mut self, slot: SwapSlot, page: &mut Page) -> Result<(), KernelError> {
        if self.bitmap.get(slot.0).copied() != Some(false) {
            return Err(KernelError::InvalidArgument);
        }
        let dev = self.device();
        let base = slot.0 * SECTORS_PER_SLOT;
        let content = page.inner_mut();
        for i in 0..SECTORS_PER_SLOT {
            let mut buf = [0u8; 512];
            assert!(dev.read(Sector(base + i), &mut buf), "swap read failed");
            content[i * 512..(i + 1) * 512].copy_from_slice(&buf);
        }
        self.bitmap[slot.0] = true;
        Ok(())
    }

    /// Frees a swap slot without reading it back, used when a process exits
    /// while one of its pages is still swapped out.
    pub fn invalidate(&mut self, slot: SwapSlot) {
        self.bitmap[slot.0] = true;
    }

    /// Number of free slots, exposed for tests that check the swap bitmap's
    /// free count is restored after a process exits.
    pub fn free_count(&self) -> usize {
        self.bitmap.iter().filter(|free| **free).count()
    }
}

impl Default for SwapStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The system-wide swap store singleton.
pub static SWAP_STORE: Mutex<SwapStore> = Mutex::new(SwapStore { bitmap: alloc::vec::Vec::new() });

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a store with a bitmap of the given size, bypassing
    /// `SwapStore::new()`'s dependency on a registered swap device — the
    /// allocator logic itself doesn't touch the device until an actual
    /// swap-out/swap-in is attempted.
    fn bitmap_of(slots: usize) -> SwapStore {
        SwapStore {
            bitmap: alloc::vec![true; slots],
        }
    }

    pub fn first_fit_picks_lowest_free_slot() {
        let mut store = bitmap_of(4);
        assert_eq!(store.first_fit(), Some(0));
        store.bitmap[0] = false;
        assert_eq!(store.first_fit(), Some(1));
        store.bitmap[1] = false;
        store.bitmap[2] = false;
        assert_eq!(store.first_fit(), Some(3));
    }

    pub fn invalidate_and_swap_in_both_free_the_slot() {
        let mut store = bitmap_of(2);
        store.bitmap[0] = false;
        assert_eq!(store.free_count(), 1);
        store.invalidate(SwapSlot(0));
        assert_eq!(store.free_count(), 2);
    }

    pub fn swap_in_rejects_a_slot_that_was_never_allocated() {
        let mut store = bitmap_of(2);
        let mut page = Page::new();
        assert_eq!(store.swap_in(SwapSlot(0), &mut page), Err(KernelError::InvalidArgument));
    }

    pub fn free_count_tracks_every_allocation_and_release() {
        let mut store = bitmap_of(8);
        assert_eq!(store.free_count(), 8);
        for i in 0..8 {
            store.bitmap[i] = false;
        }
        assert_eq!(store.first_fit(), None);
        assert_eq!(store.free_count(), 0);
        store.invalidate(SwapSlot(3));
        assert_eq!(store.free_count(), 1);
        assert_eq!(store.first_fit(), Some(3));
    }
}
