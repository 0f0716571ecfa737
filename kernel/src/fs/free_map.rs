//! Free-map allocator: a first-fit bitmap over the filesystem disk's
//! sectors.
//!
//! The original `free-map.c` backs this bitmap with its own file (addressed
//! flatly through the free-map inode, see [`super::disk_layout::FREE_MAP_SECTOR`]).
//! This crate keeps the bitmap itself in memory and persists only the
//! allocation decisions implied by what's written through it; every sector
//! the inode/directory layer allocates goes through [`FreeMap::allocate`] /
//! [`FreeMap::release`], so the bitmap is always consistent with what's
//! actually in use for the lifetime of a mount.

use crate::sync::Mutex;
use keos::KernelError;

pub struct FreeMap {
    // `true` means in use.
    bits: alloc::vec::Vec<bool>,
}

impl FreeMap {
    /// Builds a free map sized to `sector_count`, with `reserved` leading
    /// sectors (the free-map inode and root directory headers) pre-marked
    /// in use.
    pub fn new(sector_count: usize, reserved: usize) -> Self {
        let mut bits = alloc::vec![false; sector_count];
        for b in bits.iter_mut().take(reserved) {
            *b = true;
        }
        Self { bits }
    }

    /// Allocates a single free sector, first-fit. `n` is always 1 in
    /// practice (the inode/block-map layer never asks for contiguous runs).
    pub fn allocate(&mut self, n: usize) -> Result<usize, KernelError> {
        assert_eq!(n, 1, "free map only ever allocates single sectors");
        let idx = self
            .bits
            .iter()
            .position(|used| !used)
            .ok_or(KernelError::NoSpace)?;
        self.bits[idx] = true;
        Ok(idx)
    }

    pub fn release(&mut self, sector: usize, n: usize) {
        for s in sector..sector + n {
            self.bits[s] = false;
        }
    }

    pub fn free_count(&self) -> usize {
        self.bits.iter().filter(|used| !**used).count()
    }
}

pub static FREE_MAP: Mutex<FreeMap> = Mutex::new(FreeMap { bits: alloc::vec::Vec::new() });

/// Replaces the free map singleton with one sized to the mounted disk. Must
/// be called once at filesystem mount time, before any inode is opened.
pub fn init(sector_count: usize) {
    let mut guard = FREE_MAP.lock();
    *guard = FreeMap::new(sector_count, 2);
    guard.unlock();
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn new_reserves_the_leading_sectors() {
        let map = FreeMap::new(10, 2);
        assert_eq!(map.free_count(), 8);
    }

    pub fn allocate_is_first_fit_and_release_frees_it_again() {
        let mut map = FreeMap::new(4, 0);
        assert_eq!(map.allocate(1).unwrap(), 0);
        assert_eq!(map.allocate(1).unwrap(), 1);
        map.release(0, 1);
        assert_eq!(map.allocate(1).unwrap(), 0);
        assert_eq!(map.free_count(), 1);
    }

    pub fn allocate_fails_once_exhausted() {
        let mut map = FreeMap::new(2, 0);
        map.allocate(1).unwrap();
        map.allocate(1).unwrap();
        assert_eq!(map.allocate(1), Err(KernelError::NoSpace));
    }
}
