//! Demand-paged virtual memory and a write-back disk block cache for a
//! teaching kernel built on [`keos`].
//!
//! [`mm`] implements the memory-management core: physical frames, swap,
//! page tables, and the lazy pager driving them. [`fs`] implements the
//! filesystem layered on top of a sector-level buffer cache: free space
//! tracking, inodes, and directories. [`sync`] carries the synchronization
//! primitives both of those lean on. [`loader`], [`process`], and
//! [`syscall`] are a thin adapter giving `mm` and `fs` a process to be
//! driven from, not components of their own.

#![no_std]
#![no_main]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;
#[allow(unused_imports)]
#[macro_use]
extern crate keos;

pub mod fs;
pub mod loader;
pub mod mm;
pub mod process;
pub mod sync;
pub mod syscall;
#[cfg(test)]
mod testutil;

pub use process::Process;

/// Slot of the filesystem block device, as registered with `abyss`. Slot 0
/// is the kernel image; slot 1 is the filesystem disk; [`mm::swap`]'s swap
/// device is the next slot after this one.
pub const FS_DEVICE_SLOT: usize = 1;

/// Brings up the filesystem and swap subsystems against the block devices
/// the boot harness has already registered. Mirrors `keos`'s own split
/// between mounting an existing disk image (`mount`) and initializing a
/// fresh one (`format`): a test harness picks whichever its fixture needs.
pub mod init {
    use crate::mm::SWAP_STORE;
    use abyss::dev::{BlockOps, get_bdev};

    fn sector_count() -> usize {
        get_bdev(crate::FS_DEVICE_SLOT)
            .map(|dev| dev.block_cnt())
            .expect("filesystem device not registered")
    }

    /// Mounts an already-formatted filesystem disk and sizes the swap store
    /// against its own device.
    pub fn mount() {
        crate::fs::mount(sector_count());
        let mut guard = SWAP_STORE.lock();
        *guard = crate::mm::swap::SwapStore::new();
        guard.unlock();
    }

    /// Formats a fresh filesystem disk (free map + empty root directory)
    /// and sizes the swap store.
    pub fn format() {
        crate::fs::format(sector_count()).expect("formatting a fresh filesystem disk should not fail");
        let mut guard = SWAP_STORE.lock();
        *guard = crate::mm::swap::SwapStore::new();
        guard.unlock();
    }
}
