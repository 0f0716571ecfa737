//! In-memory [`keos::fs::traits::RegularFile`] used by unit tests that
//! exercise [`crate::mm`] without needing a booted disk behind them.

use alloc::vec::Vec;
use keos::{
    KernelError,
    fs::{FileBlockNumber, InodeNumber, RegularFile, traits},
};

use crate::sync::Mutex;

struct State {
    data: Vec<u8>,
}

/// A regular file backed by a plain in-memory buffer instead of a disk
/// inode. `mm::pager` only ever talks to files through [`traits::RegularFile`],
/// so this is a drop-in substitute for exercising mmap/fault/evict/write-back
/// logic in isolation from the filesystem.
pub struct MockFile(Mutex<State>);

impl MockFile {
    pub fn new(initial: Vec<u8>) -> RegularFile {
        RegularFile::new(Self(Mutex::new(State { data: initial })))
    }

    pub fn zeroed(len: usize) -> RegularFile {
        Self::new(alloc::vec![0u8; len])
    }

    /// Snapshot of the current content, for assertions.
    pub fn snapshot(file: &RegularFile) -> Vec<u8> {
        let mut out = alloc::vec![0u8; file.size()];
        file.read(0, &mut out).expect("mock file read must not fail");
        out
    }
}

impl traits::RegularFile for MockFile {
    fn ino(&self) -> InodeNumber {
        InodeNumber::new(1).unwrap()
    }

    fn size(&self) -> usize {
        let guard = self.0.lock();
        let n = guard.data.len();
        guard.unlock();
        n
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError> {
        let guard = self.0.lock();
        let offset = fba.0 * 4096;
        if offset >= guard.data.len() {
            guard.unlock();
            return Ok(false);
        }
        let n = (guard.data.len() - offset).min(4096);
        buf[..n].copy_from_slice(&guard.data[offset..offset + n]);
        buf[n..].fill(0);
        guard.unlock();
        Ok(true)
    }

    fn write(&self, fba: FileBlockNumber, buf: &[u8; 4096], min_size: usize) -> Result<(), KernelError> {
        let mut guard = self.0.lock();
        let offset = fba.0 * 4096;
        // `min_size` is the caller's real target length; it can be smaller
        // than `offset + buf.len()` when most of this block is past-EOF
        // padding, so the backing `Vec` is grown only long enough to do the
        // copy, then trimmed back down to the length that actually counts.
        let final_len = min_size.max(guard.data.len());
        if guard.data.len() < offset + 4096 {
            guard.data.resize(offset + 4096, 0);
        }
        guard.data[offset..offset + 4096].copy_from_slice(buf);
        guard.data.resize(final_len, 0);
        guard.unlock();
        Ok(())
    }

    fn writeback(&self) -> Result<(), KernelError> {
        Ok(())
    }
}
