//! Inode: two-level block-mapped file content, addressed through the buffer
//! cache, with a refcounted in-memory handle shared by every opener of the
//! same sector.

use super::{
    cache::BUFFER_CACHE,
    disk_layout::{InodeDisk, PointerBlock, FREE_MAP_SECTOR, LEVEL1_SIZE, LEVEL2_SIZE, MAX_FILE_SIZE, SECTOR_SIZE},
    free_map,
};
use crate::sync::Mutex;
use abyss::dev::Sector;
use alloc::{
    collections::btree_map::BTreeMap,
    sync::{Arc, Weak},
};
use keos::{
    KernelError,
    fs::{FileBlockNumber, InodeNumber, RegularFile, traits},
    mm::Page,
};

struct InodeMeta {
    start: u32,
    length: usize,
    isdir: bool,
    deny_write_cnt: usize,
    removed: bool,
}

/// The shared, in-memory state for one on-disk inode. At most one of these
/// exists per sector at a time; [`open`] hands out clones of the same
/// `Arc<Inode>` to every caller that opens the same sector concurrently.
pub struct Inode {
    sector: usize,
    meta: Mutex<InodeMeta>,
}

// Weak, not Arc: the table must not be the thing keeping an inode alive, or
// it would never observe the last real close and `Drop` would never run.
static OPEN_INODES: Mutex<BTreeMap<usize, Weak<Inode>>> = Mutex::new(BTreeMap::new());

fn read_sector(sector: usize) -> [u8; SECTOR_SIZE] {
    let mut buf = [0u8; SECTOR_SIZE];
    BUFFER_CACHE
        .read(Sector(sector), &mut buf, 0, SECTOR_SIZE)
        .expect("inode: sector read failed");
    buf
}

fn write_sector(sector: usize, buf: &[u8; SECTOR_SIZE]) {
    BUFFER_CACHE
        .write(Sector(sector), buf, 0, SECTOR_SIZE, false)
        .expect("inode: sector write failed");
}

fn alloc_sector() -> Result<usize, KernelError> {
    let mut guard = free_map::FREE_MAP.lock();
    let r = guard.allocate(1);
    guard.unlock();
    r
}

fn release_sector(sector: usize) {
    let mut guard = free_map::FREE_MAP.lock();
    guard.release(sector, 1);
    guard.unlock();
}

/// Creates a new inode at `sector` with `length` bytes of (sparse) content.
/// `length` is normally 0; non-zero is used to preallocate a directory's
/// entry table.
pub fn create(sector: usize, length: usize, isdir: bool) -> Result<(), KernelError> {
    let start = if sector == FREE_MAP_SECTOR {
        // The free map is addressed flatly; its extent is carved out by the
        // formatter, not allocated through itself.
        sector as u32 + 1
    } else {
        let root = alloc_sector()?;
        write_sector(root, &PointerBlock::zeroed().to_sector());
        root as u32
    };
    write_sector(sector, &InodeDisk::new(start, length as u32, isdir).to_sector());
    Ok(())
}

/// Opens (or reopens) the inode at `sector`, sharing state with any other
/// open handle for the same sector.
pub fn open(sector: usize) -> Arc<Inode> {
    let mut guard = OPEN_INODES.lock();
    if let Some(inode) = guard.get(&sector).and_then(Weak::upgrade) {
        guard.unlock();
        return inode;
    }
    let disk = unsafe { InodeDisk::from_sector(&read_sector(sector)) };
    let inode = Arc::new(Inode {
        sector,
        meta: Mutex::new(InodeMeta {
            start: disk.start,
            length: disk.length as usize,
            isdir: disk.isdir != 0,
            deny_write_cnt: 0,
            removed: false,
        }),
    });
    guard.insert(sector, Arc::downgrade(&inode));
    guard.unlock();
    inode
}

impl Inode {
    pub fn sector(&self) -> usize {
        self.sector
    }

    pub fn isdir(&self) -> bool {
        let guard = self.meta.lock();
        let v = guard.isdir;
        guard.unlock();
        v
    }

    pub fn length(&self) -> usize {
        let guard = self.meta.lock();
        let v = guard.length;
        guard.unlock();
        v
    }

    pub fn mark_removed(&self) {
        let mut guard = self.meta.lock();
        guard.removed = true;
        guard.unlock();
    }

    pub fn deny_write(&self) {
        let mut guard = self.meta.lock();
        guard.deny_write_cnt += 1;
        guard.unlock();
    }

    pub fn allow_write(&self) {
        let mut guard = self.meta.lock();
        assert!(guard.deny_write_cnt > 0);
        guard.deny_write_cnt -= 1;
        guard.unlock();
    }

    /// Translates a byte offset into the sector holding it, allocating (and
    /// zeroing) block-pointer blocks and data sectors on demand when
    /// `allocate` is set. Returns `Ok(None)` for a hole read with
    /// `allocate == false`.
    fn byte_to_sector(&self, pos: usize, allocate: bool) -> Result<Option<u32>, KernelError> {
        let start = {
            let guard = self.meta.lock();
            let v = guard.start;
            guard.unlock();
            v
        };

        if self.sector == FREE_MAP_SECTOR {
            return Ok(Some(start + (pos / SECTOR_SIZE) as u32));
        }

        let level1_idx = (pos >> 16) & (LEVEL1_SIZE - 1);
        let level2_idx = (pos >> 9) & (LEVEL2_SIZE - 1);

        let mut level1 = unsafe { PointerBlock::from_sector(&read_sector(start as usize)) };
        let mut level1_dirty = false;
        if level1.ptrs[level1_idx] == 0 {
            if !allocate {
                return Ok(None);
            }
            let block = alloc_sector()?;
            write_sector(block, &PointerBlock::zeroed().to_sector());
            level1.ptrs[level1_idx] = block as u32;
            level1_dirty = true;
        }
        if level1_dirty {
            write_sector(start as usize, &level1.to_sector());
        }

        let level2_sector = level1.ptrs[level1_idx] as usize;
        let mut level2 = unsafe { PointerBlock::from_sector(&read_sector(level2_sector)) };
        if level2.ptrs[level2_idx] == 0 {
            if !allocate {
                return Ok(None);
            }
            let data = alloc_sector()?;
            write_sector(data, &[0u8; SECTOR_SIZE]);
            level2.ptrs[level2_idx] = data as u32;
            write_sector(level2_sector, &level2.to_sector());
        }
        Ok(Some(level2.ptrs[level2_idx]))
    }

    pub(super) fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        let length = self.length();
        if offset >= length {
            return Ok(0);
        }
        let mut read = 0;
        let mut pos = offset;
        let want = buf.len().min(length - offset);
        while read < want {
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(want - read);
            match self.byte_to_sector(pos, false)? {
                Some(sector) => {
                    BUFFER_CACHE.read(Sector(sector as usize), &mut buf[read..read + chunk], sector_ofs, chunk)?;
                }
                None => buf[read..read + chunk].fill(0),
            }
            read += chunk;
            pos += chunk;
        }
        Ok(read)
    }

    pub(super) fn write_at(&self, buf: &[u8], offset: usize, min_size: usize) -> Result<usize, KernelError> {
        {
            let guard = self.meta.lock();
            let denied = guard.deny_write_cnt > 0;
            guard.unlock();
            if denied {
                return Ok(0);
            }
        }
        // The free-map inode is addressed flatly (see `byte_to_sector`), not
        // through the two-level map, so the map's size limit doesn't bound it.
        let flat = self.sector == FREE_MAP_SECTOR;
        let buf = if flat {
            buf
        } else if offset >= MAX_FILE_SIZE {
            &buf[..0]
        } else {
            &buf[..buf.len().min(MAX_FILE_SIZE - offset)]
        };
        let min_size = if flat { min_size } else { min_size.min(MAX_FILE_SIZE) };
        // `min_size` is the caller's actual intended final length; `buf` is
        // not a reliable source for that on its own, since `InodeHandle`'s
        // trait impl always calls this with a full page-sized buffer even
        // when most of its tail is past-EOF padding.
        let grow_to = min_size;
        {
            let mut guard = self.meta.lock();
            if grow_to > guard.length {
                guard.length = grow_to;
                let disk = InodeDisk::new(guard.start, guard.length as u32, guard.isdir);
                guard.unlock();
                write_sector(self.sector, &disk.to_sector());
            } else {
                guard.unlock();
            }
        }

        let mut written = 0;
        let mut pos = offset;
        while written < buf.len() {
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(buf.len() - written);
            let sector = self
                .byte_to_sector(pos, true)?
                .expect("byte_to_sector must allocate when asked to");
            let read_before_write = sector_ofs != 0 || chunk != SECTOR_SIZE;
            BUFFER_CACHE.write(
                Sector(sector as usize),
                &buf[written..written + chunk],
                sector_ofs,
                chunk,
                read_before_write,
            )?;
            written += chunk;
            pos += chunk;
        }
        Ok(written)
    }

    /// Frees every sector this inode's two-level map points to, plus the
    /// map blocks themselves and the inode's own header sector. Called when
    /// the last handle to a removed inode is dropped.
    fn free_all_blocks(&self) {
        let (start, is_flat) = {
            let guard = self.meta.lock();
            let v = (guard.start, self.sector == FREE_MAP_SECTOR);
            guard.unlock();
            v
        };
        if is_flat {
            release_sector(self.sector);
            return;
        }
        let level1 = unsafe { PointerBlock::from_sector(&read_sector(start as usize)) };
        for &level2_sector in level1.ptrs.iter() {
            if level2_sector == 0 {
                continue;
            }
            let level2 = unsafe { PointerBlock::from_sector(&read_sector(level2_sector as usize)) };
            for &data_sector in level2.ptrs.iter() {
                if data_sector != 0 {
                    release_sector(data_sector as usize);
                }
            }
            release_sector(level2_sector as usize);
        }
        release_sector(start as usize);
        release_sector(self.sector);
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let removed = {
            let guard = self.meta.lock();
            let v = guard.removed;
            guard.unlock();
            v
        };
        let mut table = OPEN_INODES.lock();
        table.remove(&self.sector);
        table.unlock();
        if removed {
            self.free_all_blocks();
        }
    }
}

/// Thin wrapper exposed to [`keos::fs`] as the actual [`traits::RegularFile`]
/// implementation; every clone shares the same underlying [`Inode`].
#[derive(Clone)]
pub struct InodeHandle(pub Arc<Inode>);

impl InodeHandle {
    pub fn open(sector: usize) -> Self {
        Self(open(sector))
    }

    pub fn into_regular_file(self) -> RegularFile {
        RegularFile::new(self)
    }
}

impl traits::RegularFile for InodeHandle {
    fn ino(&self) -> InodeNumber {
        InodeNumber::new(self.0.sector as u32).expect("sector 0 inode never wrapped as a file")
    }

    fn size(&self) -> usize {
        self.0.length()
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError> {
        let offset = fba.0 * 4096;
        if offset >= self.0.length() {
            return Ok(false);
        }
        let n = self.0.read_at(buf, offset)?;
        if n < 4096 {
            buf[n..].fill(0);
        }
        Ok(true)
    }

    fn write(&self, fba: FileBlockNumber, buf: &[u8; 4096], min_size: usize) -> Result<(), KernelError> {
        self.0.write_at(buf, fba.0 * 4096, min_size)?;
        Ok(())
    }

    fn mmap(&self, fba: FileBlockNumber) -> Result<Page, KernelError> {
        let mut page = Page::new();
        self.read(fba, page.inner_mut().as_mut_array().unwrap())?;
        Ok(page)
    }

    fn writeback(&self) -> Result<(), KernelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A write far past a file's current end must grow it to exactly the
    /// requested length, leaving the untouched middle reading back as zero
    /// instead of forcing it resident on disk. Exercises the two-level
    /// block map allocating a level1/level2 pointer block pair that a small
    /// file would never touch.
    ///
    /// Needs a real block device at the standard filesystem slot, the same
    /// assumption `fs::cache`'s disk-backed tests make (see `crate::init`).
    /// `free_map::init` only sizes the in-memory bitmap, so the sector count
    /// chosen here just has to fit on whatever disk is actually attached.
    pub fn sparse_write_far_past_eof_grows_the_file_and_leaves_a_hole() {
        const INODE_SECTOR: usize = 2;
        const OFFSET: usize = 7_000_000;
        const PAYLOAD: [u8; 4] = *b"keos";

        free_map::init(20_000);
        {
            let mut guard = free_map::FREE_MAP.lock();
            let claimed = guard.allocate(1).unwrap();
            guard.unlock();
            assert_eq!(claimed, INODE_SECTOR, "test assumes a freshly initialized free map");
        }
        create(INODE_SECTOR, 0, false).unwrap();
        let inode = open(INODE_SECTOR);

        let written = inode.write_at(&PAYLOAD, OFFSET, OFFSET + PAYLOAD.len()).unwrap();
        assert_eq!(written, PAYLOAD.len());
        assert_eq!(inode.length(), OFFSET + PAYLOAD.len());

        let mut hole = [0xAAu8; 4096];
        let n = inode.read_at(&mut hole, 0).unwrap();
        assert_eq!(n, 4096);
        assert!(hole.iter().all(|&b| b == 0), "unwritten region must read as zero, not stale or uninitialized");

        let mut tail = [0u8; PAYLOAD.len()];
        let n = inode.read_at(&mut tail, OFFSET).unwrap();
        assert_eq!(n, PAYLOAD.len());
        assert_eq!(tail, PAYLOAD);

        inode.mark_removed();
    }

    /// A write that would cross the two-level map's size limit must come
    /// back short instead of wrapping into low-index level-1 pointer slots;
    /// one starting at or past the limit must write nothing at all.
    pub fn write_past_the_two_level_map_limit_returns_a_short_write() {
        const INODE_SECTOR: usize = 2;
        const NEAR_LIMIT: usize = MAX_FILE_SIZE - 5;

        free_map::init(20_000);
        {
            let mut guard = free_map::FREE_MAP.lock();
            let claimed = guard.allocate(1).unwrap();
            guard.unlock();
            assert_eq!(claimed, INODE_SECTOR, "test assumes a freshly initialized free map");
        }
        create(INODE_SECTOR, 0, false).unwrap();
        let inode = open(INODE_SECTOR);

        let payload = [0xABu8; 10];
        let written = inode.write_at(&payload, NEAR_LIMIT, NEAR_LIMIT + payload.len()).unwrap();
        assert_eq!(written, 5, "only the bytes before the limit should be written");
        assert_eq!(inode.length(), MAX_FILE_SIZE, "length must not grow past the map's limit");

        let written = inode.write_at(&payload, MAX_FILE_SIZE, MAX_FILE_SIZE + payload.len()).unwrap();
        assert_eq!(written, 0, "a write starting at or past the limit writes nothing");
        assert_eq!(inode.length(), MAX_FILE_SIZE);

        inode.mark_removed();
    }
}
