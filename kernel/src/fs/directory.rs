//! Directory: a regular file whose content is a dense array of [`DirEntry`]
//! records, plus the [`traits::Directory`]/[`traits::FileSystem`]
//! implementations that expose this layout to `keos::fs`.
//!
//! Component-by-component path walking (`a/b/c`) is handled generically by
//! [`keos::fs::Directory::open`]/`create`/`unlink`, which repeatedly call
//! [`DirectoryNode::open_entry`] on successive path components; this module
//! only implements the single-component primitives.

use super::{
    disk_layout::{DirEntry, NAME_MAX, ROOT_DIR_SECTOR},
    inode::{self, Inode, InodeHandle},
};
use crate::sync::Mutex;
use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use keos::{
    KernelError,
    fs::{Directory, File, FileSystem as FsHandle, InodeNumber, traits},
    sync::atomic::AtomicBool,
};

/// An open directory: the inode backing its entry table plus a lock
/// serializing the read-scan-then-write sequences that `add`/`remove` need.
pub struct DirectoryNode {
    inode: Arc<Inode>,
    lock: Mutex<()>,
    removed: AtomicBool,
}

impl DirectoryNode {
    pub fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            lock: Mutex::new(()),
            removed: AtomicBool::new(false),
        }
    }

    pub fn open(sector: usize) -> Self {
        Self::new(inode::open(sector))
    }

    /// Number of entry slots the file body has ever grown to, including
    /// freed (`in_use == 0`) ones — the bound for scanning the whole table.
    fn slot_count(&self) -> usize {
        self.inode.length() / DirEntry::SIZE
    }

    /// Number of slots actually `in_use`, ignoring freed ones. This is the
    /// count that matters for "is this directory empty" checks; a directory
    /// that once held an entry which was later removed still reads as empty
    /// here even though its file body never shrank back down.
    fn active_entry_count(&self) -> usize {
        let count = self.slot_count();
        let mut active = 0;
        for i in 0..count {
            if let Some(e) = self.read_entry(i * DirEntry::SIZE) {
                if e.in_use != 0 {
                    active += 1;
                }
            }
        }
        active
    }

    fn read_entry(&self, ofs: usize) -> Option<DirEntry> {
        let mut buf = [0u8; DirEntry::SIZE];
        let n = self.inode.read_at(&mut buf, ofs).ok()?;
        if n != DirEntry::SIZE {
            return None;
        }
        Some(DirEntry::from_bytes(&buf))
    }

    fn write_entry(&self, ofs: usize, entry: DirEntry) -> Result<(), KernelError> {
        self.inode.write_at(&entry.to_bytes(), ofs, ofs + DirEntry::SIZE)?;
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<(DirEntry, usize)> {
        let count = self.slot_count();
        for i in 0..count {
            let ofs = i * DirEntry::SIZE;
            if let Some(e) = self.read_entry(ofs) {
                if e.in_use != 0 && e.name_str() == name {
                    return Some((e, ofs));
                }
            }
        }
        None
    }

    /// Adds a single directory entry named `name` pointing at `inode_sector`.
    /// Used both by regular `create_entry` and to install the `.`/`..`
    /// entries of a freshly created subdirectory.
    fn add(&self, name: &str, inode_sector: u32, isdir: bool) -> Result<(), KernelError> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        if self.lookup(name).is_some() {
            return Err(KernelError::FileExist);
        }
        let count = self.slot_count();
        let mut free_ofs = count * DirEntry::SIZE;
        for i in 0..count {
            let ofs = i * DirEntry::SIZE;
            if let Some(e) = self.read_entry(ofs) {
                if e.in_use == 0 {
                    free_ofs = ofs;
                    break;
                }
            }
        }
        let mut entry = DirEntry::free();
        entry.in_use = 1;
        entry.isdir = isdir as u8;
        entry.inode_sector = inode_sector;
        entry.set_name(name);
        self.write_entry(free_ofs, entry)
    }
}

impl traits::Directory for DirectoryNode {
    fn ino(&self) -> InodeNumber {
        InodeNumber::new(self.inode.sector() as u32).expect("directory inode sector is never 0")
    }

    fn size(&self) -> usize {
        self.inode.length()
    }

    fn link_count(&self) -> usize {
        let count = self.slot_count();
        let mut children = 0;
        for i in 0..count {
            if let Some(e) = self.read_entry(i * DirEntry::SIZE) {
                if e.in_use != 0 && e.isdir != 0 && e.name_str() != "." && e.name_str() != ".." {
                    children += 1;
                }
            }
        }
        2 + children
    }

    fn open_entry(&self, entry: &str) -> Result<File, KernelError> {
        let (e, _) = self.lookup(entry).ok_or(KernelError::NoSuchEntry)?;
        let child = inode::open(e.inode_sector as usize);
        if e.isdir != 0 {
            Ok(File::Directory(Directory::new(DirectoryNode::new(child))))
        } else {
            Ok(File::RegularFile(InodeHandle(child).into_regular_file()))
        }
    }

    fn create_entry(&self, entry: &str, is_dir: bool) -> Result<File, KernelError> {
        let guard = self.lock.lock();

        if self.lookup(entry).is_some() {
            guard.unlock();
            return Err(KernelError::FileExist);
        }

        let sector = super::free_map::FREE_MAP.lock();
        let sector = {
            let mut sector = sector;
            let r = sector.allocate(1);
            sector.unlock();
            r
        }?;

        let create_result = if is_dir {
            inode::create(sector, 2 * DirEntry::SIZE, true)
        } else {
            inode::create(sector, 0, false)
        };
        // Whether `inode::create` itself wrote a valid header, independent
        // of whatever `self.add` below does with it — the rollback below
        // needs to tell these two failure points apart.
        let create_ok = create_result.is_ok();

        let result = create_result.and_then(|()| {
            if is_dir {
                let new_dir = DirectoryNode::open(sector);
                new_dir.add(".", sector as u32, true)?;
                new_dir.add("..", self.inode.sector() as u32, true)?;
            }
            self.add(entry, sector as u32, is_dir)
        });

        guard.unlock();

        match result {
            Ok(()) => self.open_entry(entry),
            Err(e) => {
                if create_ok {
                    // `inode::create` already wrote a valid header, and for
                    // a directory `.`/`..` may have gone on to allocate a
                    // level-2 block and a data sector through `add`.
                    // Opening the inode and marking it removed drives
                    // `Inode::free_all_blocks` on drop, releasing all of
                    // that back to the free map, not just the header sector.
                    inode::open(sector).mark_removed();
                } else {
                    // `inode::create` failed before writing a header, so
                    // there's nothing at `sector` to read back safely —
                    // just return the bare sector.
                    let mut fm = super::free_map::FREE_MAP.lock();
                    fm.release(sector, 1);
                    fm.unlock();
                }
                Err(e)
            }
        }
    }

    fn unlink_entry(&self, entry: &str) -> Result<(), KernelError> {
        let guard = self.lock.lock();

        let (e, ofs) = match self.lookup(entry) {
            Some(v) => v,
            None => {
                guard.unlock();
                return Err(KernelError::NoSuchEntry);
            }
        };

        if e.isdir != 0 {
            let child = DirectoryNode::open(e.inode_sector as usize);
            if child.active_entry_count() != 2 {
                guard.unlock();
                return Err(KernelError::DirectoryNotEmpty);
            }
        }

        let mut cleared = e;
        cleared.in_use = 0;
        let r = self.write_entry(ofs, cleared);
        guard.unlock();
        r?;

        inode::open(e.inode_sector as usize).mark_removed();
        Ok(())
    }

    fn read_dir(&self) -> Result<Vec<(InodeNumber, String)>, KernelError> {
        let count = self.slot_count();
        let mut out = Vec::new();
        for i in 0..count {
            if let Some(e) = self.read_entry(i * DirEntry::SIZE) {
                let name = e.name_str();
                if e.in_use != 0 && name != "." && name != ".." {
                    if let Some(ino) = InodeNumber::new(e.inode_sector) {
                        out.push((ino, name.to_string()));
                    }
                }
            }
        }
        Ok(out)
    }

    fn removed(&self) -> Result<&AtomicBool, KernelError> {
        Ok(&self.removed)
    }
}

/// The mounted filesystem, exposed as a [`traits::FileSystem`] singleton.
pub struct DiskFileSystem;

impl traits::FileSystem for DiskFileSystem {
    fn root(&self) -> Option<Directory> {
        Some(Directory::new(DirectoryNode::open(ROOT_DIR_SECTOR)))
    }
}

/// Formats a fresh filesystem: creates the free map and root directory
/// inodes and installs the `.`/`..` entries of the root.
pub fn format(sector_count: usize) -> Result<(), KernelError> {
    super::free_map::init(sector_count);
    inode::create(super::disk_layout::FREE_MAP_SECTOR, 0, false)?;
    inode::create(ROOT_DIR_SECTOR, 2 * DirEntry::SIZE, true)?;
    let root = DirectoryNode::open(ROOT_DIR_SECTOR);
    root.add(".", ROOT_DIR_SECTOR as u32, true)?;
    root.add("..", ROOT_DIR_SECTOR as u32, true)?;
    Ok(())
}

/// Mounts an already-formatted filesystem and registers it with
/// [`keos::fs::FileSystem`].
pub fn mount(sector_count: usize) {
    super::free_map::init(sector_count);
    FsHandle::register(DiskFileSystem);
}
