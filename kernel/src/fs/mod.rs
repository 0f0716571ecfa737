//! Inode- and directory-based filesystem layered over [`cache::BUFFER_CACHE`].
//!
//! Module order mirrors the dependency chain: [`disk_layout`] defines the
//! on-disk shapes, [`free_map`] allocates sectors, [`cache`] is the only
//! thing that talks to the block device, [`inode`] maps bytes to sectors
//! through the cache, and [`directory`] interprets an inode's bytes as a
//! directory entry table and exposes the whole thing to `keos::fs`.

pub mod cache;
pub mod directory;
pub mod disk_layout;
pub mod free_map;
pub mod inode;

pub use directory::{format, mount};
