//! orefs: a crash-consistent, xv6-style on-disk file system.
//!
//! Five layers, bottom up:
//!
//! * **Blocks**: an allocator for raw disk blocks ([`balloc`], bitmap
//!   backed) above a caching layer ([`buffer`]).
//! * **Log**: a write-ahead log ([`wal`]) that turns multi-block updates
//!   into crash-atomic transactions.
//! * **Inodes**: allocation, a reference-counted in-memory table, content
//!   read/write through a three-level block map ([`inode`]).
//! * **Directories**: inodes whose content is a table of names.
//! * **Names**: path resolution ([`path`]) and the syscall-sized
//!   operations ([`ops`]).
//!
//! The file system mounts on anything implementing
//! [`device::BlockDevice`]; [`mkfs`] builds a fresh image. On-disk
//! records live in the `orefs_types` crate and are shared with the
//! host-side `mkfs` tool.

mod balloc;
mod buffer;
pub mod device;
mod error;
mod fs;
mod inode;
pub mod mkfs;
pub mod ops;
pub mod params;
pub mod path;
pub mod stat;
mod sync;
mod wal;

pub use self::{
    error::Error,
    fs::FileSystem,
    inode::{DirInode, Inode, LockedInode, TxInode},
    ops::OpenFlags,
    wal::Tx,
};

pub use orefs_types as types;
