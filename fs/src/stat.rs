//! Inode metadata as reported to callers.

use orefs_types::{InodeNo, T_DEVICE, T_DIR, T_FILE, T_SYMLINK};

/// The type of an allocated inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    Dir,
    File,
    Device,
    Symlink,
}

impl InodeType {
    /// Decodes the on-disk type field. `None` for a free record.
    pub(crate) fn from_disk(ty: i16) -> Option<Self> {
        match ty {
            T_DIR => Some(Self::Dir),
            T_FILE => Some(Self::File),
            T_DEVICE => Some(Self::Device),
            T_SYMLINK => Some(Self::Symlink),
            _ => None,
        }
    }

    pub(crate) fn to_disk(self) -> i16 {
        match self {
            Self::Dir => T_DIR,
            Self::File => T_FILE,
            Self::Device => T_DEVICE,
            Self::Symlink => T_SYMLINK,
        }
    }
}

/// Snapshot of an inode's metadata.
#[derive(Debug, Clone)]
pub struct Stat {
    /// Device id.
    pub dev: u32,
    /// Inode number.
    pub ino: InodeNo,
    /// Inode type.
    pub ty: InodeType,
    /// Number of directory entries referring to the inode.
    pub nlink: i16,
    /// Content size in bytes.
    pub size: u64,
}
