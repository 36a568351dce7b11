//! Directories.
//!
//! A directory is an inode whose content is a packed array of
//! [`DirEntry`] records; an entry with inode number 0 is a free slot.
//! [`DirInode`] is the checked view: it exists only for a locked inode
//! whose type is directory, so the scan helpers never run on a file.

use dataview::PodMethods as _;
use orefs_types::{DirEntry, InodeNo};

use crate::{error::Error, stat::InodeType};

use super::{LockedInode, TxInode};

const ENTRY_SIZE: usize = size_of::<DirEntry>();

impl<'tx, 'i, const READ_ONLY: bool> LockedInode<'tx, 'i, READ_ONLY> {
    pub fn is_dir(&self) -> bool {
        self.ty() == InodeType::Dir
    }

    /// The directory view, or `None` for a non-directory.
    pub fn as_dir<'l>(&'l mut self) -> Option<DirInode<'tx, 'i, 'l, READ_ONLY>> {
        if self.is_dir() { Some(DirInode(self)) } else { None }
    }
}

/// A locked inode known to be a directory.
pub struct DirInode<'tx, 'i, 'l, const READ_ONLY: bool>(
    &'l mut LockedInode<'tx, 'i, READ_ONLY>,
);

impl<'tx, const READ_ONLY: bool> DirInode<'tx, '_, '_, READ_ONLY> {
    pub fn ino(&self) -> InodeNo {
        self.0.ino()
    }

    /// Looks up `name`, returning a referenced (unlocked) inode and the
    /// byte offset of the matching entry.
    pub fn lookup(&self, name: &[u8]) -> Option<(TxInode<'tx, READ_ONLY>, usize)> {
        let size = self.0.size() as usize;
        for off in (0..size).step_by(ENTRY_SIZE) {
            let de: DirEntry = self.0.read_as(off).expect("short directory read");
            let Some(inum) = de.inum() else { continue };
            if !de.name_matches(name) {
                continue;
            }
            let ip = TxInode::get(self.0.tx(), inum);
            return Some((ip, off));
        }
        None
    }

    /// Whether only `.` and `..` remain.
    pub fn is_empty(&self) -> bool {
        let size = self.0.size() as usize;
        // the first two entries are "." and ".."
        for off in (2 * ENTRY_SIZE..size).step_by(ENTRY_SIZE) {
            let de: DirEntry = self.0.read_as(off).expect("short directory read");
            if de.inum().is_some() {
                return false;
            }
        }
        true
    }
}

impl DirInode<'_, '_, '_, false> {
    /// Adds the entry `name -> ino`. Fails if `name` is already present.
    pub fn link(&mut self, name: &[u8], ino: InodeNo) -> Result<(), Error> {
        if self.lookup(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        // Reuse the first free slot, or append.
        let size = self.0.size() as usize;
        assert_eq!(size % ENTRY_SIZE, 0, "misaligned directory size");
        let off = (0..size)
            .step_by(ENTRY_SIZE)
            .find(|&off| {
                let de: DirEntry = self.0.read_as(off).expect("short directory read");
                de.inum().is_none()
            })
            .unwrap_or(size);

        let mut de = DirEntry::zeroed();
        de.set_name(name);
        de.set_inum(Some(ino));
        self.0.write_as(off, &de)
    }

    /// Clears the entry at `off` (freed by `unlink`).
    pub(crate) fn clear_entry(&mut self, off: usize) {
        let de = DirEntry::zeroed();
        self.0
            .write_as(off, &de)
            .expect("directory write failed");
    }
}
