//! Inodes.
//!
//! An inode describes a single unnamed file: its type, size, link count,
//! and the addresses of the blocks holding its content. On disk the
//! inodes sit packed in the inode region; in memory a fixed table of
//! [`NINODE`] slots caches the ones in use and gives concurrent callers a
//! place to synchronize.
//!
//! A slot has two independently protected halves:
//!
//! * **Identity**: which inode number the slot holds and how many
//!   in-memory references exist. Guarded by the table's spin lock;
//!   touched briefly and never across disk I/O.
//! * **Content**: the copy of the disk record. Guarded by the slot's
//!   sleep lock, because loading or writing it performs disk I/O.
//!   `None` means the slot has not been read from disk yet.
//!
//! The lifecycle of a slot:
//!
//! * [`TxInode::get`] finds or claims a slot and takes a reference; no
//!   disk I/O happens. Cloning a handle is another reference.
//! * [`TxInode::lock`] acquires the content lock, reading the record from
//!   disk on first use. It is separate from `get` so a caller can hold a
//!   long-term reference (an open file, a working directory) without
//!   serializing every user of the inode.
//! * Dropping the last handle releases the slot; if the inode also has no
//!   links left on disk, the drop truncates the content and frees the
//!   disk record. That final drop therefore must happen under a writable
//!   transaction, which is why handles borrow their [`Tx`].
//!
//! On disk, an inode exists iff its type field is non-zero;
//! [`TxInode::alloc`] claims a free record and the orphan path of drop
//! clears it.

use orefs_types::{BlockNo, DiskInode, InodeBlock, InodeNo, MAX_SYMLINK, NUM_DIRECT};

use crate::{
    FileSystem,
    params::NINODE,
    stat::InodeType,
    sync::{SleepLock, SleepLockGuard, SpinLock},
    wal::Tx,
};

mod content;
mod directory;

pub use self::directory::DirInode;

/// In-memory copy of one on-disk inode record.
pub(crate) struct InodeData {
    pub(crate) ty: InodeType,
    pub(crate) major: i16,
    pub(crate) minor: i16,
    pub(crate) nlink: i16,
    pub(crate) size: u32,
    pub(crate) addrs: [Option<BlockNo>; NUM_DIRECT + 2],
    pub(crate) target: [u8; MAX_SYMLINK],
}

impl InodeData {
    /// Decodes a disk record. `None` if the record is free.
    fn from_disk(d: &DiskInode) -> Option<Self> {
        let ty = InodeType::from_disk(d.ty)?;
        let mut addrs = [None; NUM_DIRECT + 2];
        for (slot, addr) in addrs.iter_mut().enumerate() {
            *addr = d.addr(slot);
        }
        Some(Self {
            ty,
            major: d.major,
            minor: d.minor,
            nlink: d.nlink,
            size: d.size,
            addrs,
            target: d.target,
        })
    }

    fn write_disk(&self, d: &mut DiskInode) {
        d.ty = self.ty.to_disk();
        d.major = self.major;
        d.minor = self.minor;
        d.nlink = self.nlink;
        d.size = self.size;
        for (slot, addr) in self.addrs.iter().enumerate() {
            d.set_addr(slot, *addr);
        }
        d.target = self.target;
    }
}

#[derive(Clone, Copy)]
struct SlotMeta {
    ino: Option<InodeNo>,
    refs: u32,
}

pub(crate) struct InodeTable {
    meta: SpinLock<[SlotMeta; NINODE]>,
    data: [SleepLock<Option<InodeData>>; NINODE],
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        Self {
            meta: SpinLock::new([SlotMeta { ino: None, refs: 0 }; NINODE]),
            data: [const { SleepLock::new(None) }; NINODE],
        }
    }

    /// Finds or installs a slot for `ino` and takes a reference.
    ///
    /// # Panics
    ///
    /// Panics if every slot is referenced.
    fn acquire(&self, ino: InodeNo) -> usize {
        let mut meta = self.meta.lock();

        let mut empty = None;
        for (i, m) in meta.iter_mut().enumerate() {
            if m.refs > 0 && m.ino == Some(ino) {
                m.refs += 1;
                return i;
            }
            if empty.is_none() && m.refs == 0 {
                empty = Some(i);
            }
        }

        let Some(i) = empty else {
            panic!("inode table exhausted");
        };
        meta[i].ino = Some(ino);
        meta[i].refs = 1;
        // The slot may hold the previous tenant's contents; refs == 0
        // means nobody can hold the content lock.
        *self.data[i]
            .try_lock()
            .expect("unreferenced inode slot locked") = None;
        i
    }

    fn dup(&self, slot: usize) {
        let mut meta = self.meta.lock();
        assert!(meta[slot].refs > 0);
        meta[slot].refs += 1;
    }

    /// Drops a reference without the orphan-free path (see [`Inode`]).
    fn release(&self, slot: usize) {
        let mut meta = self.meta.lock();
        assert!(meta[slot].refs > 0);
        meta[slot].refs -= 1;
    }
}

/// A referenced inode, tied to a transaction.
///
/// Clone to take another reference. Dropping the last reference of an
/// inode with no links truncates and frees it on disk, inside the
/// borrowed transaction.
pub struct TxInode<'tx, const READ_ONLY: bool> {
    tx: &'tx Tx<'tx, READ_ONLY>,
    ino: InodeNo,
    slot: usize,
}

impl<'tx, const READ_ONLY: bool> TxInode<'tx, READ_ONLY> {
    /// Takes a reference to inode `ino`, installing it in the table if
    /// needed. No disk I/O.
    pub fn get(tx: &'tx Tx<'tx, READ_ONLY>, ino: InodeNo) -> Self {
        let slot = tx.fs().itable.acquire(ino);
        Self { tx, ino, slot }
    }

    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    pub(crate) fn tx(&self) -> &'tx Tx<'tx, READ_ONLY> {
        self.tx
    }

    /// Locks the inode's content, reading it from disk on first use.
    ///
    /// # Panics
    ///
    /// Panics if the on-disk record is free: a reachable inode must be
    /// allocated, anything else is corruption.
    pub fn lock<'i>(&'i mut self) -> LockedInode<'tx, 'i, READ_ONLY> {
        let fs = self.tx.fs();
        let mut guard = fs.itable.data[self.slot].lock();
        if guard.is_none() {
            let sb = fs.superblock();
            let mut handle = self.tx.get_block(sb.inode_block(self.ino));
            let bguard = handle.lock();
            let dip = bguard.data::<InodeBlock>().inode(self.ino);
            let data = InodeData::from_disk(dip).expect("reading a freed inode");
            *guard = Some(data);
        }
        LockedInode {
            tx: self.tx,
            ino: self.ino,
            slot: self.slot,
            guard,
        }
    }
}

impl<'tx> TxInode<'tx, false> {
    /// Allocates a free on-disk inode of type `ty` and returns a
    /// referenced (unlocked) handle to it.
    ///
    /// # Panics
    ///
    /// Panics if the inode region is full.
    pub fn alloc(tx: &'tx Tx<'tx, false>, ty: InodeType) -> Self {
        let sb = tx.fs().superblock();
        for inum in 1..sb.ninodes {
            let ino = InodeNo::new(inum);
            let mut handle = tx.get_block(sb.inode_block(ino));
            let mut guard = handle.lock();
            let dip = guard.data_mut::<InodeBlock>().inode_mut(ino);
            if dip.is_free() {
                dip.allocate(ty.to_disk());
                tx.record(&guard);
                drop(guard);
                drop(handle);
                return Self::get(tx, ino);
            }
        }
        panic!("out of inodes");
    }
}

impl<const READ_ONLY: bool> Clone for TxInode<'_, READ_ONLY> {
    fn clone(&self) -> Self {
        self.tx.fs().itable.dup(self.slot);
        Self {
            tx: self.tx,
            ino: self.ino,
            slot: self.slot,
        }
    }
}

impl<const READ_ONLY: bool> Drop for TxInode<'_, READ_ONLY> {
    fn drop(&mut self) {
        let fs = self.tx.fs();
        let mut meta = fs.itable.meta.lock();

        if meta[self.slot].refs == 1 {
            // Sole reference: the content lock cannot be held by anyone.
            let mut guard = fs.itable.data[self.slot]
                .try_lock()
                .expect("sole-referenced inode locked");
            if matches!(&*guard, Some(data) if data.nlink == 0) {
                // No directory entry points at this inode and no other
                // handle exists, so no one can reach it while the table
                // lock is released: a lookup would need an entry, and an
                // entry would mean nlink > 0.
                drop(meta);
                if let Some(wtx) = self.tx.to_writable() {
                    let mut lip = LockedInode {
                        tx: &*wtx,
                        ino: self.ino,
                        slot: self.slot,
                        guard,
                    };
                    lip.truncate();
                    lip.free_on_disk();
                } else {
                    drop(guard);
                }
                meta = fs.itable.meta.lock();
            } else {
                drop(guard);
            }
        }

        meta[self.slot].refs -= 1;
    }
}

/// A locked inode: the holder may examine and modify the content and the
/// on-disk fields. Dropping the guard unlocks.
pub struct LockedInode<'tx, 'i, const READ_ONLY: bool> {
    tx: &'tx Tx<'tx, READ_ONLY>,
    ino: InodeNo,
    slot: usize,
    guard: SleepLockGuard<'i, Option<InodeData>>,
}

impl<'tx, const READ_ONLY: bool> LockedInode<'tx, '_, READ_ONLY> {
    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    pub fn ty(&self) -> InodeType {
        self.data().ty
    }

    pub fn nlink(&self) -> i16 {
        self.data().nlink
    }

    pub fn size(&self) -> u32 {
        self.data().size
    }

    pub(crate) fn tx(&self) -> &'tx Tx<'tx, READ_ONLY> {
        self.tx
    }

    pub(crate) fn data(&self) -> &InodeData {
        self.guard.as_ref().unwrap()
    }

    pub(crate) fn data_mut(&mut self) -> &mut InodeData {
        self.guard.as_mut().unwrap()
    }
}

/// A long-term inode reference, independent of any transaction: the
/// form an open-file table or a current working directory holds.
///
/// Dropping an `Inode` only releases the table reference; it never frees
/// an orphaned inode, because freeing needs a transaction. Callers that
/// may drop the last reference to an unlinked inode must go through
/// [`Inode::put`] (or re-tether with [`Inode::into_tx`]) so the free runs
/// inside one.
pub struct Inode<'fs> {
    fs: &'fs FileSystem,
    ino: InodeNo,
    slot: usize,
}

impl<'fs> Inode<'fs> {
    /// A handle to the root directory.
    pub(crate) fn root(fs: &'fs FileSystem) -> Self {
        let slot = fs.itable.acquire(InodeNo::ROOT);
        Self {
            fs,
            ino: InodeNo::ROOT,
            slot,
        }
    }

    /// Takes a transaction-independent reference to the same inode.
    pub fn adopt<const READ_ONLY: bool>(
        fs: &'fs FileSystem,
        ip: &TxInode<'_, READ_ONLY>,
    ) -> Self {
        debug_assert!(std::ptr::eq(fs, ip.tx.fs()));
        fs.itable.dup(ip.slot);
        Self {
            fs,
            ino: ip.ino,
            slot: ip.slot,
        }
    }

    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    /// Re-tethers the reference to a transaction (another `iget` of the
    /// same inode).
    pub fn into_tx<'tx, const READ_ONLY: bool>(
        &self,
        tx: &'tx Tx<'tx, READ_ONLY>,
    ) -> TxInode<'tx, READ_ONLY> {
        debug_assert!(std::ptr::eq(self.fs, tx.fs()));
        self.fs.itable.dup(self.slot);
        TxInode {
            tx,
            ino: self.ino,
            slot: self.slot,
        }
    }

    /// Releases the reference inside `tx`, freeing the inode on disk if
    /// this was the last reference and no links remain.
    pub fn put(self, tx: &Tx<'_, false>) {
        let ip = TxInode {
            tx,
            ino: self.ino,
            slot: self.slot,
        };
        std::mem::forget(self); // the reference now belongs to `ip`
        drop(ip);
    }
}

impl Clone for Inode<'_> {
    fn clone(&self) -> Self {
        self.fs.itable.dup(self.slot);
        Self {
            fs: self.fs,
            ino: self.ino,
            slot: self.slot,
        }
    }
}

impl Drop for Inode<'_> {
    fn drop(&mut self) {
        self.fs.itable.release(self.slot);
    }
}
