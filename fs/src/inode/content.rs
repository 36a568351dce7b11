//! Inode content.
//!
//! The blocks backing an inode are addressed through three levels:
//! [`NUM_DIRECT`] direct entries in the inode record, one singly-indirect
//! block, and one doubly-indirect block. Entries are allocated lazily as
//! the content grows; the writer checks [`MAX_FILE`] before mapping, so
//! an out-of-range index here is a corrupted size or a caller bug and
//! panics.

use dataview::{Pod, PodMethods as _};
use orefs_types::{
    BLOCK_SIZE, BlockNo, DOUBLE_SLOT, IndirectBlock, InodeBlock, MAX_FILE, NUM_DIRECT,
    NUM_INDIRECT, SINGLE_SLOT,
};

use crate::{balloc, error::Error, params::ROOT_DEV, stat::Stat};

use super::LockedInode;

impl<const READ_ONLY: bool> LockedInode<'_, '_, READ_ONLY> {
    /// Returns the disk block backing content block `i`, or `None` where
    /// nothing has been mapped yet.
    pub(crate) fn lookup_block(&self, i: usize) -> Option<BlockNo> {
        if i < NUM_DIRECT {
            return self.data().addrs[i];
        }

        let i = i - NUM_DIRECT;
        if i < NUM_INDIRECT {
            let ind = self.data().addrs[SINGLE_SLOT]?;
            return self.indirect_entry(ind, i);
        }

        let i = i - NUM_INDIRECT;
        if i < NUM_INDIRECT * NUM_INDIRECT {
            let top = self.data().addrs[DOUBLE_SLOT]?;
            let mid = self.indirect_entry(top, i / NUM_INDIRECT)?;
            return self.indirect_entry(mid, i % NUM_INDIRECT);
        }

        panic!("content block index out of range: {i}");
    }

    fn indirect_entry(&self, ind: BlockNo, i: usize) -> Option<BlockNo> {
        let mut handle = self.tx.get_block(ind);
        let guard = handle.lock();
        guard.data::<IndirectBlock>().entry(i)
    }

    /// Reads content bytes at `off` into `buf`, clamped to the content
    /// size. Returns the number of bytes read.
    pub fn read(&self, off: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let size = self.size() as usize;
        if off > size || off.checked_add(buf.len()).is_none() {
            return Err(Error::InvalidOffset);
        }
        let n = usize::min(buf.len(), size - off);

        let mut done = 0;
        while done < n {
            let pos = off + done;
            let bn = self
                .lookup_block(pos / BLOCK_SIZE)
                .expect("unmapped block inside content");
            let mut handle = self.tx.get_block(bn);
            let guard = handle.lock();
            let m = usize::min(n - done, BLOCK_SIZE - pos % BLOCK_SIZE);
            buf[done..done + m].copy_from_slice(&guard.bytes()[pos % BLOCK_SIZE..][..m]);
            done += m;
        }
        Ok(n)
    }

    /// Reads one POD record at `off`.
    pub(crate) fn read_as<T: Pod>(&self, off: usize) -> Result<T, Error> {
        let mut value = T::zeroed();
        let n = self.read(off, value.as_bytes_mut())?;
        if n != size_of::<T>() {
            return Err(Error::InvalidOffset);
        }
        Ok(value)
    }

    /// Copies out the stat fields.
    pub fn stat(&self) -> Stat {
        let data = self.data();
        Stat {
            dev: ROOT_DEV,
            ino: self.ino,
            ty: data.ty,
            nlink: data.nlink,
            size: u64::from(data.size),
        }
    }

    /// The stored symlink target.
    pub fn link_target(&self) -> &[u8] {
        let target = &self.data().target;
        let len = target.iter().position(|&b| b == 0).unwrap_or(target.len());
        &target[..len]
    }
}

impl LockedInode<'_, '_, false> {
    /// Copies the in-memory inode back to its disk record.
    ///
    /// Must be called after every change to a field that lives on disk;
    /// the block map takes care of itself only inside [`Self::write`].
    pub(crate) fn update(&mut self) {
        let sb = self.tx.fs().superblock();
        let mut handle = self.tx.get_block(sb.inode_block(self.ino));
        let mut guard = handle.lock();
        let dip = guard.data_mut::<InodeBlock>().inode_mut(self.ino);
        self.data().write_disk(dip);
        self.tx.record(&guard);
    }

    /// Returns the disk block backing content block `i`, allocating it
    /// and any needed indirect blocks.
    ///
    /// The in-memory inode may be left dirty; the caller owes an
    /// [`Self::update`].
    pub(crate) fn map_block(&mut self, i: usize) -> BlockNo {
        if i < NUM_DIRECT {
            if let Some(bn) = self.data().addrs[i] {
                return bn;
            }
            let bn = balloc::alloc(self.tx);
            self.data_mut().addrs[i] = Some(bn);
            return bn;
        }

        let i = i - NUM_DIRECT;
        if i < NUM_INDIRECT {
            let ind = self.ensure_addr_slot(SINGLE_SLOT);
            return self.ensure_indirect_entry(ind, i);
        }

        let i = i - NUM_INDIRECT;
        if i < NUM_INDIRECT * NUM_INDIRECT {
            let top = self.ensure_addr_slot(DOUBLE_SLOT);
            let mid = self.ensure_indirect_entry(top, i / NUM_INDIRECT);
            return self.ensure_indirect_entry(mid, i % NUM_INDIRECT);
        }

        panic!("content block index out of range: {i}");
    }

    fn ensure_addr_slot(&mut self, slot: usize) -> BlockNo {
        if let Some(bn) = self.data().addrs[slot] {
            return bn;
        }
        let bn = balloc::alloc(self.tx);
        self.data_mut().addrs[slot] = Some(bn);
        bn
    }

    /// Entry `i` of indirect block `ind`, allocated on demand. A fresh
    /// block from the allocator is zeroed, so its entries all read as
    /// unmapped.
    fn ensure_indirect_entry(&self, ind: BlockNo, i: usize) -> BlockNo {
        if let Some(bn) = self.indirect_entry(ind, i) {
            return bn;
        }
        let bn = balloc::alloc(self.tx);
        let mut handle = self.tx.get_block(ind);
        let mut guard = handle.lock();
        guard.data_mut::<IndirectBlock>().set_entry(i, Some(bn));
        self.tx.record(&guard);
        bn
    }

    /// Writes `data` at `off`, growing the content (and the block map) as
    /// needed. Writing starts at or before the current end: `off` beyond
    /// the size is rejected, as is any write past [`MAX_FILE`] blocks.
    pub fn write(&mut self, off: usize, data: &[u8]) -> Result<usize, Error> {
        let size = self.size() as usize;
        let n = data.len();
        if off > size || off.checked_add(n).is_none() {
            return Err(Error::InvalidOffset);
        }
        if off + n > MAX_FILE * BLOCK_SIZE {
            return Err(Error::FileTooLarge);
        }

        let mut done = 0;
        while done < n {
            let pos = off + done;
            let bn = self.map_block(pos / BLOCK_SIZE);
            let mut handle = self.tx.get_block(bn);
            let mut guard = handle.lock();
            let m = usize::min(n - done, BLOCK_SIZE - pos % BLOCK_SIZE);
            guard.bytes_mut()[pos % BLOCK_SIZE..][..m].copy_from_slice(&data[done..done + m]);
            self.tx.record(&guard);
            done += m;
        }

        if off + done > size {
            self.data_mut().size = u32::try_from(off + done).unwrap();
        }
        // Write the inode back even if the size is unchanged: the loop may
        // have grown the block map.
        self.update();

        Ok(done)
    }

    /// Writes one POD record at `off`.
    pub(crate) fn write_as<T: Pod>(&mut self, off: usize, value: &T) -> Result<(), Error> {
        let written = self.write(off, value.as_bytes())?;
        if written != size_of::<T>() {
            return Err(Error::InvalidOffset);
        }
        Ok(())
    }

    /// Stores a symlink target in the inode record, truncated to fit.
    pub(crate) fn set_link_target(&mut self, target: &[u8]) {
        let dst = &mut self.data_mut().target;
        let len = usize::min(target.len(), dst.len());
        dst[..len].copy_from_slice(&target[..len]);
        dst[len..].fill(0);
    }

    /// Frees every content block and zeroes the size: direct entries
    /// first, then the singly-indirect tree, then the doubly-indirect
    /// tree, leaves before the blocks that pointed at them.
    pub fn truncate(&mut self) {
        for slot in 0..NUM_DIRECT {
            if let Some(bn) = self.data_mut().addrs[slot].take() {
                balloc::free(self.tx, bn);
            }
        }

        if let Some(ind) = self.data_mut().addrs[SINGLE_SLOT].take() {
            self.free_indirect(ind);
        }

        if let Some(top) = self.data_mut().addrs[DOUBLE_SLOT].take() {
            let mids = self.take_indirect_entries(top);
            for mid in mids {
                self.free_indirect(mid);
            }
            balloc::free(self.tx, top);
        }

        self.data_mut().size = 0;
        self.update();
    }

    /// Frees the blocks of one indirect block, then the block itself.
    fn free_indirect(&self, ind: BlockNo) {
        let entries = self.take_indirect_entries(ind);
        for bn in entries {
            balloc::free(self.tx, bn);
        }
        balloc::free(self.tx, ind);
    }

    fn take_indirect_entries(&self, ind: BlockNo) -> Vec<BlockNo> {
        let mut handle = self.tx.get_block(ind);
        let mut guard = handle.lock();
        guard.data_mut::<IndirectBlock>().take_entries().collect()
    }

    /// Releases the on-disk record (type becomes free) and invalidates
    /// the cached copy. The caller has already truncated.
    pub(crate) fn free_on_disk(mut self) {
        let sb = self.tx.fs().superblock();
        {
            let mut handle = self.tx.get_block(sb.inode_block(self.ino));
            let mut guard = handle.lock();
            let dip = guard.data_mut::<InodeBlock>().inode_mut(self.ino);
            dip.ty = orefs_types::T_NONE;
            self.tx.record(&guard);
        }
        *self.guard = None;
    }
}
