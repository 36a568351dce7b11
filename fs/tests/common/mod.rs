//! Test support: fresh file systems and a raw-image walker that checks
//! the structural invariants from outside, the way fsck would.

use std::collections::HashMap;

use dataview::PodMethods as _;
use orefs::{
    FileSystem,
    device::{BlockDevice, MemDevice},
    mkfs::{self, Geometry},
    types::{
        BITS_PER_BLOCK, BLOCK_SIZE, BitmapBlock, DOUBLE_SLOT, DirEntry, DiskInode, IndirectBlock,
        InodeBlock, InodeNo, NUM_DIRECT, SINGLE_SLOT, SuperBlock, T_DIR, T_NONE,
    },
};

pub const IMAGE_BLOCKS: usize = 2000;

pub fn fresh_fs() -> (FileSystem, MemDevice) {
    let dev = MemDevice::new(IMAGE_BLOCKS);
    mkfs::format(&dev, &Geometry::default()).unwrap();
    let fs = FileSystem::mount(Box::new(dev.clone())).unwrap();
    (fs, dev)
}

/// A read-only view of the raw on-disk state.
pub struct Image {
    dev: MemDevice,
    pub sb: SuperBlock,
}

impl Image {
    pub fn load(dev: &MemDevice) -> Self {
        let block = read_block(dev, 1);
        let sb: SuperBlock = from_block(&block);
        assert_eq!(sb.magic, SuperBlock::MAGIC);
        Self {
            dev: dev.clone(),
            sb,
        }
    }

    /// First block of the data region.
    pub fn data_start(&self) -> usize {
        (self.sb.bmapstart + self.sb.size / BITS_PER_BLOCK as u32 + 1) as usize
    }

    pub fn inode(&self, ino: u32) -> DiskInode {
        let bn = self.sb.inode_block(InodeNo::new(ino));
        let block = read_block(&self.dev, bn.as_index());
        let table: InodeBlock = from_block(&block);
        table.inode(InodeNo::new(ino)).clone()
    }

    pub fn allocated_inodes(&self) -> Vec<(u32, DiskInode)> {
        (1..self.sb.ninodes)
            .map(|ino| (ino, self.inode(ino)))
            .filter(|(_, di)| di.ty != T_NONE)
            .collect()
    }

    pub fn bitmap_bit(&self, bn: usize) -> bool {
        let block = read_block(&self.dev, self.sb.bitmap_block(bn).as_index());
        let bitmap: BitmapBlock = from_block(&block);
        bitmap.bit(bn % BITS_PER_BLOCK)
    }

    /// Number of allocated blocks in the data region.
    pub fn allocated_data_blocks(&self) -> usize {
        (self.data_start()..self.sb.size as usize)
            .filter(|&bn| self.bitmap_bit(bn))
            .count()
    }

    fn indirect_entries(&self, bn: u32) -> Vec<u32> {
        let block = read_block(&self.dev, bn as usize);
        let ind: IndirectBlock = from_block(&block);
        (0..orefs::types::NUM_INDIRECT)
            .filter_map(|i| ind.entry(i))
            .map(|b| b.value())
            .collect()
    }

    /// Every block reachable from `di`: content blocks and the indirect
    /// blocks that point at them.
    pub fn reachable_blocks(&self, di: &DiskInode) -> Vec<u32> {
        let mut blocks = Vec::new();
        for slot in 0..NUM_DIRECT {
            if let Some(bn) = di.addr(slot) {
                blocks.push(bn.value());
            }
        }
        if let Some(ind) = di.addr(SINGLE_SLOT) {
            blocks.push(ind.value());
            blocks.extend(self.indirect_entries(ind.value()));
        }
        if let Some(top) = di.addr(DOUBLE_SLOT) {
            blocks.push(top.value());
            for mid in self.indirect_entries(top.value()) {
                blocks.push(mid);
                blocks.extend(self.indirect_entries(mid));
            }
        }
        blocks
    }

    /// The whole content of an inode, by walking its block map.
    pub fn read_content(&self, di: &DiskInode) -> Vec<u8> {
        let mut content = Vec::with_capacity(di.size as usize);
        let nblocks = (di.size as usize).div_ceil(BLOCK_SIZE);
        for i in 0..nblocks {
            let bn = self.content_block(di, i).expect("unmapped block inside content");
            content.extend_from_slice(&read_block(&self.dev, bn as usize));
        }
        content.truncate(di.size as usize);
        content
    }

    fn content_block(&self, di: &DiskInode, i: usize) -> Option<u32> {
        use orefs::types::NUM_INDIRECT;
        if i < NUM_DIRECT {
            return di.addr(i).map(|b| b.value());
        }
        let i = i - NUM_DIRECT;
        if i < NUM_INDIRECT {
            let ind = di.addr(SINGLE_SLOT)?;
            return self.indirect_entries(ind.value()).get(i).copied();
        }
        let i = i - NUM_INDIRECT;
        let top = di.addr(DOUBLE_SLOT)?;
        let mids = self.indirect_entries(top.value());
        let mid = *mids.get(i / NUM_INDIRECT)?;
        self.indirect_entries(mid).get(i % NUM_INDIRECT).copied()
    }

    pub fn dir_entries(&self, di: &DiskInode) -> Vec<(u32, Vec<u8>)> {
        assert_eq!(di.ty, T_DIR);
        let content = self.read_content(di);
        content
            .chunks_exact(size_of::<DirEntry>())
            .map(|chunk| {
                let mut de = DirEntry::zeroed();
                de.as_bytes_mut().copy_from_slice(chunk);
                (de.inum().map_or(0, |i| i.value()), de.name().to_vec())
            })
            .filter(|(inum, _)| *inum != 0)
            .collect()
    }

    pub fn lookup(&self, dir_ino: u32, name: &[u8]) -> Option<u32> {
        let di = self.inode(dir_ino);
        self.dir_entries(&di)
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(ino, _)| ino)
    }

    /// Checks the quantified structural invariants:
    ///
    /// * a data-region block is allocated in the bitmap iff exactly one
    ///   allocated inode reaches it;
    /// * `nlink` matches the directory entries referring to each inode,
    ///   with a directory's own `.` excluded (it is deliberately
    ///   uncounted);
    /// * every directory has `.` and `..`, `.` referring to itself.
    pub fn check_invariants(&self) {
        let inodes = self.allocated_inodes();

        // Block reachability vs the bitmap.
        let mut owners: HashMap<u32, u32> = HashMap::new();
        for (ino, di) in &inodes {
            for bn in self.reachable_blocks(di) {
                let prev = owners.insert(bn, *ino);
                assert!(
                    prev.is_none(),
                    "block {bn} referenced by inodes {} and {ino}",
                    prev.unwrap()
                );
            }
        }
        for bn in self.data_start()..self.sb.size as usize {
            let reachable = owners.contains_key(&(bn as u32));
            assert_eq!(
                self.bitmap_bit(bn),
                reachable,
                "bitmap and reachability disagree on block {bn}"
            );
        }

        // Link counts.
        let mut links: HashMap<u32, i16> = HashMap::new();
        for (ino, di) in &inodes {
            if di.ty != T_DIR {
                continue;
            }
            for (target, name) in self.dir_entries(di) {
                if name == b"." {
                    assert_eq!(target, *ino, "`.` of {ino} points to {target}");
                    continue; // `.` does not count toward nlink
                }
                *links.entry(target).or_insert(0) += 1;
            }
        }
        for (ino, di) in &inodes {
            assert_eq!(
                di.nlink,
                links.get(ino).copied().unwrap_or(0),
                "bad nlink for inode {ino}"
            );
        }

        // Directory shape.
        for (ino, di) in &inodes {
            if di.ty != T_DIR {
                continue;
            }
            let entries = self.dir_entries(di);
            let dots: Vec<_> = entries.iter().filter(|(_, n)| n == b".").collect();
            let dotdots: Vec<_> = entries.iter().filter(|(_, n)| n == b"..").collect();
            assert_eq!(dots.len(), 1, "directory {ino} lacks `.`");
            assert_eq!(dotdots.len(), 1, "directory {ino} lacks `..`");
        }
    }
}

fn read_block(dev: &MemDevice, index: usize) -> [u8; BLOCK_SIZE] {
    let mut block = [0; BLOCK_SIZE];
    dev.read_block(index, &mut block);
    block
}

fn from_block<T: dataview::Pod>(block: &[u8; BLOCK_SIZE]) -> T {
    let mut value = T::zeroed();
    value
        .as_bytes_mut()
        .copy_from_slice(&block[..size_of::<T>()]);
    value
}
