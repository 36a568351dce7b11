//! Fresh-image construction.
//!
//! `mkfs` writes straight to the device, with no cache and no log: the
//! image is not live until it is mounted. The layout it produces:
//! boot block, superblock, log region, inode region, bitmap, data.
//! The root directory (inode 1) is created with its `.` and `..`
//! entries; [`ImageBuilder::add_file`] packs additional files into the
//! root for bootstrap images.

use dataview::{Pod, PodMethods as _};
use orefs_types::{
    BITS_PER_BLOCK, BLOCK_SIZE, BitmapBlock, BlockNo, DirEntry, DiskInode, INODES_PER_BLOCK,
    IndirectBlock, InodeBlock, InodeNo, NAME_LEN, NUM_DIRECT, NUM_INDIRECT, SINGLE_SLOT,
    SuperBlock, T_DIR, T_FILE,
};

use crate::{device::BlockDevice, error::Error, params::LOG_SIZE};

/// Image dimensions.
#[derive(Debug, Clone)]
pub struct Geometry {
    /// Total image size in blocks.
    pub size: u32,
    /// Number of inode records.
    pub ninodes: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            size: 2000,
            ninodes: 200,
        }
    }
}

impl Geometry {
    fn superblock(&self) -> SuperBlock {
        let nlog = u32::try_from(LOG_SIZE + 1).unwrap();
        let ninode_blocks =
            self.ninodes / u32::try_from(INODES_PER_BLOCK).unwrap() + 1;
        let nbitmap = self.size / u32::try_from(BITS_PER_BLOCK).unwrap() + 1;
        let nmeta = 2 + nlog + ninode_blocks + nbitmap;
        assert!(nmeta < self.size, "no room for data blocks");

        SuperBlock {
            magic: SuperBlock::MAGIC,
            size: self.size,
            nblocks: self.size - nmeta,
            ninodes: self.ninodes,
            nlog,
            logstart: 2,
            inodestart: 2 + nlog,
            bmapstart: 2 + nlog + ninode_blocks,
        }
    }
}

/// Writes a fresh, empty file system onto `device`.
pub fn format(device: &dyn BlockDevice, geometry: &Geometry) -> Result<(), Error> {
    ImageBuilder::format(device, geometry)?.finish();
    Ok(())
}

/// An image under construction. Inodes and blocks are handed out
/// sequentially; [`ImageBuilder::finish`] writes the allocation bitmap
/// that accounts for everything handed out.
pub struct ImageBuilder<'d> {
    device: &'d dyn BlockDevice,
    sb: SuperBlock,
    root: InodeNo,
    next_ino: u32,
    next_block: u32,
}

impl<'d> ImageBuilder<'d> {
    /// Zeroes the device, writes the superblock, and creates the root
    /// directory.
    pub fn format(device: &'d dyn BlockDevice, geometry: &Geometry) -> Result<Self, Error> {
        let sb = geometry.superblock();
        if device.size() < geometry.size as usize {
            return Err(Error::BadImage("device smaller than geometry"));
        }

        let zero = [0; BLOCK_SIZE];
        for bn in 0..geometry.size {
            device.write_block(bn as usize, &zero);
        }

        let mut block = [0; BLOCK_SIZE];
        block[..size_of::<SuperBlock>()].copy_from_slice(sb.as_bytes());
        device.write_block(BlockNo::SUPER.as_index(), &block);

        let first_data = sb.bmapstart + geometry.size / u32::try_from(BITS_PER_BLOCK).unwrap() + 1;
        let mut builder = Self {
            device,
            sb,
            root: InodeNo::ROOT,
            next_ino: 1,
            next_block: first_data,
        };

        let root = builder.alloc_inode(T_DIR);
        assert_eq!(root, InodeNo::ROOT);
        builder.add_dirent(root, root, b".");
        builder.add_dirent(root, root, b"..");
        Ok(builder)
    }

    /// Packs `content` into a new file named `name` in the root
    /// directory.
    pub fn add_file(&mut self, name: &[u8], content: &[u8]) -> Result<InodeNo, Error> {
        assert!(name.len() < NAME_LEN);
        let ino = self.alloc_inode(T_FILE);
        self.append(ino, content)?;
        self.add_dirent(self.root, ino, name);
        Ok(ino)
    }

    /// Writes the allocation bitmap covering every block handed out so
    /// far. Call last.
    pub fn finish(self) {
        log::info!(
            "mkfs: {} meta blocks, {} data blocks, first free block {}",
            self.sb.bmapstart + self.sb.size / u32::try_from(BITS_PER_BLOCK).unwrap() + 1,
            self.sb.nblocks,
            self.next_block,
        );
        let used = self.next_block as usize;
        for (i, base) in (0..used).step_by(BITS_PER_BLOCK).enumerate() {
            let mut bitmap = BitmapBlock::zeroed();
            for bit in 0..usize::min(BITS_PER_BLOCK, used - base) {
                bitmap.set_bit(bit);
            }
            self.write_pod(BlockNo::new(self.sb.bmapstart + u32::try_from(i).unwrap()), &bitmap);
        }
    }

    fn write_pod<T: Pod>(&self, bn: BlockNo, data: &T) {
        assert_eq!(size_of::<T>(), BLOCK_SIZE);
        let mut block = [0; BLOCK_SIZE];
        block.copy_from_slice(data.as_bytes());
        self.device.write_block(bn.as_index(), &block);
    }

    fn read_pod<T: Pod>(&self, bn: BlockNo) -> T {
        assert_eq!(size_of::<T>(), BLOCK_SIZE);
        let mut block = [0; BLOCK_SIZE];
        self.device.read_block(bn.as_index(), &mut block);
        let mut value = T::zeroed();
        value.as_bytes_mut().copy_from_slice(&block);
        value
    }

    fn read_inode(&self, ino: InodeNo) -> DiskInode {
        let table: InodeBlock = self.read_pod(self.sb.inode_block(ino));
        table.inode(ino).clone()
    }

    fn write_inode(&self, ino: InodeNo, dinode: &DiskInode) {
        let bn = self.sb.inode_block(ino);
        let mut table: InodeBlock = self.read_pod(bn);
        *table.inode_mut(ino) = dinode.clone();
        self.write_pod(bn, &table);
    }

    fn alloc_inode(&mut self, ty: i16) -> InodeNo {
        let ino = InodeNo::new(self.next_ino);
        self.next_ino += 1;
        assert!(self.next_ino <= self.sb.ninodes, "out of inodes");

        let mut dinode = DiskInode::zeroed();
        dinode.ty = ty;
        dinode.nlink = 1;
        self.write_inode(ino, &dinode);
        ino
    }

    fn alloc_block(&mut self) -> BlockNo {
        let bn = BlockNo::new(self.next_block);
        self.next_block += 1;
        assert!(self.next_block <= self.sb.size, "out of data blocks");
        bn
    }

    fn add_dirent(&mut self, dir: InodeNo, ino: InodeNo, name: &[u8]) {
        let mut de = DirEntry::zeroed();
        de.set_inum(Some(ino));
        de.set_name(name);
        self.append(dir, de.as_bytes()).expect("directory overflow");
    }

    /// Appends bytes to an inode's content, walking the direct and
    /// singly-indirect entries. Bootstrap files never need the doubly-
    /// indirect level; the mounted file system grows files through it.
    fn append(&mut self, ino: InodeNo, data: &[u8]) -> Result<(), Error> {
        let mut dinode = self.read_inode(ino);
        let mut off = dinode.size as usize;

        let mut data = data;
        while !data.is_empty() {
            let bidx = off / BLOCK_SIZE;
            let bn = if bidx < NUM_DIRECT {
                if dinode.addr(bidx).is_none() {
                    let bn = self.alloc_block();
                    dinode.set_addr(bidx, Some(bn));
                }
                dinode.addr(bidx).unwrap()
            } else if bidx < NUM_DIRECT + NUM_INDIRECT {
                let ind_bn = match dinode.addr(SINGLE_SLOT) {
                    Some(bn) => bn,
                    None => {
                        let bn = self.alloc_block();
                        dinode.set_addr(SINGLE_SLOT, Some(bn));
                        bn
                    }
                };
                let mut ind: IndirectBlock = self.read_pod(ind_bn);
                let i = bidx - NUM_DIRECT;
                match ind.entry(i) {
                    Some(bn) => bn,
                    None => {
                        let bn = self.alloc_block();
                        ind.set_entry(i, Some(bn));
                        self.write_pod(ind_bn, &ind);
                        bn
                    }
                }
            } else {
                return Err(Error::FileTooLarge);
            };

            let mut block = [0; BLOCK_SIZE];
            self.device.read_block(bn.as_index(), &mut block);
            let span = usize::min(data.len(), BLOCK_SIZE - off % BLOCK_SIZE);
            block[off % BLOCK_SIZE..][..span].copy_from_slice(&data[..span]);
            self.device.write_block(bn.as_index(), &block);

            off += span;
            data = &data[span..];
        }

        dinode.size = u32::try_from(off).unwrap();
        self.write_inode(ino, &dinode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn read_pod_raw<T: Pod>(dev: &MemDevice, index: usize) -> T {
        let mut block = [0; BLOCK_SIZE];
        dev.read_block(index, &mut block);
        let mut value = T::zeroed();
        value.as_bytes_mut().copy_from_slice(&block[..size_of::<T>()]);
        value
    }

    #[test]
    fn format_writes_superblock_and_root() {
        let dev = MemDevice::new(2000);
        format(&dev, &Geometry::default()).unwrap();

        let sb: SuperBlock = read_pod_raw(&dev, 1);
        assert_eq!(sb.magic, SuperBlock::MAGIC);
        assert_eq!(sb.size, 2000);

        // root inode is an allocated directory holding "." and ".."
        let table: InodeBlock = read_pod_raw(&dev, sb.inode_block(InodeNo::ROOT).as_index());
        let root = table.inode(InodeNo::ROOT);
        assert_eq!(root.ty, T_DIR);
        assert_eq!(root.size as usize, 2 * size_of::<DirEntry>());
    }

    #[test]
    fn bitmap_covers_exactly_the_handed_out_blocks() {
        let dev = MemDevice::new(2000);
        let builder = ImageBuilder::format(&dev, &Geometry::default()).unwrap();
        let sb = builder.sb.clone();
        let first_free = builder.next_block;
        builder.finish();

        let bitmap: BitmapBlock = read_pod_raw(&dev, sb.bitmap_block(0).as_index());
        assert!(bitmap.bit(first_free as usize - 1));
        assert!(!bitmap.bit(first_free as usize));
    }

    #[test]
    fn packed_file_spills_into_the_indirect_block() {
        let dev = MemDevice::new(2000);
        let mut builder = ImageBuilder::format(&dev, &Geometry::default()).unwrap();
        let content = vec![0xab; (NUM_DIRECT + 3) * BLOCK_SIZE];
        let ino = builder.add_file(b"big", &content).unwrap();
        let dinode = builder.read_inode(ino);
        assert_eq!(dinode.size as usize, content.len());
        assert!(dinode.addr(SINGLE_SLOT).is_some());
        builder.finish();
    }
}
