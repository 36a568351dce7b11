//! Block devices the file system can be mounted on.
//!
//! The core only ever moves whole blocks. A failed transfer has no
//! recovery at this layer, so implementations panic on I/O errors the way
//! a kernel disk driver would.

use std::{
    fs::File,
    io::{Read as _, Seek as _, SeekFrom, Write as _},
    path::Path,
    sync::{Arc, Mutex},
};

use orefs_types::BLOCK_SIZE;

/// Whole-block random-access storage.
pub trait BlockDevice: Send + Sync {
    /// Number of blocks the device holds.
    fn size(&self) -> usize;

    /// Reads block `index` into `buf`.
    fn read_block(&self, index: usize, buf: &mut [u8; BLOCK_SIZE]);

    /// Writes `buf` to block `index`.
    fn write_block(&self, index: usize, buf: &[u8; BLOCK_SIZE]);
}

/// An in-memory device. Cloning shares the backing image, which lets
/// tests and tools keep a handle for raw inspection while the file
/// system owns the other.
#[derive(Clone)]
pub struct MemDevice {
    blocks: Arc<Vec<Mutex<Box<[u8; BLOCK_SIZE]>>>>,
}

impl MemDevice {
    #[must_use]
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: Arc::new(
                (0..nblocks)
                    .map(|_| Mutex::new(Box::new([0; BLOCK_SIZE])))
                    .collect(),
            ),
        }
    }

    /// Builds a device holding a copy of `image` (padded with zero blocks
    /// up to `nblocks`).
    #[must_use]
    pub fn from_image(image: &[u8], nblocks: usize) -> Self {
        assert_eq!(image.len() % BLOCK_SIZE, 0);
        assert!(image.len() / BLOCK_SIZE <= nblocks);
        let dev = Self::new(nblocks);
        for (i, chunk) in image.chunks_exact(BLOCK_SIZE).enumerate() {
            dev.blocks[i].lock().unwrap().copy_from_slice(chunk);
        }
        dev
    }

    /// Copies the whole image out.
    #[must_use]
    pub fn to_image(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.blocks.len() * BLOCK_SIZE);
        for block in self.blocks.iter() {
            image.extend_from_slice(&block.lock().unwrap()[..]);
        }
        image
    }
}

impl BlockDevice for MemDevice {
    fn size(&self) -> usize {
        self.blocks.len()
    }

    fn read_block(&self, index: usize, buf: &mut [u8; BLOCK_SIZE]) {
        buf.copy_from_slice(&self.blocks[index].lock().unwrap()[..]);
    }

    fn write_block(&self, index: usize, buf: &[u8; BLOCK_SIZE]) {
        self.blocks[index].lock().unwrap().copy_from_slice(buf);
    }
}

/// A device backed by an image file on the host.
pub struct FileDevice {
    img: Mutex<File>,
    nblocks: usize,
}

impl FileDevice {
    /// Opens an existing image file.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let img = File::options().read(true).write(true).open(path)?;
        let len = img.metadata()?.len();
        assert_eq!(len % BLOCK_SIZE as u64, 0, "image is not block-aligned");
        Ok(Self {
            nblocks: usize::try_from(len / BLOCK_SIZE as u64).unwrap(),
            img: Mutex::new(img),
        })
    }

    /// Creates (or truncates) an image file of `nblocks` zero blocks.
    pub fn create(path: &Path, nblocks: usize) -> std::io::Result<Self> {
        let img = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        img.set_len((nblocks * BLOCK_SIZE) as u64)?;
        Ok(Self {
            img: Mutex::new(img),
            nblocks,
        })
    }
}

impl BlockDevice for FileDevice {
    fn size(&self) -> usize {
        self.nblocks
    }

    fn read_block(&self, index: usize, buf: &mut [u8; BLOCK_SIZE]) {
        assert!(index < self.nblocks);
        let mut img = self.img.lock().unwrap();
        img.seek(SeekFrom::Start((index * BLOCK_SIZE) as u64))
            .expect("disk seek failed");
        img.read_exact(buf).expect("disk read failed");
    }

    fn write_block(&self, index: usize, buf: &[u8; BLOCK_SIZE]) {
        assert!(index < self.nblocks);
        let mut img = self.img.lock().unwrap();
        img.seek(SeekFrom::Start((index * BLOCK_SIZE) as u64))
            .expect("disk seek failed");
        img.write_all(buf).expect("disk write failed");
    }
}
