//! Mounting and transaction entry points.

use orefs_types::{BlockNo, SuperBlock};

use crate::{
    buffer::BufCache,
    device::BlockDevice,
    error::Error,
    inode::{Inode, InodeTable},
    params::NBUF,
    wal::{Log, Tx},
};

/// One mounted file system.
///
/// All state lives here (superblock, block cache, write-ahead log, and
/// inode table), so independent instances never interfere.
pub struct FileSystem {
    sb: SuperBlock,
    pub(crate) cache: BufCache,
    pub(crate) log: Log,
    pub(crate) itable: InodeTable,
}

impl FileSystem {
    /// Mounts the file system on `device`.
    ///
    /// Reads the superblock, refuses anything without the right magic
    /// number, and replays a committed-but-uninstalled log transaction
    /// left behind by a crash.
    pub fn mount(device: Box<dyn BlockDevice>) -> Result<Self, Error> {
        let cache = BufCache::new(device, NBUF);

        let sb = {
            let mut handle = cache.get(BlockNo::SUPER);
            let guard = handle.lock();
            guard.data::<SuperBlock>().clone()
        };
        if sb.magic != SuperBlock::MAGIC {
            return Err(Error::BadImage("bad magic number"));
        }
        log::info!(
            "fs: mounting: {} blocks, {} inodes, {} log blocks",
            sb.size,
            sb.ninodes,
            sb.nlog
        );

        let wal = Log::new(&sb);
        wal.recover(&cache);

        Ok(Self {
            sb,
            cache,
            log: wal,
            itable: InodeTable::new(),
        })
    }

    /// The layout descriptor read at mount. Immutable for the lifetime of
    /// the mount.
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// Opens a log transaction. Every mutating operation runs inside one;
    /// the transaction commits when the value is dropped.
    pub fn begin_tx(&self) -> Tx<'_, false> {
        Tx::begin(self)
    }

    /// A read-only transaction capability; free, and never commits.
    pub fn read_tx(&self) -> Tx<'_, true> {
        Tx::read_only(self)
    }

    /// A long-term reference to the root directory.
    pub fn root(&self) -> Inode<'_> {
        Inode::root(self)
    }
}
