//! Block cache.
//!
//! A fixed pool of [`params::NBUF`] buffers holds copies of disk blocks.
//! The pool is kept in least-recently-used order under a spin lock; each
//! buffer's contents sit behind a sleep lock so a holder may perform disk
//! I/O. Getting a buffer never reads the disk; the read happens on the
//! first lock of a stale buffer.
//!
//! A buffer is recycled only while its `Arc` is unshared. The write-ahead
//! log pins modified buffers by holding a clone until the transaction is
//! installed, which keeps uncommitted data from being evicted.

use std::{collections::VecDeque, sync::Arc};

use dataview::{Pod, PodMethods as _};
use orefs_types::{BLOCK_SIZE, BlockNo};

use crate::{
    device::BlockDevice,
    sync::{SleepLock, SleepLockGuard, SpinLock},
};

/// Block number placeholder for a never-assigned buffer.
const UNASSIGNED: u32 = u32::MAX;

pub(crate) struct BufCache {
    device: Box<dyn BlockDevice>,
    /// All buffers; front is most recently released.
    shelf: SpinLock<VecDeque<Arc<Buf>>>,
}

pub(crate) struct Buf {
    /// The block this buffer is assigned to. Read and reassigned only
    /// under the shelf lock; reassignment additionally requires the `Arc`
    /// to be unshared.
    bn: u32,
    state: SleepLock<BufState>,
}

struct BufState {
    /// The block the bytes below belong to. Diverges from `Buf::bn` after
    /// a recycle until the next lock notices.
    bn: u32,
    valid: bool,
    data: Box<[u8; BLOCK_SIZE]>,
}

/// An unlocked reference to a cached buffer.
pub(crate) struct BufHandle<'a> {
    cache: &'a BufCache,
    bn: BlockNo,
    buf: Arc<Buf>,
}

/// A locked buffer with loaded contents.
pub(crate) struct BufGuard<'h> {
    device: &'h dyn BlockDevice,
    bn: BlockNo,
    buf: &'h Arc<Buf>,
    state: SleepLockGuard<'h, BufState>,
}

impl BufCache {
    pub(crate) fn new(device: Box<dyn BlockDevice>, nbuf: usize) -> Self {
        assert!(nbuf > 0);
        let shelf = (0..nbuf)
            .map(|_| {
                Arc::new(Buf {
                    bn: UNASSIGNED,
                    state: SleepLock::new(BufState {
                        bn: UNASSIGNED,
                        valid: false,
                        data: Box::new([0; BLOCK_SIZE]),
                    }),
                })
            })
            .collect();
        Self {
            device,
            shelf: SpinLock::new(shelf),
        }
    }

    /// Returns a handle for block `bn`, recycling the least recently used
    /// unreferenced buffer on a miss.
    ///
    /// # Panics
    ///
    /// Panics if every buffer is referenced or pinned.
    pub(crate) fn get(&self, bn: BlockNo) -> BufHandle<'_> {
        let mut shelf = self.shelf.lock();

        if let Some(buf) = shelf.iter().find(|buf| buf.bn == bn.value()) {
            return BufHandle {
                cache: self,
                bn,
                buf: Arc::clone(buf),
            };
        }

        // Miss: claim the least recently used buffer nobody holds.
        if let Some(buf) = shelf.iter_mut().rev().find_map(|slot| {
            let buf = Arc::get_mut(slot)?;
            buf.bn = bn.value();
            Some(slot)
        }) {
            return BufHandle {
                cache: self,
                bn,
                buf: Arc::clone(buf),
            };
        }

        panic!("block cache exhausted");
    }
}

impl Drop for BufHandle<'_> {
    fn drop(&mut self) {
        // Move to the front of the shelf: most recently used.
        let mut shelf = self.cache.shelf.lock();
        if let Some(pos) = shelf.iter().position(|b| Arc::ptr_eq(b, &self.buf)) {
            let buf = shelf.remove(pos).unwrap();
            shelf.push_front(buf);
        }
    }
}

impl BufHandle<'_> {
    pub(crate) fn block_no(&self) -> BlockNo {
        self.bn
    }

    /// Locks the buffer, reading the block from the device if the cached
    /// bytes are stale or missing.
    pub(crate) fn lock(&mut self) -> BufGuard<'_> {
        let mut state = self.buf.state.lock();
        if state.bn != self.bn.value() {
            state.bn = self.bn.value();
            state.valid = false;
        }
        if !state.valid {
            self.cache
                .device
                .read_block(self.bn.as_index(), &mut state.data);
            state.valid = true;
        }
        BufGuard {
            device: &*self.cache.device,
            bn: self.bn,
            buf: &self.buf,
            state,
        }
    }

    /// Locks the buffer with zeroed contents, skipping the device read.
    pub(crate) fn lock_zeroed(&mut self) -> BufGuard<'_> {
        let mut state = self.buf.state.lock();
        state.bn = self.bn.value();
        state.valid = true;
        state.data.fill(0);
        BufGuard {
            device: &*self.cache.device,
            bn: self.bn,
            buf: &self.buf,
            state,
        }
    }
}

impl BufGuard<'_> {
    pub(crate) fn block_no(&self) -> BlockNo {
        self.bn
    }

    pub(crate) fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.state.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.state.data
    }

    /// Views the block as a POD record.
    pub(crate) fn data<T: Pod>(&self) -> &T {
        self.bytes().as_data_view().get(0)
    }

    /// Views the block mutably as a POD record.
    pub(crate) fn data_mut<T: Pod>(&mut self) -> &mut T {
        self.bytes_mut().as_data_view_mut().get_mut(0)
    }

    /// Keeps the buffer from being recycled until the clone is dropped.
    pub(crate) fn pin(&self) -> Arc<Buf> {
        Arc::clone(self.buf)
    }

    /// Writes the buffer through to the device. Only the log does this;
    /// everything else goes through [`Tx::record`](crate::wal::Tx::record).
    pub(crate) fn write_to_disk(&mut self) {
        self.device.write_block(self.bn.as_index(), &self.state.data);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::device::MemDevice;

    struct CountingDevice {
        inner: MemDevice,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl CountingDevice {
        fn new(nblocks: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: MemDevice::new(nblocks),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            })
        }
    }

    impl BlockDevice for Arc<CountingDevice> {
        fn size(&self) -> usize {
            self.inner.size()
        }

        fn read_block(&self, index: usize, buf: &mut [u8; BLOCK_SIZE]) {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.inner.read_block(index, buf);
        }

        fn write_block(&self, index: usize, buf: &[u8; BLOCK_SIZE]) {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.inner.write_block(index, buf);
        }
    }

    #[test]
    fn get_performs_no_io() {
        let dev = CountingDevice::new(10);
        let cache = BufCache::new(Box::new(Arc::clone(&dev)), 4);
        let handle = cache.get(BlockNo::new(3));
        assert_eq!(handle.block_no(), BlockNo::new(3));
        assert_eq!(dev.reads.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn lock_reads_once_and_caches() {
        let dev = CountingDevice::new(10);
        let cache = BufCache::new(Box::new(Arc::clone(&dev)), 4);
        {
            let mut handle = cache.get(BlockNo::new(1));
            let mut guard = handle.lock();
            guard.bytes_mut()[0] = 0x5a;
            guard.write_to_disk();
        }
        {
            let mut handle = cache.get(BlockNo::new(1));
            let guard = handle.lock();
            assert_eq!(guard.bytes()[0], 0x5a);
        }
        assert_eq!(dev.reads.load(Ordering::Relaxed), 1);
        assert_eq!(dev.writes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn lru_recycles_oldest() {
        let dev = CountingDevice::new(10);
        let cache = BufCache::new(Box::new(Arc::clone(&dev)), 3);
        for i in 0..5 {
            let mut handle = cache.get(BlockNo::new(i));
            let _ = handle.lock();
        }
        // cache now holds 4, 3, 2; re-reading 4 must not touch the disk
        let before = dev.reads.load(Ordering::Relaxed);
        let mut handle = cache.get(BlockNo::new(4));
        let _ = handle.lock();
        assert_eq!(dev.reads.load(Ordering::Relaxed), before);
        // 0 was evicted long ago and needs a fresh read
        drop(handle);
        let mut handle = cache.get(BlockNo::new(0));
        let _ = handle.lock();
        assert_eq!(dev.reads.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    #[should_panic(expected = "block cache exhausted")]
    fn exhaustion_panics() {
        let dev = CountingDevice::new(10);
        let cache = BufCache::new(Box::new(Arc::clone(&dev)), 2);
        let _a = cache.get(BlockNo::new(0));
        let _b = cache.get(BlockNo::new(1));
        let _c = cache.get(BlockNo::new(2));
    }

    #[test]
    fn pin_blocks_recycling() {
        let dev = CountingDevice::new(10);
        let cache = BufCache::new(Box::new(Arc::clone(&dev)), 2);
        let pin = {
            let mut handle = cache.get(BlockNo::new(7));
            let guard = handle.lock();
            guard.pin()
        };
        // one buffer is pinned; the other still recycles freely
        for i in 0..3 {
            let mut handle = cache.get(BlockNo::new(i));
            let _ = handle.lock();
        }
        // the pinned block is still cached
        let before = dev.reads.load(Ordering::Relaxed);
        let mut handle = cache.get(BlockNo::new(7));
        let _ = handle.lock();
        assert_eq!(dev.reads.load(Ordering::Relaxed), before);
        drop(pin);
    }
}
