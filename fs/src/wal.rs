//! Write-ahead log.
//!
//! Every sequence of metadata-affecting block writes runs inside a
//! transaction; on recovery a transaction is either fully applied or
//! fully absent. Transactions from concurrent callers share one commit
//! (group commit): the log only commits once no caller is inside a
//! transaction, so a commit never carries a half-finished operation.
//!
//! The on-disk log is a physical redo log:
//!
//! ```text
//! head block: count + home addresses of blocks A, B, C, ...
//! copy of block A
//! copy of block B
//! ...
//! ```
//!
//! Writing the head block is the commit point. Modified buffers stay
//! pinned in the block cache from [`Tx::record`] until they are installed
//! at their home locations, so an eviction can never expose uncommitted
//! state on disk.
//!
//! The transaction itself is a capability value: [`Tx`]. APIs that mutate
//! disk state take (or are methods on) a writable `Tx`, which makes
//! "caller must be inside a transaction" a compile-time obligation
//! rather than a convention.

use std::{mem::ManuallyDrop, sync::Arc};

use orefs_types::{BlockNo, LogHeader, SuperBlock};

use crate::{
    FileSystem,
    buffer::{Buf, BufCache, BufGuard, BufHandle},
    params::{LOG_SIZE, MAX_OP_BLOCKS},
    sync::{CondVar, SpinLock},
};

pub(crate) struct Log {
    start: u32,
    /// Log body blocks available on disk.
    capacity: usize,
    state: SpinLock<LogState>,
    cond: CondVar,
}

struct LogState {
    /// Operations between `begin_op` and `end_op`.
    outstanding: usize,
    /// Blocks recorded by the open transactions, each pinned in the
    /// cache. `None` while a commit is in flight.
    pending: Option<Vec<(BlockNo, Arc<Buf>)>>,
}

impl Log {
    pub(crate) fn new(sb: &SuperBlock) -> Self {
        let capacity = usize::try_from(sb.nlog).unwrap() - 1;
        assert!(capacity >= LOG_SIZE, "log region smaller than LOG_SIZE");
        Self {
            start: sb.logstart,
            capacity,
            state: SpinLock::new(LogState {
                outstanding: 0,
                pending: Some(Vec::new()),
            }),
            cond: CondVar::new(),
        }
    }

    fn head_block(&self) -> BlockNo {
        BlockNo::new(self.start)
    }

    fn body_block(&self, i: usize) -> BlockNo {
        BlockNo::new(self.start + 1 + u32::try_from(i).unwrap())
    }

    /// Replays a committed-but-uninstalled transaction left by a crash.
    pub(crate) fn recover(&self, cache: &BufCache) {
        let homes: Vec<BlockNo> = {
            let mut head = cache.get(self.head_block());
            let guard = head.lock();
            guard.data::<LogHeader>().blocks().collect()
        };
        if homes.is_empty() {
            return;
        }
        log::info!("log: recovering {} blocks", homes.len());
        for (i, home_bn) in homes.iter().enumerate() {
            let mut body = cache.get(self.body_block(i));
            let body_guard = body.lock();
            let mut home = cache.get(*home_bn);
            let mut home_guard = home.lock_zeroed();
            home_guard.bytes_mut().copy_from_slice(body_guard.bytes());
            home_guard.write_to_disk();
        }
        self.clear_head(cache);
    }

    /// Reserves log space for one operation, waiting while a commit is in
    /// flight or the open operations could overflow the log.
    fn begin_op(&self) {
        let mut state = self.state.lock();
        loop {
            let Some(pending) = &state.pending else {
                state = self.cond.wait(state);
                continue;
            };
            if pending.len() + (state.outstanding + 1) * MAX_OP_BLOCKS > LOG_SIZE {
                state = self.cond.wait(state);
                continue;
            }
            state.outstanding += 1;
            return;
        }
    }

    /// Ends one operation; the last one out commits the whole batch.
    fn end_op(&self, cache: &BufCache) {
        let to_commit = {
            let mut state = self.state.lock();
            state.outstanding -= 1;
            assert!(state.pending.is_some(), "end_op during commit");
            if state.outstanding == 0 {
                state.pending.take()
            } else {
                // Space reserved by this operation is released; a waiting
                // begin_op may now fit.
                self.cond.notify_all();
                None
            }
        };

        if let Some(pending) = to_commit {
            // Commit without holding the state lock; it sleeps on buffers.
            self.commit(cache, &pending);
            drop(pending); // unpin the installed buffers
            let mut state = self.state.lock();
            state.pending = Some(Vec::new());
            self.cond.notify_all();
        }
    }

    /// Records a modified buffer into the open transaction, pinning it in
    /// the cache. Repeat writes of the same block are absorbed.
    fn record(&self, guard: &BufGuard<'_>) {
        let mut state = self.state.lock();
        assert!(state.outstanding > 0, "log write outside a transaction");
        let pending = state.pending.as_mut().expect("log write during commit");
        assert!(pending.len() < self.capacity, "transaction too big");

        let bn = guard.block_no();
        if pending.iter().all(|(pbn, _)| *pbn != bn) {
            pending.push((bn, guard.pin()));
        }
    }

    fn commit(&self, cache: &BufCache, pending: &[(BlockNo, Arc<Buf>)]) {
        if pending.is_empty() {
            return;
        }
        log::trace!("log: committing {} blocks", pending.len());

        // Copy the cached home blocks into the log body.
        for (i, (home_bn, _)) in pending.iter().enumerate() {
            let mut home = cache.get(*home_bn);
            let home_guard = home.lock(); // pinned, so this never hits the disk
            let mut body = cache.get(self.body_block(i));
            let mut body_guard = body.lock_zeroed();
            body_guard.bytes_mut().copy_from_slice(home_guard.bytes());
            body_guard.write_to_disk();
        }

        // Write the head: the transaction now survives a crash.
        {
            let mut head = cache.get(self.head_block());
            let mut guard = head.lock_zeroed();
            let header = guard.data_mut::<LogHeader>();
            for (home_bn, _) in pending {
                header.push(*home_bn);
            }
            guard.write_to_disk();
        }

        // Install the writes at their home locations.
        for (home_bn, _) in pending {
            let mut home = cache.get(*home_bn);
            let mut guard = home.lock();
            guard.write_to_disk();
        }

        // Erase the transaction from the log.
        self.clear_head(cache);
    }

    fn clear_head(&self, cache: &BufCache) {
        let mut head = cache.get(self.head_block());
        let mut guard = head.lock_zeroed();
        guard.data_mut::<LogHeader>().clear();
        guard.write_to_disk();
    }
}

/// A file-system transaction.
///
/// `READ_ONLY = false` values are real log transactions: created by
/// [`FileSystem::begin_tx`], they hold log space until dropped, and every
/// block mutated under them must be passed to [`Tx::record`].
/// `READ_ONLY = true` values ([`FileSystem::read_tx`]) are a free
/// capability for paths that only read.
pub struct Tx<'fs, const READ_ONLY: bool> {
    fs: &'fs FileSystem,
}

impl<'fs> Tx<'fs, false> {
    pub(crate) fn begin(fs: &'fs FileSystem) -> Self {
        fs.log.begin_op();
        Self { fs }
    }

    /// Records a modified buffer into this transaction (`log_write`).
    pub(crate) fn record(&self, guard: &BufGuard<'_>) {
        self.fs.log.record(guard);
    }
}

impl<'fs> Tx<'fs, true> {
    pub(crate) fn read_only(fs: &'fs FileSystem) -> Self {
        Self { fs }
    }
}

impl<'fs, const READ_ONLY: bool> Tx<'fs, READ_ONLY> {
    pub(crate) fn fs(&self) -> &'fs FileSystem {
        self.fs
    }

    pub(crate) fn get_block(&self, bn: BlockNo) -> BufHandle<'fs> {
        self.fs.cache.get(bn)
    }

    /// The writable view of this transaction, if it has one. The returned
    /// value aliases `self` and must not be dropped as a transaction,
    /// hence the [`ManuallyDrop`].
    pub(crate) fn to_writable(&self) -> Option<ManuallyDrop<Tx<'fs, false>>> {
        if READ_ONLY {
            None
        } else {
            Some(ManuallyDrop::new(Tx { fs: self.fs }))
        }
    }
}

impl<const READ_ONLY: bool> Drop for Tx<'_, READ_ONLY> {
    fn drop(&mut self) {
        if !READ_ONLY {
            self.fs.log.end_op(&self.fs.cache);
        }
    }
}
