//! Data-block allocator.
//!
//! Free blocks are tracked by an on-disk bitmap, one bit per block of the
//! device, set = allocated. Allocation and free both run inside the
//! caller's transaction; the allocator itself takes no locks beyond the
//! per-buffer locks of the block cache.

use orefs_types::{BITS_PER_BLOCK, BitmapBlock, BlockNo};

use crate::wal::Tx;

/// Allocates a zeroed data block.
///
/// The bitmap update and the zeroing both go through the transaction, so
/// an allocated-but-unzeroed block can never survive a crash.
///
/// # Panics
///
/// Panics if the device is out of blocks; the file system is provisioned,
/// not grown, and callers have nothing to wait for.
pub(crate) fn alloc(tx: &Tx<'_, false>) -> BlockNo {
    let sb = tx.fs().superblock();
    let size = usize::try_from(sb.size).unwrap();
    for base in (0..size).step_by(BITS_PER_BLOCK) {
        let mut handle = tx.get_block(sb.bitmap_block(base));
        let mut guard = handle.lock();
        let Some(i) = (0..BITS_PER_BLOCK)
            .take_while(|i| base + i < size)
            .find(|&i| !guard.data::<BitmapBlock>().bit(i))
        else {
            continue;
        };
        guard.data_mut::<BitmapBlock>().set_bit(i);
        tx.record(&guard);
        drop(guard);
        drop(handle);

        let bn = BlockNo::new(u32::try_from(base + i).unwrap());
        zero(tx, bn);
        return bn;
    }
    panic!("out of data blocks");
}

/// Frees a data block.
///
/// # Panics
///
/// Panics if the block is already free; a double free means the block map
/// and the bitmap disagree, which is corruption.
pub(crate) fn free(tx: &Tx<'_, false>, bn: BlockNo) {
    let sb = tx.fs().superblock();
    let mut handle = tx.get_block(sb.bitmap_block(bn.as_index()));
    let mut guard = handle.lock();
    let i = bn.as_index() % BITS_PER_BLOCK;
    assert!(guard.data::<BitmapBlock>().bit(i), "freeing free block");
    guard.data_mut::<BitmapBlock>().clear_bit(i);
    tx.record(&guard);
}

/// Zeros a block through the transaction.
fn zero(tx: &Tx<'_, false>, bn: BlockNo) {
    let mut handle = tx.get_block(bn);
    let guard = handle.lock_zeroed();
    tx.record(&guard);
}
