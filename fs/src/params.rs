//! Provisioning constants.

/// In-memory inode table slots.
pub const NINODE: usize = 50;

/// Max number of blocks any single transaction writes.
pub const MAX_OP_BLOCKS: usize = 10;

/// Log body blocks reserved on disk (the header block is extra).
pub const LOG_SIZE: usize = MAX_OP_BLOCKS * 3;

/// Buffers in the block cache.
pub const NBUF: usize = MAX_OP_BLOCKS * 3;

/// Device id reported by `stat`; exactly one device is mounted.
pub const ROOT_DEV: u32 = 1;

/// Longest path accepted by the high-level operations.
pub const MAX_PATH: usize = 128;

/// Symbolic-link hops `open` follows before reporting a cycle.
pub const MAX_SYMLINK_DEPTH: usize = 10;
