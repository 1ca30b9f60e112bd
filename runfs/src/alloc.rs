//! Inode and data-block allocation over the superblock bitmaps.
//!
//! Every function takes the superblock by reference, which callers can only
//! obtain through the filesystem's allocation lock. Scans are ascending
//! first-fit. A failed call never changes a bit.

use std::ops::Range;

use crate::error::{FsError, Result};
use crate::layout::{Superblock, DATA_END_BLOCK, DATA_START_BLOCK, MAX_INODES, ROOT_INO};

fn data_index(block: u64) -> usize {
    (block - DATA_START_BLOCK) as usize
}

fn data_indexes(blocks: Range<u64>) -> Range<usize> {
    let start = blocks.start.clamp(DATA_START_BLOCK, DATA_END_BLOCK);
    let end = blocks.end.clamp(start, DATA_END_BLOCK);
    data_index(start)..data_index(end)
}

pub fn is_data_block(block: u64) -> bool {
    (DATA_START_BLOCK..DATA_END_BLOCK).contains(&block)
}

// Claims the lowest free inode slot and returns its inode number
pub fn allocate_inode(sb: &mut Superblock) -> Result<u64> {
    let slot = sb.inodes.first_clear().ok_or(FsError::NoSpace)?;
    sb.inodes.set(slot);
    Ok(slot as u64 + ROOT_INO)
}

// Claims the lowest free data block and returns its block number
pub fn allocate_block(sb: &mut Superblock) -> Result<u64> {
    let idx = sb.blocks.first_clear().ok_or(FsError::NoSpace)?;
    sb.blocks.set(idx);
    Ok(idx as u64 + DATA_START_BLOCK)
}

/// Finds the lowest run of `run_len` free data blocks, counting the blocks in
/// `vacating` as free because their owner is about to move out of them.
///
/// Nothing is reserved: the caller commits the move with [`move_extent`]
/// while still holding the lock.
pub fn allocate_contiguous(sb: &Superblock, run_len: u64, vacating: Range<u64>) -> Result<u64> {
    sb.blocks
        .find_run(run_len as usize, data_indexes(vacating))
        .map(|idx| idx as u64 + DATA_START_BLOCK)
        .ok_or(FsError::NoSpace)
}

pub fn free_inode(sb: &mut Superblock, ino: u64) {
    if (ROOT_INO..ROOT_INO + MAX_INODES).contains(&ino) {
        sb.inodes.clear((ino - ROOT_INO) as usize);
    }
}

pub fn free_blocks(sb: &mut Superblock, start: u64, count: u64) {
    sb.blocks.clear_range(data_indexes(start..start.saturating_add(count)));
}

pub fn claim_blocks(sb: &mut Superblock, start: u64, count: u64) {
    sb.blocks.set_range(data_indexes(start..start.saturating_add(count)));
}

pub fn is_block_free(sb: &Superblock, block: u64) -> bool {
    is_data_block(block) && !sb.blocks.test(data_index(block))
}

pub fn is_inode_allocated(sb: &Superblock, ino: u64) -> bool {
    ino >= ROOT_INO && sb.inodes.test((ino - ROOT_INO) as usize)
}

/// Releases `old` and claims `new` as one step. The ranges may overlap.
pub fn move_extent(sb: &mut Superblock, old: Range<u64>, new: Range<u64>) {
    sb.blocks.clear_range(data_indexes(old));
    sb.blocks.set_range(data_indexes(new));
}
