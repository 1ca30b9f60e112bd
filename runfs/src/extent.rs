//! Block mapping and extent growth.
//!
//! Every node owns exactly one contiguous extent. A file grows one block at a
//! time: in place when the block after its extent is free, otherwise by
//! moving the whole extent to the lowest free run that can hold it plus the
//! new block. Growth and shrinking run with the allocation lock held (the
//! caller passes the locked superblock); mapping a block inside the current
//! extent needs no lock at all.

use std::ops::Range;

use tracing::debug;

use crate::alloc;
use crate::buffer::BufferCache;
use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::layout::{Inode, Superblock, BLOCK_SIZE, DATA_END_BLOCK, NO_EXTENT};

/// Result of resolving a logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// `fresh` is set when the block was allocated by this call; its
    /// contents are zero.
    Mapped { block: u64, fresh: bool },
    /// Past the end of the extent and no write intent.
    Unmapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u64,
    pub len: u64,
}

impl Extent {
    pub fn of(inode: &Inode) -> Self {
        Self {
            start: inode.extent_start,
            len: inode.block_count,
        }
    }

    pub fn blocks(&self) -> Range<u64> {
        if self.len == 0 || self.start == NO_EXTENT {
            0..0
        } else {
            self.start..self.start + self.len
        }
    }

    /// Physical block of `logical` when it lies inside the extent.
    pub fn lookup(&self, logical: u64) -> Option<u64> {
        (logical < self.len && self.start != NO_EXTENT).then(|| self.start + logical)
    }
}

/// Adds one block to the end of `ext`. Returns the new extent and the
/// physical block now backing logical index `ext.len`.
///
/// On error neither the bitmaps nor the cached data have changed.
pub fn grow<D: BlockDevice>(
    sb: &mut Superblock,
    cache: &BufferCache<D>,
    ext: Extent,
) -> Result<(Extent, u64)> {
    let zero = vec![0u8; BLOCK_SIZE];

    if ext.len == 0 {
        let block = alloc::allocate_block(sb)?;
        if let Err(e) = cache.write_block(block, &zero) {
            alloc::free_blocks(sb, block, 1);
            return Err(e);
        }
        debug!(block, "first block allocated");
        return Ok((Extent { start: block, len: 1 }, block));
    }

    let next = ext.start + ext.len;
    if next >= DATA_END_BLOCK {
        return Err(FsError::NoSpace);
    }

    if alloc::is_block_free(sb, next) {
        cache.write_block(next, &zero)?;
        alloc::claim_blocks(sb, next, 1);
        debug!(block = next, len = ext.len + 1, "extent grown in place");
        return Ok((
            Extent {
                start: ext.start,
                len: ext.len + 1,
            },
            next,
        ));
    }

    let new_len = ext.len + 1;
    let new_start = alloc::allocate_contiguous(sb, new_len, ext.blocks())?;
    relocate(cache, ext, new_start)?;
    let block = new_start + ext.len;
    cache.write_block(block, &zero)?;
    alloc::move_extent(sb, ext.blocks(), new_start..new_start + new_len);
    debug!(
        from = ext.start,
        to = new_start,
        len = new_len,
        "extent relocated"
    );
    Ok((
        Extent {
            start: new_start,
            len: new_len,
        },
        block,
    ))
}

/// Copies the `ext.len` blocks of `ext` to `new_start..`.
///
/// Every source block is read into its own buffer before anything is
/// written, so overlapping source and destination ranges cannot clobber each
/// other and a failed read leaves the cache untouched. Reads go through the
/// cache, which returns unflushed modifications in preference to the device.
fn relocate<D: BlockDevice>(cache: &BufferCache<D>, ext: Extent, new_start: u64) -> Result<()> {
    let copies = ext
        .blocks()
        .map(|src| cache.read_block(src))
        .collect::<Result<Vec<_>>>()?;

    for (i, data) in copies.iter().enumerate() {
        cache.write_block(new_start + i as u64, data)?;
    }

    let new_blocks = new_start..new_start + ext.len + 1;
    for src in ext.blocks().filter(|b| !new_blocks.contains(b)) {
        cache.forget(src);
    }
    Ok(())
}

/// Cuts `ext` down to `new_len` blocks, releasing the tail. The start stays
/// where it is.
pub fn shrink(sb: &mut Superblock, ext: Extent, new_len: u64) -> Extent {
    if new_len >= ext.len {
        return ext;
    }
    alloc::free_blocks(sb, ext.start + new_len, ext.len - new_len);
    debug!(start = ext.start, from = ext.len, to = new_len, "extent shrunk");
    Extent {
        start: ext.start,
        len: new_len,
    }
}
