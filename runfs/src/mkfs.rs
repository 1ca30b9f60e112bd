//! Creating a brand-new runfs image.
//!
//! A fresh image is:
//!   1. superblock with the magic, the root inode bit and the first data bit
//!   2. inode table holding only the root directory record
//!   3. a zeroed root directory block at `DATA_START_BLOCK`
//!
//! Every other block is zero.

use std::path::Path;

use tracing::info;

use crate::alloc;
use crate::device::{BlockDevice, FileBlockDevice};
use crate::error::{FsError, Result};
use crate::layout::{
    inode_location, Inode, Superblock, Timespec, BLOCK_SIZE, DATA_START_BLOCK, IMAGE_BLOCKS,
    INODE_SIZE, INODE_TABLE_BLOCK, INODE_TABLE_BLOCKS, PERM_MASK, ROOT_INO, S_IFDIR,
    SUPERBLOCK_BLOCK,
};

/// Ownership and permissions of the root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    pub root_uid: u32,
    pub root_gid: u32,
    pub root_mode: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            root_uid: 0,
            root_gid: 0,
            root_mode: 0o755,
        }
    }
}

/// Writes an empty filesystem onto `dev`, overwriting the whole layout area.
pub fn format<D: BlockDevice>(dev: &D, options: &FormatOptions) -> Result<()> {
    if dev.block_count() < IMAGE_BLOCKS {
        return Err(FsError::InvalidArgument("device too small for a runfs image"));
    }

    let mut sb = Superblock::empty();
    let root = alloc::allocate_inode(&mut sb)?;
    let root_block = alloc::allocate_block(&mut sb)?;
    debug_assert_eq!((root, root_block), (ROOT_INO, DATA_START_BLOCK));

    let now = Timespec::now();
    let record = Inode {
        mode: S_IFDIR | (options.root_mode & PERM_MASK),
        nlink: 2,
        size: BLOCK_SIZE as u64,
        block_count: 1,
        extent_start: root_block,
        uid: options.root_uid,
        gid: options.root_gid,
        atime: now,
        mtime: now,
        ctime: now,
    };

    let zero = vec![0u8; BLOCK_SIZE];
    for block in INODE_TABLE_BLOCK..INODE_TABLE_BLOCK + INODE_TABLE_BLOCKS {
        dev.write_block(block, &zero)?;
    }
    let (table_block, off) = inode_location(ROOT_INO);
    let mut table = zero.clone();
    record.encode_into(&mut table[off..off + INODE_SIZE]);
    dev.write_block(table_block, &table)?;

    dev.write_block(root_block, &zero)?;
    dev.write_block(SUPERBLOCK_BLOCK, &sb.encode())?;
    dev.flush()?;

    info!(
        root_mode = %format!("{:o}", record.mode & PERM_MASK),
        uid = options.root_uid,
        gid = options.root_gid,
        "runfs image formatted"
    );
    Ok(())
}

/// Creates (or truncates) `path` to exactly the image size and formats it.
pub fn create_image(path: impl AsRef<Path>, options: &FormatOptions) -> Result<FileBlockDevice> {
    let path = path.as_ref();
    let dev = FileBlockDevice::create(path, IMAGE_BLOCKS)?;
    format(&dev, options)?;
    info!(path = %path.display(), blocks = IMAGE_BLOCKS, "image created");
    Ok(dev)
}
