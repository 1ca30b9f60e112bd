//! On-disk layout of a runfs image.
//!
//! ```text
//! block 0          superblock: magic, inode bitmap, data bitmap
//! blocks 1..=2     inode table, 128-byte records, slot = ino - 1
//! blocks 3..259    data region, one contiguous extent per node
//! ```
//!
//! All integers are little-endian. Records are encoded and decoded field by
//! field at fixed offsets; nothing here reinterprets raw buffers as structs.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::bitmap::Bitmap;

pub const MAGIC: u64 = 0x0000_0053_464E_5552; // "RUNFS"

pub const BLOCK_SIZE: usize = 4096;

pub const SUPERBLOCK_BLOCK: u64 = 0;
pub const INODE_TABLE_BLOCK: u64 = 1;
pub const INODE_TABLE_BLOCKS: u64 = 2;
pub const DATA_START_BLOCK: u64 = INODE_TABLE_BLOCK + INODE_TABLE_BLOCKS;
pub const MAX_DATA_BLOCKS: u64 = 256;
pub const DATA_END_BLOCK: u64 = DATA_START_BLOCK + MAX_DATA_BLOCKS;
pub const IMAGE_BLOCKS: u64 = DATA_END_BLOCK;

pub const INODE_SIZE: usize = 128;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
pub const MAX_INODES: u64 = INODE_TABLE_BLOCKS * INODES_PER_BLOCK as u64;
pub const ROOT_INO: u64 = 1;

/// Extent start of a node that owns no blocks.
pub const NO_EXTENT: u64 = u64::MAX;

pub const DIRENT_SIZE: usize = 128;
pub const MAX_CHILDREN: usize = BLOCK_SIZE / DIRENT_SIZE;
pub const MAX_NAME_LEN: usize = DIRENT_SIZE - 10;

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const PERM_MASK: u32 = 0o7777;

const INODE_BITMAP_OFFSET: usize = 8;
const INODE_BITMAP_BYTES: usize = (MAX_INODES as usize + 7) / 8;
const BLOCK_BITMAP_OFFSET: usize = INODE_BITMAP_OFFSET + INODE_BITMAP_BYTES;
const BLOCK_BITMAP_BYTES: usize = (MAX_DATA_BLOCKS as usize + 7) / 8;

pub fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn get_i64(buf: &[u8], off: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(b)
}

pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut [u8], off: usize, v: i64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/* ---------------- SUPERBLOCK ---------------- */

/// In-memory copy of block 0. Owned by the allocation lock once mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u64,
    /// One bit per inode slot (slot = ino - 1).
    pub inodes: Bitmap,
    /// One bit per data block (index = block - DATA_START_BLOCK).
    pub blocks: Bitmap,
}

impl Superblock {
    pub fn empty() -> Self {
        Self {
            magic: MAGIC,
            inodes: Bitmap::new(MAX_INODES as usize),
            blocks: Bitmap::new(MAX_DATA_BLOCKS as usize),
        }
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            magic: get_u64(buf, 0),
            inodes: Bitmap::from_bytes(
                &buf[INODE_BITMAP_OFFSET..INODE_BITMAP_OFFSET + INODE_BITMAP_BYTES],
                MAX_INODES as usize,
            ),
            blocks: Bitmap::from_bytes(
                &buf[BLOCK_BITMAP_OFFSET..BLOCK_BITMAP_OFFSET + BLOCK_BITMAP_BYTES],
                MAX_DATA_BLOCKS as usize,
            ),
        }
    }

    /// Serializes into a full block; bytes past the bitmaps are zeroed.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        put_u64(&mut buf, 0, self.magic);
        buf[INODE_BITMAP_OFFSET..INODE_BITMAP_OFFSET + INODE_BITMAP_BYTES]
            .copy_from_slice(self.inodes.as_bytes());
        buf[BLOCK_BITMAP_OFFSET..BLOCK_BITMAP_OFFSET + BLOCK_BITMAP_BYTES]
            .copy_from_slice(self.blocks.as_bytes());
        buf
    }
}

/* ---------------- INODE ---------------- */

/// Seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    pub secs: i64,
    pub nsecs: u32,
}

impl Timespec {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    pub fn to_system_time(self) -> SystemTime {
        if self.secs >= 0 {
            UNIX_EPOCH + Duration::new(self.secs as u64, self.nsecs)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.secs.unsigned_abs())
                + Duration::from_nanos(u64::from(self.nsecs))
        }
    }
}

impl From<SystemTime> for Timespec {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nsecs: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                let mut secs = -(d.as_secs() as i64);
                let mut nsecs = d.subsec_nanos();
                if nsecs > 0 {
                    secs -= 1;
                    nsecs = 1_000_000_000 - nsecs;
                }
                Self { secs, nsecs }
            }
        }
    }
}

/// Inode record as stored in the inode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub block_count: u64,
    pub extent_start: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl Inode {
    pub fn empty() -> Self {
        Self {
            mode: 0,
            nlink: 0,
            size: 0,
            block_count: 0,
            extent_start: NO_EXTENT,
            uid: 0,
            gid: 0,
            atime: Timespec::default(),
            mtime: Timespec::default(),
            ctime: Timespec::default(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Physical block range owned by this node, empty when it owns none.
    pub fn extent(&self) -> std::ops::Range<u64> {
        if self.block_count == 0 || self.extent_start == NO_EXTENT {
            return 0..0;
        }
        self.extent_start..self.extent_start + self.block_count
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            mode: get_u32(buf, 0),
            nlink: get_u32(buf, 4),
            size: get_u64(buf, 8),
            block_count: get_u64(buf, 16),
            extent_start: get_u64(buf, 24),
            uid: get_u32(buf, 32),
            gid: get_u32(buf, 36),
            atime: Timespec {
                secs: get_i64(buf, 40),
                nsecs: get_u32(buf, 48),
            },
            mtime: Timespec {
                secs: get_i64(buf, 52),
                nsecs: get_u32(buf, 60),
            },
            ctime: Timespec {
                secs: get_i64(buf, 64),
                nsecs: get_u32(buf, 72),
            },
        }
    }

    /// Writes the record into `buf[..INODE_SIZE]`, zeroing the padding.
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[..INODE_SIZE].fill(0);
        put_u32(buf, 0, self.mode);
        put_u32(buf, 4, self.nlink);
        put_u64(buf, 8, self.size);
        put_u64(buf, 16, self.block_count);
        put_u64(buf, 24, self.extent_start);
        put_u32(buf, 32, self.uid);
        put_u32(buf, 36, self.gid);
        put_i64(buf, 40, self.atime.secs);
        put_u32(buf, 48, self.atime.nsecs);
        put_i64(buf, 52, self.mtime.secs);
        put_u32(buf, 60, self.mtime.nsecs);
        put_i64(buf, 64, self.ctime.secs);
        put_u32(buf, 72, self.ctime.nsecs);
    }
}

/// Block of the inode table holding `ino`, and the byte offset inside it.
pub fn inode_location(ino: u64) -> (u64, usize) {
    let slot = (ino - ROOT_INO) as usize;
    (
        INODE_TABLE_BLOCK + (slot / INODES_PER_BLOCK) as u64,
        (slot % INODES_PER_BLOCK) * INODE_SIZE,
    )
}

/// Number of blocks needed to hold `size` bytes.
pub fn blocks_for(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64)
}

/* ---------------- DIRECTORY ENTRY ---------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub active: bool,
    pub name_len: u8,
    pub name: [u8; MAX_NAME_LEN],
}

impl DirEntry {
    pub fn empty() -> Self {
        Self {
            ino: 0,
            active: false,
            name_len: 0,
            name: [0; MAX_NAME_LEN],
        }
    }

    /// Callers validate the name length first; longer names are cut.
    pub fn new(ino: u64, name: &[u8]) -> Self {
        let mut e = DirEntry::empty();
        let len = name.len().min(MAX_NAME_LEN);

        e.ino = ino;
        e.active = true;
        e.name_len = len as u8;
        e.name[..len].copy_from_slice(&name[..len]);

        e
    }

    pub fn name(&self) -> &[u8] {
        &self.name[..(self.name_len as usize).min(MAX_NAME_LEN)]
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut name = [0u8; MAX_NAME_LEN];
        name.copy_from_slice(&buf[10..10 + MAX_NAME_LEN]);
        Self {
            ino: get_u64(buf, 0),
            active: buf[8] != 0,
            name_len: buf[9],
            name,
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.ino);
        buf[8] = u8::from(self.active);
        buf[9] = self.name_len;
        buf[10..10 + MAX_NAME_LEN].copy_from_slice(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_constants_fit_their_regions() {
        assert_eq!(MAX_INODES, 64);
        assert_eq!(MAX_CHILDREN, 32);
        assert_eq!(MAX_NAME_LEN, 118);
        assert!(BLOCK_BITMAP_OFFSET + BLOCK_BITMAP_BYTES <= BLOCK_SIZE);
        assert_eq!(DATA_START_BLOCK, 3);
    }

    #[test]
    fn inode_fields_land_at_fixed_offsets() {
        let mut inode = Inode::empty();
        inode.mode = S_IFREG | 0o644;
        inode.size = 0x0102_0304;
        inode.extent_start = 7;
        inode.mtime = Timespec { secs: -5, nsecs: 9 };

        let mut buf = vec![0xAAu8; INODE_SIZE];
        inode.encode_into(&mut buf);

        assert_eq!(get_u32(&buf, 0), S_IFREG | 0o644);
        assert_eq!(get_u64(&buf, 8), 0x0102_0304);
        assert_eq!(get_u64(&buf, 24), 7);
        assert_eq!(get_i64(&buf, 52), -5);
        assert!(buf[76..].iter().all(|b| *b == 0));
        assert_eq!(Inode::decode(&buf), inode);
    }

    #[test]
    fn superblock_keeps_bitmaps_apart() {
        let mut sb = Superblock::empty();
        sb.inodes.set(0);
        sb.blocks.set(255);

        let buf = sb.encode();
        assert_eq!(buf[INODE_BITMAP_OFFSET], 0b1);
        assert_eq!(buf[BLOCK_BITMAP_OFFSET + 31], 0b1000_0000);
        assert_eq!(Superblock::decode(&buf), sb);
    }

    #[test]
    fn inode_location_spans_table_blocks() {
        assert_eq!(inode_location(ROOT_INO), (INODE_TABLE_BLOCK, 0));
        assert_eq!(inode_location(33), (INODE_TABLE_BLOCK + 1, 0));
        assert_eq!(inode_location(MAX_INODES), (INODE_TABLE_BLOCK + 1, 31 * INODE_SIZE));
    }

    #[test]
    fn pre_epoch_times_round_trip_through_system_time() {
        let t = Timespec { secs: -2, nsecs: 500 };
        assert_eq!(Timespec::from(t.to_system_time()), t);
    }

    #[test]
    fn blocks_for_rounds_up() {
        assert_eq!(blocks_for(0), 0);
        assert_eq!(blocks_for(1), 1);
        assert_eq!(blocks_for(BLOCK_SIZE as u64), 1);
        assert_eq!(blocks_for(BLOCK_SIZE as u64 * 3 + 1), 4);
    }
}
