//! In-memory inode arena and the node views handed to callers.
//!
//! The inode table is loaded whole at mount and kept as one slot per inode
//! number. Each slot carries its own short-lived record lock, so reading an
//! extent never needs the allocation lock: extent fields are only ever
//! rewritten together, under that slot's write lock, while the allocation lock
//! is held.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::buffer::BufferCache;
use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::layout::{
    inode_location, Inode, Timespec, INODE_SIZE, INODE_TABLE_BLOCK, INODE_TABLE_BLOCKS,
    INODES_PER_BLOCK, MAX_INODES, PERM_MASK, ROOT_INO, S_IFDIR, S_IFMT, S_IFREG,
};

/// What a node is; everything type-specific is chosen by matching on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::File),
            S_IFDIR => Some(Self::Directory),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            Self::File => S_IFREG,
            Self::Directory => S_IFDIR,
        }
    }
}

/// Caller identity stamped on new nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Attributes of a live node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub ino: u64,
    pub kind: NodeKind,
    pub perm: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u64,
    pub extent_start: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl Stat {
    pub fn from_inode(ino: u64, inode: &Inode) -> Result<Self> {
        let kind = NodeKind::from_mode(inode.mode).ok_or(FsError::StaleInode(ino))?;
        Ok(Self {
            ino,
            kind,
            perm: inode.mode & PERM_MASK,
            nlink: inode.nlink,
            size: inode.size,
            blocks: inode.block_count,
            extent_start: inode.extent_start,
            uid: inode.uid,
            gid: inode.gid,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        })
    }
}

#[derive(Debug)]
struct Slot {
    record: RwLock<Inode>,
    /// Serializes byte-level writers (and truncation) of one file against
    /// each other and against its readers.
    io: RwLock<()>,
    dirty: AtomicBool,
}

#[derive(Debug)]
pub struct InodeTable {
    slots: Vec<Slot>,
}

impl InodeTable {
    pub fn load<D: BlockDevice>(cache: &BufferCache<D>) -> Result<Self> {
        let mut slots = Vec::with_capacity(MAX_INODES as usize);
        for blk in 0..INODE_TABLE_BLOCKS {
            let buf = cache.read_block(INODE_TABLE_BLOCK + blk)?;
            for i in 0..INODES_PER_BLOCK {
                let off = i * INODE_SIZE;
                slots.push(Slot {
                    record: RwLock::new(Inode::decode(&buf[off..off + INODE_SIZE])),
                    io: RwLock::new(()),
                    dirty: AtomicBool::new(false),
                });
            }
        }
        Ok(Self { slots })
    }

    fn slot(&self, ino: u64) -> Result<&Slot> {
        if ino < ROOT_INO {
            return Err(FsError::StaleInode(ino));
        }
        self.slots
            .get((ino - ROOT_INO) as usize)
            .ok_or(FsError::StaleInode(ino))
    }

    /// Copy of the record for `ino`.
    pub fn get(&self, ino: u64) -> Result<Inode> {
        Ok(*self.slot(ino)?.record.read())
    }

    /// Copy of the record, failing when the slot holds no live node.
    pub fn live(&self, ino: u64) -> Result<Inode> {
        let inode = self.get(ino)?;
        if NodeKind::from_mode(inode.mode).is_none() {
            return Err(FsError::StaleInode(ino));
        }
        Ok(inode)
    }

    /// Mutates the record in place and marks it dirty.
    pub fn update<R>(&self, ino: u64, f: impl FnOnce(&mut Inode) -> R) -> Result<R> {
        let slot = self.slot(ino)?;
        let mut record = slot.record.write();
        let out = f(&mut *record);
        drop(record);
        slot.dirty.store(true, Ordering::Release);
        Ok(out)
    }

    pub fn io_lock(&self, ino: u64) -> Result<&RwLock<()>> {
        Ok(&self.slot(ino)?.io)
    }

    pub fn is_dirty(&self, ino: u64) -> bool {
        self.slot(ino)
            .map(|s| s.dirty.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Encodes the record into its inode-table buffer.
    pub fn write_back<D: BlockDevice>(&self, cache: &BufferCache<D>, ino: u64) -> Result<()> {
        let slot = self.slot(ino)?;
        slot.dirty.store(false, Ordering::Release);
        let inode = *slot.record.read();
        let (block, off) = inode_location(ino);
        if let Err(e) = cache.modify(block, |b| inode.encode_into(&mut b[off..off + INODE_SIZE])) {
            slot.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Writes back every dirty record. Returns how many were written.
    pub fn write_back_dirty<D: BlockDevice>(&self, cache: &BufferCache<D>) -> Result<usize> {
        let mut n = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.dirty.load(Ordering::Acquire) {
                self.write_back(cache, i as u64 + ROOT_INO)?;
                n += 1;
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::layout::{IMAGE_BLOCKS, NO_EXTENT};

    fn table() -> (BufferCache<MemBlockDevice>, InodeTable) {
        let cache = BufferCache::new(MemBlockDevice::new(IMAGE_BLOCKS));
        let table = InodeTable::load(&cache).unwrap();
        (cache, table)
    }

    #[test]
    fn empty_slots_are_not_live() {
        let (_, table) = table();
        assert!(matches!(table.live(ROOT_INO), Err(FsError::StaleInode(1))));
        assert!(matches!(table.get(0), Err(FsError::StaleInode(0))));
        assert!(matches!(
            table.get(MAX_INODES + 1),
            Err(FsError::StaleInode(_))
        ));
    }

    #[test]
    fn updates_are_written_back_to_the_table_block() {
        let (cache, table) = table();
        table
            .update(33, |i| {
                i.mode = S_IFREG | 0o600;
                i.nlink = 1;
                i.extent_start = NO_EXTENT;
            })
            .unwrap();
        assert!(table.is_dirty(33));
        assert_eq!(table.write_back_dirty(&cache).unwrap(), 1);
        assert!(!table.is_dirty(33));

        let reloaded = InodeTable::load(&cache).unwrap();
        let inode = reloaded.live(33).unwrap();
        assert_eq!(inode.mode, S_IFREG | 0o600);
        assert!(cache.is_dirty(INODE_TABLE_BLOCK + 1));
    }

    #[test]
    fn kind_comes_from_the_type_bits() {
        assert_eq!(NodeKind::from_mode(S_IFDIR | 0o755), Some(NodeKind::Directory));
        assert_eq!(NodeKind::from_mode(S_IFREG), Some(NodeKind::File));
        assert_eq!(NodeKind::from_mode(0o755), None);
        assert_eq!(NodeKind::Directory.type_bits(), S_IFDIR);
    }
}
