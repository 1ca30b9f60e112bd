//! A mounted runfs instance.
//!
//! Lock order, outermost first: a file's I/O lock, the allocation lock
//! (`sb`), an inode record lock, the buffer cache. The reference-count map is
//! innermost: nothing else is locked while it is held. Every namespace mutation holds
//! the allocation lock from its first check to its last write, so it either
//! completes or leaves nothing behind.

use std::borrow::Cow;
use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::alloc;
use crate::buffer::BufferCache;
use crate::device::BlockDevice;
use crate::dir::{self, Entries};
use crate::error::{FsError, Result};
use crate::extent::{self, Extent, Mapping};
use crate::layout::{
    blocks_for, DirEntry, Inode, Superblock, Timespec, BLOCK_SIZE, IMAGE_BLOCKS, MAGIC,
    MAX_DATA_BLOCKS, MAX_INODES, MAX_NAME_LEN, NO_EXTENT, PERM_MASK, ROOT_INO, S_IFDIR, S_IFMT,
    SUPERBLOCK_BLOCK,
};
use crate::node::{InodeTable, NodeKind, Owner, Stat};

/// Fail instead of replacing an existing destination.
pub const RENAME_NOREPLACE: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u32,
    pub blocks: u64,
    pub free_blocks: u64,
    pub inodes: u64,
    pub free_inodes: u64,
    pub name_max: u32,
}

/// Attribute changes; `None` leaves a field alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub perm: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<Timespec>,
    pub mtime: Option<Timespec>,
}

fn show(name: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(name)
}

pub struct Runfs<D: BlockDevice> {
    cache: BufferCache<D>,
    /// The allocation lock. Its guard is the only way to reach the bitmaps.
    sb: Mutex<Superblock>,
    inodes: InodeTable,
    /// In-memory references per inode (open handles, kernel lookups).
    refs: Mutex<HashMap<u64, u64>>,
}

impl<D: BlockDevice> Runfs<D> {
    /* ---------------- MOUNT ---------------- */

    /// Loads the superblock, inode table and root. Nothing is kept on failure.
    pub fn mount(dev: D) -> Result<Self> {
        if dev.block_count() < IMAGE_BLOCKS {
            return Err(FsError::InvalidFilesystem(format!(
                "device has {} blocks, image needs {IMAGE_BLOCKS}",
                dev.block_count()
            )));
        }
        let cache = BufferCache::new(dev);
        let sb = Superblock::decode(&cache.read_block(SUPERBLOCK_BLOCK)?);
        if sb.magic != MAGIC {
            return Err(FsError::InvalidFilesystem(format!(
                "bad magic {:#x}",
                sb.magic
            )));
        }

        let inodes = InodeTable::load(&cache)?;
        let root = inodes
            .live(ROOT_INO)
            .map_err(|_| FsError::InvalidFilesystem("root inode is empty".into()))?;
        if !root.is_dir() || !alloc::is_inode_allocated(&sb, ROOT_INO) {
            return Err(FsError::InvalidFilesystem(
                "root inode is not an allocated directory".into(),
            ));
        }

        info!(
            used_inodes = sb.inodes.count_set(),
            used_blocks = sb.blocks.count_set(),
            "runfs mounted"
        );
        Ok(Self {
            cache,
            sb: Mutex::new(sb),
            inodes,
            refs: Mutex::new(HashMap::new()),
        })
    }

    /// Reclaims unlinked nodes, flushes everything and hands the device back.
    pub fn unmount(self) -> Result<D> {
        self.release_all()?;
        self.sync()?;
        self.cache.release_clean();
        info!("runfs unmounted");
        Ok(self.cache.into_device())
    }

    pub fn root(&self) -> u64 {
        ROOT_INO
    }

    pub fn device(&self) -> &D {
        self.cache.device()
    }

    /// Copy of the current superblock, bitmaps included.
    pub fn superblock(&self) -> Superblock {
        self.sb.lock().clone()
    }

    fn store_superblock(&self, sb: &Superblock) -> Result<()> {
        self.cache.write_block(SUPERBLOCK_BLOCK, &sb.encode())
    }

    /// Record and data block of a live directory.
    fn dir_of(&self, ino: u64) -> Result<(Inode, u64)> {
        let inode = self.inodes.live(ino)?;
        match NodeKind::from_mode(inode.mode) {
            Some(NodeKind::Directory) => Ok((inode, inode.extent_start)),
            _ => Err(FsError::NotDirectory),
        }
    }

    fn kind_of(&self, ino: u64) -> Result<NodeKind> {
        let inode = self.inodes.live(ino)?;
        NodeKind::from_mode(inode.mode).ok_or(FsError::StaleInode(ino))
    }

    /* ---------------- LOOKUP ---------------- */

    pub fn stat(&self, ino: u64) -> Result<Stat> {
        Stat::from_inode(ino, &self.inodes.live(ino)?)
    }

    pub fn lookup(&self, dir: u64, name: &[u8]) -> Result<Stat> {
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        let (_, block) = self.dir_of(dir)?;
        let buf = self.cache.read_block(block)?;
        let (_, entry) = dir::find(&buf, name)?;
        self.stat(entry.ino)
    }

    /// Stored entries of `dir` starting at slot `cursor`.
    pub fn iterate(&self, dir: u64, cursor: usize) -> Result<Entries<Vec<u8>>> {
        let (_, block) = self.dir_of(dir)?;
        Ok(dir::list(self.cache.read_block(block)?, cursor))
    }

    pub fn statfs(&self) -> FsStats {
        let sb = self.sb.lock();
        FsStats {
            block_size: BLOCK_SIZE as u32,
            blocks: MAX_DATA_BLOCKS,
            free_blocks: MAX_DATA_BLOCKS - sb.blocks.count_set() as u64,
            inodes: MAX_INODES,
            free_inodes: MAX_INODES - sb.inodes.count_set() as u64,
            name_max: MAX_NAME_LEN as u32,
        }
    }

    /* ---------------- NAMESPACE ---------------- */

    /// Creates a node in `dir`. Type bits in `mode` pick the kind (regular
    /// file when absent); permission bits are stored as given.
    pub fn create(&self, dir: u64, name: &[u8], mode: u32, owner: Owner) -> Result<Stat> {
        let kind = NodeKind::from_mode(mode).unwrap_or(NodeKind::File);
        dir::validate_name(name)?;

        let mut sb = self.sb.lock();
        let (parent, dblock) = self.dir_of(dir)?;
        if parent.nlink == 0 {
            return Err(FsError::NotFound);
        }
        let slot = dir::free_slot(&self.cache.read_block(dblock)?).ok_or(FsError::NoSpace)?;

        let ino = alloc::allocate_inode(&mut sb)?;
        let data = match kind {
            NodeKind::Directory => {
                let block = match alloc::allocate_block(&mut sb) {
                    Ok(b) => b,
                    Err(e) => {
                        alloc::free_inode(&mut sb, ino);
                        return Err(e);
                    }
                };
                if let Err(e) = self.cache.write_block(block, &vec![0u8; BLOCK_SIZE]) {
                    alloc::free_blocks(&mut sb, block, 1);
                    alloc::free_inode(&mut sb, ino);
                    return Err(e);
                }
                Some(block)
            }
            NodeKind::File => None,
        };

        let now = Timespec::now();
        let record = Inode {
            mode: kind.type_bits() | (mode & PERM_MASK),
            nlink: match kind {
                NodeKind::Directory => 2,
                NodeKind::File => 1,
            },
            size: if data.is_some() { BLOCK_SIZE as u64 } else { 0 },
            block_count: u64::from(data.is_some()),
            extent_start: data.unwrap_or(NO_EXTENT),
            uid: owner.uid,
            gid: owner.gid,
            atime: now,
            mtime: now,
            ctime: now,
        };
        self.inodes.update(ino, |i| *i = record)?;

        let entry = DirEntry::new(ino, name);
        if let Err(e) = self
            .cache
            .modify(dblock, |b| dir::write_slot(b, slot, &entry))
        {
            self.inodes.update(ino, |i| *i = Inode::empty())?;
            if let Some(block) = data {
                alloc::free_blocks(&mut sb, block, 1);
            }
            alloc::free_inode(&mut sb, ino);
            return Err(e);
        }

        self.inodes.update(dir, |p| {
            if kind == NodeKind::Directory {
                p.nlink += 1;
            }
            p.mtime = now;
            p.ctime = now;
        })?;
        self.store_superblock(&sb)?;
        drop(sb);

        debug!(parent = dir, ino, name = %show(name), ?kind, "created");
        Stat::from_inode(ino, &record)
    }

    pub fn mkdir(&self, dir: u64, name: &[u8], mode: u32, owner: Owner) -> Result<Stat> {
        self.create(dir, name, S_IFDIR | (mode & PERM_MASK), owner)
    }

    /// Clears `slot` and drops one link of `ino`. Allocation lock held.
    fn drop_entry(&self, dir: u64, dblock: u64, slot: usize, ino: u64, now: Timespec) -> Result<()> {
        self.cache
            .modify(dblock, |b| dir::write_slot(b, slot, &DirEntry::empty()))?;
        self.inodes.update(ino, |i| {
            i.nlink = i.nlink.saturating_sub(1);
            i.ctime = now;
        })?;
        self.inodes.update(dir, |d| {
            d.mtime = now;
            d.ctime = now;
        })
    }

    /// `drop_entry` plus the child's self link and the parent's back link.
    fn drop_dir_entry(
        &self,
        dir: u64,
        dblock: u64,
        slot: usize,
        ino: u64,
        now: Timespec,
    ) -> Result<()> {
        self.drop_entry(dir, dblock, slot, ino, now)?;
        self.inodes
            .update(ino, |i| i.nlink = i.nlink.saturating_sub(1))?;
        self.inodes
            .update(dir, |d| d.nlink = d.nlink.saturating_sub(1))
    }

    pub fn unlink(&self, dir: u64, name: &[u8]) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        let guard = self.sb.lock();
        let (_, dblock) = self.dir_of(dir)?;
        let (slot, entry) = dir::find(&self.cache.read_block(dblock)?, name)?;
        match self.kind_of(entry.ino)? {
            NodeKind::Directory => return Err(FsError::IsDirectory),
            NodeKind::File => {}
        }
        self.drop_entry(dir, dblock, slot, entry.ino, Timespec::now())?;
        drop(guard);

        debug!(parent = dir, ino = entry.ino, name = %show(name), "unlinked");
        self.reclaim_if_unused(entry.ino)
    }

    pub fn rmdir(&self, dir: u64, name: &[u8]) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        let guard = self.sb.lock();
        let (_, dblock) = self.dir_of(dir)?;
        let (slot, entry) = dir::find(&self.cache.read_block(dblock)?, name)?;
        let (_, child_block) = self.dir_of(entry.ino)?;
        if !dir::is_empty(&self.cache.read_block(child_block)?) {
            return Err(FsError::NotEmpty);
        }
        self.drop_dir_entry(dir, dblock, slot, entry.ino, Timespec::now())?;
        drop(guard);

        debug!(parent = dir, ino = entry.ino, name = %show(name), "directory removed");
        self.reclaim_if_unused(entry.ino)
    }

    /// Moves `old_name` in `old_dir` to `new_name` in `new_dir`, replacing a
    /// compatible destination unless `RENAME_NOREPLACE` is given. No other
    /// flag is supported.
    pub fn rename(
        &self,
        old_dir: u64,
        old_name: &[u8],
        new_dir: u64,
        new_name: &[u8],
        flags: u32,
    ) -> Result<()> {
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(FsError::InvalidArgument("unsupported rename flags"));
        }
        dir::validate_name(new_name)?;

        let guard = self.sb.lock();
        let (_, old_block) = self.dir_of(old_dir)?;
        let (new_parent, new_block) = self.dir_of(new_dir)?;
        if old_dir == new_dir && old_name == new_name {
            dir::find(&self.cache.read_block(old_block)?, old_name)?;
            return Ok(());
        }
        if new_parent.nlink == 0 {
            return Err(FsError::NotFound);
        }

        let new_buf = self.cache.read_block(new_block)?;
        let free = dir::free_slot(&new_buf).ok_or(FsError::NoSpace)?;
        let (old_slot, moved) = dir::find(&self.cache.read_block(old_block)?, old_name)?;
        let moved_kind = self.kind_of(moved.ino)?;
        let now = Timespec::now();

        let mut replaced = None;
        if let Ok((slot, target)) = dir::find(&new_buf, new_name) {
            if flags & RENAME_NOREPLACE != 0 {
                return Err(FsError::Exists);
            }
            if target.ino == moved.ino {
                return Ok(());
            }
            match (moved_kind, self.kind_of(target.ino)?) {
                (NodeKind::Directory, NodeKind::Directory) => {
                    let (_, tblock) = self.dir_of(target.ino)?;
                    if !dir::is_empty(&self.cache.read_block(tblock)?) {
                        return Err(FsError::NotEmpty);
                    }
                    self.drop_dir_entry(new_dir, new_block, slot, target.ino, now)?;
                }
                (NodeKind::File, NodeKind::File) => {
                    self.drop_entry(new_dir, new_block, slot, target.ino, now)?;
                }
                (NodeKind::File, NodeKind::Directory) => return Err(FsError::IsDirectory),
                (NodeKind::Directory, NodeKind::File) => return Err(FsError::NotDirectory),
            }
            replaced = Some(target.ino);
        }

        if moved_kind == NodeKind::Directory {
            self.inodes
                .update(old_dir, |d| d.nlink = d.nlink.saturating_sub(1))?;
            self.inodes.update(new_dir, |d| d.nlink += 1)?;
        }

        let entry = DirEntry::new(moved.ino, new_name);
        self.cache
            .modify(new_block, |b| dir::write_slot(b, free, &entry))?;
        self.cache
            .modify(old_block, |b| dir::write_slot(b, old_slot, &DirEntry::empty()))?;

        for parent in [old_dir, new_dir] {
            self.inodes.update(parent, |d| {
                d.mtime = now;
                d.ctime = now;
            })?;
        }
        self.inodes.update(moved.ino, |i| i.ctime = now)?;
        drop(guard);

        debug!(
            ino = moved.ino,
            from_dir = old_dir,
            from = %show(old_name),
            to_dir = new_dir,
            to = %show(new_name),
            replaced,
            "renamed"
        );
        match replaced {
            Some(ino) => self.reclaim_if_unused(ino),
            None => Ok(()),
        }
    }

    /* ---------------- BLOCK MAPPING ---------------- */

    /// Physical block behind logical block `logical` of `ino`.
    ///
    /// Inside the current extent this is a plain lookup. With `write_intent`
    /// the block just past the end is allocated, moving the extent if it
    /// cannot grow in place. Requests further out are rejected: files grow
    /// one block at a time.
    pub fn map_block(&self, ino: u64, logical: u64, write_intent: bool) -> Result<Mapping> {
        let inode = self.inodes.live(ino)?;
        if let Some(block) = Extent::of(&inode).lookup(logical) {
            return Ok(Mapping::Mapped {
                block,
                fresh: false,
            });
        }
        if !write_intent {
            return Ok(Mapping::Unmapped);
        }
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }

        let mut sb = self.sb.lock();
        // another writer may have grown the file while we waited
        let inode = self.inodes.live(ino)?;
        let ext = Extent::of(&inode);
        if let Some(block) = ext.lookup(logical) {
            return Ok(Mapping::Mapped {
                block,
                fresh: false,
            });
        }
        if logical != ext.len {
            return Err(FsError::InvalidArgument("growth must extend the last block"));
        }

        let (grown, block) = extent::grow(&mut sb, &self.cache, ext)?;
        self.inodes.update(ino, |i| {
            i.extent_start = grown.start;
            i.block_count = grown.len;
        })?;
        self.store_superblock(&sb)?;
        Ok(Mapping::Mapped { block, fresh: true })
    }

    /// Maps `logical` for writing, growing through any gap before it.
    fn map_for_write(&self, ino: u64, logical: u64) -> Result<u64> {
        loop {
            let count = self.inodes.live(ino)?.block_count;
            let next = logical.min(count);
            match self.map_block(ino, next, true)? {
                Mapping::Mapped { block, .. } if next == logical => return Ok(block),
                Mapping::Mapped { .. } => continue,
                Mapping::Unmapped => {
                    return Err(FsError::InvalidArgument("write mapping came back empty"))
                }
            }
        }
    }

    /// Releases blocks past the first `keep` ones.
    fn trim_blocks(&self, ino: u64, keep: u64) -> Result<()> {
        let mut sb = self.sb.lock();
        let inode = self.inodes.live(ino)?;
        let ext = Extent::of(&inode);
        if ext.len <= keep {
            return Ok(());
        }
        let kept = extent::shrink(&mut sb, ext, keep);
        for block in kept.start + kept.len..ext.start + ext.len {
            self.cache.forget(block);
        }
        self.inodes.update(ino, |i| {
            i.block_count = kept.len;
            if kept.len == 0 {
                i.extent_start = NO_EXTENT;
            }
        })?;
        self.store_superblock(&sb)
    }

    /* ---------------- FILE DATA ---------------- */

    pub fn read(&self, ino: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let _io = self.inodes.io_lock(ino)?.read();
        let inode = self.inodes.live(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if offset >= inode.size {
            return Ok(Vec::new());
        }

        let end = inode.size.min(offset.saturating_add(len as u64));
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let inside = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - inside).min((end - pos) as usize);
            match self.map_block(ino, pos / BLOCK_SIZE as u64, false)? {
                Mapping::Mapped { block, .. } => {
                    let data = self.cache.read_block(block)?;
                    out.extend_from_slice(&data[inside..inside + n]);
                }
                Mapping::Unmapped => out.resize(out.len() + n, 0),
            }
            pos += n as u64;
        }
        Ok(out)
    }

    /// Writes `data` at `offset`, growing the file as needed. When space runs
    /// out part way, the bytes that fit stay written and their count is
    /// returned; the error is only reported when nothing could be written.
    pub fn write(&self, ino: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let _io = self.inodes.io_lock(ino)?.write();
        let inode = self.inodes.live(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        let mut failure = None;
        while written < data.len() {
            let pos = offset + written as u64;
            let inside = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - inside).min(data.len() - written);
            let block = match self.map_for_write(ino, pos / BLOCK_SIZE as u64) {
                Ok(b) => b,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let chunk = &data[written..written + n];
            if let Err(e) = self
                .cache
                .modify(block, |b| b[inside..inside + n].copy_from_slice(chunk))
            {
                failure = Some(e);
                break;
            }
            written += n;
        }

        let now = Timespec::now();
        let end = offset + written as u64;
        let size = self.inodes.update(ino, |i| {
            if written > 0 {
                i.size = i.size.max(end);
                i.mtime = now;
                i.ctime = now;
            }
            i.size
        })?;
        // blocks grown for a gap that never got data
        self.trim_blocks(ino, blocks_for(size))?;

        match failure {
            Some(e) if written == 0 => Err(e),
            _ => Ok(written),
        }
    }

    /// Sets the byte size. Shrinking frees the tail blocks in place; growing
    /// allocates zeroed blocks.
    pub fn truncate(&self, ino: u64, new_size: u64) -> Result<()> {
        let _io = self.inodes.io_lock(ino)?.write();
        let inode = self.inodes.live(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        let now = Timespec::now();

        if new_size < inode.size {
            let keep = blocks_for(new_size);
            let tail = (new_size % BLOCK_SIZE as u64) as usize;
            if tail != 0 {
                if let Some(block) = Extent::of(&inode).lookup(keep - 1) {
                    self.cache.modify(block, |b| b[tail..].fill(0))?;
                }
            }
            self.inodes.update(ino, |i| {
                i.size = new_size;
                i.mtime = now;
                i.ctime = now;
            })?;
            self.trim_blocks(ino, keep)?;
        } else if new_size > inode.size {
            for logical in inode.block_count..blocks_for(new_size) {
                if let Err(e) = self.map_for_write(ino, logical) {
                    self.trim_blocks(ino, blocks_for(inode.size))?;
                    return Err(e);
                }
            }
            self.inodes.update(ino, |i| {
                i.size = new_size;
                i.mtime = now;
                i.ctime = now;
            })?;
        }
        debug!(ino, from = inode.size, to = new_size, "truncated");
        Ok(())
    }

    pub fn set_attr(&self, ino: u64, attr: SetAttr) -> Result<Stat> {
        self.inodes.live(ino)?;
        if let Some(size) = attr.size {
            self.truncate(ino, size)?;
        }
        let now = Timespec::now();
        self.inodes.update(ino, |i| {
            if let Some(perm) = attr.perm {
                i.mode = (i.mode & S_IFMT) | (perm & PERM_MASK);
            }
            if let Some(uid) = attr.uid {
                i.uid = uid;
            }
            if let Some(gid) = attr.gid {
                i.gid = gid;
            }
            if let Some(atime) = attr.atime {
                i.atime = atime;
            }
            if let Some(mtime) = attr.mtime {
                i.mtime = mtime;
            }
            i.ctime = now;
        })?;
        self.stat(ino)
    }

    /* ---------------- LIFECYCLE ---------------- */

    /// Takes an in-memory reference on `ino`.
    pub fn get(&self, ino: u64) -> Result<Stat> {
        // eviction checks the map under the same lock
        let _sb = self.sb.lock();
        let stat = self.stat(ino)?;
        *self.refs.lock().entry(ino).or_insert(0) += 1;
        Ok(stat)
    }

    /// Drops `n` references; the last one evicts the node.
    pub fn put(&self, ino: u64, n: u64) -> Result<()> {
        let last = {
            let mut refs = self.refs.lock();
            match refs.get_mut(&ino) {
                Some(count) if *count > n => {
                    *count -= n;
                    false
                }
                Some(_) => {
                    refs.remove(&ino);
                    true
                }
                None => false,
            }
        };
        if last {
            self.evict(ino)?;
        }
        Ok(())
    }

    pub fn ref_count(&self, ino: u64) -> u64 {
        self.refs.lock().get(&ino).copied().unwrap_or(0)
    }

    fn reclaim_if_unused(&self, ino: u64) -> Result<()> {
        self.evict(ino).map(|_| ())
    }

    /// Drops every outstanding reference, reclaiming the nodes that were
    /// unlinked while still in use. Returns how many were reclaimed.
    pub fn release_all(&self) -> Result<usize> {
        let held: Vec<u64> = self.refs.lock().drain().map(|(ino, _)| ino).collect();
        let mut reclaimed = 0;
        for ino in held {
            if self.evict(ino)? {
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, "released unlinked nodes");
        }
        Ok(reclaimed)
    }

    /// Reclaims `ino` if it has no links and no references left. Returns
    /// whether it did.
    fn evict(&self, ino: u64) -> Result<bool> {
        let mut sb = self.sb.lock();
        if self.refs.lock().contains_key(&ino) {
            return Ok(false);
        }
        let inode = self.inodes.get(ino)?;
        if inode.nlink != 0
            || NodeKind::from_mode(inode.mode).is_none()
            || !alloc::is_inode_allocated(&sb, ino)
        {
            return Ok(false);
        }

        let ext = Extent::of(&inode);
        for block in ext.blocks() {
            self.cache.forget(block);
        }
        if ext.len > 0 {
            alloc::free_blocks(&mut sb, ext.start, ext.len);
        }
        alloc::free_inode(&mut sb, ino);
        self.inodes.update(ino, |i| *i = Inode::empty())?;
        self.store_superblock(&sb)?;

        debug!(ino, start = ext.start, blocks = ext.len, "inode reclaimed");
        Ok(true)
    }

    /* ---------------- SYNC ---------------- */

    /// Copies one inode record into its table buffer.
    pub fn sync_inode(&self, ino: u64) -> Result<()> {
        self.inodes.write_back(&self.cache, ino)
    }

    /// Writes the superblock, dirty inode records and dirty buffers to the
    /// device.
    pub fn sync(&self) -> Result<()> {
        {
            let sb = self.sb.lock();
            self.store_superblock(&sb)?;
        }
        let records = self.inodes.write_back_dirty(&self.cache)?;
        self.cache.flush()?;
        debug!(records, "synced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::layout::DATA_START_BLOCK;
    use crate::mkfs::{format, FormatOptions};

    fn fresh() -> Runfs<MemBlockDevice> {
        let dev = MemBlockDevice::new(IMAGE_BLOCKS);
        format(&dev, &FormatOptions::default()).unwrap();
        Runfs::mount(dev).unwrap()
    }

    const ME: Owner = Owner { uid: 1000, gid: 100 };

    #[test]
    fn create_in_empty_root() {
        let fs = fresh();
        let st = fs.create(ROOT_INO, b"a.txt", 0o644, ME).unwrap();
        assert_eq!((st.kind, st.nlink, st.size, st.blocks), (NodeKind::File, 1, 0, 0));
        assert_eq!((st.uid, st.gid, st.perm), (1000, 100, 0o644));
        assert_eq!(st.extent_start, NO_EXTENT);

        let entries: Vec<_> = fs.iterate(ROOT_INO, 0).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ino, st.ino);
        assert_eq!(fs.lookup(ROOT_INO, b"a.txt").unwrap().ino, st.ino);
        assert_eq!(fs.stat(ROOT_INO).unwrap().nlink, 2);
    }

    #[test]
    fn mkdir_takes_a_zeroed_block_and_links_parent() {
        let fs = fresh();
        let d = fs.mkdir(ROOT_INO, b"sub", 0o755, ME).unwrap();
        assert_eq!((d.kind, d.nlink, d.blocks), (NodeKind::Directory, 2, 1));
        assert_eq!(d.size, BLOCK_SIZE as u64);
        assert_eq!(d.extent_start, DATA_START_BLOCK + 1);
        assert_eq!(fs.stat(ROOT_INO).unwrap().nlink, 3);
        assert_eq!(fs.iterate(d.ino, 0).unwrap().count(), 0);
    }

    #[test]
    fn create_rolls_back_when_no_block_is_left() {
        let fs = fresh();
        {
            let mut sb = fs.sb.lock();
            alloc::claim_blocks(&mut sb, DATA_START_BLOCK, MAX_DATA_BLOCKS);
        }
        let before = fs.superblock();
        assert!(matches!(
            fs.mkdir(ROOT_INO, b"d", 0o755, ME),
            Err(FsError::NoSpace)
        ));
        assert_eq!(fs.superblock(), before);
        assert_eq!(fs.iterate(ROOT_INO, 0).unwrap().count(), 0);
        assert_eq!(fs.stat(ROOT_INO).unwrap().nlink, 2);
    }

    #[test]
    fn create_checks_names_before_allocating() {
        let fs = fresh();
        let long = vec![b'x'; MAX_NAME_LEN + 1];
        let before = fs.superblock();
        assert!(matches!(
            fs.create(ROOT_INO, &long, 0o644, ME),
            Err(FsError::NameTooLong)
        ));
        assert_eq!(fs.superblock(), before);
    }

    #[test]
    fn create_under_a_file_is_not_a_directory() {
        let fs = fresh();
        let f = fs.create(ROOT_INO, b"f", 0o644, ME).unwrap();
        assert!(matches!(
            fs.create(f.ino, b"x", 0o644, ME),
            Err(FsError::NotDirectory)
        ));
    }

    #[test]
    fn unlink_reclaims_an_unreferenced_file() {
        let fs = fresh();
        let f = fs.create(ROOT_INO, b"f", 0o644, ME).unwrap();
        fs.write(f.ino, 0, &[1u8; 5000]).unwrap();
        assert_eq!(fs.superblock().blocks.count_set(), 3);

        fs.unlink(ROOT_INO, b"f").unwrap();
        let sb = fs.superblock();
        assert_eq!(sb.blocks.count_set(), 1);
        assert!(!alloc::is_inode_allocated(&sb, f.ino));
        assert!(matches!(fs.stat(f.ino), Err(FsError::StaleInode(_))));
    }

    #[test]
    fn evict_leaves_a_held_node_alone() {
        let fs = fresh();
        let f = fs.create(ROOT_INO, b"f", 0o644, ME).unwrap();
        fs.get(f.ino).unwrap();
        fs.unlink(ROOT_INO, b"f").unwrap();

        assert!(!fs.evict(f.ino).unwrap());
        assert!(alloc::is_inode_allocated(&fs.superblock(), f.ino));
        assert_eq!(fs.ref_count(f.ino), 1);

        fs.put(f.ino, 1).unwrap();
        assert!(!alloc::is_inode_allocated(&fs.superblock(), f.ino));
    }

    #[test]
    fn release_all_reclaims_only_unlinked_nodes() {
        let fs = fresh();
        let gone = fs.create(ROOT_INO, b"gone", 0o644, ME).unwrap();
        let kept = fs.create(ROOT_INO, b"kept", 0o644, ME).unwrap();
        fs.get(gone.ino).unwrap();
        fs.get(gone.ino).unwrap();
        fs.get(kept.ino).unwrap();
        fs.write(gone.ino, 0, &[7u8; 9000]).unwrap();
        fs.unlink(ROOT_INO, b"gone").unwrap();

        assert_eq!(fs.release_all().unwrap(), 1);
        let sb = fs.superblock();
        assert!(!alloc::is_inode_allocated(&sb, gone.ino));
        assert!(alloc::is_inode_allocated(&sb, kept.ino));
        assert_eq!(sb.blocks.count_set(), 1);
        assert_eq!((fs.ref_count(gone.ino), fs.ref_count(kept.ino)), (0, 0));
        assert_eq!(fs.release_all().unwrap(), 0);
    }

    #[test]
    fn unlink_defers_reclaim_while_referenced() {
        let fs = fresh();
        let f = fs.create(ROOT_INO, b"f", 0o644, ME).unwrap();
        fs.get(f.ino).unwrap();
        fs.write(f.ino, 0, b"still open").unwrap();
        fs.unlink(ROOT_INO, b"f").unwrap();

        assert_eq!(fs.stat(f.ino).unwrap().nlink, 0);
        assert_eq!(fs.read(f.ino, 0, 64).unwrap(), b"still open");
        assert!(alloc::is_inode_allocated(&fs.superblock(), f.ino));

        fs.put(f.ino, 1).unwrap();
        assert!(!alloc::is_inode_allocated(&fs.superblock(), f.ino));
        assert_eq!(fs.superblock().blocks.count_set(), 1);
    }

    #[test]
    fn put_keeps_linked_nodes() {
        let fs = fresh();
        let f = fs.create(ROOT_INO, b"f", 0o644, ME).unwrap();
        fs.get(f.ino).unwrap();
        fs.get(f.ino).unwrap();
        fs.put(f.ino, 2).unwrap();
        assert_eq!(fs.ref_count(f.ino), 0);
        assert_eq!(fs.stat(f.ino).unwrap().nlink, 1);
    }

    #[test]
    fn unlink_and_rmdir_check_the_kind() {
        let fs = fresh();
        fs.mkdir(ROOT_INO, b"d", 0o755, ME).unwrap();
        fs.create(ROOT_INO, b"f", 0o644, ME).unwrap();
        assert!(matches!(fs.unlink(ROOT_INO, b"d"), Err(FsError::IsDirectory)));
        assert!(matches!(fs.rmdir(ROOT_INO, b"f"), Err(FsError::NotDirectory)));
        assert!(matches!(fs.unlink(ROOT_INO, b"nope"), Err(FsError::NotFound)));
    }

    #[test]
    fn rmdir_needs_an_empty_directory() {
        let fs = fresh();
        let d = fs.mkdir(ROOT_INO, b"d", 0o755, ME).unwrap();
        fs.create(d.ino, b"inner", 0o644, ME).unwrap();

        assert!(matches!(fs.rmdir(ROOT_INO, b"d"), Err(FsError::NotEmpty)));
        assert_eq!(fs.stat(ROOT_INO).unwrap().nlink, 3);

        fs.unlink(d.ino, b"inner").unwrap();
        fs.get(d.ino).unwrap();
        fs.rmdir(ROOT_INO, b"d").unwrap();
        assert_eq!(fs.stat(d.ino).unwrap().nlink, 0);
        assert_eq!(fs.stat(ROOT_INO).unwrap().nlink, 2);

        fs.put(d.ino, 1).unwrap();
        assert_eq!(fs.superblock().blocks.count_set(), 1);
        assert_eq!(fs.superblock().inodes.count_set(), 1);
    }

    #[test]
    fn rename_rejects_exchange_and_long_names() {
        let fs = fresh();
        fs.create(ROOT_INO, b"a", 0o644, ME).unwrap();
        assert!(matches!(
            fs.rename(ROOT_INO, b"a", ROOT_INO, b"b", 1 << 1),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.rename(ROOT_INO, b"a", ROOT_INO, &[b'n'; MAX_NAME_LEN + 1], 0),
            Err(FsError::NameTooLong)
        ));
        assert!(fs.lookup(ROOT_INO, b"a").is_ok());
    }

    #[test]
    fn rename_within_a_directory_keeps_the_inode() {
        let fs = fresh();
        let a = fs.create(ROOT_INO, b"a", 0o644, ME).unwrap();
        fs.rename(ROOT_INO, b"a", ROOT_INO, b"b", 0).unwrap();
        assert!(matches!(fs.lookup(ROOT_INO, b"a"), Err(FsError::NotFound)));
        assert_eq!(fs.lookup(ROOT_INO, b"b").unwrap().ino, a.ino);
        assert_eq!(fs.iterate(ROOT_INO, 0).unwrap().count(), 1);

        fs.rename(ROOT_INO, b"b", ROOT_INO, b"b", 0).unwrap();
        assert_eq!(fs.lookup(ROOT_INO, b"b").unwrap().nlink, 1);
    }

    #[test]
    fn rename_replaces_a_file() {
        let fs = fresh();
        let a = fs.create(ROOT_INO, b"a", 0o644, ME).unwrap();
        let b = fs.create(ROOT_INO, b"b", 0o644, ME).unwrap();
        fs.write(b.ino, 0, b"old").unwrap();

        assert!(matches!(
            fs.rename(ROOT_INO, b"a", ROOT_INO, b"b", RENAME_NOREPLACE),
            Err(FsError::Exists)
        ));
        fs.rename(ROOT_INO, b"a", ROOT_INO, b"b", 0).unwrap();
        assert_eq!(fs.lookup(ROOT_INO, b"b").unwrap().ino, a.ino);
        assert!(!alloc::is_inode_allocated(&fs.superblock(), b.ino));
        assert_eq!(fs.superblock().blocks.count_set(), 1);
    }

    #[test]
    fn rename_directory_moves_parent_links() {
        let fs = fresh();
        let x = fs.mkdir(ROOT_INO, b"x", 0o755, ME).unwrap();
        let y = fs.mkdir(ROOT_INO, b"y", 0o755, ME).unwrap();
        let d = fs.mkdir(x.ino, b"d", 0o755, ME).unwrap();
        assert_eq!(fs.stat(x.ino).unwrap().nlink, 3);

        fs.rename(x.ino, b"d", y.ino, b"d", 0).unwrap();
        assert_eq!(fs.stat(x.ino).unwrap().nlink, 2);
        assert_eq!(fs.stat(y.ino).unwrap().nlink, 3);
        assert_eq!(fs.stat(d.ino).unwrap().nlink, 2);
        assert_eq!(fs.lookup(y.ino, b"d").unwrap().ino, d.ino);
    }

    #[test]
    fn rename_over_directories() {
        let fs = fresh();
        let src = fs.mkdir(ROOT_INO, b"src", 0o755, ME).unwrap();
        let full = fs.mkdir(ROOT_INO, b"full", 0o755, ME).unwrap();
        let empty = fs.mkdir(ROOT_INO, b"empty", 0o755, ME).unwrap();
        fs.create(full.ino, b"f", 0o644, ME).unwrap();
        fs.create(ROOT_INO, b"file", 0o644, ME).unwrap();

        assert!(matches!(
            fs.rename(ROOT_INO, b"src", ROOT_INO, b"full", 0),
            Err(FsError::NotEmpty)
        ));
        assert!(matches!(
            fs.rename(ROOT_INO, b"file", ROOT_INO, b"empty", 0),
            Err(FsError::IsDirectory)
        ));
        assert!(matches!(
            fs.rename(ROOT_INO, b"src", ROOT_INO, b"file", 0),
            Err(FsError::NotDirectory)
        ));

        // root: 2 + src + full + empty
        assert_eq!(fs.stat(ROOT_INO).unwrap().nlink, 5);
        fs.rename(ROOT_INO, b"src", ROOT_INO, b"empty", 0).unwrap();
        assert_eq!(fs.lookup(ROOT_INO, b"empty").unwrap().ino, src.ino);
        assert_eq!(fs.stat(ROOT_INO).unwrap().nlink, 4);
        assert!(!alloc::is_inode_allocated(&fs.superblock(), empty.ino));
    }

    #[test]
    fn rename_needs_a_free_destination_slot_up_front() {
        let fs = fresh();
        let d = fs.mkdir(ROOT_INO, b"d", 0o755, ME).unwrap();
        for i in 0..crate::layout::MAX_CHILDREN {
            fs.create(d.ino, format!("f{i}").as_bytes(), 0o644, ME).unwrap();
        }
        fs.create(ROOT_INO, b"mv", 0o644, ME).unwrap();
        assert!(matches!(
            fs.rename(ROOT_INO, b"mv", d.ino, b"f0", 0),
            Err(FsError::NoSpace)
        ));
        assert!(fs.lookup(ROOT_INO, b"mv").is_ok());
        assert!(fs.lookup(d.ino, b"f0").is_ok());
    }

    #[test]
    fn map_block_is_idempotent_once_allocated() {
        let fs = fresh();
        let f = fs.create(ROOT_INO, b"f", 0o644, ME).unwrap();
        assert_eq!(fs.map_block(f.ino, 0, false).unwrap(), Mapping::Unmapped);

        let first = fs.map_block(f.ino, 0, true).unwrap();
        let Mapping::Mapped { block, fresh: true } = first else {
            panic!("expected a fresh block, got {first:?}");
        };
        let sb = fs.superblock();
        assert_eq!(
            fs.map_block(f.ino, 0, true).unwrap(),
            Mapping::Mapped { block, fresh: false }
        );
        assert_eq!(fs.superblock(), sb);
        assert!(matches!(
            fs.map_block(f.ino, 5, true),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn directories_never_grow() {
        let fs = fresh();
        assert!(matches!(
            fs.map_block(ROOT_INO, 1, true),
            Err(FsError::IsDirectory)
        ));
        assert!(matches!(fs.write(ROOT_INO, 0, b"x"), Err(FsError::IsDirectory)));
    }

    #[test]
    fn truncate_shrinks_and_zero_fills() {
        let fs = fresh();
        let f = fs.create(ROOT_INO, b"f", 0o644, ME).unwrap();
        fs.write(f.ino, 0, &[7u8; 3 * BLOCK_SIZE]).unwrap();
        let start = fs.stat(f.ino).unwrap().extent_start;

        fs.truncate(f.ino, 10).unwrap();
        let st = fs.stat(f.ino).unwrap();
        assert_eq!((st.size, st.blocks, st.extent_start), (10, 1, start));
        assert_eq!(fs.superblock().blocks.count_set(), 2);

        fs.truncate(f.ino, 20).unwrap();
        let data = fs.read(f.ino, 0, 100).unwrap();
        assert_eq!(data.len(), 20);
        assert_eq!(&data[..10], &[7u8; 10]);
        assert_eq!(&data[10..], &[0u8; 10]);

        fs.truncate(f.ino, 2 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(fs.stat(f.ino).unwrap().blocks, 2);
        assert!(fs.read(f.ino, BLOCK_SIZE as u64, BLOCK_SIZE).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn sparse_write_fills_the_gap_with_zeros() {
        let fs = fresh();
        let f = fs.create(ROOT_INO, b"f", 0o644, ME).unwrap();
        let n = fs.write(f.ino, 2 * BLOCK_SIZE as u64 + 1, b"z").unwrap();
        assert_eq!(n, 1);
        let st = fs.stat(f.ino).unwrap();
        assert_eq!((st.size, st.blocks), (2 * BLOCK_SIZE as u64 + 2, 3));
        let data = fs.read(f.ino, 0, st.size as usize).unwrap();
        assert!(data[..data.len() - 1].iter().all(|b| *b == 0));
        assert_eq!(data[data.len() - 1], b'z');
    }

    #[test]
    fn set_attr_changes_only_what_is_asked() {
        let fs = fresh();
        let f = fs.create(ROOT_INO, b"f", 0o644, ME).unwrap();
        let st = fs
            .set_attr(
                f.ino,
                SetAttr {
                    perm: Some(0o600),
                    gid: Some(5),
                    mtime: Some(Timespec { secs: 100, nsecs: 0 }),
                    ..SetAttr::default()
                },
            )
            .unwrap();
        assert_eq!((st.kind, st.perm, st.uid, st.gid), (NodeKind::File, 0o600, 1000, 5));
        assert_eq!(st.mtime.secs, 100);
    }

    #[test]
    fn statfs_counts_free_space() {
        let fs = fresh();
        let before = fs.statfs();
        assert_eq!(before.free_blocks, MAX_DATA_BLOCKS - 1);
        assert_eq!(before.free_inodes, MAX_INODES - 1);
        fs.mkdir(ROOT_INO, b"d", 0o755, ME).unwrap();
        let after = fs.statfs();
        assert_eq!(after.free_blocks, before.free_blocks - 1);
        assert_eq!(after.free_inodes, before.free_inodes - 1);
    }
}
