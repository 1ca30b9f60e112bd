//! FUSE host adapter: maps `fuser` callbacks onto a mounted [`Runfs`].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::c_int;
use tracing::{info, trace, warn};

use crate::device::BlockDevice;
use crate::error::FsError;
use crate::fs::{Runfs, SetAttr};
use crate::layout::{Timespec, BLOCK_SIZE, PERM_MASK, ROOT_INO, S_IFMT, S_IFREG};
use crate::node::{NodeKind, Owner, Stat};

// readdir offsets 1 and 2 belong to "." and ".."; slot n is offset n + 3
const FIRST_SLOT_OFFSET: i64 = 3;

pub struct RunfsFuse<D: BlockDevice> {
    fs: Runfs<D>,
    ttl: Duration,
    /// Parent of every directory the kernel has seen, for "..".
    parents: HashMap<u64, u64>,
}

fn kind_of(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::File => FileType::RegularFile,
        NodeKind::Directory => FileType::Directory,
    }
}

// Converts a node's attributes to what the kernel expects
fn file_attr(st: &Stat) -> FileAttr {
    FileAttr {
        ino: st.ino,
        size: st.size,
        blocks: st.blocks * (BLOCK_SIZE / 512) as u64,
        atime: st.atime.to_system_time(),
        mtime: st.mtime.to_system_time(),
        ctime: st.ctime.to_system_time(),
        crtime: st.ctime.to_system_time(),
        kind: kind_of(st.kind),
        perm: (st.perm & PERM_MASK) as u16,
        nlink: st.nlink,
        uid: st.uid,
        gid: st.gid,
        rdev: 0,
        blksize: BLOCK_SIZE as u32,
        flags: 0,
    }
}

fn time_of(t: TimeOrNow) -> Timespec {
    match t {
        TimeOrNow::SpecificTime(t) => t.into(),
        TimeOrNow::Now => SystemTime::now().into(),
    }
}

// Logs a failed operation and returns its errno; missing names are routine
fn errno(op: &'static str, err: &FsError) -> c_int {
    let code = err.to_errno();
    if code == libc::ENOENT {
        trace!(op, %err, "fuse op failed");
    } else {
        warn!(op, %err, "fuse op failed");
    }
    code
}

fn owner(req: &Request<'_>) -> Owner {
    Owner {
        uid: req.uid(),
        gid: req.gid(),
    }
}

impl<D: BlockDevice> RunfsFuse<D> {
    pub fn new(fs: Runfs<D>, ttl: Duration) -> Self {
        Self {
            fs,
            ttl,
            parents: HashMap::from([(ROOT_INO, ROOT_INO)]),
        }
    }

    pub fn into_inner(self) -> Runfs<D> {
        self.fs
    }

    // Hands a new kernel reference to the caller and remembers the parent
    fn entry(&mut self, parent: u64, st: &Stat, reply: ReplyEntry) {
        if let Err(e) = self.fs.get(st.ino) {
            return reply.error(errno("lookup", &e));
        }
        if st.kind == NodeKind::Directory {
            self.parents.insert(st.ino, parent);
        }
        reply.entry(&self.ttl, &file_attr(st), 0);
    }
}

/* ---------------- FUSE OPS ---------------- */

impl<D: BlockDevice> Filesystem for RunfsFuse<D> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("fuse session started");
        Ok(())
    }

    // The kernel forgets nothing on teardown: drop its references so unlinked
    // nodes are reclaimed, then flush
    fn destroy(&mut self) {
        match self.fs.release_all().and_then(|_| self.fs.sync()) {
            Ok(()) => info!("fuse session ended, image synced"),
            Err(e) => warn!(%e, "final sync failed"),
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.fs.lookup(parent, name.as_bytes()) {
            Ok(st) => self.entry(parent, &st, reply),
            Err(e) => reply.error(errno("lookup", &e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        if let Err(e) = self.fs.put(ino, nlookup) {
            warn!(ino, %e, "eviction failed");
        }
        if self.fs.ref_count(ino) == 0 && self.fs.stat(ino).is_err() {
            self.parents.remove(&ino);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.fs.stat(ino) {
            Ok(st) => reply.attr(&self.ttl, &file_attr(&st)),
            Err(e) => reply.error(errno("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attr = SetAttr {
            perm: mode.map(|m| m & PERM_MASK),
            uid,
            gid,
            size,
            atime: atime.map(time_of),
            mtime: mtime.map(time_of),
        };
        match self.fs.set_attr(ino, attr) {
            Ok(st) => reply.attr(&self.ttl, &file_attr(&st)),
            Err(e) => reply.error(errno("setattr", &e)),
        }
    }

    // Only regular files; device nodes and fifos are not supported
    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if mode & S_IFMT != S_IFREG && mode & S_IFMT != 0 {
            return reply.error(libc::EPERM);
        }
        let mode = S_IFREG | (mode & !umask & PERM_MASK);
        match self.fs.create(parent, name.as_bytes(), mode, owner(req)) {
            Ok(st) => self.entry(parent, &st, reply),
            Err(e) => reply.error(errno("mknod", &e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        match self
            .fs
            .mkdir(parent, name.as_bytes(), mode & !umask, owner(req))
        {
            Ok(st) => self.entry(parent, &st, reply),
            Err(e) => reply.error(errno("mkdir", &e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let mode = S_IFREG | (mode & !umask & PERM_MASK);
        let st = match self.fs.create(parent, name.as_bytes(), mode, owner(req)) {
            Ok(st) => st,
            Err(e) => return reply.error(errno("create", &e)),
        };
        if let Err(e) = self.fs.get(st.ino) {
            return reply.error(errno("create", &e));
        }
        reply.created(&self.ttl, &file_attr(&st), 0, 0, 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.unlink(parent, name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.rmdir(parent, name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        match self
            .fs
            .rename(parent, name.as_bytes(), newparent, newname.as_bytes(), flags)
        {
            Ok(()) => {
                if let Ok(st) = self.fs.lookup(newparent, newname.as_bytes()) {
                    if st.kind == NodeKind::Directory {
                        self.parents.insert(st.ino, newparent);
                    }
                }
                reply.ok()
            }
            Err(e) => reply.error(errno("rename", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.stat(ino) {
            Ok(st) if st.kind == NodeKind::Directory => reply.error(libc::EISDIR),
            Ok(_) => reply.opened(0, 0),
            Err(e) => reply.error(errno("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        match self.fs.read(ino, offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        match self.fs.write(ino, offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", &e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock: u64, reply: ReplyEmpty) {
        match self.fs.sync_inode(ino) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.sync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.fs.iterate(ino, (offset - FIRST_SLOT_OFFSET + 1).max(0) as usize) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno("readdir", &e)),
        };

        if offset < 1 && reply.add(ino, 1, FileType::Directory, ".") {
            return reply.ok();
        }
        if offset < 2 {
            let parent = self.parents.get(&ino).copied().unwrap_or(ROOT_INO);
            if reply.add(parent, 2, FileType::Directory, "..") {
                return reply.ok();
            }
        }

        for entry in entries {
            // an entry whose inode is gone is skipped rather than failing the listing
            let Ok(st) = self.fs.stat(entry.ino) else {
                continue;
            };
            let next = entry.slot as i64 + FIRST_SLOT_OFFSET;
            if reply.add(entry.ino, next, kind_of(st.kind), OsStr::from_bytes(&entry.name)) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let s = self.fs.statfs();
        reply.statfs(
            s.blocks,
            s.free_blocks,
            s.free_blocks,
            s.inodes,
            s.free_inodes,
            s.block_size,
            s.name_max,
            s.block_size,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_report_512_byte_sectors() {
        let st = Stat {
            ino: 5,
            kind: NodeKind::File,
            perm: 0o640,
            nlink: 1,
            size: 5000,
            blocks: 2,
            extent_start: 40,
            uid: 10,
            gid: 20,
            atime: Timespec { secs: 1, nsecs: 0 },
            mtime: Timespec { secs: 2, nsecs: 0 },
            ctime: Timespec { secs: 3, nsecs: 0 },
        };
        let attr = file_attr(&st);
        assert_eq!(attr.blocks, 16);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.blksize, BLOCK_SIZE as u32);
        assert_eq!(attr.mtime, Timespec { secs: 2, nsecs: 0 }.to_system_time());
    }

    #[test]
    fn errno_follows_the_error() {
        assert_eq!(errno("t", &FsError::NotFound), libc::ENOENT);
        assert_eq!(errno("t", &FsError::NotEmpty), libc::ENOTEMPTY);
        assert_eq!(errno("t", &FsError::StaleInode(9)), libc::ESTALE);
    }

    #[test]
    fn session_end_reclaims_files_the_kernel_still_held() {
        use crate::device::MemBlockDevice;
        use crate::layout::IMAGE_BLOCKS;
        use crate::mkfs::{format, FormatOptions};

        let dev = MemBlockDevice::new(IMAGE_BLOCKS);
        format(&dev, &FormatOptions::default()).unwrap();
        let fs = Runfs::mount(dev).unwrap();
        let f = fs.create(ROOT_INO, b"open", 0o644, Owner::default()).unwrap();
        fs.get(f.ino).unwrap();
        fs.write(f.ino, 0, &[1u8; 5000]).unwrap();
        fs.unlink(ROOT_INO, b"open").unwrap();

        let mut session = RunfsFuse::new(fs, Duration::from_secs(1));
        session.destroy();
        let fs = session.into_inner();
        let sb = fs.superblock();
        assert_eq!((sb.inodes.count_set(), sb.blocks.count_set()), (1, 1));
        assert_eq!(fs.ref_count(f.ino), 0);
    }
}
