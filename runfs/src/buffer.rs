//! Write-back buffer cache between the filesystem and its block device.
//!
//! Every access goes through a cached buffer. Writes only touch the cached
//! copy and mark it dirty; [`BufferCache::flush`] pushes dirty buffers to the
//! device in ascending block order. Reads hand out fresh copies, so callers
//! never alias a cached buffer, and a dirty cached copy always wins over the
//! device contents.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::layout::BLOCK_SIZE;

#[derive(Debug)]
struct Buffer {
    data: Vec<u8>,
    dirty: bool,
}

#[derive(Debug)]
pub struct BufferCache<D> {
    dev: D,
    buffers: Mutex<BTreeMap<u64, Buffer>>,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(dev: D) -> Self {
        Self {
            dev,
            buffers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn into_device(self) -> D {
        self.dev
    }

    fn load<'a>(&self, map: &'a mut BTreeMap<u64, Buffer>, index: u64) -> Result<&'a mut Buffer> {
        if !map.contains_key(&index) {
            let mut data = vec![0u8; BLOCK_SIZE];
            self.dev.read_block(index, &mut data)?;
            map.insert(index, Buffer { data, dirty: false });
        }
        map.get_mut(&index)
            .ok_or(FsError::InvalidArgument("buffer vanished while loading"))
    }

    /// Fresh copy of block `index`, preferring unflushed modifications.
    pub fn read_block(&self, index: u64) -> Result<Vec<u8>> {
        let mut map = self.buffers.lock();
        Ok(self.load(&mut map, index)?.data.clone())
    }

    /// Replaces the cached contents of `index` and marks it dirty.
    pub fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(FsError::InvalidArgument("buffer is not one block long"));
        }
        if index >= self.dev.block_count() {
            return Err(FsError::InvalidArgument("block past end of device"));
        }
        self.buffers.lock().insert(
            index,
            Buffer {
                data: data.to_vec(),
                dirty: true,
            },
        );
        Ok(())
    }

    /// Runs `f` over the cached block in place and marks it dirty.
    pub fn modify<R>(&self, index: u64, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut map = self.buffers.lock();
        let buf = self.load(&mut map, index)?;
        let out = f(&mut buf.data);
        buf.dirty = true;
        Ok(out)
    }

    /// Flags an already cached block for write-back. Returns false when the
    /// block is not cached.
    pub fn mark_dirty(&self, index: u64) -> bool {
        match self.buffers.lock().get_mut(&index) {
            Some(buf) => {
                buf.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn is_dirty(&self, index: u64) -> bool {
        self.buffers.lock().get(&index).is_some_and(|b| b.dirty)
    }

    /// Drops the cached copy of `index` without writing it back.
    pub fn forget(&self, index: u64) {
        self.buffers.lock().remove(&index);
    }

    /// Writes every dirty buffer back, lowest block first, then flushes the
    /// device. Stops at the first device error; unwritten buffers stay dirty.
    pub fn flush(&self) -> Result<()> {
        let mut map = self.buffers.lock();
        let mut written = 0usize;
        for (index, buf) in map.iter_mut().filter(|(_, b)| b.dirty) {
            self.dev.write_block(*index, &buf.data)?;
            buf.dirty = false;
            written += 1;
        }
        drop(map);
        self.dev.flush()?;
        trace!(written, "buffer cache flushed");
        Ok(())
    }

    /// Drops every clean buffer. Dirty ones are kept until flushed.
    pub fn release_clean(&self) {
        self.buffers.lock().retain(|_, b| b.dirty);
    }
}
