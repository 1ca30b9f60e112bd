//! Block-addressed storage the filesystem runs on.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{FsError, Result};
use crate::layout::BLOCK_SIZE;

pub trait BlockDevice: Send + Sync {
    /// Number of `BLOCK_SIZE` blocks on the device.
    fn block_count(&self) -> u64;

    /// Reads block `index` into `buf`; `buf.len()` must equal `BLOCK_SIZE`.
    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` to block `index`; `buf.len()` must equal `BLOCK_SIZE`.
    fn write_block(&self, index: u64, buf: &[u8]) -> Result<()>;

    /// Makes previous writes durable.
    fn flush(&self) -> Result<()>;
}

fn check_range(index: u64, count: u64, len: usize) -> Result<()> {
    if len != BLOCK_SIZE {
        return Err(FsError::InvalidArgument("buffer is not one block long"));
    }
    if index >= count {
        return Err(FsError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("block {index} past end of device ({count} blocks)"),
        )));
    }
    Ok(())
}

/// Image file accessed with positional reads and writes, so no shared seek
/// cursor is needed.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    blocks: u64,
}

impl FileBlockDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let blocks = file.metadata()?.len() / BLOCK_SIZE as u64;
        Ok(Self { file, blocks })
    }

    /// Creates (or truncates) an image file of exactly `blocks` blocks.
    pub fn create(path: impl AsRef<Path>, blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(blocks * BLOCK_SIZE as u64)?;
        Ok(Self { file, blocks })
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        check_range(index, self.blocks, buf.len())?;
        self.file.read_exact_at(buf, index * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn write_block(&self, index: u64, buf: &[u8]) -> Result<()> {
        check_range(index, self.blocks, buf.len())?;
        self.file.write_all_at(buf, index * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// RAM-backed device for tests and dry runs.
#[derive(Debug)]
pub struct MemBlockDevice {
    data: Mutex<Vec<u8>>,
    blocks: u64,
}

impl MemBlockDevice {
    pub fn new(blocks: u64) -> Self {
        Self {
            data: Mutex::new(vec![0; blocks as usize * BLOCK_SIZE]),
            blocks,
        }
    }

    /// Copy of the raw device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        check_range(index, self.blocks, buf.len())?;
        let off = index as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.data.lock()[off..off + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, index: u64, buf: &[u8]) -> Result<()> {
        check_range(index, self.blocks, buf.len())?;
        let off = index as usize * BLOCK_SIZE;
        self.data.lock()[off..off + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for std::sync::Arc<D> {
    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(index, buf)
    }

    fn write_block(&self, index: u64, buf: &[u8]) -> Result<()> {
        (**self).write_block(index, buf)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips_blocks() {
        let dev = MemBlockDevice::new(4);
        let block = vec![7u8; BLOCK_SIZE];
        dev.write_block(2, &block).unwrap();

        let mut out = vec![0u8; BLOCK_SIZE];
        dev.read_block(2, &mut out).unwrap();
        assert_eq!(out, block);
        dev.read_block(1, &mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn out_of_range_access_is_an_io_error() {
        let dev = MemBlockDevice::new(2);
        let mut buf = vec![0u8; BLOCK_SIZE];
        assert!(matches!(dev.read_block(2, &mut buf), Err(FsError::Io(_))));
        assert!(matches!(
            dev.write_block(0, &buf[..10]),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn file_device_is_sized_in_whole_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let dev = FileBlockDevice::create(&path, 3).unwrap();
        assert_eq!(dev.block_count(), 3);
        dev.write_block(2, &vec![1u8; BLOCK_SIZE]).unwrap();
        drop(dev);

        let dev = FileBlockDevice::open(&path).unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE];
        dev.read_block(2, &mut buf).unwrap();
        assert_eq!(buf[BLOCK_SIZE - 1], 1);
    }
}
