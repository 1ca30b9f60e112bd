//! Directory entry table.
//!
//! A directory is one data block holding `MAX_CHILDREN` fixed-size slots.
//! "." and ".." are never stored; callers synthesize them. Removal zeroes a
//! slot in place and later inserts reuse the lowest hole first.

use crate::error::{FsError, Result};
use crate::layout::{DirEntry, BLOCK_SIZE, DIRENT_SIZE, MAX_CHILDREN, MAX_NAME_LEN};

/// Rejects names that cannot be stored in a slot.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    if name.is_empty() || name == b"." || name == b".." {
        return Err(FsError::InvalidArgument("reserved or empty name"));
    }
    if name.iter().any(|b| *b == b'/' || *b == 0) {
        return Err(FsError::InvalidArgument("name contains '/' or NUL"));
    }
    Ok(())
}

fn slot_range(slot: usize) -> std::ops::Range<usize> {
    slot * DIRENT_SIZE..(slot + 1) * DIRENT_SIZE
}

pub fn entry_at(block: &[u8], slot: usize) -> DirEntry {
    DirEntry::decode(&block[slot_range(slot)])
}

fn matches(e: &DirEntry, name: &[u8]) -> bool {
    e.active && e.name() == name
}

/// Slot and entry of the first active entry called `name`.
pub fn find(block: &[u8], name: &[u8]) -> Result<(usize, DirEntry)> {
    (0..MAX_CHILDREN)
        .map(|slot| (slot, entry_at(block, slot)))
        .find(|(_, e)| matches(e, name))
        .ok_or(FsError::NotFound)
}

/// Lowest inactive slot.
pub fn free_slot(block: &[u8]) -> Option<usize> {
    (0..MAX_CHILDREN).find(|&slot| !entry_at(block, slot).active)
}

/// Writes `entry` into `slot`, replacing whatever was there.
pub fn write_slot(block: &mut [u8], slot: usize, entry: &DirEntry) {
    entry.encode_into(&mut block[slot_range(slot)]);
}

/// Stores a new entry in the lowest free slot. A full table is left as is.
pub fn insert(block: &mut [u8], name: &[u8], ino: u64) -> Result<usize> {
    let slot = free_slot(block).ok_or(FsError::NoSpace)?;
    write_slot(block, slot, &DirEntry::new(ino, name));
    Ok(slot)
}

/// Zeroes the first active entry called `name` and returns its inode number.
pub fn remove(block: &mut [u8], name: &[u8]) -> Option<u64> {
    let (slot, entry) = find(block, name).ok()?;
    block[slot_range(slot)].fill(0);
    Some(entry.ino)
}

pub fn active_count(block: &[u8]) -> usize {
    (0..MAX_CHILDREN)
        .filter(|&slot| entry_at(block, slot).active)
        .count()
}

pub fn is_empty(block: &[u8]) -> bool {
    active_count(block) == 0
}

/// One active entry as seen by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub slot: usize,
    pub name: Vec<u8>,
    pub ino: u64,
}

/// Active entries from a cursor slot onwards. The cursor is just a slot
/// index: resume a paused listing with `list(block, last.slot + 1)`.
#[derive(Debug, Clone)]
pub struct Entries<B> {
    block: B,
    slot: usize,
}

pub fn list<B: AsRef<[u8]>>(block: B, cursor: usize) -> Entries<B> {
    Entries {
        block,
        slot: cursor,
    }
}

impl<B: AsRef<[u8]>> Iterator for Entries<B> {
    type Item = Listing;

    fn next(&mut self) -> Option<Listing> {
        let block = self.block.as_ref();
        debug_assert_eq!(block.len(), BLOCK_SIZE);
        while self.slot < MAX_CHILDREN {
            let slot = self.slot;
            self.slot += 1;
            let e = entry_at(block, slot);
            if e.active {
                return Some(Listing {
                    slot,
                    name: e.name().to_vec(),
                    ino: e.ino,
                });
            }
        }
        None
    }
}
