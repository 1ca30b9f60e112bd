//! runfs_info: read-only inspection of a runfs image.
//!
//! Reads the raw blocks without mounting, so it also works on images that
//! would fail to mount. Besides the superblock summary and the live inodes it
//! walks the tree from the root and cross-checks the bitmaps against the
//! extents the records claim, and the stored link counts against the
//! directory entries actually found.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

use crate::alloc;
use crate::device::BlockDevice;
use crate::dir;
use crate::error::{FsError, Result};
use crate::extent::Extent;
use crate::layout::{
    blocks_for, Inode, Superblock, BLOCK_SIZE, DATA_START_BLOCK, IMAGE_BLOCKS, INODE_SIZE,
    INODE_TABLE_BLOCK, INODE_TABLE_BLOCKS, INODES_PER_BLOCK, MAGIC, MAX_DATA_BLOCKS, MAX_INODES,
    PERM_MASK, ROOT_INO, SUPERBLOCK_BLOCK,
};
use crate::node::NodeKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeReport {
    pub ino: u64,
    pub kind: NodeKind,
    pub perm: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u64,
    pub extent_start: u64,
}

/// One node reached from the root, in depth-first order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub depth: usize,
    pub name: String,
    pub ino: u64,
    pub kind: Option<NodeKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReport {
    pub magic: u64,
    pub used_inodes: u64,
    pub free_inodes: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub inodes: Vec<InodeReport>,
    pub tree: Vec<TreeEntry>,
    /// Inconsistencies between the bitmaps, records and directories.
    pub problems: Vec<String>,
}

fn read<D: BlockDevice>(dev: &D, block: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    dev.read_block(block, &mut buf)?;
    Ok(buf)
}

fn load_records<D: BlockDevice>(dev: &D) -> Result<Vec<Inode>> {
    let mut records = Vec::with_capacity(MAX_INODES as usize);
    for blk in 0..INODE_TABLE_BLOCKS {
        let buf = read(dev, INODE_TABLE_BLOCK + blk)?;
        for i in 0..INODES_PER_BLOCK {
            records.push(Inode::decode(&buf[i * INODE_SIZE..(i + 1) * INODE_SIZE]));
        }
    }
    Ok(records)
}

/// Builds a report for the image on `dev`. Fails only when the device is too
/// small or the magic is wrong; everything else ends up in `problems`.
pub fn inspect<D: BlockDevice>(dev: &D) -> Result<ImageReport> {
    if dev.block_count() < IMAGE_BLOCKS {
        return Err(FsError::InvalidFilesystem(format!(
            "image has {} blocks, expected {IMAGE_BLOCKS}",
            dev.block_count()
        )));
    }
    let sb = Superblock::decode(&read(dev, SUPERBLOCK_BLOCK)?);
    if sb.magic != MAGIC {
        return Err(FsError::InvalidFilesystem(format!(
            "bad magic {:#x}",
            sb.magic
        )));
    }

    let records = load_records(dev)?;
    let mut problems = Vec::new();
    let mut inodes = Vec::new();
    // data block -> owning inode
    let mut owners: BTreeMap<u64, u64> = BTreeMap::new();

    for (slot, rec) in records.iter().enumerate() {
        let ino = slot as u64 + ROOT_INO;
        let allocated = alloc::is_inode_allocated(&sb, ino);
        let Some(kind) = NodeKind::from_mode(rec.mode) else {
            if allocated {
                problems.push(format!("inode {ino} allocated but its record is empty"));
            }
            continue;
        };
        if !allocated {
            problems.push(format!("inode {ino} has a record but its bit is clear"));
        }
        if rec.block_count != blocks_for(rec.size) {
            problems.push(format!(
                "inode {ino}: {} blocks for {} bytes",
                rec.block_count, rec.size
            ));
        }
        if kind == NodeKind::Directory && rec.block_count != 1 {
            problems.push(format!("directory {ino} spans {} blocks", rec.block_count));
        }
        for block in Extent::of(rec).blocks() {
            if !alloc::is_data_block(block) {
                problems.push(format!("inode {ino} extent leaves the data region at {block}"));
                break;
            }
            if alloc::is_block_free(&sb, block) {
                problems.push(format!("inode {ino} owns block {block} but its bit is clear"));
            }
            if let Some(other) = owners.insert(block, ino) {
                problems.push(format!("block {block} shared by inodes {other} and {ino}"));
            }
        }
        inodes.push(InodeReport {
            ino,
            kind,
            perm: rec.mode & PERM_MASK,
            nlink: rec.nlink,
            size: rec.size,
            blocks: rec.block_count,
            extent_start: rec.extent_start,
        });
    }

    for block in DATA_START_BLOCK..DATA_START_BLOCK + MAX_DATA_BLOCKS {
        if !alloc::is_block_free(&sb, block) && !owners.contains_key(&block) {
            problems.push(format!("block {block} marked used but owned by no inode"));
        }
    }

    let found = walk(dev, &records, &mut problems)?;
    for node in &inodes {
        let named = found.entries.get(&node.ino).copied().unwrap_or(0);
        if node.ino != ROOT_INO && named == 0 {
            problems.push(format!("inode {} is live but no directory names it", node.ino));
            continue;
        }
        let counted = match node.kind {
            NodeKind::File => named,
            NodeKind::Directory => 2 + found.subdirs.get(&node.ino).copied().unwrap_or(0),
        };
        if node.nlink != counted {
            problems.push(format!(
                "inode {}: {} links stored, {counted} found",
                node.ino, node.nlink
            ));
        }
    }

    let used_inodes = sb.inodes.count_set() as u64;
    let used_blocks = sb.blocks.count_set() as u64;
    Ok(ImageReport {
        magic: sb.magic,
        used_inodes,
        free_inodes: MAX_INODES - used_inodes,
        used_blocks,
        free_blocks: MAX_DATA_BLOCKS - used_blocks,
        inodes,
        tree: found.tree,
        problems,
    })
}

fn record_of(records: &[Inode], ino: u64) -> Option<&Inode> {
    ino.checked_sub(ROOT_INO)
        .and_then(|slot| records.get(slot as usize))
}

struct Walk {
    tree: Vec<TreeEntry>,
    /// Directory entries naming each inode.
    entries: HashMap<u64, u32>,
    /// Child directories of each directory walked.
    subdirs: HashMap<u64, u32>,
}

// Depth-first walk from the root; a directory reached twice is reported, not
// descended into again
fn walk<D: BlockDevice>(dev: &D, records: &[Inode], problems: &mut Vec<String>) -> Result<Walk> {
    let mut tree = vec![TreeEntry {
        depth: 0,
        name: "/".into(),
        ino: ROOT_INO,
        kind: record_of(records, ROOT_INO).and_then(|r| NodeKind::from_mode(r.mode)),
    }];
    let mut seen = HashSet::from([ROOT_INO]);
    let mut stack = vec![(ROOT_INO, 1usize)];
    let mut entries: HashMap<u64, u32> = HashMap::new();
    let mut subdirs: HashMap<u64, u32> = HashMap::new();

    while let Some((dir_ino, depth)) = stack.pop() {
        let Some(rec) = record_of(records, dir_ino) else {
            continue;
        };
        if NodeKind::from_mode(rec.mode) != Some(NodeKind::Directory)
            || !alloc::is_data_block(rec.extent_start)
        {
            continue;
        }
        let block = read(dev, rec.extent_start)?;
        let mut children = Vec::new();
        for entry in dir::list(&block[..], 0) {
            let kind = record_of(records, entry.ino).and_then(|r| NodeKind::from_mode(r.mode));
            *entries.entry(entry.ino).or_insert(0) += 1;
            if kind == Some(NodeKind::Directory) {
                *subdirs.entry(dir_ino).or_insert(0) += 1;
            }
            if kind.is_none() {
                problems.push(format!(
                    "entry {:?} in directory {dir_ino} points at dead inode {}",
                    String::from_utf8_lossy(&entry.name),
                    entry.ino
                ));
            }
            children.push(TreeEntry {
                depth,
                name: String::from_utf8_lossy(&entry.name).into_owned(),
                ino: entry.ino,
                kind,
            });
        }

        // insert the children right after their parent, keeping slot order
        let at = tree
            .iter()
            .rposition(|e| e.ino == dir_ino && e.depth + 1 == depth)
            .map_or(tree.len(), |i| i + 1);
        for child in children.iter().rev() {
            if child.kind == Some(NodeKind::Directory) {
                if seen.insert(child.ino) {
                    stack.push((child.ino, depth + 1));
                } else {
                    problems.push(format!("directory {} reachable twice", child.ino));
                }
            }
        }
        tree.splice(at..at, children);
    }
    Ok(Walk {
        tree,
        entries,
        subdirs,
    })
}

impl ImageReport {
    /// Human-readable report; `tree` adds the directory walk.
    pub fn render(&self, tree: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "====== RUNFS SUPERBLOCK ======");
        let _ = writeln!(out, "Magic:           {:#x}", self.magic);
        let _ = writeln!(out, "Block size:      {BLOCK_SIZE} bytes");
        let _ = writeln!(
            out,
            "Inodes:          {} used / {} free",
            self.used_inodes, self.free_inodes
        );
        let _ = writeln!(
            out,
            "Data blocks:     {} used / {} free",
            self.used_blocks, self.free_blocks
        );

        let _ = writeln!(out, "\n====== INODES ======");
        for i in &self.inodes {
            let kind = match i.kind {
                NodeKind::Directory => "dir ",
                NodeKind::File => "file",
            };
            let extent = if i.blocks == 0 {
                "-".to_string()
            } else {
                format!("{}..{}", i.extent_start, i.extent_start + i.blocks)
            };
            let _ = writeln!(
                out,
                "{:>3} {kind} 0o{:03o} links={} size={} blocks={} extent={extent}",
                i.ino, i.perm, i.nlink, i.size, i.blocks
            );
        }

        if tree {
            let _ = writeln!(out, "\n====== TREE ======");
            for e in &self.tree {
                let suffix = match e.kind {
                    Some(NodeKind::Directory) if e.ino != ROOT_INO => "/",
                    None => " (dead)",
                    _ => "",
                };
                let _ = writeln!(
                    out,
                    "{}{}{suffix}  [{}]",
                    "  ".repeat(e.depth),
                    e.name,
                    e.ino
                );
            }
        }

        if !self.problems.is_empty() {
            let _ = writeln!(out, "\n====== PROBLEMS ======");
            for p in &self.problems {
                let _ = writeln!(out, "- {p}");
            }
        }
        out
    }
}
