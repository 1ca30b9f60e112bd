//! Random create/write/truncate/unlink sequences against a byte model.

use std::collections::BTreeMap;

use proptest::prelude::*;
use runfs::info::inspect;
use runfs::layout::{blocks_for, BLOCK_SIZE, IMAGE_BLOCKS};
use runfs::mkfs::{format, FormatOptions};
use runfs::{FsError, MemBlockDevice, Owner, Runfs};

#[derive(Debug, Clone)]
enum Op {
    Create(u8),
    Write { file: u8, offset: u32, len: u16, fill: u8 },
    Truncate { file: u8, size: u32 },
    Unlink(u8),
}

fn op() -> impl Strategy<Value = Op> {
    let file = 0_u8..6;
    prop_oneof![
        file.clone().prop_map(Op::Create),
        (file.clone(), 0_u32..(6 * BLOCK_SIZE as u32), 1_u16..(2 * BLOCK_SIZE as u16), any::<u8>())
            .prop_map(|(file, offset, len, fill)| Op::Write { file, offset, len, fill }),
        (file.clone(), 0_u32..(5 * BLOCK_SIZE as u32))
            .prop_map(|(file, size)| Op::Truncate { file, size }),
        file.prop_map(Op::Unlink),
    ]
}

fn name(file: u8) -> Vec<u8> {
    format!("file{file}").into_bytes()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn bitmap_matches_live_extents(ops in proptest::collection::vec(op(), 1..60)) {
        let dev = MemBlockDevice::new(IMAGE_BLOCKS);
        format(&dev, &FormatOptions::default()).unwrap();
        let fs = Runfs::mount(dev).unwrap();
        let root = fs.root();
        // file -> (ino, contents)
        let mut model: BTreeMap<u8, (u64, Vec<u8>)> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Create(file) => {
                    if model.contains_key(&file) {
                        continue;
                    }
                    let st = fs.create(root, &name(file), 0o644, Owner::default()).unwrap();
                    model.insert(file, (st.ino, Vec::new()));
                }
                Op::Write { file, offset, len, fill } => {
                    let Some((ino, bytes)) = model.get_mut(&file) else { continue };
                    let data = vec![fill; len as usize];
                    match fs.write(*ino, u64::from(offset), &data) {
                        Ok(n) => {
                            let end = offset as usize + n;
                            if bytes.len() < end {
                                bytes.resize(end, 0);
                            }
                            bytes[offset as usize..end].copy_from_slice(&data[..n]);
                        }
                        Err(FsError::NoSpace) => {}
                        Err(e) => return Err(TestCaseError::fail(format!("write: {e}"))),
                    }
                }
                Op::Truncate { file, size } => {
                    let Some((ino, bytes)) = model.get_mut(&file) else { continue };
                    match fs.truncate(*ino, u64::from(size)) {
                        Ok(()) => bytes.resize(size as usize, 0),
                        Err(FsError::NoSpace) => {}
                        Err(e) => return Err(TestCaseError::fail(format!("truncate: {e}"))),
                    }
                }
                Op::Unlink(file) => {
                    if model.remove(&file).is_some() {
                        fs.unlink(root, &name(file)).unwrap();
                    } else {
                        prop_assert!(matches!(fs.unlink(root, &name(file)), Err(FsError::NotFound)));
                    }
                }
            }

            for (ino, bytes) in model.values() {
                let st = fs.stat(*ino).unwrap();
                prop_assert_eq!(st.size, bytes.len() as u64);
                prop_assert_eq!(st.blocks, blocks_for(st.size));
            }
        }

        for (ino, bytes) in model.values() {
            let back = fs.read(*ino, 0, bytes.len() + 1).unwrap();
            prop_assert_eq!(&back, bytes);
        }

        fs.sync().unwrap();
        let report = inspect(fs.device()).unwrap();
        prop_assert!(report.problems.is_empty(), "{:?}", report.problems);
        prop_assert_eq!(report.used_inodes, model.len() as u64 + 1);
        let expected_blocks: u64 = model
            .values()
            .map(|(_, bytes)| blocks_for(bytes.len() as u64))
            .sum::<u64>()
            + 1;
        prop_assert_eq!(report.used_blocks, expected_blocks);
    }

    #[test]
    fn remapping_an_allocated_block_changes_nothing(blocks in 1_u64..12, probe in 0_u64..12) {
        let dev = MemBlockDevice::new(IMAGE_BLOCKS);
        format(&dev, &FormatOptions::default()).unwrap();
        let fs = Runfs::mount(dev).unwrap();
        let f = fs.create(fs.root(), b"f", 0o644, Owner::default()).unwrap();
        fs.truncate(f.ino, blocks * BLOCK_SIZE as u64).unwrap();

        let probe = probe % blocks;
        let before = fs.superblock();
        let first = fs.map_block(f.ino, probe, true).unwrap();
        let second = fs.map_block(f.ino, probe, true).unwrap();
        prop_assert_eq!(first, second);
        prop_assert_eq!(fs.superblock(), before);
    }
}
