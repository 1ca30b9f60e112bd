//! runfs library
//!
//! A small single-image filesystem: bitmap allocator, flat inode table,
//! single-block directories and one contiguous extent per file. Shared by
//! all runfs binaries (mkfs, mount, info).

pub mod alloc;
pub mod bitmap;
pub mod buffer;
pub mod config;
pub mod device;
pub mod dir;
pub mod error;
pub mod extent;
pub mod fs;
pub mod fuse;
pub mod info;
pub mod layout;
pub mod mkfs;
pub mod node;

pub use device::{BlockDevice, FileBlockDevice, MemBlockDevice};
pub use error::{FsError, Result};
pub use extent::Mapping;
pub use fs::{FsStats, Runfs, SetAttr, RENAME_NOREPLACE};
pub use node::{NodeKind, Owner, Stat};
