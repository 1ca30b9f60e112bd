//! Error types for runfs.
//!
//! Every variant maps to exactly one errno through [`FsError::to_errno`], which
//! is what the FUSE adapter replies with. The match is exhaustive so a new
//! variant cannot be added without choosing its errno.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    /// No free inode slot, no contiguous block run, or no free directory slot.
    #[error("no space left on device")]
    NoSpace,

    #[error("file name too long")]
    NameTooLong,

    /// rmdir (or rename over) a directory that still has active entries.
    #[error("directory not empty")]
    NotEmpty,

    #[error("no such file or directory")]
    NotFound,

    /// Unsupported rename flag, malformed name, out-of-order growth request.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Magic mismatch or unreadable geometry at mount time.
    #[error("not a runfs image: {0}")]
    InvalidFilesystem(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("file exists")]
    Exists,

    /// Inode number outside the table or whose slot is not allocated.
    #[error("stale inode {0}")]
    StaleInode(u64),

    /// Failure reported by the block device; never retried here.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NoSpace => libc::ENOSPC,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NotFound => libc::ENOENT,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::InvalidFilesystem(_) => libc::EINVAL,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::Exists => libc::EEXIST,
            Self::StaleInode(_) => libc::ESTALE,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
