//! Configuration loader for runfs.
//!
//! One `config.ini` is shared by `mkfs_runfs` and `mount_runfs`:
//!
//! ```ini
//! [filesystem]
//! name = runfs
//! root_uid = 0
//! root_gid = 0
//! root_mode = 755
//!
//! [storage]
//! data_dir = ./data
//! image_prefix = runfs
//!
//! [mount]
//! read_only = false
//! auto_unmount = true
//! attr_ttl_secs = 1
//!
//! [logging]
//! level = info
//! ```
//!
//! `filesystem.name`, `storage.data_dir` and `storage.image_prefix` are
//! mandatory; everything else falls back to the values shown.

use std::path::{Path, PathBuf};
use std::time::Duration;

use configparser::ini::Ini;
use thiserror::Error;

use crate::mkfs::FormatOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("missing {section}.{key}")]
    Missing {
        section: &'static str,
        key: &'static str,
    },
    #[error("invalid {section}.{key}: {reason}")]
    Invalid {
        section: &'static str,
        key: &'static str,
        reason: String,
    },
}

/// All parameters read from `config.ini`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunfsConfig {
    /// Name reported to FUSE as the filesystem source.
    pub name: String,

    /// Owner, group and permission bits of the root directory at format time.
    pub root_uid: u32,
    pub root_gid: u32,
    pub root_mode: u32,

    /// Directory holding the image file.
    pub data_dir: PathBuf,

    /// Image file name without extension: `<data_dir>/<image_prefix>.img`.
    pub image_prefix: String,

    pub read_only: bool,
    pub auto_unmount: bool,

    /// How long the kernel may cache attributes and lookups.
    pub attr_ttl: Duration,

    /// Default tracing filter directive; `RUST_LOG` wins when set.
    pub log_level: String,
}

impl RunfsConfig {
    pub fn image_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.img", self.image_prefix))
    }

    pub fn format_options(&self) -> FormatOptions {
        FormatOptions {
            root_uid: self.root_uid,
            root_gid: self.root_gid,
            root_mode: self.root_mode,
        }
    }
}

/// Loads and validates the configuration at `path`.
pub fn load_config(path: impl AsRef<Path>) -> Result<RunfsConfig, ConfigError> {
    let path = path.as_ref();
    let mut ini = Ini::new();
    ini.load(path).map_err(|reason| ConfigError::Load {
        path: path.display().to_string(),
        reason,
    })?;
    from_ini(&ini)
}

/// Same as [`load_config`] for configuration text already in memory.
pub fn parse_config(text: &str) -> Result<RunfsConfig, ConfigError> {
    let mut ini = Ini::new();
    ini.read(text.to_string())
        .map_err(|reason| ConfigError::Load {
            path: "<inline>".into(),
            reason,
        })?;
    from_ini(&ini)
}

fn required(ini: &Ini, section: &'static str, key: &'static str) -> Result<String, ConfigError> {
    ini.get(section, key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing { section, key })
}

fn uint_or(
    ini: &Ini,
    section: &'static str,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    ini.getuint(section, key)
        .map(|v| v.unwrap_or(default))
        .map_err(|reason| ConfigError::Invalid {
            section,
            key,
            reason,
        })
}

fn u32_or(
    ini: &Ini,
    section: &'static str,
    key: &'static str,
    default: u32,
) -> Result<u32, ConfigError> {
    let v = uint_or(ini, section, key, u64::from(default))?;
    u32::try_from(v).map_err(|_| ConfigError::Invalid {
        section,
        key,
        reason: format!("{v} does not fit in 32 bits"),
    })
}

fn bool_or(
    ini: &Ini,
    section: &'static str,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    ini.getboolcoerce(section, key)
        .map(|v| v.unwrap_or(default))
        .map_err(|reason| ConfigError::Invalid {
            section,
            key,
            reason,
        })
}

fn from_ini(ini: &Ini) -> Result<RunfsConfig, ConfigError> {
    // [filesystem]
    let name = required(ini, "filesystem", "name")?;
    let root_uid = u32_or(ini, "filesystem", "root_uid", 0)?;
    let root_gid = u32_or(ini, "filesystem", "root_gid", 0)?;
    let root_mode = match ini.get("filesystem", "root_mode") {
        None => 0o755,
        Some(raw) => parse_mode(&raw).ok_or_else(|| ConfigError::Invalid {
            section: "filesystem",
            key: "root_mode",
            reason: format!("{raw:?} is not an octal mode up to 7777"),
        })?,
    };

    // [storage]
    let data_dir = PathBuf::from(required(ini, "storage", "data_dir")?);
    let image_prefix = required(ini, "storage", "image_prefix")?;

    // [mount]
    let read_only = bool_or(ini, "mount", "read_only", false)?;
    let auto_unmount = bool_or(ini, "mount", "auto_unmount", true)?;
    let attr_ttl = Duration::from_secs(uint_or(ini, "mount", "attr_ttl_secs", 1)?);

    // [logging]
    let log_level = ini
        .get("logging", "level")
        .unwrap_or_else(|| "info".to_string());

    Ok(RunfsConfig {
        name,
        root_uid,
        root_gid,
        root_mode,
        data_dir,
        image_prefix,
        read_only,
        auto_unmount,
        attr_ttl,
        log_level,
    })
}

/// Octal permission bits such as `755` or `0o700`.
fn parse_mode(raw: &str) -> Option<u32> {
    let digits = raw.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    u32::from_str_radix(digits, 8).ok().filter(|m| *m <= 0o7777)
}
