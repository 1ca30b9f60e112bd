//! Entry point for the `mkfs_runfs` tool.
//!
//! Formats a new runfs image, either at the path derived from a
//! `config.ini` (`<data_dir>/<image_prefix>.img`) or at an explicit path.
//! The layout itself is fixed; the config only chooses where the image
//! goes and who owns the root directory.

use std::fs::create_dir_all;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use runfs::config;
use runfs::layout::{BLOCK_SIZE, IMAGE_BLOCKS};
use runfs::mkfs::{create_image, FormatOptions};
use tracing_subscriber::EnvFilter;

/// Command-line interface for the mkfs_runfs tool.
///
/// ```bash
/// mkfs_runfs -c config.ini
/// mkfs_runfs --image /tmp/scratch.img
/// ```
#[derive(Parser)]
#[command(group(ArgGroup::new("target").required(true).args(["config", "image"])))]
struct Cli {
    /// Path to the configuration file (`.ini`).
    #[arg(short, long)]
    config: Option<String>,

    /// Format this file directly with default root ownership.
    #[arg(long)]
    image: Option<PathBuf>,
}

fn run(args: Cli) -> Result<PathBuf, String> {
    let (path, options) = match (args.config, args.image) {
        (Some(cfg_path), _) => {
            let cfg = config::load_config(&cfg_path).map_err(|e| e.to_string())?;
            create_dir_all(&cfg.data_dir)
                .map_err(|e| format!("cannot create {}: {e}", cfg.data_dir.display()))?;
            (cfg.image_path(), cfg.format_options())
        }
        (None, Some(path)) => (path, FormatOptions::default()),
        (None, None) => return Err("either --config or --image is required".into()),
    };

    create_image(&path, &options).map_err(|e| format!("{}: {e}", path.display()))?;
    Ok(path)
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(Cli::parse()) {
        Ok(path) => {
            println!(
                "runfs image created at {} ({} blocks of {} bytes)",
                path.display(),
                IMAGE_BLOCKS,
                BLOCK_SIZE
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
