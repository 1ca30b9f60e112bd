//! Entry point for the `mount_runfs` tool.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use runfs::config;
use runfs::fuse::RunfsFuse;
use runfs::{FileBlockDevice, Runfs};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Cli {
    /// Path to the configuration file (`.ini`)
    #[arg(short, long)]
    config: String,

    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: String,

    /// Accepted for compatibility with other mount helpers; the session
    /// always runs in the foreground until the filesystem is unmounted
    #[arg(short, long)]
    foreground: bool,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    let cfg = match config::load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let image_path = cfg.image_path();
    if !image_path.exists() {
        error!(image = %image_path.display(), "filesystem image not found, run mkfs_runfs first");
        return ExitCode::FAILURE;
    }
    if !Path::new(&args.mountpoint).is_dir() {
        error!(mountpoint = %args.mountpoint, "mount point does not exist");
        return ExitCode::FAILURE;
    }

    let fs = match FileBlockDevice::open(&image_path).and_then(Runfs::mount) {
        Ok(fs) => fs,
        Err(e) => {
            error!(image = %image_path.display(), %e, "cannot mount image");
            return ExitCode::FAILURE;
        }
    };

    let mut options = vec![
        fuser::MountOption::FSName(cfg.name.clone()),
        fuser::MountOption::Subtype("runfs".to_string()),
        if cfg.read_only {
            fuser::MountOption::RO
        } else {
            fuser::MountOption::RW
        },
    ];
    if cfg.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }

    info!(
        image = %image_path.display(),
        mountpoint = %args.mountpoint,
        read_only = cfg.read_only,
        foreground = args.foreground,
        "mounting runfs, press Ctrl+C to unmount"
    );

    match fuser::mount2(RunfsFuse::new(fs, cfg.attr_ttl), &args.mountpoint, &options) {
        Ok(()) => {
            info!("filesystem unmounted");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(%e, "failed to mount filesystem");
            ExitCode::FAILURE
        }
    }
}
