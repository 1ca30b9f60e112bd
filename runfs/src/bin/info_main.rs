//! CLI entry point for `runfs_info`.

use std::process::ExitCode;

use clap::Parser;
use runfs::info;
use runfs::FileBlockDevice;

/// Inspection tool for runfs images
#[derive(Parser)]
struct Cli {
    /// Path to the .img file
    image: String,

    /// Also print the directory tree
    #[arg(long)]
    tree: bool,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    let report = FileBlockDevice::open(&args.image).and_then(|dev| info::inspect(&dev));
    match report {
        Ok(report) => {
            print!("{}", report.render(args.tree));
            if report.problems.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Err(e) => {
            eprintln!("Error: {}: {e}", args.image);
            ExitCode::FAILURE
        }
    }
}
