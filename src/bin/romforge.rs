//! Command-line frontend for unpacking and repacking partition images.
//!
//! `romforge unpack` mounts an image read-only, snapshots its metadata and
//! extracts an editable working tree.  `romforge repack` reconciles the
//! edited tree against the snapshot and rebuilds a bootable image.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use romforge::{
    persist::FsType, repack, tools::ErofsCompression, unpack, Ext4Mode, RepackOptions,
};

/// romforge
#[derive(Debug, Parser)]
#[clap(name = "romforge", version)]
struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Extract an image into an editable working tree
    Unpack {
        /// Partition image (raw, sparse or super)
        image: PathBuf,
        /// Directory to extract into
        out_dir: PathBuf,
    },
    /// Rebuild an image from a working tree
    Repack {
        /// Working tree produced by unpack
        dir: PathBuf,
        /// Path of the image to write
        out_image: PathBuf,
        /// Build as this filesystem instead of the original one
        #[clap(long)]
        fs: Option<FsType>,
        /// EXT4 sizing: "strict" reuses the original geometry, "flexible"
        /// sizes to fit the current content
        #[clap(long, default_value = "flexible")]
        ext4_mode: Ext4Mode,
        /// Extra space reserved by flexible EXT4 sizing, in percent
        #[clap(long, default_value_t = romforge::planner::DEFAULT_OVERHEAD_PERCENT)]
        ext4_overhead_percent: u32,
        /// EROFS compression algorithm (none, lz4, lz4hc, deflate)
        #[clap(long, default_value_t = ErofsCompression::default())]
        erofs_compression: ErofsCompression,
        /// EROFS compression level
        #[clap(long)]
        erofs_level: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Unpack { image, out_dir } => {
            // loop mounts and xattr reads both need privileges
            if !rustix::process::geteuid().is_root() {
                bail!("unpack requires root (it loop-mounts the image)");
            }
            unpack(&image, &out_dir).await
        }
        Command::Repack {
            dir,
            out_image,
            fs,
            ext4_mode,
            ext4_overhead_percent,
            erofs_compression,
            erofs_level,
        } => {
            let options = RepackOptions {
                fs_override: fs,
                ext4_mode,
                overhead_percent: ext4_overhead_percent,
                erofs_compression,
                erofs_level,
            };
            repack(&dir, &out_image, &options).await
        }
    }
}
