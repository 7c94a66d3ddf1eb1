//! External collaborators.
//!
//! Everything here is orchestration around tools the core treats as opaque:
//! mount(8), simg2img, e2fsck, tune2fs, mkfs.erofs, mke2fs, lpunpack and
//! lpmake.  Children are spawned asynchronously and awaited; there is no
//! poll-and-sleep.  Resources acquired here are released on every exit path:
//! mounts detach on drop, half-written images are deleted on failure or
//! cancellation.

use std::{
    fmt,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    process::Stdio,
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use rustix::mount::{unmount, UnmountFlags};
use tokio::process::Command;

use crate::{error::RomforgeError, persist::Ext4Geometry, persist::FsType, planner::SizingPlan};

/// A read-only loop mount that detaches when dropped.
pub struct MountGuard {
    dir: tempfile::TempDir,
    mounted: bool,
}

impl MountGuard {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(err) = unmount(self.dir.path(), UnmountFlags::DETACH) {
                warn!("unmounting {:?}: {err}", self.dir.path());
            }
        }
    }
}

/// Deletes a partially written output file unless disarmed.  Covers both
/// error returns and future cancellation.
pub struct OutputGuard {
    path: PathBuf,
    armed: bool,
}

impl OutputGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            warn!("discarding partial output {:?}", self.path);
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!("removing {:?}: {err}", self.path);
            }
        }
    }
}

/// Runs a child to completion and returns its stdout.  Non-zero exit becomes
/// an error carrying the tool's stderr.
async fn run(tool: &str, command: &mut Command) -> Result<String> {
    debug!("running {tool}");
    let output = command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("spawning {tool}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{tool} exited with {}: {}", output.status, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Mounts `image` read-only on a fresh temporary directory.
pub async fn mount_image_ro(image: &Path) -> Result<MountGuard> {
    let dir = tempfile::TempDir::new()?;
    let mut guard = MountGuard {
        dir,
        mounted: false,
    };
    run(
        "mount",
        Command::new("mount")
            .arg("-o")
            .arg("loop,ro")
            .arg(image)
            .arg(guard.path()),
    )
    .await?;
    guard.mounted = true;
    info!("mounted {image:?} at {:?}", guard.path());
    Ok(guard)
}

const SPARSE_MAGIC: u32 = 0xed26_ff3a;
const EROFS_MAGIC: u32 = 0xe0f5_e1e2;
const EXT4_MAGIC: u16 = 0xef53;
const LP_GEOMETRY_MAGIC: u32 = 0x616c_4467;

/// Android sparse images carry their magic in the first four bytes.
pub fn is_sparse_image(image: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let n = File::open(image)
        .with_context(|| format!("opening {image:?}"))?
        .read(&mut magic)?;
    Ok(n == 4 && u32::from_le_bytes(magic) == SPARSE_MAGIC)
}

/// Sniffs the filesystem type from well-known superblock magics: EROFS at
/// offset 1024, EXT4 at 1024+0x38, LP geometry (super) at 4096.
pub fn detect_fs_type(image: &Path) -> Result<Option<FsType>> {
    let mut header = vec![0u8; 8192];
    let n = File::open(image)
        .with_context(|| format!("opening {image:?}"))?
        .read(&mut header)?;
    header.truncate(n);

    let le32 = |offset: usize| -> Option<u32> {
        header
            .get(offset..offset + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };
    let le16 = |offset: usize| -> Option<u16> {
        header
            .get(offset..offset + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    };

    if le32(1024) == Some(EROFS_MAGIC) {
        return Ok(Some(FsType::Erofs));
    }
    if le16(1024 + 0x38) == Some(EXT4_MAGIC) {
        return Ok(Some(FsType::Ext4));
    }
    if le32(4096) == Some(LP_GEOMETRY_MAGIC) {
        return Ok(Some(FsType::Super));
    }
    Ok(None)
}

/// Converts an Android sparse image to its raw byte-for-byte equivalent.
pub async fn sparse_to_raw(sparse: &Path, raw: &Path) -> Result<()> {
    let guard = OutputGuard::new(raw);
    run("simg2img", Command::new("simg2img").arg(sparse).arg(raw)).await?;
    guard.disarm();
    Ok(())
}

/// Replays the journal and fixes what e2fsck can fix.  Exit codes 0-2 mean
/// clean or corrected; anything else is a corrupt filesystem.
pub async fn repair_ext4(image: &Path) -> Result<()> {
    let status = Command::new("e2fsck")
        .arg("-fy")
        .arg(image)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .context("spawning e2fsck")?;

    match status.status.code() {
        Some(code) if code <= 2 => Ok(()),
        _ => Err(RomforgeError::CorruptFilesystem {
            image: image.to_path_buf(),
            detail: String::from_utf8_lossy(&status.stderr).trim().to_string(),
        }
        .into()),
    }
}

/// Reads the original EXT4 geometry via tune2fs.
pub async fn probe_ext4(image: &Path) -> Result<Ext4Geometry> {
    let listing = run("tune2fs", Command::new("tune2fs").arg("-l").arg(image)).await?;

    let field = |name: &str| -> Option<String> {
        listing.lines().find_map(|line| {
            line.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix(':'))
                .map(|value| value.trim().to_string())
        })
    };
    let number = |name: &str| -> Result<u64> {
        field(name)
            .and_then(|v| v.parse().ok())
            .with_context(|| format!("tune2fs output is missing {name:?}"))
    };

    Ok(Ext4Geometry {
        block_count: number("Block count")?,
        inode_count: number("Inode count")?,
        uuid: field("Filesystem UUID").unwrap_or_default(),
        volume_name: field("Filesystem volume name")
            .filter(|name| name != "<none>")
            .unwrap_or_default(),
        inode_size: number("Inode size")? as u32,
        features: field("Filesystem features").unwrap_or_default(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErofsCompression {
    None,
    Lz4,
    #[default]
    Lz4hc,
    Deflate,
}

impl fmt::Display for ErofsCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErofsCompression::None => "none",
            ErofsCompression::Lz4 => "lz4",
            ErofsCompression::Lz4hc => "lz4hc",
            ErofsCompression::Deflate => "deflate",
        })
    }
}

impl FromStr for ErofsCompression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ErofsCompression::None),
            "lz4" => Ok(ErofsCompression::Lz4),
            "lz4hc" => Ok(ErofsCompression::Lz4hc),
            "deflate" => Ok(ErofsCompression::Deflate),
            other => Err(format!("unknown compression {other:?}")),
        }
    }
}

/// Builds an EROFS image from a reconciled tree.
pub async fn build_erofs(
    source: &Path,
    output: &Path,
    compression: ErofsCompression,
    level: Option<u32>,
) -> Result<()> {
    let guard = OutputGuard::new(output);
    let mut command = Command::new("mkfs.erofs");

    if compression != ErofsCompression::None {
        let algorithm = match level {
            Some(level) => format!("{compression},{level}"),
            None => compression.to_string(),
        };
        command.arg("-z").arg(algorithm);
    }
    command.arg(output).arg(source);

    run("mkfs.erofs", &mut command)
        .await
        .map_err(|err| RomforgeError::BuilderFailure {
            tool: "mkfs.erofs".to_string(),
            detail: err.to_string(),
        })?;
    guard.disarm();
    info!("built EROFS image {output:?}");
    Ok(())
}

/// Builds an EXT4 image from a reconciled tree with the planned geometry.
pub async fn build_ext4(
    source: &Path,
    output: &Path,
    plan: &SizingPlan,
    geometry: Option<&Ext4Geometry>,
) -> Result<()> {
    let guard = OutputGuard::new(output);
    let mut command = Command::new("mke2fs");
    command
        .arg("-F")
        .arg("-t")
        .arg("ext4")
        .arg("-b")
        .arg(plan.block_size.to_string())
        .arg("-N")
        .arg(plan.inode_count.to_string())
        .arg("-d")
        .arg(source);

    if let Some(geometry) = geometry {
        command.arg("-I").arg(geometry.inode_size.to_string());
        if !geometry.uuid.is_empty() {
            command.arg("-U").arg(&geometry.uuid);
        }
        if !geometry.volume_name.is_empty() {
            command.arg("-L").arg(&geometry.volume_name);
        }
    }
    command.arg(output).arg(plan.block_count.to_string());

    run("mke2fs", &mut command)
        .await
        .map_err(|err| RomforgeError::BuilderFailure {
            tool: "mke2fs".to_string(),
            detail: err.to_string(),
        })?;
    guard.disarm();
    info!(
        "built EXT4 image {output:?} ({} blocks, {} inodes)",
        plan.block_count, plan.inode_count
    );
    Ok(())
}

/// Splits a super container into its logical partition images.
pub async fn split_super(image: &Path, out_dir: &Path) -> Result<()> {
    run("lpunpack", Command::new("lpunpack").arg(image).arg(out_dir)).await
        .map_err(|err| RomforgeError::BuilderFailure {
            tool: "lpunpack".to_string(),
            detail: err.to_string(),
        })?;
    Ok(())
}

/// One finished logical partition handed to lpmake.
pub struct SuperPartition {
    pub name: String,
    pub image: PathBuf,
    pub size: u64,
}

/// Assembles finished partition images into one super container.
pub async fn assemble_super(
    partitions: &[SuperPartition],
    super_size: u64,
    output: &Path,
) -> Result<()> {
    let guard = OutputGuard::new(output);
    let mut command = Command::new("lpmake");
    command
        .arg("--metadata-size")
        .arg("65536")
        .arg("--metadata-slots")
        .arg("2")
        .arg("--device")
        .arg(format!("super:{super_size}"))
        .arg("--group")
        .arg(format!("main:{super_size}"));

    for partition in partitions {
        command
            .arg("--partition")
            .arg(format!("{}:readonly:{}:main", partition.name, partition.size))
            .arg("--image")
            .arg(format!("{}={}", partition.name, partition.image.display()));
    }
    command.arg("--output").arg(output);

    run("lpmake", &mut command)
        .await
        .map_err(|err| RomforgeError::BuilderFailure {
            tool: "lpmake".to_string(),
            detail: err.to_string(),
        })?;
    guard.disarm();
    info!("assembled super image {output:?}");
    Ok(())
}
