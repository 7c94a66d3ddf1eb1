//! The repack pipeline: edited working tree + artifacts → bootable image.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::{
    classify::{classify, summarize},
    error::RomforgeError,
    persist::{self, FsType},
    planner::{self, DEFAULT_OVERHEAD_PERCENT},
    reconcile,
    store::FileKind,
    superimg,
    tools::{self, ErofsCompression},
    walk::{walk_tree, ARTIFACT_DIR},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ext4Mode {
    Strict,
    #[default]
    Flexible,
}

impl FromStr for Ext4Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Ext4Mode::Strict),
            "flexible" => Ok(Ext4Mode::Flexible),
            other => Err(format!("unknown ext4 mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepackOptions {
    /// Overrides the filesystem type recorded at unpack time.
    pub fs_override: Option<FsType>,
    pub ext4_mode: Ext4Mode,
    pub overhead_percent: u32,
    pub erofs_compression: ErofsCompression,
    pub erofs_level: Option<u32>,
}

impl Default for RepackOptions {
    fn default() -> Self {
        Self {
            fs_override: None,
            ext4_mode: Ext4Mode::default(),
            overhead_percent: DEFAULT_OVERHEAD_PERCENT,
            erofs_compression: ErofsCompression::default(),
            erofs_level: None,
        }
    }
}

/// Repacks the working tree in `dir` into `out_image`.
pub async fn repack(dir: &Path, out_image: &Path, options: &RepackOptions) -> Result<()> {
    let artifact_dir = dir.join(ARTIFACT_DIR);
    let (meta, _) = persist::load_meta(&artifact_dir)?;

    if meta.fs_type == FsType::Super {
        return superimg::repack_super(dir, out_image, options).await;
    }
    repack_partition(dir, out_image, options).await
}

/// Repacks a single (non-super) partition tree.
pub(crate) async fn repack_partition(
    dir: &Path,
    out_image: &Path,
    options: &RepackOptions,
) -> Result<()> {
    if !dir.is_dir() {
        return Err(RomforgeError::NotFound(dir.to_path_buf()).into());
    }
    let artifacts = persist::load(&dir.join(ARTIFACT_DIR))?;

    let classes = classify(dir, &artifacts.store, &artifacts.checksums)?;
    let summary = summarize(&classes);
    info!(
        "classified {} paths: {} unchanged, {} modified, {} new",
        classes.len(),
        summary.unchanged,
        summary.modified,
        summary.new
    );

    let run = reconcile::apply(dir, &artifacts.store, &classes)?;
    if run.warning_count() > 0 {
        warn!(
            "{} attribute(s) could not be applied; continuing",
            run.warning_count()
        );
    }

    let fs_type = options.fs_override.unwrap_or(artifacts.meta.fs_type);
    let content = measure_tree(dir)?;

    // keep the artifact directory out of the built image
    let stash = ArtifactStash::new(dir)?;
    let result = build_image(dir, out_image, options, fs_type, &artifacts, &content).await;
    drop(stash);
    result?;

    info!("repacked {dir:?} into {out_image:?} as {fs_type}");
    Ok(())
}

async fn build_image(
    dir: &Path,
    out_image: &Path,
    options: &RepackOptions,
    fs_type: FsType,
    artifacts: &persist::Artifacts,
    content: &ContentMeasure,
) -> Result<()> {
    match fs_type {
        FsType::Erofs => {
            tools::build_erofs(
                dir,
                out_image,
                options.erofs_compression,
                options.erofs_level,
            )
            .await
        }
        FsType::Ext4 => {
            let geometry = artifacts.meta.ext4.as_ref();
            let plan = match options.ext4_mode {
                Ext4Mode::Strict => {
                    let geometry = geometry.context(
                        "strict mode needs the original geometry, which the artifacts lack",
                    )?;
                    planner::plan_strict(
                        geometry.block_count,
                        geometry.inode_count,
                        content.bytes,
                        content.inodes(),
                    )?
                }
                Ext4Mode::Flexible => planner::plan_flexible(
                    content.bytes,
                    content.files + content.symlinks,
                    content.dirs,
                    options.overhead_percent,
                ),
            };
            info!(
                "EXT4 plan: {} blocks of {} bytes, {} inodes",
                plan.block_count, plan.block_size, plan.inode_count
            );
            tools::build_ext4(dir, out_image, &plan, geometry).await
        }
        FsType::Super => unreachable!("super images are repacked per partition"),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ContentMeasure {
    pub bytes: u64,
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
}

impl ContentMeasure {
    fn inodes(&self) -> u64 {
        self.files + self.dirs + self.symlinks
    }
}

/// Sums up what will go into the image (the artifact directory excluded by
/// the tree walk).
pub(crate) fn measure_tree(dir: &Path) -> Result<ContentMeasure> {
    let mut measure = ContentMeasure::default();
    for entry in walk_tree(dir)?.entries {
        match entry.kind {
            FileKind::Regular => {
                measure.files += 1;
                measure.bytes += entry.size;
            }
            FileKind::Directory => measure.dirs += 1,
            FileKind::Symlink => measure.symlinks += 1,
        }
    }
    Ok(measure)
}

/// Temporarily moves the artifact directory next to the working tree so the
/// image builders never see it; moves it back on drop, on success and
/// failure alike.
struct ArtifactStash {
    original: PathBuf,
    stashed: PathBuf,
}

impl ArtifactStash {
    fn new(dir: &Path) -> Result<Option<Self>> {
        let original = dir.join(ARTIFACT_DIR);
        if !original.exists() {
            return Ok(None);
        }
        // a sibling of the working tree: same filesystem, so rename works
        let parent = dir.parent().unwrap_or(dir);
        let stashed = parent.join(format!(".romforge-stash-{}", std::process::id()));
        fs::rename(&original, &stashed)
            .with_context(|| format!("stashing {original:?} aside"))?;
        Ok(Some(Self { original, stashed }))
    }
}

impl Drop for ArtifactStash {
    fn drop(&mut self) {
        if let Err(err) = fs::rename(&self.stashed, &self.original) {
            warn!(
                "could not restore artifact directory {:?}: {err}",
                self.original
            );
        }
    }
}
