//! Super container handling.
//!
//! Logical partitions share nothing, so their unpacks and repacks run as
//! independent tasks on a `JoinSet`.  The aggregation points are the only
//! ordering constraints: every partition must finish before lpmake runs, and
//! one partition's fatal error aborts the still-queued work while leaving
//! already-finished partitions on disk.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::task::JoinSet;

use crate::{
    error::RomforgeError,
    persist::{self, FsType, ImageMeta},
    repack::{repack_partition, RepackOptions},
    tools::{self, SuperPartition},
    unpack::{image_label, unpack_partition},
    walk::ARTIFACT_DIR,
};

/// Splits a super image and unpacks every logical partition concurrently.
pub(crate) async fn unpack_super(image: &Path, raw: &Path, out_dir: &Path) -> Result<()> {
    let split_dir = tempfile::TempDir::new()?;
    tools::split_super(raw, split_dir.path()).await?;

    let mut names = Vec::new();
    for item in fs::read_dir(split_dir.path())? {
        let path = item?.path();
        if path.extension().is_some_and(|ext| ext == "img") {
            // lpunpack emits empty files for unused slots
            if fs::metadata(&path)?.len() > 0 {
                names.push(image_label(&path));
            }
        }
    }
    names.sort();
    info!("super image contains {} partitions: {names:?}", names.len());

    let mut tasks = JoinSet::new();
    for name in &names {
        let part_image = split_dir.path().join(format!("{name}.img"));
        let part_out = out_dir.join(name);
        let name = name.clone();
        tasks.spawn(async move {
            let detected = tools::detect_fs_type(&part_image)?;
            unpack_partition(&part_image, &part_image, &part_out, detected)
                .await
                .with_context(|| format!("unpacking partition {name}"))
        });
    }
    drain(tasks).await?;

    let mut meta = ImageMeta::new(image.display().to_string(), FsType::Super);
    meta.super_size = Some(fs::metadata(raw)?.len());
    meta.partitions = names;
    persist::save_meta(&out_dir.join(ARTIFACT_DIR), "super", &meta)
}

/// Repacks every partition tree concurrently, then assembles the container.
pub(crate) async fn repack_super(
    dir: &Path,
    out_image: &Path,
    options: &RepackOptions,
) -> Result<()> {
    let (meta, _) = persist::load_meta(&dir.join(ARTIFACT_DIR))?;
    let super_size = meta
        .super_size
        .context("super metadata is missing SUPER_SIZE")?;

    // durable, so a failed run leaves finished partition images behind
    let stage = stage_dir(out_image);
    fs::create_dir_all(&stage).with_context(|| format!("creating {stage:?}"))?;

    let mut tasks = JoinSet::new();
    for name in &meta.partitions {
        let part_dir = dir.join(name);
        let part_image = stage.join(format!("{name}.img"));
        let options = options.clone();
        let name = name.clone();
        tasks.spawn(async move {
            repack_partition(&part_dir, &part_image, &options)
                .await
                .with_context(|| format!("repacking partition {name}"))
        });
    }
    if let Err(err) = drain(tasks).await {
        warn!("finished partition images remain in {stage:?}");
        return Err(err);
    }

    let mut partitions = Vec::new();
    for name in &meta.partitions {
        let image = stage.join(format!("{name}.img"));
        partitions.push(SuperPartition {
            name: name.clone(),
            size: fs::metadata(&image)?.len(),
            image,
        });
    }

    let required: u64 = partitions.iter().map(|p| p.size).sum();
    if required > super_size {
        warn!("partition images remain in {stage:?}");
        return Err(RomforgeError::CapacityExceeded {
            required,
            available: super_size,
            unit: "bytes",
        }
        .into());
    }

    tools::assemble_super(&partitions, super_size, out_image).await?;
    fs::remove_dir_all(&stage).with_context(|| format!("removing {stage:?}"))?;
    Ok(())
}

/// Staging area for finished partition images, next to the final output so
/// it survives a failed run for inspection and resumption.
fn stage_dir(out_image: &Path) -> PathBuf {
    let name = out_image
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("super");
    out_image.with_file_name(format!("{name}.partitions"))
}

/// Awaits every task; the first failure cancels the rest.  Partitions that
/// already completed keep their on-disk results.
async fn drain(mut tasks: JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("aborting remaining partitions: {err:#}");
                tasks.shutdown().await;
                return Err(err);
            }
            Err(join_err) => {
                tasks.shutdown().await;
                return Err(anyhow::anyhow!("partition task panicked: {join_err}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_dir_is_a_sibling_of_the_output() {
        assert_eq!(
            stage_dir(Path::new("/build/super-new.img")),
            Path::new("/build/super-new.img.partitions")
        );
    }

    #[tokio::test]
    async fn test_failed_partition_repack_keeps_stage() -> Result<()> {
        let td = tempfile::tempdir()?;
        let work = td.path().join("work");
        fs::create_dir(&work)?;
        let mut meta = ImageMeta::new("super.img", FsType::Super);
        meta.super_size = Some(1 << 20);
        // the listed partition tree does not exist, so its task fails fast
        meta.partitions = vec!["ghost".into()];
        persist::save_meta(&work.join(ARTIFACT_DIR), "super", &meta)?;

        let out = td.path().join("super-new.img");
        assert!(repack_super(&work, &out, &RepackOptions::default())
            .await
            .is_err());
        assert!(stage_dir(&out).is_dir());
        Ok(())
    }
}
