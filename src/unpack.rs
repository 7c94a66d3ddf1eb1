//! The unpack pipeline: image file → editable working tree + artifacts.

use std::{fs, os::unix::fs::symlink, path::Path};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::{
    error::RomforgeError,
    persist::{self, FsType, ImageMeta},
    snapshot::snapshot,
    store::FileKind,
    superimg,
    tools::{self, MountGuard},
    walk::{walk_tree, ARTIFACT_DIR},
};

/// Unpacks `image` into `out_dir`: mounts it read-only, snapshots all
/// metadata, copies the tree out for editing and persists the hand-off
/// artifacts.  Dispatches super containers to the per-partition pipeline.
pub async fn unpack(image: &Path, out_dir: &Path) -> Result<()> {
    if !image.is_file() {
        return Err(RomforgeError::NotFound(image.to_path_buf()).into());
    }

    // sparse images can't be mounted or sniffed; convert first
    let raw_holder = tempfile::TempDir::new()?;
    let source = if tools::is_sparse_image(image)? {
        let raw = raw_holder.path().join("raw.img");
        info!("converting sparse image {image:?} to raw");
        tools::sparse_to_raw(image, &raw).await?;
        raw
    } else {
        image.to_path_buf()
    };

    match tools::detect_fs_type(&source)? {
        Some(FsType::Super) => superimg::unpack_super(image, &source, out_dir).await,
        detected => {
            unpack_partition(image, &source, out_dir, detected).await?;
            Ok(())
        }
    }
}

/// Unpacks a single (non-super) partition image.
pub(crate) async fn unpack_partition(
    image: &Path,
    source: &Path,
    out_dir: &Path,
    detected: Option<FsType>,
) -> Result<()> {
    let mount = mount_with_fallback(source, detected).await?;
    let fs_type = detected.unwrap_or(FsType::Ext4);

    info!("capturing metadata snapshot of {image:?}");
    let snap = snapshot(mount.path())?;

    fs::create_dir_all(out_dir).with_context(|| format!("creating {out_dir:?}"))?;
    let (files, bytes) = copy_tree(mount.path(), out_dir)?;
    info!("extracted {files} files ({bytes} bytes) to {out_dir:?}");

    let mut meta = ImageMeta::new(image.display().to_string(), fs_type);
    if fs_type == FsType::Ext4 {
        meta.ext4 = Some(tools::probe_ext4(source).await?);
    }

    persist::save(
        &out_dir.join(ARTIFACT_DIR),
        &image_label(image),
        &snap.store,
        &snap.checksums,
        &meta,
    )
}

/// Mounts read-only, retrying once after a filesystem repair for EXT4.
async fn mount_with_fallback(source: &Path, detected: Option<FsType>) -> Result<MountGuard> {
    match tools::mount_image_ro(source).await {
        Ok(mount) => Ok(mount),
        Err(err) if detected == Some(FsType::Ext4) => {
            warn!("mount failed ({err}), attempting repair");
            tools::repair_ext4(source).await?;
            match tools::mount_image_ro(source).await {
                Ok(mount) => Ok(mount),
                Err(_) => Err(RomforgeError::UnmountableImage(source.to_path_buf()).into()),
            }
        }
        Err(_) => Err(RomforgeError::UnmountableImage(source.to_path_buf()).into()),
    }
}

/// Copies the mounted tree into the working directory.  Content and
/// permission bits only: ownership and contexts live in the artifacts and
/// are reapplied at repack time.
fn copy_tree(src_root: &Path, dst_root: &Path) -> Result<(u64, u64)> {
    let mut files = 0;
    let mut bytes = 0;

    for entry in walk_tree(src_root)?.entries {
        if entry.path == "/" {
            continue;
        }
        let src = entry.fs_path(src_root);
        let dst = entry.fs_path(dst_root);

        match entry.kind {
            FileKind::Directory => {
                fs::create_dir(&dst).with_context(|| format!("creating {dst:?}"))?;
                if let Ok(meta) = fs::metadata(&src) {
                    fs::set_permissions(&dst, meta.permissions()).ok();
                }
            }
            FileKind::Regular => {
                bytes += fs::copy(&src, &dst).with_context(|| format!("copying {src:?}"))?;
                files += 1;
            }
            FileKind::Symlink => {
                let target = fs::read_link(&src)?;
                symlink(&target, &dst).with_context(|| format!("creating symlink {dst:?}"))?;
            }
        }
    }

    Ok((files, bytes))
}

/// Artifact label: the image's file stem ("system.img" → "system").
pub(crate) fn image_label(image: &Path) -> String {
    image
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("image")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_label() {
        assert_eq!(image_label(Path::new("/x/system.img")), "system");
        assert_eq!(image_label(Path::new("vendor.img")), "vendor");
        assert_eq!(image_label(Path::new("odd")), "odd");
    }

    #[test]
    fn test_copy_tree_reproduces_structure() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        fs::create_dir(src.path().join("etc"))?;
        fs::write(src.path().join("etc/config"), b"a=1\n")?;
        symlink("config", src.path().join("etc/link"))?;

        let (files, bytes) = copy_tree(src.path(), dst.path())?;
        assert_eq!(files, 1);
        assert_eq!(bytes, 4);
        assert_eq!(fs::read(dst.path().join("etc/config"))?, b"a=1\n");
        assert_eq!(
            fs::read_link(dst.path().join("etc/link"))?.to_str(),
            Some("config")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unpack_missing_image_is_not_found() {
        let err = unpack(Path::new("/nonexistent.img"), Path::new("/tmp/out"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast::<RomforgeError>(),
            Ok(RomforgeError::NotFound(_))
        ));
    }
}
