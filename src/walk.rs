//! Shared traversal of a live working tree.
//!
//! Classification, reconciliation and content measurement all need the same
//! view of the tree: every entry with its image-absolute path, kind and
//! depth, in a deterministic order, with the artifact directory and
//! non-model entry kinds (devices, fifos, sockets) left out.

use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use log::warn;

use crate::store::{depth_of, join_path, FileKind};

/// Name of the artifact directory an unpack leaves at the top of the working
/// tree.  Never part of the image.
pub const ARTIFACT_DIR: &str = ".romforge";

#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Image-absolute path ("/" for the root itself).
    pub path: String,
    pub kind: FileKind,
    pub depth: usize,
    /// Byte size for regular files, 0 otherwise.
    pub size: u64,
}

impl WalkEntry {
    /// The on-disk location of this entry under the working tree `root`.
    pub fn fs_path(&self, root: &Path) -> PathBuf {
        root.join(self.path.trim_start_matches('/'))
    }
}

/// Everything found under one working tree.
#[derive(Debug, Default)]
pub struct TreeScan {
    pub entries: Vec<WalkEntry>,
    /// Paths present on disk whose names the metadata store cannot carry
    /// (non-UTF-8).  The image builders will still pick them up, so they
    /// must be surfaced to the caller rather than dropped silently.
    pub skipped: Vec<String>,
}

/// Walks the tree depth-first, parents before children, names sorted within
/// each directory.  Symlinks are never followed.  The root entry is always
/// first.
pub fn walk_tree(root: &Path) -> Result<TreeScan> {
    let mut scan = TreeScan::default();
    scan.entries.push(WalkEntry {
        path: "/".to_string(),
        kind: FileKind::Directory,
        depth: 0,
        size: 0,
    });
    walk_dir(root, "/", &mut scan)?;
    Ok(scan)
}

fn walk_dir(fs_dir: &Path, image_dir: &str, out: &mut TreeScan) -> Result<()> {
    let mut names = Vec::new();
    for item in fs::read_dir(fs_dir).with_context(|| format!("reading directory {fs_dir:?}"))? {
        names.push(item?.file_name());
    }
    names.sort();

    for name in names {
        let Some(name) = name.to_str().map(str::to_owned) else {
            warn!("skipping non-UTF-8 filename {name:?} in {image_dir}");
            out.skipped
                .push(join_path(image_dir, &name.to_string_lossy()));
            continue;
        };
        if image_dir == "/" && name == ARTIFACT_DIR {
            continue;
        }

        let fs_path = fs_dir.join(&name);
        let meta = fs::symlink_metadata(&fs_path)
            .with_context(|| format!("stat of {fs_path:?}"))?;
        let path = join_path(image_dir, &name);

        let kind = if meta.file_type().is_dir() {
            FileKind::Directory
        } else if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else if meta.file_type().is_file() {
            FileKind::Regular
        } else {
            warn!("skipping special file {path} (device/fifo/socket)");
            continue;
        };

        out.entries.push(WalkEntry {
            depth: depth_of(&path),
            size: if kind == FileKind::Regular { meta.len() } else { 0 },
            path: path.clone(),
            kind,
        });

        if kind == FileKind::Directory {
            walk_dir(&fs_path, &path, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    #[test]
    fn test_walk_order_and_kinds() -> Result<()> {
        let td = tempfile::tempdir()?;
        fs::create_dir(td.path().join("b"))?;
        fs::write(td.path().join("b/file"), b"data")?;
        fs::create_dir(td.path().join("a"))?;
        symlink("b/file", td.path().join("link"))?;
        fs::create_dir(td.path().join(ARTIFACT_DIR))?;
        fs::write(td.path().join(ARTIFACT_DIR).join("metadata.x"), b"")?;

        let scan = walk_tree(td.path())?;
        let paths: Vec<&str> = scan.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/a", "/b", "/b/file", "/link"]);
        assert!(scan.skipped.is_empty());

        assert_eq!(scan.entries[0].kind, FileKind::Directory);
        assert_eq!(scan.entries[0].depth, 0);
        let file = scan.entries.iter().find(|e| e.path == "/b/file").unwrap();
        assert_eq!(file.kind, FileKind::Regular);
        assert_eq!(file.size, 4);
        assert_eq!(file.depth, 2);
        let link = scan.entries.iter().find(|e| e.path == "/link").unwrap();
        assert_eq!(link.kind, FileKind::Symlink);
        Ok(())
    }

    #[test]
    fn test_non_utf8_names_are_reported_not_walked() -> Result<()> {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

        let td = tempfile::tempdir()?;
        fs::write(td.path().join("ok"), b"x")?;
        fs::write(td.path().join(OsStr::from_bytes(b"bad\xff")), b"y")?;

        let scan = walk_tree(td.path())?;
        let paths: Vec<&str> = scan.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/ok"]);
        assert_eq!(scan.skipped.len(), 1);
        assert!(scan.skipped[0].starts_with("/bad"));
        Ok(())
    }

    #[test]
    fn test_fs_path_round_trip() {
        let entry = WalkEntry {
            path: "/system/bin/sh".to_string(),
            kind: FileKind::Regular,
            depth: 3,
            size: 0,
        };
        assert_eq!(
            entry.fs_path(Path::new("/tmp/work")),
            Path::new("/tmp/work/system/bin/sh")
        );
    }
}
