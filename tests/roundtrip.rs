//! End-to-end metadata round trips on plain directory trees: snapshot an
//! assembled tree, persist and reload the artifacts, edit the tree, then
//! classify and reconcile.  No images are mounted or built here, so these
//! run unprivileged.

use std::{fs, os::unix::fs::symlink, os::unix::fs::PermissionsExt, path::Path};

use anyhow::Result;
use similar_asserts::assert_eq;

use romforge::{
    classify::{classify, summarize, Classification},
    persist::{self, FsType, ImageMeta},
    reconcile,
    snapshot::snapshot,
    store::FileKind,
    walk::ARTIFACT_DIR,
};

fn build_tree(root: &Path) -> Result<()> {
    fs::create_dir(root.join("bin"))?;
    fs::write(root.join("bin/sh"), b"#!shell\n")?;
    fs::write(root.join("bin/ls"), b"#!ls\n")?;
    fs::create_dir(root.join("etc"))?;
    fs::write(root.join("etc/hosts"), b"127.0.0.1 localhost\n")?;
    symlink("sh", root.join("bin/bash"))?;
    Ok(())
}

#[test]
fn test_snapshot_persist_reload() -> Result<()> {
    let td = tempfile::tempdir()?;
    build_tree(td.path())?;

    let snap = snapshot(td.path())?;
    let meta = ImageMeta::new("system.img", FsType::Erofs);
    let artifact_dir = td.path().join(ARTIFACT_DIR);
    persist::save(&artifact_dir, "system", &snap.store, &snap.checksums, &meta)?;

    let loaded = persist::load(&artifact_dir)?;
    assert_eq!(loaded.label, "system");
    assert_eq!(loaded.meta.fs_type, FsType::Erofs);
    assert_eq!(loaded.store.len(), snap.store.len());
    assert_eq!(loaded.checksums.len(), snap.checksums.len());

    let sh = loaded.store.get("/bin/sh").expect("sh recorded");
    assert_eq!(sh.kind, FileKind::Regular);
    let bash = loaded.store.get("/bin/bash").expect("bash recorded");
    assert_eq!(bash.kind, FileKind::Symlink);
    assert_eq!(bash.symlink_target.as_deref(), Some("sh"));
    Ok(())
}

#[test]
fn test_classify_after_edits() -> Result<()> {
    let td = tempfile::tempdir()?;
    build_tree(td.path())?;
    let snap = snapshot(td.path())?;

    fs::write(td.path().join("etc/hosts"), b"127.0.0.1 localhost\n::1 ip6\n")?;
    fs::write(td.path().join("bin/toolbox"), b"#!toolbox\n")?;

    let classes = classify(td.path(), &snap.store, &snap.checksums)?;
    assert_eq!(classes.get("/bin/sh"), Some(&Classification::Unchanged));
    assert_eq!(classes.get("/etc/hosts"), Some(&Classification::Modified));
    assert_eq!(classes.get("/bin/toolbox"), Some(&Classification::New));

    let summary = summarize(&classes);
    assert_eq!(summary.modified, 1);
    assert_eq!(summary.new, 1);
    Ok(())
}

#[test]
fn test_reconcile_untouched_tree_changes_nothing() -> Result<()> {
    let td = tempfile::tempdir()?;
    build_tree(td.path())?;
    let snap = snapshot(td.path())?;

    let classes = classify(td.path(), &snap.store, &snap.checksums)?;
    let run = reconcile::apply(td.path(), &snap.store, &classes)?;
    assert_eq!(run.changed, 0);
    assert_eq!(run.warning_count(), 0);
    Ok(())
}

#[test]
fn test_reconcile_new_file_inherits_from_sibling() -> Result<()> {
    let td = tempfile::tempdir()?;
    build_tree(td.path())?;
    // both extension-less siblings carry the same mode, so the inherited
    // value does not depend on which one the matcher picks
    for name in ["bin/sh", "bin/ls"] {
        fs::set_permissions(td.path().join(name), fs::Permissions::from_mode(0o750))?;
    }
    let snap = snapshot(td.path())?;

    fs::write(td.path().join("bin/toolbox"), b"#!toolbox\n")?;
    let classes = classify(td.path(), &snap.store, &snap.checksums)?;
    let run = reconcile::apply(td.path(), &snap.store, &classes)?;

    assert_eq!(run.inferred, 1);
    let meta = fs::symlink_metadata(td.path().join("bin/toolbox"))?;
    assert_eq!(meta.permissions().mode() & 0o7777, 0o750);
    Ok(())
}
