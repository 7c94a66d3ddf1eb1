//! Applies final ownership, permissions and SELinux contexts to a working
//! tree before image assembly.
//!
//! Three ordered passes over the tree:
//!
//! 1. symlinks, across the whole tree: recreate any link whose target
//!    drifted from the stored one, then fix its ownership and context, so no
//!    later pass trips over a wrong link;
//! 2. directories, parents strictly before children: stored attributes win;
//!    a new directory gets inferred attributes which are immediately
//!    recorded into the working extension of the store, so a new grandchild
//!    chains from its new parent instead of skipping to the root;
//! 3. regular files, in any order.
//!
//! Attribute application is best effort: an individual failure (EPERM on
//! chown, no xattr support) becomes a warning and the run continues.  Only
//! tree traversal itself can fail the operation.

use std::{
    collections::BTreeMap,
    fs,
    os::unix::fs::symlink,
    path::Path,
};

use anyhow::Result;
use log::{debug, info, warn};
use rustix::fs::{
    chmodat, chownat, lgetxattr, lsetxattr, statat, AtFlags, Gid, Mode, Uid, XattrFlags, CWD,
};

use crate::{
    classify::Classification,
    matcher::PatternMatcher,
    store::{FileKind, MetadataStore, PathRecord},
    walk::{walk_tree, WalkEntry},
};

const XATTR_SECURITY_SELINUX: &str = "security.selinux";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeWarning {
    pub path: String,
    pub detail: String,
}

/// Result of one reconciliation run.
#[derive(Debug)]
pub struct Reconciliation {
    /// The snapshot store extended with every record inferred during the
    /// run.  New paths end up with concrete attributes here even when the
    /// filesystem refused to accept them.
    pub store: MetadataStore,
    /// Paths where at least one attribute was actually rewritten.
    pub changed: usize,
    /// Paths whose attributes had to be inferred.
    pub inferred: usize,
    pub symlinks_recreated: usize,
    pub warnings: Vec<AttributeWarning>,
}

impl Reconciliation {
    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

/// What a single path should look like when we are done with it.
struct Desired {
    uid: u32,
    gid: u32,
    /// `None` skips the chmod (symlinks carry no permission bits).
    mode: Option<u32>,
    context: Option<String>,
}

/// Reconciles every path under `root` against the stored metadata.
///
/// `classification` is consulted for reporting; the authoritative
/// stored-vs-inferred branching is record presence in the store, which by
/// construction agrees with it for directories and symlinks.
pub fn apply(
    root: &Path,
    store: &MetadataStore,
    classification: &BTreeMap<String, Classification>,
) -> Result<Reconciliation> {
    let scan = walk_tree(root)?;
    let mut run = Reconciliation {
        store: store.clone(),
        changed: 0,
        inferred: 0,
        symlinks_recreated: 0,
        warnings: Vec::new(),
    };

    // pass 1: symlinks
    for entry in scan.entries.iter().filter(|e| e.kind == FileKind::Symlink) {
        reconcile_symlink(root, entry, &mut run);
    }

    // pass 2: directories.  walk_tree() yields parents before children, which
    // is exactly the ancestor-before-descendant order inference chaining
    // needs.
    for entry in scan.entries.iter().filter(|e| e.kind == FileKind::Directory) {
        reconcile_entry(root, entry, FileKind::Directory, &mut run);
    }

    // pass 3: regular files
    for entry in scan.entries.iter().filter(|e| e.kind == FileKind::Regular) {
        reconcile_entry(root, entry, FileKind::Regular, &mut run);
    }

    // names the store cannot carry still reach the image builders untouched
    for path in &scan.skipped {
        warning(
            &mut run,
            path,
            "non-UTF-8 name; attributes were not reconciled".to_string(),
        );
    }

    let modified = classification
        .values()
        .filter(|c| **c == Classification::Modified)
        .count();
    info!(
        "reconciled {} paths: {} rewritten, {} inferred, {} symlinks recreated, \
         {} modified files, {} warnings",
        scan.entries.len(),
        run.changed,
        run.inferred,
        run.symlinks_recreated,
        modified,
        run.warning_count()
    );
    Ok(run)
}

fn reconcile_symlink(root: &Path, entry: &WalkEntry, run: &mut Reconciliation) {
    let fs_path = entry.fs_path(root);

    // cloned so the record outlives the mutable borrows below
    let desired = match run.store.get(&entry.path).cloned() {
        Some(record) if record.kind == FileKind::Symlink => {
            if let Some(target) = &record.symlink_target {
                restore_symlink_target(&fs_path, &entry.path, target, run);
            }
            Desired {
                uid: record.uid,
                gid: record.gid,
                mode: None,
                context: record.context,
            }
        }
        // no record (or the path used to be something else): infer
        _ => {
            let inferred = PatternMatcher::new(&run.store).resolve(&entry.path, FileKind::Symlink);
            let target = fs::read_link(&fs_path)
                .ok()
                .map(|t| t.to_string_lossy().into_owned());
            run.store.insert(PathRecord {
                path: entry.path.clone(),
                kind: FileKind::Symlink,
                uid: inferred.uid,
                gid: inferred.gid,
                mode: 0o777,
                context: Some(inferred.context.clone()),
                symlink_target: target,
            });
            run.inferred += 1;
            Desired {
                uid: inferred.uid,
                gid: inferred.gid,
                mode: None,
                context: Some(inferred.context),
            }
        }
    };

    apply_attributes(&fs_path, &entry.path, &desired, run);
}

fn restore_symlink_target(fs_path: &Path, path: &str, target: &str, run: &mut Reconciliation) {
    match fs::read_link(fs_path) {
        Ok(live) if live.as_os_str() == target => return,
        Ok(live) => debug!("symlink {path} points at {live:?}, want {target:?}"),
        Err(err) => {
            warning(run, path, format!("reading link target: {err}"));
            return;
        }
    }

    let result = fs::remove_file(fs_path).and_then(|()| symlink(target, fs_path));
    match result {
        Ok(()) => run.symlinks_recreated += 1,
        Err(err) => warning(run, path, format!("recreating symlink: {err}")),
    }
}

fn reconcile_entry(root: &Path, entry: &WalkEntry, kind: FileKind, run: &mut Reconciliation) {
    let fs_path = entry.fs_path(root);

    let desired = match run.store.get(&entry.path) {
        Some(record) if record.kind == kind => Desired {
            uid: record.uid,
            gid: record.gid,
            mode: Some(record.mode),
            context: record.context.clone(),
        },
        _ => {
            let inferred = PatternMatcher::new(&run.store).resolve(&entry.path, kind);
            // feed the inference back so deeper new paths chain from it
            run.store.insert(PathRecord {
                path: entry.path.clone(),
                kind,
                uid: inferred.uid,
                gid: inferred.gid,
                mode: inferred.mode,
                context: Some(inferred.context.clone()),
                symlink_target: None,
            });
            run.inferred += 1;
            Desired {
                uid: inferred.uid,
                gid: inferred.gid,
                mode: Some(inferred.mode),
                context: Some(inferred.context),
            }
        }
    };

    apply_attributes(&fs_path, &entry.path, &desired, run);
}

/// Applies `desired` to one path, never following symlinks, touching only
/// what actually differs.  Failures become warnings.
fn apply_attributes(fs_path: &Path, path: &str, desired: &Desired, run: &mut Reconciliation) {
    let live = match statat(CWD, fs_path, AtFlags::SYMLINK_NOFOLLOW) {
        Ok(buf) => buf,
        Err(err) => {
            warning(run, path, format!("stat: {err}"));
            return;
        }
    };
    let mut touched = false;

    if live.st_uid != desired.uid || live.st_gid != desired.gid {
        match chownat(
            CWD,
            fs_path,
            Some(Uid::from_raw(desired.uid)),
            Some(Gid::from_raw(desired.gid)),
            AtFlags::SYMLINK_NOFOLLOW,
        ) {
            Ok(()) => touched = true,
            Err(err) => warning(
                run,
                path,
                format!("chown {}:{}: {err}", desired.uid, desired.gid),
            ),
        }
    }

    if let Some(mode) = desired.mode {
        if (live.st_mode & 0o7777) as u32 != mode {
            match chmodat(CWD, fs_path, Mode::from_raw_mode(mode), AtFlags::empty()) {
                Ok(()) => touched = true,
                Err(err) => warning(run, path, format!("chmod {mode:o}: {err}")),
            }
        }
    }

    if let Some(context) = &desired.context {
        if read_live_context(fs_path).as_deref() != Some(context) {
            // store with the trailing NUL, as setfilecon(3) would
            let mut value = context.as_bytes().to_vec();
            value.push(0);
            match lsetxattr(fs_path, XATTR_SECURITY_SELINUX, &value, XattrFlags::empty()) {
                Ok(()) => touched = true,
                Err(err) => warning(run, path, format!("setting context {context}: {err}")),
            }
        }
    }

    if touched {
        run.changed += 1;
    }
}

fn read_live_context(fs_path: &Path) -> Option<String> {
    let mut buffer = [0u8; 1024];
    match lgetxattr(fs_path, XATTR_SECURITY_SELINUX, &mut buffer) {
        Ok(len) => {
            let value = &buffer[..len];
            let value = value.strip_suffix(&[0]).unwrap_or(value);
            Some(String::from_utf8_lossy(value).into_owned())
        }
        Err(_) => None,
    }
}

fn warning(run: &mut Reconciliation, path: &str, detail: String) {
    warn!("{path}: {detail}");
    run.warnings.push(AttributeWarning {
        path: path.to_string(),
        detail,
    });
}
