//! Three-way change classification of a working tree.
//!
//! Regular files are compared against the checksum table captured at unpack
//! time; directories and symlinks only against record presence (attribute
//! drift on an existing directory is folded into "unchanged" and the stored
//! attributes win at reconcile time).

use std::{collections::BTreeMap, fs::File, path::Path};

use anyhow::{Context, Result};
use log::debug;

use crate::{
    store::{ChecksumTable, FileKind, MetadataStore},
    util::sha256_hex,
    walk::{walk_tree, WalkEntry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unchanged,
    Modified,
    New,
}

/// Classifies every path in the working tree rooted at `root`.
///
/// The result covers each path exactly once (the root itself included) and
/// depends only on tree content, `store` and `checksums`, not on traversal
/// order.  Paths that existed at snapshot time but were deleted from the tree
/// simply do not appear; deletions are permitted.
pub fn classify(
    root: &Path,
    store: &MetadataStore,
    checksums: &ChecksumTable,
) -> Result<BTreeMap<String, Classification>> {
    let mut result = BTreeMap::new();

    for entry in walk_tree(root)?.entries {
        let class = classify_one(root, &entry, store, checksums)?;
        debug!("{}: {:?}", entry.path, class);
        result.insert(entry.path, class);
    }

    Ok(result)
}

fn classify_one(
    root: &Path,
    entry: &WalkEntry,
    store: &MetadataStore,
    checksums: &ChecksumTable,
) -> Result<Classification> {
    match entry.kind {
        FileKind::Regular => match checksums.get(&entry.path) {
            Some(stored) => {
                let file = File::open(entry.fs_path(root))
                    .with_context(|| format!("opening {} for hashing", entry.path))?;
                let live = sha256_hex(file)
                    .with_context(|| format!("hashing {}", entry.path))?;
                if live == stored {
                    Ok(Classification::Unchanged)
                } else {
                    Ok(Classification::Modified)
                }
            }
            None => Ok(Classification::New),
        },
        // no content checksum for these; presence in the store decides
        FileKind::Directory | FileKind::Symlink => match store.get(&entry.path) {
            Some(_) => Ok(Classification::Unchanged),
            None => Ok(Classification::New),
        },
    }
}

/// Counts per classification, for the end-of-run report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSummary {
    pub unchanged: usize,
    pub modified: usize,
    pub new: usize,
}

pub fn summarize(classification: &BTreeMap<String, Classification>) -> ChangeSummary {
    let mut summary = ChangeSummary::default();
    for class in classification.values() {
        match class {
            Classification::Unchanged => summary.unchanged += 1,
            Classification::Modified => summary.modified += 1,
            Classification::New => summary.new += 1,
        }
    }
    summary
}
