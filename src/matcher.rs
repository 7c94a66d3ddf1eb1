//! Attribute inference for paths with no stored record.
//!
//! When a user drops a new file into the working tree there is nothing in the
//! [`MetadataStore`] to restore, so the matcher guesses: first from a
//! same-extension sibling in the same directory, then from the nearest
//! recorded ancestor, and finally from a small table of per-prefix defaults.
//! Once the store contains at least a root record, resolution always
//! terminates with a concrete answer.

use log::debug;

use crate::store::{extension_of, parent_path, FileKind, MetadataStore, PathRecord};

pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_DIR_MODE: u32 = 0o755;
pub const DEFAULT_SYMLINK_MODE: u32 = 0o777;

const VENDOR_CONTEXT: &str = "u:object_r:vendor_file:s0";
const SYSTEM_CONTEXT: &str = "u:object_r:system_file:s0";

/// Fully-resolved attributes for a path that had no stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredAttributes {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub context: String,
}

/// A read-only inference view over a [`MetadataStore`].
///
/// The reconciler extends its working copy of the store as it infers new
/// directories, then builds a fresh (cheap) matcher per lookup so that deeper
/// paths chain from the freshly inferred records.
pub struct PatternMatcher<'a> {
    store: &'a MetadataStore,
}

impl<'a> PatternMatcher<'a> {
    pub fn new(store: &'a MetadataStore) -> Self {
        Self { store }
    }

    /// Walks parent directories toward the root and returns the first
    /// recorded one.  With a root record present this never comes back
    /// empty-handed; `None` is only possible for an empty store.
    pub fn match_by_ancestor(&self, path: &str) -> Option<&'a PathRecord> {
        let mut cursor = path;
        while let Some(parent) = parent_path(cursor) {
            if let Some(record) = self.store.get(parent) {
                return Some(record);
            }
            cursor = parent;
        }
        self.store.root()
    }

    /// Finds another regular file in the same directory with the same
    /// extension.  Files without an extension match other extension-less
    /// files ("/bin/toolbox" inherits from "/bin/sh").  The store iterates in
    /// lexical order, so the first match is stable across runs.
    pub fn match_by_sibling(&self, path: &str) -> Option<&'a PathRecord> {
        let parent = parent_path(path)?;
        let wanted = extension_of(path);
        self.store
            .children_of(parent)
            .find(|sibling| {
                sibling.kind == FileKind::Regular
                    && sibling.path != path
                    && extension_of(&sibling.path) == wanted
            })
    }

    /// Infers attributes for `path`: sibling match (regular files only),
    /// then ancestor match, then built-in defaults.  The default mode only
    /// yields to a matched record of the *same* kind; a file inheriting from
    /// an ancestor directory keeps mode 644 rather than picking up 755.
    pub fn resolve(&self, path: &str, kind: FileKind) -> InferredAttributes {
        let default_mode = match kind {
            FileKind::Regular => DEFAULT_FILE_MODE,
            FileKind::Directory => DEFAULT_DIR_MODE,
            FileKind::Symlink => DEFAULT_SYMLINK_MODE,
        };

        let matched = match kind {
            FileKind::Regular => self
                .match_by_sibling(path)
                .or_else(|| self.match_by_ancestor(path)),
            _ => self.match_by_ancestor(path),
        };

        match matched {
            Some(record) => {
                debug!("inferred attributes for {path} from {}", record.path);
                InferredAttributes {
                    uid: record.uid,
                    gid: record.gid,
                    mode: if record.kind == kind {
                        record.mode
                    } else {
                        default_mode
                    },
                    context: record
                        .context
                        .clone()
                        .unwrap_or_else(|| default_context(path).to_string()),
                }
            }
            None => InferredAttributes {
                uid: 0,
                gid: 0,
                mode: default_mode,
                context: default_context(path).to_string(),
            },
        }
    }
}

/// Terminal fallback: vendor-side paths get a vendor label, everything else
/// the generic system label.
pub fn default_context(path: &str) -> &'static str {
    for prefix in ["/vendor", "/odm", "/vendor_dlkm", "/odm_dlkm"] {
        if path == prefix || path.starts_with(&format!("{prefix}/")) {
            return VENDOR_CONTEXT;
        }
    }
    SYSTEM_CONTEXT
}
