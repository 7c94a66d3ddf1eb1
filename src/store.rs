//! The path-indexed metadata snapshot.
//!
//! A [`MetadataStore`] holds one [`PathRecord`] per filesystem entry captured
//! at unpack time, keyed by absolute path ("/" is the filesystem root).  A
//! [`ChecksumTable`] holds one content digest per regular file.  Both are
//! written out as the hand-off artifact of an unpack and read back, untouched,
//! by a later repack.

use std::collections::BTreeMap;

/// The three entry kinds the metadata model distinguishes.
///
/// Device nodes, fifos and sockets are not representable: partition trees
/// that contain them have those entries skipped (with a warning) at capture
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

/// Ownership, permissions, security context and (for symlinks) the link
/// target of a single filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    /// Absolute path within the image, "/" for the root itself.
    pub path: String,
    pub kind: FileKind,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits only (including setuid/setgid/sticky), no file type.
    pub mode: u32,
    /// SELinux context, `None` when it could not be read at capture time.
    /// An unknown context is tolerated everywhere and never applied.
    pub context: Option<String>,
    /// Only present when `kind == FileKind::Symlink`.
    pub symlink_target: Option<String>,
}

/// Append-only map of path → [`PathRecord`].
///
/// Backed by a `BTreeMap` so that iteration is in lexical path order; the
/// sibling scan in [`crate::matcher`] depends on that for reproducible
/// results.
#[derive(Debug, Clone, Default)]
pub struct MetadataStore {
    records: BTreeMap<String, PathRecord>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: PathRecord) {
        self.records.insert(record.path.clone(), record);
    }

    /// Exact-path lookup.  Absence is not an error: it means "unknown, defer
    /// to the pattern matcher".
    pub fn get(&self, path: &str) -> Option<&PathRecord> {
        self.records.get(path)
    }

    /// The root record.  Guaranteed present after a successful snapshot.
    pub fn root(&self) -> Option<&PathRecord> {
        self.records.get("/")
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathRecord> {
        self.records.values()
    }

    /// Iterates the records whose *parent* is `dir`, in lexical order.
    pub fn children_of<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a PathRecord> + 'a {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        let dir = dir.to_string();
        self.records
            .range(prefix.clone()..)
            .take_while(move |(path, _)| path.starts_with(&prefix))
            .filter(move |(path, _)| parent_path(path) == Some(dir.as_str()))
            .map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Map of absolute path → SHA-256 content digest (lowercase hex) captured at
/// unpack time.  Used only for change detection.
#[derive(Debug, Clone, Default)]
pub struct ChecksumTable {
    sums: BTreeMap<String, String>,
}

impl ChecksumTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, digest: impl Into<String>) {
        self.sums.insert(path.into(), digest.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.sums.get(path).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.sums.iter().map(|(p, d)| (p.as_str(), d.as_str()))
    }

    pub fn len(&self) -> usize {
        self.sums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }
}

/// Parent of an absolute image path: "/a/b" → "/a", "/a" → "/", "/" → None.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// File extension of the final path component, without the dot.  A name with
/// no dot (or only a leading dot) has no extension.
pub fn extension_of(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&name[idx + 1..]),
    }
}

/// Number of components below the root: "/" → 0, "/a" → 1, "/a/b" → 2.
pub fn depth_of(path: &str) -> usize {
    if path == "/" {
        0
    } else {
        path.matches('/').count()
    }
}

/// Joins an absolute image path onto a parent: ("/", "x") → "/x".
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}
