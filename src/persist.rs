//! The on-disk hand-off artifact.
//!
//! An unpack leaves five line-oriented text files in the artifact directory
//! at the top of the working tree; a later repack (possibly a different
//! process, days later) reads them back.  Formats:
//!
//! - `fs-config.<label>`: `<path> <uid> <gid> <mode>` (octal mode, optional
//!   trailing `capabilities=<hex>` tolerated on input)
//! - `file_contexts.<label>`: `<path> <context>` (`?` for unknown)
//! - `symlink_info.<label>`: `<path> <target> <uid> <gid> <mode> <context>`
//! - `original_checksums.<label>`: `<sha256>  .<path>`
//! - `metadata.<label>`: `KEY=value` pairs
//!
//! Everything is parsed once into the structured [`MetadataStore`] /
//! [`ChecksumTable`] types at load time; nothing re-parses text per lookup.

use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use log::info;

use crate::{
    error::RomforgeError,
    store::{ChecksumTable, FileKind, MetadataStore, PathRecord},
};

/// Placeholder for a context that could not be read at capture time.  Parsed
/// back to `None` and never applied to a filesystem.
const UNKNOWN_CONTEXT: &str = "?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Erofs,
    Ext4,
    Super,
}

impl FsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::Erofs => "erofs",
            FsType::Ext4 => "ext4",
            FsType::Super => "super",
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "erofs" => Ok(FsType::Erofs),
            "ext4" => Ok(FsType::Ext4),
            "super" => Ok(FsType::Super),
            other => Err(format!("unknown filesystem type {other:?}")),
        }
    }
}

/// Geometry of the original EXT4 image, needed for strict-mode repacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ext4Geometry {
    pub block_count: u64,
    pub inode_count: u64,
    pub uuid: String,
    pub volume_name: String,
    pub inode_size: u32,
    pub features: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub unpack_time: u64,
    pub source_image: String,
    pub fs_type: FsType,
    pub ext4: Option<Ext4Geometry>,
    /// Declared size of the super container, when the source was one.
    pub super_size: Option<u64>,
    /// Logical partition names, for super containers.
    pub partitions: Vec<String>,
}

impl ImageMeta {
    pub fn new(source_image: impl Into<String>, fs_type: FsType) -> Self {
        Self {
            unpack_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            source_image: source_image.into(),
            fs_type,
            ext4: None,
            super_size: None,
            partitions: Vec::new(),
        }
    }
}

/// Everything a repack needs, as loaded from the artifact directory.
#[derive(Debug)]
pub struct Artifacts {
    pub store: MetadataStore,
    pub checksums: ChecksumTable,
    pub meta: ImageMeta,
    pub label: String,
}

pub fn save(
    artifact_dir: &Path,
    label: &str,
    store: &MetadataStore,
    checksums: &ChecksumTable,
    meta: &ImageMeta,
) -> Result<()> {
    validate_representable(store)?;
    fs::create_dir_all(artifact_dir)
        .with_context(|| format!("creating artifact directory {artifact_dir:?}"))?;

    write_fs_config(&artifact_dir.join(format!("fs-config.{label}")), store)?;
    write_file_contexts(&artifact_dir.join(format!("file_contexts.{label}")), store)?;
    write_symlink_info(&artifact_dir.join(format!("symlink_info.{label}")), store)?;
    write_checksums(
        &artifact_dir.join(format!("original_checksums.{label}")),
        checksums,
    )?;
    write_metadata(&artifact_dir.join(format!("metadata.{label}")), meta)?;

    info!(
        "saved artifacts for {} paths ({} checksums) to {artifact_dir:?}",
        store.len(),
        checksums.len()
    );
    Ok(())
}

pub fn load(artifact_dir: &Path) -> Result<Artifacts> {
    let label = find_label(artifact_dir)?;

    let meta = parse_metadata(&artifact_dir.join(format!("metadata.{label}")))?;
    let configs = parse_fs_config(&artifact_dir.join(format!("fs-config.{label}")))?;
    let contexts = parse_file_contexts(&artifact_dir.join(format!("file_contexts.{label}")))?;
    let symlinks = parse_symlink_info(&artifact_dir.join(format!("symlink_info.{label}")))?;
    let checksums = parse_checksums(&artifact_dir.join(format!("original_checksums.{label}")))?;

    // Kind reconstruction: every symlink is in symlink_info, every regular
    // file has a checksum, everything else is a directory.
    let mut store = MetadataStore::new();
    for (path, (uid, gid, mode)) in &configs {
        let (kind, symlink_target) = if let Some(target) = symlinks.get(path) {
            (FileKind::Symlink, Some(target.clone()))
        } else if checksums.get(path).is_some() {
            (FileKind::Regular, None)
        } else {
            (FileKind::Directory, None)
        };
        store.insert(PathRecord {
            path: path.clone(),
            kind,
            uid: *uid,
            gid: *gid,
            mode: *mode,
            context: contexts.get(path).cloned().flatten(),
            symlink_target,
        });
    }

    Ok(Artifacts {
        store,
        checksums,
        meta,
        label,
    })
}

/// Writes only the `metadata.<label>` file.  Super containers have no tree
/// of their own, so their artifact directory carries just this.
pub fn save_meta(artifact_dir: &Path, label: &str, meta: &ImageMeta) -> Result<()> {
    fs::create_dir_all(artifact_dir)
        .with_context(|| format!("creating artifact directory {artifact_dir:?}"))?;
    write_metadata(&artifact_dir.join(format!("metadata.{label}")), meta)
}

/// Reads only the metadata file, without requiring the other artifacts.
pub fn load_meta(artifact_dir: &Path) -> Result<(ImageMeta, String)> {
    let label = find_label(artifact_dir)?;
    let meta = parse_metadata(&artifact_dir.join(format!("metadata.{label}")))?;
    Ok((meta, label))
}

/// Locates the single `metadata.<label>` file and returns the label.  More
/// than one is a corrupted artifact directory, not a choice to make.
fn find_label(artifact_dir: &Path) -> Result<String> {
    if !artifact_dir.is_dir() {
        return Err(RomforgeError::NotFound(artifact_dir.to_path_buf()).into());
    }
    let mut labels = Vec::new();
    for item in fs::read_dir(artifact_dir)? {
        let name = item?.file_name();
        if let Some(label) = name.to_str().and_then(|n| n.strip_prefix("metadata.")) {
            labels.push(label.to_string());
        }
    }
    labels.sort();
    match labels.len() {
        0 => Err(RomforgeError::NotFound(artifact_dir.join("metadata.*")).into()),
        1 => Ok(labels.remove(0)),
        _ => bail!("ambiguous artifact directory {artifact_dir:?}: found labels {labels:?}"),
    }
}

/// The artifact files are whitespace-delimited, so a path, symlink target or
/// context containing whitespace would either fail to load or, worse, load
/// back truncated.  Refusing at save time keeps the failure loud and early.
fn validate_representable(store: &MetadataStore) -> Result<()> {
    for record in store.iter() {
        check_token("path", &record.path)?;
        if let Some(target) = &record.symlink_target {
            if target.is_empty() {
                bail!("symlink {} has an empty target", record.path);
            }
            check_token("symlink target", target)?;
        }
        if let Some(context) = &record.context {
            check_token("context", context)?;
        }
    }
    Ok(())
}

fn check_token(what: &str, value: &str) -> Result<()> {
    if value.chars().any(char::is_whitespace) {
        bail!("{what} {value:?} contains whitespace and cannot be written to the artifact files");
    }
    Ok(())
}

fn context_str(context: &Option<String>) -> &str {
    context.as_deref().unwrap_or(UNKNOWN_CONTEXT)
}

fn parse_context(token: &str) -> Option<String> {
    match token {
        "" | UNKNOWN_CONTEXT => None,
        ctx => Some(ctx.to_string()),
    }
}

fn write_fs_config(path: &Path, store: &MetadataStore) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "# <path> <uid> <gid> <mode>")?;
    for record in store.iter() {
        writeln!(
            out,
            "{} {} {} {:o}",
            record.path, record.uid, record.gid, record.mode
        )?;
    }
    Ok(())
}

fn write_file_contexts(path: &Path, store: &MetadataStore) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "# <path> <context>")?;
    for record in store.iter() {
        writeln!(out, "{} {}", record.path, context_str(&record.context))?;
    }
    Ok(())
}

fn write_symlink_info(path: &Path, store: &MetadataStore) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "# <path> <target> <uid> <gid> <mode> <context>")?;
    for record in store.iter().filter(|r| r.kind == FileKind::Symlink) {
        let target = record.symlink_target.as_deref().unwrap_or("");
        writeln!(
            out,
            "{} {} {} {} {:o} {}",
            record.path,
            target,
            record.uid,
            record.gid,
            record.mode,
            context_str(&record.context)
        )?;
    }
    Ok(())
}

fn write_checksums(path: &Path, checksums: &ChecksumTable) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for (file, digest) in checksums.iter() {
        // the usual "<hash>  <relative path>" convention
        writeln!(out, "{digest}  .{file}")?;
    }
    Ok(())
}

fn write_metadata(path: &Path, meta: &ImageMeta) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "UNPACK_TIME={}", meta.unpack_time)?;
    writeln!(out, "SOURCE_IMAGE={}", meta.source_image)?;
    writeln!(out, "FILESYSTEM_TYPE={}", meta.fs_type)?;
    if let Some(geometry) = &meta.ext4 {
        writeln!(out, "ORIGINAL_BLOCK_COUNT={}", geometry.block_count)?;
        writeln!(out, "ORIGINAL_INODE_COUNT={}", geometry.inode_count)?;
        writeln!(out, "ORIGINAL_UUID={}", geometry.uuid)?;
        writeln!(out, "ORIGINAL_VOLUME_NAME={}", geometry.volume_name)?;
        writeln!(out, "ORIGINAL_INODE_SIZE={}", geometry.inode_size)?;
        writeln!(out, "ORIGINAL_FEATURES={}", geometry.features)?;
    }
    if let Some(size) = meta.super_size {
        writeln!(out, "SUPER_SIZE={size}")?;
    }
    if !meta.partitions.is_empty() {
        writeln!(out, "PARTITIONS={}", meta.partitions.join(","))?;
    }
    Ok(())
}

fn malformed(file: &Path, line: usize, detail: impl Into<String>) -> anyhow::Error {
    RomforgeError::Metadata {
        file: file.to_path_buf(),
        line,
        detail: detail.into(),
    }
    .into()
}

/// Iterates the data lines of a text artifact, skipping comments and blanks,
/// yielding `(line_number, line)`.
fn data_lines(path: &Path) -> Result<impl Iterator<Item = (usize, std::io::Result<String>)>> {
    let file =
        File::open(path).map_err(|_| RomforgeError::NotFound(path.to_path_buf()))?;
    Ok(BufReader::new(file)
        .lines()
        .enumerate()
        .map(|(nr, line)| (nr + 1, line))
        .filter(|(_, line)| match line {
            Ok(text) => {
                let text = text.trim();
                !text.is_empty() && !text.starts_with('#')
            }
            Err(_) => true,
        }))
}

type OwnershipMap = BTreeMap<String, (u32, u32, u32)>;

fn parse_fs_config(path: &Path) -> Result<OwnershipMap> {
    let mut result = BTreeMap::new();
    for (nr, line) in data_lines(path)? {
        let line = line?;
        let mut parts = line.split_whitespace();
        let (Some(entry), Some(uid), Some(gid), Some(mode)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed(path, nr, "expected <path> <uid> <gid> <mode>"));
        };
        // trailing capabilities=<hex> is legal and ignored
        if let Some(trailing) = parts.next() {
            if !trailing.starts_with("capabilities=") {
                return Err(malformed(path, nr, format!("trailing data {trailing:?}")));
            }
        }
        let uid = uid.parse().map_err(|_| malformed(path, nr, "bad uid"))?;
        let gid = gid.parse().map_err(|_| malformed(path, nr, "bad gid"))?;
        let mode = u32::from_str_radix(mode, 8)
            .map_err(|_| malformed(path, nr, "bad octal mode"))?;
        result.insert(entry.to_string(), (uid, gid, mode));
    }
    if !result.contains_key("/") {
        return Err(malformed(path, 0, "missing root entry"));
    }
    Ok(result)
}

fn parse_file_contexts(path: &Path) -> Result<BTreeMap<String, Option<String>>> {
    let mut result = BTreeMap::new();
    for (nr, line) in data_lines(path)? {
        let line = line?;
        let mut parts = line.split_whitespace();
        let (Some(entry), Some(context)) = (parts.next(), parts.next()) else {
            return Err(malformed(path, nr, "expected <path> <context>"));
        };
        result.insert(entry.to_string(), parse_context(context));
    }
    Ok(result)
}

fn parse_symlink_info(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut result = BTreeMap::new();
    for (nr, line) in data_lines(path)? {
        let line = line?;
        let mut parts = line.split_whitespace();
        let (Some(entry), Some(target)) = (parts.next(), parts.next()) else {
            return Err(malformed(path, nr, "expected <path> <target> ..."));
        };
        result.insert(entry.to_string(), target.to_string());
    }
    Ok(result)
}

fn parse_checksums(path: &Path) -> Result<ChecksumTable> {
    let mut result = ChecksumTable::new();
    for (nr, line) in data_lines(path)? {
        let line = line?;
        let Some((digest, file)) = line.split_once("  ") else {
            return Err(malformed(path, nr, "expected <hash>  <path>"));
        };
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed(path, nr, "bad SHA-256 digest"));
        }
        let file = file.trim_start_matches('.');
        if !file.starts_with('/') {
            return Err(malformed(path, nr, "checksum path is not absolute"));
        }
        result.insert(file, digest.to_ascii_lowercase());
    }
    Ok(result)
}

fn parse_metadata(path: &Path) -> Result<ImageMeta> {
    let mut pairs = BTreeMap::new();
    for (nr, line) in data_lines(path)? {
        let line = line?;
        let Some((key, value)) = line.split_once('=') else {
            return Err(malformed(path, nr, "expected KEY=value"));
        };
        pairs.insert(key.trim().to_string(), value.trim().to_string());
    }

    let require = |key: &str| {
        pairs
            .get(key)
            .cloned()
            .ok_or_else(|| malformed(path, 0, format!("missing {key}")))
    };
    let number = |key: &str| -> Result<u64> {
        require(key)?
            .parse()
            .map_err(|_| malformed(path, 0, format!("bad number in {key}")))
    };

    let fs_type = FsType::from_str(&require("FILESYSTEM_TYPE")?)
        .map_err(|e| malformed(path, 0, e))?;

    let ext4 = if pairs.contains_key("ORIGINAL_BLOCK_COUNT") {
        Some(Ext4Geometry {
            block_count: number("ORIGINAL_BLOCK_COUNT")?,
            inode_count: number("ORIGINAL_INODE_COUNT")?,
            uuid: require("ORIGINAL_UUID")?,
            volume_name: pairs.get("ORIGINAL_VOLUME_NAME").cloned().unwrap_or_default(),
            inode_size: number("ORIGINAL_INODE_SIZE")? as u32,
            features: pairs.get("ORIGINAL_FEATURES").cloned().unwrap_or_default(),
        })
    } else {
        None
    };

    Ok(ImageMeta {
        unpack_time: number("UNPACK_TIME")?,
        source_image: require("SOURCE_IMAGE")?,
        fs_type,
        ext4,
        super_size: match pairs.get("SUPER_SIZE") {
            Some(_) => Some(number("SUPER_SIZE")?),
            None => None,
        },
        partitions: pairs
            .get("PARTITIONS")
            .map(|list| list.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> (MetadataStore, ChecksumTable) {
        let mut store = MetadataStore::new();
        store.insert(PathRecord {
            path: "/".into(),
            kind: FileKind::Directory,
            uid: 0,
            gid: 0,
            mode: 0o755,
            context: Some("u:object_r:system_file:s0".into()),
            symlink_target: None,
        });
        store.insert(PathRecord {
            path: "/bin".into(),
            kind: FileKind::Directory,
            uid: 0,
            gid: 2000,
            mode: 0o2755,
            context: Some("u:object_r:system_file:s0".into()),
            symlink_target: None,
        });
        store.insert(PathRecord {
            path: "/bin/sh".into(),
            kind: FileKind::Regular,
            uid: 0,
            gid: 2000,
            mode: 0o755,
            context: None, // unknown at capture time
            symlink_target: None,
        });
        store.insert(PathRecord {
            path: "/bin/busybox".into(),
            kind: FileKind::Symlink,
            uid: 0,
            gid: 0,
            mode: 0o777,
            context: Some("u:object_r:system_file:s0".into()),
            symlink_target: Some("sh".into()),
        });

        let mut sums = ChecksumTable::new();
        sums.insert("/bin/sh", "a".repeat(64));
        (store, sums)
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let (store, sums) = sample_store();
        let mut meta = ImageMeta::new("system.img", FsType::Ext4);
        meta.ext4 = Some(Ext4Geometry {
            block_count: 131072,
            inode_count: 8192,
            uuid: "da1f4688-4e71-4e16-a8d8-1ac9cb44da42".into(),
            volume_name: "system".into(),
            inode_size: 256,
            features: "has_journal,extent,64bit".into(),
        });

        save(td.path(), "system", &store, &sums, &meta)?;
        let loaded = load(td.path())?;

        assert_eq!(loaded.label, "system");
        assert_eq!(loaded.meta, meta);
        assert_eq!(loaded.checksums.get("/bin/sh"), sums.get("/bin/sh"));
        assert_eq!(loaded.store.len(), store.len());

        // uid/gid/mode fidelity, including the setgid bit
        let bin = loaded.store.get("/bin").unwrap();
        assert_eq!((bin.uid, bin.gid, bin.mode), (0, 2000, 0o2755));
        assert_eq!(bin.kind, FileKind::Directory);

        // unknown context survives as None
        let sh = loaded.store.get("/bin/sh").unwrap();
        assert_eq!(sh.context, None);
        assert_eq!(sh.kind, FileKind::Regular);

        let link = loaded.store.get("/bin/busybox").unwrap();
        assert_eq!(link.kind, FileKind::Symlink);
        assert_eq!(link.symlink_target.as_deref(), Some("sh"));
        Ok(())
    }

    #[test]
    fn test_capabilities_token_tolerated() -> Result<()> {
        let td = tempfile::tempdir()?;
        let file = td.path().join("fs-config.x");
        fs::write(
            &file,
            "# comment\n/ 0 0 755\n/bin/ping 0 0 4755 capabilities=0x3000\n",
        )?;
        let parsed = parse_fs_config(&file)?;
        assert_eq!(parsed["/bin/ping"], (0, 0, 0o4755));
        Ok(())
    }

    #[test]
    fn test_malformed_line_reports_position() -> Result<()> {
        let td = tempfile::tempdir()?;
        let file = td.path().join("fs-config.x");
        fs::write(&file, "/ 0 0 755\n/oops 0 0\n")?;
        let err = parse_fs_config(&file).unwrap_err();
        let err = err.downcast::<RomforgeError>()?;
        match err {
            RomforgeError::Metadata { line, .. } => assert_eq!(line, 2),
            other => panic!("expected Metadata error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_save_rejects_whitespace_in_path() -> Result<()> {
        let td = tempfile::tempdir()?;
        let (mut store, sums) = sample_store();
        store.insert(PathRecord {
            path: "/bin/my file".into(),
            kind: FileKind::Regular,
            uid: 0,
            gid: 0,
            mode: 0o644,
            context: None,
            symlink_target: None,
        });
        let meta = ImageMeta::new("system.img", FsType::Erofs);
        let err = save(td.path(), "system", &store, &sums, &meta).unwrap_err();
        assert!(err.to_string().contains("whitespace"));
        // nothing half-written
        assert!(!td.path().join("fs-config.system").exists());
        Ok(())
    }

    #[test]
    fn test_save_rejects_whitespace_in_symlink_target() -> Result<()> {
        let td = tempfile::tempdir()?;
        let (mut store, sums) = sample_store();
        store.insert(PathRecord {
            path: "/bin/link".into(),
            kind: FileKind::Symlink,
            uid: 0,
            gid: 0,
            mode: 0o777,
            context: None,
            symlink_target: Some("some target".into()),
        });
        let meta = ImageMeta::new("system.img", FsType::Erofs);
        assert!(save(td.path(), "system", &store, &sums, &meta).is_err());
        Ok(())
    }

    #[test]
    fn test_ambiguous_labels_are_rejected() -> Result<()> {
        let td = tempfile::tempdir()?;
        let meta = ImageMeta::new("a.img", FsType::Erofs);
        write_metadata(&td.path().join("metadata.vendor"), &meta)?;
        write_metadata(&td.path().join("metadata.system"), &meta)?;
        let err = load_meta(td.path()).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
        Ok(())
    }

    #[test]
    fn test_missing_artifacts_is_not_found() {
        let err = load(Path::new("/nonexistent/.romforge")).unwrap_err();
        assert!(matches!(
            err.downcast::<RomforgeError>(),
            Ok(RomforgeError::NotFound(_))
        ));
    }

    #[test]
    fn test_metadata_super_fields() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut meta = ImageMeta::new("super.img", FsType::Super);
        meta.super_size = Some(9_126_805_504);
        meta.partitions = vec!["system".into(), "vendor".into()];
        write_metadata(&td.path().join("metadata.super"), &meta)?;
        let loaded = parse_metadata(&td.path().join("metadata.super"))?;
        assert_eq!(loaded.super_size, Some(9_126_805_504));
        assert_eq!(loaded.partitions, vec!["system", "vendor"]);
        Ok(())
    }
}
