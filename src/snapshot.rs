//! Metadata capture at unpack time.
//!
//! Walks a (typically read-only, freshly mounted) filesystem tree exactly
//! once with openat/fstat, never following symlinks, and produces the
//! [`MetadataStore`] plus [`ChecksumTable`] that later repacks reconcile
//! against.  The root directory is recorded before any child is visited: the
//! pattern matcher's ancestor walk depends on a guaranteed root fallback.

use std::{ffi::OsStr, fs::File, os::unix::ffi::OsStrExt, path::Path};

use anyhow::{ensure, Context, Result};
use log::warn;
use rustix::{
    fd::OwnedFd,
    fs::{fstat, getxattr, openat, readlinkat, Dir, FileType, Mode, OFlags, CWD},
    io::Errno,
};

use crate::{
    store::{join_path, ChecksumTable, FileKind, MetadataStore, PathRecord},
    util::{proc_self_fd, sha256_hex},
};

const XATTR_SECURITY_SELINUX: &str = "security.selinux";

/// The complete hand-off artifact of a capture run.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub store: MetadataStore,
    pub checksums: ChecksumTable,
}

/// Captures a full metadata snapshot of the tree under `root`.
///
/// Reads only; symlink attributes are taken from the link itself, never its
/// target.  Entry kinds outside the model (devices, fifos, sockets) are
/// skipped with a warning.
pub fn snapshot(root: &Path) -> Result<Snapshot> {
    let fd = openat(
        CWD,
        root,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("opening snapshot root {root:?}"))?;

    let mut snap = Snapshot::default();
    let buf = fstat(&fd)?;
    snap.store.insert(PathRecord {
        path: "/".to_string(),
        kind: FileKind::Directory,
        uid: buf.st_uid,
        gid: buf.st_gid,
        mode: (buf.st_mode & 0o7777) as u32,
        context: read_context(&fd),
        symlink_target: None,
    });

    scan_directory(&fd, "/", &mut snap)?;
    Ok(snap)
}

/// Reads the SELinux label of the object behind `fd`.
///
/// Goes via /proc/self/fd: fgetxattr() doesn't work on O_PATH fds, and the
/// symlink-following path call on the magic link lands on the fd's target,
/// which gives the right answer even when that target is itself a symlink.
fn read_context(fd: &OwnedFd) -> Option<String> {
    let filename = proc_self_fd(fd);
    let mut buffer = [0u8; 1024];
    match getxattr(&filename, XATTR_SECURITY_SELINUX, &mut buffer) {
        Ok(len) => {
            let value = &buffer[..len];
            let value = value.strip_suffix(&[0]).unwrap_or(value);
            Some(String::from_utf8_lossy(value).into_owned())
        }
        Err(Errno::NODATA) | Err(Errno::OPNOTSUPP) => None,
        Err(err) => {
            warn!("reading {XATTR_SECURITY_SELINUX} from {filename}: {err}");
            None
        }
    }
}

fn scan_directory(dirfd: &OwnedFd, image_dir: &str, snap: &mut Snapshot) -> Result<()> {
    for item in Dir::read_from(dirfd)? {
        let entry = item?;
        let name = OsStr::from_bytes(entry.file_name().to_bytes());

        if name == "." || name == ".." {
            continue;
        }
        let Some(name) = name.to_str() else {
            warn!("skipping non-UTF-8 filename {name:?} in {image_dir}");
            continue;
        };

        let path = join_path(image_dir, name);
        match entry.file_type() {
            FileType::Directory => scan_subdirectory(dirfd, name, &path, snap)?,
            ifmt => scan_leaf(dirfd, name, &path, ifmt, snap)?,
        }
    }
    Ok(())
}

fn scan_subdirectory(
    dirfd: &OwnedFd,
    name: &str,
    path: &str,
    snap: &mut Snapshot,
) -> Result<()> {
    let fd = openat(
        dirfd,
        name,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("opening directory {path}"))?;
    let buf = fstat(&fd)?;

    // parent before children, as with the root
    snap.store.insert(PathRecord {
        path: path.to_string(),
        kind: FileKind::Directory,
        uid: buf.st_uid,
        gid: buf.st_gid,
        mode: (buf.st_mode & 0o7777) as u32,
        context: read_context(&fd),
        symlink_target: None,
    });

    scan_directory(&fd, path, snap)
}

fn scan_leaf(
    dirfd: &OwnedFd,
    name: &str,
    path: &str,
    ifmt: FileType,
    snap: &mut Snapshot,
) -> Result<()> {
    let oflags = match ifmt {
        FileType::RegularFile => OFlags::RDONLY,
        _ => OFlags::PATH,
    };
    let fd = openat(
        dirfd,
        name,
        oflags | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("opening {path}"))?;

    let buf = fstat(&fd)?;
    ensure!(
        FileType::from_raw_mode(buf.st_mode) == ifmt,
        "file type of {path} changed between readdir() and fstat()"
    );

    let uid = buf.st_uid;
    let gid = buf.st_gid;
    let mode = (buf.st_mode & 0o7777) as u32;
    let context = read_context(&fd);

    match ifmt {
        FileType::RegularFile => {
            let digest = sha256_hex(File::from(fd))
                .with_context(|| format!("hashing {path}"))?;
            snap.checksums.insert(path, digest);
            snap.store.insert(PathRecord {
                path: path.to_string(),
                kind: FileKind::Regular,
                uid,
                gid,
                mode,
                context,
                symlink_target: None,
            });
        }
        FileType::Symlink => {
            let target = readlinkat(&fd, "", Vec::new())
                .with_context(|| format!("reading symlink target of {path}"))?;
            let target = String::from_utf8_lossy(target.as_bytes()).into_owned();
            snap.store.insert(PathRecord {
                path: path.to_string(),
                kind: FileKind::Symlink,
                uid,
                gid,
                mode,
                context,
                symlink_target: Some(target),
            });
        }
        _ => warn!("skipping special file {path} (device/fifo/socket)"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::{symlink, PermissionsExt};

    use super::*;

    #[test]
    fn test_root_record_always_present() -> Result<()> {
        let td = tempfile::tempdir()?;
        let snap = snapshot(td.path())?;
        let root = snap.store.root().expect("root record");
        assert_eq!(root.kind, FileKind::Directory);
        assert_eq!(snap.store.len(), 1);
        assert!(snap.checksums.is_empty());
        Ok(())
    }

    #[test]
    fn test_capture_kinds_modes_and_checksums() -> Result<()> {
        let td = tempfile::tempdir()?;
        fs::create_dir(td.path().join("etc"))?;
        fs::write(td.path().join("etc/config"), b"a=1\n")?;
        fs::set_permissions(td.path().join("etc/config"), fs::Permissions::from_mode(0o600))?;
        symlink("config", td.path().join("etc/conf.lnk"))?;

        let snap = snapshot(td.path())?;

        let dir = snap.store.get("/etc").unwrap();
        assert_eq!(dir.kind, FileKind::Directory);

        let file = snap.store.get("/etc/config").unwrap();
        assert_eq!(file.kind, FileKind::Regular);
        assert_eq!(file.mode, 0o600);
        assert!(file.symlink_target.is_none());

        let link = snap.store.get("/etc/conf.lnk").unwrap();
        assert_eq!(link.kind, FileKind::Symlink);
        assert_eq!(link.symlink_target.as_deref(), Some("config"));

        assert_eq!(
            snap.checksums.get("/etc/config").unwrap(),
            crate::util::sha256_hex(b"a=1\n" as &[u8])?
        );
        assert_eq!(snap.checksums.len(), 1);
        Ok(())
    }

    #[test]
    fn test_symlink_attributes_come_from_link_not_target() -> Result<()> {
        let td = tempfile::tempdir()?;
        fs::write(td.path().join("target"), b"x")?;
        fs::set_permissions(td.path().join("target"), fs::Permissions::from_mode(0o640))?;
        symlink("target", td.path().join("link"))?;

        let snap = snapshot(td.path())?;
        let link = snap.store.get("/link").unwrap();
        assert_eq!(link.kind, FileKind::Symlink);
        // symlinks have no meaningful permission bits of their own
        assert_eq!(link.mode, 0o777);
        // and no checksum
        assert!(snap.checksums.get("/link").is_none());
        Ok(())
    }
}
