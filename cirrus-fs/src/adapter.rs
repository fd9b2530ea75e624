//! Filesystem adapter
//!
//! The engine consumes the filesystem through this trait so tests can
//! substitute fixtures and so platform differences stay out of the
//! reconciler. Mutations return `Ok`, a transient error (retry later), or a
//! permanent one.

use std::any::Any;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{FsError, Result};
use crate::fingerprint::FileFingerprint;
use crate::fsnode::NodeKind;

/// Opaque identity of a filesystem volume.
///
/// Stable across reboots on supported platforms; `UNDEF` on volumes that
/// cannot be fingerprinted, in which case fsid-based move detection is
/// disabled for that volume.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct VolumeFingerprint(pub u64);

impl VolumeFingerprint {
    pub const UNDEF: VolumeFingerprint = VolumeFingerprint(0);

    pub fn is_undef(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: i64,
    pub fsid: u64,
    pub fsid_valid: bool,
    pub is_symlink: bool,
}

pub trait Filesystem: Send + Sync {
    /// Stat a path without following symlinks.
    fn open(&self, path: &Path) -> Result<FileInfo>;

    /// Entry names of a directory. Non-UTF-8 names are skipped with a warning.
    fn read_dir(&self, dir: &Path) -> Result<Vec<String>>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn mkdir(&self, path: &Path) -> Result<()>;

    fn unlink(&self, path: &Path) -> Result<()>;

    /// Identify the volume holding `root`.
    fn fs_fingerprint(&self, root: &Path) -> Result<VolumeFingerprint>;

    /// OS alternate name, empty on platforms without one.
    fn shortname(&self, _path: &Path) -> Option<String> {
        None
    }

    /// Content fingerprint of a regular file.
    fn fingerprint(&self, path: &Path, size: u64, mtime: i64) -> Result<FileFingerprint>;

    /// Set a file's modification time (seconds since the Unix epoch).
    /// Downloads restore the cloud mtime so fingerprints converge.
    fn set_mtime(&self, path: &Path, mtime: i64) -> Result<()>;

    /// Create a file and keep it open for the returned handle's lifetime.
    /// Used for the debris tmp lock.
    fn create_lock_file(&self, path: &Path) -> Result<Box<dyn Any + Send>>;
}

/// `std::fs`-backed adapter used in production.
#[derive(Debug, Default, Clone)]
pub struct StdFilesystem;

impl StdFilesystem {
    pub fn new() -> Self {
        StdFilesystem
    }
}

fn mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_id(meta: &fs::Metadata) -> (u64, bool) {
    use std::os::unix::fs::MetadataExt;
    (meta.ino(), true)
}

#[cfg(not(unix))]
fn file_id(_meta: &fs::Metadata) -> (u64, bool) {
    (0, false)
}

#[cfg(unix)]
fn volume_id(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.dev()
}

#[cfg(not(unix))]
fn volume_id(_meta: &fs::Metadata) -> u64 {
    0
}

impl Filesystem for StdFilesystem {
    fn open(&self, path: &Path) -> Result<FileInfo> {
        let meta = fs::symlink_metadata(path).map_err(|e| FsError::from_io(path, e))?;
        let is_symlink = meta.file_type().is_symlink();
        let kind = if meta.is_dir() {
            NodeKind::Folder
        } else {
            NodeKind::File
        };
        let (fsid, fsid_valid) = file_id(&meta);
        Ok(FileInfo {
            kind,
            size: meta.len(),
            mtime: mtime_secs(&meta),
            fsid,
            fsid_valid,
            is_symlink,
        })
    }

    fn read_dir(&self, dir: &Path) -> Result<Vec<String>> {
        let entries = fs::read_dir(dir).map_err(|e| FsError::from_io(dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FsError::from_io(dir, e))?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => {
                    warn!("skipping non-UTF-8 directory entry {:?} in {:?}", raw, dir);
                }
            }
        }
        Ok(names)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(|e| FsError::from_io(from, e))
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        fs::create_dir(path).map_err(|e| FsError::from_io(path, e))
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| FsError::from_io(path, e))
    }

    fn fs_fingerprint(&self, root: &Path) -> Result<VolumeFingerprint> {
        let meta = fs::metadata(root).map_err(|e| FsError::from_io(root, e))?;
        Ok(VolumeFingerprint(volume_id(&meta)))
    }

    fn fingerprint(&self, path: &Path, size: u64, mtime: i64) -> Result<FileFingerprint> {
        FileFingerprint::from_path(path, size, mtime)
    }

    fn set_mtime(&self, path: &Path, mtime: i64) -> Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| FsError::from_io(path, e))?;
        let time = UNIX_EPOCH + std::time::Duration::from_secs(mtime.max(0) as u64);
        file.set_modified(time).map_err(|e| FsError::from_io(path, e))
    }

    fn create_lock_file(&self, path: &Path) -> Result<Box<dyn Any + Send>> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| FsError::from_io(path, e))?;
        Ok(Box::new(file))
    }
}
