//! Scan result entries

use serde::{Deserialize, Serialize};

use crate::fingerprint::FileFingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Folder,
}

/// Snapshot of one directory entry, produced by the scan service.
///
/// `fsid` is 0 when the underlying volume cannot issue stable identifiers
/// (FAT and friends); move detection is disabled for such volumes.
#[derive(Debug, Clone, PartialEq)]
pub struct FsNode {
    /// Exact name on disk.
    pub name: String,
    /// Name as presented to the cloud side. Identical to `name` unless the
    /// platform requires escaping.
    pub cloud_name: String,
    pub fsid: u64,
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: i64,
    /// Content fingerprint; files only, and absent while the file is blocked.
    pub fingerprint: Option<FileFingerprint>,
    pub is_symlink: bool,
    /// Set when the entry could not be opened due to a transient error.
    pub is_blocked: bool,
    /// OS alternate name (Windows 8.3), when the platform exposes one.
    pub shortname: Option<String>,
}

impl FsNode {
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    /// True when this entry can take part in normal reconciliation.
    pub fn is_syncable(&self) -> bool {
        !self.is_symlink && !self.is_blocked
    }
}
