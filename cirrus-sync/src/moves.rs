//! Move and rename detection
//!
//! Disappearances on one side are matched to appearances on the other
//! through three engine-wide indexes: synced and scanned filesystem ids
//! (keyed by volume fingerprint, so same-volume moves across syncs are
//! caught) and synced cloud handles (engine-wide, since a handle is unique
//! across all syncs). The anti-flap watch keeps editor save cycles from
//! being read as moves of user data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::debug;

use cirrus_cloud::NodeHandle;
use cirrus_fs::{FsNode, VolumeFingerprint};

use crate::tree::LnId;

/// Deciseconds; a file whose mtime is within this of "now" is considered
/// still being written.
pub const FILE_UPDATE_DELAY_DS: u64 = 30;
/// Hard cap on deferring a decision about a changing file.
pub const FILE_UPDATE_MAX_DELAY_SECS: u64 = 60;

/// A LocalNode addressed across syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub sync: usize,
    pub node: LnId,
}

#[derive(Debug, Default)]
pub struct EngineIndexes {
    synced_by_fsid: HashMap<(VolumeFingerprint, u64), NodeRef>,
    scanned_by_fsid: HashMap<(VolumeFingerprint, u64), NodeRef>,
    by_cloud_handle: HashMap<NodeHandle, NodeRef>,
}

impl EngineIndexes {
    pub fn set_synced_fsid(&mut self, fp: VolumeFingerprint, fsid: u64, node: NodeRef) {
        if fp.is_undef() || fsid == 0 {
            return;
        }
        self.synced_by_fsid.insert((fp, fsid), node);
    }

    pub fn clear_synced_fsid(&mut self, fp: VolumeFingerprint, fsid: u64, node: NodeRef) {
        if let Some(current) = self.synced_by_fsid.get(&(fp, fsid)) {
            if *current == node {
                self.synced_by_fsid.remove(&(fp, fsid));
            }
        }
    }

    pub fn synced_by_fsid(&self, fp: VolumeFingerprint, fsid: u64) -> Option<NodeRef> {
        if fp.is_undef() || fsid == 0 {
            return None;
        }
        self.synced_by_fsid.get(&(fp, fsid)).copied()
    }

    pub fn set_scanned_fsid(&mut self, fp: VolumeFingerprint, fsid: u64, node: NodeRef) {
        if fp.is_undef() || fsid == 0 {
            return;
        }
        self.scanned_by_fsid.insert((fp, fsid), node);
    }

    pub fn clear_scanned_fsid(&mut self, fp: VolumeFingerprint, fsid: u64, node: NodeRef) {
        if let Some(current) = self.scanned_by_fsid.get(&(fp, fsid)) {
            if *current == node {
                self.scanned_by_fsid.remove(&(fp, fsid));
            }
        }
    }

    pub fn scanned_by_fsid(&self, fp: VolumeFingerprint, fsid: u64) -> Option<NodeRef> {
        if fp.is_undef() || fsid == 0 {
            return None;
        }
        self.scanned_by_fsid.get(&(fp, fsid)).copied()
    }

    pub fn set_cloud_handle(&mut self, handle: NodeHandle, node: NodeRef) {
        if handle.is_undef() {
            return;
        }
        self.by_cloud_handle.insert(handle, node);
    }

    pub fn clear_cloud_handle(&mut self, handle: NodeHandle, node: NodeRef) {
        if let Some(current) = self.by_cloud_handle.get(&handle) {
            if *current == node {
                self.by_cloud_handle.remove(&handle);
            }
        }
    }

    pub fn by_cloud_handle(&self, handle: NodeHandle) -> Option<NodeRef> {
        if handle.is_undef() {
            return None;
        }
        self.by_cloud_handle.get(&handle).copied()
    }

    /// Drop every entry pointing into one sync (used at sync teardown).
    pub fn purge_sync(&mut self, sync: usize) {
        self.synced_by_fsid.retain(|_, r| r.sync != sync);
        self.scanned_by_fsid.retain(|_, r| r.sync != sync);
        self.by_cloud_handle.retain(|_, r| r.sync != sync);
    }
}

/// Whether two fsids from different syncs may refer to the same entity.
/// Volume fingerprints must match; on Windows, cloned volume IDs are common
/// enough that the drive letters must match too.
pub fn same_volume_entity(
    fp_a: VolumeFingerprint,
    root_a: &Path,
    fp_b: VolumeFingerprint,
    root_b: &Path,
) -> bool {
    if fp_a.is_undef() || fp_a != fp_b {
        return false;
    }
    #[cfg(windows)]
    {
        fn drive_letter(p: &Path) -> Option<char> {
            use std::path::{Component, Prefix};
            match p.components().next() {
                Some(Component::Prefix(prefix)) => match prefix.kind() {
                    Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
                        Some(letter.to_ascii_uppercase() as char)
                    }
                    _ => None,
                },
                _ => None,
            }
        }
        if drive_letter(root_a) != drive_letter(root_b) {
            return false;
        }
    }
    #[cfg(not(windows))]
    {
        let _ = (root_a, root_b);
    }
    true
}

#[derive(Debug, Clone)]
struct ChangingFile {
    size: u64,
    mtime: i64,
    first_seen: Instant,
}

/// Anti-flap watch over files suspected to be move sources.
#[derive(Debug, Default)]
pub struct FileChangeWatch {
    entries: HashMap<PathBuf, ChangingFile>,
}

impl FileChangeWatch {
    /// True while the file should be treated as still changing: its mtime
    /// is too close to "now", or its size/mtime moved between checks. After
    /// `FILE_UPDATE_MAX_DELAY_SECS` a decision is forced regardless.
    pub fn is_changing(
        &mut self,
        path: &Path,
        fs_node: &FsNode,
        now: Instant,
        wall_now_secs: i64,
    ) -> bool {
        let recently_written =
            wall_now_secs - fs_node.mtime < (FILE_UPDATE_DELAY_DS / 10) as i64;

        let Some(entry) = self.entries.get_mut(path) else {
            if recently_written {
                self.entries.insert(
                    path.to_path_buf(),
                    ChangingFile {
                        size: fs_node.size,
                        mtime: fs_node.mtime,
                        first_seen: now,
                    },
                );
                return true;
            }
            return false;
        };

        if now.duration_since(entry.first_seen).as_secs() >= FILE_UPDATE_MAX_DELAY_SECS {
            debug!("forcing decision on long-changing file {:?}", path);
            self.entries.remove(path);
            return false;
        }

        let moved = entry.size != fs_node.size || entry.mtime != fs_node.mtime;
        if moved {
            entry.size = fs_node.size;
            entry.mtime = fs_node.mtime;
            return true;
        }
        if recently_written {
            return true;
        }
        self.entries.remove(path);
        false
    }

    pub fn forget(&mut self, path: &Path) {
        self.entries.remove(path);
    }
}
