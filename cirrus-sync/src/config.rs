//! Sync configuration
//!
//! One persisted record per sync. `backup_id` is the stable identity and
//! never mutates; `local_root_fsid` takes part in the state-cache filename,
//! so a changed root directory forces a full resync rather than trusting a
//! cache built for a different directory.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use cirrus_cloud::NodeHandle;
use cirrus_fs::VolumeFingerprint;

pub type BackupId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
    /// Upload only: remote changes are ignored.
    Up,
    /// Download only: local changes are ignored.
    Down,
    TwoWay,
    /// Upload that auto-disables when the remote side is mutated by anyone
    /// else.
    Backup,
}

impl SyncType {
    pub fn syncs_up(&self) -> bool {
        matches!(self, SyncType::Up | SyncType::TwoWay | SyncType::Backup)
    }

    pub fn syncs_down(&self) -> bool {
        matches!(self, SyncType::Down | SyncType::TwoWay)
    }

    pub fn is_backup(&self) -> bool {
        matches!(self, SyncType::Backup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunState {
    #[default]
    Pending,
    Loading,
    Run,
    Pause,
    Suspend,
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupState {
    /// Actively forcing the cloud to match the local tree.
    Mirror,
    /// Watching for foreign cloud mutation.
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeDetection {
    Notifications,
    PeriodicScan,
}

/// Permanent sync problems; user-facing reasons are these constants, never
/// message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncProblem {
    ConfigReadFailure,
    FilesystemFingerprintChanged,
    LocalRootUnavailable,
    RemoteRootMissing,
    BackupModified,
    NotificationSystemUnavailable,
    StateCacheUnusable,
    DeregistrationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncWarning {
    RemotePathChanged,
    FellBackToPeriodicScanning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRoot {
    pub handle: NodeHandle,
    /// Last-known cloud path, refreshed opportunistically.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub backup_id: BackupId,
    /// Short display name used in logs.
    pub name: String,
    pub local_root: PathBuf,
    pub remote_root: RemoteRoot,
    pub filesystem_fingerprint: VolumeFingerprint,
    pub local_root_fsid: u64,
    pub sync_type: SyncType,
    pub enabled: bool,
    pub error: Option<SyncProblem>,
    pub warning: Option<SyncWarning>,
    /// Runtime only; a freshly loaded config always starts `Pending`.
    #[serde(skip)]
    pub run_state: RunState,
    /// Backups only.
    pub backup_state: Option<BackupState>,
    pub change_detection: ChangeDetection,
    pub scan_interval_secs: u64,
    /// Set for backups living on an external drive; their config store
    /// slots live on the drive itself.
    pub external_drive_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn is_backup(&self) -> bool {
        self.sync_type.is_backup()
    }

    pub fn is_external(&self) -> bool {
        self.external_drive_path.is_some()
    }

    /// State-cache filename. Includes `local_root_fsid` so a replaced root
    /// directory cannot resume from a cache built for the old one.
    pub fn state_cache_name(&self) -> String {
        format!(
            "sync-{:016x}-{:016x}.db",
            self.backup_id, self.local_root_fsid
        )
    }
}
