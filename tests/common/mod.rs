//! Shared harness for engine integration tests: a real filesystem under a
//! temp directory, the in-memory cloud, and the sync engine between them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cirrus_cloud::{CloudClient, MemoryCloud, MemoryTransferEngine, NodeHandle};
use cirrus_fs::StdFilesystem;
use cirrus_sync::{
    AddSyncRequest, BackupId, ChangeDetection, EngineOptions, SyncEngine, SyncType,
};

pub const QUIESCE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Harness {
    pub tmp: TempDir,
    pub cloud: Arc<MemoryCloud>,
    pub transfers: Arc<MemoryTransferEngine>,
    pub engine: SyncEngine,
}

impl Harness {
    pub async fn start() -> Harness {
        let tmp = TempDir::new().unwrap();
        let (cloud, completions) = MemoryCloud::with_queue();
        let transfers = MemoryTransferEngine::new(cloud.clone());
        let engine = SyncEngine::start(
            Arc::new(StdFilesystem::new()),
            cloud.clone(),
            transfers.clone(),
            EngineOptions {
                base_dir: tmp.path().join("cirrus"),
                user_key: b"harness user key".to_vec(),
                scan_workers: 2,
            },
            completions,
        )
        .await
        .unwrap();
        Harness {
            tmp,
            cloud,
            transfers,
            engine,
        }
    }

    /// Start a second engine session over this harness's disk and cloud,
    /// as after an app restart. The previous engine must be shut down.
    pub async fn restart(&mut self) {
        let completions = self.cloud.reattach_queue();
        self.engine = SyncEngine::start(
            Arc::new(StdFilesystem::new()),
            self.cloud.clone(),
            self.transfers.clone(),
            EngineOptions {
                base_dir: self.tmp.path().join("cirrus"),
                user_key: b"harness user key".to_vec(),
                scan_workers: 2,
            },
            completions,
        )
        .await
        .unwrap();
    }

    pub fn local_dir(&self, name: &str) -> PathBuf {
        let path = self.tmp.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    pub async fn add_two_way(&self, local: &Path, remote: NodeHandle) -> BackupId {
        self.engine
            .add_sync(
                AddSyncRequest {
                    name: "test".into(),
                    local_root: local.to_path_buf(),
                    remote_root: remote,
                    sync_type: SyncType::TwoWay,
                    change_detection: ChangeDetection::Notifications,
                    scan_interval_secs: 0,
                    external_drive_path: None,
                },
                true,
            )
            .await
            .unwrap()
    }

    pub async fn add_backup(&self, local: &Path, remote: NodeHandle) -> BackupId {
        self.engine
            .add_sync(
                AddSyncRequest {
                    name: "backup".into(),
                    local_root: local.to_path_buf(),
                    remote_root: remote,
                    sync_type: SyncType::Backup,
                    change_detection: ChangeDetection::Notifications,
                    scan_interval_secs: 0,
                    external_drive_path: None,
                },
                true,
            )
            .await
            .unwrap()
    }

    pub async fn quiesce(&self) {
        assert!(
            self.engine.wait_quiescent(QUIESCE_TIMEOUT).await,
            "engine did not quiesce within {:?}",
            QUIESCE_TIMEOUT
        );
    }

    /// Names of a cloud folder's children, sorted.
    pub fn cloud_names(&self, parent: NodeHandle) -> Vec<String> {
        let mut names: Vec<String> = self
            .cloud
            .children(parent)
            .into_iter()
            .map(|n| n.name)
            .collect();
        names.sort();
        names
    }

    /// Entries of the local debris folder (all day folders flattened).
    pub fn debris_entries(&self, local_root: &Path) -> Vec<String> {
        let debris = local_root.join(".debris");
        let mut entries = Vec::new();
        let Ok(days) = std::fs::read_dir(&debris) else {
            return entries;
        };
        for day in days.flatten() {
            if day.file_name() == "tmp" {
                continue;
            }
            if let Ok(items) = std::fs::read_dir(day.path()) {
                for item in items.flatten() {
                    entries.push(item.file_name().to_string_lossy().into_owned());
                }
            }
        }
        entries.sort();
        entries
    }
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    path
}
