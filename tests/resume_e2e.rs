//! Resume scenarios: offline mutations reconciled from the state cache,
//! and the volume-fingerprint guard.

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{write_file, Harness};

use cirrus_cloud::{CloudClient, MemoryCloud, MemoryTransferEngine};
use cirrus_fs::{FileFingerprint, FileInfo, Filesystem, StdFilesystem, VolumeFingerprint};
use cirrus_sync::{
    AddSyncRequest, ChangeDetection, EngineOptions, RunState, SyncEngine, SyncProblem, SyncType,
};

#[tokio::test]
async fn offline_local_deletion_moves_cloud_to_debris() {
    let mut h = Harness::start().await;
    let local = h.local_dir("local");
    write_file(&local.join("f_2"), "inner.txt", b"kept in the cloud debris");
    write_file(&local.join("f_1"), "other.txt", b"untouched");

    let remote = h.cloud.mk_folder(h.cloud.root(), "f");
    h.add_two_way(&local, remote).await;
    h.quiesce().await;
    let f2 = h.cloud.lookup("f/f_2").unwrap();
    let downloads_before = h.transfers.transfers_started();

    // Logout keeping the cache, delete f_2 on disk while offline, resume.
    h.engine.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::remove_dir_all(local.join("f_2")).unwrap();
    h.restart().await;
    h.quiesce().await;

    // The deletion was recognized from the cache: the cloud folder went to
    // sync debris and was not re-downloaded.
    assert!(h.cloud.lookup("f/f_2").is_none());
    assert!(!local.join("f_2").exists());
    let debris_children = h.cloud.children(h.cloud.sync_debris_root());
    assert!(debris_children.iter().any(|n| n.handle == f2.handle));
    assert_eq!(h.transfers.transfers_started(), downloads_before);
    // The untouched branch stayed put.
    assert!(local.join("f_1/other.txt").exists());
    assert!(h.cloud.lookup("f/f_1/other.txt").is_some());
}

#[tokio::test]
async fn remote_delete_beats_offline_local_add() {
    let mut h = Harness::start().await;
    let local = h.local_dir("local");
    write_file(&local.join("f_1/f_1_2"), "seed.txt", b"synced before logout");

    let remote = h.cloud.mk_folder(h.cloud.root(), "f");
    h.add_two_way(&local, remote).await;
    h.quiesce().await;
    let f1 = h.cloud.lookup("f/f_1").unwrap();

    // Offline: the other side deletes f_1 while this machine adds files
    // under it.
    h.engine.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.cloud.remove(f1.handle);
    write_file(&local.join("f_1/f_1_2/newlocal"), "added.txt", b"added offline");
    h.restart().await;
    h.quiesce().await;

    // Delete wins: the whole local branch, additions included, went to
    // local debris; nothing was re-uploaded.
    assert!(!local.join("f_1").exists());
    assert!(h.cloud.lookup("f/f_1").is_none());
    assert!(h.debris_entries(&local).contains(&"f_1".to_string()));
}

/// Delegates to the real filesystem but reports a configurable volume
/// fingerprint, standing in for a replaced disk.
struct SpoofVolumeFs {
    inner: StdFilesystem,
    volume: AtomicU64,
}

impl SpoofVolumeFs {
    fn new(volume: u64) -> Self {
        Self {
            inner: StdFilesystem::new(),
            volume: AtomicU64::new(volume),
        }
    }
}

impl Filesystem for SpoofVolumeFs {
    fn open(&self, path: &Path) -> cirrus_fs::Result<FileInfo> {
        self.inner.open(path)
    }
    fn read_dir(&self, dir: &Path) -> cirrus_fs::Result<Vec<String>> {
        self.inner.read_dir(dir)
    }
    fn rename(&self, from: &Path, to: &Path) -> cirrus_fs::Result<()> {
        self.inner.rename(from, to)
    }
    fn mkdir(&self, path: &Path) -> cirrus_fs::Result<()> {
        self.inner.mkdir(path)
    }
    fn unlink(&self, path: &Path) -> cirrus_fs::Result<()> {
        self.inner.unlink(path)
    }
    fn fs_fingerprint(&self, _root: &Path) -> cirrus_fs::Result<VolumeFingerprint> {
        Ok(VolumeFingerprint(self.volume.load(Ordering::Relaxed)))
    }
    fn fingerprint(&self, path: &Path, size: u64, mtime: i64) -> cirrus_fs::Result<FileFingerprint> {
        self.inner.fingerprint(path, size, mtime)
    }
    fn set_mtime(&self, path: &Path, mtime: i64) -> cirrus_fs::Result<()> {
        self.inner.set_mtime(path, mtime)
    }
    fn create_lock_file(
        &self,
        path: &Path,
    ) -> cirrus_fs::Result<Box<dyn std::any::Any + Send>> {
        self.inner.create_lock_file(path)
    }
}

#[tokio::test]
async fn volume_fingerprint_change_blocks_resume() {
    let tmp = tempfile::TempDir::new().unwrap();
    let local = tmp.path().join("local");
    std::fs::create_dir_all(&local).unwrap();
    std::fs::write(local.join("file.txt"), b"x").unwrap();

    let (cloud, completions) = MemoryCloud::with_queue();
    let transfers = MemoryTransferEngine::new(cloud.clone());
    let remote = cloud.mk_folder(cloud.root(), "r");

    let options = || EngineOptions {
        base_dir: tmp.path().join("cirrus"),
        user_key: b"key".to_vec(),
        scan_workers: 1,
    };

    let engine = SyncEngine::start(
        Arc::new(SpoofVolumeFs::new(7)),
        cloud.clone(),
        transfers.clone(),
        options(),
        completions,
    )
    .await
    .unwrap();
    let id = engine
        .add_sync(
            AddSyncRequest {
                name: "volatile".into(),
                local_root: local.clone(),
                remote_root: remote,
                sync_type: SyncType::TwoWay,
                change_detection: ChangeDetection::PeriodicScan,
                scan_interval_secs: 1,
                external_drive_path: None,
            },
            true,
        )
        .await
        .unwrap();
    assert!(engine.wait_quiescent(Duration::from_secs(30)).await);
    engine.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Same cache, different volume: the sync must refuse to start.
    let completions = cloud.reattach_queue();
    let engine = SyncEngine::start(
        Arc::new(SpoofVolumeFs::new(8)),
        cloud.clone(),
        transfers,
        options(),
        completions,
    )
    .await
    .unwrap();

    for _ in 0..100 {
        let configs = engine.get_configs(false);
        if let Some(config) = configs.iter().find(|c| c.backup_id == id) {
            if config.error == Some(SyncProblem::FilesystemFingerprintChanged) {
                assert_eq!(config.run_state, RunState::Disable);
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("fingerprint change did not disable the sync");
}
