//! One-way sync semantics: upload-only syncs ignore remote changes,
//! download-only syncs ignore local changes.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cirrus_cloud::{CloudClient, MemoryCloud, MemoryTransferEngine};
use cirrus_fs::StdFilesystem;
use cirrus_sync::{
    AddSyncRequest, ChangeDetection, EngineOptions, SyncEngine, SyncType,
};

async fn start(
    tmp: &TempDir,
) -> (Arc<MemoryCloud>, Arc<MemoryTransferEngine>, SyncEngine) {
    let (cloud, completions) = MemoryCloud::with_queue();
    let transfers = MemoryTransferEngine::new(cloud.clone());
    let engine = SyncEngine::start(
        Arc::new(StdFilesystem::new()),
        cloud.clone(),
        transfers.clone(),
        EngineOptions {
            base_dir: tmp.path().join("cirrus"),
            user_key: b"key".to_vec(),
            scan_workers: 1,
        },
        completions,
    )
    .await
    .unwrap();
    (cloud, transfers, engine)
}

fn request(local: std::path::PathBuf, remote: cirrus_cloud::NodeHandle, sync_type: SyncType) -> AddSyncRequest {
    AddSyncRequest {
        name: "oneway".into(),
        local_root: local,
        remote_root: remote,
        sync_type,
        change_detection: ChangeDetection::Notifications,
        scan_interval_secs: 0,
        external_drive_path: None,
    }
}

#[tokio::test]
async fn upload_only_ignores_remote_additions() {
    let tmp = TempDir::new().unwrap();
    let local = tmp.path().join("local");
    std::fs::create_dir_all(&local).unwrap();
    std::fs::write(local.join("mine.txt"), b"local data").unwrap();

    let (cloud, _transfers, engine) = start(&tmp).await;
    let remote = cloud.mk_folder(cloud.root(), "up");
    cloud.put_file(remote, "theirs.txt", b"remote data", 1_700_000_000);

    engine
        .add_sync(request(local.clone(), remote, SyncType::Up), true)
        .await
        .unwrap();
    assert!(engine.wait_quiescent(Duration::from_secs(30)).await);

    // Local content went up; the remote-only file was neither downloaded
    // nor touched.
    assert!(cloud.lookup("up/mine.txt").is_some());
    assert!(!local.join("theirs.txt").exists());
    assert!(cloud.lookup("up/theirs.txt").is_some());
}

#[tokio::test]
async fn download_only_ignores_local_additions() {
    let tmp = TempDir::new().unwrap();
    let local = tmp.path().join("local");
    std::fs::create_dir_all(&local).unwrap();
    std::fs::write(local.join("mine.txt"), b"local only").unwrap();

    let (cloud, transfers, engine) = start(&tmp).await;
    let remote = cloud.mk_folder(cloud.root(), "down");
    cloud.put_file(remote, "theirs.txt", b"remote data", 1_700_000_000);

    engine
        .add_sync(request(local.clone(), remote, SyncType::Down), true)
        .await
        .unwrap();
    assert!(engine.wait_quiescent(Duration::from_secs(30)).await);

    // The remote file came down; the local addition stayed local.
    assert_eq!(
        std::fs::read(local.join("theirs.txt")).unwrap(),
        b"remote data".to_vec()
    );
    assert!(cloud.lookup("down/mine.txt").is_none());
    // Exactly one transfer: the download.
    assert_eq!(transfers.transfers_started(), 1);
}
