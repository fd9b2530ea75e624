//! Backup lifecycle: mirror, monitor, auto-disable on foreign cloud
//! change, and remirror on re-enable.

mod common;

use std::time::Duration;

use common::{write_file, Harness};

use cirrus_sync::{BackupState, RunState, SyncProblem};

#[tokio::test]
async fn backup_disables_on_foreign_change_and_remirrors() {
    let h = Harness::start().await;
    let local = h.local_dir("s");
    write_file(&local, "one.txt", b"first");
    write_file(&local.join("sub"), "two.txt", b"second");

    let remote = h.cloud.mk_folder(h.cloud.root(), "s");
    let id = h.add_backup(&local, remote).await;
    h.quiesce().await;

    // Mirror finished and the cloud matches local.
    assert!(h.cloud.lookup("s/one.txt").is_some());
    assert!(h.cloud.lookup("s/sub/two.txt").is_some());
    let config = h
        .engine
        .get_configs(false)
        .into_iter()
        .find(|c| c.backup_id == id)
        .unwrap();
    assert_eq!(config.backup_state, Some(BackupState::Monitor));

    // A foreign party creates a folder directly under the backup root.
    h.cloud.mk_folder(remote, "intruder");

    let mut disabled = false;
    for _ in 0..200 {
        let config = h
            .engine
            .get_configs(false)
            .into_iter()
            .find(|c| c.backup_id == id)
            .unwrap();
        if config.run_state == RunState::Disable {
            assert_eq!(config.error, Some(SyncProblem::BackupModified));
            disabled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(disabled, "foreign change did not disable the backup");

    // Re-enabling remirrors and removes the foreign folder.
    h.engine.enable(id).await.unwrap();
    h.quiesce().await;

    assert!(h.cloud.lookup("s/intruder").is_none());
    assert!(h.cloud.lookup("s/one.txt").is_some());
    let config = h
        .engine
        .get_configs(false)
        .into_iter()
        .find(|c| c.backup_id == id)
        .unwrap();
    assert_eq!(config.backup_state, Some(BackupState::Monitor));
    assert_eq!(config.run_state, RunState::Run);
}

#[tokio::test]
async fn backup_pushes_local_edits_while_monitoring() {
    let h = Harness::start().await;
    let local = h.local_dir("s");
    write_file(&local, "doc.txt", b"v1");

    let remote = h.cloud.mk_folder(h.cloud.root(), "s");
    let id = h.add_backup(&local, remote).await;
    h.quiesce().await;

    // Local activity while monitoring is ours and must not disable the
    // backup.
    write_file(&local, "doc.txt", b"v2 with more text");
    h.quiesce().await;

    let doc = h.cloud.lookup("s/doc.txt").unwrap();
    assert_eq!(h.cloud.content_of(doc.handle).unwrap(), b"v2 with more text");
    let config = h
        .engine
        .get_configs(false)
        .into_iter()
        .find(|c| c.backup_id == id)
        .unwrap();
    assert_eq!(config.run_state, RunState::Run);
    assert_eq!(config.backup_state, Some(BackupState::Monitor));
}
