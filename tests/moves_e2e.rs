//! Move scenarios: cross-sync moves and renames racing in-flight uploads.

mod common;

use std::time::Duration;

use common::{write_file, Harness};

#[tokio::test]
async fn move_across_syncs_is_one_cloud_move() {
    let h = Harness::start().await;
    let local_a = h.local_dir("roots/f_0");
    let local_b = h.local_dir("roots/f_2");
    write_file(&local_a.join("payload"), "keep.txt", b"contents travel by reference");

    let remote = h.cloud.mk_folder(h.cloud.root(), "f");
    let remote_a = h.cloud.mk_folder(remote, "f_0");
    let remote_b = h.cloud.mk_folder(remote, "f_2");
    h.add_two_way(&local_a, remote_a).await;
    h.add_two_way(&local_b, remote_b).await;
    h.quiesce().await;

    let payload = h.cloud.lookup("f/f_0/payload").unwrap();
    let uploads_before = h.transfers.transfers_started();

    // One local move between the two sync roots (same volume).
    std::fs::rename(local_a.join("payload"), local_b.join("payload")).unwrap();
    h.quiesce().await;

    assert!(h.cloud.lookup("f/f_0/payload").is_none());
    let moved = h.cloud.lookup("f/f_2/payload").unwrap();
    // The cloud node travelled; nothing was re-transferred.
    assert_eq!(moved.handle, payload.handle);
    assert_eq!(h.transfers.transfers_started(), uploads_before);
    assert!(h.cloud.lookup("f/f_2/payload/keep.txt").is_some());
    assert!(local_b.join("payload/keep.txt").exists());
    assert!(!local_a.join("payload").exists());
}

#[tokio::test]
async fn rename_during_upload_lands_at_final_path() {
    let h = Harness::start().await;
    let local = h.local_dir("local");
    std::fs::create_dir_all(local.join("new")).unwrap();

    let remote = h.cloud.mk_folder(h.cloud.root(), "r");
    h.add_two_way(&local, remote).await;
    h.quiesce().await;
    let baseline = h.transfers.transfers_started();

    // Slow uploads down, then race a rename chain against the transfer.
    h.transfers.set_upload_delay(Duration::from_millis(2000));
    write_file(&local, "a.bin", b"large enough to matter");
    // Long enough for the scan to observe the file and start its upload.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    std::fs::rename(local.join("a.bin"), local.join("new/a.bin")).unwrap();

    h.transfers.set_upload_delay(Duration::ZERO);
    h.quiesce().await;

    // The transfer was not cancelled and no second copy was uploaded; the
    // node simply chased the file to its final position.
    assert!(h.cloud.lookup("r/a.bin").is_none());
    let landed = h.cloud.lookup("r/new/a.bin").unwrap();
    assert_eq!(
        h.cloud.content_of(landed.handle).unwrap(),
        b"large enough to matter"
    );
    assert_eq!(h.transfers.transfers_started(), baseline + 1);
}
