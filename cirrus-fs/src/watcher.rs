//! Filesystem change notifications
//!
//! Thin wrapper over the `notify` crate. Raw events are mapped to path
//! tokens and pushed into the owning sync's notification queue; coalescing
//! and quiet-time batching happen on the sync side, close to the tree they
//! mark for rescan.

use std::path::{Path, PathBuf};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    /// Something changed at or below this path.
    Changed(PathBuf),
    /// The platform queue overflowed; the receiver must rescan everything
    /// below the watch root.
    Overflow,
    /// The watcher failed irrecoverably. The sync fails unless periodic
    /// scanning is configured as a fallback.
    Failed(String),
}

/// Keeps the platform watcher alive for one sync root.
pub struct NotifyHandle {
    _watcher: RecommendedWatcher,
}

/// Watch `root` recursively, delivering events on `tx`.
pub fn watch_subtree(root: &Path, tx: mpsc::UnboundedSender<NotifyEvent>) -> Result<NotifyHandle> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                if event.need_rescan() {
                    let _ = tx.send(NotifyEvent::Overflow);
                    return;
                }
                for path in event.paths {
                    let _ = tx.send(NotifyEvent::Changed(path));
                }
            }
            Err(e) => {
                warn!("filesystem watcher error: {}", e);
                let _ = tx.send(NotifyEvent::Failed(e.to_string()));
            }
        }
    })?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    debug!("watching {:?}", root);

    Ok(NotifyHandle { _watcher: watcher })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn file_creation_produces_event() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = watch_subtree(dir.path(), tx).unwrap();

        // Give the platform backend a beat to arm.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("created.txt"), b"x").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no notification arrived")
            .unwrap();
        match event {
            NotifyEvent::Changed(path) => {
                assert!(path.ends_with("created.txt") || path == dir.path());
            }
            NotifyEvent::Overflow => {}
            NotifyEvent::Failed(e) => panic!("watcher failed: {}", e),
        }
    }
}
