//! Cross-thread plumbing
//!
//! The sync task owns all mutable engine state; other threads talk to it
//! through closure queues. `sync_run` posts and waits (with a diagnostic
//! once the round-trip gets slow); `queue_sync` posts fire-and-forget. UI
//! path-state queries try a timed read lock and fall back to a small LRU of
//! cached answers, so the shell integration is never blocked by a busy
//! reconciliation pass.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

use crate::engine::{EngineAction, EngineCore, SyncEngine};
use crate::errors::{Result, SyncError};

/// `sync_run` round-trips longer than this log a diagnostic; posting
/// long-running work through the waiting path is a bug in the caller.
pub const SYNC_RUN_WARN_AFTER: Duration = Duration::from_secs(20);

/// Answer for "what is the sync state of this path", as shown by shell
/// overlay icons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSyncState {
    Synced,
    Syncing,
    Stalled,
    NotTracked,
}

/// Fixed-capacity LRU of recent path-state answers.
pub struct PathStateCache {
    capacity: usize,
    entries: HashMap<PathBuf, (PathSyncState, u64)>,
    clock: u64,
}

impl PathStateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            clock: 0,
        }
    }

    pub fn get(&mut self, path: &Path) -> Option<PathSyncState> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(path).map(|(state, used)| {
            *used = clock;
            *state
        })
    }

    pub fn put(&mut self, path: PathBuf, state: PathSyncState) {
        self.clock += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&path) {
            // evict the least recently used entry
            if let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(path, (state, self.clock));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SyncEngine {
    /// Post a closure to the sync task and wait for its result. Used for
    /// synchronous queries; long-running callbacks do not belong here.
    pub(crate) async fn sync_run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineCore) -> T + Send + 'static,
    {
        let (tx, mut rx) = oneshot::channel();
        let action: EngineAction = Box::new(move |core| {
            let _ = tx.send(f(core));
        });
        self.actions_tx()
            .send(action)
            .map_err(|_| SyncError::EngineDown)?;

        tokio::select! {
            result = &mut rx => {
                return result.map_err(|_| SyncError::EngineDown);
            }
            _ = tokio::time::sleep(SYNC_RUN_WARN_AFTER) => {
                warn!(
                    "sync_run round-trip exceeded {:?}; the sync thread may be wedged",
                    SYNC_RUN_WARN_AFTER
                );
            }
        }
        rx.await.map_err(|_| SyncError::EngineDown)
    }

    /// Post fire-and-forget work to the sync task.
    pub(crate) fn queue_sync<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut EngineCore) + Send + 'static,
    {
        self.actions_tx()
            .send(Box::new(f))
            .map_err(|_| SyncError::EngineDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut cache = PathStateCache::new(2);
        cache.put(PathBuf::from("/a"), PathSyncState::Synced);
        cache.put(PathBuf::from("/b"), PathSyncState::Syncing);
        // touch /a so /b is the eviction candidate
        assert_eq!(cache.get(Path::new("/a")), Some(PathSyncState::Synced));
        cache.put(PathBuf::from("/c"), PathSyncState::Stalled);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(Path::new("/b")), None);
        assert!(cache.get(Path::new("/a")).is_some());
        assert!(cache.get(Path::new("/c")).is_some());
    }

    #[test]
    fn overwrite_does_not_grow() {
        let mut cache = PathStateCache::new(2);
        cache.put(PathBuf::from("/a"), PathSyncState::Synced);
        cache.put(PathBuf::from("/a"), PathSyncState::Syncing);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(Path::new("/a")), Some(PathSyncState::Syncing));
    }
}
