//! Asynchronous directory scan service
//!
//! Scans are handed to a small worker pool and polled by the sync core; the
//! core never blocks on filesystem I/O. A request targets a single
//! directory and eventually exposes a completed flag plus the `FsNode` list.
//! An unreadable target completes with an empty list *and*
//! `root_unreadable = true`, which is distinct from an empty directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::adapter::Filesystem;
use crate::errors::FsError;
use crate::fingerprint::FileFingerprint;
use crate::fsnode::{FsNode, NodeKind};

/// Prior knowledge about one directory entry, used to skip fingerprinting
/// when `(size, mtime, fsid)` still match. The reconciler relies on this
/// being exact: a same-inode delete+create cycle with differing size or
/// mtime must not reuse the old fingerprint.
#[derive(Debug, Clone)]
pub struct KnownEntry {
    pub size: u64,
    pub mtime: i64,
    pub fsid: u64,
    pub fingerprint: FileFingerprint,
}

/// One scan order: a single directory, never following symlinks, with the
/// sync's debris subtree excluded from results.
#[derive(Debug, Default)]
pub struct ScanSpec {
    pub target: PathBuf,
    /// Absolute path excluded from results (the local debris folder).
    pub exclude: Option<PathBuf>,
    /// Fingerprint-skip hints keyed by entry name.
    pub known: HashMap<String, KnownEntry>,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub nodes: Vec<FsNode>,
    /// The target itself could not be opened; not a zero-entry directory.
    pub root_unreadable: bool,
}

struct ScanShared {
    completed: AtomicBool,
    outcome: Mutex<Option<ScanOutcome>>,
}

/// Handle to a pending or completed scan.
#[derive(Clone)]
pub struct ScanRequest {
    shared: Arc<ScanShared>,
}

impl ScanRequest {
    pub fn completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Consume the outcome once complete. Returns `None` while pending or
    /// if the outcome was already taken.
    pub fn take_outcome(&self) -> Option<ScanOutcome> {
        if !self.completed() {
            return None;
        }
        self.shared.outcome.lock().unwrap().take()
    }
}

enum ScanJob {
    Scan { spec: ScanSpec, shared: Arc<ScanShared> },
    Terminate,
}

/// Worker-pool backed scan service shared by all syncs.
pub struct ScanService {
    tx: mpsc::UnboundedSender<ScanJob>,
    workers: usize,
}

impl ScanService {
    pub fn new(fs: Arc<dyn Filesystem>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for id in 0..workers {
            let rx = rx.clone();
            let fs = fs.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(ScanJob::Scan { spec, shared }) => {
                            let fs = fs.clone();
                            let outcome = tokio::task::spawn_blocking(move || {
                                scan_directory(fs.as_ref(), &spec)
                            })
                            .await
                            .unwrap_or_else(|_| ScanOutcome {
                                nodes: Vec::new(),
                                root_unreadable: true,
                            });
                            *shared.outcome.lock().unwrap() = Some(outcome);
                            shared.completed.store(true, Ordering::Release);
                        }
                        Some(ScanJob::Terminate) | None => {
                            trace!("scan worker {} terminating", id);
                            break;
                        }
                    }
                }
            });
        }

        Self { tx, workers }
    }

    /// Queue a scan; the returned handle is polled by the caller.
    pub fn scan(&self, spec: ScanSpec) -> ScanRequest {
        let shared = Arc::new(ScanShared {
            completed: AtomicBool::new(false),
            outcome: Mutex::new(None),
        });
        let request = ScanRequest {
            shared: shared.clone(),
        };
        if self.tx.send(ScanJob::Scan { spec, shared }).is_err() {
            // Service already shut down; complete as unreadable so the
            // caller backs off instead of waiting forever.
            let shared = &request.shared;
            *shared.outcome.lock().unwrap() = Some(ScanOutcome {
                nodes: Vec::new(),
                root_unreadable: true,
            });
            shared.completed.store(true, Ordering::Release);
        }
        request
    }

    /// Drain the pool cleanly; pending scans finish first.
    pub fn shutdown(&self) {
        for _ in 0..self.workers {
            let _ = self.tx.send(ScanJob::Terminate);
        }
    }
}

fn scan_directory(fs: &dyn Filesystem, spec: &ScanSpec) -> ScanOutcome {
    let names = match fs.read_dir(&spec.target) {
        Ok(names) => names,
        Err(e) => {
            warn!("scan of {:?} failed: {}", spec.target, e);
            return ScanOutcome {
                nodes: Vec::new(),
                root_unreadable: true,
            };
        }
    };

    let mut nodes = Vec::with_capacity(names.len());
    for name in names {
        let path = spec.target.join(&name);
        if spec.exclude.as_deref() == Some(path.as_path()) {
            continue;
        }
        if let Some(node) = scan_entry(fs, spec, &name, &path) {
            nodes.push(node);
        }
    }

    debug!("scanned {:?}: {} entries", spec.target, nodes.len());
    ScanOutcome {
        nodes,
        root_unreadable: false,
    }
}

fn scan_entry(fs: &dyn Filesystem, spec: &ScanSpec, name: &str, path: &Path) -> Option<FsNode> {
    let info = match fs.open(path) {
        Ok(info) => info,
        Err(e @ FsError::Transient { .. }) => {
            debug!("entry {:?} blocked: {}", path, e);
            return Some(blocked_node(name));
        }
        Err(e) => {
            warn!("skipping unreadable entry {:?}: {}", path, e);
            return None;
        }
    };

    let shortname = fs.shortname(path);

    if info.is_symlink {
        return Some(FsNode {
            name: name.to_string(),
            cloud_name: name.to_string(),
            fsid: if info.fsid_valid { info.fsid } else { 0 },
            kind: NodeKind::File,
            size: info.size,
            mtime: info.mtime,
            fingerprint: None,
            is_symlink: true,
            is_blocked: false,
            shortname,
        });
    }

    let fsid = if info.fsid_valid { info.fsid } else { 0 };

    let fingerprint = match info.kind {
        NodeKind::Folder => None,
        NodeKind::File => {
            let reusable = spec.known.get(name).filter(|k| {
                k.size == info.size && k.mtime == info.mtime && k.fsid != 0 && k.fsid == fsid
            });
            match reusable {
                Some(known) => Some(known.fingerprint),
                None => match fs.fingerprint(path, info.size, info.mtime) {
                    Ok(fp) => Some(fp),
                    Err(e) if e.is_transient() => {
                        debug!("fingerprint of {:?} blocked: {}", path, e);
                        return Some(blocked_node(name));
                    }
                    Err(e) => {
                        warn!("cannot fingerprint {:?}: {}", path, e);
                        return Some(blocked_node(name));
                    }
                },
            }
        }
    };

    Some(FsNode {
        name: name.to_string(),
        cloud_name: name.to_string(),
        fsid,
        kind: info.kind,
        size: info.size,
        mtime: info.mtime,
        fingerprint,
        is_symlink: false,
        is_blocked: false,
        shortname,
    })
}

fn blocked_node(name: &str) -> FsNode {
    FsNode {
        name: name.to_string(),
        cloud_name: name.to_string(),
        fsid: 0,
        kind: NodeKind::File,
        size: 0,
        mtime: 0,
        fingerprint: None,
        is_symlink: false,
        is_blocked: true,
        shortname: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StdFilesystem;
    use std::time::Duration;

    async fn wait_complete(request: &ScanRequest) -> ScanOutcome {
        for _ in 0..200 {
            if request.completed() {
                return request.take_outcome().unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scan did not complete");
    }

    #[tokio::test]
    async fn scans_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let service = ScanService::new(Arc::new(StdFilesystem::new()), 2);
        let request = service.scan(ScanSpec {
            target: dir.path().to_path_buf(),
            ..Default::default()
        });

        let outcome = wait_complete(&request).await;
        assert!(!outcome.root_unreadable);
        assert_eq!(outcome.nodes.len(), 2);

        let file = outcome.nodes.iter().find(|n| n.name == "one.txt").unwrap();
        assert_eq!(file.kind, NodeKind::File);
        assert!(file.fingerprint.is_some());

        let folder = outcome.nodes.iter().find(|n| n.name == "sub").unwrap();
        assert_eq!(folder.kind, NodeKind::Folder);
        assert!(folder.fingerprint.is_none());

        service.shutdown();
    }

    #[tokio::test]
    async fn unreadable_root_is_flagged() {
        let service = ScanService::new(Arc::new(StdFilesystem::new()), 1);
        let request = service.scan(ScanSpec {
            target: PathBuf::from("/definitely/not/a/real/path"),
            ..Default::default()
        });

        let outcome = wait_complete(&request).await;
        assert!(outcome.root_unreadable);
        assert!(outcome.nodes.is_empty());
        service.shutdown();
    }

    #[tokio::test]
    async fn debris_subtree_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kept.txt"), b"1").unwrap();
        std::fs::create_dir(dir.path().join(".debris")).unwrap();

        let service = ScanService::new(Arc::new(StdFilesystem::new()), 1);
        let request = service.scan(ScanSpec {
            target: dir.path().to_path_buf(),
            exclude: Some(dir.path().join(".debris")),
            known: HashMap::new(),
        });

        let outcome = wait_complete(&request).await;
        assert_eq!(outcome.nodes.len(), 1);
        assert_eq!(outcome.nodes[0].name, "kept.txt");
        service.shutdown();
    }

    #[tokio::test]
    async fn known_entry_skips_fingerprinting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let fs = StdFilesystem::new();
        let info = fs.open(&path).unwrap();
        let sentinel = FileFingerprint {
            size: info.size,
            mtime: info.mtime,
            crc: [0xdead, 0xbeef, 0xcafe, 0xf00d],
        };

        let mut known = HashMap::new();
        known.insert(
            "file.bin".to_string(),
            KnownEntry {
                size: info.size,
                mtime: info.mtime,
                fsid: info.fsid,
                fingerprint: sentinel,
            },
        );

        let service = ScanService::new(Arc::new(fs), 1);
        let request = service.scan(ScanSpec {
            target: dir.path().to_path_buf(),
            exclude: None,
            known,
        });

        let outcome = wait_complete(&request).await;
        // The sentinel coming back proves the worker reused it.
        assert_eq!(outcome.nodes[0].fingerprint, Some(sentinel));
        service.shutdown();
    }
}
