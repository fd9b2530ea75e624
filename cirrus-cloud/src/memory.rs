//! In-memory cloud
//!
//! A complete `CloudClient` over an in-memory node tree, with deterministic
//! handle assignment, a completion queue that preserves acknowledgement
//! order, event fan-out, and failure injection. Unit and integration tests
//! run the whole engine against this implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use cirrus_fs::{FileFingerprint, NodeKind};

use crate::adapter::{
    CloudClient, CloudEvent, CloudEventKind, Completion, NewNode, NodeAttrs, UploadHandle,
};
use crate::errors::{CloudError, Result};
use crate::node::{CloudNode, NodeHandle};
use crate::transfer::{TransferCompletion, TransferEngine, TransferFile, TransferOutcome, XferDirection};

/// Closure queue carrying command completions back to the sync task in FIFO
/// acknowledgement order.
pub type CompletionSink = mpsc::UnboundedSender<Box<dyn FnOnce() + Send>>;

struct CloudState {
    nodes: HashMap<u64, CloudNode>,
    children: HashMap<u64, Vec<u64>>,
    contents: HashMap<u64, Vec<u8>>,
    staged: HashMap<u64, (Vec<u8>, FileFingerprint)>,
    next_id: u64,
    fail_next: Option<CloudError>,
}

pub struct MemoryCloud {
    state: Mutex<CloudState>,
    completions: Mutex<CompletionSink>,
    pending: Arc<Mutex<HashMap<u64, u32>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CloudEvent>>>,
    next_upload: AtomicU64,
    root: NodeHandle,
    debris: NodeHandle,
}

const ROOT_ID: u64 = 1;
const DEBRIS_ID: u64 = 2;

impl MemoryCloud {
    pub fn new(completions: CompletionSink) -> Arc<Self> {
        let mut nodes = HashMap::new();
        let mut children = HashMap::new();
        for (id, name) in [(ROOT_ID, ""), (DEBRIS_ID, "SyncDebris")] {
            nodes.insert(
                id,
                CloudNode {
                    handle: NodeHandle(id),
                    parent: NodeHandle::UNDEF,
                    kind: NodeKind::Folder,
                    name: name.to_string(),
                    fingerprint: None,
                    owner_user: 1,
                    in_share: false,
                    has_pending_changes: false,
                },
            );
            children.insert(id, Vec::new());
        }
        Arc::new(Self {
            state: Mutex::new(CloudState {
                nodes,
                children,
                contents: HashMap::new(),
                staged: HashMap::new(),
                next_id: 100,
                fail_next: None,
            }),
            completions: Mutex::new(completions),
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Mutex::new(Vec::new()),
            next_upload: AtomicU64::new(1),
            root: NodeHandle(ROOT_ID),
            debris: NodeHandle(DEBRIS_ID),
        })
    }

    /// Cloud plus a drainable completion queue, for tests that pump it
    /// manually.
    pub fn with_queue() -> (Arc<Self>, mpsc::UnboundedReceiver<Box<dyn FnOnce() + Send>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Replace the completion queue; used when a new engine session takes
    /// over an existing cloud (resume tests).
    pub fn reattach_queue(&self) -> mpsc::UnboundedReceiver<Box<dyn FnOnce() + Send>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.completions.lock().unwrap() = tx;
        rx
    }

    pub fn root(&self) -> NodeHandle {
        self.root
    }

    pub fn sync_debris_root(&self) -> NodeHandle {
        self.debris
    }

    /// Make the next command fail with `err`.
    pub fn inject_failure(&self, err: CloudError) {
        self.state.lock().unwrap().fail_next = Some(err);
    }

    // --- direct mutation surface, used by tests to play the "other client" ---

    pub fn mk_folder(&self, parent: NodeHandle, name: &str) -> NodeHandle {
        let handle = {
            let mut st = self.state.lock().unwrap();
            st.insert_node(parent, name.to_string(), NodeKind::Folder, None)
        };
        self.emit(CloudEventKind::Added, handle, parent, name);
        handle
    }

    pub fn put_file(&self, parent: NodeHandle, name: &str, content: &[u8], mtime: i64) -> NodeHandle {
        let fingerprint = FileFingerprint::from_bytes(content, mtime);
        let handle = {
            let mut st = self.state.lock().unwrap();
            let handle = st.insert_node(parent, name.to_string(), NodeKind::File, Some(fingerprint));
            st.contents.insert(handle.0, content.to_vec());
            handle
        };
        self.emit(CloudEventKind::Added, handle, parent, name);
        handle
    }

    pub fn remove(&self, handle: NodeHandle) {
        let (parent, name) = {
            let mut st = self.state.lock().unwrap();
            let Some(node) = st.nodes.get(&handle.0).cloned() else {
                return;
            };
            st.detach(handle);
            st.drop_subtree(handle);
            (node.parent, node.name)
        };
        self.emit(CloudEventKind::Removed, handle, parent, &name);
    }

    pub fn move_node(&self, handle: NodeHandle, new_parent: NodeHandle, new_name: &str) {
        {
            let mut st = self.state.lock().unwrap();
            st.detach(handle);
            st.attach(handle, new_parent, new_name.to_string());
        }
        self.emit(CloudEventKind::Renamed, handle, new_parent, new_name);
    }

    pub fn content_of(&self, handle: NodeHandle) -> Option<Vec<u8>> {
        self.state.lock().unwrap().contents.get(&handle.0).cloned()
    }

    /// Resolve a `/`-separated path below the cloud root.
    pub fn lookup(&self, path: &str) -> Option<CloudNode> {
        let st = self.state.lock().unwrap();
        let mut current = self.root.0;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let children = st.children.get(&current)?;
            current = *children
                .iter()
                .find(|id| st.nodes.get(id).map(|n| n.name.as_str()) == Some(part))?;
        }
        st.nodes.get(&current).cloned()
    }

    /// Stage uploaded content; consumed later by `put_nodes`.
    pub fn stage_upload(&self, content: Vec<u8>, fingerprint: FileFingerprint) -> UploadHandle {
        let id = self.next_upload.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .unwrap()
            .staged
            .insert(id, (content, fingerprint));
        UploadHandle(id)
    }

    // --- internals ---

    fn emit(&self, kind: CloudEventKind, handle: NodeHandle, parent: NodeHandle, name: &str) {
        let event = CloudEvent {
            kind,
            handle,
            parent,
            name: name.to_string(),
        };
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn take_injected_failure(&self) -> Option<CloudError> {
        self.state.lock().unwrap().fail_next.take()
    }

    /// Queue `completion(result)` behind the commands already acknowledged,
    /// holding the node's pending-command window open until it runs.
    fn finish<T: Send + 'static>(
        &self,
        handle: NodeHandle,
        completion: Completion<T>,
        result: Result<T>,
    ) {
        {
            let mut pending = self.pending.lock().unwrap();
            *pending.entry(handle.0).or_insert(0) += 1;
        }
        let guard = PendingGuard {
            map: self.pending.clone(),
            handle,
        };
        let _ = self.completions.lock().unwrap().send(Box::new(move || {
            drop(guard);
            completion(result);
        }));
    }
}

struct PendingGuard {
    map: Arc<Mutex<HashMap<u64, u32>>>,
    handle: NodeHandle,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap();
        if let Some(count) = map.get_mut(&self.handle.0) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(&self.handle.0);
            }
        }
    }
}

impl CloudState {
    fn insert_node(
        &mut self,
        parent: NodeHandle,
        name: String,
        kind: NodeKind,
        fingerprint: Option<FileFingerprint>,
    ) -> NodeHandle {
        let id = self.next_id;
        self.next_id += 1;
        let handle = NodeHandle(id);
        self.nodes.insert(
            id,
            CloudNode {
                handle,
                parent,
                kind,
                name,
                fingerprint,
                owner_user: 1,
                in_share: false,
                has_pending_changes: false,
            },
        );
        self.children.entry(id).or_default();
        self.children.entry(parent.0).or_default().push(id);
        handle
    }

    fn detach(&mut self, handle: NodeHandle) {
        if let Some(node) = self.nodes.get(&handle.0) {
            let parent = node.parent.0;
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|id| *id != handle.0);
            }
        }
    }

    fn attach(&mut self, handle: NodeHandle, parent: NodeHandle, name: String) {
        if let Some(node) = self.nodes.get_mut(&handle.0) {
            node.parent = parent;
            node.name = name;
        }
        self.children.entry(parent.0).or_default().push(handle.0);
    }

    fn drop_subtree(&mut self, handle: NodeHandle) {
        let mut stack = vec![handle.0];
        while let Some(id) = stack.pop() {
            if let Some(children) = self.children.remove(&id) {
                stack.extend(children);
            }
            self.nodes.remove(&id);
            self.contents.remove(&id);
        }
    }

    fn path_of(&self, handle: NodeHandle) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = handle.0;
        loop {
            let node = self.nodes.get(&current)?;
            if node.parent.is_undef() {
                if !node.name.is_empty() {
                    parts.push(node.name.clone());
                }
                break;
            }
            parts.push(node.name.clone());
            current = node.parent.0;
        }
        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }
}

impl CloudClient for MemoryCloud {
    fn node_by_handle(&self, handle: NodeHandle) -> Option<CloudNode> {
        let mut node = self.state.lock().unwrap().nodes.get(&handle.0).cloned()?;
        node.has_pending_changes = self.pending_commands(handle);
        Some(node)
    }

    fn children(&self, parent: NodeHandle) -> Vec<CloudNode> {
        let st = self.state.lock().unwrap();
        let pending = self.pending.lock().unwrap();
        st.children
            .get(&parent.0)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| st.nodes.get(id))
                    .cloned()
                    .map(|mut n| {
                        n.has_pending_changes = pending.contains_key(&n.handle.0);
                        n
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn node_path(&self, handle: NodeHandle) -> Option<String> {
        self.state.lock().unwrap().path_of(handle)
    }

    fn rename(
        &self,
        handle: NodeHandle,
        new_parent: NodeHandle,
        new_name: &str,
        completion: Completion<()>,
    ) {
        if let Some(err) = self.take_injected_failure() {
            self.finish(handle, completion, Err(err));
            return;
        }
        let result = {
            let mut st = self.state.lock().unwrap();
            if !st.nodes.contains_key(&handle.0) {
                Err(CloudError::NotFound(handle))
            } else if !st.nodes.contains_key(&new_parent.0) {
                Err(CloudError::NotFound(new_parent))
            } else {
                st.detach(handle);
                st.attach(handle, new_parent, new_name.to_string());
                Ok(())
            }
        };
        if result.is_ok() {
            debug!("cloud rename {:?} -> {:?}/{}", handle, new_parent, new_name);
            self.emit(CloudEventKind::Renamed, handle, new_parent, new_name);
        }
        self.finish(handle, completion, result);
    }

    fn put_nodes(
        &self,
        parent: NodeHandle,
        nodes: Vec<NewNode>,
        versioning: bool,
        completion: Completion<Vec<NodeHandle>>,
    ) {
        if let Some(err) = self.take_injected_failure() {
            self.finish(parent, completion, Err(err));
            return;
        }
        let mut created = Vec::with_capacity(nodes.len());
        let mut events = Vec::new();
        let result = {
            let mut st = self.state.lock().unwrap();
            if !st.nodes.contains_key(&parent.0) {
                Err(CloudError::NotFound(parent))
            } else {
                for new_node in nodes {
                    if versioning && new_node.kind == NodeKind::File {
                        // Same-name file becomes a previous version: the old
                        // node is dropped here, superseded by the new one.
                        let existing = st
                            .children
                            .get(&parent.0)
                            .and_then(|ids| {
                                ids.iter()
                                    .find(|id| {
                                        st.nodes.get(id).map(|n| n.name.as_str())
                                            == Some(new_node.name.as_str())
                                    })
                                    .copied()
                            });
                        if let Some(id) = existing {
                            st.detach(NodeHandle(id));
                            st.drop_subtree(NodeHandle(id));
                        }
                    }
                    let content = new_node
                        .upload
                        .and_then(|u| st.staged.remove(&u.0));
                    let fingerprint = new_node
                        .fingerprint
                        .or_else(|| content.as_ref().map(|(_, fp)| *fp));
                    let handle =
                        st.insert_node(parent, new_node.name.clone(), new_node.kind, fingerprint);
                    if let Some((data, _)) = content {
                        st.contents.insert(handle.0, data);
                    }
                    events.push((handle, new_node.name));
                    created.push(handle);
                }
                Ok(created)
            }
        };
        if result.is_ok() {
            for (handle, name) in &events {
                self.emit(CloudEventKind::Added, *handle, parent, name);
            }
        }
        self.finish(parent, completion, result);
    }

    fn set_attr(&self, handle: NodeHandle, attrs: NodeAttrs, completion: Completion<()>) {
        if let Some(err) = self.take_injected_failure() {
            self.finish(handle, completion, Err(err));
            return;
        }
        let result = {
            let mut st = self.state.lock().unwrap();
            match st.nodes.get_mut(&handle.0) {
                None => Err(CloudError::NotFound(handle)),
                Some(node) => {
                    if let Some(name) = attrs.name {
                        node.name = name;
                    }
                    if let Some(fp) = attrs.fingerprint {
                        node.fingerprint = Some(fp);
                    }
                    Ok(())
                }
            }
        };
        if result.is_ok() {
            let info = {
                let st = self.state.lock().unwrap();
                st.nodes.get(&handle.0).map(|n| (n.parent, n.name.clone()))
            };
            if let Some((parent, name)) = info {
                self.emit(CloudEventKind::AttrChanged, handle, parent, &name);
            }
        }
        self.finish(handle, completion, result);
    }

    fn unlink(&self, handle: NodeHandle, _permanent: bool, completion: Completion<()>) {
        if let Some(err) = self.take_injected_failure() {
            self.finish(handle, completion, Err(err));
            return;
        }
        let removed = {
            let mut st = self.state.lock().unwrap();
            match st.nodes.get(&handle.0).cloned() {
                None => Err(CloudError::NotFound(handle)),
                Some(node) => {
                    st.detach(handle);
                    st.drop_subtree(handle);
                    Ok((node.parent, node.name))
                }
            }
        };
        match removed {
            Ok((parent, name)) => {
                self.emit(CloudEventKind::Removed, handle, parent, &name);
                self.finish(handle, completion, Ok(()));
            }
            Err(e) => self.finish(handle, completion, Err(e)),
        }
    }

    fn move_to_sync_debris(&self, handle: NodeHandle, completion: Completion<()>) {
        if let Some(err) = self.take_injected_failure() {
            self.finish(handle, completion, Err(err));
            return;
        }
        let result = {
            let mut st = self.state.lock().unwrap();
            match st.nodes.get(&handle.0).cloned() {
                None => Err(CloudError::NotFound(handle)),
                Some(node) => {
                    st.detach(handle);
                    let name = node.name.clone();
                    st.attach(handle, self.debris, name);
                    Ok((node.parent, node.name))
                }
            }
        };
        match result {
            Ok((old_parent, name)) => {
                // Removal is reported against the folder it vanished from.
                self.emit(CloudEventKind::Removed, handle, old_parent, &name);
                self.finish(handle, completion, Ok(()));
            }
            Err(e) => self.finish(handle, completion, Err(e)),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<CloudEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn pending_commands(&self, handle: NodeHandle) -> bool {
        self.pending.lock().unwrap().contains_key(&handle.0)
    }
}

/// Transfer engine over the in-memory cloud: uploads stage content, then
/// the engine's `put_nodes` attaches it; downloads write straight to the
/// local target and restore the cloud mtime.
pub struct MemoryTransferEngine {
    cloud: Arc<MemoryCloud>,
    upload_delay: Mutex<Duration>,
    started: AtomicU64,
}

impl MemoryTransferEngine {
    pub fn new(cloud: Arc<MemoryCloud>) -> Arc<Self> {
        Arc::new(Self {
            cloud,
            upload_delay: Mutex::new(Duration::ZERO),
            started: AtomicU64::new(0),
        })
    }

    /// Slow down uploads, for tests racing renames against transfers.
    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = delay;
    }

    pub fn transfers_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

impl TransferEngine for MemoryTransferEngine {
    fn start_xfer(
        &self,
        direction: XferDirection,
        file: TransferFile,
        completion: TransferCompletion,
    ) {
        self.started.fetch_add(1, Ordering::Relaxed);
        let cloud = self.cloud.clone();
        let delay = match direction {
            XferDirection::Put => *self.upload_delay.lock().unwrap(),
            XferDirection::Get => Duration::ZERO,
        };

        tokio::spawn(async move {
            // Uploads read their source immediately, like a transfer layer
            // holding the file open: a rename mid-transfer does not kill
            // the upload.
            let staged: Option<std::io::Result<Vec<u8>>> = match direction {
                XferDirection::Put => {
                    let path = file.local_path.clone();
                    Some(
                        tokio::task::spawn_blocking(move || std::fs::read(&path))
                            .await
                            .unwrap_or_else(|e| {
                                Err(std::io::Error::new(std::io::ErrorKind::Other, e))
                            }),
                    )
                }
                XferDirection::Get => None,
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if file.cancel.is_cancelled() {
                completion(TransferOutcome::Cancelled);
                return;
            }
            let outcome = tokio::task::spawn_blocking(move || match direction {
                XferDirection::Put => match staged.expect("uploads staged above") {
                    Ok(content) => {
                        let upload = cloud.stage_upload(content, file.fingerprint);
                        TransferOutcome::Complete(Some(upload))
                    }
                    Err(e) => TransferOutcome::Failed {
                        transient: e.kind() == std::io::ErrorKind::Interrupted,
                        reason: e.to_string(),
                    },
                },
                XferDirection::Get => {
                    let Some(source) = file.source else {
                        return TransferOutcome::Failed {
                            transient: false,
                            reason: "download without source handle".into(),
                        };
                    };
                    match cloud.content_of(source) {
                        None => TransferOutcome::Failed {
                            transient: false,
                            reason: "source disappeared".into(),
                        },
                        Some(content) => match std::fs::write(&file.local_path, &content) {
                            Ok(()) => {
                                let target = std::fs::OpenOptions::new()
                                    .write(true)
                                    .open(&file.local_path)
                                    .and_then(|f| {
                                        f.set_modified(
                                            std::time::UNIX_EPOCH
                                                + Duration::from_secs(
                                                    file.fingerprint.mtime.max(0) as u64,
                                                ),
                                        )
                                    });
                                match target {
                                    Ok(()) => TransferOutcome::Complete(None),
                                    Err(e) => TransferOutcome::Failed {
                                        transient: false,
                                        reason: e.to_string(),
                                    },
                                }
                            }
                            Err(e) => TransferOutcome::Failed {
                                transient: true,
                                reason: e.to_string(),
                            },
                        },
                    }
                }
            })
            .await
            .unwrap_or(TransferOutcome::Failed {
                transient: false,
                reason: "transfer task panicked".into(),
            });
            completion(outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Box<dyn FnOnce() + Send>>) {
        while let Ok(completion) = rx.try_recv() {
            completion();
        }
    }

    #[tokio::test]
    async fn mkdir_and_lookup() {
        let (cloud, _rx) = MemoryCloud::with_queue();
        let f = cloud.mk_folder(cloud.root(), "f");
        let sub = cloud.mk_folder(f, "sub");

        assert_eq!(cloud.lookup("f/sub").unwrap().handle, sub);
        assert_eq!(cloud.node_path(sub).unwrap(), "/f/sub");
    }

    #[tokio::test]
    async fn rename_completion_is_queued_fifo() {
        let (cloud, mut rx) = MemoryCloud::with_queue();
        let f = cloud.mk_folder(cloud.root(), "f");
        let order = Arc::new(Mutex::new(Vec::new()));

        for (i, name) in ["a", "b"].iter().enumerate() {
            let order = order.clone();
            cloud.rename(
                f,
                cloud.root(),
                name,
                Box::new(move |r| {
                    r.unwrap();
                    order.lock().unwrap().push(i);
                }),
            );
        }

        assert!(cloud.pending_commands(f));
        drain(&mut rx);
        assert!(!cloud.pending_commands(f));
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn put_nodes_with_staged_upload_attaches_content() {
        let (cloud, mut rx) = MemoryCloud::with_queue();
        let fp = FileFingerprint::from_bytes(b"data", 5);
        let upload = cloud.stage_upload(b"data".to_vec(), fp);

        let created: Arc<Mutex<Vec<NodeHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = created.clone();
        cloud.put_nodes(
            cloud.root(),
            vec![NewNode {
                name: "file.bin".into(),
                kind: NodeKind::File,
                fingerprint: None,
                upload: Some(upload),
            }],
            false,
            Box::new(move |r| {
                *sink.lock().unwrap() = r.unwrap();
            }),
        );
        drain(&mut rx);

        let handle = created.lock().unwrap()[0];
        assert_eq!(cloud.content_of(handle).unwrap(), b"data");
        assert_eq!(cloud.lookup("file.bin").unwrap().fingerprint, Some(fp));
    }

    #[tokio::test]
    async fn injected_failure_reaches_completion() {
        let (cloud, mut rx) = MemoryCloud::with_queue();
        let f = cloud.mk_folder(cloud.root(), "f");
        cloud.inject_failure(CloudError::Transient("blip".into()));

        let saw_error = Arc::new(Mutex::new(false));
        let sink = saw_error.clone();
        cloud.rename(
            f,
            cloud.root(),
            "renamed",
            Box::new(move |r| {
                *sink.lock().unwrap() = r.is_err();
            }),
        );
        drain(&mut rx);
        assert!(*saw_error.lock().unwrap());
        // State unchanged.
        assert!(cloud.lookup("f").is_some());
    }

    #[tokio::test]
    async fn events_fan_out_to_subscribers() {
        let (cloud, _rx) = MemoryCloud::with_queue();
        let mut events = cloud.subscribe();
        cloud.mk_folder(cloud.root(), "watched");
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, CloudEventKind::Added);
        assert_eq!(event.name, "watched");
    }
}
