//! Cloud adapter
//!
//! The sync core consumes the cloud through this trait. Structural queries
//! are synchronous snapshots; mutations take a completion callback which the
//! network side delivers back to the sync task, in the order the cloud
//! acknowledged the commands. A subscription channel carries "nodes
//! updated" events with no ordering guarantee relative to command
//! completions.

use tokio::sync::mpsc;

use cirrus_fs::{FileFingerprint, NodeKind};

use crate::errors::Result;
use crate::node::{CloudNode, NodeHandle};

/// Completion callback for a cloud command.
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Reference to content staged by a finished upload, consumed by
/// `put_nodes` to attach the data to a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UploadHandle(pub u64);

/// Node creation order for `put_nodes`.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub kind: NodeKind,
    pub fingerprint: Option<FileFingerprint>,
    /// Present for file nodes created from a completed upload.
    pub upload: Option<UploadHandle>,
}

/// Attribute updates for `set_attr`.
#[derive(Debug, Clone, Default)]
pub struct NodeAttrs {
    pub name: Option<String>,
    pub fingerprint: Option<FileFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudEventKind {
    Added,
    Removed,
    Renamed,
    AttrChanged,
}

/// One remote mutation observed via the subscription channel.
#[derive(Debug, Clone)]
pub struct CloudEvent {
    pub kind: CloudEventKind,
    pub handle: NodeHandle,
    pub parent: NodeHandle,
    pub name: String,
}

pub trait CloudClient: Send + Sync {
    /// Snapshot of one node, `None` if it does not exist.
    fn node_by_handle(&self, handle: NodeHandle) -> Option<CloudNode>;

    /// Snapshot of a folder's children.
    fn children(&self, parent: NodeHandle) -> Vec<CloudNode>;

    /// Cloud-side path of a node, for reporting.
    fn node_path(&self, handle: NodeHandle) -> Option<String>;

    /// Move and/or rename a node.
    fn rename(
        &self,
        handle: NodeHandle,
        new_parent: NodeHandle,
        new_name: &str,
        completion: Completion<()>,
    );

    /// Create nodes under `parent`. When `versioning` is set an existing
    /// file of the same name becomes a previous version instead of a
    /// sibling.
    fn put_nodes(
        &self,
        parent: NodeHandle,
        nodes: Vec<NewNode>,
        versioning: bool,
        completion: Completion<Vec<NodeHandle>>,
    );

    fn set_attr(&self, handle: NodeHandle, attrs: NodeAttrs, completion: Completion<()>);

    /// Remove a node; `permanent` skips the rubbish area.
    fn unlink(&self, handle: NodeHandle, permanent: bool, completion: Completion<()>);

    /// Park a node in the cloud's sync-debris area.
    fn move_to_sync_debris(&self, handle: NodeHandle, completion: Completion<()>);

    /// Subscribe to remote-change events.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<CloudEvent>;

    /// True while commands issued by this client are outstanding for the
    /// node. The reconciler refuses to recurse below such nodes.
    fn pending_commands(&self, handle: NodeHandle) -> bool;
}
