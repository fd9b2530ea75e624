//! Cloud node snapshots

use serde::{Deserialize, Serialize};

use cirrus_fs::{FileFingerprint, NodeKind};

/// Opaque identity of a remote node. Stable for the node's lifetime; a
/// handle reappearing under a different parent is how the engine recognizes
/// a remote move.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct NodeHandle(pub u64);

impl NodeHandle {
    pub const UNDEF: NodeHandle = NodeHandle(0);

    pub fn is_undef(&self) -> bool {
        self.0 == 0
    }
}

/// Read-only snapshot of a remote node, refreshed on demand. The reconciler
/// never mutates these; mutations go through `CloudClient` commands.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudNode {
    pub handle: NodeHandle,
    pub parent: NodeHandle,
    pub kind: NodeKind,
    pub name: String,
    /// Content fingerprint; files only.
    pub fingerprint: Option<FileFingerprint>,
    pub owner_user: u64,
    pub in_share: bool,
    /// Commands issued by this client are still in flight for this node.
    pub has_pending_changes: bool,
}

impl CloudNode {
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}
