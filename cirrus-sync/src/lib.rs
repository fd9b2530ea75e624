//! cirrus-sync: the bidirectional synchronization core
//!
//! This crate reconciles a local filesystem subtree with a remote cloud
//! subtree. The heart is the per-folder reconciler: for every name it joins
//! the cloud node, the last-synced state, and the live filesystem entry,
//! and decides which mutation (upload, download, rename, move, delete, or
//! none) brings them back into agreement — while tolerating concurrent
//! edits on both sides, partial failures, rescans, crashes, and resumes.
//!
//! Major pieces:
//! - `engine`: the top-level `SyncEngine`, its sync task, and lifecycle
//! - `reconciler`: the eight-case row state machine
//! - `tree`: the arena-backed LocalNode shadow tree
//! - `statecache`: the durable snapshot of that tree
//! - `moves`: fsid/handle indexes and move detection
//! - `stall`: stall and name-conflict reporting
//! - `config` / `config_store`: persisted sync configs, double-slot
//!   encrypted storage
//! - `change_detection`: notification queues and periodic rescans
//! - `backup`: the Mirror/Monitor machine and cloud-action attribution

pub mod backup;
pub mod change_detection;
pub mod config;
pub mod config_store;
pub mod errors;
pub mod moves;
pub mod name;
pub mod row;
pub mod stall;
pub mod statecache;
pub mod tree;
pub mod waiter;

mod engine;
mod reconciler;
mod runtime;

pub use backup::{resume_backup_state, ExpectedCloudActions, ATTRIBUTION_WINDOW};
pub use change_detection::{NotifyDrain, NotifyQueue, ScanSchedule};
pub use config::{
    BackupId, BackupState, ChangeDetection, RemoteRoot, RunState, SyncConfig, SyncProblem,
    SyncType, SyncWarning,
};
pub use config_store::{ConfigCipher, SyncConfigStore};
pub use engine::{
    AddSyncRequest, CompletionQueue, EngineOptions, SyncController, SyncEngine,
};
pub use errors::{Result, SyncError};
pub use moves::{EngineIndexes, FileChangeWatch, NodeRef};
pub use row::{compute_triplets, RowType, SyncRow};
pub use stall::{
    NameConflict, PathProblem, ProgressGate, StallReason, StallReport, SyncStallEntry,
};
pub use statecache::{SqliteStateTable, StateTable};
pub use tree::{LnId, LocalNode, LocalTree, TreeAction};
pub use waiter::{PathStateCache, PathSyncState};
