//! Filesystem side of the cirrus sync engine
//!
//! This crate provides everything the sync core needs from the local disk:
//! - The `Filesystem` adapter trait and its `std::fs` implementation
//! - Content fingerprints for change detection
//! - The asynchronous scan service producing `FsNode` lists
//! - Change notifications via the platform watcher
//! - The local debris folder where deletions are parked

pub mod adapter;
pub mod debris;
pub mod errors;
pub mod fingerprint;
pub mod fsnode;
pub mod scanner;
pub mod watcher;

pub use adapter::{FileInfo, Filesystem, StdFilesystem, VolumeFingerprint};
pub use debris::{Debris, DebrisOutcome, DEBRIS_DIR};
pub use errors::{FsError, Result};
pub use fingerprint::FileFingerprint;
pub use fsnode::{FsNode, NodeKind};
pub use scanner::{KnownEntry, ScanOutcome, ScanRequest, ScanService, ScanSpec};
pub use watcher::{watch_subtree, NotifyEvent, NotifyHandle};
