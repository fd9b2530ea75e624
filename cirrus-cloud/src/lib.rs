//! Cloud side of the cirrus sync engine
//!
//! This crate defines what the sync core consumes from the cloud service:
//! - `CloudNode` snapshots and the `CloudClient` command interface
//! - The `TransferEngine` interface and its retry policy
//! - `MemoryCloud`, a complete in-memory implementation used by tests
//!
//! The wire format and the chunked-transfer subsystem live behind these
//! traits and are not part of this workspace.

pub mod adapter;
pub mod errors;
pub mod memory;
pub mod node;
pub mod transfer;

pub use adapter::{
    CloudClient, CloudEvent, CloudEventKind, Completion, NewNode, NodeAttrs, UploadHandle,
};
pub use errors::{CloudError, Result};
pub use memory::{CompletionSink, MemoryCloud, MemoryTransferEngine};
pub use node::{CloudNode, NodeHandle};
pub use transfer::{
    CancelToken, RetryBudget, TransferCompletion, TransferEngine, TransferFailure, TransferFile,
    TransferOutcome, TransferPriority, TransferQueue, XferDirection, MAX_RETRIES, MAX_RETRIES_IO,
    MAX_RETRIES_IO_SYNC,
};
