//! Transfer engine interface
//!
//! The sync core does not move file content itself; it hands `TransferFile`
//! descriptors to an external transfer engine and reacts to completions.
//! Retry policy lives with the transfer side: 16 retries overall, 6 for
//! local I/O failures, lifted to 8 for sync-initiated transfers so engine
//! re-issues are smoothed over. Quota exhaustion retries indefinitely with
//! backoff.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use priority_queue::PriorityQueue;

use cirrus_fs::FileFingerprint;

use crate::adapter::UploadHandle;
use crate::node::NodeHandle;

pub const MAX_RETRIES: u32 = 16;
pub const MAX_RETRIES_IO: u32 = 6;
/// I/O retry ceiling for transfers started by the sync engine itself.
pub const MAX_RETRIES_IO_SYNC: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDirection {
    Get,
    Put,
}

/// Cooperative cancellation for one transfer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Descriptor handed to the transfer engine.
#[derive(Debug, Clone)]
pub struct TransferFile {
    pub local_path: PathBuf,
    pub name: String,
    /// Cloud parent: the upload target, or the downloaded node's parent.
    pub parent: NodeHandle,
    /// Node being downloaded; unset for uploads.
    pub source: Option<NodeHandle>,
    pub fingerprint: FileFingerprint,
    /// Symmetric key for the chunked transfer subsystem.
    pub cipher_key: [u8; 16],
    pub cancel: CancelToken,
    /// Started by the sync engine (true) or directly by the user.
    pub sync_initiated: bool,
}

#[derive(Debug)]
pub enum TransferOutcome {
    /// Uploads carry the staged-content reference for the follow-up
    /// `put_nodes`; downloads carry nothing.
    Complete(Option<UploadHandle>),
    Failed { transient: bool, reason: String },
    Cancelled,
}

pub type TransferCompletion = Box<dyn FnOnce(TransferOutcome) + Send + 'static>;

pub trait TransferEngine: Send + Sync {
    fn start_xfer(&self, direction: XferDirection, file: TransferFile, completion: TransferCompletion);
}

/// Tracks the remaining retry budget of one transfer.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    general: u32,
    io: u32,
}

impl RetryBudget {
    pub fn new(sync_initiated: bool) -> Self {
        Self {
            general: MAX_RETRIES,
            io: if sync_initiated {
                MAX_RETRIES_IO_SYNC
            } else {
                MAX_RETRIES_IO
            },
        }
    }

    /// Account for one failure; returns false once the budget is spent.
    /// Quota failures never consume budget.
    pub fn consume(&mut self, failure: &TransferFailure) -> bool {
        match failure {
            TransferFailure::OverQuota => true,
            TransferFailure::LocalIo => {
                self.general = self.general.saturating_sub(1);
                self.io = self.io.saturating_sub(1);
                self.general > 0 && self.io > 0
            }
            TransferFailure::Network | TransferFailure::Other => {
                self.general = self.general.saturating_sub(1);
                self.general > 0
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFailure {
    LocalIo,
    Network,
    OverQuota,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferPriority {
    Low = 0,
    Normal = 1,
    High = 2,
}

/// Pending-transfer queue used by engine implementations to bound
/// concurrency.
pub struct TransferQueue<T: std::hash::Hash + Eq> {
    queue: PriorityQueue<T, TransferPriority>,
    max_concurrent: usize,
    active: usize,
}

impl<T: std::hash::Hash + Eq> TransferQueue<T> {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            queue: PriorityQueue::new(),
            max_concurrent,
            active: 0,
        }
    }

    pub fn push(&mut self, item: T, priority: TransferPriority) {
        self.queue.push(item, priority);
    }

    pub fn next(&mut self) -> Option<T> {
        if self.active >= self.max_concurrent {
            return None;
        }
        self.queue.pop().map(|(item, _)| {
            self.active += 1;
            item
        })
    }

    pub fn complete_one(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn active(&self) -> usize {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_budget_is_tighter_than_general() {
        let mut budget = RetryBudget::new(false);
        for _ in 0..MAX_RETRIES_IO - 1 {
            assert!(budget.consume(&TransferFailure::LocalIo));
        }
        assert!(!budget.consume(&TransferFailure::LocalIo));
    }

    #[test]
    fn sync_transfers_get_extra_io_retries() {
        let mut user = RetryBudget::new(false);
        let mut sync = RetryBudget::new(true);
        let mut user_count = 0;
        let mut sync_count = 0;
        while user.consume(&TransferFailure::LocalIo) {
            user_count += 1;
        }
        while sync.consume(&TransferFailure::LocalIo) {
            sync_count += 1;
        }
        assert!(sync_count > user_count);
    }

    #[test]
    fn quota_never_exhausts() {
        let mut budget = RetryBudget::new(false);
        for _ in 0..1000 {
            assert!(budget.consume(&TransferFailure::OverQuota));
        }
    }

    #[test]
    fn queue_bounds_concurrency() {
        let mut queue: TransferQueue<&str> = TransferQueue::new(2);
        queue.push("a", TransferPriority::Normal);
        queue.push("b", TransferPriority::High);
        queue.push("c", TransferPriority::Low);

        assert_eq!(queue.next(), Some("b"));
        assert_eq!(queue.next(), Some("a"));
        assert_eq!(queue.next(), None);
        queue.complete_one();
        assert_eq!(queue.next(), Some("c"));
    }
}
