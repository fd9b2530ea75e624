//! Per-sync runtime state
//!
//! Everything one active sync owns between reconciliation passes: the
//! LocalNode tree, the state-cache handle and its insert/delete queues, the
//! notification queue, the scan in flight, debris, move bookkeeping, and
//! the pass flags the reconciler's ordering gates read.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, warn};

use cirrus_cloud::{CancelToken, NodeHandle};
use cirrus_fs::{Debris, NotifyHandle, ScanRequest};

use crate::backup::ExpectedCloudActions;
use crate::change_detection::{NotifyQueue, ScanSchedule};
use crate::config::{SyncConfig, SyncProblem};
use crate::moves::FileChangeWatch;
use crate::stall::{ProgressGate, StallReport};
use crate::statecache::{encode_record, record_for, StateTable};
use crate::tree::{LnId, LocalTree};

/// A finished upload whose cloud node may still need to chase the local
/// file to its current position.
#[derive(Debug, Clone)]
pub(crate) struct CompletedUpload {
    pub handle: NodeHandle,
    pub parent: NodeHandle,
    pub name: String,
}

/// Kept per pass so the log mentions one specific item and counts the rest.
#[derive(Debug, Default)]
pub(crate) struct PassCounters {
    pub already_synced: u32,
    pub already_uploading: u32,
    pub already_downloading: u32,
}

impl PassCounters {
    pub fn report(&self, sync_name: &str) {
        if self.already_synced + self.already_uploading + self.already_downloading > 0 {
            debug!(
                "[{}] pass summary: {} already synced, {} uploading, {} downloading",
                sync_name, self.already_synced, self.already_uploading, self.already_downloading
            );
        }
    }
}

/// State-cache batch threshold: bounds memory on massive renames.
pub(crate) const STATE_CACHE_BATCH: usize = 50_000;

pub(crate) struct SyncRuntime {
    pub config: SyncConfig,
    pub slot: usize,
    pub tree: LocalTree,
    pub statecache: Option<Box<dyn StateTable>>,
    /// Nodes with un-persisted changes.
    pub insertq: BTreeSet<LnId>,
    /// Cache rows awaiting deletion.
    pub deleteq: Vec<u32>,
    pub notifyq: NotifyQueue,
    pub notify_handle: Option<NotifyHandle>,
    pub schedule: Option<ScanSchedule>,
    /// The one directory scan in flight for this sync.
    pub active_scan: Option<(LnId, ScanRequest)>,
    pub debris: Debris,
    pub fs_stable_ids: bool,
    /// Completed-pass results, consulted as "was complete" by the next
    /// pass's ordering gates.
    pub scanning_complete: bool,
    pub scanning_was_complete: bool,
    pub moves_complete: bool,
    pub moves_were_complete: bool,
    pub change_watch: FileChangeWatch,
    pub expected: ExpectedCloudActions,
    /// Finished uploads keyed by source fsid.
    pub completed_uploads: HashMap<u64, CompletedUpload>,
    /// Local paths with a transfer in flight, with the token that cancels
    /// it when the sync is disabled.
    pub in_flight: HashMap<PathBuf, CancelToken>,
    /// Source fsids with an upload in flight; a renamed-while-uploading
    /// file must not start a second upload from its new position.
    pub in_flight_fsids: HashSet<u64>,
    pub gate: ProgressGate,
    /// Set by any mutation during the current pass.
    pub pass_progress: bool,
    pub pass_scan_pending: bool,
    pub pass_moves_pending: bool,
    pub scan_generation: u64,
    /// The whole tree matched on the last pass and nothing is in flight.
    pub all_synced: bool,
    /// Stalls collected during the current pass.
    pub stalls: StallReport,
    pub counters: PassCounters,
    /// A permanent problem detected mid-pass; the engine disables the sync
    /// at the pass boundary.
    pub fail_with: Option<SyncProblem>,
    pub loaded_from_cache: bool,
}

impl SyncRuntime {
    pub fn new(config: SyncConfig, slot: usize, case_insensitive: bool, is_network: bool) -> Self {
        let debris = Debris::new(&config.local_root);
        Self {
            config,
            slot,
            tree: LocalTree::new(case_insensitive),
            statecache: None,
            insertq: BTreeSet::new(),
            deleteq: Vec::new(),
            notifyq: NotifyQueue::new(is_network),
            notify_handle: None,
            schedule: None,
            active_scan: None,
            debris,
            fs_stable_ids: true,
            scanning_complete: false,
            scanning_was_complete: false,
            moves_complete: false,
            moves_were_complete: false,
            change_watch: FileChangeWatch::default(),
            expected: ExpectedCloudActions::default(),
            completed_uploads: HashMap::new(),
            in_flight: HashMap::new(),
            in_flight_fsids: HashSet::new(),
            gate: ProgressGate::default(),
            pass_progress: false,
            pass_scan_pending: false,
            pass_moves_pending: false,
            scan_generation: 0,
            all_synced: false,
            stalls: StallReport::default(),
            counters: PassCounters::default(),
            fail_with: None,
            loaded_from_cache: false,
        }
    }

    pub fn backup_id(&self) -> u64 {
        self.config.backup_id
    }

    /// Queue a node for persistence; drops any pending deletion of it.
    pub fn statecache_add(&mut self, id: LnId) {
        self.insertq.insert(id);
    }

    /// Queue a node's cache row for deletion; drops any pending insert.
    pub fn statecache_del(&mut self, id: LnId) {
        self.insertq.remove(&id);
        if let Some(row) = self.tree.node(id).row_id {
            self.deleteq.push(row);
        }
    }

    /// Drain the insert/delete queues into the table in one transaction.
    /// Parents are persisted before children so the parent-row linkage in
    /// each record is valid.
    pub fn flush_state_cache(&mut self) -> crate::errors::Result<()> {
        if self.insertq.is_empty() && self.deleteq.is_empty() {
            return Ok(());
        }
        let Some(table) = self.statecache.as_mut() else {
            self.insertq.clear();
            self.deleteq.clear();
            return Ok(());
        };

        table.begin()?;
        for row in self.deleteq.drain(..) {
            table.del(row)?;
        }

        let mut pending: Vec<LnId> = self.insertq.iter().copied().collect();
        self.insertq.clear();
        // Dropped nodes may still sit in the queue; skip them.
        pending.retain(|id| self.tree.get(*id).is_some());
        loop {
            let mut progressed = false;
            let mut deferred = Vec::new();
            for id in pending {
                let parent_ready = match self.tree.node(id).parent {
                    None => true,
                    Some(p) => self.tree.node(p).row_id.is_some(),
                };
                if !parent_ready {
                    deferred.push(id);
                    continue;
                }
                let record = record_for(&self.tree, id);
                let row = table.put(self.tree.node(id).row_id, &encode_record(&record))?;
                self.tree.node_mut(id).row_id = Some(row);
                progressed = true;
            }
            if deferred.is_empty() {
                break;
            }
            if !progressed {
                warn!(
                    "[{}] {} cache rows waiting on unpersisted parents",
                    self.config.name,
                    deferred.len()
                );
                // Re-queue for the next flush rather than spinning.
                self.insertq.extend(deferred);
                break;
            }
            pending = deferred;
        }
        table.commit()?;
        Ok(())
    }

    /// Begin-of-pass bookkeeping: last pass's completion results become the
    /// gates for this one.
    pub fn begin_pass(&mut self) {
        self.scanning_was_complete = self.scanning_complete;
        self.moves_were_complete = self.moves_complete;
        self.pass_progress = false;
        self.pass_scan_pending = false;
        self.pass_moves_pending = false;
        self.stalls = StallReport::default();
        self.counters = PassCounters::default();
        self.scan_generation += 1;
    }

    /// End-of-pass bookkeeping; returns whether the tree fully resolved.
    pub fn end_pass(&mut self, root_resolved: bool, now: Instant) -> bool {
        self.scanning_complete = !self.pass_scan_pending && self.active_scan.is_none();
        self.moves_complete = !self.pass_moves_pending;
        self.counters.report(&self.config.name);

        self.all_synced = root_resolved
            && self.scanning_complete
            && self.moves_complete
            && self.in_flight.is_empty()
            && self.stalls.is_empty();

        if self.pass_progress {
            self.gate.note_progress();
        } else {
            self.gate.note_no_progress(!self.stalls.is_empty(), now);
        }
        self.expected.prune(now);
        self.all_synced
    }

    /// Drop LocalNodes never seen by the post-load full scan. Only called
    /// on the Loading -> Run transition; reachable disappearances are
    /// handled by ordinary rows, this catches branches the scan could not
    /// reach at all.
    pub fn purge_unvisited_nodes(&mut self) -> Vec<(LnId, crate::tree::LocalNode)> {
        let stale: Vec<LnId> = self
            .tree
            .ids_depth_first()
            .into_iter()
            .filter(|id| {
                if *id == self.tree.root() {
                    return false;
                }
                let node = self.tree.node(*id);
                if node.scan_seqno != 0 {
                    return false;
                }
                // Only trust the verdict if the parent's rows were joined;
                // an unvisited parent says nothing about its children.
                node.parent
                    .map(|p| self.tree.node(p).rows_generation > 0)
                    .unwrap_or(false)
            })
            .collect();
        let mut removed = Vec::new();
        // remove_subtree may have already taken descendants of an earlier id
        for id in stale {
            if self.tree.get(id).is_some() {
                for (node_id, node) in self.tree.remove_subtree(id) {
                    if let Some(row) = node.row_id {
                        self.deleteq.push(row);
                    }
                    removed.push((node_id, node));
                }
            }
        }
        if !removed.is_empty() {
            debug!(
                "[{}] purged {} nodes unseen since resume",
                self.config.name,
                removed.len()
            );
        }
        removed
    }
}
