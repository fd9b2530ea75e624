//! Stall and name-conflict reporting
//!
//! A stall is a row the engine cannot advance without external change; a
//! name conflict is a set of sibling names that collide under the sync's
//! normalization rules. Both are outputs of a reconciliation pass, not
//! errors: the rest of the sync keeps running around them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::BackupId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StallReason {
    /// Both sides changed the same file since the last synced state; the
    /// user must choose.
    LocalAndRemoteChangedSinceLastSynced,
    /// Both sides created the same name with different content.
    LocalAndRemotePreviouslyUnsyncedDiffer,
    /// The same node was moved independently on both sides.
    MovedOnBothSides,
    NamesWouldClashWhenSynced,
    IgnoreFileUnreadable,
    ItemPermanentlyBlocked,
    UndecryptableShareEntry,
    BackupDestinationModified,
    CannotPerformDeletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathProblem {
    None,
    CannotCreateDebris,
    DetectedSymlink,
    FilesystemErrorDuringOperation,
    WaitingForAnotherMoveToComplete,
    DestinationInUnresolvedArea,
    SourceWasMovedElsewhere,
    CloudNodeGone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudStallPath {
    pub path: String,
    pub problem: PathProblem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalStallPath {
    pub path: PathBuf,
    pub problem: PathProblem,
}

/// Structured description of one unresolvable situation: up to two involved
/// paths on each side, each annotated with its specific problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStallEntry {
    pub reason: StallReason,
    pub cloud_paths: Vec<CloudStallPath>,
    pub local_paths: Vec<LocalStallPath>,
    /// The UI should alert the user without waiting out the retry backoff.
    pub immediate: bool,
}

impl SyncStallEntry {
    pub fn local(reason: StallReason, path: PathBuf, problem: PathProblem, immediate: bool) -> Self {
        Self {
            reason,
            cloud_paths: Vec::new(),
            local_paths: vec![LocalStallPath { path, problem }],
            immediate,
        }
    }

    pub fn cloud(reason: StallReason, path: String, problem: PathProblem, immediate: bool) -> Self {
        Self {
            reason,
            cloud_paths: vec![CloudStallPath { path, problem }],
            local_paths: Vec::new(),
            immediate,
        }
    }
}

/// Sibling names that normalize to the same key on one or both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameConflict {
    pub cloud_parent_path: String,
    pub local_parent_path: PathBuf,
    pub cloud_names: Vec<String>,
    pub local_names: Vec<String>,
}

/// Snapshot published atomically after each pass.
#[derive(Debug, Clone, Default)]
pub struct StallReport {
    pub by_cloud_path: BTreeMap<String, SyncStallEntry>,
    pub by_local_path: BTreeMap<PathBuf, SyncStallEntry>,
    pub stalled_syncs: BTreeSet<BackupId>,
    pub name_conflicts: Vec<NameConflict>,
}

impl StallReport {
    pub fn waiting_cloud(&mut self, sync: BackupId, path: String, entry: SyncStallEntry) {
        self.stalled_syncs.insert(sync);
        self.by_cloud_path.insert(path, entry);
    }

    pub fn waiting_local(&mut self, sync: BackupId, path: PathBuf, entry: SyncStallEntry) {
        self.stalled_syncs.insert(sync);
        self.by_local_path.insert(path, entry);
    }

    pub fn add_name_conflict(&mut self, sync: BackupId, conflict: NameConflict) {
        self.stalled_syncs.insert(sync);
        self.name_conflicts.push(conflict);
    }

    pub fn is_empty(&self) -> bool {
        self.by_cloud_path.is_empty()
            && self.by_local_path.is_empty()
            && self.name_conflicts.is_empty()
    }

    pub fn has_immediate(&self) -> bool {
        self.by_cloud_path
            .values()
            .chain(self.by_local_path.values())
            .any(|e| e.immediate)
    }

    pub fn merge(&mut self, other: StallReport) {
        self.by_cloud_path.extend(other.by_cloud_path);
        self.by_local_path.extend(other.by_local_path);
        self.stalled_syncs.extend(other.stalled_syncs);
        self.name_conflicts.extend(other.name_conflicts);
    }
}

const NO_PROGRESS_THRESHOLD: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Retry gate: consecutive no-progress passes with a non-empty stall set
/// stop full-rate retries and back off exponentially. Any actual mutation
/// resets the gate.
#[derive(Debug, Clone)]
pub struct ProgressGate {
    no_progress_rounds: u32,
    backoff: Duration,
    next_allowed: Option<Instant>,
}

impl Default for ProgressGate {
    fn default() -> Self {
        Self {
            no_progress_rounds: 0,
            backoff: BACKOFF_BASE,
            next_allowed: None,
        }
    }
}

impl ProgressGate {
    pub fn note_progress(&mut self) {
        self.no_progress_rounds = 0;
        self.backoff = BACKOFF_BASE;
        self.next_allowed = None;
    }

    pub fn note_no_progress(&mut self, stalled: bool, now: Instant) {
        self.no_progress_rounds = self.no_progress_rounds.saturating_add(1);
        if stalled && self.no_progress_rounds >= NO_PROGRESS_THRESHOLD {
            self.next_allowed = Some(now + self.backoff);
            self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
        }
    }

    pub fn allows_pass(&self, now: Instant) -> bool {
        match self.next_allowed {
            None => true,
            Some(at) => now >= at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_flag_surfaces() {
        let mut report = StallReport::default();
        report.waiting_local(
            1,
            PathBuf::from("/r/a"),
            SyncStallEntry::local(
                StallReason::LocalAndRemoteChangedSinceLastSynced,
                PathBuf::from("/r/a"),
                PathProblem::None,
                true,
            ),
        );
        assert!(report.has_immediate());
        assert!(report.stalled_syncs.contains(&1));
    }

    #[test]
    fn gate_backs_off_after_repeated_no_progress() {
        let mut gate = ProgressGate::default();
        let t0 = Instant::now();
        assert!(gate.allows_pass(t0));

        for _ in 0..NO_PROGRESS_THRESHOLD {
            gate.note_no_progress(true, t0);
        }
        assert!(!gate.allows_pass(t0));
        // Backoff expires.
        assert!(gate.allows_pass(t0 + Duration::from_secs(2)));

        gate.note_progress();
        assert!(gate.allows_pass(t0));
    }

    #[test]
    fn no_backoff_without_stalls() {
        let mut gate = ProgressGate::default();
        let t0 = Instant::now();
        for _ in 0..10 {
            gate.note_no_progress(false, t0);
        }
        assert!(gate.allows_pass(t0));
    }
}
