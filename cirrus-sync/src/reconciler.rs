//! The reconciler
//!
//! Operates on one LocalNode folder at a time, recursively. Each folder's
//! three child views (cloud, last-synced, filesystem) are joined into rows;
//! every row is checked against the move detector first, then classified by
//! presence into the eight triplet cases. A row that cannot advance leaves
//! its flags set and is revisited on a later pass; the reconciler never
//! blocks and never awaits.
//!
//! Ordering gates: moves must be recognized before deletes, so the
//! disappearance cases (`Xsf`, `Csx`) only act once the previous pass
//! completed scanning and had no moves in flight.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, trace, warn};

use cirrus_cloud::{
    CancelToken, CloudNode, NewNode, NodeHandle, TransferFile, TransferOutcome, XferDirection,
};
use cirrus_fs::{DebrisOutcome, FileFingerprint, FsNode, KnownEntry, NodeKind, ScanSpec};

use crate::config::{BackupState, SyncProblem};
use crate::engine::EngineCore;
use crate::moves::same_volume_entity;
use crate::row::{compute_triplets, RowType, SyncRow};
use crate::runtime::{CompletedUpload, STATE_CACHE_BATCH};
use crate::stall::{
    CloudStallPath, LocalStallPath, NameConflict, PathProblem, StallReason, SyncStallEntry,
};
use crate::tree::{LnId, LocalNode, TreeAction};

/// Scans of a single folder are rate-limited to one per this interval.
pub(crate) const FOLDER_SCAN_INTERVAL: Duration = Duration::from_secs(2);
/// Backoff for scan-blocked entries, doubling up to the cap.
const BLOCKED_BACKOFF_BASE_SECS: u64 = 2;
const BLOCKED_BACKOFF_CAP_SECS: u64 = 300;
/// Depth guard; mirrors the supported cloud depth.
const MAX_TREE_DEPTH: u32 = 64;

fn wall_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

enum MoveCheck {
    /// Not a move; continue with the presence cases.
    NotMove,
    /// A move is recognized or in flight; the row stays unresolved.
    Deferred,
    /// The move fully resolved this row.
    Resolved,
}

impl EngineCore {
    /// One reconciliation pass over one sync. Returns whether the tree
    /// fully resolved.
    pub(crate) fn reconcile_pass(&mut self, slot: usize) -> bool {
        let now = Instant::now();
        {
            let rt = self.rt(slot);
            rt.begin_pass();
            // A scan issued for a folder that has since been torn down
            // would wait forever; drop it.
            if let Some((id, _)) = rt.active_scan.as_ref() {
                if rt.tree.get(*id).is_none() {
                    rt.active_scan = None;
                }
            }
        }

        let (root, local_root, cloud_root_path, root_handle) = {
            let rt = self.rt(slot);
            (
                rt.tree.root(),
                rt.config.local_root.clone(),
                rt.config.remote_root.path.clone(),
                rt.config.remote_root.handle,
            )
        };

        // The cloud root must still exist.
        if self.cloud.node_by_handle(root_handle).is_none() {
            self.rt(slot).fail_with = Some(SyncProblem::RemoteRootMissing);
            return false;
        }
        // Make sure the root node carries the synced handle.
        {
            let rt = self.rt(slot);
            let root_id = rt.tree.root();
            rt.tree.node_mut(root_id).synced_cloud_handle = root_handle;
        }

        let resolved = self.recursive_sync(slot, root, local_root, cloud_root_path, 0);
        let all_synced = self.rt(slot).end_pass(resolved, now);
        if let Err(e) = self.rt(slot).flush_state_cache() {
            warn!("state cache flush failed: {}", e);
            self.note_cache_failure();
        }
        all_synced
    }

    /// Recursively reconcile one folder. Returns true when the folder's
    /// rows and its whole subtree resolved.
    pub(crate) fn recursive_sync(
        &mut self,
        slot: usize,
        folder: LnId,
        folder_path: PathBuf,
        folder_cloud_path: String,
        depth: u32,
    ) -> bool {
        if depth > MAX_TREE_DEPTH {
            warn!("tree deeper than {}; deferring", MAX_TREE_DEPTH);
            return false;
        }
        if self.shutting_down || self.rt(slot).fail_with.is_some() {
            return false;
        }

        let sync_name = self.rt(slot).config.name.clone();
        {
            let node = self.rt(slot).tree.node(folder);
            if !node.is_folder() {
                return true;
            }
            if !node.scan_again.needs_visit() && !node.sync_again.needs_visit() {
                return true;
            }
        }

        // HERE_AND_BELOW propagates to children; the parent keeps HERE.
        {
            let rt = self.rt(slot);
            let scan_below = rt.tree.node(folder).scan_again == TreeAction::Below;
            let sync_below = rt.tree.node(folder).sync_again == TreeAction::Below;
            if sync_below {
                rt.tree.node_mut(folder).sync_again = TreeAction::Here;
            }
            let children: Vec<LnId> = rt.tree.node(folder).children.values().copied().collect();
            for child in children {
                if sync_below {
                    rt.tree.node_mut(child).sync_again.raise(TreeAction::Below);
                }
                if scan_below {
                    rt.tree.node_mut(child).scan_again.raise(TreeAction::Below);
                }
            }
        }

        let Some(fs_children) = self.obtain_fs_children(slot, folder, &folder_path) else {
            return false;
        };

        let folder_handle = self.rt(slot).tree.node(folder).synced_cloud_handle;
        let cloud_children = if folder_handle.is_undef() {
            Vec::new()
        } else {
            self.cloud.children(folder_handle)
        };

        let mut rows = {
            let rt = self.rt(slot);
            let generation = rt.scan_generation;
            rt.tree.node_mut(folder).rows_generation = generation;
            compute_triplets(cloud_children, &rt.tree, folder, fs_children)
        };

        let mut folder_resolved = true;

        // Name clashes leave the normal row set and surface as conflicts.
        for row in rows.iter_mut().filter(|r| r.has_clashes()) {
            self.report_name_clash(slot, row, folder, &folder_path, &folder_cloud_path);
            row.item_processed = true;
            folder_resolved = false;
        }

        for row in rows.iter_mut() {
            if row.item_processed {
                continue;
            }
            // mark visited nodes for the post-resume purge
            if let Some(id) = row.node {
                let generation = self.rt(slot).scan_generation;
                self.rt(slot).tree.node_mut(id).scan_seqno = generation;
            }
            let resolved = self.sync_item(slot, row, folder, &folder_path, &folder_cloud_path);
            row.item_processed = true;
            folder_resolved &= resolved;
        }

        // Recurse into folder rows whose both sides are attached. A row
        // missing one side is torn down by its own case handling; scanning
        // a vanished local folder would only block the pass.
        for row in rows.iter() {
            if row.suppress_recursion {
                folder_resolved = false;
                continue;
            }
            if row.fs.is_none() || row.cloud.is_none() {
                continue;
            }
            let Some(child) = row.node else { continue };
            let child_info = {
                let rt = self.rt(slot);
                rt.tree.get(child).and_then(|n| {
                    (n.is_folder()
                        && (n.scan_again.needs_visit() || n.sync_again.needs_visit()))
                    .then(|| (n.synced_cloud_handle, n.name.clone()))
                })
            };
            let Some((child_handle, child_name)) = child_info else {
                continue;
            };
            // Never act below a node with commands still in flight.
            if !child_handle.is_undef() && self.cloud.pending_commands(child_handle) {
                trace!("[{}] {:?} has pending cloud commands; deferring", sync_name, child_name);
                folder_resolved = false;
                continue;
            }
            let child_path = folder_path.join(&child_name);
            let child_cloud_path = format!("{}/{}", folder_cloud_path, child_name);
            let child_resolved =
                self.recursive_sync(slot, child, child_path, child_cloud_path, depth + 1);
            folder_resolved &= child_resolved;
        }

        if folder_resolved {
            let rt = self.rt(slot);
            let node = rt.tree.node_mut(folder);
            node.scan_again = TreeAction::None;
            node.sync_again = TreeAction::None;
            node.cached_scan = None;
            node.conflict_below = false;
        } else {
            let rt = self.rt(slot);
            rt.tree.node_mut(folder).sync_again.raise(TreeAction::Here);
        }

        folder_resolved
    }

    /// Produce the folder's FsNode list: a fresh scan when required, the
    /// cached list from an earlier scan this round, or a list synthesized
    /// from fully synced children. `None` means "pending, come back".
    fn obtain_fs_children(
        &mut self,
        slot: usize,
        folder: LnId,
        folder_path: &Path,
    ) -> Option<Vec<FsNode>> {
        let now = Instant::now();
        let is_root = folder == self.rt(slot).tree.root();

        let needs_scan = {
            let node = self.rt(slot).tree.node(folder);
            node.scan_again.needs_here() || (node.cached_scan.is_none() && node.children.is_empty())
        };

        if !needs_scan {
            let rt = self.rt(slot);
            if let Some(cached) = rt.tree.node(folder).cached_scan.clone() {
                return Some(cached);
            }
            if let Some(synth) = rt.tree.synthesize_fs_children(folder) {
                return Some(synth);
            }
        }

        // A scan is needed. Is one already in flight?
        match self.rt(slot).active_scan.take() {
            Some((id, request)) if id == folder => {
                if !request.completed() {
                    self.rt(slot).active_scan = Some((id, request));
                    self.rt(slot).pass_scan_pending = true;
                    return None;
                }
                let outcome = request.take_outcome().unwrap_or_default();
                if outcome.root_unreadable {
                    if is_root {
                        self.rt(slot).fail_with = Some(SyncProblem::LocalRootUnavailable);
                        return None;
                    }
                    // Transiently unreadable subfolder: back off.
                    let rt = self.rt(slot);
                    let node = rt.tree.node_mut(folder);
                    node.scan_blocked = true;
                    let backoff = (node.blocked_backoff_secs.max(1) * 2)
                        .min(BLOCKED_BACKOFF_CAP_SECS)
                        .max(BLOCKED_BACKOFF_BASE_SECS);
                    node.blocked_backoff_secs = backoff;
                    node.blocked_until = Some(now + Duration::from_secs(backoff));
                    rt.pass_scan_pending = true;
                    return None;
                }
                let rt = self.rt(slot);
                let node = rt.tree.node_mut(folder);
                node.scan_blocked = false;
                node.blocked_backoff_secs = 0;
                node.blocked_until = None;
                node.cached_scan = Some(outcome.nodes.clone());
                node.last_scan_at = Some(now);
                node.scan_again = TreeAction::None;
                return Some(outcome.nodes);
            }
            Some(other) => {
                // Busy scanning another folder; keep waiting.
                self.rt(slot).active_scan = Some(other);
                self.rt(slot).pass_scan_pending = true;
                return None;
            }
            None => {}
        }

        {
            let node = self.rt(slot).tree.node(folder);
            if let Some(until) = node.blocked_until {
                if now < until {
                    self.rt(slot).pass_scan_pending = true;
                    return None;
                }
            }
            if let Some(last) = node.last_scan_at {
                if now.duration_since(last) < FOLDER_SCAN_INTERVAL {
                    self.rt(slot).pass_scan_pending = true;
                    return None;
                }
            }
        }

        // Issue the scan.
        let spec = {
            let rt = self.rt(slot);
            let mut known = std::collections::HashMap::new();
            let child_ids: Vec<LnId> = rt.tree.node(folder).children.values().copied().collect();
            for id in child_ids {
                let child = rt.tree.node(id);
                if let Some(fp) = child.fingerprint {
                    let fsid = if child.scanned_fsid != 0 {
                        child.scanned_fsid
                    } else {
                        child.synced_fsid
                    };
                    known.insert(
                        child.name.clone(),
                        KnownEntry {
                            size: fp.size,
                            mtime: fp.mtime,
                            fsid,
                            fingerprint: fp,
                        },
                    );
                }
            }
            ScanSpec {
                target: folder_path.to_path_buf(),
                exclude: is_root.then(|| rt.debris.path().to_path_buf()),
                known,
            }
        };
        trace!("scan queued for {:?}", folder_path);
        let request = self.scans.scan(spec);
        let rt = self.rt(slot);
        rt.active_scan = Some((folder, request));
        rt.pass_scan_pending = true;
        None
    }

    fn report_name_clash(
        &mut self,
        slot: usize,
        row: &SyncRow,
        folder: LnId,
        folder_path: &Path,
        folder_cloud_path: &str,
    ) {
        let backup_id = self.rt(slot).backup_id();
        let conflict = NameConflict {
            cloud_parent_path: folder_cloud_path.to_string(),
            local_parent_path: folder_path.to_path_buf(),
            cloud_names: row.cloud_clashes.iter().map(|c| c.name.clone()).collect(),
            local_names: row.fs_clashes.iter().map(|f| f.name.clone()).collect(),
        };
        info!(
            "name clash under {:?}: {:?} / {:?}",
            folder_path, conflict.cloud_names, conflict.local_names
        );
        let rt = self.rt(slot);
        rt.stalls.add_name_conflict(backup_id, conflict);
        // propagate the conflict bit up to the sync root
        let mut walk = Some(folder);
        while let Some(id) = walk {
            rt.tree.node_mut(id).conflict_below = true;
            walk = rt.tree.node(id).parent;
        }
    }

    /// Decide one row. Returns true when the row is in sync and needs no
    /// further visits until something changes.
    fn sync_item(
        &mut self,
        slot: usize,
        row: &mut SyncRow,
        folder: LnId,
        folder_path: &Path,
        folder_cloud_path: &str,
    ) -> bool {
        let name = {
            let rt = self.rt(slot);
            row.name(&rt.tree).to_string()
        };
        let local_path = folder_path.join(&name);
        let cloud_path = format!("{}/{}", folder_cloud_path, name);

        // Symlinks are logged, not traversed, never stored.
        if row.fs.as_ref().is_some_and(|f| f.is_symlink) {
            debug!("ignoring symlink {:?}", local_path);
            return row.cloud.is_none() && row.node.is_none();
        }
        // Blocked entries defer with a stall entry once they persist.
        if row.fs.as_ref().is_some_and(|f| f.is_blocked) {
            let backup_id = self.rt(slot).backup_id();
            self.rt(slot).stalls.waiting_local(
                backup_id,
                local_path.clone(),
                SyncStallEntry::local(
                    StallReason::ItemPermanentlyBlocked,
                    local_path.clone(),
                    PathProblem::FilesystemErrorDuringOperation,
                    false,
                ),
            );
            return false;
        }

        // Type changes tear the old node down first; the next pass sees
        // the replacement as brand new.
        if let Some(id) = row.node {
            let node_kind = self.rt(slot).tree.node(id).kind;
            let fs_mismatch = row.fs.as_ref().is_some_and(|f| f.kind != node_kind);
            let cloud_mismatch = row.cloud.as_ref().is_some_and(|c| c.kind != node_kind);
            if fs_mismatch || cloud_mismatch {
                debug!("type changed under {:?}; resetting row", local_path);
                self.delete_local_node(slot, id);
                self.rt(slot).pass_progress = true;
                return false;
            }
        }

        // Side-channel move checks come before the presence cases.
        if row.fs.is_some() {
            match self.check_local_moves(slot, row, folder, &local_path, &cloud_path) {
                MoveCheck::Deferred => return false,
                MoveCheck::Resolved => return true,
                MoveCheck::NotMove => {}
            }
        }
        if row.cloud.is_some() {
            match self.check_cloud_moves(slot, row, folder, folder_path, &local_path) {
                MoveCheck::Deferred => return false,
                MoveCheck::Resolved => return true,
                MoveCheck::NotMove => {}
            }
        }

        match row.row_type() {
            RowType::Xxx => {
                debug_assert!(false, "row with no presence anywhere");
                true
            }
            RowType::Xxf => self.resolve_new_local(slot, row, folder, &local_path, &cloud_path),
            RowType::Xsx => {
                // Deleted on both sides.
                let id = row.node.expect("Xsx has a node");
                self.delete_local_node(slot, id);
                self.rt(slot).pass_progress = true;
                true
            }
            RowType::Xsf => self.resolve_cloud_node_gone(slot, row, folder, &local_path, &cloud_path),
            RowType::Cxx => self.resolve_new_remote(slot, row, folder, &local_path, &cloud_path),
            RowType::Cxf => self.resolve_both_new(slot, row, folder, &local_path, &cloud_path),
            RowType::Csx => self.resolve_fs_node_gone(slot, row, &local_path, &cloud_path),
            RowType::Csf => self.resolve_all_present(slot, row, folder, &local_path, &cloud_path),
        }
    }

    // --- move detection -------------------------------------------------

    fn check_local_moves(
        &mut self,
        slot: usize,
        row: &mut SyncRow,
        folder: LnId,
        local_path: &Path,
        cloud_path: &str,
    ) -> MoveCheck {
        let fs = row.fs.as_ref().expect("caller checked fs presence");
        let fsid = fs.fsid;
        if fsid == 0 || !self.rt(slot).fs_stable_ids {
            return MoveCheck::NotMove;
        }
        // Same fsid already attached to this row's own node: nothing moved.
        if let Some(id) = row.node {
            if self.rt(slot).tree.node(id).synced_fsid == fsid {
                return MoveCheck::NotMove;
            }
        }

        // A completed upload whose local file has since moved: chase it
        // with a single cloud move instead of re-uploading.
        if let Some(done) = self.rt(slot).completed_uploads.get(&fsid).cloned() {
            let parent_handle = self.rt(slot).tree.node(folder).synced_cloud_handle;
            if parent_handle.is_undef() {
                self.rt(slot).pass_moves_pending = true;
                return MoveCheck::Deferred;
            }
            let fs_name = fs.cloud_name.clone();
            if done.parent == parent_handle && done.name == fs_name {
                // Not moved after all; the ordinary join will pick it up.
                return MoveCheck::NotMove;
            }
            info!(
                "relocating completed upload {:?} to {:?}",
                done.name, local_path
            );
            self.rt(slot).completed_uploads.remove(&fsid);
            self.issue_cloud_move(slot, done.handle, parent_handle, &fs_name, folder);
            self.rt(slot).pass_moves_pending = true;
            return MoveCheck::Deferred;
        }

        let volume = self.rt(slot).config.filesystem_fingerprint;
        let Some(source) = self.indexes.synced_by_fsid(volume, fsid) else {
            return MoveCheck::NotMove;
        };
        if source.sync == slot && Some(source.node) == row.node {
            return MoveCheck::NotMove;
        }

        // Extract everything needed from the claiming node up front; it
        // may live in another sync's tree.
        struct MoveSource {
            kind: NodeKind,
            fingerprint: Option<cirrus_fs::FileFingerprint>,
            handle: NodeHandle,
            local_path: PathBuf,
            cloud_path: String,
            parent_handle: NodeHandle,
            volume: cirrus_fs::VolumeFingerprint,
            root: PathBuf,
        }
        let src = {
            let Some(src_rt) = self.syncs.get(source.sync).and_then(|s| s.as_ref()) else {
                return MoveCheck::NotMove;
            };
            let Some(src_node) = src_rt.tree.get(source.node) else {
                return MoveCheck::NotMove;
            };
            MoveSource {
                kind: src_node.kind,
                fingerprint: src_node.fingerprint,
                handle: src_node.synced_cloud_handle,
                local_path: src_rt.tree.path_of(&src_rt.config.local_root, source.node),
                cloud_path: src_rt
                    .tree
                    .cloud_path_of(&src_rt.config.remote_root.path, source.node),
                parent_handle: src_node
                    .parent
                    .map(|p| src_rt.tree.node(p).synced_cloud_handle)
                    .unwrap_or(NodeHandle::UNDEF),
                volume: src_rt.config.filesystem_fingerprint,
                root: src_rt.config.local_root.clone(),
            }
        };

        if source.sync != slot {
            let dst_root = self.rt(slot).config.local_root.clone();
            if !same_volume_entity(src.volume, &src.root, volume, &dst_root) {
                return MoveCheck::NotMove;
            }
        }

        // Type must match, and for files size+mtime must match; an OS
        // recycling an inode for a new file fails this and is a
        // delete+create, not a move.
        if src.kind != fs.kind {
            return MoveCheck::NotMove;
        }
        if fs.kind == NodeKind::File {
            let matches = src
                .fingerprint
                .map(|fp| fp.size == fs.size && fp.mtime == fs.mtime)
                .unwrap_or(false);
            if !matches {
                debug!("fsid {} reused by a different file; clearing stale claim", fsid);
                let src_slot = source.sync;
                let src_id = source.node;
                self.indexes.clear_synced_fsid(volume, fsid, source);
                if let Some(rt) = self.syncs[src_slot].as_mut() {
                    if let Some(node) = rt.tree.get_mut(src_id) {
                        node.synced_fsid = 0;
                    }
                }
                return MoveCheck::NotMove;
            }
        }

        let source_handle = src.handle;
        if source_handle.is_undef() {
            // Never made it to the cloud; nothing to move there.
            return MoveCheck::NotMove;
        }
        let src_local_path = src.local_path.clone();
        let src_cloud_path = src.cloud_path.clone();

        // If the old path still holds an entry with this fsid, this is a
        // copy or hard link, not a move.
        if let Ok(info) = self.fs.open(&src_local_path) {
            if info.fsid == fsid {
                return MoveCheck::NotMove;
            }
        }

        // Anti-flap: a source still being written is not decided yet.
        if fs.kind == NodeKind::File {
            let now = Instant::now();
            let wall = wall_now_secs();
            let fs_node = fs.clone();
            let changing = self
                .rt(slot)
                .change_watch
                .is_changing(local_path, &fs_node, now, wall);
            if changing {
                trace!("{:?} still changing; deferring move decision", local_path);
                self.rt(slot).pass_moves_pending = true;
                return MoveCheck::Deferred;
            }
        }

        // Did the cloud side move this node independently?
        if let Some(cloud_now) = self.cloud.node_by_handle(source_handle) {
            let src_parent_handle = src.parent_handle;
            let target_parent = self.rt(slot).tree.node(folder).synced_cloud_handle;
            if !src_parent_handle.is_undef()
                && cloud_now.parent != src_parent_handle
                && cloud_now.parent != target_parent
            {
                let backup_id = self.rt(slot).backup_id();
                let entry = SyncStallEntry {
                    reason: StallReason::MovedOnBothSides,
                    cloud_paths: vec![
                        CloudStallPath {
                            path: self
                                .cloud
                                .node_path(source_handle)
                                .unwrap_or_else(|| src_cloud_path.clone()),
                            problem: PathProblem::SourceWasMovedElsewhere,
                        },
                        CloudStallPath {
                            path: cloud_path.to_string(),
                            problem: PathProblem::None,
                        },
                    ],
                    local_paths: vec![
                        LocalStallPath {
                            path: src_local_path.clone(),
                            problem: PathProblem::SourceWasMovedElsewhere,
                        },
                        LocalStallPath {
                            path: local_path.to_path_buf(),
                            problem: PathProblem::None,
                        },
                    ],
                    immediate: true,
                };
                let rt = self.rt(slot);
                rt.stalls
                    .waiting_local(backup_id, local_path.to_path_buf(), entry);
                return MoveCheck::Deferred;
            }
        }

        let target_parent = self.rt(slot).tree.node(folder).synced_cloud_handle;
        if target_parent.is_undef() {
            // Target folder not yet created in the cloud.
            self.rt(slot).pass_moves_pending = true;
            return MoveCheck::Deferred;
        }

        // Overwrite-by-move: route the victim to sync debris first.
        if let Some(victim) = row.cloud.as_ref() {
            if victim.handle != source_handle {
                let victim_handle = victim.handle;
                if !self.cloud.pending_commands(victim_handle) {
                    info!("move overwrites {:?}; routing victim to sync debris", victim.name);
                    self.issue_cloud_debris(slot, victim_handle);
                }
                self.rt(slot).pass_moves_pending = true;
                return MoveCheck::Deferred;
            }
        }

        if self.cloud.pending_commands(source_handle) {
            self.rt(slot).pass_moves_pending = true;
            return MoveCheck::Deferred;
        }

        info!(
            "local move detected: {:?} -> {:?}; issuing cloud move",
            src_local_path, local_path
        );
        let fs_name = fs.cloud_name.clone();
        let fsid_claim = fsid;
        // Re-home the LocalNode now so a second pass doesn't re-detect the
        // same move; the cloud command completion only confirms it.
        self.transplant_node(slot, source, folder, &fs_name, fsid_claim);
        self.issue_cloud_move(slot, source_handle, target_parent, &fs_name, folder);
        self.rt(slot).pass_moves_pending = true;
        self.rt(slot).pass_progress = true;
        MoveCheck::Deferred
    }

    fn check_cloud_moves(
        &mut self,
        slot: usize,
        row: &mut SyncRow,
        folder: LnId,
        folder_path: &Path,
        local_path: &Path,
    ) -> MoveCheck {
        let cloud = row.cloud.as_ref().expect("caller checked cloud presence");
        let handle = cloud.handle;
        if let Some(id) = row.node {
            if self.rt(slot).tree.node(id).synced_cloud_handle == handle {
                return MoveCheck::NotMove;
            }
        }
        // A rename we issued ourselves is still in flight; its completion
        // settles this row.
        if self.cloud.pending_commands(handle) {
            self.rt(slot).pass_moves_pending = true;
            return MoveCheck::Deferred;
        }

        // A node we just uploaded: its row will join normally.
        if self
            .rt(slot)
            .completed_uploads
            .values()
            .any(|u| u.handle == handle)
        {
            self.rt(slot).pass_moves_pending = true;
            return MoveCheck::Deferred;
        }

        let Some(source) = self.indexes.by_cloud_handle(handle) else {
            return MoveCheck::NotMove;
        };
        if source.sync == slot && Some(source.node) == row.node {
            return MoveCheck::NotMove;
        }
        let Some(src_rt) = self.syncs.get(source.sync).and_then(|s| s.as_ref()) else {
            return MoveCheck::NotMove;
        };
        let Some(src_node) = src_rt.tree.get(source.node) else {
            return MoveCheck::NotMove;
        };
        if src_node.kind != cloud.kind {
            return MoveCheck::NotMove;
        }

        let src_local_path = src_rt.tree.path_of(&src_rt.config.local_root, source.node);
        let src_fsid = if src_node.scanned_fsid != 0 {
            src_node.scanned_fsid
        } else {
            src_node.synced_fsid
        };

        // Both sides moved independently?
        if let Ok(info) = self.fs.open(&src_local_path) {
            if src_fsid != 0 && info.fsid != src_fsid {
                // Old position holds something else; the fs side of this
                // node went elsewhere while the cloud moved it here.
                let backup_id = self.rt(slot).backup_id();
                let entry = SyncStallEntry {
                    reason: StallReason::MovedOnBothSides,
                    cloud_paths: vec![CloudStallPath {
                        path: self.cloud.node_path(handle).unwrap_or_default(),
                        problem: PathProblem::None,
                    }],
                    local_paths: vec![
                        LocalStallPath {
                            path: src_local_path.clone(),
                            problem: PathProblem::SourceWasMovedElsewhere,
                        },
                        LocalStallPath {
                            path: local_path.to_path_buf(),
                            problem: PathProblem::None,
                        },
                    ],
                    immediate: true,
                };
                let rt = self.rt(slot);
                rt.stalls
                    .waiting_local(backup_id, local_path.to_path_buf(), entry);
                return MoveCheck::Deferred;
            }
        }

        // Overwrite-by-move locally: park the victim in local debris.
        if let Some(victim) = row.fs.as_ref() {
            if src_fsid == 0 || victim.fsid != src_fsid {
                info!("cloud move overwrites {:?}; moving victim to local debris", local_path);
                let fs = self.fs.clone();
                let outcome = self.rt(slot).debris.move_to_debris(fs.as_ref(), local_path);
                match outcome {
                    DebrisOutcome::Moved(_) => {
                        self.rt(slot).pass_progress = true;
                        self.mark_parent_rescan(slot, folder);
                    }
                    DebrisOutcome::Transient => {}
                    DebrisOutcome::Exhausted => {
                        self.report_debris_failure(slot, local_path);
                    }
                }
                self.rt(slot).pass_moves_pending = true;
                return MoveCheck::Deferred;
            }
        }

        let target_name = cloud.name.clone();
        let target_path = folder_path.join(&target_name);
        info!(
            "cloud move detected: {:?} -> {:?}; renaming locally",
            src_local_path, target_path
        );
        match self.fs.rename(&src_local_path, &target_path) {
            Ok(()) => {
                let fsid_claim = src_fsid;
                self.transplant_node(slot, source, folder, &target_name, fsid_claim);
                // The transplanted node keeps its synced handle; refresh
                // both parents so rows re-join.
                self.mark_parent_rescan(slot, folder);
                self.rt(slot).pass_progress = true;
                MoveCheck::Resolved
            }
            Err(e) if e.is_transient() => {
                self.rt(slot).pass_moves_pending = true;
                MoveCheck::Deferred
            }
            Err(e) => {
                warn!("local rename for cloud move failed: {}", e);
                let backup_id = self.rt(slot).backup_id();
                let entry = SyncStallEntry::local(
                    StallReason::ItemPermanentlyBlocked,
                    target_path.clone(),
                    PathProblem::FilesystemErrorDuringOperation,
                    false,
                );
                self.rt(slot)
                    .stalls
                    .waiting_local(backup_id, target_path, entry);
                MoveCheck::Deferred
            }
        }
    }

    /// Move a LocalNode (with subtree) under a new parent, possibly across
    /// syncs. Within one sync the node is reparented in place; across syncs
    /// the source subtree is dropped (its cache rows purged) and the target
    /// is rebuilt by scan-and-join, which transfers no content.
    fn transplant_node(
        &mut self,
        dst_slot: usize,
        source: crate::moves::NodeRef,
        new_parent: LnId,
        new_name: &str,
        fsid: u64,
    ) {
        if source.sync == dst_slot {
            // A stale node may already hold the target key.
            let existing = {
                let rt = self.rt(dst_slot);
                rt.tree.child_by_name(new_parent, new_name)
            };
            if let Some(existing) = existing {
                if existing != source.node {
                    self.delete_local_node(dst_slot, existing);
                }
            }
            let volume = {
                let rt = self.rt(dst_slot);
                rt.tree.reparent(source.node, new_parent, new_name);
                rt.tree.node_mut(source.node).scanned_fsid = fsid;
                rt.statecache_add(source.node);
                // Parent rows on both ends need a fresh look.
                rt.tree.mark_sync_again(new_parent, TreeAction::Here);
                rt.config.filesystem_fingerprint
            };
            self.indexes.set_scanned_fsid(volume, fsid, source);
        } else {
            // Cross-sync: drop the source subtree; the destination sync
            // discovers the moved entries by scanning.
            let src_slot = source.sync;
            let (volume, removed) = {
                let rt = self.rt(src_slot);
                let src_parent = rt.tree.node(source.node).parent;
                let removed = rt.tree.remove_subtree(source.node);
                for (_, node) in &removed {
                    if let Some(row) = node.row_id {
                        rt.deleteq.push(row);
                    }
                }
                if let Some(p) = src_parent {
                    rt.tree.mark_sync_again(p, TreeAction::Here);
                }
                (rt.config.filesystem_fingerprint, removed)
            };
            for (node_id, node) in &removed {
                let node_ref = crate::moves::NodeRef {
                    sync: src_slot,
                    node: *node_id,
                };
                self.indexes
                    .clear_synced_fsid(volume, node.synced_fsid, node_ref);
                self.indexes
                    .clear_scanned_fsid(volume, node.scanned_fsid, node_ref);
                self.indexes
                    .clear_cloud_handle(node.synced_cloud_handle, node_ref);
            }
            self.rt(dst_slot)
                .tree
                .mark_scan_again(new_parent, TreeAction::Here);
        }
    }

    // --- resolve_* ------------------------------------------------------

    /// XXF: brand new local entry.
    fn resolve_new_local(
        &mut self,
        slot: usize,
        row: &mut SyncRow,
        folder: LnId,
        local_path: &Path,
        cloud_path: &str,
    ) -> bool {
        let sync_type = self.rt(slot).config.sync_type;
        if !sync_type.syncs_up() {
            // Download-only: a local addition is left for the user.
            trace!("download-only sync ignores new local {:?}", local_path);
            return true;
        }
        let fs = row.fs.clone().expect("Xxf has fs");
        let parent_handle = self.rt(slot).tree.node(folder).synced_cloud_handle;
        if parent_handle.is_undef() {
            // Parent's cloud folder is still being created.
            return false;
        }
        match fs.kind {
            NodeKind::Folder => self.issue_folder_create(slot, folder, &fs, cloud_path),
            NodeKind::File => self.issue_upload(slot, folder, &fs, local_path, None),
        }
    }

    /// CXX: brand new remote entry.
    fn resolve_new_remote(
        &mut self,
        slot: usize,
        row: &mut SyncRow,
        folder: LnId,
        local_path: &Path,
        cloud_path: &str,
    ) -> bool {
        let (sync_type, backup_state) = {
            let rt = self.rt(slot);
            (rt.config.sync_type, rt.config.backup_state)
        };
        let cloud = row.cloud.clone().expect("Cxx has cloud");

        if sync_type.is_backup() {
            return match backup_state {
                Some(BackupState::Monitor) => {
                    warn!("foreign cloud node {:?} under backup; disabling", cloud.name);
                    self.rt(slot).fail_with = Some(SyncProblem::BackupModified);
                    false
                }
                _ => {
                    // Mirror removes anything the local side doesn't have.
                    if !self.cloud.pending_commands(cloud.handle) {
                        self.issue_cloud_debris(slot, cloud.handle);
                    }
                    false
                }
            };
        }
        if !sync_type.syncs_down() {
            trace!("upload-only sync ignores new remote {:?}", cloud_path);
            return true;
        }

        match cloud.kind {
            NodeKind::Folder => match self.fs.mkdir(local_path) {
                Ok(()) => {
                    // Attach a synced node right away so recursion can
                    // proceed into the new folder next pass.
                    let fsid = self.fs.open(local_path).map(|i| i.fsid).unwrap_or(0);
                    let new_id = self.attach_synced_node(slot, folder, &cloud, fsid, None);
                    {
                        let rt = self.rt(slot);
                        rt.tree.mark_scan_again(new_id, TreeAction::Here);
                        rt.tree.mark_sync_again(new_id, TreeAction::Here);
                    }
                    self.mark_parent_rescan(slot, folder);
                    self.rt(slot).pass_progress = true;
                    false
                }
                Err(e) if e.is_transient() => false,
                Err(e) => {
                    warn!("cannot create {:?}: {}", local_path, e);
                    let backup_id = self.rt(slot).backup_id();
                    let entry = SyncStallEntry::local(
                        StallReason::ItemPermanentlyBlocked,
                        local_path.to_path_buf(),
                        PathProblem::FilesystemErrorDuringOperation,
                        false,
                    );
                    self.rt(slot)
                        .stalls
                        .waiting_local(backup_id, local_path.to_path_buf(), entry);
                    false
                }
            },
            NodeKind::File => self.issue_download(slot, folder, &cloud, local_path),
        }
    }

    /// CXF: appeared on both sides with no synced history.
    fn resolve_both_new(
        &mut self,
        slot: usize,
        row: &mut SyncRow,
        folder: LnId,
        local_path: &Path,
        cloud_path: &str,
    ) -> bool {
        let cloud = row.cloud.clone().expect("Cxf has cloud");
        let fs = row.fs.clone().expect("Cxf has fs");

        if cloud.kind != fs.kind {
            let backup_id = self.rt(slot).backup_id();
            let mut entry = SyncStallEntry::local(
                StallReason::LocalAndRemotePreviouslyUnsyncedDiffer,
                local_path.to_path_buf(),
                PathProblem::None,
                true,
            );
            entry.cloud_paths.push(CloudStallPath {
                path: cloud_path.to_string(),
                problem: PathProblem::None,
            });
            self.rt(slot)
                .stalls
                .waiting_local(backup_id, local_path.to_path_buf(), entry);
            return false;
        }

        let equal = match fs.kind {
            NodeKind::Folder => true,
            NodeKind::File => cloud.fingerprint.is_some() && cloud.fingerprint == fs.fingerprint,
        };
        if equal {
            // Join as synced.
            let node_id = self.attach_synced_node(slot, folder, &cloud, fs.fsid, fs.fingerprint);
            {
                let rt = self.rt(slot);
                if let Some(short) = fs.shortname.clone() {
                    rt.tree.node_mut(node_id).slocalname = Some(short);
                }
                rt.completed_uploads.remove(&fs.fsid);
                rt.pass_progress = true;
            }
            if fs.kind == NodeKind::Folder {
                let rt = self.rt(slot);
                rt.tree.mark_scan_again(node_id, TreeAction::Here);
                rt.tree.mark_sync_again(node_id, TreeAction::Here);
            }
            true
        } else {
            let backup_id = self.rt(slot).backup_id();
            let mut entry = SyncStallEntry::local(
                StallReason::LocalAndRemotePreviouslyUnsyncedDiffer,
                local_path.to_path_buf(),
                PathProblem::None,
                true,
            );
            entry.cloud_paths.push(CloudStallPath {
                path: cloud_path.to_string(),
                problem: PathProblem::None,
            });
            self.rt(slot)
                .stalls
                .waiting_local(backup_id, local_path.to_path_buf(), entry);
            false
        }
    }

    /// XSF: the cloud side disappeared.
    fn resolve_cloud_node_gone(
        &mut self,
        slot: usize,
        row: &mut SyncRow,
        folder: LnId,
        local_path: &Path,
        _cloud_path: &str,
    ) -> bool {
        let node_id = row.node.expect("Xsf has a node");
        let (sync_type, backup_state, gates_open) = {
            let rt = self.rt(slot);
            (
                rt.config.sync_type,
                rt.config.backup_state,
                rt.scanning_was_complete && rt.moves_were_complete,
            )
        };
        if !gates_open {
            // A "delete here" may still turn out to be a "move there".
            return false;
        }

        let handle = self.rt(slot).tree.node(node_id).synced_cloud_handle;
        if !handle.is_undef() && self.cloud.node_by_handle(handle).is_some() {
            // The node still exists elsewhere: it moved, and the move-in
            // row owns the transition.
            self.rt(slot).pass_moves_pending = true;
            return false;
        }

        if sync_type.is_backup() && backup_state == Some(BackupState::Monitor) {
            warn!("backup target lost {:?} remotely; disabling", local_path);
            self.rt(slot).fail_with = Some(SyncProblem::BackupModified);
            return false;
        }
        if sync_type.syncs_up() && !sync_type.syncs_down() {
            // Upload-only and mirror re-push the local copy: forget the
            // synced identity and let the next pass upload it as new.
            self.delete_local_node(slot, node_id);
            self.rt(slot).pass_progress = true;
            return false;
        }

        info!("cloud deleted {:?}; moving local copy to debris", local_path);
        let fs = self.fs.clone();
        let outcome = self.rt(slot).debris.move_to_debris(fs.as_ref(), local_path);
        match outcome {
            DebrisOutcome::Moved(resting) => {
                debug!("debris: {:?} -> {:?}", local_path, resting);
                self.delete_local_node(slot, node_id);
                self.mark_parent_rescan(slot, folder);
                self.rt(slot).pass_progress = true;
                true
            }
            DebrisOutcome::Transient => false,
            DebrisOutcome::Exhausted => {
                self.report_debris_failure(slot, local_path);
                false
            }
        }
    }

    /// CSX: the local side disappeared.
    fn resolve_fs_node_gone(
        &mut self,
        slot: usize,
        row: &mut SyncRow,
        local_path: &Path,
        _cloud_path: &str,
    ) -> bool {
        let node_id = row.node.expect("Csx has a node");
        let cloud = row.cloud.clone().expect("Csx has cloud");
        let (sync_type, gates_open) = {
            let rt = self.rt(slot);
            (
                rt.config.sync_type,
                rt.scanning_was_complete && rt.moves_were_complete,
            )
        };
        if !gates_open {
            return false;
        }

        // If the fsid resurfaced elsewhere this is a move-out; the move-in
        // row re-homes the node.
        let (volume, synced_fsid) = {
            let rt = self.rt(slot);
            (
                rt.config.filesystem_fingerprint,
                rt.tree.node(node_id).synced_fsid,
            )
        };
        if let Some(claim) = self.indexes.scanned_by_fsid(volume, synced_fsid) {
            if claim.node != node_id || claim.sync != slot {
                self.rt(slot).pass_moves_pending = true;
                return false;
            }
        }

        if !sync_type.syncs_up() {
            // Download-only restores the local copy instead.
            self.delete_local_node(slot, node_id);
            self.rt(slot).pass_progress = true;
            return false;
        }

        if self.cloud.pending_commands(cloud.handle) {
            return false;
        }
        info!(
            "local deleted {:?}; moving cloud node to sync debris",
            local_path
        );
        self.issue_cloud_debris(slot, cloud.handle);
        // Row resolves once the completion lands and the node disappears
        // from the cloud listing.
        false
    }

    /// CSF: present everywhere; compare cloud vs synced and fs vs synced.
    fn resolve_all_present(
        &mut self,
        slot: usize,
        row: &mut SyncRow,
        folder: LnId,
        local_path: &Path,
        cloud_path: &str,
    ) -> bool {
        let node_id = row.node.expect("Csf has a node");
        let cloud = row.cloud.clone().expect("Csf has cloud");
        let fs = row.fs.clone().expect("Csf has fs");
        let (sync_type, backup_state) = {
            let rt = self.rt(slot);
            (rt.config.sync_type, rt.config.backup_state)
        };

        let (cloud_equal, fs_equal) = {
            let rt = self.rt(slot);
            let node = rt.tree.node(node_id);
            match node.kind {
                NodeKind::Folder => (true, true),
                NodeKind::File => (
                    cloud.fingerprint.is_some() && cloud.fingerprint == node.fingerprint,
                    fs.fingerprint.is_some() && fs.fingerprint == node.fingerprint,
                ),
            }
        };

        match (cloud_equal, fs_equal) {
            (true, true) => {
                self.resolve_row_matched(slot, row, node_id, &cloud, &fs);
                true
            }
            (true, false) => {
                // Local changed.
                if !sync_type.syncs_up() {
                    trace!("download-only leaves local edit of {:?} alone", local_path);
                    return true;
                }
                if fs.kind == NodeKind::File {
                    self.issue_upload(slot, folder, &fs, local_path, Some(node_id))
                } else {
                    true
                }
            }
            (false, true) => {
                // Remote changed.
                if sync_type.is_backup() {
                    return match backup_state {
                        Some(BackupState::Monitor) => {
                            warn!("foreign cloud change on {:?}; disabling backup", cloud_path);
                            self.rt(slot).fail_with = Some(SyncProblem::BackupModified);
                            false
                        }
                        _ => {
                            // Mirror pushes local back over the cloud.
                            self.issue_upload(slot, folder, &fs, local_path, Some(node_id))
                        }
                    };
                }
                if !sync_type.syncs_down() {
                    trace!("upload-only leaves remote edit of {:?} alone", cloud_path);
                    return true;
                }
                if cloud.kind == NodeKind::File {
                    self.issue_download(slot, folder, &cloud, local_path)
                } else {
                    true
                }
            }
            (false, false) => {
                let backup_id = self.rt(slot).backup_id();
                let mut entry = SyncStallEntry::local(
                    StallReason::LocalAndRemoteChangedSinceLastSynced,
                    local_path.to_path_buf(),
                    PathProblem::None,
                    true,
                );
                entry.cloud_paths.push(CloudStallPath {
                    path: cloud_path.to_string(),
                    problem: PathProblem::None,
                });
                self.rt(slot)
                    .stalls
                    .waiting_local(backup_id, local_path.to_path_buf(), entry);
                false
            }
        }
    }

    /// CSF with both sides matching: refresh identities and persist.
    fn resolve_row_matched(
        &mut self,
        slot: usize,
        _row: &mut SyncRow,
        node_id: LnId,
        cloud: &CloudNode,
        fs: &FsNode,
    ) {
        let volume = self.rt(slot).config.filesystem_fingerprint;
        let node_ref = crate::moves::NodeRef {
            sync: slot,
            node: node_id,
        };

        let mut dirty = false;
        {
            let rt = self.rt(slot);
            let node = rt.tree.node(node_id);
            if node.synced_cloud_handle != cloud.handle
                || node.synced_fsid != fs.fsid
                || node.scanned_fsid != fs.fsid
                || node.slocalname != fs.shortname
                || (fs.fingerprint.is_some() && node.fingerprint != fs.fingerprint)
            {
                dirty = true;
            }
        }
        if !dirty {
            self.rt(slot).counters.already_synced += 1;
            return;
        }

        let (old_handle, old_fsid) = {
            let rt = self.rt(slot);
            let node = rt.tree.node(node_id);
            (node.synced_cloud_handle, node.synced_fsid)
        };
        if old_handle != cloud.handle {
            self.indexes.clear_cloud_handle(old_handle, node_ref);
            self.indexes.set_cloud_handle(cloud.handle, node_ref);
        }
        if old_fsid != fs.fsid {
            self.indexes.clear_synced_fsid(volume, old_fsid, node_ref);
            self.indexes.set_synced_fsid(volume, fs.fsid, node_ref);
        }
        self.indexes.set_scanned_fsid(volume, fs.fsid, node_ref);

        let rt = self.rt(slot);
        let node = rt.tree.node_mut(node_id);
        node.synced_cloud_handle = cloud.handle;
        node.synced_fsid = fs.fsid;
        node.scanned_fsid = fs.fsid;
        node.slocalname = fs.shortname.clone();
        if fs.fingerprint.is_some() {
            node.fingerprint = fs.fingerprint;
        }
        rt.completed_uploads.remove(&fs.fsid);
        rt.statecache_add(node_id);
        rt.pass_progress = true;
        if rt.insertq.len() >= STATE_CACHE_BATCH {
            if let Err(e) = rt.flush_state_cache() {
                warn!("mid-pass cache flush failed: {}", e);
            }
        }
    }

    // --- command issuance ------------------------------------------------

    fn issue_folder_create(
        &mut self,
        slot: usize,
        folder: LnId,
        fs: &FsNode,
        _cloud_path: &str,
    ) -> bool {
        let parent_handle = self.rt(slot).tree.node(folder).synced_cloud_handle;
        let name = fs.cloud_name.clone();
        let backup_id = self.rt(slot).backup_id();

        if let Some(controller) = self.controller.as_ref() {
            if controller.veto_put_nodes(backup_id, parent_handle, &name) {
                debug!("controller vetoed folder create {:?}", name);
                return false;
            }
        }
        if self.cloud.pending_commands(parent_handle) {
            return false;
        }

        self.rt(slot)
            .expected
            .expect_add(parent_handle, &name, Instant::now());
        let actions = self.actions_tx.clone();
        let name_for_log = name.clone();
        self.cloud.put_nodes(
            parent_handle,
            vec![NewNode {
                name,
                kind: NodeKind::Folder,
                fingerprint: None,
                upload: None,
            }],
            false,
            Box::new(move |result| {
                let _ = actions.send(Box::new(move |core: &mut EngineCore| {
                    match result {
                        Ok(_handles) => {
                            core.poke_sync(backup_id);
                        }
                        Err(e) => {
                            warn!("folder create {:?} failed: {}", name_for_log, e);
                            core.poke_sync(backup_id);
                        }
                    }
                }));
            }),
        );
        self.rt(slot).pass_progress = true;
        false
    }

    /// Start an upload. `node` is the row's LocalNode when an existing
    /// synced file is being updated; its synced state is adopted when the
    /// follow-up putnodes completes.
    fn issue_upload(
        &mut self,
        slot: usize,
        folder: LnId,
        fs: &FsNode,
        local_path: &Path,
        node: Option<LnId>,
    ) -> bool {
        let backup_id = self.rt(slot).backup_id();
        {
            let rt = self.rt(slot);
            if rt.in_flight.contains_key(local_path)
                || (fs.fsid != 0 && rt.in_flight_fsids.contains(&fs.fsid))
            {
                rt.counters.already_uploading += 1;
                return false;
            }
        }
        let Some(fingerprint) = fs.fingerprint else {
            return false;
        };
        if let Some(controller) = self.controller.as_ref() {
            if controller.veto_upload(backup_id, local_path) {
                debug!("controller vetoed upload of {:?}", local_path);
                return false;
            }
        }
        let parent_handle = self.rt(slot).tree.node(folder).synced_cloud_handle;
        let name = fs.cloud_name.clone();
        let fsid = fs.fsid;

        info!(
            "upload {:?} ({} bytes){}",
            local_path,
            fingerprint.size,
            if node.is_some() { " [update]" } else { "" }
        );
        let cancel = CancelToken::new();
        {
            let rt = self.rt(slot);
            rt.in_flight
                .insert(local_path.to_path_buf(), cancel.clone());
            if fsid != 0 {
                rt.in_flight_fsids.insert(fsid);
            }
            rt.expected.expect_add(parent_handle, &name, Instant::now());
        }

        let actions = self.actions_tx.clone();
        let path_key = local_path.to_path_buf();
        let file = TransferFile {
            local_path: local_path.to_path_buf(),
            name: name.clone(),
            parent: parent_handle,
            source: None,
            fingerprint,
            cipher_key: [0u8; 16],
            cancel,
            sync_initiated: true,
        };
        self.transfers.start_xfer(
            XferDirection::Put,
            file,
            Box::new(move |outcome| {
                let _ = actions.send(Box::new(move |core: &mut EngineCore| {
                    core.finish_upload(
                        backup_id,
                        path_key,
                        parent_handle,
                        name,
                        fsid,
                        node,
                        fingerprint,
                        outcome,
                    );
                }));
            }),
        );
        self.rt(slot).pass_progress = true;
        false
    }

    fn issue_download(
        &mut self,
        slot: usize,
        folder: LnId,
        cloud: &CloudNode,
        local_path: &Path,
    ) -> bool {
        let backup_id = self.rt(slot).backup_id();
        if self.rt(slot).in_flight.contains_key(local_path) {
            self.rt(slot).counters.already_downloading += 1;
            return false;
        }
        let Some(fingerprint) = cloud.fingerprint else {
            return false;
        };

        info!("download {:?} ({} bytes)", local_path, fingerprint.size);
        let cancel = CancelToken::new();
        self.rt(slot)
            .in_flight
            .insert(local_path.to_path_buf(), cancel.clone());

        let actions = self.actions_tx.clone();
        let path_key = local_path.to_path_buf();
        let parent = folder;
        let file = TransferFile {
            local_path: local_path.to_path_buf(),
            name: cloud.name.clone(),
            parent: cloud.parent,
            source: Some(cloud.handle),
            fingerprint,
            cipher_key: [0u8; 16],
            cancel,
            sync_initiated: true,
        };
        self.transfers.start_xfer(
            XferDirection::Get,
            file,
            Box::new(move |outcome| {
                let _ = actions.send(Box::new(move |core: &mut EngineCore| {
                    core.finish_download(backup_id, path_key, parent, outcome);
                }));
            }),
        );
        self.rt(slot).pass_progress = true;
        false
    }

    fn issue_cloud_move(
        &mut self,
        slot: usize,
        handle: NodeHandle,
        new_parent: NodeHandle,
        new_name: &str,
        _target_folder: LnId,
    ) {
        let backup_id = self.rt(slot).backup_id();
        {
            let rt = self.rt(slot);
            let now = Instant::now();
            rt.expected.expect_touch(handle, now);
            rt.expected.expect_add(new_parent, new_name, now);
        }
        let actions = self.actions_tx.clone();
        self.cloud.rename(
            handle,
            new_parent,
            new_name,
            Box::new(move |result| {
                let _ = actions.send(Box::new(move |core: &mut EngineCore| {
                    if let Err(e) = result {
                        warn!("cloud move failed: {}", e);
                    }
                    core.poke_sync(backup_id);
                }));
            }),
        );
        self.rt(slot).pass_progress = true;
    }

    fn issue_cloud_debris(&mut self, slot: usize, handle: NodeHandle) {
        let backup_id = self.rt(slot).backup_id();
        self.rt(slot).expected.expect_touch(handle, Instant::now());
        let actions = self.actions_tx.clone();
        self.cloud.move_to_sync_debris(
            handle,
            Box::new(move |result| {
                let _ = actions.send(Box::new(move |core: &mut EngineCore| {
                    if let Err(e) = result {
                        warn!("cloud debris move failed: {}", e);
                    }
                    core.poke_sync(backup_id);
                }));
            }),
        );
        self.rt(slot).pass_progress = true;
    }

    // --- shared helpers --------------------------------------------------

    /// Create a LocalNode already considered synced (both sides agree).
    fn attach_synced_node(
        &mut self,
        slot: usize,
        folder: LnId,
        cloud: &CloudNode,
        fsid: u64,
        fingerprint: Option<cirrus_fs::FileFingerprint>,
    ) -> LnId {
        let volume = self.rt(slot).config.filesystem_fingerprint;
        let node_id = {
            let rt = self.rt(slot);
            let mut node = LocalNode::new(cloud.kind, cloud.name.clone());
            node.synced_cloud_handle = cloud.handle;
            node.synced_fsid = fsid;
            node.scanned_fsid = fsid;
            node.fingerprint = fingerprint.or(cloud.fingerprint);
            let id = rt.tree.add_child(folder, node);
            rt.statecache_add(id);
            id
        };
        let node_ref = crate::moves::NodeRef {
            sync: slot,
            node: node_id,
        };
        self.indexes.set_cloud_handle(cloud.handle, node_ref);
        self.indexes.set_synced_fsid(volume, fsid, node_ref);
        self.indexes.set_scanned_fsid(volume, fsid, node_ref);
        node_id
    }

    /// Remove a LocalNode subtree, unregistering indexes and purging cache
    /// rows.
    pub(crate) fn delete_local_node(&mut self, slot: usize, id: LnId) {
        let (volume, removed) = {
            let rt = self.rt(slot);
            let removed = rt.tree.remove_subtree(id);
            for (node_id, node) in &removed {
                rt.insertq.remove(node_id);
                if let Some(row) = node.row_id {
                    rt.deleteq.push(row);
                }
            }
            (rt.config.filesystem_fingerprint, removed)
        };
        for (node_id, node) in &removed {
            let node_ref = crate::moves::NodeRef {
                sync: slot,
                node: *node_id,
            };
            self.indexes
                .clear_synced_fsid(volume, node.synced_fsid, node_ref);
            self.indexes
                .clear_scanned_fsid(volume, node.scanned_fsid, node_ref);
            self.indexes
                .clear_cloud_handle(node.synced_cloud_handle, node_ref);
        }
    }

    fn mark_parent_rescan(&mut self, slot: usize, folder: LnId) {
        let rt = self.rt(slot);
        rt.tree.mark_scan_again(folder, TreeAction::Here);
        rt.tree.mark_sync_again(folder, TreeAction::Here);
    }

    fn report_debris_failure(&mut self, slot: usize, local_path: &Path) {
        let backup_id = self.rt(slot).backup_id();
        let entry = SyncStallEntry::local(
            StallReason::CannotPerformDeletion,
            local_path.to_path_buf(),
            PathProblem::CannotCreateDebris,
            true,
        );
        self.rt(slot)
            .stalls
            .waiting_local(backup_id, local_path.to_path_buf(), entry);
    }

    // --- completion handlers (run on the sync task via the action queue) -

    pub(crate) fn finish_upload(
        &mut self,
        backup_id: u64,
        path: PathBuf,
        parent: NodeHandle,
        name: String,
        fsid: u64,
        node: Option<LnId>,
        fingerprint: FileFingerprint,
        outcome: TransferOutcome,
    ) {
        let Some(slot) = self.slot_of(backup_id) else {
            return;
        };
        {
            let rt = self.rt(slot);
            rt.in_flight.remove(&path);
            rt.in_flight_fsids.remove(&fsid);
        }
        match outcome {
            TransferOutcome::Complete(Some(upload)) => {
                let controller_defers = self
                    .controller
                    .as_ref()
                    .map(|c| c.veto_put_nodes(backup_id, parent, &name))
                    .unwrap_or(false);
                if controller_defers {
                    // Try again from scratch next pass.
                    self.poke_sync(backup_id);
                    return;
                }
                let actions = self.actions_tx.clone();
                let name_clone = name.clone();
                self.cloud.put_nodes(
                    parent,
                    vec![NewNode {
                        name: name.clone(),
                        kind: NodeKind::File,
                        fingerprint: None,
                        upload: Some(upload),
                    }],
                    true,
                    Box::new(move |result| {
                        let _ = actions.send(Box::new(move |core: &mut EngineCore| {
                            core.finish_put_nodes(
                                backup_id, parent, name_clone, fsid, node, fingerprint, result,
                            );
                        }));
                    }),
                );
            }
            TransferOutcome::Complete(None) => {
                warn!("upload of {:?} completed without staged content", path);
                self.poke_sync(backup_id);
            }
            TransferOutcome::Failed { transient, reason } => {
                if transient {
                    debug!("upload of {:?} failed transiently: {}", path, reason);
                } else {
                    warn!("upload of {:?} failed: {}", path, reason);
                }
                self.poke_sync(backup_id);
            }
            TransferOutcome::Cancelled => {
                debug!("upload of {:?} cancelled", path);
            }
        }
    }

    pub(crate) fn finish_put_nodes(
        &mut self,
        backup_id: u64,
        parent: NodeHandle,
        name: String,
        fsid: u64,
        node: Option<LnId>,
        fingerprint: FileFingerprint,
        result: cirrus_cloud::Result<Vec<NodeHandle>>,
    ) {
        let Some(slot) = self.slot_of(backup_id) else {
            return;
        };
        let veto = self
            .controller
            .as_ref()
            .map(|c| c.veto_put_nodes_completion(backup_id))
            .unwrap_or(false);
        if veto {
            // Re-deliver on a later loop iteration; the veto is re-checked
            // there, so a test controller can hold the completion as long
            // as it needs.
            self.deferred.push(Box::new(move |core: &mut EngineCore| {
                core.finish_put_nodes(backup_id, parent, name, fsid, node, fingerprint, result);
            }));
            return;
        }
        match result {
            Ok(handles) => {
                if let Some(handle) = handles.first() {
                    debug!("putnodes created {:?} as {:?}", name, handle);
                    if fsid != 0 {
                        self.rt(slot).completed_uploads.insert(
                            fsid,
                            CompletedUpload {
                                handle: *handle,
                                parent,
                                name: name.clone(),
                            },
                        );
                    }
                    self.adopt_uploaded_state(slot, node, &name, *handle, fsid, fingerprint);
                }
                self.poke_sync(backup_id);
            }
            Err(e) => {
                warn!("putnodes for {:?} failed: {}", name, e);
                self.poke_sync(backup_id);
            }
        }
    }

    /// A completed upload updates its row's LocalNode in place: the new
    /// cloud handle, fsid, and fingerprint become the synced state, so the
    /// next pass sees the row matched instead of reading our own upload as
    /// a conflicting remote change.
    fn adopt_uploaded_state(
        &mut self,
        slot: usize,
        node: Option<LnId>,
        name: &str,
        handle: NodeHandle,
        fsid: u64,
        fingerprint: FileFingerprint,
    ) {
        let Some(node_id) = node else {
            return;
        };
        // The id may have been recycled while the transfer ran; only adopt
        // when it still names the same row.
        let current = {
            let rt = self.rt(slot);
            rt.tree
                .get(node_id)
                .filter(|n| n.kind == NodeKind::File && n.name == name)
                .map(|n| (n.synced_cloud_handle, n.synced_fsid))
        };
        let Some((old_handle, old_fsid)) = current else {
            return;
        };

        let volume = self.rt(slot).config.filesystem_fingerprint;
        let node_ref = crate::moves::NodeRef {
            sync: slot,
            node: node_id,
        };
        if old_handle != handle {
            self.indexes.clear_cloud_handle(old_handle, node_ref);
            self.indexes.set_cloud_handle(handle, node_ref);
        }
        if fsid != 0 && old_fsid != fsid {
            self.indexes.clear_synced_fsid(volume, old_fsid, node_ref);
            self.indexes.set_synced_fsid(volume, fsid, node_ref);
        }
        if fsid != 0 {
            self.indexes.set_scanned_fsid(volume, fsid, node_ref);
        }

        let rt = self.rt(slot);
        {
            let n = rt.tree.node_mut(node_id);
            n.synced_cloud_handle = handle;
            if fsid != 0 {
                n.synced_fsid = fsid;
                n.scanned_fsid = fsid;
            }
            n.fingerprint = Some(fingerprint);
        }
        rt.statecache_add(node_id);
    }

    pub(crate) fn finish_download(
        &mut self,
        backup_id: u64,
        path: PathBuf,
        parent_folder: LnId,
        outcome: TransferOutcome,
    ) {
        let Some(slot) = self.slot_of(backup_id) else {
            return;
        };
        self.rt(slot).in_flight.remove(&path);
        match outcome {
            TransferOutcome::Complete(_) => {
                debug!("download into {:?} complete", path);
                let rt = self.rt(slot);
                if rt.tree.get(parent_folder).is_some() {
                    rt.tree.mark_scan_again(parent_folder, TreeAction::Here);
                    rt.tree.mark_sync_again(parent_folder, TreeAction::Here);
                }
            }
            TransferOutcome::Failed { transient, reason } => {
                if transient {
                    debug!("download into {:?} failed transiently: {}", path, reason);
                } else {
                    warn!("download into {:?} failed: {}", path, reason);
                }
                self.poke_sync(backup_id);
            }
            TransferOutcome::Cancelled => {
                debug!("download into {:?} cancelled", path);
            }
        }
    }
}
