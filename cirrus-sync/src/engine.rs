//! Top-level sync engine
//!
//! Owns the set of sync configs and their per-sync runtimes. One dedicated
//! task (the sync task) runs the reconciler, the LocalNode trees, the
//! fsid/handle indexes, and the state caches; everything else reaches that
//! state through the action queue (`sync_run` / `queue_sync`) or through
//! the published snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cirrus_cloud::{CloudClient, CloudEvent, NodeAttrs, NodeHandle, TransferEngine};
use cirrus_fs::{watch_subtree, Filesystem, ScanService};

use crate::backup::resume_backup_state;
use crate::change_detection::{NotifyDrain, ScanSchedule};
use crate::config::{
    BackupId, BackupState, ChangeDetection, RunState, SyncConfig, SyncProblem, SyncType,
    SyncWarning,
};
use crate::config_store::{ConfigCipher, SyncConfigStore};
use crate::errors::{Result, SyncError};
use crate::moves::EngineIndexes;
use crate::runtime::SyncRuntime;
use crate::stall::StallReport;
use crate::statecache::{load_tree, SqliteStateTable, StateTable};
use crate::tree::TreeAction;
use crate::waiter::{PathStateCache, PathSyncState};

/// Test-only hook able to veto uploads, putnodes, and putnodes completion,
/// giving tests deterministic ordering around those points.
pub trait SyncController: Send + Sync {
    fn veto_upload(&self, _sync: BackupId, _path: &Path) -> bool {
        false
    }
    fn veto_put_nodes(&self, _sync: BackupId, _parent: NodeHandle, _name: &str) -> bool {
        false
    }
    fn veto_put_nodes_completion(&self, _sync: BackupId) -> bool {
        false
    }
}

pub(crate) type EngineAction = Box<dyn FnOnce(&mut EngineCore) + Send + 'static>;

/// Queue of closures delivering cloud/transfer completions to the sync
/// task in acknowledgement order.
pub type CompletionQueue = mpsc::UnboundedReceiver<Box<dyn FnOnce() + Send>>;

/// Everything needed to create one sync.
#[derive(Debug, Clone)]
pub struct AddSyncRequest {
    pub name: String,
    pub local_root: PathBuf,
    pub remote_root: NodeHandle,
    pub sync_type: SyncType,
    pub change_detection: ChangeDetection,
    pub scan_interval_secs: u64,
    pub external_drive_path: Option<PathBuf>,
}

pub struct EngineOptions {
    /// Per-user directory holding the config store and state caches.
    pub base_dir: PathBuf,
    /// Secret from which the config envelope keys derive.
    pub user_key: Vec<u8>,
    pub scan_workers: usize,
}

const STORE_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const TICK_INTERVAL: Duration = Duration::from_millis(50);
const CACHE_FAILURE_LIMIT: u32 = 3;
const PATH_CACHE_CAPACITY: usize = 512;
const PATH_STATE_LOCK_WAIT: Duration = Duration::from_millis(10);

fn filesystem_is_case_insensitive() -> bool {
    cfg!(any(target_os = "windows", target_os = "macos"))
}

/// Component-aware prefix test for cloud paths: `/s2/x` is not under `/s`.
fn cloud_path_is_under(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return true;
    }
    path == root || path.starts_with(&format!("{}/", root))
}

pub(crate) struct EngineCore {
    pub(crate) fs: Arc<dyn Filesystem>,
    pub(crate) cloud: Arc<dyn CloudClient>,
    pub(crate) transfers: Arc<dyn TransferEngine>,
    pub(crate) scans: Arc<ScanService>,
    pub(crate) configs: Vec<SyncConfig>,
    pub(crate) syncs: Vec<Option<SyncRuntime>>,
    pub(crate) indexes: EngineIndexes,
    pub(crate) store: SyncConfigStore,
    pub(crate) controller: Option<Arc<dyn SyncController>>,
    pub(crate) actions_tx: mpsc::UnboundedSender<EngineAction>,
    pub(crate) deferred: Vec<EngineAction>,
    pub(crate) state_dir: PathBuf,
    pub(crate) cache_failures: u32,
    pub(crate) last_store_flush: Instant,
    pub(crate) shutting_down: bool,
}

impl EngineCore {
    pub(crate) fn rt(&mut self, slot: usize) -> &mut SyncRuntime {
        self.syncs[slot].as_mut().expect("sync slot is live")
    }

    pub(crate) fn slot_of(&self, backup_id: BackupId) -> Option<usize> {
        self.syncs.iter().position(|s| {
            s.as_ref()
                .map(|rt| rt.config.backup_id == backup_id)
                .unwrap_or(false)
        })
    }

    fn config_mut(&mut self, backup_id: BackupId) -> Option<&mut SyncConfig> {
        self.configs.iter_mut().find(|c| c.backup_id == backup_id)
    }

    /// Wake a sync for another pass.
    pub(crate) fn poke_sync(&mut self, backup_id: BackupId) {
        if let Some(slot) = self.slot_of(backup_id) {
            let rt = self.rt(slot);
            let root = rt.tree.root();
            rt.tree.mark_sync_again(root, TreeAction::Here);
        }
    }

    /// Repeated state-cache failures are engine-wide fatal: every sync is
    /// disabled, reported once.
    pub(crate) fn note_cache_failure(&mut self) {
        self.cache_failures += 1;
        if self.cache_failures == CACHE_FAILURE_LIMIT {
            error!("state cache failing repeatedly; disabling all syncs");
            let ids: Vec<BackupId> = self
                .syncs
                .iter()
                .filter_map(|s| s.as_ref().map(|rt| rt.config.backup_id))
                .collect();
            for id in ids {
                let _ = self.disable_sync(id, Some(SyncProblem::StateCacheUnusable), true);
            }
        }
    }

    // --- lifecycle -------------------------------------------------------

    pub(crate) fn add_sync(
        &mut self,
        request: AddSyncRequest,
        start_immediately: bool,
    ) -> Result<BackupId> {
        // The local root must exist and be a directory.
        let info = self.fs.open(&request.local_root)?;
        if !matches!(info.kind, cirrus_fs::NodeKind::Folder) {
            return Err(SyncError::InvalidSync(format!(
                "{:?} is not a directory",
                request.local_root
            )));
        }
        // No duplicate and no nesting with any other sync.
        for config in &self.configs {
            if config.local_root == request.local_root
                || config.local_root.starts_with(&request.local_root)
                || request.local_root.starts_with(&config.local_root)
            {
                return Err(SyncError::InvalidSync(format!(
                    "{:?} overlaps sync {:?}",
                    request.local_root, config.local_root
                )));
            }
        }
        let volume = self.fs.fs_fingerprint(&request.local_root)?;
        if self.cloud.node_by_handle(request.remote_root).is_none() {
            return Err(SyncError::InvalidSync("remote root not found".into()));
        }
        let remote_path = self
            .cloud
            .node_path(request.remote_root)
            .unwrap_or_default();

        let backup_id = rand::random::<u64>() | 1;
        let config = SyncConfig {
            backup_id,
            name: request.name,
            local_root: request.local_root,
            remote_root: crate::config::RemoteRoot {
                handle: request.remote_root,
                path: remote_path,
            },
            filesystem_fingerprint: volume,
            local_root_fsid: if info.fsid_valid { info.fsid } else { 0 },
            sync_type: request.sync_type,
            enabled: start_immediately,
            error: None,
            warning: None,
            run_state: RunState::Pending,
            backup_state: request
                .sync_type
                .is_backup()
                .then_some(BackupState::Mirror),
            change_detection: request.change_detection,
            scan_interval_secs: request.scan_interval_secs,
            external_drive_path: request.external_drive_path,
        };
        info!(
            "[{}] sync added: {:?} <-> {:?} ({:?})",
            config.name, config.local_root, config.remote_root.path, config.sync_type
        );
        self.configs.push(config);
        self.mark_config_dirty(backup_id);
        if start_immediately {
            self.enable_sync(backup_id)?;
        }
        Ok(backup_id)
    }

    pub(crate) fn enable_sync(&mut self, backup_id: BackupId) -> Result<()> {
        if self.slot_of(backup_id).is_some() {
            return Ok(()); // already running
        }
        let Some(config) = self.config_mut(backup_id) else {
            return Err(SyncError::UnknownSync(backup_id));
        };
        let mut config = config.clone();
        let prior_error = config.error;
        config.run_state = RunState::Loading;
        config.error = None;
        config.enabled = true;

        // The volume must still be the one the caches were built for.
        let volume = self.fs.fs_fingerprint(&config.local_root)?;
        if !config.filesystem_fingerprint.is_undef()
            && config.filesystem_fingerprint != volume
        {
            warn!(
                "[{}] filesystem fingerprint changed ({:?} -> {:?}); refusing to start",
                config.name, config.filesystem_fingerprint, volume
            );
            self.record_sync_problem(backup_id, SyncProblem::FilesystemFingerprintChanged);
            return Err(SyncError::InvalidSync(
                "filesystem fingerprint changed".into(),
            ));
        }
        let root_info = self.fs.open(&config.local_root).map_err(|e| {
            self.record_sync_problem(backup_id, SyncProblem::LocalRootUnavailable);
            e
        })?;
        if config.filesystem_fingerprint.is_undef() {
            config.filesystem_fingerprint = volume;
        }
        if config.local_root_fsid == 0 && root_info.fsid_valid {
            config.local_root_fsid = root_info.fsid;
        }
        if self.cloud.node_by_handle(config.remote_root.handle).is_none() {
            self.record_sync_problem(backup_id, SyncProblem::RemoteRootMissing);
            return Err(SyncError::InvalidSync("remote root missing".into()));
        }
        // Refresh the last-known remote path.
        if let Some(path) = self.cloud.node_path(config.remote_root.handle) {
            if path != config.remote_root.path {
                config.warning = Some(SyncWarning::RemotePathChanged);
                config.remote_root.path = path;
            }
        }
        if config.is_backup() {
            // Re-enabling after a foreign modification always remirrors;
            // otherwise apply the resume rules.
            config.backup_state = if prior_error == Some(SyncProblem::BackupModified) {
                Some(BackupState::Mirror)
            } else {
                Some(resume_backup_state(config.backup_state, config.is_external()))
            };
        }

        let slot = self
            .syncs
            .iter()
            .position(|s| s.is_none())
            .unwrap_or_else(|| {
                self.syncs.push(None);
                self.syncs.len() - 1
            });
        let case_insensitive = filesystem_is_case_insensitive();
        let mut rt = SyncRuntime::new(config.clone(), slot, case_insensitive, false);
        rt.fs_stable_ids = !volume.is_undef() && root_info.fsid_valid;

        // State cache: load the shadow tree or start from scratch.
        let cache_path = self.state_dir.join(config.state_cache_name());
        match SqliteStateTable::open(&cache_path) {
            Ok(mut table) => {
                match load_tree(&mut table, case_insensitive) {
                    Ok(Some(tree)) => {
                        info!("[{}] resumed from state cache ({} nodes)", config.name, tree.len());
                        rt.tree = tree;
                        rt.loaded_from_cache = true;
                    }
                    Ok(None) => {
                        debug!("[{}] no state cache; initial scan", config.name);
                    }
                    Err(e) => {
                        warn!("[{}] state cache rejected ({}); full resync", config.name, e);
                        let _ = table.truncate();
                    }
                }
                rt.statecache = Some(Box::new(table));
            }
            Err(e) => {
                warn!("[{}] cannot open state cache: {}", config.name, e);
                self.note_cache_failure();
            }
        }

        if rt.loaded_from_cache {
            self.register_loaded_tree(&mut rt, slot);
            self.verify_shortnames(&mut rt);
        }
        {
            // The root row anchors every child's parent linkage in the
            // cache; it must be persisted before any child.
            let root = rt.tree.root();
            if rt.tree.node(root).row_id.is_none() {
                rt.statecache_add(root);
            }
        }
        {
            // A full scan identifies everything that changed while we were
            // away; its completion gates the Loading -> Run transition.
            let root = rt.tree.root();
            rt.tree.mark_scan_again(root, TreeAction::Below);
            rt.tree.mark_sync_again(root, TreeAction::Below);
        }

        if let Err(e) = rt.debris.acquire_tmp_lock(self.fs.as_ref()) {
            debug!("[{}] debris lock unavailable: {}", config.name, e);
        }

        // Change detection.
        match config.change_detection {
            ChangeDetection::Notifications => {
                let (tx, rx) = mpsc::unbounded_channel();
                match watch_subtree(&config.local_root, tx) {
                    Ok(handle) => {
                        rt.notify_handle = Some(handle);
                        rt.notifyq.attach(rx);
                        if config.scan_interval_secs > 0 {
                            rt.schedule =
                                Some(ScanSchedule::new(config.scan_interval_secs, Instant::now()));
                        }
                    }
                    Err(e) if config.scan_interval_secs > 0 => {
                        warn!(
                            "[{}] watcher unavailable ({}); falling back to periodic scanning",
                            config.name, e
                        );
                        rt.config.warning = Some(SyncWarning::FellBackToPeriodicScanning);
                        rt.schedule =
                            Some(ScanSchedule::new(config.scan_interval_secs, Instant::now()));
                    }
                    Err(e) => {
                        warn!("[{}] watcher unavailable: {}", config.name, e);
                        self.record_sync_problem(
                            backup_id,
                            SyncProblem::NotificationSystemUnavailable,
                        );
                        return Err(SyncError::Fs(e));
                    }
                }
            }
            ChangeDetection::PeriodicScan => {
                rt.schedule = Some(ScanSchedule::new(
                    config.scan_interval_secs.max(1),
                    Instant::now(),
                ));
            }
        }

        rt.config.run_state = RunState::Loading;
        rt.config.filesystem_fingerprint = config.filesystem_fingerprint;
        rt.config.local_root_fsid = config.local_root_fsid;
        rt.config.backup_state = config.backup_state;
        rt.config.remote_root = config.remote_root.clone();
        rt.config.enabled = true;

        self.syncs[slot] = Some(rt);
        if let Some(master) = self.config_mut(backup_id) {
            *master = config;
        }
        self.mark_config_dirty(backup_id);
        info!("sync {:#x} enabled", backup_id);
        Ok(())
    }

    /// Register loaded nodes in the engine-wide indexes.
    fn register_loaded_tree(&mut self, rt: &mut SyncRuntime, slot: usize) {
        let volume = rt.config.filesystem_fingerprint;
        for id in rt.tree.ids_depth_first() {
            let node = rt.tree.node(id);
            let node_ref = crate::moves::NodeRef { sync: slot, node: id };
            self.indexes.set_synced_fsid(volume, node.synced_fsid, node_ref);
            self.indexes.set_cloud_handle(node.synced_cloud_handle, node_ref);
        }
    }

    /// Shortname mismatches against the live filesystem force a rescan of
    /// the owning folder.
    fn verify_shortnames(&mut self, rt: &mut SyncRuntime) {
        let root_path = rt.config.local_root.clone();
        let ids = rt.tree.ids_depth_first();
        for id in ids {
            let (slocalname, parent) = {
                let node = rt.tree.node(id);
                (node.slocalname.clone(), node.parent)
            };
            if slocalname.is_none() {
                continue;
            }
            let path = rt.tree.path_of(&root_path, id);
            let live = self.fs.shortname(&path);
            if live != slocalname {
                if let Some(parent) = parent {
                    debug!("shortname drift at {:?}; queueing rescan", path);
                    rt.tree.mark_scan_again(parent, TreeAction::Here);
                }
            }
        }
    }

    pub(crate) fn disable_sync(
        &mut self,
        backup_id: BackupId,
        reason: Option<SyncProblem>,
        keep_cache: bool,
    ) -> Result<()> {
        let slot = self.slot_of(backup_id);
        if let Some(slot) = slot {
            // Cooperative teardown: cancel this sync's transfers, drop the
            // runtime; late completions find no slot and fall away.
            if let Some(mut rt) = self.syncs[slot].take() {
                for token in rt.in_flight.values() {
                    token.cancel();
                }
                let _ = rt.flush_state_cache();
                rt.notify_handle = None;
            }
            self.indexes.purge_sync(slot);
        }
        let cache_name = self
            .configs
            .iter()
            .find(|c| c.backup_id == backup_id)
            .map(|c| c.state_cache_name());
        let Some(config) = self.config_mut(backup_id) else {
            return Err(SyncError::UnknownSync(backup_id));
        };
        config.enabled = false;
        config.run_state = RunState::Disable;
        config.error = reason;
        info!("sync {:#x} disabled ({:?})", backup_id, reason);
        if !keep_cache {
            if let Some(name) = cache_name {
                let path = self.state_dir.join(name);
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("cannot remove state cache {:?}: {}", path, e);
                    }
                }
            }
        }
        self.mark_config_dirty(backup_id);
        Ok(())
    }

    fn record_sync_problem(&mut self, backup_id: BackupId, problem: SyncProblem) {
        if let Some(config) = self.config_mut(backup_id) {
            config.error = Some(problem);
            config.run_state = RunState::Disable;
            config.enabled = false;
        }
        self.mark_config_dirty(backup_id);
    }

    pub(crate) fn remove_sync(&mut self, backup_id: BackupId) -> Result<()> {
        self.disable_sync(backup_id, None, false)?;
        self.configs.retain(|c| c.backup_id != backup_id);
        self.flush_config_store(true);
        Ok(())
    }

    pub(crate) fn remote_handle_of(&self, backup_id: BackupId) -> Result<NodeHandle> {
        self.configs
            .iter()
            .find(|c| c.backup_id == backup_id)
            .map(|c| c.remote_root.handle)
            .ok_or(SyncError::UnknownSync(backup_id))
    }

    fn mark_config_dirty(&mut self, backup_id: BackupId) {
        let drive = self
            .configs
            .iter()
            .find(|c| c.backup_id == backup_id)
            .and_then(|c| c.external_drive_path.clone())
            .unwrap_or_else(|| self.store.internal_drive());
        self.store.mark_dirty(&drive);
    }

    fn flush_config_store(&mut self, force: bool) {
        if !self.store.dirty() {
            return;
        }
        if !force && self.last_store_flush.elapsed() < STORE_FLUSH_INTERVAL {
            return;
        }
        self.last_store_flush = Instant::now();
        for drive in self.store.dirty_drives() {
            let internal = drive == self.store.internal_drive();
            let configs: Vec<SyncConfig> = self
                .configs
                .iter()
                .filter(|c| {
                    if internal {
                        c.external_drive_path.is_none()
                    } else {
                        c.external_drive_path.as_deref() == Some(drive.as_path())
                    }
                })
                .cloned()
                .collect();
            if let Err(e) = self.store.write(&drive, &configs) {
                warn!("config store write for {:?} failed: {}", drive, e);
            }
        }
    }

    // --- the sync task's periodic work -----------------------------------

    pub(crate) fn tick(&mut self) {
        // Deferred work first (vetoed completions re-check their veto).
        let deferred = std::mem::take(&mut self.deferred);
        for action in deferred {
            action(self);
        }

        for slot in 0..self.syncs.len() {
            if self.syncs[slot].is_some() {
                self.process_sync(slot);
            }
        }
        self.flush_config_store(false);
    }

    fn process_sync(&mut self, slot: usize) {
        let now = Instant::now();
        let (backup_id, run_state) = {
            let rt = self.rt(slot);
            (rt.config.backup_id, rt.config.run_state)
        };
        if !matches!(run_state, RunState::Run | RunState::Loading) {
            return;
        }

        // Change detection feeds scan flags.
        let mut notifications_lost = false;
        {
            let rt = self.rt(slot);
            rt.notifyq.pump(now);
            let drain = rt.notifyq.drain(now);
            match drain {
                NotifyDrain::Idle => {}
                NotifyDrain::Changed(paths) => {
                    let root_path = rt.config.local_root.clone();
                    for path in paths {
                        // Debris churn is our own doing.
                        if rt.debris.contains(&path) {
                            continue;
                        }
                        let target = if path == root_path {
                            path.clone()
                        } else {
                            path.parent().map(|p| p.to_path_buf()).unwrap_or(path.clone())
                        };
                        let (node, unresolved_tail) = rt.tree.nearest_node(&root_path, &target);
                        let action = if unresolved_tail {
                            TreeAction::Below
                        } else {
                            TreeAction::Here
                        };
                        rt.tree.mark_scan_again(node, action);
                        rt.tree.mark_sync_again(node, TreeAction::Here);
                    }
                }
                NotifyDrain::Overflowed => {
                    let root = rt.tree.root();
                    rt.tree.mark_scan_again(root, TreeAction::Below);
                    rt.tree.mark_sync_again(root, TreeAction::Below);
                }
                NotifyDrain::Failed => {
                    if rt.schedule.is_some() {
                        if rt.config.warning != Some(SyncWarning::FellBackToPeriodicScanning) {
                            warn!(
                                "[{}] notifications lost; continuing on periodic scans",
                                rt.config.name
                            );
                            rt.config.warning = Some(SyncWarning::FellBackToPeriodicScanning);
                        }
                        rt.notify_handle = None;
                    } else {
                        notifications_lost = true;
                    }
                }
            }
        }
        if notifications_lost {
            let _ = self.disable_sync(
                backup_id,
                Some(SyncProblem::NotificationSystemUnavailable),
                true,
            );
            return;
        }

        // Periodic rescan.
        {
            let rt = self.rt(slot);
            if let Some(schedule) = rt.schedule.as_mut() {
                if schedule.due(now) {
                    schedule.reschedule(now);
                    let root = rt.tree.root();
                    rt.tree.mark_scan_again(root, TreeAction::Below);
                    rt.tree.mark_sync_again(root, TreeAction::Below);
                }
            }
        }

        // Anything to do?
        let wants_pass = {
            let rt = self.rt(slot);
            let root = rt.tree.root();
            let root_flagged = {
                let node = rt.tree.node(root);
                node.scan_again.needs_visit() || node.sync_again.needs_visit()
            };
            root_flagged || rt.active_scan.is_some() || !rt.in_flight.is_empty()
        };
        if !wants_pass {
            return;
        }
        if !self.rt(slot).gate.allows_pass(now) {
            return;
        }

        self.reconcile_pass(slot);

        // Permanent problems detected mid-pass.
        if let Some(problem) = self.rt(slot).fail_with.take() {
            let _ = self.disable_sync(backup_id, Some(problem), true);
            return;
        }

        // Loading finishes once the first full scan round has completed.
        let finish_loading = {
            let rt = self.rt(slot);
            rt.config.run_state == RunState::Loading && rt.scanning_complete
        };
        if finish_loading {
            let loaded = self.rt(slot).loaded_from_cache;
            if loaded {
                let removed = self.rt(slot).purge_unvisited_nodes();
                let volume = self.rt(slot).config.filesystem_fingerprint;
                for (node_id, node) in &removed {
                    let node_ref = crate::moves::NodeRef {
                        sync: slot,
                        node: *node_id,
                    };
                    self.indexes
                        .clear_synced_fsid(volume, node.synced_fsid, node_ref);
                    self.indexes
                        .clear_cloud_handle(node.synced_cloud_handle, node_ref);
                }
            }
            let rt = self.rt(slot);
            rt.config.run_state = RunState::Run;
            info!("[{}] initial pass complete; running", rt.config.name);
            if let Some(master) = self.config_mut(backup_id) {
                master.run_state = RunState::Run;
            }
        }

        // Mirror completes -> Monitor.
        let mirror_done = {
            let rt = self.rt(slot);
            rt.config.run_state == RunState::Run
                && rt.config.sync_type.is_backup()
                && rt.config.backup_state == Some(BackupState::Mirror)
                && rt.all_synced
        };
        if mirror_done {
            info!("backup {:#x} mirror complete; monitoring", backup_id);
            self.rt(slot).config.backup_state = Some(BackupState::Monitor);
            if let Some(master) = self.config_mut(backup_id) {
                master.backup_state = Some(BackupState::Monitor);
            }
            self.mark_config_dirty(backup_id);
        }
    }

    /// Remote-change events: wake affected syncs, and check attribution for
    /// monitoring backups (invariant: every cloud mutation observed under a
    /// monitoring backup must be ours).
    pub(crate) fn handle_cloud_event(&mut self, event: CloudEvent) {
        let event_path = self
            .cloud
            .node_path(event.handle)
            .or_else(|| {
                self.cloud
                    .node_path(event.parent)
                    .map(|p| format!("{}/{}", p, event.name))
            })
            .unwrap_or_default();

        let now = Instant::now();
        for slot in 0..self.syncs.len() {
            let Some((run_state, root_path, monitoring, backup_id)) =
                self.syncs[slot].as_ref().map(|rt| {
                    (
                        rt.config.run_state,
                        rt.config.remote_root.path.clone(),
                        rt.config.sync_type.is_backup()
                            && rt.config.backup_state == Some(BackupState::Monitor),
                        rt.config.backup_id,
                    )
                })
            else {
                continue;
            };
            if !matches!(run_state, RunState::Run | RunState::Loading) {
                continue;
            }
            if !cloud_path_is_under(&event_path, &root_path) {
                continue;
            }
            if monitoring && !self.rt(slot).expected.attributable(&event, now) {
                warn!(
                    "foreign cloud mutation {:?} under monitoring backup {:#x}",
                    event_path, backup_id
                );
                let _ = self.disable_sync(backup_id, Some(SyncProblem::BackupModified), true);
                continue;
            }

            // Wake the folder the event touched; the root is the fallback
            // when the node is not in this sync's tree yet.
            let mut wake = Vec::new();
            if let Some(r) = self.indexes.by_cloud_handle(event.parent) {
                if r.sync == slot {
                    wake.push(r.node);
                }
            }
            if let Some(r) = self.indexes.by_cloud_handle(event.handle) {
                if r.sync == slot {
                    if let Some(parent) = self.rt(slot).tree.get(r.node).and_then(|n| n.parent) {
                        wake.push(parent);
                    }
                }
            }
            let rt = self.rt(slot);
            if wake.is_empty() {
                wake.push(rt.tree.root());
            }
            for node in wake {
                if rt.tree.get(node).is_some() {
                    rt.tree.mark_sync_again(node, TreeAction::Here);
                }
            }
        }
    }

    // --- snapshots -------------------------------------------------------

    pub(crate) fn snapshot_configs(&mut self) -> Vec<SyncConfig> {
        // Runtime copies are authoritative for live syncs.
        for slot in 0..self.syncs.len() {
            if let Some(rt) = self.syncs[slot].as_ref() {
                let config = rt.config.clone();
                if let Some(master) = self.config_mut(config.backup_id) {
                    *master = config;
                }
            }
        }
        self.configs.clone()
    }

    pub(crate) fn snapshot_stalls(&self) -> StallReport {
        let mut merged = StallReport::default();
        for rt in self.syncs.iter().flatten() {
            merged.merge(rt.stalls.clone());
        }
        merged
    }

    pub(crate) fn all_quiescent(&self) -> bool {
        if !self.deferred.is_empty() {
            return false;
        }
        self.syncs.iter().flatten().all(|rt| {
            !matches!(rt.config.run_state, RunState::Run | RunState::Loading)
                || (rt.config.run_state == RunState::Run && rt.all_synced)
        })
    }

    pub(crate) fn path_state(&self, path: &Path) -> PathSyncState {
        for rt in self.syncs.iter().flatten() {
            let root = &rt.config.local_root;
            if !path.starts_with(root) {
                continue;
            }
            let (node, unresolved) = rt.tree.nearest_node(root, path);
            if unresolved {
                return if rt.all_synced {
                    PathSyncState::NotTracked
                } else {
                    PathSyncState::Syncing
                };
            }
            let n = rt.tree.node(node);
            if n.conflict_below {
                return PathSyncState::Stalled;
            }
            if n.scan_again.needs_visit() || n.sync_again.needs_visit() {
                return PathSyncState::Syncing;
            }
            return PathSyncState::Synced;
        }
        PathSyncState::NotTracked
    }

    fn final_flush(&mut self) {
        for slot in 0..self.syncs.len() {
            if self.syncs[slot].is_some() {
                if let Err(e) = self.rt(slot).flush_state_cache() {
                    warn!("final state cache flush failed: {}", e);
                }
            }
        }
        self.flush_config_store(true);
        self.scans.shutdown();
    }
}

pub(crate) struct EngineShared {
    pub(crate) core: RwLock<EngineCore>,
    pub(crate) actions_tx: mpsc::UnboundedSender<EngineAction>,
    pub(crate) published_stalls: Mutex<StallReport>,
    pub(crate) published_configs: Mutex<Vec<SyncConfig>>,
    pub(crate) path_cache: Mutex<PathStateCache>,
}

/// Public handle to the engine; cheap to clone, safe to use from any
/// thread.
#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<EngineShared>,
}

impl SyncEngine {
    /// Build the engine and spawn its sync task. `completions` is the
    /// queue on which the cloud adapter delivers command completions in
    /// acknowledgement order.
    pub async fn start(
        fs: Arc<dyn Filesystem>,
        cloud: Arc<dyn CloudClient>,
        transfers: Arc<dyn TransferEngine>,
        options: EngineOptions,
        completions: CompletionQueue,
    ) -> Result<SyncEngine> {
        let state_dir = options.base_dir.join("state");
        std::fs::create_dir_all(&state_dir).map_err(SyncError::ConfigIo)?;

        let cipher = ConfigCipher::derive(&options.user_key);
        let mut store = SyncConfigStore::new(options.base_dir.clone(), cipher);
        let internal = store.internal_drive();
        let configs = store.read(&internal)?;

        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let scans = Arc::new(ScanService::new(fs.clone(), options.scan_workers.max(1)));
        let cloud_events = cloud.subscribe();

        let enabled: Vec<BackupId> = configs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.backup_id)
            .collect();

        let core = EngineCore {
            fs,
            cloud,
            transfers,
            scans,
            configs,
            syncs: Vec::new(),
            indexes: EngineIndexes::default(),
            store,
            controller: None,
            actions_tx: actions_tx.clone(),
            deferred: Vec::new(),
            state_dir,
            cache_failures: 0,
            last_store_flush: Instant::now(),
            shutting_down: false,
        };

        let shared = Arc::new(EngineShared {
            core: RwLock::new(core),
            actions_tx: actions_tx.clone(),
            published_stalls: Mutex::new(StallReport::default()),
            published_configs: Mutex::new(Vec::new()),
            path_cache: Mutex::new(PathStateCache::new(PATH_CACHE_CAPACITY)),
        });

        tokio::spawn(run_loop(
            shared.clone(),
            actions_rx,
            completions,
            cloud_events,
        ));

        let engine = SyncEngine { shared };
        // Bring persisted, enabled syncs back up.
        for backup_id in enabled {
            match engine.sync_run(move |core| core.enable_sync(backup_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("could not resume sync {:#x}: {}", backup_id, e),
                Err(e) => warn!("could not reach the sync task: {}", e),
            }
        }
        Ok(engine)
    }

    pub(crate) fn actions_tx(&self) -> &mpsc::UnboundedSender<EngineAction> {
        &self.shared.actions_tx
    }

    /// Create a sync. Validation failures leave the engine untouched.
    pub async fn add_sync(
        &self,
        request: AddSyncRequest,
        start_immediately: bool,
    ) -> Result<BackupId> {
        self.sync_run(move |core| core.add_sync(request, start_immediately))
            .await?
    }

    pub async fn enable(&self, backup_id: BackupId) -> Result<()> {
        self.sync_run(move |core| core.enable_sync(backup_id)).await?
    }

    pub async fn disable(
        &self,
        backup_id: BackupId,
        reason: Option<SyncProblem>,
        keep_cache: bool,
    ) -> Result<()> {
        self.sync_run(move |core| core.disable_sync(backup_id, reason, keep_cache))
            .await?
    }

    /// Remove the cloud-side registration, then drop the sync and its state
    /// cache. Fails without local changes if the cloud call fails.
    pub async fn deregister_and_remove(&self, backup_id: BackupId) -> Result<()> {
        let handle = self
            .sync_run(move |core| core.remote_handle_of(backup_id))
            .await??;

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sync_run(move |core| {
            core.cloud.set_attr(
                handle,
                NodeAttrs::default(),
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );
        })
        .await?;
        match rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("deregistration of {:#x} failed: {}", backup_id, e);
                return Err(SyncError::Cloud(e));
            }
            Err(_) => return Err(SyncError::EngineDown),
        }

        self.sync_run(move |core| core.remove_sync(backup_id)).await?
    }

    /// Thread-safe config snapshot for the UI.
    pub fn get_configs(&self, only_active: bool) -> Vec<SyncConfig> {
        let configs = self.shared.published_configs.lock().clone();
        if only_active {
            configs
                .into_iter()
                .filter(|c| matches!(c.run_state, RunState::Run | RunState::Loading))
                .collect()
        } else {
            configs
        }
    }

    /// Current stall/conflict report plus the immediate-attention flag.
    pub fn get_problems(&self) -> (StallReport, bool) {
        let report = self.shared.published_stalls.lock().clone();
        let immediate = report.has_immediate();
        (report, immediate)
    }

    /// Install (or clear) the test controller.
    pub async fn set_controller(&self, controller: Option<Arc<dyn SyncController>>) -> Result<()> {
        self.sync_run(move |core| core.controller = controller).await
    }

    /// Test hook: force the next periodic scan check to fire now.
    pub async fn trigger_periodic_scan_early(&self, backup_id: BackupId) -> Result<()> {
        self.sync_run(move |core| {
            if let Some(slot) = core.slot_of(backup_id) {
                if let Some(schedule) = core.rt(slot).schedule.as_mut() {
                    schedule.trigger_early();
                }
            }
        })
        .await
    }

    /// Sync state of one path, for shell overlays. Never blocks: a busy
    /// engine answers from the LRU cache.
    pub fn path_state(&self, path: &Path) -> PathSyncState {
        if let Some(core) = self.shared.core.try_read_for(PATH_STATE_LOCK_WAIT) {
            let state = core.path_state(path);
            drop(core);
            self.shared
                .path_cache
                .lock()
                .put(path.to_path_buf(), state);
            state
        } else {
            self.shared
                .path_cache
                .lock()
                .get(path)
                .unwrap_or(PathSyncState::NotTracked)
        }
    }

    /// Poll until every running sync reports a fully resolved tree, or the
    /// timeout expires. Intended for tests and orderly shutdown.
    pub async fn wait_quiescent(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.sync_run(|core| core.all_quiescent()).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => return false,
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Orderly shutdown: flush caches and configs, stop the loop.
    pub async fn shutdown(&self) {
        let _ = self.sync_run(|core| core.shutting_down = true).await;
    }
}

async fn run_loop(
    shared: Arc<EngineShared>,
    mut actions_rx: mpsc::UnboundedReceiver<EngineAction>,
    mut completions: CompletionQueue,
    mut cloud_events: mpsc::UnboundedReceiver<CloudEvent>,
) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            Some(completion) = completions.recv() => {
                // Completions run in acknowledgement order.
                completion();
                while let Ok(next) = completions.try_recv() {
                    next();
                }
            }
            Some(action) = actions_rx.recv() => {
                let mut core = shared.core.write();
                action(&mut core);
                while let Ok(next) = actions_rx.try_recv() {
                    next(&mut core);
                }
            }
            Some(event) = cloud_events.recv() => {
                let mut core = shared.core.write();
                core.handle_cloud_event(event);
                while let Ok(next) = cloud_events.try_recv() {
                    core.handle_cloud_event(next);
                }
            }
        }

        let (configs, stalls, done) = {
            let mut core = shared.core.write();
            if core.shutting_down {
                core.final_flush();
                (core.snapshot_configs(), core.snapshot_stalls(), true)
            } else {
                core.tick();
                (core.snapshot_configs(), core.snapshot_stalls(), false)
            }
        };
        *shared.published_configs.lock() = configs;
        *shared.published_stalls.lock() = stalls;
        if done {
            debug!("sync task exiting");
            break;
        }
    }
}
