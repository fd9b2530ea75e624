//! Backup state machine support
//!
//! A backup mirrors local to cloud, then monitors. While monitoring, every
//! observed cloud mutation must be attributable to a command this engine
//! issued recently on behalf of the sync; anything else disables the sync
//! with `BackupModified`. Attribution tracks expected node additions by
//! `(parent handle, name)` and expected touches by handle, with a finite
//! expiry window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use cirrus_cloud::{CloudEvent, CloudEventKind, NodeHandle};

use crate::config::BackupState;

/// How long an issued command remains attributable.
pub const ATTRIBUTION_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct ExpectedCloudActions {
    adds: HashMap<(NodeHandle, String), Instant>,
    touches: HashMap<NodeHandle, Instant>,
}

impl ExpectedCloudActions {
    /// Expect a node to appear under `parent` with `name` (upload
    /// completion or folder creation).
    pub fn expect_add(&mut self, parent: NodeHandle, name: &str, now: Instant) {
        self.adds.insert((parent, name.to_string()), now);
    }

    /// Expect a mutation of an existing node (rename, move, removal).
    pub fn expect_touch(&mut self, handle: NodeHandle, now: Instant) {
        self.touches.insert(handle, now);
    }

    /// Whether `event` matches something this engine did recently. A match
    /// is consumed for additions and kept for touches (one command can
    /// produce several events).
    pub fn attributable(&mut self, event: &CloudEvent, now: Instant) -> bool {
        self.prune(now);
        match event.kind {
            CloudEventKind::Added => self
                .adds
                .remove(&(event.parent, event.name.clone()))
                .is_some(),
            CloudEventKind::Removed
            | CloudEventKind::Renamed
            | CloudEventKind::AttrChanged => self.touches.contains_key(&event.handle),
        }
    }

    pub fn prune(&mut self, now: Instant) {
        self.adds
            .retain(|_, at| now.duration_since(*at) < ATTRIBUTION_WINDOW);
        self.touches
            .retain(|_, at| now.duration_since(*at) < ATTRIBUTION_WINDOW);
    }

    pub fn clear(&mut self) {
        self.adds.clear();
        self.touches.clear();
    }
}

/// Which substate a backup re-enters after a restart.
///
/// External backups always remirror: the drive may have been plugged into
/// another machine meanwhile. Internal backups re-enter Monitor only when
/// the last durable state says the mirror had completed; an interrupted
/// mirror resumes as Mirror, since monitoring would mis-flag its own
/// catch-up uploads.
pub fn resume_backup_state(persisted: Option<BackupState>, external: bool) -> BackupState {
    if external {
        return BackupState::Mirror;
    }
    match persisted {
        Some(BackupState::Monitor) => BackupState::Monitor,
        _ => BackupState::Mirror,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn added(parent: u64, name: &str) -> CloudEvent {
        CloudEvent {
            kind: CloudEventKind::Added,
            handle: NodeHandle(99),
            parent: NodeHandle(parent),
            name: name.into(),
        }
    }

    #[test]
    fn expected_add_is_attributable_once() {
        let mut expected = ExpectedCloudActions::default();
        let now = Instant::now();
        expected.expect_add(NodeHandle(5), "report.pdf", now);

        assert!(expected.attributable(&added(5, "report.pdf"), now));
        // consumed
        assert!(!expected.attributable(&added(5, "report.pdf"), now));
    }

    #[test]
    fn foreign_add_is_not_attributable() {
        let mut expected = ExpectedCloudActions::default();
        let now = Instant::now();
        expected.expect_add(NodeHandle(5), "ours.txt", now);
        assert!(!expected.attributable(&added(5, "theirs.txt"), now));
    }

    #[test]
    fn expectations_expire() {
        let mut expected = ExpectedCloudActions::default();
        let t0 = Instant::now();
        expected.expect_add(NodeHandle(5), "old.txt", t0);
        let later = t0 + ATTRIBUTION_WINDOW + Duration::from_secs(1);
        assert!(!expected.attributable(&added(5, "old.txt"), later));
    }

    #[test]
    fn touch_covers_multiple_events() {
        let mut expected = ExpectedCloudActions::default();
        let now = Instant::now();
        expected.expect_touch(NodeHandle(7), now);
        let event = CloudEvent {
            kind: CloudEventKind::Renamed,
            handle: NodeHandle(7),
            parent: NodeHandle(1),
            name: "x".into(),
        };
        assert!(expected.attributable(&event, now));
        assert!(expected.attributable(&event, now));
    }

    #[test]
    fn resume_rules() {
        assert_eq!(
            resume_backup_state(Some(BackupState::Monitor), false),
            BackupState::Monitor
        );
        assert_eq!(
            resume_backup_state(Some(BackupState::Mirror), false),
            BackupState::Mirror
        );
        assert_eq!(resume_backup_state(None, false), BackupState::Mirror);
        // external drives always remirror
        assert_eq!(
            resume_backup_state(Some(BackupState::Monitor), true),
            BackupState::Mirror
        );
    }
}
