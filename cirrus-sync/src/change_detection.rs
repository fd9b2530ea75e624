//! Change detection
//!
//! Two modes per sync: platform notifications feeding a coalescing queue
//! with a quiet-time delay (longer on network filesystems), or periodic
//! full rescans on a configured interval. A failed notification subsystem
//! fails the sync unless periodic scanning is configured, in which case the
//! engine falls back transparently.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use cirrus_fs::NotifyEvent;

/// Quiet time after the last notification before scans are processed.
pub const NOTIFY_QUIET_TIME: Duration = Duration::from_millis(500);
/// Network filesystems deliver notifications late and in bursts.
pub const NOTIFY_QUIET_TIME_NETWORK: Duration = Duration::from_secs(2);

#[derive(Debug, PartialEq, Eq)]
pub enum NotifyDrain {
    /// Nothing new.
    Idle,
    /// Paths changed; rescan the nearest nodes.
    Changed(Vec<PathBuf>),
    /// The platform queue overflowed; rescan everything.
    Overflowed,
    /// The watcher is gone for good.
    Failed,
}

/// Per-sync notification queue.
pub struct NotifyQueue {
    rx: Option<mpsc::UnboundedReceiver<NotifyEvent>>,
    pending: Vec<PathBuf>,
    overflowed: bool,
    failed: bool,
    last_event: Option<Instant>,
    quiet_time: Duration,
}

impl NotifyQueue {
    pub fn new(is_network: bool) -> Self {
        Self {
            rx: None,
            pending: Vec::new(),
            overflowed: false,
            failed: false,
            last_event: None,
            quiet_time: if is_network {
                NOTIFY_QUIET_TIME_NETWORK
            } else {
                NOTIFY_QUIET_TIME
            },
        }
    }

    pub fn attach(&mut self, rx: mpsc::UnboundedReceiver<NotifyEvent>) {
        self.rx = Some(rx);
    }

    pub fn watching(&self) -> bool {
        self.rx.is_some() && !self.failed
    }

    /// Pull everything the watcher delivered so far into the pending set.
    /// Consecutive duplicates for the same path coalesce.
    pub fn pump(&mut self, now: Instant) {
        let Some(rx) = self.rx.as_mut() else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(NotifyEvent::Changed(path)) => {
                    self.last_event = Some(now);
                    if self.pending.last() != Some(&path) {
                        self.pending.push(path);
                    }
                }
                Ok(NotifyEvent::Overflow) => {
                    self.last_event = Some(now);
                    self.overflowed = true;
                    self.pending.clear();
                }
                Ok(NotifyEvent::Failed(reason)) => {
                    warn!("notification subsystem failed: {}", reason);
                    self.failed = true;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.failed = true;
                    break;
                }
            }
        }
    }

    /// Hand out pending work once the burst has gone quiet.
    pub fn drain(&mut self, now: Instant) -> NotifyDrain {
        if self.failed {
            return NotifyDrain::Failed;
        }
        if self.overflowed {
            self.overflowed = false;
            self.pending.clear();
            return NotifyDrain::Overflowed;
        }
        if self.pending.is_empty() {
            return NotifyDrain::Idle;
        }
        if let Some(last) = self.last_event {
            if now.duration_since(last) < self.quiet_time {
                debug!("holding {} notifications for quiet time", self.pending.len());
                return NotifyDrain::Idle;
            }
        }
        NotifyDrain::Changed(std::mem::take(&mut self.pending))
    }
}

/// Periodic rescan schedule.
pub struct ScanSchedule {
    interval: Duration,
    next_due: Instant,
}

impl ScanSchedule {
    pub fn new(interval_secs: u64, now: Instant) -> Self {
        let interval = Duration::from_secs(interval_secs.max(1));
        Self {
            interval,
            next_due: now + interval,
        }
    }

    pub fn due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub fn reschedule(&mut self, now: Instant) {
        self.next_due = now + self.interval;
    }

    /// Test hook: force the next check to fire.
    pub fn trigger_early(&mut self) {
        self.next_due = Instant::now() - Duration::from_millis(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_consecutive_duplicates() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = NotifyQueue::new(false);
        queue.attach(rx);

        let now = Instant::now();
        tx.send(NotifyEvent::Changed(PathBuf::from("/r/a"))).unwrap();
        tx.send(NotifyEvent::Changed(PathBuf::from("/r/a"))).unwrap();
        tx.send(NotifyEvent::Changed(PathBuf::from("/r/b"))).unwrap();
        queue.pump(now);

        let after_quiet = now + NOTIFY_QUIET_TIME + Duration::from_millis(1);
        match queue.drain(after_quiet) {
            NotifyDrain::Changed(paths) => {
                assert_eq!(paths, vec![PathBuf::from("/r/a"), PathBuf::from("/r/b")]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn quiet_time_holds_bursts() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = NotifyQueue::new(false);
        queue.attach(rx);

        let now = Instant::now();
        tx.send(NotifyEvent::Changed(PathBuf::from("/r/a"))).unwrap();
        queue.pump(now);
        assert_eq!(queue.drain(now), NotifyDrain::Idle);
        assert_ne!(
            queue.drain(now + NOTIFY_QUIET_TIME + Duration::from_millis(1)),
            NotifyDrain::Idle
        );
    }

    #[test]
    fn overflow_requests_full_rescan() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = NotifyQueue::new(false);
        queue.attach(rx);

        let now = Instant::now();
        tx.send(NotifyEvent::Changed(PathBuf::from("/r/a"))).unwrap();
        tx.send(NotifyEvent::Overflow).unwrap();
        queue.pump(now);
        assert_eq!(queue.drain(now), NotifyDrain::Overflowed);
        assert_eq!(queue.drain(now), NotifyDrain::Idle);
    }

    #[test]
    fn watcher_failure_is_sticky() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = NotifyQueue::new(false);
        queue.attach(rx);
        tx.send(NotifyEvent::Failed("inotify limit".into())).unwrap();
        queue.pump(Instant::now());
        assert_eq!(queue.drain(Instant::now()), NotifyDrain::Failed);
        assert!(!queue.watching());
    }

    #[test]
    fn schedule_fires_and_reschedules() {
        let now = Instant::now();
        let mut schedule = ScanSchedule::new(3600, now);
        assert!(!schedule.due(now));
        schedule.trigger_early();
        assert!(schedule.due(Instant::now()));
        schedule.reschedule(Instant::now());
        assert!(!schedule.due(Instant::now()));
    }
}
