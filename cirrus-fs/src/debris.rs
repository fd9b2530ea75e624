//! Local debris folder
//!
//! Deletions performed by the reconciler never destroy data outright: the
//! victim is moved into `<root>/.debris/<YYYY-MM-DD>/`. Day folders are
//! created lazily. If the target name is taken, suffixed day folders
//! (` hh.mm.ss.NN`, NN in 0..100) are tried before giving up. A lock file
//! under `.debris/tmp/` is held for the sync's lifetime so OS cleanup tools
//! leave the folder alone.

use std::any::Any;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, warn};

use crate::adapter::Filesystem;
use crate::errors::Result;

pub const DEBRIS_DIR: &str = ".debris";
const DEBRIS_TMP: &str = "tmp";
const SUFFIX_ATTEMPTS: u32 = 100;

#[derive(Debug, PartialEq, Eq)]
pub enum DebrisOutcome {
    /// Moved; the new resting place is returned.
    Moved(PathBuf),
    /// A transient error; the caller should retry on a later pass.
    Transient,
    /// All candidate day folders were exhausted or could not be created.
    Exhausted,
}

pub struct Debris {
    debris: PathBuf,
    tmp_lock: Option<Box<dyn Any + Send>>,
}

impl Debris {
    pub fn new(sync_root: &Path) -> Self {
        Self {
            debris: sync_root.join(DEBRIS_DIR),
            tmp_lock: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.debris
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.debris)
    }

    /// Create `.debris/tmp/` and hold a lock file there until drop.
    pub fn acquire_tmp_lock(&mut self, fs: &dyn Filesystem) -> Result<()> {
        if self.tmp_lock.is_some() {
            return Ok(());
        }
        let tmp = self.debris.join(DEBRIS_TMP);
        let _ = fs.mkdir(&self.debris);
        let _ = fs.mkdir(&tmp);
        let lock = fs.create_lock_file(&tmp.join("lock"))?;
        self.tmp_lock = Some(lock);
        Ok(())
    }

    /// Move `victim` into today's debris folder.
    pub fn move_to_debris(&mut self, fs: &dyn Filesystem, victim: &Path) -> DebrisOutcome {
        let leaf = match victim.file_name() {
            Some(leaf) => leaf.to_owned(),
            None => return DebrisOutcome::Exhausted,
        };

        let now = Local::now();
        let day = now.format("%Y-%m-%d").to_string();

        // First candidate is the plain day folder; subsequent ones carry a
        // time-of-day suffix plus attempt index.
        for attempt in 0..=SUFFIX_ATTEMPTS {
            let folder_name = if attempt == 0 {
                day.clone()
            } else {
                format!("{} {}.{:02}", day, now.format("%H.%M.%S"), attempt - 1)
            };
            let folder = self.debris.join(&folder_name);

            let _ = fs.mkdir(&self.debris);
            let _ = fs.mkdir(&folder);

            let target = folder.join(&leaf);
            match fs.rename(victim, &target) {
                Ok(()) => {
                    debug!("moved {:?} to debris at {:?}", victim, target);
                    return DebrisOutcome::Moved(target);
                }
                Err(e) if e.is_transient() => return DebrisOutcome::Transient,
                Err(_) => {
                    if fs.open(&target).is_ok() {
                        // Name collision inside this day folder; try the
                        // next suffixed folder.
                        continue;
                    }
                    if fs.open(&folder).is_err() {
                        // Day folder could not be created at all.
                        warn!("cannot create debris folder {:?}", folder);
                        return DebrisOutcome::Exhausted;
                    }
                    continue;
                }
            }
        }

        warn!("debris suffixes exhausted for {:?}", victim);
        DebrisOutcome::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StdFilesystem;

    #[test]
    fn moves_file_into_day_folder() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("doomed.txt");
        std::fs::write(&victim, b"x").unwrap();

        let fs = StdFilesystem::new();
        let mut debris = Debris::new(dir.path());
        match debris.move_to_debris(&fs, &victim) {
            DebrisOutcome::Moved(target) => {
                assert!(!victim.exists());
                assert!(target.exists());
                assert!(target.starts_with(dir.path().join(DEBRIS_DIR)));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn name_collision_uses_suffixed_folder() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFilesystem::new();
        let mut debris = Debris::new(dir.path());

        let first = dir.path().join("same.txt");
        std::fs::write(&first, b"1").unwrap();
        let DebrisOutcome::Moved(first_target) = debris.move_to_debris(&fs, &first) else {
            panic!("first move failed");
        };

        let second = dir.path().join("same.txt");
        std::fs::write(&second, b"2").unwrap();
        let DebrisOutcome::Moved(second_target) = debris.move_to_debris(&fs, &second) else {
            panic!("second move failed");
        };

        assert_ne!(first_target, second_target);
        assert!(second_target.exists());
    }

    #[test]
    fn tmp_lock_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFilesystem::new();
        let mut debris = Debris::new(dir.path());
        debris.acquire_tmp_lock(&fs).unwrap();
        assert!(dir.path().join(".debris/tmp/lock").exists());
    }

    #[test]
    fn contains_detects_debris_paths() {
        let dir = tempfile::tempdir().unwrap();
        let debris = Debris::new(dir.path());
        assert!(debris.contains(&dir.path().join(".debris/2026-08-02/x")));
        assert!(!debris.contains(&dir.path().join("normal/x")));
    }
}
