//! Error types for filesystem operations

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("transient filesystem error on {path}: {source}")]
    Transient { path: PathBuf, source: io::Error },

    #[error("permanent filesystem error on {path}: {source}")]
    Permanent { path: PathBuf, source: io::Error },

    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("scan service has shut down")]
    ScanServiceDown,
}

impl FsError {
    /// Classify an I/O error as transient or permanent.
    ///
    /// Transient errors defer the affected row; permanent errors surface to
    /// the caller. Retryable kinds are the ones a later pass can plausibly
    /// clear without user action.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                FsError::Transient {
                    path: path.to_path_buf(),
                    source,
                }
            }
            _ => FsError::Permanent {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Transient { .. })
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
