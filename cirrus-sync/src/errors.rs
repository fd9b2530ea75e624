//! Error types for the sync core
//!
//! Stalls and name conflicts are not errors; they are reconciler outputs
//! (see `stall`). Errors here are operational failures: I/O on the state
//! cache or config store, malformed persisted data, invalid requests.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("filesystem: {0}")]
    Fs(#[from] cirrus_fs::FsError),

    #[error("cloud: {0}")]
    Cloud(#[from] cirrus_cloud::CloudError),

    #[error("state cache: {0}")]
    StateCache(#[from] rusqlite::Error),

    #[error("config serialization: {0}")]
    ConfigFormat(#[from] serde_json::Error),

    #[error("config I/O: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config slot failed authentication")]
    ConfigAuth,

    #[error("invalid sync: {0}")]
    InvalidSync(String),

    #[error("unknown sync: {0:#x}")]
    UnknownSync(u64),

    #[error("state record version {0:#010x} not supported")]
    UnsupportedCacheVersion(u32),

    #[error("corrupt state cache record")]
    CorruptCacheRecord,

    #[error("engine has shut down")]
    EngineDown,

    #[error("timed out waiting for the sync thread")]
    SyncRunTimeout,
}

pub type Result<T> = std::result::Result<T, SyncError>;
