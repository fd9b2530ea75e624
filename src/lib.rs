//! Cirrus integration tests and workspace root
//!
//! This crate serves as the root of the cirrus workspace and contains
//! integration tests exercising the whole engine: a real filesystem under
//! a temp directory, the in-memory cloud, and the sync core between them.

// Re-export major components for integration testing
pub use cirrus_cloud as cloud;
pub use cirrus_fs as fs;
pub use cirrus_sync as sync;
