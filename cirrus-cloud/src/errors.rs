//! Error types for cloud operations

use thiserror::Error;

use crate::node::NodeHandle;

#[derive(Error, Debug, Clone)]
pub enum CloudError {
    #[error("node not found: {0:?}")]
    NotFound(NodeHandle),

    #[error("target name already exists under {0:?}")]
    NameExists(NodeHandle),

    #[error("over quota")]
    OverQuota,

    #[error("transient cloud error: {0}")]
    Transient(String),

    #[error("cloud API error: {0}")]
    Api(String),
}

impl CloudError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_) | CloudError::OverQuota)
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
