// Project quota limits for image metadata
use live_image_common::ComputeError;
use thiserror::Error;

mod enforcer;
mod storage;
mod types;

pub use enforcer::QuotaEnforcer;
pub use storage::{InMemoryQuotaStorage, QuotaStorage};
pub use types::*;

/// Longest image metadata key accepted.
pub const MAX_METADATA_KEY_LEN: usize = 255;

// Error Types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Unknown quota resource: {0}")]
    UnknownResource(String),
    #[error("Quota exceeded for {resource}: requested {requested}, limit {limit}")]
    OverQuota {
        resource: Resource,
        requested: u64,
        limit: u64,
    },
    #[error("{0}")]
    InvalidMetadata(String),
}

pub type Result<T> = std::result::Result<T, QuotaError>;

impl From<QuotaError> for ComputeError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::OverQuota {
                resource,
                requested,
                limit,
            } => ComputeError::OverQuota {
                resource: resource.to_string(),
                requested,
                limit,
            },
            QuotaError::InvalidMetadata(msg) => ComputeError::InvalidMetadata(msg),
            QuotaError::Storage(msg) | QuotaError::UnknownResource(msg) => {
                ComputeError::Internal(msg)
            }
        }
    }
}
