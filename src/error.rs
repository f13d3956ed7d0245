//! Error types for the batch loader.

use thiserror::Error;

use crate::batch::BatchId;

/// Result type alias using the mediabatch error type.
pub type Result<T> = std::result::Result<T, MediaBatchError>;

/// Main error type for batch loading.
///
/// Per-item resolution failures are not errors: resolvers report them as absent
/// outcomes and the batch carries on without the item.
#[derive(Error, Debug)]
pub enum MediaBatchError {
    /// The batch holds more handles than the loader accepts
    #[error("Invalid batch size: {size} handles exceeds the limit of {limit}")]
    InvalidBatchSize { size: usize, limit: usize },

    /// Loader configuration cannot be used
    #[error("Invalid loader configuration: {0}")]
    InvalidConfig(String),

    /// The batch was cancelled before it completed
    #[error("Batch cancelled: {0}")]
    BatchCancelled(BatchId),

    /// Loader is shutting down
    #[error("Loader is shutting down")]
    Shutdown,

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
