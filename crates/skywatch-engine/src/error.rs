//! Error types for the sync engine.

use thiserror::Error;

use skywatch_atproto::RepoSyncError;

use crate::store::StoreError;

/// Errors surfaced by sync orchestration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport or decode failure.
    #[error(transparent)]
    Transport(#[from] RepoSyncError),

    /// Persistent-store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cache record serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
