//! Error types for the transport and decode layer.

use thiserror::Error;

/// Errors that can occur while fetching or decoding a repository snapshot.
#[derive(Debug, Error)]
pub enum RepoSyncError {
    /// Connectivity failure before any HTTP status was received.
    #[error("network failure: {0}")]
    Network(String),

    /// Non-success HTTP response.
    #[error("HTTP error: {status}")]
    Http { status: u16 },

    /// Request deadline exceeded; the in-flight request was cancelled.
    #[error("deadline of {deadline_ms}ms exceeded")]
    Timeout { deadline_ms: u64 },

    /// A single record payload failed to decode. Always contained at the
    /// entry level by the decoder, never escalated past it.
    #[error("record decode failed: {0}")]
    Decode(String),

    /// The remote rejected the `since` parameter; the caller must re-issue
    /// the request as a full snapshot fetch.
    #[error("remote does not support incremental fetch")]
    IncrementalUnsupported,

    /// CAR container parsing error.
    #[error("CAR parse error: {0}")]
    CarParse(String),

    /// Response body did not match the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RepoSyncError {
    /// Transient failures worth retrying with backoff.
    ///
    /// Timeouts are deliberately excluded: they trigger endpoint fallback
    /// instead of a retry on the same endpoint.
    pub fn is_transient(&self) -> bool {
        match self {
            RepoSyncError::Network(_) => true,
            RepoSyncError::Http { status } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RepoSyncError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => RepoSyncError::Http {
                status: status.as_u16(),
            },
            None => RepoSyncError::Network(e.to_string()),
        }
    }
}
