//! AT Protocol snapshot transport and repository decoding.
//!
//! This crate covers the wire layer of skywatch:
//!
//! - **Transport**: fetches repository snapshots (CAR files) over HTTP with
//!   endpoint fallback, deadlines, and streamed progress reporting.
//! - **Decoder**: walks the CAR container and the repository MST, turning
//!   every entry into a typed [`DomainRecord`] while containing per-entry
//!   decode failures.
//! - **Types**: the record structs, the unified [`GraphOperation`] view over
//!   graph writes, and AT-URI helpers.

pub mod car;
mod error;
mod records;
mod transport;
mod types;
mod uri;

pub use car::{DecodeOutcome, decode_entries, decode_repo};
pub use error::RepoSyncError;
pub use records::{
    BLOCK_COLLECTION, FOLLOW_COLLECTION, LIST_COLLECTION, LIST_ITEM_COLLECTION, POST_COLLECTION,
};
pub use transport::{
    CarTransport, DEFAULT_DOWNLOAD_DEADLINE, DownloadOptions, DownloadProgress,
    DownloadProgressFn, FALLBACK_ENDPOINT,
};
pub use types::{
    BlockRecord, DecodedRecord, DomainRecord, FollowRecord, GraphOpKind, GraphOperation,
    LatestCommit, ListItemRecord, ListRecord, PostRecord, ReplyRef, RepositoryEntry, StrongRef,
};
pub use uri::{AtUri, AtUriError};
