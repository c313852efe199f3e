//! Revision-tracked repository sync, bounded caching, and mass-operation
//! detection.
//!
//! This crate is the stateful half of skywatch:
//!
//! - **Sync planning**: decides per identity whether a sync is needed at all,
//!   and whether it can be incremental, from a lightweight revision check.
//! - **Merge engine**: folds incremental decode results into cached derived
//!   state (additions only; see [`merge`] for the tombstone limitation).
//! - **Bounded cache store**: persists derived state per identity under a
//!   byte ceiling, evicting least-recently-synced entries.
//! - **Mass-operation detector**: clusters temporal bursts of same-kind
//!   graph operations.

pub mod config;
pub mod detector;
mod error;
pub mod locks;
pub mod merge;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use detector::{MassOperationCluster, detect_clusters};
pub use error::EngineError;
pub use locks::{IdentityGuard, IdentityLocks};
pub use merge::{MergeOutcome, build_full_state, merge};
pub use store::{
    BoundedCacheStore, CachedDerivedState, KeyValueStore, ListResource, MemoryStore,
    RevisionState, StoreError,
};
pub use sync::{
    BatchReport, ProgressFn, RepoSynchronizer, SyncOutcome, SyncPlan, SyncReport,
};
