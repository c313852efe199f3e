//! Size-bounded persistence of derived sync state.
//!
//! The store persists one [`CachedDerivedState`] plus one [`RevisionState`]
//! per identity, and deduplicated [`ListResource`] records shared across
//! identities, all on top of a generic key/value backend. Writes that would
//! push the total serialized size past the ceiling evict other identities,
//! least-recently-synced first, down to a hysteresis target of 80% of the
//! ceiling.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Fraction of the ceiling eviction drains to, so back-to-back writes near
/// the limit don't thrash.
const EVICTION_HYSTERESIS: f64 = 0.8;

const IDENTITY_INDEX_KEY: &str = "skywatch:identities";
const LIST_INDEX_KEY: &str = "skywatch:lists";

fn state_key(identity: &str) -> String {
    format!("skywatch:state:{identity}")
}

fn revision_key(identity: &str) -> String {
    format!("skywatch:rev:{identity}")
}

fn list_key(uri: &str) -> String {
    format!("skywatch:list:{uri}")
}

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend failure (I/O, quota negotiation, etc.).
    #[error("store backend error: {0}")]
    Backend(String),

    /// A write would exceed the backend's own quota.
    #[error("write of {needed} bytes exceeds store quota")]
    QuotaExceeded { needed: u64 },

    /// A persisted record failed to round-trip.
    #[error("corrupt cache record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Revision bookkeeping for one identity.
///
/// Created on first sync, overwritten on each subsequent sync, and cleared
/// only as part of cache-entry removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionState {
    pub identity: String,
    /// Opaque host-issued token; compared only for equality, never ordered.
    pub revision: String,
    pub downloaded_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub per_collection_counts: HashMap<String, usize>,
}

/// Derived moderation state cached per identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDerivedState {
    pub identity: String,
    pub handle: Option<String>,
    /// DIDs directly blocked by this identity.
    pub direct_blocks: BTreeSet<String>,
    /// DIDs followed by this identity.
    pub follows: BTreeSet<String>,
    /// List URIs this identity owns or references.
    pub subscribed_lists: BTreeSet<String>,
    pub last_sync: DateTime<Utc>,
    pub repo_rev: String,
}

impl CachedDerivedState {
    /// Empty state for an identity, stamped with the current time.
    pub fn empty(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            handle: None,
            direct_blocks: BTreeSet::new(),
            follows: BTreeSet::new(),
            subscribed_lists: BTreeSet::new(),
            last_sync: Utc::now(),
            repo_rev: String::new(),
        }
    }
}

/// List contents shared across identities, swept when unreferenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResource {
    pub uri: String,
    pub members: BTreeSet<String>,
    pub last_sync: DateTime<Utc>,
}

impl ListResource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            members: BTreeSet::new(),
            last_sync: Utc::now(),
        }
    }
}

/// Generic key/value persistence contract.
///
/// The engine has no dependency on any particular storage engine beyond
/// this trait; callers supply the backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    /// Estimated serialized size of everything currently stored.
    async fn estimated_size(&self) -> Result<u64, StoreError>;
}

/// In-memory [`KeyValueStore`], used as the reference backend and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
    quota_bytes: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects writes once the total size would pass `bytes`.
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            quota_bytes: Some(bytes),
        }
    }

    fn total_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| (e.key().len() + e.value().len()) as u64)
            .sum()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        if let Some(quota) = self.quota_bytes {
            let existing = self
                .entries
                .get(key)
                .map(|e| (e.key().len() + e.value().len()) as u64)
                .unwrap_or(0);
            let needed = (key.len() + value.len()) as u64;
            if self.total_size() - existing + needed > quota {
                return Err(StoreError::QuotaExceeded { needed });
            }
        }
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn estimated_size(&self) -> Result<u64, StoreError> {
        Ok(self.total_size())
    }
}

/// Size-bounded cache over a [`KeyValueStore`] backend.
pub struct BoundedCacheStore<S: KeyValueStore> {
    backend: S,
    ceiling_bytes: u64,
    /// Serializes index read-modify-write and eviction. The identity and
    /// list indexes live on shared keys, so two concurrent writers for
    /// different identities would otherwise lose each other's entries.
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore> BoundedCacheStore<S> {
    pub fn new(backend: S, ceiling_bytes: u64) -> Self {
        Self {
            backend,
            ceiling_bytes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Identities currently cached.
    pub async fn identities(&self) -> Result<Vec<String>, StoreError> {
        self.read_index(IDENTITY_INDEX_KEY).await
    }

    pub async fn read_state(
        &self,
        identity: &str,
    ) -> Result<Option<CachedDerivedState>, StoreError> {
        self.read_record(&state_key(identity)).await
    }

    /// Persist derived state for an identity, evicting other identities
    /// (least-recently-synced first) when the write would pass the ceiling.
    pub async fn write_state(&self, state: &CachedDerivedState) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let key = state_key(&state.identity);
        let payload = encode(&key, state)?;

        let current = self.backend.estimated_size().await?;
        if current + payload.len() as u64 > self.ceiling_bytes {
            let target = eviction_target(self.ceiling_bytes);
            debug!(
                identity = %state.identity,
                current,
                ceiling = self.ceiling_bytes,
                target,
                "cache over ceiling, evicting"
            );
            self.evict_to(target, Some(&state.identity)).await?;
        }

        // A quota rejection from the backend gets one prune-and-retry pass;
        // if space still cannot be freed the failure surfaces to the caller
        // with the in-memory state intact.
        match self.backend.set(&key, payload.clone()).await {
            Err(StoreError::QuotaExceeded { needed }) => {
                warn!(
                    identity = %state.identity,
                    needed,
                    "store quota exceeded, pruning and retrying once"
                );
                // The backend quota may sit below the configured ceiling, so
                // free space relative to what is actually stored.
                let current = self.backend.estimated_size().await?;
                self.evict_to(current.saturating_sub(needed), Some(&state.identity))
                    .await?;
                self.backend.set(&key, payload).await?;
            }
            other => other?,
        }

        let mut index = self.read_index(IDENTITY_INDEX_KEY).await?;
        if !index.iter().any(|i| i == &state.identity) {
            index.push(state.identity.clone());
            self.write_index(IDENTITY_INDEX_KEY, &index).await?;
        }
        Ok(())
    }

    pub async fn read_revision(&self, identity: &str) -> Result<Option<RevisionState>, StoreError> {
        self.read_record(&revision_key(identity)).await
    }

    pub async fn write_revision(&self, revision: &RevisionState) -> Result<(), StoreError> {
        let key = revision_key(&revision.identity);
        let payload = encode(&key, revision)?;
        self.backend.set(&key, payload).await
    }

    pub async fn read_list(&self, uri: &str) -> Result<Option<ListResource>, StoreError> {
        self.read_record(&list_key(uri)).await
    }

    pub async fn write_list(&self, list: &ListResource) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let key = list_key(&list.uri);
        let payload = encode(&key, list)?;
        self.backend.set(&key, payload).await?;

        let mut index = self.read_index(LIST_INDEX_KEY).await?;
        if !index.iter().any(|u| u == &list.uri) {
            index.push(list.uri.clone());
            self.write_index(LIST_INDEX_KEY, &index).await?;
        }
        Ok(())
    }

    /// Remove an identity's derived state and revision bookkeeping.
    pub async fn remove_identity(&self, identity: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.remove_identity_locked(identity).await
    }

    /// Remove list resources no current identity references.
    ///
    /// Independent of size pressure; call periodically or after identity
    /// removal. Returns the number of lists removed.
    pub async fn sweep_orphans(&self) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.sweep_orphans_locked().await
    }

    /// Evict least-recently-synced identities until total size is at most
    /// `max_bytes`. Returns the number of identities removed; no-op when
    /// already within bounds.
    ///
    /// The most recently synced identity is spared unless its own records
    /// alone cannot fit within the bound.
    pub async fn prune(&self, max_bytes: u64) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self.backend.estimated_size().await?;
        if current <= max_bytes {
            return Ok(0);
        }

        let mut newest: Option<(String, DateTime<Utc>)> = None;
        for identity in self.read_index(IDENTITY_INDEX_KEY).await? {
            if let Some(state) = self.read_state(&identity).await? {
                if newest
                    .as_ref()
                    .map_or(true, |(_, last)| state.last_sync > *last)
                {
                    newest = Some((identity, state.last_sync));
                }
            }
        }
        let exclude = match newest {
            Some((identity, _)) if self.identity_size(&identity).await? <= max_bytes => {
                Some(identity)
            }
            _ => None,
        };

        self.evict_to(eviction_target(max_bytes), exclude.as_deref())
            .await
    }

    async fn remove_identity_locked(&self, identity: &str) -> Result<(), StoreError> {
        self.backend.remove(&state_key(identity)).await?;
        self.backend.remove(&revision_key(identity)).await?;

        let mut index = self.read_index(IDENTITY_INDEX_KEY).await?;
        index.retain(|i| i != identity);
        self.write_index(IDENTITY_INDEX_KEY, &index).await?;
        debug!(identity = %identity, "removed cached identity");
        Ok(())
    }

    async fn sweep_orphans_locked(&self) -> Result<usize, StoreError> {
        let mut referenced: HashSet<String> = HashSet::new();
        for identity in self.identities().await? {
            if let Some(state) = self.read_state(&identity).await? {
                referenced.extend(state.subscribed_lists);
            }
        }

        let index = self.read_index(LIST_INDEX_KEY).await?;
        let mut kept = Vec::with_capacity(index.len());
        let mut removed = 0;
        for uri in index {
            if referenced.contains(&uri) {
                kept.push(uri);
            } else {
                self.backend.remove(&list_key(&uri)).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            self.write_index(LIST_INDEX_KEY, &kept).await?;
            debug!(removed, "swept orphaned list resources");
        }
        Ok(removed)
    }

    /// Serialized size of one identity's state and revision records.
    async fn identity_size(&self, identity: &str) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for key in [state_key(identity), revision_key(identity)] {
            if let Some(bytes) = self.backend.get(&key).await? {
                total += (key.len() + bytes.len()) as u64;
            }
        }
        Ok(total)
    }

    /// Evict identities by ascending `last_sync` until size falls to
    /// `target`, never touching `exclude`. Orphaned lists are swept after
    /// removals so their bytes count toward the freed space. Callers must
    /// hold `write_lock`.
    async fn evict_to(&self, target: u64, exclude: Option<&str>) -> Result<usize, StoreError> {
        let mut candidates: Vec<(String, DateTime<Utc>)> = Vec::new();
        for identity in self.identities().await? {
            if exclude == Some(identity.as_str()) {
                continue;
            }
            let last_sync = self
                .read_state(&identity)
                .await?
                .map(|s| s.last_sync)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            candidates.push((identity, last_sync));
        }
        candidates.sort_by_key(|(_, last_sync)| *last_sync);

        let mut evicted = 0;
        for (identity, _) in candidates {
            if self.backend.estimated_size().await? <= target {
                break;
            }
            self.remove_identity_locked(&identity).await?;
            self.sweep_orphans_locked().await?;
            evicted += 1;
        }

        if evicted > 0 {
            debug!(evicted, target, "evicted least-recently-synced identities");
        }
        Ok(evicted)
    }

    async fn read_record<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.backend.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn read_index(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.read_record(key).await?.unwrap_or_default())
    }

    async fn write_index(&self, key: &str, index: &[String]) -> Result<(), StoreError> {
        let payload = encode(key, &index)?;
        self.backend.set(key, payload).await
    }
}

fn eviction_target(limit: u64) -> u64 {
    (limit as f64 * EVICTION_HYSTERESIS) as u64
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;

    fn state_at(identity: &str, hour: u32) -> CachedDerivedState {
        let mut state = CachedDerivedState::empty(identity);
        state.last_sync = Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap();
        state.repo_rev = format!("rev-{identity}");
        // Pad the record so a handful of identities can cross small ceilings.
        state.direct_blocks = (0..32).map(|i| format!("did:plc:padding{i:04}")).collect();
        state
    }

    #[tokio::test]
    async fn test_roundtrip_state_and_revision() {
        let store = BoundedCacheStore::new(MemoryStore::new(), 1 << 20);
        let state = state_at("did:plc:alice", 10);
        store.write_state(&state).await.unwrap();

        let read = store.read_state("did:plc:alice").await.unwrap().unwrap();
        assert_eq!(read, state);
        assert_eq!(store.identities().await.unwrap(), vec!["did:plc:alice"]);

        let revision = RevisionState {
            identity: "did:plc:alice".to_string(),
            revision: "rev-1".to_string(),
            downloaded_at: Utc::now(),
            size_bytes: 1234,
            per_collection_counts: HashMap::new(),
        };
        store.write_revision(&revision).await.unwrap();
        let read = store.read_revision("did:plc:alice").await.unwrap().unwrap();
        assert_eq!(read.revision, "rev-1");
    }

    #[tokio::test]
    async fn test_write_evicts_least_recently_synced_first() {
        let one_entry = serde_json::to_vec(&state_at("did:plc:x", 0)).unwrap().len() as u64;
        // Room for roughly two identities plus bookkeeping.
        let store = BoundedCacheStore::new(MemoryStore::new(), one_entry * 5 / 2);

        store.write_state(&state_at("did:plc:old", 1)).await.unwrap();
        store.write_state(&state_at("did:plc:mid", 2)).await.unwrap();
        store.write_state(&state_at("did:plc:new", 3)).await.unwrap();

        let identities = store.identities().await.unwrap();
        // The identity just written must survive; the oldest goes first.
        assert!(identities.contains(&"did:plc:new".to_string()));
        assert!(!identities.contains(&"did:plc:old".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_writes_keep_every_identity_indexed() {
        let store = Arc::new(BoundedCacheStore::new(MemoryStore::new(), 1 << 24));

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .write_state(&state_at(&format!("did:plc:id{i:02}"), 1))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Index read-modify-write is serialized: no entry may be lost.
        let identities = store.identities().await.unwrap();
        assert_eq!(identities.len(), 32);
    }

    #[tokio::test]
    async fn test_prune_reaches_bound_and_reports_count() {
        let store = BoundedCacheStore::new(MemoryStore::new(), 1 << 20);
        for (i, hour) in [1u32, 2, 3, 4].iter().enumerate() {
            store
                .write_state(&state_at(&format!("did:plc:id{i}"), *hour))
                .await
                .unwrap();
        }

        let size = store.backend().estimated_size().await.unwrap();
        let max = size / 2;
        let removed = store.prune(max).await.unwrap();
        assert!(removed >= 1);
        assert!(store.backend().estimated_size().await.unwrap() <= max);

        // Most recently synced identity survives.
        let identities = store.identities().await.unwrap();
        assert!(identities.contains(&"did:plc:id3".to_string()));
    }

    #[tokio::test]
    async fn test_prune_spares_newest_identity_that_fits() {
        let store = BoundedCacheStore::new(MemoryStore::new(), 1 << 20);
        store.write_state(&state_at("did:plc:old", 1)).await.unwrap();
        store.write_state(&state_at("did:plc:new", 2)).await.unwrap();

        let one_entry = serde_json::to_vec(&state_at("did:plc:x", 0)).unwrap().len() as u64;
        // The bound fits the newest identity alone, but not both.
        let max = one_entry * 3 / 2;
        let removed = store.prune(max).await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.identities().await.unwrap(), vec!["did:plc:new"]);
        assert!(store.backend().estimated_size().await.unwrap() <= max);
    }

    #[tokio::test]
    async fn test_prune_evicts_newest_only_when_it_cannot_fit() {
        let store = BoundedCacheStore::new(MemoryStore::new(), 1 << 20);
        store.write_state(&state_at("did:plc:old", 1)).await.unwrap();
        store.write_state(&state_at("did:plc:new", 2)).await.unwrap();

        // No identity fits in 64 bytes on its own.
        let removed = store.prune(64).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_noop_when_within_bound() {
        let store = BoundedCacheStore::new(MemoryStore::new(), 1 << 20);
        store.write_state(&state_at("did:plc:alice", 1)).await.unwrap();
        let removed = store.prune(1 << 20).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_sweep_orphans_keeps_referenced_lists() {
        let store = BoundedCacheStore::new(MemoryStore::new(), 1 << 20);

        let mut state = state_at("did:plc:alice", 1);
        state
            .subscribed_lists
            .insert("at://did:plc:alice/app.bsky.graph.list/keep".to_string());
        store.write_state(&state).await.unwrap();

        store
            .write_list(&ListResource::new(
                "at://did:plc:alice/app.bsky.graph.list/keep",
            ))
            .await
            .unwrap();
        store
            .write_list(&ListResource::new(
                "at://did:plc:gone/app.bsky.graph.list/orphan",
            ))
            .await
            .unwrap();

        let removed = store.sweep_orphans().await.unwrap();
        assert_eq!(removed, 1);
        assert!(
            store
                .read_list("at://did:plc:alice/app.bsky.graph.list/keep")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .read_list("at://did:plc:gone/app.bsky.graph.list/orphan")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_remove_identity_clears_revision() {
        let store = BoundedCacheStore::new(MemoryStore::new(), 1 << 20);
        store.write_state(&state_at("did:plc:alice", 1)).await.unwrap();
        store
            .write_revision(&RevisionState {
                identity: "did:plc:alice".to_string(),
                revision: "rev-1".to_string(),
                downloaded_at: Utc::now(),
                size_bytes: 0,
                per_collection_counts: HashMap::new(),
            })
            .await
            .unwrap();

        store.remove_identity("did:plc:alice").await.unwrap();
        assert!(store.read_state("did:plc:alice").await.unwrap().is_none());
        assert!(store.read_revision("did:plc:alice").await.unwrap().is_none());
        assert!(store.identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_exceeded_triggers_prune_and_retry() {
        let one_entry = serde_json::to_vec(&state_at("did:plc:x", 0)).unwrap().len() as u64;
        // Backend quota fits about two entries; ceiling is far larger so the
        // backend quota (not the ceiling) is what rejects the write.
        let store = BoundedCacheStore::new(MemoryStore::with_quota(one_entry * 5 / 2), 1 << 20);

        store.write_state(&state_at("did:plc:old", 1)).await.unwrap();
        store.write_state(&state_at("did:plc:mid", 2)).await.unwrap();
        // Third write trips the backend quota and succeeds after pruning.
        store.write_state(&state_at("did:plc:new", 3)).await.unwrap();

        assert!(
            store
                .read_state("did:plc:new")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_memory_store_quota() {
        let store = MemoryStore::with_quota(16);
        assert!(store.set("k", vec![0u8; 8]).await.is_ok());
        let err = store.set("k2", vec![0u8; 32]).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
    }
}
