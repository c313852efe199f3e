//! Identity-scoped locking for sync operations.
//!
//! Syncs for different identities run concurrently; two syncs for the same
//! identity serialize on a keyed mutex. Cross-identity maintenance (pruning,
//! orphan sweeps) takes the broad write lock and excludes all syncs.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Keyed per-identity mutexes behind a broad reader/writer lock.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    per_identity: DashMap<String, Arc<Mutex<()>>>,
    broad: Arc<RwLock<()>>,
}

/// Held for the duration of one identity's sync.
pub struct IdentityGuard {
    _broad: OwnedRwLockReadGuard<()>,
    _keyed: OwnedMutexGuard<()>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize against other syncs of the same identity while permitting
    /// concurrent syncs of other identities.
    pub async fn lock_identity(&self, identity: &str) -> IdentityGuard {
        let broad = Arc::clone(&self.broad).read_owned().await;
        let keyed = self
            .per_identity
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        IdentityGuard {
            _broad: broad,
            _keyed: keyed.lock_owned().await,
        }
    }

    /// Exclude all identity syncs, for cross-identity maintenance.
    pub async fn lock_all(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.broad).write_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_identity_serializes() {
        let locks = Arc::new(IdentityLocks::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock_identity("did:plc:alice").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_identities_run_concurrently() {
        let locks = Arc::new(IdentityLocks::new());
        let first = locks.lock_identity("did:plc:alice").await;

        // A different identity must not block behind alice's guard.
        let second = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock_identity("did:plc:bob"),
        )
        .await;
        assert!(second.is_ok());
        drop(first);
    }

    #[tokio::test]
    async fn test_lock_all_excludes_identity_syncs() {
        let locks = Arc::new(IdentityLocks::new());
        let all = locks.lock_all().await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            locks.lock_identity("did:plc:alice"),
        )
        .await;
        assert!(blocked.is_err());

        drop(all);
        let _guard = locks.lock_identity("did:plc:alice").await;
    }
}
