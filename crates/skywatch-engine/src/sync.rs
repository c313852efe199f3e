//! Sync orchestration: planning, download, decode, merge, persist.
//!
//! Every sync starts with a plan derived from cached revision state and a
//! lightweight remote revision check, so unchanged repositories cost one
//! small request (or nothing at all inside the freshness window) instead of
//! a full download.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use skywatch_atproto::{
    CarTransport, DecodeOutcome, DecodedRecord, DownloadOptions, DownloadProgress,
    DownloadProgressFn, RepoSyncError, decode_repo,
};

use crate::config::SyncConfig;
use crate::detector::{MassOperationCluster, detect_clusters};
use crate::error::EngineError;
use crate::locks::IdentityLocks;
use crate::merge::{MergeOutcome, build_full_state, merge};
use crate::store::{BoundedCacheStore, CachedDerivedState, KeyValueStore, RevisionState};

/// What a sync pass decided to do for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPlan {
    /// Cached revision is inside the freshness window; do nothing.
    Skip,
    /// Remote revision matches the cached one; only bookkeeping advances.
    RefreshTimestampOnly,
    /// Remote revision differs and cached state exists; fetch the delta.
    Incremental,
    /// No usable cache, or the revision check was inconclusive.
    Full,
}

/// What a sync pass actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped,
    Refreshed,
    Incremental,
    Full,
    /// Planned incremental, completed as full after the delta fetch failed.
    DegradedToFull,
}

/// Result of syncing one identity.
#[derive(Debug)]
pub struct SyncReport {
    pub identity: String,
    pub outcome: SyncOutcome,
    pub state: CachedDerivedState,
    pub records: Vec<DecodedRecord>,
    pub skipped_records: usize,
    pub unapplied_tombstones: usize,
    pub clusters: Vec<MassOperationCluster>,
}

/// Aggregated result of a batch sync.
#[derive(Debug)]
pub struct BatchReport {
    /// Per-identity outcome, in completion order.
    pub outcomes: Vec<(String, Result<SyncReport, EngineError>)>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn summary(&self) -> String {
        format!(
            "synced {} of {} identities ({} failed)",
            self.succeeded(),
            self.outcomes.len(),
            self.failed()
        )
    }
}

/// Callback invoked with human-readable stage descriptions.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Revision-tracked repository synchronizer.
pub struct RepoSynchronizer<S: KeyValueStore> {
    transport: CarTransport,
    store: BoundedCacheStore<S>,
    locks: IdentityLocks,
    config: SyncConfig,
    progress: Option<ProgressFn>,
}

impl<S: KeyValueStore + 'static> RepoSynchronizer<S> {
    pub fn new(transport: CarTransport, store: BoundedCacheStore<S>, config: SyncConfig) -> Self {
        Self {
            transport,
            store,
            locks: IdentityLocks::new(),
            config,
            progress: None,
        }
    }

    /// Attach a stage-progress callback.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn store(&self) -> &BoundedCacheStore<S> {
        &self.store
    }

    /// Cached derived state for an identity, if any.
    pub async fn cached_state(
        &self,
        identity: &str,
    ) -> Result<Option<CachedDerivedState>, EngineError> {
        Ok(self.store.read_state(identity).await?)
    }

    /// Decide how to sync an identity without downloading anything.
    ///
    /// The ladder: a revision downloaded inside the freshness window skips
    /// entirely; otherwise a remote revision check classifies the sync as
    /// refresh-only, incremental, or full. An inconclusive check (every
    /// endpoint down) falls through to full rather than guessing.
    pub async fn plan_sync(
        &self,
        identity: &str,
        primary_endpoint: Option<&str>,
    ) -> Result<SyncPlan, EngineError> {
        let revision = self.store.read_revision(identity).await?;
        let Some(revision) = revision else {
            return Ok(SyncPlan::Full);
        };

        if within_freshness_window(revision.downloaded_at, Utc::now(), self.config.freshness_window())
        {
            debug!(identity = %identity, "revision inside freshness window");
            return Ok(SyncPlan::Skip);
        }

        self.emit(&format!("checking latest revision for {identity}"));
        let Some(latest) = self.latest_revision(identity, primary_endpoint).await else {
            return Ok(SyncPlan::Full);
        };

        // Revision tokens are opaque; equality is the only valid comparison.
        if latest.rev == revision.revision {
            return Ok(SyncPlan::RefreshTimestampOnly);
        }
        if self.store.read_state(identity).await?.is_some() {
            Ok(SyncPlan::Incremental)
        } else {
            Ok(SyncPlan::Full)
        }
    }

    /// Sync one identity according to its plan.
    pub async fn sync(
        &self,
        identity: &str,
        primary_endpoint: Option<&str>,
    ) -> Result<SyncReport, EngineError> {
        let _guard = self.locks.lock_identity(identity).await;

        match self.plan_sync(identity, primary_endpoint).await? {
            SyncPlan::Skip => match self.store.read_state(identity).await? {
                Some(state) => {
                    debug!(identity = %identity, "sync skipped, cache fresh");
                    Ok(cache_only_report(identity, SyncOutcome::Skipped, state))
                }
                // Fresh revision but no state: the cache is inconsistent,
                // rebuild it.
                None => self.run_full(identity, primary_endpoint, SyncOutcome::Full).await,
            },
            SyncPlan::RefreshTimestampOnly => self.refresh_timestamp(identity).await,
            SyncPlan::Incremental => match self.run_incremental(identity, primary_endpoint).await {
                Ok(report) => Ok(report),
                Err(EngineError::Transport(e)) => {
                    warn!(
                        identity = %identity,
                        error = %e,
                        "incremental sync failed, degrading to full"
                    );
                    self.run_full(identity, primary_endpoint, SyncOutcome::DegradedToFull)
                        .await
                }
                Err(e) => Err(e),
            },
            SyncPlan::Full => self.run_full(identity, primary_endpoint, SyncOutcome::Full).await,
        }
    }

    /// Sync many identities with bounded concurrency.
    ///
    /// Individual failures never abort the batch; each identity's result is
    /// reported separately.
    pub async fn sync_many(self: &Arc<Self>, identities: Vec<String>) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut tasks: JoinSet<(String, Result<SyncReport, EngineError>)> = JoinSet::new();
        let mut outcomes = Vec::with_capacity(identities.len());

        for identity in identities {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                outcomes.push((
                    identity,
                    Err(EngineError::Transport(RepoSyncError::Network(
                        "sync scheduler shut down".to_string(),
                    ))),
                ));
                continue;
            };
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let result = this.sync(&identity, None).await;
                drop(permit);
                (identity, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "sync task panicked"),
            }
        }

        let report = BatchReport { outcomes };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "batch sync finished"
        );
        report
    }

    /// Remove an identity's cached state and revision, excluding all syncs.
    pub async fn remove_identity(&self, identity: &str) -> Result<(), EngineError> {
        let _guard = self.locks.lock_all().await;
        self.store.remove_identity(identity).await?;
        self.store.sweep_orphans().await?;
        Ok(())
    }

    /// Evict least-recently-synced identities down to `max_bytes`.
    pub async fn prune(&self, max_bytes: u64) -> Result<usize, EngineError> {
        let _guard = self.locks.lock_all().await;
        Ok(self.store.prune(max_bytes).await?)
    }

    /// Drop list resources no cached identity references.
    pub async fn sweep_orphans(&self) -> Result<usize, EngineError> {
        let _guard = self.locks.lock_all().await;
        Ok(self.store.sweep_orphans().await?)
    }

    async fn refresh_timestamp(&self, identity: &str) -> Result<SyncReport, EngineError> {
        // Remote matches the cache: advance the bookkeeping timestamps so
        // the freshness window restarts, leaving the derived sets untouched.
        let now = Utc::now();
        let state = match self.store.read_state(identity).await? {
            Some(mut state) => {
                state.last_sync = now;
                self.store.write_state(&state).await?;
                state
            }
            None => CachedDerivedState::empty(identity),
        };
        if let Some(mut revision) = self.store.read_revision(identity).await? {
            revision.downloaded_at = now;
            self.store.write_revision(&revision).await?;
        }
        debug!(identity = %identity, "revision unchanged, timestamp refreshed");
        Ok(cache_only_report(identity, SyncOutcome::Refreshed, state))
    }

    async fn run_incremental(
        &self,
        identity: &str,
        primary_endpoint: Option<&str>,
    ) -> Result<SyncReport, EngineError> {
        let Some(revision) = self.store.read_revision(identity).await? else {
            return self.run_full(identity, primary_endpoint, SyncOutcome::Full).await;
        };
        let Some(previous) = self.store.read_state(identity).await? else {
            return self.run_full(identity, primary_endpoint, SyncOutcome::Full).await;
        };

        self.emit(&format!("downloading changes for {identity}"));
        let bytes = self
            .download_with_retry(identity, primary_endpoint, Some(&revision.revision))
            .await?;
        let size_bytes = bytes.len() as u64;
        self.emit(&format!("decoding changes for {identity}"));
        let outcome = decode_repo(&bytes, None).await?;
        let merged = merge(previous, &outcome);

        self.persist(identity, merged, &outcome, size_bytes, SyncOutcome::Incremental)
            .await
    }

    async fn run_full(
        &self,
        identity: &str,
        primary_endpoint: Option<&str>,
        label: SyncOutcome,
    ) -> Result<SyncReport, EngineError> {
        self.emit(&format!("downloading repository for {identity}"));
        let bytes = self
            .download_with_retry(identity, primary_endpoint, None)
            .await?;
        let size_bytes = bytes.len() as u64;
        self.emit(&format!("decoding repository for {identity}"));
        let outcome = decode_repo(&bytes, None).await?;

        let handle = self
            .store
            .read_state(identity)
            .await?
            .and_then(|s| s.handle);
        let merged = build_full_state(identity, handle, &outcome);

        self.persist(identity, merged, &outcome, size_bytes, label).await
    }

    async fn persist(
        &self,
        identity: &str,
        merged: MergeOutcome,
        outcome: &DecodeOutcome,
        size_bytes: u64,
        label: SyncOutcome,
    ) -> Result<SyncReport, EngineError> {
        let now = Utc::now();
        let mut state = merged.state;
        state.last_sync = now;
        if let Some(rev) = &outcome.rev {
            state.repo_rev = rev.clone();
        }

        let incremental = matches!(label, SyncOutcome::Incremental);
        for (uri, members) in merged.list_members {
            // Incremental passes only see changed list items, so they union
            // into the stored membership; full passes replace it.
            let mut list = match self.store.read_list(&uri).await? {
                Some(existing) if incremental => existing,
                _ => crate::store::ListResource::new(&uri),
            };
            if incremental {
                list.members.extend(members);
            } else {
                list.members = members;
            }
            list.last_sync = now;
            self.store.write_list(&list).await?;
        }

        self.emit(&format!("persisting state for {identity}"));
        self.store.write_state(&state).await?;

        let mut per_collection_counts: HashMap<String, usize> = HashMap::new();
        for record in &outcome.records {
            *per_collection_counts.entry(record.collection.clone()).or_default() += 1;
        }
        self.store
            .write_revision(&RevisionState {
                identity: identity.to_string(),
                revision: state.repo_rev.clone(),
                downloaded_at: now,
                size_bytes,
                per_collection_counts,
            })
            .await?;

        let clusters = detect_clusters(
            &outcome.graph_operations(),
            self.config.time_window_minutes,
            self.config.min_operation_count,
        );

        info!(
            identity = %identity,
            outcome = ?label,
            records = outcome.records.len(),
            skipped = outcome.skipped,
            tombstones = outcome.tombstones,
            clusters = clusters.len(),
            "sync complete"
        );

        Ok(SyncReport {
            identity: identity.to_string(),
            outcome: label,
            state,
            records: outcome.records.clone(),
            skipped_records: outcome.skipped,
            unapplied_tombstones: merged.unapplied_tombstones,
            clusters,
        })
    }

    /// Download with bounded retry. Only transient failures (network errors,
    /// 5xx, 429) retry; timeouts and other client errors surface immediately.
    async fn download_with_retry(
        &self,
        identity: &str,
        primary_endpoint: Option<&str>,
        since_rev: Option<&str>,
    ) -> Result<Vec<u8>, RepoSyncError> {
        let opts = DownloadOptions {
            primary_endpoint: primary_endpoint.map(str::to_string),
            since_rev: since_rev.map(str::to_string),
            deadline: self.config.download_deadline(),
        };
        let progress = self.progress.clone().map(|emit| {
            let identity = identity.to_string();
            let cb: DownloadProgressFn = Arc::new(move |p: DownloadProgress| {
                match p.percent() {
                    Some(pct) => emit(&format!("downloading {identity}: {pct:.0}%")),
                    None => emit(&format!("downloading {identity}: {} bytes", p.bytes)),
                }
            });
            cb
        });

        let mut backoff = retry_backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.download(identity, &opts, progress.as_ref()).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() && attempt < self.config.max_retry_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    warn!(
                        identity = %identity,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient download failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Latest remote revision, retrying transient failures. Returns `None`
    /// when the check is conclusive-failure so the caller can plan a full
    /// sync instead of erroring.
    async fn latest_revision(
        &self,
        identity: &str,
        primary_endpoint: Option<&str>,
    ) -> Option<skywatch_atproto::LatestCommit> {
        let mut backoff = retry_backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .transport
                .latest_commit(identity, primary_endpoint, self.config.download_deadline())
                .await
            {
                Ok(commit) => return Some(commit),
                Err(e) if e.is_transient() && attempt < self.config.max_retry_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    warn!(
                        identity = %identity,
                        attempt,
                        error = %e,
                        "transient revision-check failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "revision check inconclusive");
                    return None;
                }
            }
        }
    }

    fn emit(&self, stage: &str) {
        if let Some(progress) = &self.progress {
            progress(stage);
        }
    }
}

/// Whether a revision downloaded at `downloaded_at` is still fresh at `now`.
/// The window boundary itself counts as fresh.
fn within_freshness_window(
    downloaded_at: DateTime<Utc>,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> bool {
    now - downloaded_at <= window
}

fn retry_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

fn cache_only_report(
    identity: &str,
    outcome: SyncOutcome,
    state: CachedDerivedState,
) -> SyncReport {
    SyncReport {
        identity: identity.to_string(),
        outcome,
        state,
        records: Vec::new(),
        skipped_records: 0,
        unapplied_tombstones: 0,
        clusters: Vec::new(),
    }
}
