//! Recognized configuration options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for sync, caching, and detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sliding window for mass-operation clustering, in minutes.
    pub time_window_minutes: u32,
    /// Minimum same-kind operations within the window to form a cluster.
    pub min_operation_count: usize,
    /// Cache size ceiling that triggers eviction, in bytes.
    pub cache_ceiling_bytes: u64,
    /// How long cached state stays fresh before a revision check is even
    /// attempted, in milliseconds.
    pub freshness_window_ms: u64,
    /// Per-request download deadline, in milliseconds.
    pub download_timeout_ms: u64,
    /// Concurrently in-flight downloads during batch sync.
    pub max_in_flight: usize,
    /// Bounded attempt count for transient-failure retry.
    pub max_retry_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            time_window_minutes: 5,
            min_operation_count: 10,
            cache_ceiling_bytes: 10 * 1024 * 1024,
            freshness_window_ms: 60 * 60 * 1000,
            download_timeout_ms: 30_000,
            max_in_flight: 4,
            max_retry_attempts: 3,
        }
    }
}

impl SyncConfig {
    /// Per-request deadline as a [`Duration`].
    pub fn download_deadline(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    /// Freshness window as a [`chrono::Duration`].
    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.freshness_window_ms as i64)
    }
}
