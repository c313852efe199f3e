//! Mass-operation detection over graph operations.
//!
//! Operations are grouped by kind and scanned with a greedy sliding window:
//! a cluster forms when at least `min_count` same-kind operations fall within
//! `window_minutes` of the earliest. The window then advances past the
//! cluster, so clusters of one kind never overlap.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use skywatch_atproto::{GraphOpKind, GraphOperation};

/// A burst of same-kind operations within one time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MassOperationCluster {
    /// Deterministic id: same input always yields the same id.
    pub id: String,
    pub kind: GraphOpKind,
    pub operations: Vec<GraphOperation>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub count: usize,
}

/// Find clusters of at least `min_count` same-kind operations within
/// `window_minutes`. Returned clusters are ordered most recent first.
pub fn detect_clusters(
    operations: &[GraphOperation],
    window_minutes: u32,
    min_count: usize,
) -> Vec<MassOperationCluster> {
    let window = Duration::minutes(i64::from(window_minutes));
    let mut by_kind: BTreeMap<GraphOpKind, Vec<GraphOperation>> = BTreeMap::new();
    for op in operations {
        by_kind.entry(op.kind).or_default().push(op.clone());
    }

    let mut clusters = Vec::new();
    for (kind, mut ops) in by_kind {
        ops.sort_by_key(|op| op.created_at);

        let mut i = 0;
        while i < ops.len() {
            let window_end = ops[i].created_at + window;
            let mut j = i;
            while j < ops.len() && ops[j].created_at <= window_end {
                j += 1;
            }
            if j - i >= min_count {
                let members = ops[i..j].to_vec();
                let start_time = members[0].created_at;
                let end_time = members[members.len() - 1].created_at;
                let count = members.len();
                debug!(kind = %kind, count, %start_time, "mass-operation cluster detected");
                clusters.push(MassOperationCluster {
                    id: format!("{kind}-{}-{count}", start_time.timestamp_millis()),
                    kind,
                    operations: members,
                    start_time,
                    end_time,
                    count,
                });
                i = j;
            } else {
                i += 1;
            }
        }
    }

    clusters.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    clusters
}
