//! Folding decoded repository contents into derived state.
//!
//! Incremental merge is additive only. An incremental snapshot carries new
//! and changed records but does not describe deletions in a form the decoder
//! preserves, so tombstones are counted and reported, never applied. Removed
//! blocks or follows persist in derived state until the next full sync
//! rebuilds it from scratch.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use skywatch_atproto::{AtUri, DecodeOutcome, DecodedRecord, DomainRecord, LIST_COLLECTION};

use crate::store::CachedDerivedState;

/// Result of folding a decode pass into derived state.
#[derive(Debug)]
pub struct MergeOutcome {
    pub state: CachedDerivedState,
    /// Members per list URI observed in this pass.
    pub list_members: BTreeMap<String, BTreeSet<String>>,
    /// Deletions the additive merge could not apply.
    pub unapplied_tombstones: usize,
}

/// Fold an incremental decode into existing derived state, additively.
pub fn merge(previous: CachedDerivedState, outcome: &DecodeOutcome) -> MergeOutcome {
    if outcome.tombstones > 0 {
        warn!(
            identity = %previous.identity,
            tombstones = outcome.tombstones,
            "incremental merge cannot apply deletions; stale entries persist until next full sync"
        );
    }
    apply(previous, outcome)
}

/// Build derived state from a full snapshot, discarding prior contents.
pub fn build_full_state(
    identity: &str,
    handle: Option<String>,
    outcome: &DecodeOutcome,
) -> MergeOutcome {
    let mut state = CachedDerivedState::empty(identity);
    state.handle = handle;
    apply(state, outcome)
}

fn apply(mut state: CachedDerivedState, outcome: &DecodeOutcome) -> MergeOutcome {
    let mut list_members: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for decoded in &outcome.records {
        match &decoded.record {
            DomainRecord::Block(block) => {
                state.direct_blocks.insert(block.subject.clone());
            }
            DomainRecord::Follow(follow) => {
                state.follows.insert(follow.subject.clone());
            }
            DomainRecord::List(_) => {
                state.subscribed_lists.insert(owned_list_uri(&state.identity, decoded));
            }
            DomainRecord::ListItem(item) => {
                state.subscribed_lists.insert(item.list.clone());
                list_members
                    .entry(item.list.clone())
                    .or_default()
                    .insert(item.subject.clone());
            }
            DomainRecord::Post(_) | DomainRecord::Unknown => {}
        }
    }

    MergeOutcome {
        state,
        list_members,
        unapplied_tombstones: outcome.tombstones,
    }
}

fn owned_list_uri(identity: &str, decoded: &DecodedRecord) -> String {
    AtUri::new(identity, LIST_COLLECTION, &decoded.rkey).to_string()
}
