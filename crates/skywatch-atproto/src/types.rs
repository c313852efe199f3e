//! Core types for decoded repository records.

use std::fmt;

use chrono::{DateTime, Utc};
use ipld_core::ipld::Ipld;
use serde::{Deserialize, Serialize};

use crate::records::{BLOCK_COLLECTION, FOLLOW_COLLECTION, LIST_ITEM_COLLECTION};

/// One raw entry pulled from the snapshot's MST walk.
///
/// Entries are materialized exactly once per decode call; an empty `raw`
/// payload marks a deletion tombstone in an incremental snapshot.
#[derive(Debug, Clone)]
pub struct RepositoryEntry {
    pub collection: String,
    pub rkey: String,
    pub raw: Vec<u8>,
}

/// A strong reference to a record (URI + CID).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

/// Reply pointers on a post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRef {
    pub parent: StrongRef,
    pub root: StrongRef,
}

/// `app.bsky.feed.post`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
    /// Embeds carry CBOR links, so they stay as raw IPLD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<Ipld>,
}

/// `app.bsky.graph.block`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    /// DID of the blocked account.
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

/// `app.bsky.graph.follow`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowRecord {
    /// DID of the followed account.
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

/// `app.bsky.graph.list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRecord {
    pub name: String,
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// `app.bsky.graph.listitem`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItemRecord {
    /// DID of the account placed on the list.
    pub subject: String,
    /// AT-URI of the list the subject was added to.
    pub list: String,
    pub created_at: DateTime<Utc>,
}

/// Exhaustive tagged variant over every supported collection.
///
/// Consumers match on this instead of probing loosely-typed payloads;
/// entries from unrecognized collections surface as [`DomainRecord::Unknown`].
#[derive(Debug, Clone)]
pub enum DomainRecord {
    Post(PostRecord),
    Block(BlockRecord),
    Follow(FollowRecord),
    List(ListRecord),
    ListItem(ListItemRecord),
    Unknown,
}

impl DomainRecord {
    /// Creation timestamp, when the variant carries one.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            DomainRecord::Post(r) => Some(r.created_at),
            DomainRecord::Block(r) => Some(r.created_at),
            DomainRecord::Follow(r) => Some(r.created_at),
            DomainRecord::List(r) => Some(r.created_at),
            DomainRecord::ListItem(r) => Some(r.created_at),
            DomainRecord::Unknown => None,
        }
    }
}

/// A decoded record with its position in the repository.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub collection: String,
    pub rkey: String,
    pub record: DomainRecord,
}

impl DecodedRecord {
    /// Canonical record URI: `at://<did>/<collection>/<rkey>`.
    pub fn uri(&self, did: &str) -> String {
        crate::uri::AtUri::new(did, &self.collection, &self.rkey).to_string()
    }
}

/// Kind discriminator for [`GraphOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphOpKind {
    Block,
    Follow,
    ListItem,
}

impl GraphOpKind {
    /// Collection NSID this kind decodes from.
    pub fn collection(&self) -> &'static str {
        match self {
            GraphOpKind::Block => BLOCK_COLLECTION,
            GraphOpKind::Follow => FOLLOW_COLLECTION,
            GraphOpKind::ListItem => LIST_ITEM_COLLECTION,
        }
    }
}

impl fmt::Display for GraphOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphOpKind::Block => write!(f, "block"),
            GraphOpKind::Follow => write!(f, "follow"),
            GraphOpKind::ListItem => write!(f, "listitem"),
        }
    }
}

/// Unified view of block/follow/listitem writes.
///
/// The mass-operation detector consumes only this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphOperation {
    pub kind: GraphOpKind,
    pub subject_did: String,
    pub rkey: String,
    pub created_at: DateTime<Utc>,
    pub list_uri: Option<String>,
    pub list_name: Option<String>,
}

/// Response from the latest-commit lookup.
///
/// `rev` is an opaque host-issued token compared only for equality.
#[derive(Debug, Clone, Deserialize)]
pub struct LatestCommit {
    pub cid: String,
    pub rev: String,
}
