//! CAR snapshot decoding.
//!
//! Parses CAR v1 containers and walks the repository MST, materializing every
//! entry exactly once. Typed decoding then runs as indexed passes over the
//! materialized entries (list metadata first, so list items can resolve their
//! list names) instead of re-parsing the container.
//!
//! A malformed payload never aborts decoding: the entry is counted as
//! skipped, logged, and the pass continues.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use ipld_core::cid::Cid;
use iroh_car::CarReader;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::records::{
    BLOCK_COLLECTION, FOLLOW_COLLECTION, LIST_COLLECTION, LIST_ITEM_COLLECTION, POST_COLLECTION,
};
use crate::types::{
    BlockRecord, DecodedRecord, DomainRecord, FollowRecord, GraphOpKind, GraphOperation,
    ListItemRecord, ListRecord, PostRecord, RepositoryEntry,
};
use crate::uri::AtUri;
use crate::RepoSyncError;

/// Result of decoding a repository snapshot.
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    /// Successfully decoded records.
    pub records: Vec<DecodedRecord>,
    /// Entries whose payload failed to decode.
    pub skipped: usize,
    /// Entries with an empty payload. In incremental snapshots these are
    /// deletion tombstones; the deleted identifier is unrecoverable.
    pub tombstones: usize,
    /// Repository revision from the commit block.
    pub rev: Option<String>,
    /// DID of the repository, from the commit block.
    pub did: Option<String>,
    /// List names resolved during the first pass, keyed by list URI.
    pub list_names: HashMap<String, String>,
}

impl DecodeOutcome {
    /// Unified graph-operation view over block/follow/listitem records.
    pub fn graph_operations(&self) -> Vec<GraphOperation> {
        self.records
            .iter()
            .filter_map(|rec| match &rec.record {
                DomainRecord::Block(b) => Some(GraphOperation {
                    kind: GraphOpKind::Block,
                    subject_did: b.subject.clone(),
                    rkey: rec.rkey.clone(),
                    created_at: b.created_at,
                    list_uri: None,
                    list_name: None,
                }),
                DomainRecord::Follow(f) => Some(GraphOperation {
                    kind: GraphOpKind::Follow,
                    subject_did: f.subject.clone(),
                    rkey: rec.rkey.clone(),
                    created_at: f.created_at,
                    list_uri: None,
                    list_name: None,
                }),
                DomainRecord::ListItem(li) => Some(GraphOperation {
                    kind: GraphOpKind::ListItem,
                    subject_did: li.subject.clone(),
                    rkey: rec.rkey.clone(),
                    created_at: li.created_at,
                    list_uri: Some(li.list.clone()),
                    list_name: self.list_names.get(&li.list).cloned(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Decode a repository snapshot into typed domain records.
///
/// `list_filter`, when given, excludes list items whose list URI is outside
/// the allow-list.
pub async fn decode_repo(
    car_bytes: &[u8],
    list_filter: Option<&HashSet<String>>,
) -> Result<DecodeOutcome, RepoSyncError> {
    let (entries, rev, did) = materialize_entries(car_bytes).await?;
    let mut outcome = decode_entries(&entries, &did, list_filter);
    outcome.rev = Some(rev);
    outcome.did = Some(did);

    debug!(
        records = outcome.records.len(),
        skipped = outcome.skipped,
        tombstones = outcome.tombstones,
        rev = ?outcome.rev,
        "decoded repository snapshot"
    );
    Ok(outcome)
}

/// Decode materialized entries into typed records.
///
/// Two indexed passes over the same entry list: list metadata first, then
/// every other collection. Unrecognized collections are ignored; malformed
/// payloads are counted as skipped.
pub fn decode_entries(
    entries: &[RepositoryEntry],
    did: &str,
    list_filter: Option<&HashSet<String>>,
) -> DecodeOutcome {
    let mut outcome = DecodeOutcome::default();

    // Pass 1: list metadata, so pass 2 can resolve list names for members.
    for entry in entries {
        if entry.collection != LIST_COLLECTION || entry.raw.is_empty() {
            continue;
        }
        let uri = AtUri::new(did, LIST_COLLECTION, &entry.rkey).to_string();
        if let Ok(list) = parse_cbor::<ListRecord>(&entry.raw) {
            outcome.list_names.insert(uri, list.name.clone());
        }
    }

    // Pass 2: every entry, dispatched by collection.
    for entry in entries {
        if entry.raw.is_empty() {
            trace!(
                collection = %entry.collection,
                rkey = %entry.rkey,
                "deletion tombstone, identifier unrecoverable"
            );
            outcome.tombstones += 1;
            continue;
        }

        let record = match entry.collection.as_str() {
            POST_COLLECTION => parse_cbor::<PostRecord>(&entry.raw).map(DomainRecord::Post),
            BLOCK_COLLECTION => parse_cbor::<BlockRecord>(&entry.raw)
                .and_then(require_subject_block)
                .map(DomainRecord::Block),
            FOLLOW_COLLECTION => parse_cbor::<FollowRecord>(&entry.raw)
                .and_then(require_subject_follow)
                .map(DomainRecord::Follow),
            LIST_COLLECTION => parse_cbor::<ListRecord>(&entry.raw).map(DomainRecord::List),
            LIST_ITEM_COLLECTION => parse_cbor::<ListItemRecord>(&entry.raw)
                .and_then(require_subject_list_item)
                .map(DomainRecord::ListItem),
            other => {
                trace!(collection = %other, rkey = %entry.rkey, "ignoring unknown collection");
                continue;
            }
        };

        match record {
            Ok(DomainRecord::ListItem(li)) => {
                if let Some(filter) = list_filter
                    && !filter.contains(&li.list)
                {
                    trace!(list = %li.list, "list item outside allow-list filter");
                    continue;
                }
                outcome.records.push(DecodedRecord {
                    collection: entry.collection.clone(),
                    rkey: entry.rkey.clone(),
                    record: DomainRecord::ListItem(li),
                });
            }
            Ok(record) => {
                outcome.records.push(DecodedRecord {
                    collection: entry.collection.clone(),
                    rkey: entry.rkey.clone(),
                    record,
                });
            }
            Err(e) => {
                warn!(
                    collection = %entry.collection,
                    rkey = %entry.rkey,
                    error = %e,
                    "malformed record payload, skipping entry"
                );
                outcome.skipped += 1;
            }
        }
    }

    outcome
}

fn require_subject_block(rec: BlockRecord) -> Result<BlockRecord, RepoSyncError> {
    if rec.subject.is_empty() {
        return Err(RepoSyncError::Decode("empty block subject".to_string()));
    }
    Ok(rec)
}

fn require_subject_follow(rec: FollowRecord) -> Result<FollowRecord, RepoSyncError> {
    if rec.subject.is_empty() {
        return Err(RepoSyncError::Decode("empty follow subject".to_string()));
    }
    Ok(rec)
}

fn require_subject_list_item(rec: ListItemRecord) -> Result<ListItemRecord, RepoSyncError> {
    if rec.subject.is_empty() {
        return Err(RepoSyncError::Decode("empty list item subject".to_string()));
    }
    if let Err(e) = AtUri::parse(&rec.list) {
        return Err(RepoSyncError::Decode(format!("bad list uri: {e}")));
    }
    Ok(rec)
}

/// ATProto signed commit structure (repo format v3).
#[derive(Debug, serde::Deserialize)]
struct Commit {
    /// DID of the repo (required).
    did: String,
    /// Repo format version (required, must be 3).
    #[allow(dead_code)]
    version: u32,
    /// The data MST root CID (required).
    data: Cid,
    /// Repository revision in TID format (required).
    rev: String,
    /// Previous commit CID (nullable, virtually always null in v3).
    #[allow(dead_code)]
    prev: Option<Cid>,
    /// Cryptographic signature as raw bytes (required). Not verified here.
    #[allow(dead_code)]
    #[serde(with = "serde_bytes")]
    sig: Vec<u8>,
}

/// ATProto MST node structure (NodeData).
#[derive(Debug, serde::Deserialize)]
struct MstNode {
    /// Left subtree CID (nullable).
    #[serde(rename = "l")]
    left: Option<Cid>,
    /// Entries in this node (required, ordered list).
    #[serde(rename = "e", default)]
    entries: Vec<MstEntry>,
}

/// An entry in an MST node (TreeEntry).
#[derive(Debug, serde::Deserialize)]
struct MstEntry {
    /// Count of key bytes shared with the previous entry in this node.
    #[serde(rename = "p", default)]
    prefix_len: usize,
    /// Key suffix after the shared prefix.
    #[serde(rename = "k")]
    key_suffix: serde_bytes::ByteBuf,
    /// Value CID (record data); internal nodes may omit it.
    #[serde(rename = "v")]
    value: Option<Cid>,
    /// Right subtree CID (nullable).
    #[serde(rename = "t")]
    tree: Option<Cid>,
}

/// Parse a dag-cbor value.
fn parse_cbor<T: DeserializeOwned>(data: &[u8]) -> Result<T, RepoSyncError> {
    serde_ipld_dagcbor::from_slice(data).map_err(|e| RepoSyncError::Decode(e.to_string()))
}

/// Parse the CAR container and materialize every MST entry once.
///
/// Returns the entry list, the commit revision, and the repository DID.
/// Entries whose value block is absent from the container get an empty
/// payload (deletion tombstones in incremental snapshots).
async fn materialize_entries(
    car_bytes: &[u8],
) -> Result<(Vec<RepositoryEntry>, String, String), RepoSyncError> {
    let cursor = Cursor::new(car_bytes);
    let mut reader = CarReader::new(cursor)
        .await
        .map_err(|e| RepoSyncError::CarParse(format!("failed to read CAR header: {e}")))?;

    let roots = reader.header().roots().to_vec();
    let mut blocks: HashMap<String, Vec<u8>> = HashMap::new();

    loop {
        match reader.next_block().await {
            Ok(Some((cid, data))) => {
                blocks.insert(cid.to_string(), data);
            }
            Ok(None) => break,
            Err(e) => {
                return Err(RepoSyncError::CarParse(format!("failed to read block: {e}")));
            }
        }
    }

    debug!(block_count = blocks.len(), roots = roots.len(), "parsed CAR blocks");

    let commit_cid = roots
        .first()
        .ok_or_else(|| RepoSyncError::CarParse("CAR file has no roots".to_string()))?
        .to_string();
    let commit_data = blocks
        .get(&commit_cid)
        .ok_or_else(|| RepoSyncError::CarParse("commit block not found".to_string()))?;

    let commit: Commit =
        parse_cbor(commit_data).map_err(|e| RepoSyncError::CarParse(e.to_string()))?;

    let mut entries = Vec::new();
    walk_mst_node(&commit.data.to_string(), &blocks, "", &mut entries)?;

    Ok((entries, commit.rev, commit.did))
}

/// Recursively walk an MST node, collecting entries.
fn walk_mst_node(
    cid: &str,
    blocks: &HashMap<String, Vec<u8>>,
    key_prefix: &str,
    entries: &mut Vec<RepositoryEntry>,
) -> Result<(), RepoSyncError> {
    let data = match blocks.get(cid) {
        Some(d) => d,
        None => {
            warn!(cid = %cid, "MST node block not found");
            return Ok(());
        }
    };

    let node: MstNode =
        parse_cbor(data).map_err(|e| RepoSyncError::CarParse(format!("MST node: {e}")))?;

    if let Some(ref left) = node.left {
        walk_mst_node(&left.to_string(), blocks, key_prefix, entries)?;
    }

    let mut prev_key = key_prefix.to_string();

    for entry in &node.entries {
        const MAX_KEY_SUFFIX_LEN: usize = 512;
        if entry.key_suffix.len() > MAX_KEY_SUFFIX_LEN {
            warn!(
                suffix_len = entry.key_suffix.len(),
                max = MAX_KEY_SUFFIX_LEN,
                "key suffix too long, skipping entry"
            );
            continue;
        }

        let key_suffix = String::from_utf8_lossy(&entry.key_suffix);

        // prefix_len counts bytes shared with the previous entry in this node;
        // the first entry in any node must have prefix_len=0.
        let full_key = if entry.prefix_len > 0 {
            if entry.prefix_len > prev_key.len() {
                warn!(
                    prefix_len = entry.prefix_len,
                    prev_key_len = prev_key.len(),
                    "prefix_len exceeds prev_key length, using key_suffix only"
                );
                key_suffix.to_string()
            } else {
                format!("{}{}", &prev_key[..entry.prefix_len], key_suffix)
            }
        } else {
            key_suffix.to_string()
        };

        if let Some(ref value_cid) = entry.value {
            // Key format: "collection/rkey".
            if let Some((collection, rkey)) = full_key.split_once('/') {
                let raw = blocks.get(&value_cid.to_string()).cloned().unwrap_or_default();
                entries.push(RepositoryEntry {
                    collection: collection.to_string(),
                    rkey: rkey.to_string(),
                    raw,
                });
            } else {
                trace!(key = %full_key, "skipping non-record key");
            }
        }

        if let Some(ref tree) = entry.tree {
            walk_mst_node(&tree.to_string(), blocks, &full_key, entries)?;
        }

        prev_key = full_key;
    }

    Ok(())
}
