//! Collection NSID constants for the record types skywatch tracks.

/// Bluesky post records.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Bluesky block records.
pub const BLOCK_COLLECTION: &str = "app.bsky.graph.block";

/// Bluesky follow records.
pub const FOLLOW_COLLECTION: &str = "app.bsky.graph.follow";

/// Bluesky list records (moderation and curation lists).
pub const LIST_COLLECTION: &str = "app.bsky.graph.list";

/// Bluesky list item records (membership of a subject in a list).
pub const LIST_ITEM_COLLECTION: &str = "app.bsky.graph.listitem";
