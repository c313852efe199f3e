//! Canonical `at://` record addresses.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors from parsing an `at://` URI.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AtUriError {
    /// Input did not start with the `at://` scheme.
    #[error("missing at:// scheme in {0:?}")]
    MissingScheme(String),

    /// Input did not carry all of did, collection, and rkey.
    #[error("expected at://did/collection/rkey, got {0:?}")]
    MalformedPath(String),
}

/// A record address of the form `at://{did}/{collection}/{rkey}`.
///
/// Every decoded record is addressable this way, and list items carry the
/// address of their list in this form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn new(
        did: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Self {
        Self {
            did: did.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// Parse an `at://` URI.
    ///
    /// ```
    /// use skywatch_atproto::AtUri;
    ///
    /// let uri: AtUri = "at://did:plc:abc123/app.bsky.graph.list/3abc".parse().unwrap();
    /// assert_eq!(uri.did, "did:plc:abc123");
    /// assert_eq!(uri.rkey, "3abc");
    /// ```
    pub fn parse(input: &str) -> Result<Self, AtUriError> {
        let path = input
            .strip_prefix("at://")
            .ok_or_else(|| AtUriError::MissingScheme(input.to_string()))?;

        let mut parts = path.splitn(3, '/').filter(|part| !part.is_empty());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(did), Some(collection), Some(rkey)) => Ok(Self::new(did, collection, rkey)),
            _ => Err(AtUriError::MalformedPath(input.to_string())),
        }
    }
}

impl FromStr for AtUri {
    type Err = AtUriError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_uri() {
        let uri = AtUri::parse("at://did:plc:abc123/app.bsky.graph.listitem/3abc").unwrap();
        assert_eq!(uri.did, "did:plc:abc123");
        assert_eq!(uri.collection, "app.bsky.graph.listitem");
        assert_eq!(uri.rkey, "3abc");
    }

    #[test]
    fn test_parse_missing_scheme() {
        let err = AtUri::parse("did:plc:abc/collection/rkey").unwrap_err();
        assert!(matches!(err, AtUriError::MissingScheme(_)));
    }

    #[test]
    fn test_parse_missing_rkey() {
        let err = AtUri::parse("at://did:plc:abc/collection").unwrap_err();
        assert!(matches!(err, AtUriError::MalformedPath(_)));
    }

    #[test]
    fn test_parse_empty_component() {
        let err = AtUri::parse("at://did:plc:abc//rkey").unwrap_err();
        assert!(matches!(err, AtUriError::MalformedPath(_)));
    }

    #[test]
    fn test_new_and_parse_agree() {
        let built = AtUri::new("did:plc:abc123", "app.bsky.graph.list", "xyz789");
        let parsed = AtUri::parse(&built.to_string()).unwrap();
        assert_eq!(parsed, built);
    }
}
