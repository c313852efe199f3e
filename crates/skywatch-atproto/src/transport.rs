//! HTTP transport for repository snapshots.
//!
//! Downloads full or incremental CAR snapshots over XRPC, trying the caller's
//! primary endpoint first and falling back to a well-known relay. Every call
//! runs under an explicit deadline; exceeding it cancels the request and
//! yields a [`RepoSyncError::Timeout`], distinct from ordinary HTTP failures.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{LatestCommit, RepoSyncError};

/// Well-known relay used when no primary endpoint is given or it fails.
pub const FALLBACK_ENDPOINT: &str = "https://bsky.network";

/// Default per-request deadline.
pub const DEFAULT_DOWNLOAD_DEADLINE: Duration = Duration::from_secs(30);

/// Cumulative download progress passed to the progress callback.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    /// Bytes received so far.
    pub bytes: u64,
    /// Total body length, when the remote reported one.
    pub total: Option<u64>,
}

impl DownloadProgress {
    /// Percentage complete, when the total length is known.
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some(self.bytes as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

/// Callback invoked with cumulative bytes as the body streams in.
pub type DownloadProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Options for a single snapshot download.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Endpoint tried before the fallback (usually the account's PDS).
    pub primary_endpoint: Option<String>,
    /// Previously synced revision; requests an incremental snapshot.
    pub since_rev: Option<String>,
    /// Per-request deadline.
    pub deadline: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            primary_endpoint: None,
            since_rev: None,
            deadline: DEFAULT_DOWNLOAD_DEADLINE,
        }
    }
}

/// HTTP transport for fetching repository snapshots and revision checks.
pub struct CarTransport {
    http: Client,
    fallback_endpoint: String,
}

impl CarTransport {
    /// Create a transport using the well-known fallback relay.
    pub fn new() -> Self {
        Self::with_fallback(FALLBACK_ENDPOINT)
    }

    /// Create a transport with a custom fallback endpoint.
    pub fn with_fallback(endpoint: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            fallback_endpoint: endpoint.into(),
        }
    }

    /// Download a repository snapshot, primary endpoint first.
    ///
    /// Failures on the primary (network error, non-success status, deadline)
    /// fall back to the secondary endpoint. [`RepoSyncError::IncrementalUnsupported`]
    /// is surfaced immediately so the caller can re-issue a full fetch; the
    /// transport never silently retries as full itself. When every endpoint
    /// is exhausted, the final status or timeout marker is returned.
    pub async fn download(
        &self,
        did: &str,
        opts: &DownloadOptions,
        progress: Option<&DownloadProgressFn>,
    ) -> Result<Vec<u8>, RepoSyncError> {
        let deadline_ms = opts.deadline.as_millis() as u64;
        let mut last_err = RepoSyncError::Network("no endpoint attempted".to_string());

        for endpoint in self.endpoints(opts.primary_endpoint.as_deref()) {
            let attempt = self.fetch_snapshot(&endpoint, did, opts.since_rev.as_deref(), progress);
            match tokio::time::timeout(opts.deadline, attempt).await {
                Ok(Ok(bytes)) => return Ok(bytes),
                Ok(Err(RepoSyncError::IncrementalUnsupported)) => {
                    return Err(RepoSyncError::IncrementalUnsupported);
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %endpoint, error = %e, "snapshot fetch failed");
                    last_err = e;
                }
                Err(_) => {
                    warn!(endpoint = %endpoint, deadline_ms, "snapshot fetch timed out");
                    last_err = RepoSyncError::Timeout { deadline_ms };
                }
            }
        }

        Err(last_err)
    }

    /// Query the latest commit for a repository, primary endpoint first.
    ///
    /// Errors only when every endpoint is unreachable.
    pub async fn latest_commit(
        &self,
        did: &str,
        primary_endpoint: Option<&str>,
        deadline: Duration,
    ) -> Result<LatestCommit, RepoSyncError> {
        let deadline_ms = deadline.as_millis() as u64;
        let mut last_err = RepoSyncError::Network("no endpoint attempted".to_string());

        for endpoint in self.endpoints(primary_endpoint) {
            match tokio::time::timeout(deadline, self.fetch_latest_commit(&endpoint, did)).await {
                Ok(Ok(commit)) => return Ok(commit),
                Ok(Err(e)) => {
                    warn!(endpoint = %endpoint, error = %e, "latest-commit check failed");
                    last_err = e;
                }
                Err(_) => {
                    warn!(endpoint = %endpoint, deadline_ms, "latest-commit check timed out");
                    last_err = RepoSyncError::Timeout { deadline_ms };
                }
            }
        }

        Err(last_err)
    }

    /// Deduplicated endpoint order: primary (when given), then fallback.
    fn endpoints(&self, primary: Option<&str>) -> Vec<String> {
        let mut endpoints = Vec::with_capacity(2);
        if let Some(primary) = primary
            && primary != self.fallback_endpoint
        {
            endpoints.push(primary.to_string());
        }
        endpoints.push(self.fallback_endpoint.clone());
        endpoints
    }

    async fn fetch_snapshot(
        &self,
        endpoint: &str,
        did: &str,
        since: Option<&str>,
        progress: Option<&DownloadProgressFn>,
    ) -> Result<Vec<u8>, RepoSyncError> {
        let url = format!("{}/xrpc/com.atproto.sync.getRepo", endpoint);

        let mut query: Vec<(&str, &str)> = vec![("did", did)];
        if let Some(since) = since {
            query.push(("since", since));
        }

        let response = self.http.get(&url).query(&query).send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if since.is_some() && status.is_client_error() && is_since_rejection(&text) {
                debug!(endpoint = %endpoint, "remote rejected incremental fetch");
                return Err(RepoSyncError::IncrementalUnsupported);
            }
            return Err(RepoSyncError::Http {
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let mut bytes: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            bytes.extend_from_slice(&chunk);
            if let Some(cb) = progress {
                cb(DownloadProgress {
                    bytes: bytes.len() as u64,
                    total,
                });
            }
        }

        debug!(
            endpoint = %endpoint,
            size = bytes.len(),
            incremental = since.is_some(),
            "fetched repository snapshot"
        );
        Ok(bytes)
    }

    async fn fetch_latest_commit(
        &self,
        endpoint: &str,
        did: &str,
    ) -> Result<LatestCommit, RepoSyncError> {
        let url = format!("{}/xrpc/com.atproto.sync.getLatestCommit", endpoint);

        let response = self.http.get(&url).query(&[("did", did)]).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(RepoSyncError::Http {
                status: status.as_u16(),
            });
        }

        let commit: LatestCommit = response
            .json()
            .await
            .map_err(|e| RepoSyncError::InvalidResponse(format!("latest commit: {e}")))?;

        debug!(endpoint = %endpoint, rev = %commit.rev, "fetched latest commit");
        Ok(commit)
    }
}

impl Default for CarTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// XRPC error response format.
#[derive(Debug, Deserialize)]
struct XrpcError {
    error: String,
    #[serde(default)]
    message: String,
}

/// Whether a client-error body indicates the `since` parameter was rejected.
fn is_since_rejection(body: &str) -> bool {
    match serde_json::from_str::<XrpcError>(body) {
        Ok(e) => {
            e.error == "InvalidRequest"
                || e.error == "MethodNotImplemented"
                || e.message.contains("since")
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;

    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const GET_REPO: &str = "/xrpc/com.atproto.sync.getRepo";
    const GET_LATEST: &str = "/xrpc/com.atproto.sync.getLatestCommit";

    fn opts_for(primary: Option<String>) -> DownloadOptions {
        DownloadOptions {
            primary_endpoint: primary,
            since_rev: None,
            deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_download_from_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(GET_REPO))
            .and(query_param("did", "did:plc:alice"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1, 2, 3]))
            .mount(&server)
            .await;

        let transport = CarTransport::with_fallback(server.uri());
        let bytes = transport
            .download("did:plc:alice", &opts_for(None), None)
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back() {
        let primary = MockServer::start().await;
        let secondary = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(GET_REPO))
            .respond_with(ResponseTemplate::new(500))
            .mount(&primary)
            .await;
        Mock::given(method("GET"))
            .and(path(GET_REPO))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9, 9]))
            .mount(&secondary)
            .await;

        let transport = CarTransport::with_fallback(secondary.uri());
        let bytes = transport
            .download("did:plc:alice", &opts_for(Some(primary.uri())), None)
            .await
            .unwrap();
        assert_eq!(bytes, vec![9, 9]);
    }

    #[tokio::test]
    async fn test_terminal_failure_carries_final_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(GET_REPO))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = CarTransport::with_fallback(server.uri());
        let err = transport
            .download("did:plc:alice", &opts_for(None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoSyncError::Http { status: 404 }));
    }

    #[tokio::test]
    async fn test_incremental_unsupported_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(GET_REPO))
            .and(query_param("since", "rev-1"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "InvalidRequest",
                "message": "since parameter is not supported"
            })))
            .mount(&server)
            .await;

        let transport = CarTransport::with_fallback(server.uri());
        let opts = DownloadOptions {
            since_rev: Some("rev-1".to_string()),
            ..opts_for(None)
        };
        let err = transport
            .download("did:plc:alice", &opts, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoSyncError::IncrementalUnsupported));
    }

    #[tokio::test]
    async fn test_client_error_without_since_is_plain_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(GET_REPO))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "InvalidRequest",
                "message": "bad did"
            })))
            .mount(&server)
            .await;

        let transport = CarTransport::with_fallback(server.uri());
        let err = transport
            .download("did:plc:alice", &opts_for(None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoSyncError::Http { status: 400 }));
    }

    #[tokio::test]
    async fn test_deadline_yields_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(GET_REPO))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 16])
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let transport = CarTransport::with_fallback(server.uri());
        let opts = DownloadOptions {
            deadline: Duration::from_millis(200),
            ..opts_for(None)
        };

        let started = Instant::now();
        let err = transport
            .download("did:plc:alice", &opts, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoSyncError::Timeout { deadline_ms: 200 }));
        // One endpoint, one deadline; must not block for the full delay.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_progress_reports_cumulative_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(GET_REPO))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64]))
            .mount(&server)
            .await;

        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let progress: DownloadProgressFn = Arc::new(move |p: DownloadProgress| {
            seen_cb.lock().unwrap().push(p.bytes);
        });

        let transport = CarTransport::with_fallback(server.uri());
        let bytes = transport
            .download("did:plc:alice", &opts_for(None), Some(&progress))
            .await
            .unwrap();
        assert_eq!(bytes.len(), 64);

        let seen = seen.lock().unwrap();
        assert_eq!(*seen.last().unwrap(), 64);
        // Cumulative: monotonically non-decreasing.
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_latest_commit_falls_back() {
        let primary = MockServer::start().await;
        let secondary = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(GET_LATEST))
            .respond_with(ResponseTemplate::new(503))
            .mount(&primary)
            .await;
        Mock::given(method("GET"))
            .and(path(GET_LATEST))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "cid": "bafyreib2rxk3rybloqtpwxev6skqdgvlfp2ewvqkdmvfrb4fhqnjdqftsu",
                "rev": "3lcgf5abc2k2a"
            })))
            .mount(&secondary)
            .await;

        let transport = CarTransport::with_fallback(secondary.uri());
        let commit = transport
            .latest_commit("did:plc:alice", Some(&primary.uri()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(commit.rev, "3lcgf5abc2k2a");
    }

    #[tokio::test]
    async fn test_latest_commit_all_endpoints_down() {
        // Nothing listening on either endpoint.
        let transport = CarTransport::with_fallback("http://127.0.0.1:1");
        let err = transport
            .latest_commit(
                "did:plc:alice",
                Some("http://127.0.0.1:2"),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepoSyncError::Network(_)));
    }

    #[test]
    fn test_since_rejection_detection() {
        assert!(is_since_rejection(
            r#"{"error":"InvalidRequest","message":"bad since"}"#
        ));
        assert!(is_since_rejection(
            r#"{"error":"MethodNotImplemented","message":""}"#
        ));
        assert!(!is_since_rejection(r#"{"error":"RepoNotFound","message":"missing"}"#));
        assert!(!is_since_rejection("not json"));
    }

    #[test]
    fn test_progress_percent() {
        let p = DownloadProgress {
            bytes: 25,
            total: Some(100),
        };
        assert_eq!(p.percent(), Some(25.0));
        let unknown = DownloadProgress {
            bytes: 25,
            total: None,
        };
        assert_eq!(unknown.percent(), None);
    }

    #[tokio::test]
    async fn test_incremental_query_is_missing_on_full_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(GET_REPO))
            .and(query_param_is_missing("since"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5]))
            .mount(&server)
            .await;

        let transport = CarTransport::with_fallback(server.uri());
        let bytes = transport
            .download("did:plc:alice", &opts_for(None), None)
            .await
            .unwrap();
        assert_eq!(bytes, vec![5]);
    }
}
