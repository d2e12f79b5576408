//! Durable artifact writing + rate-limited HTTP fetch utilities for the TCIA sync.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tcia-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub name: String,
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Directory of named artifacts that readers only ever observe fully written.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Replace the artifact `name` with `bytes` via temp file + atomic rename.
    pub async fn write_atomic(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let path = self.path_for(name);
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("writing temp artifact file {}", temp_path.display()));
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        debug!(artifact = name, bytes = bytes.len(), "artifact written");
        Ok(StoredArtifact {
            name: name.to_string(),
            path,
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    /// Contents of `name`, or `None` when it has never been written.
    pub async fn read(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading artifact {}", path.display())),
        }
    }
}

/// Upstream responses worth another attempt: throttling, timeouts, server faults.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Doubling backoff; a server-supplied hint replaces it. Both are capped.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(2u32.checked_pow(attempt).unwrap_or(u32::MAX));
        hint.unwrap_or(doubled).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across every feed.
    pub max_in_flight: usize,
    pub per_feed_in_flight: usize,
    /// Minimum gap between request starts against one feed.
    pub min_request_spacing: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 8,
            per_feed_in_flight: 4,
            min_request_spacing: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Hands out request start times at least `spacing` apart.
#[derive(Debug)]
pub struct RequestPacer {
    spacing: Duration,
    next_slot: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait_turn(&self) {
        let wait = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let start = (*next_slot).max(now);
            *next_slot = start + self.spacing;
            start - now
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug)]
struct FeedLimits {
    permits: Semaphore,
    pacer: Option<RequestPacer>,
}

/// Shared client for every upstream feed: bounded concurrency overall and per
/// feed, optional pacing, retries on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_feed_in_flight: usize,
    min_request_spacing: Option<Duration>,
    feeds: Mutex<HashMap<String, Arc<FeedLimits>>>,
    retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    /// Integer value of a response header such as `X-WP-TotalPages`.
    pub fn header_u32(&self, name: &str) -> Option<u32> {
        self.headers.get(name)?.to_str().ok()?.trim().parse().ok()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http fetcher is shut down")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_feed_in_flight: config.per_feed_in_flight.max(1),
            min_request_spacing: config.min_request_spacing.filter(|d| !d.is_zero()),
            feeds: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn limits_for(&self, feed: &str) -> Arc<FeedLimits> {
        let mut feeds = self.feeds.lock().await;
        let limits = feeds.entry(feed.to_string()).or_insert_with(|| {
            Arc::new(FeedLimits {
                permits: Semaphore::new(self.per_feed_in_flight),
                pacer: self.min_request_spacing.map(RequestPacer::new),
            })
        });
        Arc::clone(limits)
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        feed: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_accept(run_id, feed, url, None).await
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        feed: &str,
        url: &str,
    ) -> Result<(T, FetchedResponse), FetchError> {
        let resp = self
            .fetch_with_accept(run_id, feed, url, Some("application/json"))
            .await?;
        let parsed = serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url.clone(),
            source,
        })?;
        Ok((parsed, resp))
    }

    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        feed: &str,
        url: &str,
        accept: &str,
    ) -> Result<String, FetchError> {
        let resp = self.fetch_with_accept(run_id, feed, url, Some(accept)).await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }

    pub async fn fetch_with_accept(
        &self,
        run_id: Uuid,
        feed: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let limits = self.limits_for(feed).await;
        let _feed = limits.permits.acquire().await.map_err(|_| FetchError::Closed)?;
        if let Some(pacer) = &limits.pacer {
            pacer.wait_turn().await;
        }

        let span = info_span!("http_fetch", %run_id, feed, url);
        self.send_with_retries(url, accept).instrument(span).await
    }

    async fn send_with_retries(
        &self,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }

            let (hint, err) = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let headers = resp.headers().clone();
                    let body = resp.bytes().await?.to_vec();
                    debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        headers,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    if !is_transient_status(status) {
                        return Err(err);
                    }
                    (retry_after(resp.headers()), err)
                }
                Err(err) if is_transient_error(&err) => (None, FetchError::Request(err)),
                Err(err) => return Err(FetchError::Request(err)),
            };

            if attempt >= self.retry.max_retries {
                warn!(attempts = attempt + 1, error = %err, "giving up on upstream request");
                return Err(err);
            }
            let delay = self.retry.delay(attempt, hint);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying transient failure");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_replace_previous_contents() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .write_atomic("tcia_master_data.parquet", b"first")
            .await
            .expect("first write");
        let second = store
            .write_atomic("tcia_master_data.parquet", b"second run")
            .await
            .expect("second write");

        assert_eq!(first.path, second.path);
        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(second.byte_size, 10);
        let on_disk = store.read("tcia_master_data.parquet").await.expect("read");
        assert_eq!(on_disk.as_deref(), Some(&b"second run"[..]));

        let leftovers = std::fs::read_dir(dir.path())
            .expect("list dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn reading_a_missing_artifact_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path().join("nested"));
        assert!(store.read("citations_cache.parquet").await.expect("read").is_none());
    }

    #[test]
    fn retry_delay_doubles_and_respects_hints_under_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay(2, None), Duration::from_millis(350));
        assert_eq!(policy.delay(40, None), Duration::from_millis(350));
        assert_eq!(policy.delay(0, Some(Duration::from_millis(300))), Duration::from_millis(300));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(60))), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_faults_are_transient() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::NOT_ACCEPTABLE));
    }

    #[test]
    fn retry_after_reads_delta_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 7 "));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn total_pages_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("x-wp-totalpages", HeaderValue::from_static("12"));
        let resp = FetchedResponse {
            status: StatusCode::OK,
            final_url: "https://example.org".into(),
            headers,
            body: Vec::new(),
        };
        assert_eq!(resp.header_u32("X-WP-TotalPages"), Some(12));
        assert_eq!(resp.header_u32("x-wp-total"), None);
    }

    #[tokio::test]
    async fn pacer_spaces_request_starts() {
        let pacer = RequestPacer::new(Duration::from_millis(40));
        let started = Instant::now();
        pacer.wait_turn().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
