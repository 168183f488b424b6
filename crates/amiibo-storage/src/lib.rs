//! Snapshot file storage, HTTP fetch utilities and collection-state stores.

use std::path::{Path, PathBuf};
use std::time::Duration;

use amiibo_core::{CatalogDocument, CatalogEntry};
use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, Instrument};
use uuid::Uuid;

mod collection;
mod sheets;

pub use collection::{CollectionStore, MemoryCollectionStore, StoreError};
pub use sheets::{
    classify_sheets_status, locate_row, parse_collection_rows, SheetsCollectionStore,
    SheetsConfig,
};

pub const CRATE_NAME: &str = "amiibo-storage";

#[derive(Debug, Clone)]
pub struct SavedSnapshot {
    pub entries: usize,
}

/// Local JSON snapshot of the catalog, shared by the catalog adapter (read-only)
/// and the backfill job (writer).
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<Vec<CatalogEntry>> {
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading snapshot {}", self.path.display()))?;
        let doc = CatalogDocument::from_json_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
        Ok(doc.amiibo)
    }

    /// Like [`SnapshotStore::load`], but a missing file is `None` rather than an error.
    pub async fn load_optional(&self) -> anyhow::Result<Option<Vec<CatalogEntry>>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking snapshot path {}", self.path.display()))?
        {
            return Ok(None);
        }
        self.load().await.map(Some)
    }

    /// Replace the snapshot via a temp file in the same directory plus rename,
    /// so an interrupted write never leaves a truncated snapshot behind.
    pub async fn save_atomic(&self, entries: &[CatalogEntry]) -> anyhow::Result<SavedSnapshot> {
        let doc = CatalogDocument {
            amiibo: entries.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&doc).context("serializing snapshot")?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
            file.sync_all()
                .await
                .with_context(|| format!("syncing temp snapshot {}", temp_path.display()))?;
            anyhow::Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        Ok(SavedSnapshot {
            entries: entries.len(),
        })
    }

    pub async fn modified_at(&self) -> Option<DateTime<Utc>> {
        let meta = fs::metadata(&self.path).await.ok()?;
        meta.modified().ok().map(DateTime::<Utc>::from)
    }

    /// Staleness guard: a missing or unreadable snapshot is always stale.
    pub async fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let Some(modified) = self.modified_at().await else {
            return true;
        };
        match (now - modified).to_std() {
            Ok(age) => age >= max_age,
            // mtime in the future: treat as fresh
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
            backoff: config.backoff,
        })
    }

    /// GET `url` with bounded retries on timeouts, connection errors, 429 and 5xx.
    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse { final_url, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(name: &str) -> CatalogEntry {
        CatalogEntry {
            head: "00000000".into(),
            tail: "00000002".into(),
            game_series: "Super Mario".into(),
            amiibo_series: "Super Mario Bros.".into(),
            name: name.into(),
            kind: "Figure".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn atomic_save_replaces_snapshot_without_leftover_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("data/amiibo_database.json"));

        assert!(store.load_optional().await.unwrap().is_none());

        store.save_atomic(&[entry("Mario")]).await.expect("first save");
        let saved = store
            .save_atomic(&[entry("Mario"), entry("Luigi")])
            .await
            .expect("second save");
        assert_eq!(saved.entries, 2);

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].name, "Luigi");

        let leftovers = std::fs::read_dir(dir.path().join("data"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error_not_an_empty_catalog() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("amiibo_database.json");
        std::fs::write(&path, b"{\"amiibo\": [").unwrap();
        let store = SnapshotStore::new(&path);
        assert!(store.load_optional().await.is_err());
    }

    #[tokio::test]
    async fn staleness_guard_uses_file_mtime() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("amiibo_database.json"));
        let six_hours = Duration::from_secs(6 * 3600);

        assert!(store.is_stale(six_hours, Utc::now()).await);

        store.save_atomic(&[entry("Mario")]).await.unwrap();
        assert!(!store.is_stale(six_hours, Utc::now()).await);
        assert!(
            store
                .is_stale(six_hours, Utc::now() + chrono::Duration::hours(7))
                .await
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));

        let once = BackoffPolicy::none();
        assert_eq!(once.max_retries, 0);
        assert_eq!(once.base_delay, BackoffPolicy::default().base_delay);
    }

    #[test]
    fn only_server_errors_and_throttling_are_retried() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}
