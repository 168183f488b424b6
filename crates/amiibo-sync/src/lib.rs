//! Configuration, catalog/collection reconciliation and the line-up backfill job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use amiibo_adapters::{
    AmiiboApiFeed, CatalogDatabase, CatalogError, CatalogFeed, CatalogProvider, CatalogSource,
    NintendoLineupAdapter, DEFAULT_API_URL, DEFAULT_LINEUP_URL,
};
use amiibo_core::{MergedView, ToggleAction, UserContext, UserPreferences};
use amiibo_storage::{
    BackoffPolicy, CollectionStore, HttpClientConfig, HttpFetcher, MemoryCollectionStore, SheetsCollectionStore,
    SheetsConfig, SnapshotStore, StoreError,
};
use anyhow::Result;
use thiserror::Error;
use tracing::{info, warn};

mod backfill;

pub use backfill::{
    apply_scraped, auto_backfill, find_best_match, normalize_name, placeholder_entry, rank_candidates,
    BackfillJob, MatchCandidate, MatchOutcome, MergeCounts, ScrapeOutcome, ScrapeStatus,
};

pub const CRATE_NAME: &str = "amiibo-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sheets,
    Memory,
}

impl StoreBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sheets" | "google" => Some(Self::Sheets),
            "memory" | "mem" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub api_url: String,
    pub lineup_url: String,
    pub snapshot_path: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scrape_interval_hours: u64,
    pub min_similarity: f64,
    pub auto_backfill: bool,
    pub include_all_types: bool,
    pub store_backend: StoreBackend,
    pub sheets_api_base: String,
    pub web_port: u16,
    /// Shared secret a caller must present to force a scrape past the staleness guard.
    pub scrape_token: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_url: lookup("AMIIBO_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            lineup_url: lookup("AMIIBO_LINEUP_URL").unwrap_or_else(|| DEFAULT_LINEUP_URL.to_string()),
            snapshot_path: lookup("AMIIBO_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/amiibo_database.json")),
            http_timeout_secs: parse_var(&lookup, "AMIIBO_HTTP_TIMEOUT_SECS").unwrap_or(10),
            user_agent: lookup("AMIIBO_USER_AGENT")
                .unwrap_or_else(|| format!("amiibo-tracker/{}", env!("CARGO_PKG_VERSION"))),
            scrape_interval_hours: parse_var(&lookup, "AMIIBO_SCRAPE_INTERVAL_HOURS").unwrap_or(6),
            min_similarity: parse_var(&lookup, "AMIIBO_MIN_SIMILARITY")
                .filter(|v: &f64| (0.0..=1.0).contains(v))
                .unwrap_or(0.9),
            auto_backfill: lookup("AMIIBO_AUTO_BACKFILL")
                .map(|v| truthy(&v))
                .unwrap_or(false),
            include_all_types: lookup("AMIIBO_INCLUDE_ALL_TYPES")
                .map(|v| truthy(&v))
                .unwrap_or(false),
            store_backend: lookup("AMIIBO_STORE")
                .and_then(|v| StoreBackend::parse(&v))
                .unwrap_or(StoreBackend::Sheets),
            sheets_api_base: lookup("AMIIBO_SHEETS_API_BASE")
                .unwrap_or_else(|| SheetsConfig::default().api_base),
            web_port: parse_var(&lookup, "AMIIBO_WEB_PORT").unwrap_or(8000),
            scrape_token: lookup("AMIIBO_SCRAPE_TOKEN")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_hours * 3600)
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(self.snapshot_path.clone())
    }

    /// Retrying fetcher for background work (line-up scrape, backfill reference).
    pub fn http_fetcher(&self) -> Result<Arc<HttpFetcher>> {
        self.fetcher_with(BackoffPolicy::default())
    }

    /// Single-attempt fetcher for catalog reads made while a request is waiting;
    /// a failure falls straight through to the snapshot.
    pub fn request_fetcher(&self) -> Result<Arc<HttpFetcher>> {
        self.fetcher_with(BackoffPolicy::none())
    }

    fn fetcher_with(&self, backoff: BackoffPolicy) -> Result<Arc<HttpFetcher>> {
        Ok(Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff,
        })?))
    }

    pub fn catalog_feed(&self, http: Arc<HttpFetcher>) -> Arc<dyn CatalogFeed> {
        Arc::new(AmiiboApiFeed::new(http, self.api_url.clone()))
    }

    pub fn catalog_source(&self, http: Arc<HttpFetcher>) -> CatalogSource {
        CatalogSource::new(Some(self.catalog_feed(http)), Some(self.snapshot_store()))
            .with_all_types(self.include_all_types)
    }

    pub fn catalog_database(&self, http: Arc<HttpFetcher>) -> CatalogDatabase {
        CatalogDatabase::new(Some(self.catalog_feed(http)), Some(self.snapshot_store()))
    }

    pub fn collection_store(&self) -> Result<Arc<dyn CollectionStore>> {
        Ok(match self.store_backend {
            StoreBackend::Memory => {
                warn!("using in-memory collection store; state is lost on restart");
                Arc::new(MemoryCollectionStore::new())
            }
            StoreBackend::Sheets => Arc::new(SheetsCollectionStore::new(SheetsConfig {
                api_base: self.sheets_api_base.clone(),
                timeout: Duration::from_secs(self.http_timeout_secs),
                ..Default::default()
            })?),
        })
    }

    pub fn backfill_job(&self, http: Arc<HttpFetcher>) -> BackfillJob {
        let lineup = Arc::new(NintendoLineupAdapter::new(http.clone(), self.lineup_url.clone()));
        let job = BackfillJob::new(self.snapshot_store(), lineup).with_interval(self.scrape_interval());
        if self.auto_backfill {
            job.with_reference(self.catalog_feed(http), self.min_similarity)
        } else {
            job
        }
    }
}

/// Everything the HTTP surface and the CLI need, wired from one config.
pub struct TrackerServices {
    pub engine: Arc<ReconciliationEngine>,
    pub backfill: Arc<BackfillJob>,
    pub database: Arc<CatalogDatabase>,
    pub scrape_token: Option<String>,
}

impl TrackerServices {
    pub fn from_config(config: &TrackerConfig) -> Result<Self> {
        let http = config.http_fetcher()?;
        let request_http = config.request_fetcher()?;
        let catalog: Arc<dyn CatalogProvider> = Arc::new(config.catalog_source(request_http.clone()));
        let store = config.collection_store()?;
        info!(
            snapshot = %config.snapshot_path.display(),
            store = ?config.store_backend,
            auto_backfill = config.auto_backfill,
            scrape_token = config.scrape_token.is_some(),
            "tracker services configured"
        );
        Ok(Self {
            engine: Arc::new(ReconciliationEngine::new(catalog, store)),
            backfill: Arc::new(config.backfill_job(http)),
            database: Arc::new(config.catalog_database(request_http)),
            scrape_token: config.scrape_token.clone(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    CatalogUnavailable(#[from] CatalogError),
    #[error("amiibo {0} is not in the current catalog")]
    UnknownAmiibo(String),
    #[error("amiibo {0} is an unconfirmed line-up placeholder")]
    AwaitingBackfill(String),
    #[error("reading collection state failed: {0}")]
    StoreReadFailed(#[source] StoreError),
    #[error("writing collection state failed: {0}")]
    StoreWriteFailed(#[source] StoreError),
}

impl ReconcileError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::CatalogUnavailable(_) => {
                "The amiibo catalog is unavailable right now. Please try again later."
            }
            Self::UnknownAmiibo(_) => "That amiibo is no longer in the catalog. Please reload the page.",
            Self::AwaitingBackfill(_) => {
                "That amiibo has been announced but is not in the catalog yet. It can be tracked once its details are confirmed."
            }
            Self::StoreReadFailed(err) | Self::StoreWriteFailed(err) => err.user_message(),
        }
    }
}

/// Joins the catalog with one user's collection state and applies toggles.
pub struct ReconciliationEngine {
    catalog: Arc<dyn CatalogProvider>,
    store: Arc<dyn CollectionStore>,
    retry_delay: Duration,
}

impl ReconciliationEngine {
    pub fn new(catalog: Arc<dyn CatalogProvider>, store: Arc<dyn CollectionStore>) -> Self {
        Self {
            catalog,
            store,
            retry_delay: Duration::from_millis(250),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub async fn render_view(&self, user: &UserContext) -> Result<MergedView, ReconcileError> {
        let records = self.catalog.fetch_catalog().await?;
        let states = self
            .store
            .read_all(user)
            .await
            .map_err(ReconcileError::StoreReadFailed)?;
        let preferences = self
            .store
            .read_preferences(user)
            .await
            .map_err(ReconcileError::StoreReadFailed)?;
        Ok(MergedView::build(records, &states, preferences))
    }

    /// Set the collected flag for `amiibo_id` and return the new state.
    ///
    /// `action` maps to a target state rather than a flip, so a retried
    /// request lands on the same value.
    pub async fn toggle(
        &self,
        user: &UserContext,
        amiibo_id: &str,
        amiibo_name: Option<&str>,
        action: ToggleAction,
    ) -> Result<bool, ReconcileError> {
        let records = self.catalog.fetch_catalog().await?;
        let Some(record) = records.iter().find(|r| r.id == amiibo_id) else {
            return Err(ReconcileError::UnknownAmiibo(amiibo_id.to_string()));
        };
        // Placeholder ids change when backfill fills them, which would orphan the row.
        if record.needs_backfill {
            return Err(ReconcileError::AwaitingBackfill(amiibo_id.to_string()));
        }
        let name = amiibo_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(record.name.as_str());
        let collected = action.collected();

        match self.store.write(user, amiibo_id, name, collected).await {
            Ok(()) => {}
            Err(err) if err.is_retryable() => {
                warn!(error = %err, amiibo_id, "collection write failed; retrying once");
                tokio::time::sleep(self.retry_delay).await;
                self.store
                    .write(user, amiibo_id, name, collected)
                    .await
                    .map_err(ReconcileError::StoreWriteFailed)?;
            }
            Err(err) => return Err(ReconcileError::StoreWriteFailed(err)),
        }

        info!(amiibo_id, %action, collected, "collection updated");
        Ok(collected)
    }

    pub async fn preferences(&self, user: &UserContext) -> Result<UserPreferences, ReconcileError> {
        self.store
            .read_preferences(user)
            .await
            .map_err(ReconcileError::StoreReadFailed)
    }

    pub async fn set_dark_mode(
        &self,
        user: &UserContext,
        dark_mode: bool,
    ) -> Result<UserPreferences, ReconcileError> {
        let preferences = UserPreferences { dark_mode };
        self.store
            .write_preferences(user, preferences)
            .await
            .map_err(ReconcileError::StoreWriteFailed)?;
        Ok(preferences)
    }
}
