//! Catalog source adapters: the remote amiibo feed with snapshot fallback, and
//! the Nintendo line-up page used to discover upcoming releases.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use amiibo_core::{AmiiboRecord, CatalogDocument, CatalogEntry};
use amiibo_storage::{FetchError, HttpFetcher, SnapshotStore};
use async_trait::async_trait;
use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "amiibo-adapters";

pub const DEFAULT_API_URL: &str = "https://amiiboapi.org/api/amiibo/";
pub const DEFAULT_LINEUP_URL: &str = "https://www.nintendo.com/us/amiibo/line-up/";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {source_id} payload: {message}")]
    Decode {
        source_id: &'static str,
        message: String,
    },
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog unavailable (remote: {remote}; snapshot: {snapshot})")]
    Unavailable { remote: String, snapshot: String },
}

/// Raw catalog entries straight from a remote feed, no fallback.
#[async_trait]
pub trait CatalogFeed: Send + Sync {
    fn feed_id(&self) -> &'static str;

    async fn fetch_entries(&self) -> Result<Vec<CatalogEntry>, AdapterError>;
}

/// Normalized catalog as consumed by reconciliation.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Vec<AmiiboRecord>, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct AmiiboApiFeed {
    http: Arc<HttpFetcher>,
    url: String,
}

impl AmiiboApiFeed {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CatalogFeed for AmiiboApiFeed {
    fn feed_id(&self) -> &'static str {
        "amiiboapi"
    }

    async fn fetch_entries(&self) -> Result<Vec<CatalogEntry>, AdapterError> {
        let resp = self.http.fetch_bytes(self.feed_id(), &self.url).await?;
        let doc = CatalogDocument::from_json_slice(&resp.body).map_err(|e| AdapterError::Decode {
            source_id: "amiiboapi",
            message: e.to_string(),
        })?;
        if doc.amiibo.is_empty() {
            return Err(AdapterError::Message(format!(
                "{} returned an empty catalog",
                resp.final_url
            )));
        }
        Ok(doc.amiibo)
    }
}

/// Remote-first catalog with a read-only fallback to the local snapshot.
pub struct CatalogSource {
    feed: Option<Arc<dyn CatalogFeed>>,
    snapshot: Option<SnapshotStore>,
    include_all_types: bool,
}

impl CatalogSource {
    pub fn new(feed: Option<Arc<dyn CatalogFeed>>, snapshot: Option<SnapshotStore>) -> Self {
        Self {
            feed,
            snapshot,
            include_all_types: false,
        }
    }

    pub fn with_all_types(mut self, include_all_types: bool) -> Self {
        self.include_all_types = include_all_types;
        self
    }

    async fn remote_entries(&self) -> Result<Vec<CatalogEntry>, String> {
        feed_entries(self.feed.as_deref()).await
    }

    async fn snapshot_entries(&self) -> Result<Vec<CatalogEntry>, String> {
        snapshot_entries(self.snapshot.as_ref()).await
    }
}

async fn feed_entries(feed: Option<&dyn CatalogFeed>) -> Result<Vec<CatalogEntry>, String> {
    let Some(feed) = feed else {
        return Err("no remote feed configured".to_string());
    };
    feed.fetch_entries().await.map_err(|e| e.to_string())
}

async fn snapshot_entries(snapshot: Option<&SnapshotStore>) -> Result<Vec<CatalogEntry>, String> {
    let Some(snapshot) = snapshot else {
        return Err("no snapshot configured".to_string());
    };
    snapshot.load().await.map_err(|e| format!("{e:#}"))
}

#[async_trait]
impl CatalogProvider for CatalogSource {
    async fn fetch_catalog(&self) -> Result<Vec<AmiiboRecord>, CatalogError> {
        match self.remote_entries().await {
            Ok(mut entries) => {
                // Scraper discoveries only live in the snapshot until upstream catches up.
                if let Ok(local) = self.snapshot_entries().await {
                    let known: HashSet<String> = entries.iter().map(CatalogEntry::id).collect();
                    let upcoming = local
                        .into_iter()
                        .filter(|e| e.is_upcoming && !known.contains(&e.id()))
                        .collect::<Vec<_>>();
                    if !upcoming.is_empty() {
                        debug!(count = upcoming.len(), "overlaying upcoming snapshot entries");
                    }
                    entries.extend(upcoming);
                }
                Ok(normalize_entries(&entries, self.include_all_types))
            }
            Err(remote) => {
                warn!(error = %remote, "remote catalog fetch failed; falling back to snapshot");
                match self.snapshot_entries().await {
                    Ok(entries) => Ok(normalize_entries(&entries, self.include_all_types)),
                    Err(snapshot) => Err(CatalogError::Unavailable { remote, snapshot }),
                }
            }
        }
    }
}

/// Case-insensitive substring filters for the public catalog listing. Blank
/// filters match everything.
#[derive(Debug, Clone, Default)]
pub struct DatabaseQuery {
    pub name: Option<String>,
    pub game_series: Option<String>,
    pub character: Option<String>,
    /// Keep the per-game usage lists (`gamesSwitch`, `games3DS`, `gamesWiiU`).
    pub show_usage: bool,
}

impl DatabaseQuery {
    pub fn matches(&self, entry: &CatalogEntry) -> bool {
        [
            (&self.name, &entry.name),
            (&self.game_series, &entry.game_series),
            (&self.character, &entry.character),
        ]
        .into_iter()
        .all(|(wanted, value)| match wanted.as_deref().map(str::trim) {
            Some(wanted) if !wanted.is_empty() => {
                value.to_lowercase().contains(&wanted.to_lowercase())
            }
            _ => true,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseListing {
    pub amiibo: Vec<CatalogEntry>,
    /// Remote entries the local snapshot does not have yet.
    pub missing_count: usize,
}

/// Full catalog listing in upstream wire form: the local snapshot, enriched
/// and completed by the remote feed. Unlike [`CatalogSource`] no types are
/// filtered out.
pub struct CatalogDatabase {
    feed: Option<Arc<dyn CatalogFeed>>,
    snapshot: Option<SnapshotStore>,
}

impl CatalogDatabase {
    pub fn new(feed: Option<Arc<dyn CatalogFeed>>, snapshot: Option<SnapshotStore>) -> Self {
        Self { feed, snapshot }
    }

    pub async fn list(&self, query: &DatabaseQuery) -> Result<DatabaseListing, CatalogError> {
        let (local, remote) = tokio::join!(
            snapshot_entries(self.snapshot.as_ref()),
            feed_entries(self.feed.as_deref())
        );
        let (mut entries, missing_count) = match (local, remote) {
            (Ok(local), Ok(remote)) => merge_remote(local, remote),
            (Ok(local), Err(remote)) => {
                warn!(error = %remote, "remote catalog unavailable; listing snapshot only");
                (local, 0)
            }
            (Err(snapshot), Ok(remote)) => {
                warn!(error = %snapshot, "snapshot unavailable; listing remote catalog only");
                let missing = remote.len();
                (remote, missing)
            }
            (Err(snapshot), Err(remote)) => return Err(CatalogError::Unavailable { remote, snapshot }),
        };

        entries.retain(|e| query.matches(e));
        if !query.show_usage {
            for entry in &mut entries {
                entry.extra.retain(|key, _| !key.starts_with("games"));
            }
        }
        Ok(DatabaseListing {
            amiibo: entries,
            missing_count,
        })
    }
}

/// Snapshot entries first, each filling unmodeled fields it lacks from its
/// remote twin, then remote entries the snapshot has never seen.
fn merge_remote(local: Vec<CatalogEntry>, remote: Vec<CatalogEntry>) -> (Vec<CatalogEntry>, usize) {
    let mut remote_by_id: HashMap<String, CatalogEntry> =
        remote.iter().map(|e| (e.id(), e.clone())).collect();
    let mut merged = Vec::with_capacity(local.len());
    for mut entry in local {
        if let Some(twin) = remote_by_id.remove(&entry.id()) {
            for (key, value) in twin.extra {
                entry.extra.entry(key).or_insert(value);
            }
            if entry.image.is_empty() {
                entry.image = twin.image;
            }
        }
        merged.push(entry);
    }

    let missing = remote
        .into_iter()
        .filter(|e| remote_by_id.remove(&e.id()).is_some())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        let sample = missing.iter().take(5).map(|e| e.name.as_str()).collect::<Vec<_>>();
        warn!(missing_count = missing.len(), ?sample, "amiibo database missing items");
    }
    let missing_count = missing.len();
    merged.extend(missing);
    (merged, missing_count)
}

/// Fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    records: Vec<AmiiboRecord>,
}

impl StaticCatalog {
    pub fn new(records: Vec<AmiiboRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl CatalogProvider for StaticCatalog {
    async fn fetch_catalog(&self) -> Result<Vec<AmiiboRecord>, CatalogError> {
        Ok(self.records.clone())
    }
}

/// Convert wire entries into canonical records, dropping duplicate ids and,
/// unless `include_all_types`, cards, plushes and bands.
pub fn normalize_entries(entries: &[CatalogEntry], include_all_types: bool) -> Vec<AmiiboRecord> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .map(CatalogEntry::to_record)
        .filter(|r| include_all_types || r.kind.is_tracked_by_default())
        .filter(|r| seen.insert(r.id.clone()))
        .collect()
}

/// One tile scraped from the Nintendo line-up page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedAmiibo {
    pub name: String,
    pub series: String,
    pub release_date: Option<String>,
    pub image_url: String,
}

#[async_trait]
pub trait LineupSource: Send + Sync {
    async fn fetch_lineup(&self) -> Result<Vec<ScrapedAmiibo>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct NintendoLineupAdapter {
    http: Arc<HttpFetcher>,
    url: String,
}

impl NintendoLineupAdapter {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl LineupSource for NintendoLineupAdapter {
    async fn fetch_lineup(&self) -> Result<Vec<ScrapedAmiibo>, AdapterError> {
        let resp = self.http.fetch_bytes("nintendo-lineup", &self.url).await?;
        let html = String::from_utf8_lossy(&resp.body);
        let scraped = parse_lineup_html(&html, &origin_of(&resp.final_url))?;
        info!(count = scraped.len(), url = %resp.final_url, "parsed nintendo line-up");
        Ok(scraped)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `scheme://host` of a URL, used to absolutize root-relative image paths.
pub fn origin_of(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return String::new();
    };
    let host = rest.split('/').next().unwrap_or_default();
    format!("{scheme}://{host}")
}

/// Extract amiibo tiles from the line-up page. Tiles are detail links; the name
/// lives in `aria-label`, and `<p>` children carry series and availability text.
pub fn parse_lineup_html(html: &str, origin: &str) -> Result<Vec<ScrapedAmiibo>, AdapterError> {
    let document = Html::parse_document(html);
    let link_sel = selector(r#"a[href*="/us/amiibo/detail/"]"#)?;
    let img_sel = selector("img")?;
    let p_sel = selector("p")?;

    let mut out = Vec::new();
    for link in document.select(&link_sel) {
        let name = link
            .value()
            .attr("aria-label")
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            debug!(href = link.value().attr("href").unwrap_or("unknown"), "tile without aria-label");
            continue;
        }
        if is_set_or_bundle(&name) {
            debug!(%name, "skipping set/bundle");
            continue;
        }

        let image_url = link
            .select(&img_sel)
            .next()
            .and_then(|img| {
                let attrs = img.value();
                attrs
                    .attr("src")
                    .filter(|s| !s.trim().is_empty())
                    .or_else(|| attrs.attr("data-src"))
            })
            .map(|src| absolutize(src.trim(), origin))
            .unwrap_or_default();

        let mut series = String::new();
        let mut date_text = String::new();
        for p in link.select(&p_sel) {
            let text = text_of(p);
            if text.is_empty() {
                continue;
            }
            if contains_date(&text) {
                date_text = text;
            } else if series.is_empty() && text.to_ascii_lowercase().contains("series") {
                series = text;
            }
        }

        out.push(ScrapedAmiibo {
            name,
            series: clean_series(&series),
            release_date: parse_release_date(&date_text),
            image_url,
        });
    }
    Ok(out)
}

fn absolutize(src: &str, origin: &str) -> String {
    if src.is_empty() || src.starts_with("http") {
        src.to_string()
    } else if let Some(rest) = src.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        format!("{origin}{src}")
    }
}

/// `M/D/YY` or `M/D/YYYY` tokens as `(month, day, year-digits)`.
fn slash_dates(text: &str) -> Vec<(u32, u32, &str)> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '/'))
        .filter_map(|token| {
            let parts = token.split('/').collect::<Vec<_>>();
            let [m, d, y] = parts.as_slice() else {
                return None;
            };
            let ok = (1..=2).contains(&m.len())
                && (1..=2).contains(&d.len())
                && (2..=4).contains(&y.len());
            if !ok {
                return None;
            }
            Some((m.parse().ok()?, d.parse().ok()?, *y))
        })
        .collect()
}

/// First `20xx` year appearing anywhere in the text.
fn find_year(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    (0..bytes.len().saturating_sub(3)).find_map(|i| {
        let window = &bytes[i..i + 4];
        (window[0] == b'2' && window[1] == b'0' && window[2].is_ascii_digit() && window[3].is_ascii_digit())
            .then(|| &text[i..i + 4])
    })
}

pub fn contains_date(text: &str) -> bool {
    if !slash_dates(text).is_empty() || find_year(text).is_some() {
        return true;
    }
    text.match_indices("Available").any(|(idx, m)| {
        let rest = &text[idx + m.len()..];
        let trimmed = rest.trim_start();
        trimmed.len() < rest.len() && trimmed.starts_with(|c: char| c.is_ascii_digit())
    })
}

/// Normalize availability text to `YYYY-MM-DD`. A bare year becomes Dec 31st so
/// an unannounced date never reads as an early-year release.
pub fn parse_release_date(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }

    if let Some((month, day, year)) = slash_dates(text).into_iter().next() {
        let full_year = match (year.len(), year.parse::<i32>()) {
            (2, Ok(y)) if y < 69 => Some(2000 + y),
            (2, Ok(y)) => Some(1900 + y),
            (4, Ok(y)) => Some(y),
            _ => None,
        };
        if let Some(date) = full_year.and_then(|y| NaiveDate::from_ymd_opt(y, month, day)) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }

    find_year(text).map(|year| format!("{year}-12-31"))
}

/// Strip a trailing " series" from the line-up's series label.
pub fn clean_series(series: &str) -> String {
    let trimmed = series.trim();
    let lower = trimmed.to_ascii_lowercase();
    match lower.strip_suffix("series") {
        Some(head) if head.ends_with(char::is_whitespace) => trimmed[..head.len()].trim_end().to_string(),
        _ => trimmed.to_string(),
    }
}

const SET_INDICATORS: &[&str] = &[
    "starter set",
    "card set",
    "pack",
    "bundle",
    "collection",
    "power-up band",
    "power up band",
    "cards - series",
    "card series",
    "amiibo cards series",
    "multipack",
];

/// Sets, bundles, multi-packs and numbered card series are not individual figures.
pub fn is_set_or_bundle(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if SET_INDICATORS.iter().any(|needle| lower.contains(needle)) {
        return true;
    }
    // "... Series 3"
    let mut words = lower.split_whitespace().rev();
    match (words.next(), words.next()) {
        (Some(last), Some("series")) => last.chars().all(|c| c.is_ascii_digit()),
        _ => false,
    }
}
