//! Core domain model for the amiibo collection tracker.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "amiibo-core";

/// Worksheet column headers for collection-state rows.
pub const COLLECTION_HEADER: [&str; 3] = ["Amiibo ID", "Amiibo Name", "Collected Status"];

/// Build the stable catalog identifier used as the collection join key.
pub fn amiibo_id(head: &str, game_series: &str, tail: &str) -> String {
    format!("{head}{game_series}{tail}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmiiboKind {
    Figure,
    Card,
    Plush,
    Band,
    Other,
}

impl AmiiboKind {
    /// Map the upstream `type` label onto a kind. Upstream calls plushes "Yarn".
    pub fn from_source_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "figure" => Self::Figure,
            "card" => Self::Card,
            "yarn" | "plush" => Self::Plush,
            "band" => Self::Band,
            _ => Self::Other,
        }
    }

    /// Cards, plushes and bands are only listed when explicitly requested.
    pub fn is_tracked_by_default(self) -> bool {
        matches!(self, Self::Figure | Self::Other)
    }
}

/// Per-region release dates as `YYYY-MM-DD` strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub na: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub au: Option<String>,
}

impl ReleaseDates {
    pub fn is_empty(&self) -> bool {
        self.na.is_none() && self.jp.is_none() && self.eu.is_none() && self.au.is_none()
    }
}

/// Catalog entry as exchanged with the remote feed and stored in the local snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    #[serde(default)]
    pub amiibo_series: String,
    #[serde(default)]
    pub character: String,
    #[serde(default)]
    pub game_series: String,
    pub head: String,
    #[serde(default)]
    pub image: String,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub release: ReleaseDates,
    pub tail: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "is_upcoming", default, skip_serializing_if = "is_false")]
    pub is_upcoming: bool,
    #[serde(rename = "needs_backfill", default, skip_serializing_if = "is_false")]
    pub needs_backfill: bool,
    /// Upstream fields not modeled here, such as the `gamesSwitch` usage lists.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl CatalogEntry {
    pub fn id(&self) -> String {
        amiibo_id(&self.head, &self.game_series, &self.tail)
    }

    pub fn to_record(&self) -> AmiiboRecord {
        let series = [&self.amiibo_series, &self.game_series]
            .into_iter()
            .find(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string());
        AmiiboRecord {
            id: self.id(),
            name: self.name.clone(),
            series,
            image_url: self.image.clone(),
            kind: AmiiboKind::from_source_label(&self.kind),
            release: self.release.clone(),
            is_upcoming: self.is_upcoming,
            needs_backfill: self.needs_backfill,
        }
    }
}

/// On-disk and on-wire catalog document. Both the wrapped `{"amiibo": [...]}`
/// form and a bare array are accepted when reading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub amiibo: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogDocumentRepr {
    Wrapped { amiibo: Vec<CatalogEntry> },
    Bare(Vec<CatalogEntry>),
}

impl CatalogDocument {
    pub fn from_json_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        let repr: CatalogDocumentRepr = serde_json::from_slice(bytes)?;
        Ok(match repr {
            CatalogDocumentRepr::Wrapped { amiibo } => Self { amiibo },
            CatalogDocumentRepr::Bare(amiibo) => Self { amiibo },
        })
    }
}

/// Canonical catalog entry used by reconciliation and rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmiiboRecord {
    pub id: String,
    pub name: String,
    pub series: String,
    pub image_url: String,
    pub kind: AmiiboKind,
    pub release: ReleaseDates,
    pub is_upcoming: bool,
    pub needs_backfill: bool,
}

/// One persisted collection-state row per (user, amiibo).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStateRow {
    pub amiibo_id: String,
    pub amiibo_name: String,
    pub collected: bool,
}

/// Spreadsheet cell value for a collected flag.
pub fn status_cell(collected: bool) -> &'static str {
    if collected {
        "1"
    } else {
        "0"
    }
}

/// Parse a spreadsheet status cell. Anything but `1`/`true` is uncollected.
pub fn parse_status_cell(cell: &str) -> bool {
    matches!(cell.trim().to_ascii_lowercase().as_str(), "1" | "true")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleAction {
    Collect,
    Uncollect,
}

impl ToggleAction {
    /// Target state for the action. Deterministic so retried requests are idempotent.
    pub fn collected(self) -> bool {
        matches!(self, Self::Collect)
    }
}

impl FromStr for ToggleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "collect" => Ok(Self::Collect),
            "uncollect" => Ok(Self::Uncollect),
            other => Err(format!("unknown toggle action: {other}")),
        }
    }
}

impl fmt::Display for ToggleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collect => f.write_str("collect"),
            Self::Uncollect => f.write_str("uncollect"),
        }
    }
}

/// Per-request identity and credential handle for the collection store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    /// Spreadsheet identifier that holds this user's collection.
    pub user_id: String,
    pub credential: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub dark_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedItem {
    pub record: AmiiboRecord,
    pub collected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesGroup {
    pub series: String,
    pub items: Vec<MergedItem>,
}

impl SeriesGroup {
    pub fn collected_count(&self) -> usize {
        self.items.iter().filter(|i| i.collected).count()
    }
}

/// Request-scoped join of the catalog with one user's collection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedView {
    pub groups: Vec<SeriesGroup>,
    pub total: usize,
    pub collected: usize,
    pub preferences: UserPreferences,
}

impl MergedView {
    /// Join records with collected flags; ids without a flag are uncollected.
    pub fn build(
        records: Vec<AmiiboRecord>,
        states: &BTreeMap<String, bool>,
        preferences: UserPreferences,
    ) -> Self {
        let mut grouped: BTreeMap<String, Vec<MergedItem>> = BTreeMap::new();
        for record in records {
            let collected = states.get(&record.id).copied().unwrap_or(false);
            grouped
                .entry(record.series.clone())
                .or_default()
                .push(MergedItem { record, collected });
        }

        let mut total = 0usize;
        let mut collected = 0usize;
        let groups = grouped
            .into_iter()
            .map(|(series, mut items)| {
                items.sort_by(|a, b| {
                    a.record
                        .name
                        .cmp(&b.record.name)
                        .then_with(|| a.record.id.cmp(&b.record.id))
                });
                total += items.len();
                collected += items.iter().filter(|i| i.collected).count();
                SeriesGroup { series, items }
            })
            .collect();

        Self {
            groups,
            total,
            collected,
            preferences,
        }
    }

    pub fn find(&self, amiibo_id: &str) -> Option<&MergedItem> {
        self.groups
            .iter()
            .flat_map(|g| g.items.iter())
            .find(|i| i.record.id == amiibo_id)
    }
}
