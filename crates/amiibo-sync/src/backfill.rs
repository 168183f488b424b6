use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use amiibo_adapters::{CatalogFeed, LineupSource, ScrapedAmiibo};
use amiibo_core::{CatalogEntry, ReleaseDates};
use amiibo_storage::SnapshotStore;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use tracing::{info, info_span, warn, Instrument};

/// Lower-case, drop parentheticals and punctuation, collapse whitespace.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut depth = 0usize;
    for c in name.chars() {
        match c {
            '(' => {
                depth += 1;
                out.push(' ');
            }
            ')' if depth > 0 => depth -= 1,
            _ if depth > 0 => {}
            c if c.is_alphanumeric() => out.extend(c.to_lowercase()),
            c if c.is_whitespace() || c == '_' => out.push(' '),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn longest_common_substring(a: &str, b: &str) -> usize {
    let a = a.chars().collect::<Vec<_>>();
    let b = b.chars().collect::<Vec<_>>();
    let mut prev = vec![0usize; b.len() + 1];
    let mut best = 0;
    for ca in &a {
        let mut row = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                row[j + 1] = prev[j] + 1;
                best = best.max(row[j + 1]);
            }
        }
        prev = row;
    }
    best
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCandidate {
    /// Position in the snapshot entries.
    pub index: usize,
    pub name: String,
    pub exact: bool,
    pub common_len: usize,
}

impl MatchCandidate {
    fn same_rank(&self, other: &Self) -> bool {
        self.exact == other.exact && self.common_len == other.common_len
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(usize),
    Ambiguous(Vec<usize>),
    NoMatch,
}

/// Catalog entries whose normalized name contains the scraped name, best
/// first: exact normalized equality, then longer common substring, then name.
/// A scraped name that merely contains a catalog name ("Mario - Gold Edition"
/// vs "Mario") is a different figure and is not a candidate.
pub fn rank_candidates(scraped_name: &str, entries: &[CatalogEntry]) -> Vec<MatchCandidate> {
    let needle = normalize_name(scraped_name);
    if needle.is_empty() {
        return Vec::new();
    }

    let mut candidates = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let hay = normalize_name(&entry.name);
            if !hay.contains(&needle) {
                return None;
            }
            Some(MatchCandidate {
                index,
                name: entry.name.clone(),
                exact: hay == needle,
                common_len: longest_common_substring(&hay, &needle),
            })
        })
        .collect::<Vec<_>>();

    candidates.sort_by(|a, b| {
        b.exact
            .cmp(&a.exact)
            .then_with(|| b.common_len.cmp(&a.common_len))
            .then_with(|| a.name.cmp(&b.name))
    });
    candidates
}

pub fn find_best_match(scraped_name: &str, entries: &[CatalogEntry]) -> MatchOutcome {
    let candidates = rank_candidates(scraped_name, entries);
    let Some(top) = candidates.first() else {
        return MatchOutcome::NoMatch;
    };
    let tied = candidates
        .iter()
        .take_while(|c| c.same_rank(top))
        .map(|c| c.index)
        .collect::<Vec<_>>();
    if tied.len() == 1 {
        MatchOutcome::Matched(top.index)
    } else {
        MatchOutcome::Ambiguous(tied)
    }
}

/// New snapshot entry for a line-up item with no single catalog match.
/// Head and tail derive from the name hash, so repeated scrapes yield the same id.
pub fn placeholder_entry(scraped: &ScrapedAmiibo) -> CatalogEntry {
    let digest = hex::encode(Sha256::digest(scraped.name.as_bytes()));
    let series = scraped.series.trim().to_string();
    CatalogEntry {
        amiibo_series: series.clone(),
        character: scraped.name.clone(),
        game_series: series,
        head: format!("ff{}", &digest[..6]),
        image: scraped.image_url.clone(),
        name: scraped.name.clone(),
        release: ReleaseDates {
            na: scraped.release_date.clone(),
            ..Default::default()
        },
        tail: format!("ff{}", &digest[6..12]),
        kind: "Figure".to_string(),
        is_upcoming: true,
        needs_backfill: true,
        extra: Default::default(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub matched: usize,
    pub new: usize,
    pub updated: usize,
    pub ambiguous: usize,
}

fn fill_release(entry: &mut CatalogEntry, release_date: Option<&str>) -> bool {
    let Some(date) = release_date else {
        return false;
    };
    if entry.release.na.is_some() {
        return false;
    }
    entry.release.na = Some(date.to_string());
    true
}

/// Merge scraped line-up items into `entries` in place.
pub fn apply_scraped(entries: &mut Vec<CatalogEntry>, scraped: &[ScrapedAmiibo]) -> MergeCounts {
    let mut counts = MergeCounts::default();
    for item in scraped {
        let ambiguous = match find_best_match(&item.name, entries) {
            MatchOutcome::Matched(index) => {
                counts.matched += 1;
                if fill_release(&mut entries[index], item.release_date.as_deref()) {
                    counts.updated += 1;
                }
                continue;
            }
            MatchOutcome::Ambiguous(indices) => {
                let names = indices.iter().map(|&i| entries[i].name.as_str()).collect::<Vec<_>>();
                warn!(name = %item.name, candidates = ?names, "ambiguous line-up match");
                true
            }
            MatchOutcome::NoMatch => false,
        };

        let placeholder = placeholder_entry(item);
        // A placeholder from an earlier run is reused rather than duplicated.
        if let Some(existing) = entries.iter_mut().find(|e| e.id() == placeholder.id()) {
            counts.matched += 1;
            if fill_release(existing, item.release_date.as_deref()) {
                counts.updated += 1;
            }
            continue;
        }

        info!(name = %item.name, ambiguous, "adding placeholder for backfill");
        counts.new += 1;
        if ambiguous {
            counts.ambiguous += 1;
        }
        entries.push(placeholder);
    }
    counts
}

/// Fill placeholders from a reference catalog by Jaro-Winkler name similarity.
/// Reference entries whose id is already in the snapshot are never reused.
pub fn auto_backfill(entries: &mut [CatalogEntry], reference: &[CatalogEntry], min_similarity: f64) -> usize {
    let mut taken = entries.iter().map(CatalogEntry::id).collect::<HashSet<_>>();
    let mut backfilled = 0;

    for entry in entries.iter_mut().filter(|e| e.needs_backfill) {
        let wanted = normalize_name(&entry.name);
        let best = reference
            .iter()
            .filter(|r| !taken.contains(&r.id()))
            .map(|r| (jaro_winkler(&wanted, &normalize_name(&r.name)), r))
            .filter(|(score, _)| *score >= min_similarity)
            .max_by(|a, b| a.0.total_cmp(&b.0));

        let Some((score, source)) = best else {
            warn!(name = %entry.name, "no reference match for placeholder");
            continue;
        };

        taken.remove(&entry.id());
        entry.head = source.head.clone();
        entry.tail = source.tail.clone();
        entry.character = source.character.clone();
        entry.game_series = source.game_series.clone();
        entry.amiibo_series = source.amiibo_series.clone();
        entry.image = source.image.clone();
        entry.kind = source.kind.clone();
        let release = &mut entry.release;
        for (mine, theirs) in [
            (&mut release.na, &source.release.na),
            (&mut release.jp, &source.release.jp),
            (&mut release.eu, &source.release.eu),
            (&mut release.au, &source.release.au),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
        entry.needs_backfill = false;
        taken.insert(entry.id());
        backfilled += 1;
        info!(name = %entry.name, id = %entry.id(), score, "backfilled placeholder");
    }
    backfilled
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeStatus {
    Success,
    Skipped,
    Error,
}

/// Structured result handed back to the scrape trigger; never an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapeOutcome {
    pub status: ScrapeStatus,
    pub matched: usize,
    pub new: usize,
    pub updated: usize,
    pub ambiguous: usize,
    pub backfilled: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ScrapeOutcome {
    fn empty(status: ScrapeStatus) -> Self {
        Self {
            status,
            matched: 0,
            new: 0,
            updated: 0,
            ambiguous: 0,
            backfilled: 0,
            reason: None,
            message: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::empty(ScrapeStatus::Skipped)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::empty(ScrapeStatus::Error)
        }
    }

    pub fn success(counts: MergeCounts, backfilled: usize) -> Self {
        Self {
            matched: counts.matched,
            new: counts.new,
            updated: counts.updated,
            ambiguous: counts.ambiguous,
            backfilled,
            ..Self::empty(ScrapeStatus::Success)
        }
    }
}

/// Scrapes the line-up page into the local snapshot, at most once per interval.
pub struct BackfillJob {
    snapshot: SnapshotStore,
    lineup: Arc<dyn LineupSource>,
    reference: Option<Arc<dyn CatalogFeed>>,
    min_similarity: f64,
    interval: Duration,
}

impl BackfillJob {
    pub fn new(snapshot: SnapshotStore, lineup: Arc<dyn LineupSource>) -> Self {
        Self {
            snapshot,
            lineup,
            reference: None,
            min_similarity: 0.9,
            interval: Duration::from_secs(6 * 3600),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_reference(mut self, reference: Arc<dyn CatalogFeed>, min_similarity: f64) -> Self {
        self.reference = Some(reference);
        self.min_similarity = min_similarity;
        self
    }

    pub fn snapshot(&self) -> &SnapshotStore {
        &self.snapshot
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn run(&self, force: bool) -> ScrapeOutcome {
        self.run_inner(force)
            .instrument(info_span!("lineup_scrape", force))
            .await
    }

    async fn run_inner(&self, force: bool) -> ScrapeOutcome {
        if !force && !self.snapshot.is_stale(self.interval, Utc::now()).await {
            info!("snapshot is fresh; skipping scrape");
            return ScrapeOutcome::skipped("cache_valid");
        }

        let scraped = match self.lineup.fetch_lineup().await {
            Ok(scraped) if scraped.is_empty() => {
                warn!("line-up page yielded no amiibo");
                return ScrapeOutcome::error("no amiibo scraped");
            }
            Ok(scraped) => scraped,
            Err(err) => {
                warn!(error = %err, "line-up fetch failed");
                return ScrapeOutcome::error(err.to_string());
            }
        };

        let mut entries = match self.snapshot.load_optional().await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(err) => {
                warn!(error = ?err, "snapshot unreadable");
                return ScrapeOutcome::error(format!("{err:#}"));
            }
        };

        let counts = apply_scraped(&mut entries, &scraped);
        let backfilled = if counts.new > 0 {
            self.backfill_placeholders(&mut entries).await
        } else {
            0
        };

        match self.snapshot.save_atomic(&entries).await {
            Ok(saved) => {
                info!(
                    matched = counts.matched,
                    new = counts.new,
                    updated = counts.updated,
                    ambiguous = counts.ambiguous,
                    backfilled,
                    entries = saved.entries,
                    "scrape completed"
                );
                ScrapeOutcome::success(counts, backfilled)
            }
            Err(err) => {
                warn!(error = ?err, "snapshot write failed");
                ScrapeOutcome::error(format!("{err:#}"))
            }
        }
    }

    async fn backfill_placeholders(&self, entries: &mut [CatalogEntry]) -> usize {
        let Some(reference) = &self.reference else {
            return 0;
        };
        match reference.fetch_entries().await {
            Ok(reference) => auto_backfill(entries, &reference, self.min_similarity),
            Err(err) => {
                warn!(error = %err, "reference catalog unavailable; placeholders left for manual backfill");
                0
            }
        }
    }
}
