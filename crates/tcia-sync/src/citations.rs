//! DOI → citation cache carried across runs, and the refresh that fills it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tcia_adapters::{CitationError, CitationFormatter};
use tcia_core::{CitationCacheEntry, DatasetRecord, NO_DOI_CITATION};
use tcia_storage::{ArtifactStore, StoredArtifact};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::table::{encode_citation_cache, read_citation_entries};

const FAILURE_MARKERS: &[&str] = &["not found", "Could not retrieve", "No DOI"];

/// Placeholder and empty citations are retried on every run.
pub fn is_failure_text(text: &str) -> bool {
    text.trim().is_empty() || FAILURE_MARKERS.iter().any(|marker| text.contains(marker))
}

pub fn not_found_text(doi: &str) -> String {
    format!("Citation not found for DOI: {doi}")
}

pub fn unavailable_text(doi: &str) -> String {
    format!("Could not retrieve citation for DOI: {doi}")
}

fn placeholder_for(err: &CitationError) -> String {
    match err {
        CitationError::NotFound { doi, .. } => not_found_text(doi),
        CitationError::Unavailable { doi, .. } => unavailable_text(doi),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CitationState {
    Missing,
    Pending,
    Cached,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CitationCache {
    entries: BTreeMap<String, String>,
}

impl CitationCache {
    /// A missing file is an empty cache. Later rows win when a DOI repeats.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no citation cache yet");
            return Ok(Self::default());
        }
        let mut cache = Self::default();
        for entry in read_citation_entries(path)? {
            cache.upsert(entry.doi, entry.citation);
        }
        Ok(cache)
    }

    pub async fn save(&self, store: &ArtifactStore, name: &str) -> Result<StoredArtifact> {
        let bytes = encode_citation_cache(&self.entries())?;
        store.write_atomic(name, &bytes).await
    }

    /// Returns the replaced text, if any. Other entries are never touched.
    pub fn upsert(&mut self, doi: impl Into<String>, citation: impl Into<String>) -> Option<String> {
        self.entries.insert(doi.into(), citation.into())
    }

    pub fn get(&self, doi: &str) -> Option<&str> {
        self.entries.get(doi).map(String::as_str)
    }

    /// `Missing` covers both absent DOIs and cached failure placeholders.
    pub fn state(&self, doi: &str) -> CitationState {
        match self.get(doi) {
            Some(text) if !is_failure_text(text) => CitationState::Cached,
            _ => CitationState::Missing,
        }
    }

    pub fn entries(&self) -> Vec<CitationCacheEntry> {
        self.entries
            .iter()
            .map(|(doi, citation)| CitationCacheEntry {
                doi: doi.clone(),
                citation: citation.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CitationSettings {
    pub concurrency: usize,
    pub delay: Duration,
}

impl Default for CitationSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CitationRunStats {
    /// Records whose joined citation was missing or a failure placeholder.
    pub selected: usize,
    /// Distinct DOIs sent to the formatter.
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub no_doi: usize,
}

impl CitationRunStats {
    /// The cache file is rewritten only when something was selected.
    pub fn cache_dirty(&self) -> bool {
        self.selected > 0
    }
}

pub struct CitationManager {
    formatter: Arc<dyn CitationFormatter>,
    settings: CitationSettings,
}

impl CitationManager {
    pub fn new(formatter: Arc<dyn CitationFormatter>, settings: CitationSettings) -> Self {
        Self { formatter, settings }
    }

    pub async fn refresh(
        &self,
        records: &mut [DatasetRecord],
        cache: &mut CitationCache,
    ) -> CitationRunStats {
        let mut stats = CitationRunStats::default();

        for record in records.iter_mut() {
            record.citation = cache.get(&record.doi).unwrap_or_default().to_string();
        }

        let selected: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, record)| is_failure_text(&record.citation))
            .map(|(idx, _)| idx)
            .collect();
        stats.selected = selected.len();
        if selected.is_empty() {
            info!(cached = cache.len(), "every citation already cached");
            return stats;
        }

        let mut pending = BTreeSet::new();
        for &idx in &selected {
            let doi = &records[idx].doi;
            if doi.is_empty() {
                stats.no_doi += 1;
            } else {
                pending.insert(doi.clone());
            }
        }
        stats.fetched = pending.len();

        let fetched = self.fetch_all(pending).await;
        for (doi, text) in &fetched {
            if is_failure_text(text) {
                stats.failed += 1;
            } else {
                stats.succeeded += 1;
            }
            cache.upsert(doi.clone(), text.clone());
        }

        for idx in selected {
            let record = &mut records[idx];
            record.citation = if record.doi.is_empty() {
                NO_DOI_CITATION.to_string()
            } else {
                fetched
                    .get(&record.doi)
                    .cloned()
                    .unwrap_or_else(|| unavailable_text(&record.doi))
            };
        }

        info!(
            selected = stats.selected,
            fetched = stats.fetched,
            succeeded = stats.succeeded,
            failed = stats.failed,
            no_doi = stats.no_doi,
            "citations refreshed"
        );
        stats
    }

    /// One formatter call per DOI; failures become placeholder text.
    async fn fetch_all(&self, dois: BTreeSet<String>) -> BTreeMap<String, String> {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for doi in &dois {
            let semaphore = Arc::clone(&semaphore);
            let formatter = Arc::clone(&self.formatter);
            let delay = self.settings.delay;
            let doi = doi.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    let message = "citation worker pool closed".to_string();
                    return (doi.clone(), Err(CitationError::Unavailable { doi, message }));
                };
                let result = formatter.format_citation(&doi).await;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                (doi, result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((doi, Ok(text))) => {
                    results.insert(doi, text);
                }
                Ok((doi, Err(err))) => {
                    warn!(doi = %doi, error = %err, "citation lookup failed");
                    results.insert(doi, placeholder_for(&err));
                }
                Err(err) => warn!(error = %err, "citation task aborted"),
            }
        }
        for doi in dois {
            if !results.contains_key(&doi) {
                let text = unavailable_text(&doi);
                results.insert(doi, text);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use tcia_core::DatasetKind;
    use tempfile::tempdir;

    #[derive(Default)]
    struct StubFormatter {
        answers: BTreeMap<String, Result<String, u16>>,
        calls: AtomicUsize,
    }

    impl StubFormatter {
        fn answering(pairs: &[(&str, &str)]) -> Self {
            Self {
                answers: pairs
                    .iter()
                    .map(|(doi, text)| (doi.to_string(), Ok(text.to_string())))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CitationFormatter for StubFormatter {
        async fn format_citation(&self, doi: &str) -> Result<String, CitationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.get(doi) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(status)) => Err(CitationError::NotFound {
                    doi: doi.to_string(),
                    status: *status,
                }),
                None => Err(CitationError::Unavailable {
                    doi: doi.to_string(),
                    message: "timed out".into(),
                }),
            }
        }
    }

    fn settings() -> CitationSettings {
        CitationSettings {
            concurrency: 2,
            delay: Duration::ZERO,
        }
    }

    fn records(dois: &[&str]) -> Vec<DatasetRecord> {
        dois.iter()
            .enumerate()
            .map(|(idx, doi)| {
                let mut record = DatasetRecord::empty(idx as i64 + 1, DatasetKind::Collection);
                record.doi = doi.to_string();
                record
            })
            .collect()
    }

    #[test]
    fn failure_text_matches_placeholders_and_empty() {
        assert!(is_failure_text(""));
        assert!(is_failure_text("   "));
        assert!(is_failure_text(NO_DOI_CITATION));
        assert!(is_failure_text(&not_found_text("10.1/x")));
        assert!(is_failure_text(&unavailable_text("10.1/x")));
        assert!(!is_failure_text("Smith, J. (2020)."));
    }

    #[test]
    fn cached_placeholders_count_as_missing() {
        let mut cache = CitationCache::default();
        cache.upsert("10.1/a", "Smith, J. (2020).");
        cache.upsert("10.1/b", not_found_text("10.1/b"));
        assert_eq!(cache.state("10.1/a"), CitationState::Cached);
        assert_eq!(cache.state("10.1/b"), CitationState::Missing);
        assert_eq!(cache.state("10.1/c"), CitationState::Missing);
    }

    #[tokio::test]
    async fn second_run_makes_no_formatter_calls() {
        let stub = Arc::new(StubFormatter::answering(&[
            ("10.1/a", "Alpha (2019)."),
            ("10.1/b", "Beta (2021)."),
        ]));
        let manager = CitationManager::new(stub.clone(), settings());
        let mut cache = CitationCache::default();

        let mut first = records(&["10.1/a", "10.1/b", "10.1/a", ""]);
        let stats = manager.refresh(&mut first, &mut cache).await;
        assert_eq!(stub.calls(), 2);
        assert_eq!(stats.selected, 4);
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.no_doi, 1);
        assert_eq!(first[2].citation, "Alpha (2019).");
        assert_eq!(first[3].citation, NO_DOI_CITATION);
        assert_eq!(cache.len(), 2);

        let mut second = records(&["10.1/a", "10.1/b", "10.1/a", ""]);
        let stats = manager.refresh(&mut second, &mut cache).await;
        assert_eq!(stub.calls(), 2);
        assert_eq!(stats.fetched, 0);
        assert_eq!(stats.no_doi, 1);
        assert_eq!(second[1].citation, "Beta (2021).");
    }

    #[tokio::test]
    async fn persisted_citation_serves_later_runs_without_calls() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let stub = Arc::new(StubFormatter::answering(&[("10.1234/x", "Smith, J. (2020).")]));
        let mut cache = CitationCache::load(&store.path_for("citations_cache.parquet")).expect("load");
        assert!(cache.is_empty());

        let mut first = records(&["10.1234/x"]);
        let stats = CitationManager::new(stub.clone(), settings())
            .refresh(&mut first, &mut cache)
            .await;
        assert!(stats.cache_dirty());
        cache.save(&store, "citations_cache.parquet").await.expect("save");

        let mut reloaded =
            CitationCache::load(&store.path_for("citations_cache.parquet")).expect("reload");
        assert_eq!(
            reloaded.entries(),
            vec![CitationCacheEntry {
                doi: "10.1234/x".into(),
                citation: "Smith, J. (2020).".into(),
            }]
        );

        let silent = Arc::new(StubFormatter::default());
        let mut second = records(&["10.1234/x"]);
        let stats = CitationManager::new(silent.clone(), settings())
            .refresh(&mut second, &mut reloaded)
            .await;
        assert!(!stats.cache_dirty());
        assert_eq!(silent.calls(), 0);
        assert_eq!(second[0].citation, "Smith, J. (2020).");
    }

    #[tokio::test]
    async fn failures_are_isolated_and_retried_next_run() {
        let mut failing = StubFormatter::answering(&[("10.1/ok", "Fine (2018).")]);
        failing.answers.insert("10.1/gone".into(), Err(404));
        let failing = Arc::new(failing);
        let mut cache = CitationCache::default();

        let mut first = records(&["10.1/ok", "10.1/gone", "10.1/slow"]);
        let stats = CitationManager::new(failing, settings())
            .refresh(&mut first, &mut cache)
            .await;
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(first[0].citation, "Fine (2018).");
        assert_eq!(first[1].citation, "Citation not found for DOI: 10.1/gone");
        assert_eq!(first[2].citation, "Could not retrieve citation for DOI: 10.1/slow");

        let healed = Arc::new(StubFormatter::answering(&[
            ("10.1/gone", "Back (2022)."),
            ("10.1/slow", "Late (2023)."),
        ]));
        let mut second = records(&["10.1/ok", "10.1/gone", "10.1/slow"]);
        let stats = CitationManager::new(healed.clone(), settings())
            .refresh(&mut second, &mut cache)
            .await;
        assert_eq!(healed.calls(), 2);
        assert_eq!(stats.selected, 2);
        assert_eq!(cache.get("10.1/gone"), Some("Back (2022)."));
        assert_eq!(cache.get("10.1/ok"), Some("Fine (2018)."));
        assert_eq!(second[2].citation, "Late (2023).");
    }

    /// Records the peak number of concurrent lookups.
    #[derive(Default)]
    struct GaugedFormatter {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CitationFormatter for GaugedFormatter {
        async fn format_citation(&self, doi: &str) -> Result<String, CitationError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("Cited {doi}."))
        }
    }

    #[tokio::test]
    async fn lookups_respect_concurrency_and_per_request_delay() {
        let gauge = Arc::new(GaugedFormatter::default());
        let delay = Duration::from_millis(30);
        let manager = CitationManager::new(
            gauge.clone(),
            CitationSettings {
                concurrency: 2,
                delay,
            },
        );
        let dois = ["10.1/a", "10.1/b", "10.1/c", "10.1/d", "10.1/e", "10.1/f"];
        let mut rows = records(&dois);
        let mut cache = CitationCache::default();

        let started = std::time::Instant::now();
        let stats = manager.refresh(&mut rows, &mut cache).await;
        let elapsed = started.elapsed();

        assert_eq!(stats.succeeded, 6);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak in-flight lookups was {peak}");
        assert!(elapsed >= delay * 3, "six lookups over two permits finished in {elapsed:?}");
        assert_eq!(rows[5].citation, "Cited 10.1/f.");
    }
}
