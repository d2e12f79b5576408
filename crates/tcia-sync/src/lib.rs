//! Sync pipeline orchestration: fetch, reconcile, enrich, persist.

pub mod citations;
pub mod downloads;
pub mod related;
pub mod table;
pub mod unify;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tcia_adapters::{
    AdapterError, CatalogSource, CitationFormatter, CrossciteFormatter, EndpointConfig,
    FixtureCatalogSource, FixtureCitationFormatter, SourceMode, SourceName, WordpressCatalogSource,
};
use tcia_core::normalize::FieldAnomaly;
use tcia_core::DatasetRecord;
use tcia_storage::{ArtifactStore, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use citations::{CitationCache, CitationManager, CitationRunStats, CitationSettings};
pub use downloads::{attach_downloads, AttachStats, DownloadTable, DOWNLOAD_COLUMNS};
pub use related::{resolve_related, TitleIndex};
pub use table::{read_dataset_table, DATASET_COLUMNS};
pub use unify::{unify, StagedDataset};

pub const CRATE_NAME: &str = "tcia-sync";

pub const DATASET_TABLE_FILE: &str = "tcia_master_data.parquet";
pub const CITATION_CACHE_FILE: &str = "citations_cache.parquet";
pub const MANIFEST_FILE: &str = "sync_manifest.json";
pub const CONFIG_FILE: &str = "tcia-sync.yaml";

/// Per-field counts of values that were coerced to a default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AnomalyLog {
    counts: BTreeMap<String, usize>,
}

impl AnomalyLog {
    pub fn record(&mut self, field: &str, dataset_id: i64, anomaly: &FieldAnomaly) {
        debug!(field, dataset_id, anomaly = %anomaly, "value coerced to default");
        *self.counts.entry(field.to_string()).or_default() += 1;
    }

    pub fn count(&self, field: &str) -> usize {
        self.counts.get(field).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn counts(&self) -> &BTreeMap<String, usize> {
        &self.counts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub output_dir: PathBuf,
    pub source_mode: SourceMode,
    pub fixtures_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub citation_concurrency: usize,
    pub citation_delay_ms: u64,
    pub endpoints: EndpointConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data"),
            source_mode: SourceMode::Live,
            fixtures_dir: PathBuf::from("fixtures/tcia/sample"),
            user_agent: "tcia-sync/0.1".to_string(),
            http_timeout_secs: 20,
            citation_concurrency: 4,
            citation_delay_ms: 100,
            endpoints: EndpointConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing sync config yaml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// `TCIA_CONFIG` or `./tcia-sync.yaml` when present, then `TCIA_*` overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os("TCIA_CONFIG") {
            Some(path) => Self::load(Path::new(&path))?,
            None if Path::new(CONFIG_FILE).exists() => Self::load(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("TCIA_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(mode) = lookup("TCIA_SOURCE_MODE") {
            match SourceMode::parse(&mode) {
                Some(mode) => self.source_mode = mode,
                None => bail!("TCIA_SOURCE_MODE must be `live` or `fixture`, got {mode:?}"),
            }
        }
        if let Some(dir) = lookup("TCIA_FIXTURES_DIR") {
            self.fixtures_dir = PathBuf::from(dir);
        }
        if let Some(agent) = lookup("TCIA_USER_AGENT") {
            self.user_agent = agent;
        }
        override_number(&lookup, "TCIA_HTTP_TIMEOUT_SECS", &mut self.http_timeout_secs);
        override_number(&lookup, "TCIA_CITATION_CONCURRENCY", &mut self.citation_concurrency);
        override_number(&lookup, "TCIA_CITATION_DELAY_MS", &mut self.citation_delay_ms);
        Ok(())
    }

    pub fn citation_settings(&self) -> CitationSettings {
        CitationSettings {
            concurrency: self.citation_concurrency.max(1),
            delay: Duration::from_millis(self.citation_delay_ms),
        }
    }
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparseable numeric override"),
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching {feed} failed: {message}")]
    SourceFetch { feed: SourceName, message: String },
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

impl SyncError {
    fn fetch(feed: SourceName, err: AdapterError) -> Self {
        Self::SourceFetch {
            feed,
            message: format!("{err:#}"),
        }
    }

    pub fn failed_source(&self) -> Option<SourceName> {
        match self {
            Self::SourceFetch { feed, .. } => Some(*feed),
            Self::Persist(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub datasets: usize,
    pub collections: usize,
    pub analysis_results: usize,
    pub downloads: AttachStats,
    pub unresolved_references: usize,
    pub summaries_merged: usize,
    pub citations: CitationRunStats,
    pub anomalies: usize,
    pub table_path: String,
    pub manifest_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub rows: usize,
    pub unresolved_references: usize,
    pub citations_selected: usize,
    pub citations_fetched: usize,
    pub citations_failed: usize,
    pub anomalies: BTreeMap<String, usize>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Joins abstracts by lower-cased DOI; returns how many summaries were filled.
pub fn merge_abstracts(records: &mut [DatasetRecord], abstracts: &BTreeMap<String, String>) -> usize {
    let by_doi: BTreeMap<String, &String> = abstracts
        .iter()
        .map(|(doi, text)| (doi.to_lowercase(), text))
        .collect();
    let mut merged = 0;
    for record in records.iter_mut() {
        record.summary = if record.doi.is_empty() {
            String::new()
        } else {
            by_doi
                .get(&record.doi.to_lowercase())
                .map(|text| text.trim().to_string())
                .unwrap_or_default()
        };
        if !record.summary.is_empty() {
            merged += 1;
        }
    }
    merged
}

/// Last pass before persisting: trims scalar text and drops blank list items.
pub fn finalize_schema(records: &mut [DatasetRecord]) {
    fn trim(value: &mut String) {
        if value.trim().len() != value.len() {
            *value = value.trim().to_string();
        }
    }
    fn tidy(values: &mut Vec<String>) {
        values.iter_mut().for_each(trim);
        values.retain(|v| !v.is_empty());
    }

    for record in records.iter_mut() {
        for text in [
            &mut record.title,
            &mut record.short_title,
            &mut record.link,
            &mut record.doi,
            &mut record.access_type,
            &mut record.summary,
            &mut record.citation,
        ] {
            trim(text);
        }
        for list in [
            &mut record.cancer_types,
            &mut record.cancer_locations,
            &mut record.supporting_data,
            &mut record.data_types,
            &mut record.program,
        ] {
            tidy(list);
        }
    }
}

fn doi_set(records: &[DatasetRecord]) -> BTreeSet<String> {
    records
        .iter()
        .filter(|r| !r.doi.is_empty())
        .map(|r| r.doi.clone())
        .collect()
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: ArtifactStore,
    source: Box<dyn CatalogSource>,
    formatter: Arc<dyn CitationFormatter>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let (source, formatter): (Box<dyn CatalogSource>, Arc<dyn CitationFormatter>) =
            match config.source_mode {
                SourceMode::Live => {
                    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
                        timeout: Duration::from_secs(config.http_timeout_secs),
                        user_agent: Some(config.user_agent.clone()),
                        per_feed_in_flight: config.citation_concurrency.max(1),
                        ..Default::default()
                    })?);
                    let client_run = Uuid::new_v4();
                    (
                        Box::new(WordpressCatalogSource::new(
                            Arc::clone(&http),
                            client_run,
                            config.endpoints.clone(),
                        )),
                        Arc::new(CrossciteFormatter::new(http, client_run, config.endpoints.clone())),
                    )
                }
                SourceMode::Fixture => (
                    Box::new(FixtureCatalogSource::new(config.fixtures_dir.clone())),
                    Arc::new(FixtureCitationFormatter::load(&config.fixtures_dir)?),
                ),
            };
        Ok(Self::with_sources(config, source, formatter))
    }

    pub fn with_sources(
        config: SyncConfig,
        source: Box<dyn CatalogSource>,
        formatter: Arc<dyn CitationFormatter>,
    ) -> Self {
        let store = ArtifactStore::new(config.output_dir.clone());
        Self {
            config,
            store,
            source,
            formatter,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Every fetch completes before anything is written; a failed fetch leaves
    /// the previous run's artifacts in place.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let source = self.source.describe();
        info!(%run_id, source = %source, "sync run started");

        let collections = self
            .source
            .fetch_collections()
            .await
            .map_err(|err| SyncError::fetch(SourceName::Collections, err))?;
        let analyses = self
            .source
            .fetch_analyses()
            .await
            .map_err(|err| SyncError::fetch(SourceName::Analyses, err))?;
        let download_rows = self
            .source
            .fetch_downloads(DOWNLOAD_COLUMNS)
            .await
            .map_err(|err| SyncError::fetch(SourceName::Downloads, err))?;
        info!(
            collections = collections.len(),
            analyses = analyses.len(),
            downloads = download_rows.len(),
            "feeds fetched"
        );

        let mut anomalies = AnomalyLog::default();
        let mut staged = unify(&collections, &analyses, &mut anomalies);
        let unresolved_references = resolve_related(&mut staged, &mut anomalies);
        let download_table = DownloadTable::from_rows(download_rows, &mut anomalies);
        let downloads = attach_downloads(&mut staged, &download_table, &mut anomalies);
        info!(
            datasets = staged.len(),
            unresolved_references,
            attached = downloads.attached,
            retired = downloads.retired,
            "records reconciled"
        );

        let mut records: Vec<DatasetRecord> =
            staged.into_iter().map(StagedDataset::into_record).collect();
        let abstracts = self
            .source
            .fetch_abstracts(&doi_set(&records))
            .await
            .map_err(|err| SyncError::fetch(SourceName::Abstracts, err))?;
        let summaries_merged = merge_abstracts(&mut records, &abstracts);

        let mut cache = CitationCache::load(&self.store.path_for(CITATION_CACHE_FILE))?;
        let citations = CitationManager::new(Arc::clone(&self.formatter), self.config.citation_settings())
            .refresh(&mut records, &mut cache)
            .await;

        finalize_schema(&mut records);
        let table_bytes = table::encode_dataset_table(&records)?;

        if citations.cache_dirty() {
            cache.save(&self.store, CITATION_CACHE_FILE).await?;
        }
        let table_artifact = self.store.write_atomic(DATASET_TABLE_FILE, &table_bytes).await?;

        let finished_at = Utc::now();
        let manifest = RunManifest {
            schema_version: 1,
            run_id,
            started_at,
            finished_at,
            source: source.clone(),
            rows: records.len(),
            unresolved_references,
            citations_selected: citations.selected,
            citations_fetched: citations.fetched,
            citations_failed: citations.failed,
            anomalies: anomalies.counts().clone(),
            files: self.manifest_files().await?,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).context("serializing run manifest")?;
        let manifest_artifact = self.store.write_atomic(MANIFEST_FILE, &manifest_bytes).await?;

        if anomalies.total() > 0 {
            info!(total = anomalies.total(), fields = ?anomalies.counts(), "field anomalies recovered");
        }
        info!(%run_id, rows = records.len(), "sync run finished");

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            source,
            datasets: records.len(),
            collections: collections.len(),
            analysis_results: analyses.len(),
            downloads,
            unresolved_references,
            summaries_merged,
            citations,
            anomalies: anomalies.total(),
            table_path: table_artifact.path.display().to_string(),
            manifest_path: manifest_artifact.path.display().to_string(),
        })
    }

    async fn manifest_files(&self) -> Result<Vec<ManifestFile>> {
        let mut files = Vec::new();
        for name in [DATASET_TABLE_FILE, CITATION_CACHE_FILE] {
            let Some(bytes) = self.store.read(name).await? else {
                continue;
            };
            files.push(ManifestFile {
                name: name.to_string(),
                path: name.to_string(),
                sha256: ArtifactStore::sha256_hex(&bytes),
                bytes: bytes.len() as u64,
            });
        }
        Ok(files)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, SyncError> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}

/// Sanity checks over a persisted dataset table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub rows: usize,
    pub doi_populated: bool,
    pub summary_populated: bool,
    pub citation_populated: bool,
    pub first_with_downloads: Option<String>,
    pub distinct_subject_counts: usize,
}

impl VerifyReport {
    pub fn from_records(records: &[DatasetRecord]) -> Self {
        let subject_counts: BTreeSet<u64> = records.iter().map(|r| r.number_of_subjects).collect();
        Self {
            rows: records.len(),
            doi_populated: records.iter().any(|r| !r.doi.is_empty()),
            summary_populated: records.iter().any(|r| !r.summary.is_empty()),
            citation_populated: records.iter().any(|r| !r.citation.is_empty()),
            first_with_downloads: records
                .iter()
                .find(|r| !r.downloads.is_empty())
                .map(|r| r.title.clone()),
            distinct_subject_counts: subject_counts.len(),
        }
    }

    pub fn subjects_vary(&self) -> bool {
        self.distinct_subject_counts > 1
    }

    pub fn passed(&self) -> bool {
        self.doi_populated
            && self.summary_populated
            && self.citation_populated
            && self.first_with_downloads.is_some()
            && self.subjects_vary()
    }
}

pub fn verify_table(path: &Path) -> Result<VerifyReport> {
    let records = read_dataset_table(path)?;
    Ok(VerifyReport::from_records(&records))
}
