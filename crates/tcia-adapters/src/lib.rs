//! Upstream collaborator contracts + live and fixture-backed implementations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tcia_core::{RawDownload, RawRecord};
use tcia_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tcia-adapters";

/// Upstream feed a fetch failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    Collections,
    Analyses,
    Downloads,
    Abstracts,
}

impl SourceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collections => "collections",
            Self::Analyses => "analyses",
            Self::Downloads => "downloads",
            Self::Abstracts => "abstracts",
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

impl SourceMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "live" => Some(Self::Live),
            "fixture" | "fixtures" => Some(Self::Fixture),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// The catalog feeds the sync consumes. Implementations return rows verbatim;
/// all coercion happens downstream.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_collections(&self) -> Result<Vec<RawRecord>, AdapterError>;

    async fn fetch_analyses(&self) -> Result<Vec<RawRecord>, AdapterError>;

    async fn fetch_downloads(&self, fields: &[&str]) -> Result<Vec<RawDownload>, AdapterError>;

    /// DOI (lower-cased) → abstract text, limited to `dois`.
    async fn fetch_abstracts(
        &self,
        dois: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>, AdapterError>;
}

#[derive(Debug, Error)]
pub enum CitationError {
    #[error("no citation available for {doi} (http {status})")]
    NotFound { doi: String, status: u16 },
    #[error("citation request for {doi} failed: {message}")]
    Unavailable { doi: String, message: String },
}

#[async_trait]
pub trait CitationFormatter: Send + Sync {
    async fn format_citation(&self, doi: &str) -> Result<String, CitationError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub wordpress_base: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub datacite_base: String,
    pub datacite_client_id: String,
    pub datacite_page_size: u32,
    pub citation_base: String,
    pub citation_style: String,
    pub citation_locale: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            wordpress_base: "https://www.cancerimagingarchive.net/api/v1".to_string(),
            page_size: 100,
            max_pages: 200,
            datacite_base: "https://api.datacite.org".to_string(),
            datacite_client_id: "tcia.tcia".to_string(),
            datacite_page_size: 1000,
            citation_base: "https://citation.crosscite.org/format".to_string(),
            citation_style: "apa".to_string(),
            citation_locale: "en-US".to_string(),
        }
    }
}

/// TCIA WordPress REST feeds plus the DataCite DOI listing.
pub struct WordpressCatalogSource {
    http: Arc<HttpFetcher>,
    run_id: Uuid,
    endpoints: EndpointConfig,
}

impl WordpressCatalogSource {
    pub fn new(http: Arc<HttpFetcher>, run_id: Uuid, endpoints: EndpointConfig) -> Self {
        Self {
            http,
            run_id,
            endpoints,
        }
    }

    fn page_url(&self, feed: &str, page: u32, fields: &[&str]) -> String {
        let mut url = format!(
            "{}/{}/?per_page={}&page={}",
            self.endpoints.wordpress_base.trim_end_matches('/'),
            feed,
            self.endpoints.page_size,
            page
        );
        if !fields.is_empty() {
            url.push_str("&_fields=");
            url.push_str(&urlencoding::encode(&fields.join(",")));
        }
        url
    }

    async fn fetch_feed(&self, feed: &str, fields: &[&str]) -> Result<Vec<RawRecord>, AdapterError> {
        let mut rows = Vec::new();
        let max_pages = self.endpoints.max_pages.max(1);
        let mut reached_end = false;
        for page in 1..=max_pages {
            let url = self.page_url(feed, page, fields);
            let (batch, resp): (Vec<JsonValue>, _) = match self.http.fetch_json(self.run_id, feed, &url).await {
                Ok(ok) => ok,
                // WordPress answers 400 once `page` runs past the last page.
                Err(err) if page > 1 && err.status() == Some(400) => {
                    reached_end = true;
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            let batch_len = batch.len();
            rows.extend(batch.into_iter().filter_map(|row| match row {
                JsonValue::Object(map) => Some(map),
                _ => None,
            }));
            let total_pages = resp.header_u32("x-wp-totalpages");
            debug!(feed, page, batch_len, ?total_pages, "fetched feed page");
            if last_page_reached(page, batch_len, total_pages) {
                reached_end = true;
                break;
            }
        }
        if !reached_end {
            warn!(
                feed,
                max_pages,
                rows = rows.len(),
                "page cap reached before the last feed page; rows may be missing"
            );
        }
        info!(feed, rows = rows.len(), "feed fetched");
        Ok(rows)
    }
}

/// True once a page is empty or `X-WP-TotalPages` says nothing follows it.
fn last_page_reached(page: u32, batch_len: usize, total_pages: Option<u32>) -> bool {
    batch_len == 0 || total_pages.is_some_and(|total| page >= total)
}

#[derive(Debug, Deserialize)]
struct DatacitePage {
    #[serde(default)]
    data: Vec<DataciteDoi>,
    #[serde(default)]
    links: DataciteLinks,
}

#[derive(Debug, Default, Deserialize)]
struct DataciteLinks {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DataciteDoi {
    id: String,
    #[serde(default)]
    attributes: DataciteAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct DataciteAttributes {
    doi: Option<String>,
    #[serde(default)]
    descriptions: Vec<DataciteDescription>,
}

#[derive(Debug, Deserialize)]
struct DataciteDescription {
    #[serde(default)]
    description: Option<JsonValue>,
    #[serde(rename = "descriptionType", default)]
    description_type: Option<String>,
}

impl DataciteDoi {
    fn abstract_text(&self) -> Option<String> {
        let pick = self
            .attributes
            .descriptions
            .iter()
            .find(|d| d.description_type.as_deref() == Some("Abstract"))
            .or_else(|| self.attributes.descriptions.first())?;
        let text = match pick.description.as_ref()? {
            JsonValue::String(text) => text.trim().to_string(),
            JsonValue::Array(parts) => parts
                .iter()
                .filter_map(JsonValue::as_str)
                .collect::<Vec<_>>()
                .join(" "),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }
}

#[async_trait]
impl CatalogSource for WordpressCatalogSource {
    fn describe(&self) -> String {
        format!("live:{}", self.endpoints.wordpress_base)
    }

    async fn fetch_collections(&self) -> Result<Vec<RawRecord>, AdapterError> {
        self.fetch_feed("collections", &[]).await
    }

    async fn fetch_analyses(&self) -> Result<Vec<RawRecord>, AdapterError> {
        self.fetch_feed("analysis-results", &[]).await
    }

    async fn fetch_downloads(&self, fields: &[&str]) -> Result<Vec<RawDownload>, AdapterError> {
        let mut with_id = vec!["id"];
        with_id.extend(fields.iter().copied().filter(|f| *f != "id"));
        self.fetch_feed("downloads", &with_id).await
    }

    async fn fetch_abstracts(
        &self,
        dois: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>, AdapterError> {
        let wanted: BTreeSet<String> = dois.iter().map(|d| d.to_lowercase()).collect();
        let mut out = BTreeMap::new();
        let mut next = Some(format!(
            "{}/dois?client-id={}&page%5Bsize%5D={}&page%5Bnumber%5D=1",
            self.endpoints.datacite_base.trim_end_matches('/'),
            urlencoding::encode(&self.endpoints.datacite_client_id),
            self.endpoints.datacite_page_size
        ));
        let mut pages = 0u32;
        while let Some(url) = next.take() {
            pages += 1;
            let (page, _resp): (DatacitePage, _) = self.http.fetch_json(self.run_id, "datacite", &url).await?;
            for doi in &page.data {
                let key = doi.attributes.doi.as_deref().unwrap_or(&doi.id).to_lowercase();
                if !wanted.contains(&key) {
                    continue;
                }
                if let Some(text) = doi.abstract_text() {
                    out.insert(key, text);
                }
            }
            if pages < self.endpoints.max_pages {
                next = page.links.next;
            }
        }
        info!(requested = wanted.len(), matched = out.len(), "datacite abstracts fetched");
        Ok(out)
    }
}

/// APA-style citations from the DOI content-negotiation formatter.
pub struct CrossciteFormatter {
    http: Arc<HttpFetcher>,
    run_id: Uuid,
    endpoints: EndpointConfig,
}

impl CrossciteFormatter {
    pub fn new(http: Arc<HttpFetcher>, run_id: Uuid, endpoints: EndpointConfig) -> Self {
        Self {
            http,
            run_id,
            endpoints,
        }
    }

    fn url_for(&self, doi: &str) -> String {
        format!(
            "{}?doi={}&style={}&lang={}",
            self.endpoints.citation_base,
            urlencoding::encode(doi),
            urlencoding::encode(&self.endpoints.citation_style),
            urlencoding::encode(&self.endpoints.citation_locale)
        )
    }
}

pub fn clean_citation_text(raw: &str) -> String {
    raw.trim().replace("https://doi.org/", "")
}

#[async_trait]
impl CitationFormatter for CrossciteFormatter {
    async fn format_citation(&self, doi: &str) -> Result<String, CitationError> {
        let url = self.url_for(doi);
        match self
            .http
            .fetch_text(self.run_id, "crosscite", &url, "text/x-bibliography")
            .await
        {
            Ok(text) => {
                let cleaned = clean_citation_text(&text);
                if cleaned.is_empty() {
                    return Err(CitationError::NotFound {
                        doi: doi.to_string(),
                        status: 204,
                    });
                }
                Ok(cleaned)
            }
            Err(FetchError::HttpStatus { status, .. }) if status < 500 && status != 429 => Err(CitationError::NotFound {
                doi: doi.to_string(),
                status,
            }),
            Err(err) => Err(CitationError::Unavailable {
                doi: doi.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

pub const COLLECTIONS_FIXTURE: &str = "collections.json";
pub const ANALYSES_FIXTURE: &str = "analyses.json";
pub const DOWNLOADS_FIXTURE: &str = "downloads.json";
pub const ABSTRACTS_FIXTURE: &str = "abstracts.json";
pub const CITATIONS_FIXTURE: &str = "citations.json";

/// Catalog captured to disk: one JSON array per feed plus a DOI → abstract map.
#[derive(Debug, Clone)]
pub struct FixtureCatalogSource {
    dir: PathBuf,
}

impl FixtureCatalogSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn rows(&self, file: &str) -> Result<Vec<RawRecord>, AdapterError> {
        let rows: Vec<JsonValue> = read_json_file(self.dir.join(file))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                JsonValue::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl CatalogSource for FixtureCatalogSource {
    fn describe(&self) -> String {
        format!("fixture:{}", self.dir.display())
    }

    async fn fetch_collections(&self) -> Result<Vec<RawRecord>, AdapterError> {
        self.rows(COLLECTIONS_FIXTURE)
    }

    async fn fetch_analyses(&self) -> Result<Vec<RawRecord>, AdapterError> {
        self.rows(ANALYSES_FIXTURE)
    }

    async fn fetch_downloads(&self, fields: &[&str]) -> Result<Vec<RawDownload>, AdapterError> {
        let rows = self.rows(DOWNLOADS_FIXTURE)?;
        if fields.is_empty() {
            return Ok(rows);
        }
        Ok(rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .filter(|(key, _)| key == "id" || fields.contains(&key.as_str()))
                    .collect()
            })
            .collect())
    }

    async fn fetch_abstracts(
        &self,
        dois: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>, AdapterError> {
        let path = self.dir.join(ABSTRACTS_FIXTURE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let all: BTreeMap<String, String> = read_json_file(&path)?;
        let wanted: BTreeSet<String> = dois.iter().map(|d| d.to_lowercase()).collect();
        Ok(all
            .into_iter()
            .map(|(doi, text)| (doi.to_lowercase(), text))
            .filter(|(doi, _)| wanted.contains(doi))
            .collect())
    }
}

/// Offline formatter answering from a DOI → citation map; unknown DOIs are "not found".
#[derive(Debug, Clone, Default)]
pub struct FixtureCitationFormatter {
    citations: BTreeMap<String, String>,
}

impl FixtureCitationFormatter {
    pub fn new(citations: BTreeMap<String, String>) -> Self {
        Self { citations }
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CITATIONS_FIXTURE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(Self::new(read_json_file(&path)?))
    }
}

#[async_trait]
impl CitationFormatter for FixtureCitationFormatter {
    async fn format_citation(&self, doi: &str) -> Result<String, CitationError> {
        self.citations
            .get(doi)
            .map(|text| clean_citation_text(text))
            .ok_or_else(|| CitationError::NotFound {
                doi: doi.to_string(),
                status: 404,
            })
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn sample_fixture_dir() -> PathBuf {
        workspace_root().join("fixtures").join("tcia").join("sample")
    }

    #[tokio::test]
    async fn fixture_source_reads_every_feed() {
        let source = FixtureCatalogSource::new(sample_fixture_dir());
        let collections = source.fetch_collections().await.expect("collections");
        let analyses = source.fetch_analyses().await.expect("analyses");
        let downloads = source.fetch_downloads(&[]).await.expect("downloads");
        assert!(!collections.is_empty());
        assert!(!analyses.is_empty());
        assert!(!downloads.is_empty());
        assert!(source.describe().starts_with("fixture:"));
    }

    #[tokio::test]
    async fn fixture_downloads_project_requested_fields_and_id() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join(DOWNLOADS_FIXTURE),
            r#"[{"id": 1, "download_title": "Images", "internal_note": "x"}]"#,
        )
        .expect("write downloads");
        let source = FixtureCatalogSource::new(dir.path());
        let rows = source.fetch_downloads(&["download_title"]).await.expect("downloads");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].contains_key("id"));
        assert!(rows[0].contains_key("download_title"));
        assert!(!rows[0].contains_key("internal_note"));
    }

    #[tokio::test]
    async fn missing_feed_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let source = FixtureCatalogSource::new(dir.path());
        assert!(source.fetch_collections().await.is_err());
        assert!(source
            .fetch_abstracts(&BTreeSet::from(["10.1/x".to_string()]))
            .await
            .expect("abstracts are optional")
            .is_empty());
    }

    #[tokio::test]
    async fn fixture_abstracts_match_case_insensitively() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join(ABSTRACTS_FIXTURE),
            r#"{"10.7937/K9/TCIA.2015.ABC": "Lung CT scans.", "10.1/other": "Other"}"#,
        )
        .expect("write abstracts");
        let source = FixtureCatalogSource::new(dir.path());
        let wanted = BTreeSet::from(["10.7937/k9/tcia.2015.abc".to_string()]);
        let found = source.fetch_abstracts(&wanted).await.expect("abstracts");
        assert_eq!(found.len(), 1);
        assert_eq!(found["10.7937/k9/tcia.2015.abc"], "Lung CT scans.");
    }

    #[tokio::test]
    async fn fixture_formatter_strips_doi_prefix_and_reports_missing() {
        let formatter = FixtureCitationFormatter::new(BTreeMap::from([(
            "10.1234/x".to_string(),
            " Smith, J. (2020). https://doi.org/10.1234/x \n".to_string(),
        )]));
        assert_eq!(
            formatter.format_citation("10.1234/x").await.expect("citation"),
            "Smith, J. (2020). 10.1234/x"
        );
        assert!(matches!(
            formatter.format_citation("10.1234/y").await,
            Err(CitationError::NotFound { status: 404, .. })
        ));
    }

    #[test]
    fn datacite_prefers_abstract_descriptions() {
        let doi: DataciteDoi = serde_json::from_value(serde_json::json!({
            "id": "10.7937/x",
            "attributes": {
                "doi": "10.7937/X",
                "descriptions": [
                    {"description": "Series info", "descriptionType": "SeriesInformation"},
                    {"description": " The abstract. ", "descriptionType": "Abstract"}
                ]
            }
        }))
        .expect("datacite doi");
        assert_eq!(doi.abstract_text().as_deref(), Some("The abstract."));
    }

    #[test]
    fn paging_stops_on_empty_or_final_page_only() {
        assert!(last_page_reached(1, 0, None));
        assert!(last_page_reached(3, 100, Some(3)));
        assert!(!last_page_reached(2, 100, Some(3)));
        assert!(!last_page_reached(5, 100, None));
    }

    #[test]
    fn live_urls_carry_paging_fields_and_encoded_dois() {
        let http = Arc::new(HttpFetcher::new(Default::default()).expect("http client"));
        let source = WordpressCatalogSource::new(Arc::clone(&http), Uuid::nil(), EndpointConfig::default());
        assert_eq!(
            source.page_url("downloads", 2, &["id", "download_url"]),
            "https://www.cancerimagingarchive.net/api/v1/downloads/?per_page=100&page=2&_fields=id%2Cdownload_url"
        );
        assert_eq!(
            source.page_url("collections", 1, &[]),
            "https://www.cancerimagingarchive.net/api/v1/collections/?per_page=100&page=1"
        );

        let formatter = CrossciteFormatter::new(http, Uuid::nil(), EndpointConfig::default());
        assert_eq!(
            formatter.url_for("10.7937/K9/TCIA.2015.LO9QL9SX"),
            "https://citation.crosscite.org/format?doi=10.7937%2FK9%2FTCIA.2015.LO9QL9SX&style=apa&lang=en-US"
        );
    }

    #[test]
    fn source_mode_parses_aliases() {
        assert_eq!(SourceMode::parse("LIVE"), Some(SourceMode::Live));
        assert_eq!(SourceMode::parse("fixtures"), Some(SourceMode::Fixture));
        assert_eq!(SourceMode::parse("db"), None);
    }
}
