//! Core domain model for the TCIA catalog sync pipeline.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod normalize;

pub const CRATE_NAME: &str = "tcia-core";

/// One upstream catalog row exactly as the feed returned it.
pub type RawRecord = Map<String, Value>;

/// One row of the downloads feed, keyed by its own `id`.
pub type RawDownload = Map<String, Value>;

/// Placeholder citation for records that carry no DOI.
pub const NO_DOI_CITATION: &str = "No DOI provided.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatasetKind {
    #[serde(rename = "Collection")]
    Collection,
    #[serde(rename = "Analysis Result")]
    AnalysisResult,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collection => "Collection",
            Self::AnalysisResult => "Analysis Result",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "Collection" => Some(Self::Collection),
            "Analysis Result" => Some(Self::AnalysisResult),
            _ => None,
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A count column of the downloads feed. Upstream mixes numbers and free text
/// in these columns, so anything that is not an integer is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CountValue {
    Int(i64),
    Text(String),
}

impl Default for CountValue {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl CountValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for CountValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Projection of one downloads-feed row attached to a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub search_url: String,
    pub license: String,
    pub size_value: String,
    pub size_unit: String,
    pub download_type: String,
    pub file_type: String,
    pub data_type: Vec<String>,
    pub date_updated: String,
    pub subjects: CountValue,
    pub study_count: CountValue,
    pub series_count: CountValue,
    pub image_count: CountValue,
    pub requirements: String,
}

/// Canonical, schema-complete dataset row served to the browsing UI.
///
/// Scalar text fields use `""` for "absent"; list fields use an empty list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: i64,
    pub kind: DatasetKind,
    pub title: String,
    pub short_title: String,
    pub link: String,
    pub doi: String,
    pub access_type: String,
    pub cancer_types: Vec<String>,
    pub cancer_locations: Vec<String>,
    pub supporting_data: Vec<String>,
    pub data_types: Vec<String>,
    pub program: Vec<String>,
    pub number_of_subjects: u64,
    pub date_updated: Option<NaiveDate>,
    pub related_dataset_ids: Vec<i64>,
    pub related_datasets: Vec<String>,
    pub downloads: Vec<DownloadRecord>,
    pub summary: String,
    pub citation: String,
}

impl DatasetRecord {
    pub fn empty(id: i64, kind: DatasetKind) -> Self {
        Self {
            id,
            kind,
            title: String::new(),
            short_title: String::new(),
            link: String::new(),
            doi: String::new(),
            access_type: String::new(),
            cancer_types: Vec::new(),
            cancer_locations: Vec::new(),
            supporting_data: Vec::new(),
            data_types: Vec::new(),
            program: Vec::new(),
            number_of_subjects: 0,
            date_updated: None,
            related_dataset_ids: Vec::new(),
            related_datasets: Vec::new(),
            downloads: Vec::new(),
            summary: String::new(),
            citation: String::new(),
        }
    }
}

/// One persisted DOI → citation pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationCacheEntry {
    pub doi: String,
    pub citation: String,
}
