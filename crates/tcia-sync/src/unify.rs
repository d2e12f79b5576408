//! Maps the collection and analysis-result feeds onto [`DatasetRecord`].

use tcia_core::normalize::{
    coalesce_non_empty, normalize_list, normalize_string, normalize_title, parse_count, parse_date,
    parse_id_value, FieldAnomaly,
};
use tcia_core::{DatasetKind, DatasetRecord, RawRecord};

use crate::AnomalyLog;

/// Source field names for one dataset kind.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub kind: DatasetKind,
    pub explicit_title: &'static str,
    pub browse_title: &'static str,
    pub short_title: &'static str,
    pub doi: &'static str,
    pub access_type: &'static str,
    pub downloads: &'static str,
    pub supporting_data: Option<&'static str>,
    pub data_types: &'static str,
}

pub const COLLECTION_FIELDS: FieldMap = FieldMap {
    kind: DatasetKind::Collection,
    explicit_title: "collection_title",
    browse_title: "collection_browse_title",
    short_title: "collection_short_title",
    doi: "collection_doi",
    access_type: "collection_page_accessibility",
    downloads: "collection_downloads",
    supporting_data: Some("supporting_data"),
    data_types: "data_types",
};

// Analysis results publish their data types under `supporting_data`.
pub const ANALYSIS_FIELDS: FieldMap = FieldMap {
    kind: DatasetKind::AnalysisResult,
    explicit_title: "result_title",
    browse_title: "result_browse_title",
    short_title: "result_short_title",
    doi: "result_doi",
    access_type: "result_page_accessibility",
    downloads: "result_downloads",
    supporting_data: None,
    data_types: "supporting_data",
};

/// Relationship references exactly as spelled upstream, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelatedRefs {
    pub related_collection: Vec<String>,
    pub related_collections: Vec<String>,
    pub related_analysis_results: Vec<String>,
}

impl RelatedRefs {
    pub fn from_raw(raw: &RawRecord) -> Self {
        Self {
            related_collection: normalize_list(raw.get("related_collection")),
            related_collections: normalize_list(raw.get("related_collections")),
            related_analysis_results: normalize_list(raw.get("related_analysis_results")),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.related_collection
            .iter()
            .chain(&self.related_collections)
            .chain(&self.related_analysis_results)
    }
}

/// A unified record plus the raw foreign keys later stages resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDataset {
    pub record: DatasetRecord,
    pub download_ids: Vec<String>,
    pub related: RelatedRefs,
}

impl StagedDataset {
    pub fn into_record(self) -> DatasetRecord {
        self.record
    }
}

/// Collections first, then analysis results. Nothing is filtered out.
pub fn unify(
    collections: &[RawRecord],
    analyses: &[RawRecord],
    log: &mut AnomalyLog,
) -> Vec<StagedDataset> {
    let mut staged: Vec<StagedDataset> = collections
        .iter()
        .map(|raw| unify_one(raw, &COLLECTION_FIELDS, log))
        .collect();
    staged.extend(analyses.iter().map(|raw| unify_one(raw, &ANALYSIS_FIELDS, log)));
    staged
}

pub fn unify_one(raw: &RawRecord, fields: &FieldMap, log: &mut AnomalyLog) -> StagedDataset {
    let id = match parse_id_value(raw.get("id")) {
        Some(id) => id,
        None => {
            log.record(
                "id",
                0,
                &FieldAnomaly::Unparseable {
                    expected: "non-negative integer id",
                    raw: normalize_string(raw.get("id")),
                },
            );
            0
        }
    };

    let mut record = DatasetRecord::empty(id, fields.kind);
    let explicit = normalize_string(raw.get(fields.explicit_title));
    let rendered = normalize_title(raw.get("title"));
    let browse = normalize_string(raw.get(fields.browse_title));
    let slug = normalize_string(raw.get("slug"));
    record.title = coalesce_non_empty(&[
        explicit.as_str(),
        rendered.as_str(),
        browse.as_str(),
        slug.as_str(),
    ]);

    record.short_title = normalize_string(raw.get(fields.short_title));
    record.link = normalize_string(raw.get("link"));
    record.doi = normalize_string(raw.get(fields.doi));
    record.access_type = normalize_string(raw.get(fields.access_type));
    record.cancer_types = normalize_list(raw.get("cancer_types"));
    record.cancer_locations = normalize_list(raw.get("cancer_locations"));
    record.supporting_data = fields
        .supporting_data
        .map(|name| normalize_list(raw.get(name)))
        .unwrap_or_default();
    record.data_types = normalize_list(raw.get(fields.data_types));
    record.program = normalize_list(raw.get("program"));

    record.number_of_subjects = parse_count(raw.get("subjects")).unwrap_or_else(|anomaly| {
        log.record("number_of_subjects", id, &anomaly);
        0
    });
    record.date_updated = parse_date(raw.get("date_updated")).unwrap_or_else(|anomaly| {
        log.record("date_updated", id, &anomaly);
        None
    });

    StagedDataset {
        record,
        download_ids: normalize_list(raw.get(fields.downloads)),
        related: RelatedRefs::from_raw(raw),
    }
}
