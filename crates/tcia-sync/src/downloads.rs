//! Joins the downloads feed onto datasets by foreign id.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tcia_core::normalize::{
    normalize_count_value, normalize_list, normalize_string, parse_id, parse_id_value, FieldAnomaly,
};
use tcia_core::{DownloadRecord, RawDownload};

use crate::unify::StagedDataset;
use crate::AnomalyLog;

/// Download-feed columns projected onto each dataset; also the field list
/// requested from the feed.
pub const DOWNLOAD_COLUMNS: &[&str] = &[
    "download_requirements",
    "download_size",
    "download_title",
    "data_license",
    "download_size_unit",
    "download_type",
    "download_url",
    "search_url",
    "subjects",
    "data_type",
    "study_count",
    "file_type",
    "series_count",
    "image_count",
    "date_updated",
];

#[derive(Debug, Clone, Default)]
pub struct DownloadTable {
    rows: HashMap<i64, RawDownload>,
}

impl DownloadTable {
    /// Rows without a well-formed `id` are dropped here, never raised.
    pub fn from_rows(rows: Vec<RawDownload>, log: &mut AnomalyLog) -> Self {
        let mut by_id = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some(id) = parse_id_value(row.get("id")) else {
                log.record(
                    "download_id",
                    0,
                    &FieldAnomaly::Unparseable {
                        expected: "download id",
                        raw: normalize_string(row.get("id")),
                    },
                );
                continue;
            };
            if by_id.contains_key(&id) {
                log.record(
                    "download_id",
                    id,
                    &FieldAnomaly::Unparseable {
                        expected: "unique download id",
                        raw: id.to_string(),
                    },
                );
                continue;
            }
            by_id.insert(id, row);
        }
        Self { rows: by_id }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<DownloadRecord> {
        self.rows.get(&id).map(|row| project_download(id, row))
    }
}

pub fn project_download(id: i64, row: &RawDownload) -> DownloadRecord {
    DownloadRecord {
        id,
        title: normalize_string(row.get("download_title")),
        url: normalize_string(row.get("download_url")),
        search_url: normalize_string(row.get("search_url")),
        license: normalize_string(row.get("data_license")),
        size_value: normalize_string(row.get("download_size")),
        size_unit: normalize_string(row.get("download_size_unit")),
        download_type: normalize_string(row.get("download_type")),
        file_type: normalize_string(row.get("file_type")),
        data_type: normalize_list(row.get("data_type")),
        date_updated: normalize_string(row.get("date_updated")),
        subjects: normalize_count_value(row.get("subjects")),
        study_count: normalize_count_value(row.get("study_count")),
        series_count: normalize_count_value(row.get("series_count")),
        image_count: normalize_count_value(row.get("image_count")),
        requirements: normalize_string(row.get("download_requirements")),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttachStats {
    pub attached: usize,
    pub retired: usize,
    pub malformed: usize,
}

/// Attaches downloads in the order each dataset lists them. Ids missing from
/// the table (retired upstream) are ignored; malformed ids are skipped.
pub fn attach_downloads(
    staged: &mut [StagedDataset],
    table: &DownloadTable,
    log: &mut AnomalyLog,
) -> AttachStats {
    let mut stats = AttachStats::default();
    for item in staged.iter_mut() {
        let mut seen = BTreeSet::new();
        let mut downloads = Vec::new();
        for raw_id in &item.download_ids {
            let Some(id) = parse_id(raw_id) else {
                stats.malformed += 1;
                log.record(
                    "download_ids",
                    item.record.id,
                    &FieldAnomaly::Unparseable {
                        expected: "download id",
                        raw: raw_id.clone(),
                    },
                );
                continue;
            };
            if !seen.insert(id) {
                continue;
            }
            match table.get(id) {
                Some(download) => downloads.push(download),
                None => stats.retired += 1,
            }
        }
        stats.attached += downloads.len();
        item.record.downloads = downloads;
    }
    stats
}
