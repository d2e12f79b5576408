//! Parquet encoding of the unified dataset table and the citation cache.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::builder::{Int64Builder, ListBuilder, StringBuilder};
use arrow_array::{
    Array, ArrayRef, Date32Array, Int64Array, ListArray, RecordBatch, StringArray, UInt64Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use tcia_core::{CitationCacheEntry, DatasetKind, DatasetRecord, DownloadRecord};

/// Column order of the persisted dataset table.
pub const DATASET_COLUMNS: &[&str] = &[
    "id",
    "kind",
    "title",
    "short_title",
    "link",
    "doi",
    "access_type",
    "cancer_types",
    "cancer_locations",
    "supporting_data",
    "data_types",
    "program",
    "number_of_subjects",
    "date_updated",
    "related_dataset_ids",
    "related_datasets",
    "downloads",
    "summary",
    "citation",
];

pub const CITATION_COLUMNS: &[&str] = &["doi", "citation"];

fn list_of(item: DataType) -> DataType {
    DataType::List(Arc::new(ArrowField::new("item", item, true)))
}

pub fn dataset_schema() -> SchemaRef {
    let text = |name: &str| ArrowField::new(name, DataType::Utf8, false);
    let texts = |name: &str| ArrowField::new(name, list_of(DataType::Utf8), false);
    Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        text("kind"),
        text("title"),
        text("short_title"),
        text("link"),
        text("doi"),
        text("access_type"),
        texts("cancer_types"),
        texts("cancer_locations"),
        texts("supporting_data"),
        texts("data_types"),
        texts("program"),
        ArrowField::new("number_of_subjects", DataType::UInt64, false),
        ArrowField::new("date_updated", DataType::Date32, true),
        ArrowField::new("related_dataset_ids", list_of(DataType::Int64), false),
        texts("related_datasets"),
        // JSON array of download descriptors; upstream count columns are mixed-type.
        text("downloads"),
        text("summary"),
        text("citation"),
    ]))
}

pub fn citation_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("doi", DataType::Utf8, false),
        ArrowField::new("citation", DataType::Utf8, false),
    ]))
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn text_column<'a>(records: &'a [DatasetRecord], get: impl Fn(&'a DatasetRecord) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from(records.iter().map(get).collect::<Vec<_>>()))
}

fn text_list_column<'a>(
    records: &'a [DatasetRecord],
    get: impl Fn(&'a DatasetRecord) -> &'a [String],
) -> ArrayRef {
    let mut builder = ListBuilder::new(StringBuilder::new());
    for record in records {
        for item in get(record) {
            builder.values().append_value(item);
        }
        builder.append(true);
    }
    Arc::new(builder.finish())
}

pub fn dataset_batch(records: &[DatasetRecord]) -> Result<RecordBatch> {
    let mut related_ids = ListBuilder::new(Int64Builder::new());
    for record in records {
        related_ids.values().append_slice(&record.related_dataset_ids);
        related_ids.append(true);
    }
    let downloads = records
        .iter()
        .map(|r| serde_json::to_string(&r.downloads))
        .collect::<Result<Vec<_>, _>>()
        .context("serializing download descriptors")?;

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(records.iter().map(|r| r.id).collect::<Vec<_>>())),
        text_column(records, |r| r.kind.as_str()),
        text_column(records, |r| &r.title),
        text_column(records, |r| &r.short_title),
        text_column(records, |r| &r.link),
        text_column(records, |r| &r.doi),
        text_column(records, |r| &r.access_type),
        text_list_column(records, |r| &r.cancer_types),
        text_list_column(records, |r| &r.cancer_locations),
        text_list_column(records, |r| &r.supporting_data),
        text_list_column(records, |r| &r.data_types),
        text_list_column(records, |r| &r.program),
        Arc::new(UInt64Array::from(
            records.iter().map(|r| r.number_of_subjects).collect::<Vec<_>>(),
        )),
        Arc::new(Date32Array::from(
            records
                .iter()
                .map(|r| r.date_updated.map(|d| (d - epoch()).num_days() as i32))
                .collect::<Vec<_>>(),
        )),
        Arc::new(related_ids.finish()),
        text_list_column(records, |r| &r.related_datasets),
        Arc::new(StringArray::from(downloads)),
        text_column(records, |r| &r.summary),
        text_column(records, |r| &r.citation),
    ];

    RecordBatch::try_new(dataset_schema(), columns).context("building dataset record batch")
}

pub fn citation_batch(entries: &[CitationCacheEntry]) -> Result<RecordBatch> {
    let dois = StringArray::from(entries.iter().map(|e| e.doi.as_str()).collect::<Vec<_>>());
    let citations = StringArray::from(entries.iter().map(|e| e.citation.as_str()).collect::<Vec<_>>());
    RecordBatch::try_new(citation_schema(), vec![Arc::new(dois), Arc::new(citations)])
        .context("building citation cache record batch")
}

/// Parquet bytes for one batch, ready for an atomic write.
pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buffer, batch.schema(), None).context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

pub fn read_batches(path: &Path) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?;
    let schema = builder.schema().clone();
    let reader = builder
        .build()
        .with_context(|| format!("opening parquet reader {}", path.display()))?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("decoding {}", path.display()))?;
    Ok((schema, batches))
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .with_context(|| format!("missing column {name}"))?
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("column {name} has an unexpected type"))
}

fn string_at(array: &StringArray, row: usize) -> String {
    if array.is_null(row) {
        String::new()
    } else {
        array.value(row).to_string()
    }
}

fn text_list_at(list: &ListArray, row: usize, name: &str) -> Result<Vec<String>> {
    if list.is_null(row) {
        return Ok(Vec::new());
    }
    let values = list.value(row);
    let values = values
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("column {name} does not hold text items"))?;
    Ok(values.iter().flatten().map(str::to_string).collect())
}

fn int_list_at(list: &ListArray, row: usize, name: &str) -> Result<Vec<i64>> {
    if list.is_null(row) {
        return Ok(Vec::new());
    }
    let values = list.value(row);
    let values = values
        .as_any()
        .downcast_ref::<Int64Array>()
        .with_context(|| format!("column {name} does not hold integer items"))?;
    Ok(values.iter().flatten().collect())
}

pub fn records_from_batch(batch: &RecordBatch) -> Result<Vec<DatasetRecord>> {
    let ids = column::<Int64Array>(batch, "id")?;
    let kinds = column::<StringArray>(batch, "kind")?;
    let titles = column::<StringArray>(batch, "title")?;
    let short_titles = column::<StringArray>(batch, "short_title")?;
    let links = column::<StringArray>(batch, "link")?;
    let dois = column::<StringArray>(batch, "doi")?;
    let access = column::<StringArray>(batch, "access_type")?;
    let cancer_types = column::<ListArray>(batch, "cancer_types")?;
    let cancer_locations = column::<ListArray>(batch, "cancer_locations")?;
    let supporting = column::<ListArray>(batch, "supporting_data")?;
    let data_types = column::<ListArray>(batch, "data_types")?;
    let program = column::<ListArray>(batch, "program")?;
    let subjects = column::<UInt64Array>(batch, "number_of_subjects")?;
    let dates = column::<Date32Array>(batch, "date_updated")?;
    let related_ids = column::<ListArray>(batch, "related_dataset_ids")?;
    let related = column::<ListArray>(batch, "related_datasets")?;
    let downloads = column::<StringArray>(batch, "downloads")?;
    let summaries = column::<StringArray>(batch, "summary")?;
    let citations = column::<StringArray>(batch, "citation")?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let kind_label = string_at(kinds, row);
        let kind = DatasetKind::parse(&kind_label)
            .with_context(|| format!("unknown dataset kind {kind_label:?} in row {row}"))?;
        let download_json = string_at(downloads, row);
        let download_list: Vec<DownloadRecord> = if download_json.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&download_json)
                .with_context(|| format!("parsing downloads of row {row}"))?
        };
        records.push(DatasetRecord {
            id: ids.value(row),
            kind,
            title: string_at(titles, row),
            short_title: string_at(short_titles, row),
            link: string_at(links, row),
            doi: string_at(dois, row),
            access_type: string_at(access, row),
            cancer_types: text_list_at(cancer_types, row, "cancer_types")?,
            cancer_locations: text_list_at(cancer_locations, row, "cancer_locations")?,
            supporting_data: text_list_at(supporting, row, "supporting_data")?,
            data_types: text_list_at(data_types, row, "data_types")?,
            program: text_list_at(program, row, "program")?,
            number_of_subjects: subjects.value(row),
            date_updated: (!dates.is_null(row))
                .then(|| epoch() + chrono::Duration::days(i64::from(dates.value(row)))),
            related_dataset_ids: int_list_at(related_ids, row, "related_dataset_ids")?,
            related_datasets: text_list_at(related, row, "related_datasets")?,
            downloads: download_list,
            summary: string_at(summaries, row),
            citation: string_at(citations, row),
        });
    }
    Ok(records)
}

pub fn encode_dataset_table(records: &[DatasetRecord]) -> Result<Vec<u8>> {
    encode_parquet(&dataset_batch(records)?)
}

pub fn read_dataset_table(path: &Path) -> Result<Vec<DatasetRecord>> {
    let (_schema, batches) = read_batches(path)?;
    let mut records = Vec::new();
    for batch in &batches {
        records.extend(records_from_batch(batch)?);
    }
    Ok(records)
}

pub fn encode_citation_cache(entries: &[CitationCacheEntry]) -> Result<Vec<u8>> {
    encode_parquet(&citation_batch(entries)?)
}

pub fn read_citation_entries(path: &Path) -> Result<Vec<CitationCacheEntry>> {
    let (_schema, batches) = read_batches(path)?;
    let mut entries = Vec::new();
    for batch in &batches {
        let dois = column::<StringArray>(batch, "doi")?;
        let citations = column::<StringArray>(batch, "citation")?;
        for row in 0..batch.num_rows() {
            entries.push(CitationCacheEntry {
                doi: string_at(dois, row),
                citation: string_at(citations, row),
            });
        }
    }
    Ok(entries)
}
