//! Read-only JSON API over the unified dataset table.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::SystemTime;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tcia_core::DatasetRecord;
use tcia_sync::{read_dataset_table, SyncConfig, DATASET_TABLE_FILE};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "tcia-web";

/// Process-wide dataset cache. Populated on the first request and reloaded
/// only when the table file changes on disk or [`DatasetCache::invalidate`]
/// is called.
pub static DATASETS: LazyLock<DatasetCache> = LazyLock::new(DatasetCache::new);

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableStamp {
    path: PathBuf,
    modified: Option<SystemTime>,
    len: u64,
}

#[derive(Debug)]
struct LoadedTable {
    stamp: TableStamp,
    records: Arc<Vec<DatasetRecord>>,
}

#[derive(Debug, Default)]
pub struct DatasetCache {
    slot: RwLock<Option<LoadedTable>>,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records from `path`, or `None` when no sync run has written it yet.
    pub fn get(&self, path: &Path) -> anyhow::Result<Option<Arc<Vec<DatasetRecord>>>> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("inspecting {}", path.display())),
        };
        let stamp = TableStamp {
            path: path.to_path_buf(),
            modified: metadata.modified().ok(),
            len: metadata.len(),
        };

        {
            let guard = self.slot.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(loaded) = guard.as_ref() {
                if loaded.stamp == stamp {
                    return Ok(Some(Arc::clone(&loaded.records)));
                }
            }
        }

        let records = Arc::new(read_dataset_table(path)?);
        info!(path = %path.display(), rows = records.len(), "dataset table loaded");
        let mut guard = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(LoadedTable {
            stamp,
            records: Arc::clone(&records),
        });
        Ok(Some(records))
    }

    pub fn invalidate(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub table_path: PathBuf,
    cache: &'static DatasetCache,
}

impl AppState {
    pub fn new(table_path: impl Into<PathBuf>) -> Self {
        Self::with_cache(table_path, &DATASETS)
    }

    pub fn with_cache(table_path: impl Into<PathBuf>, cache: &'static DatasetCache) -> Self {
        Self {
            table_path: table_path.into(),
            cache,
        }
    }

    /// Stats the table and decodes it when stale, off the async workers.
    async fn datasets(&self) -> Result<Arc<Vec<DatasetRecord>>, Response> {
        let cache = self.cache;
        let path = self.table_path.clone();
        let loaded = tokio::task::spawn_blocking(move || cache.get(&path))
            .await
            .context("dataset table loader panicked")
            .and_then(|result| result);
        match loaded {
            Ok(Some(records)) => Ok(records),
            Ok(None) => Err(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "no dataset table has been written yet; run a sync first",
            )),
            Err(err) => Err(server_error(err)),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/datasets", get(datasets_handler))
        .route("/api/datasets/{id}", get(dataset_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TCIA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env()?;
    let state = AppState::new(config.output_dir.join(DATASET_TABLE_FILE));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, table = %state.table_path.display(), "serving dataset api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "table_present": state.table_path.exists(),
        "cached": state.cache.is_loaded(),
    }))
    .into_response()
}

async fn datasets_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.datasets().await {
        Ok(records) => Json(records.as_slice()).into_response(),
        Err(resp) => resp,
    }
}

async fn dataset_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    let records = match state.datasets().await {
        Ok(records) => records,
        Err(resp) => return resp,
    };
    match records.iter().find(|r| r.id == id) {
        Some(record) => Json(record).into_response(),
        None => error_response(StatusCode::NOT_FOUND, &format!("dataset {id} not found")),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tcia_core::DatasetKind;
    use tcia_sync::table::encode_dataset_table;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn record(id: i64, title: &str) -> DatasetRecord {
        let mut record = DatasetRecord::empty(id, DatasetKind::Collection);
        record.title = title.to_string();
        record
    }

    fn write_table(path: &Path, records: &[DatasetRecord]) {
        std::fs::write(path, encode_dataset_table(records).expect("encode")).expect("write table");
    }

    fn private_cache() -> &'static DatasetCache {
        Box::leak(Box::new(DatasetCache::new()))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let dir = tempdir().unwrap();
        let app = app(AppState::with_cache(dir.path().join(DATASET_TABLE_FILE), private_cache()));
        let (status, body) = get_json(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["table_present"], false);
    }

    #[tokio::test]
    async fn datasets_list_and_detail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DATASET_TABLE_FILE);
        write_table(&path, &[record(101, "LIDC-IDRI"), record(201, "Crowds-Cure")]);
        let app = app(AppState::with_cache(&path, private_cache()));

        let (status, body) = get_json(app.clone(), "/api/datasets").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(2));
        assert_eq!(body[0]["kind"], "Collection");

        let (status, body) = get_json(app.clone(), "/api/datasets/201").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Crowds-Cure");

        let (status, body) = get_json(app, "/api/datasets/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "dataset 999 not found");
    }

    #[tokio::test]
    async fn table_written_after_startup_is_picked_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DATASET_TABLE_FILE);
        let cache = private_cache();
        let app = app(AppState::with_cache(&path, cache));

        let (status, _) = get_json(app.clone(), "/api/datasets/7").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!cache.is_loaded());

        write_table(&path, &[record(7, "NSCLC-Radiomics")]);
        let (status, body) = get_json(app, "/api/datasets/7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "NSCLC-Radiomics");
        assert!(cache.is_loaded());
    }

    #[tokio::test]
    async fn missing_table_is_unavailable() {
        let dir = tempdir().unwrap();
        let app = app(AppState::with_cache(dir.path().join(DATASET_TABLE_FILE), private_cache()));
        let (status, _) = get_json(app, "/api/datasets").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn cache_loads_once_and_reloads_after_a_new_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DATASET_TABLE_FILE);
        write_table(&path, &[record(1, "One")]);
        let cache = DatasetCache::new();
        assert!(!cache.is_loaded());

        let first = cache.get(&path).unwrap().unwrap();
        let again = cache.get(&path).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        write_table(&path, &[record(1, "One"), record(2, "Two with a longer title")]);
        let reloaded = cache.get(&path).unwrap().unwrap();
        assert_eq!(reloaded.len(), 2);

        cache.invalidate();
        assert!(!cache.is_loaded());
        assert_eq!(cache.get(&path).unwrap().unwrap().len(), 2);
    }
}
