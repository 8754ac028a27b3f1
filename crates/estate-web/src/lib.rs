//! Read-only HTTP surface over the listing table, run reports and monitor state.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use estate_core::Record;
use estate_storage::TableStore;
use estate_sync::{
    evaluate_table, read_latest_outcome, HealthState, MonitorConfig, PipelineConfig, QualityGate,
    SyncConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "estate-web";

#[derive(Clone)]
pub struct AppState {
    pub table: TableStore,
    pub gate: QualityGate,
    pub reports_dir: PathBuf,
    pub health_state_path: PathBuf,
}

impl AppState {
    pub fn new(
        table: TableStore,
        gate: QualityGate,
        reports_dir: impl Into<PathBuf>,
        health_state_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            table,
            gate,
            reports_dir: reports_dir.into(),
            health_state_path: health_state_path.into(),
        }
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        let sync = SyncConfig::from_env();
        let pipeline = PipelineConfig::load(&sync.pipeline_config).await?;
        let monitor = MonitorConfig::from_env();
        let table_root = sync
            .table_dir
            .clone()
            .unwrap_or_else(|| pipeline.table_location.clone());
        Ok(Self::new(
            TableStore::open(table_root),
            QualityGate::new(pipeline.quality, pipeline.bounds),
            sync.reports_dir,
            monitor.state_path,
        ))
    }
}

#[derive(Debug, Clone, Serialize)]
struct VersionRow {
    version: u64,
    committed_at: String,
    record_count: usize,
    inserted: usize,
    updated: usize,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    latest_run_id: String,
    latest_status: String,
    latest_verdict: String,
    latest_inserted: usize,
    latest_updated: usize,
    current_version: String,
    version_count: usize,
    versions: Vec<VersionRow>,
    endpoints: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordsQuery {
    version: Option<u64>,
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct QualityQuery {
    version: Option<u64>,
}

#[derive(Debug, Serialize)]
struct RecordsPage {
    version: Option<u64>,
    total: usize,
    offset: usize,
    records: Vec<Record>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/healthz", get(healthz_handler))
        .route("/runs/latest", get(latest_run_handler))
        .route("/table/versions", get(versions_handler))
        .route("/table/records", get(records_handler))
        .route("/table/quality", get(quality_handler))
        .route("/health/state", get(health_state_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("ESTATE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::from_env().await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, table = %state.table.root().display(), "serving listing table");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let latest = match read_latest_outcome(&state.reports_dir).await {
        Ok(latest) => latest,
        Err(err) => return server_error(err),
    };
    let versions = match state.table.versions().await {
        Ok(versions) => versions,
        Err(err) => return server_error(err.into()),
    };
    let health = match HealthState::load(&state.health_state_path).await {
        Ok(health) => health,
        Err(err) => return server_error(err),
    };

    let tpl = IndexTemplate {
        latest_run_id: latest
            .as_ref()
            .map(|o| o.run_id.to_string())
            .unwrap_or_else(|| "n/a".into()),
        latest_status: latest
            .as_ref()
            .map(|o| format!("{:?}", o.status))
            .unwrap_or_else(|| "n/a".into()),
        latest_verdict: latest
            .as_ref()
            .and_then(|o| o.quality_verdict())
            .map(|v| v.to_string())
            .unwrap_or_else(|| "n/a".into()),
        latest_inserted: latest.as_ref().map(|o| o.records_ingested).unwrap_or(0),
        latest_updated: latest.as_ref().map(|o| o.records_updated).unwrap_or(0),
        current_version: versions
            .last()
            .map(|e| e.version.to_string())
            .unwrap_or_else(|| "none".into()),
        version_count: versions.len(),
        versions: versions
            .iter()
            .rev()
            .take(20)
            .map(|e| VersionRow {
                version: e.version,
                committed_at: e.committed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                record_count: e.record_count,
                inserted: e.metrics.inserted,
                updated: e.metrics.updated,
            })
            .collect(),
        endpoints: health
            .endpoints
            .iter()
            .map(|(name, status)| {
                format!("{name}: {}", if status.up { "up" } else { "down" })
            })
            .collect(),
    };
    render_html(tpl)
}

async fn latest_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match read_latest_outcome(&state.reports_dir).await {
        Ok(Some(outcome)) => Json(outcome).into_response(),
        Ok(None) => not_found("no run has been reported yet"),
        Err(err) => server_error(err),
    }
}

async fn versions_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.table.versions().await {
        Ok(versions) => Json(versions).into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Committed records of one version, in identifier order, for downstream export.
async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let current = match state.table.current_version().await {
        Ok(current) => current,
        Err(err) => return server_error(err.into()),
    };
    let version = match query.version {
        Some(v) if v == 0 || Some(v) > current => return not_found("unknown table version"),
        Some(v) => Some(v),
        None => current,
    };
    let snapshot = match version {
        Some(v) => state.table.snapshot_at(v).await,
        None => Ok(Default::default()),
    };
    let snapshot = match snapshot {
        Ok(snapshot) => snapshot,
        Err(err) => return server_error(err.into()),
    };

    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(500).clamp(1, 5_000);
    Json(RecordsPage {
        version,
        total: snapshot.len(),
        offset,
        records: snapshot
            .records
            .into_values()
            .skip(offset)
            .take(limit)
            .collect(),
    })
    .into_response()
}

async fn quality_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QualityQuery>,
) -> Response {
    if let Some(v) = query.version {
        match state.table.current_version().await {
            Ok(current) if v == 0 || Some(v) > current => {
                return not_found("unknown table version")
            }
            Ok(_) => {}
            Err(err) => return server_error(err.into()),
        }
    }
    match evaluate_table(&state.table, &state.gate, query.version).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn health_state_handler(State(state): State<Arc<AppState>>) -> Response {
    match HealthState::load(&state.health_state_path).await {
        Ok(health) => Json(health).into_response(),
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
