//! Axum JSON API exposing the collector to the dashboard.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use carto_core::CollectionStrategy;
use carto_pipeline::Collector;
use carto_storage::OutputLayout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const CRATE_NAME: &str = "carto-web";

const DEFAULT_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<Collector>,
}

impl AppState {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self { collector }
    }

    fn layout(&self) -> OutputLayout {
        self.collector.layout()
    }
}

#[derive(Debug, Deserialize, Default)]
struct StartQuery {
    strategy: Option<String>,
    delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRow {
    pub name: String,
    pub size: u64,
    pub modified: String,
    pub kind: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/start", post(start_handler))
        .route("/api/stop", post(stop_handler))
        .route("/api/status", get(status_handler))
        .route("/api/download", get(download_master_handler))
        .route("/api/download/all", get(download_all_handler))
        .route("/api/files", get(files_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: Option<u16>) -> anyhow::Result<()> {
    let port = port
        .or_else(|| {
            std::env::var("CARTO_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "dashboard API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn start_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StartQuery>,
) -> Response {
    let strategy = match query.strategy.as_deref() {
        Some("national") | Some("national_only") => CollectionStrategy::NationalOnly,
        _ => CollectionStrategy::Full,
    };
    let delay = query.delay_secs.map(Duration::from_secs);

    match state.collector.start(strategy, delay) {
        Ok(true) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "started"})),
        )
            .into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "a collection run is already in progress"})),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Response {
    state.collector.request_stop();
    Json(serde_json::json!({"status": "stopping"})).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.collector.status()).into_response()
}

async fn download_master_handler(State(state): State<Arc<AppState>>) -> Response {
    let master = state.layout().master_path();
    match tokio::fs::read(&master).await {
        Ok(bytes) => {
            let file_name = master
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "master.csv".to_string());
            attachment_response(bytes, &file_name, "text/csv; charset=utf-8")
        }
        Err(_) => not_found("master dataset not available yet"),
    }
}

async fn download_all_handler(State(state): State<Arc<AppState>>) -> Response {
    let layout = state.layout();
    let archive = tokio::task::spawn_blocking(move || build_archive(&layout)).await;
    match archive {
        Ok(Ok(Some(bytes))) => attachment_response(bytes, "mco_artifacts.zip", "application/zip"),
        Ok(Ok(None)) => not_found("no artifacts to archive"),
        Ok(Err(err)) => server_error(err),
        Err(err) => server_error(anyhow::anyhow!("archive task failed: {err}")),
    }
}

async fn files_handler(State(state): State<Arc<AppState>>) -> Response {
    let layout = state.layout();
    match list_artifacts(&layout) {
        Ok(files) => {
            let total_individual = files.iter().filter(|f| f.kind == "individual").count();
            Json(serde_json::json!({
                "files": files,
                "total_individual": total_individual,
            }))
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

fn attachment_response(bytes: Vec<u8>, file_name: &str, content_type: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

/// Bundles the master dataset, the cleaned artifacts and the raw artifact
/// tree (structure preserved) under three top-level archive folders. Returns
/// `None` when there is nothing at all to bundle.
fn build_archive(layout: &OutputLayout) -> anyhow::Result<Option<Vec<u8>>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    let mut entries = 0usize;

    let master = layout.master_path();
    if master.is_file() {
        let name = master
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "master.csv".to_string());
        writer.start_file(format!("master/{name}"), options)?;
        writer.write_all(&std::fs::read(&master)?)?;
        entries += 1;
    }

    for file in walk_files(&layout.cleaned_dir())? {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        writer.start_file(format!("cleaned/{name}"), options)?;
        writer.write_all(&std::fs::read(&file)?)?;
        entries += 1;
    }

    let raw_dir = layout.raw_dir();
    for file in walk_files(&raw_dir)? {
        let relative = file
            .strip_prefix(&raw_dir)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        writer.start_file(format!("raw/{relative}"), options)?;
        writer.write_all(&std::fs::read(&file)?)?;
        entries += 1;
    }

    if entries == 0 {
        return Ok(None);
    }
    let cursor = writer.finish()?;
    Ok(Some(cursor.into_inner()))
}

fn list_artifacts(layout: &OutputLayout) -> anyhow::Result<Vec<ArtifactRow>> {
    let mut out = Vec::new();

    let master = layout.master_path();
    if let Ok(metadata) = std::fs::metadata(&master) {
        out.push(ArtifactRow {
            name: master
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            size: metadata.len(),
            modified: format_modified(metadata.modified().ok()),
            kind: "consolidated".to_string(),
        });
    }

    let mut individual = walk_files(&layout.cleaned_dir())?;
    individual.sort();
    for file in individual {
        let metadata = std::fs::metadata(&file)?;
        out.push(ArtifactRow {
            name: file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            size: metadata.len(),
            modified: format_modified(metadata.modified().ok()),
            kind: "individual".to_string(),
        });
    }

    Ok(out)
}

fn format_modified(modified: Option<SystemTime>) -> String {
    modified
        .map(|time| {
            DateTime::<Utc>::from(time)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_default()
}

fn walk_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}
