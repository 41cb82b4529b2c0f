//! Run orchestration, cleaning and consolidation for the MCO collector.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use carto_core::{
    combinations_for, validate, CollectionStrategy, RequestCombination, RequestOutcome,
};
use carto_extract::{extract, Extraction};
use carto_storage::{ArtifactStore, OutputLayout, PageFetcher, SessionClient, SessionConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "carto-pipeline";

/// Log ring-buffer bound; the oldest entries are evicted first.
pub const MAX_LOG_ENTRIES: usize = 100;
/// How many of the buffered entries a status snapshot carries.
pub const STATUS_LOG_LINES: usize = 20;

/// Count columns subject to the privacy sentinel and integer coercion.
pub const COUNT_COLUMNS: [&str; 4] = [
    "Nombre de séjours/séances total",
    "Nombre de séjours en hospit complète",
    "Nombre de séjours en hospit partielle",
    "Nombre de séances",
];
/// The source suppresses exact small counts for privacy.
pub const SMALL_COUNT_SENTINEL: &str = "1 à 10";
/// Fixed representative value substituted for the sentinel.
pub const SMALL_COUNT_VALUE: i64 = 5;
/// Facility identifier column: fixed-width text, never a number.
pub const FINESS_COLUMN: &str = "Finess";
pub const FINESS_WIDTH: usize = 9;
pub const CLEANED_PREFIX: &str = "cleaned_";
/// Provenance column appended during consolidation.
pub const PROVENANCE_COLUMN: &str = "fichier_source";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub session: SessionConfig,
    pub output_dir: PathBuf,
    pub delay: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            output_dir: PathBuf::from("./donnees_mco"),
            delay: Duration::from_secs(2),
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            session: SessionConfig::from_env(),
            output_dir: std::env::var("CARTO_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            delay: std::env::var("CARTO_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.delay),
        }
    }

    pub fn layout(&self) -> OutputLayout {
        OutputLayout::new(&self.output_dir)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub time: String,
    pub level: String,
    pub message: String,
}

/// Cooperative cancellation flag, checked once per combination boundary.
/// An in-flight request is allowed to complete.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct RunStateInner {
    run_id: Option<Uuid>,
    is_running: bool,
    processed: usize,
    total: usize,
    current_label: String,
    succeeded: usize,
    empty_zones: usize,
    minimal_data: usize,
    failed: usize,
    skipped: usize,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    logs: VecDeque<LogEntry>,
}

/// Point-in-time view of the run, safe to serialize straight to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub is_running: bool,
    pub run_id: Option<String>,
    pub processed: usize,
    pub total: usize,
    pub progress_percent: u32,
    pub current_label: String,
    pub succeeded: usize,
    pub empty_zones: usize,
    pub minimal_data: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed_seconds: Option<i64>,
    pub logs: Vec<LogEntry>,
}

/// Explicit run state owned by the controller and read by a polling observer.
/// All access goes through this handle; the inner state is never shared raw.
#[derive(Debug, Clone, Default)]
pub struct RunStateHandle(Arc<Mutex<RunStateInner>>);

impl RunStateHandle {
    /// Atomically claims the run slot. Returns false when a run is already in
    /// progress; otherwise resets all counters for a fresh run.
    pub fn try_begin(&self, total: usize) -> bool {
        let mut inner = self.0.lock().expect("run state poisoned");
        if inner.is_running {
            return false;
        }
        *inner = RunStateInner {
            run_id: Some(Uuid::new_v4()),
            is_running: true,
            total,
            started_at: Some(Utc::now()),
            ..RunStateInner::default()
        };
        true
    }

    pub fn finish(&self) {
        let mut inner = self.0.lock().expect("run state poisoned");
        inner.is_running = false;
        inner.finished_at = Some(Utc::now());
        inner.current_label.clear();
    }

    pub fn set_current(&self, label: &str) {
        let mut inner = self.0.lock().expect("run state poisoned");
        inner.current_label = label.to_string();
    }

    pub fn record_skip(&self) {
        let mut inner = self.0.lock().expect("run state poisoned");
        inner.processed += 1;
        inner.skipped += 1;
    }

    pub fn record_outcome(&self, outcome: &RequestOutcome) {
        let mut inner = self.0.lock().expect("run state poisoned");
        inner.processed += 1;
        match outcome {
            RequestOutcome::Success { .. } => inner.succeeded += 1,
            RequestOutcome::EmptyZone => inner.empty_zones += 1,
            RequestOutcome::MinimalData { .. } => inner.minimal_data += 1,
            RequestOutcome::Failed { .. } => inner.failed += 1,
        }
    }

    pub fn push_log(&self, level: &str, message: impl Into<String>) {
        let mut inner = self.0.lock().expect("run state poisoned");
        inner.logs.push_back(LogEntry {
            time: Utc::now().format("%H:%M:%S").to_string(),
            level: level.to_string(),
            message: message.into(),
        });
        while inner.logs.len() > MAX_LOG_ENTRIES {
            inner.logs.pop_front();
        }
    }

    pub fn snapshot(&self) -> RunStatus {
        let inner = self.0.lock().expect("run state poisoned");
        let elapsed_seconds = inner.started_at.map(|started| {
            let end = if inner.is_running {
                Utc::now()
            } else {
                inner.finished_at.unwrap_or_else(Utc::now)
            };
            (end - started).num_seconds()
        });
        let progress_percent = if inner.total == 0 {
            0
        } else {
            (inner.processed * 100 / inner.total) as u32
        };
        let logs = inner
            .logs
            .iter()
            .rev()
            .take(STATUS_LOG_LINES)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        RunStatus {
            is_running: inner.is_running,
            run_id: inner.run_id.map(|id| id.to_string()),
            processed: inner.processed,
            total: inner.total,
            progress_percent,
            current_label: inner.current_label.clone(),
            succeeded: inner.succeeded,
            empty_zones: inner.empty_zones,
            minimal_data: inner.minimal_data,
            failed: inner.failed,
            skipped: inner.skipped,
            elapsed_seconds,
            logs,
        }
    }

    #[cfg(test)]
    fn log_len(&self) -> usize {
        self.0.lock().expect("run state poisoned").logs.len()
    }
}

/// Constructor-injected callback invoked after each combination completes.
pub trait ProgressObserver: Send + Sync {
    fn combination_finished(&self, combination: &RequestCombination, outcome: &RequestOutcome);
}

#[derive(Debug, Default)]
pub struct NoopProgressObserver;

impl ProgressObserver for NoopProgressObserver {
    fn combination_finished(&self, _combination: &RequestCombination, _outcome: &RequestOutcome) {}
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub empty_zones: usize,
    pub minimal_data: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Drives every generated combination strictly sequentially through the
/// session client and the table extractor, persisting artifacts and pacing
/// requests. There is deliberately no parallel fan-out: the session is shared
/// state and the target server expects a polite, browser-like client.
pub struct RunController<F: PageFetcher> {
    fetcher: F,
    store: ArtifactStore,
    state: RunStateHandle,
    cancel: CancelFlag,
    observer: Box<dyn ProgressObserver>,
}

impl RunController<SessionClient> {
    pub fn new(config: &RunConfig, state: RunStateHandle, cancel: CancelFlag) -> Result<Self> {
        let fetcher =
            SessionClient::new(&config.session).context("building session client")?;
        Ok(Self::with_fetcher(
            fetcher,
            ArtifactStore::new(config.layout()),
            state,
            cancel,
        ))
    }
}

impl<F: PageFetcher> RunController<F> {
    pub fn with_fetcher(
        fetcher: F,
        store: ArtifactStore,
        state: RunStateHandle,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            fetcher,
            store,
            state,
            cancel,
            observer: Box::new(NoopProgressObserver),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Processes the combinations in order. The caller must have claimed the
    /// run slot with [`RunStateHandle::try_begin`]; this method releases it.
    pub async fn run(&self, combinations: &[RequestCombination], delay: Duration) -> RunSummary {
        let total = combinations.len();
        let mut summary = RunSummary::default();

        for (index, combination) in combinations.iter().enumerate() {
            if self.cancel.is_requested() {
                warn!(processed = summary.processed, "stop requested, halting run");
                self.state.push_log("WARN", "stop requested, halting run");
                break;
            }

            if !validate(combination) {
                summary.skipped += 1;
                self.state.record_skip();
                continue;
            }

            let label = combination.label();
            self.state.set_current(&label);
            self.state
                .push_log("INFO", format!("[{}/{}] {}", index + 1, total, label));

            let outcome = self.process_one(combination).await;
            self.log_outcome(&label, &outcome);
            self.state.record_outcome(&outcome);
            match &outcome {
                RequestOutcome::Success { .. } => summary.succeeded += 1,
                RequestOutcome::EmptyZone => summary.empty_zones += 1,
                RequestOutcome::MinimalData { .. } => summary.minimal_data += 1,
                RequestOutcome::Failed { .. } => summary.failed += 1,
            }
            summary.processed += 1;
            self.observer.combination_finished(combination, &outcome);

            // Pacing applies after every processed combination, failures
            // included, to stay a well-behaved client of the shared server.
            tokio::time::sleep(delay).await;
        }

        self.state.finish();
        summary
    }

    async fn process_one(&self, combination: &RequestCombination) -> RequestOutcome {
        let html = match self.fetcher.fetch_page(combination).await {
            Ok(html) => html,
            Err(err) => {
                return RequestOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };

        match extract(&html) {
            Err(err) => RequestOutcome::Failed {
                reason: err.to_string(),
            },
            Ok(Extraction::Empty) => RequestOutcome::EmptyZone,
            Ok(Extraction::Minimal(table)) => {
                match self.store.write_raw_table(combination, &table).await {
                    Ok(_) => RequestOutcome::MinimalData {
                        rows: table.row_count(),
                    },
                    Err(err) => RequestOutcome::Failed {
                        reason: format!("persisting artifact: {err:#}"),
                    },
                }
            }
            Ok(Extraction::Populated(table)) => {
                match self.store.write_raw_table(combination, &table).await {
                    Ok(artifact) => RequestOutcome::Success {
                        rows: table.row_count(),
                        columns: table.column_count(),
                        artifact,
                    },
                    Err(err) => RequestOutcome::Failed {
                        reason: format!("persisting artifact: {err:#}"),
                    },
                }
            }
        }
    }

    fn log_outcome(&self, label: &str, outcome: &RequestOutcome) {
        match outcome {
            RequestOutcome::Success { rows, columns, .. } => {
                info!(label, rows, columns, "table extracted");
                self.state
                    .push_log("INFO", format!("{label}: {rows} rows x {columns} columns"));
            }
            RequestOutcome::EmptyZone => {
                info!(label, "empty zone (no activity for this slice)");
                self.state.push_log("INFO", format!("{label}: empty zone"));
            }
            RequestOutcome::MinimalData { rows } => {
                info!(label, rows, "minimal data, kept low-confidence");
                self.state
                    .push_log("WARN", format!("{label}: minimal data ({rows} rows)"));
            }
            RequestOutcome::Failed { reason } => {
                error!(label, %reason, "combination failed");
                self.state
                    .push_log("ERROR", format!("{label}: failed: {reason}"));
            }
        }
    }
}

/// Owns the background collection task: start/stop/status surface for the
/// dashboard. Status polling never blocks on network I/O.
pub struct Collector {
    config: RunConfig,
    state: RunStateHandle,
    cancel: CancelFlag,
}

impl Collector {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            state: RunStateHandle::default(),
            cancel: CancelFlag::default(),
        }
    }

    pub fn state(&self) -> RunStateHandle {
        self.state.clone()
    }

    pub fn layout(&self) -> OutputLayout {
        self.config.layout()
    }

    pub fn status(&self) -> RunStatus {
        self.state.snapshot()
    }

    /// Accepts the run and spawns the background task, or returns false when
    /// a run is already in progress.
    pub fn start(
        &self,
        strategy: CollectionStrategy,
        delay_override: Option<Duration>,
    ) -> Result<bool> {
        let combinations = combinations_for(strategy);
        if !self.state.try_begin(combinations.len()) {
            return Ok(false);
        }
        self.cancel.reset();

        let controller = match RunController::new(
            &self.config,
            self.state.clone(),
            self.cancel.clone(),
        ) {
            Ok(controller) => controller,
            Err(err) => {
                self.state.finish();
                return Err(err);
            }
        };

        let state = self.state.clone();
        let layout = self.config.layout();
        let delay = delay_override.unwrap_or(self.config.delay);
        tokio::spawn(async move {
            let summary = controller.run(&combinations, delay).await;
            state.push_log(
                "INFO",
                format!(
                    "collection finished: {} ok, {} empty, {} minimal, {} failed, {} skipped",
                    summary.succeeded,
                    summary.empty_zones,
                    summary.minimal_data,
                    summary.failed,
                    summary.skipped
                ),
            );

            match clean_all(&layout.raw_dir(), &layout.cleaned_dir()) {
                Ok(clean) => state.push_log(
                    "INFO",
                    format!(
                        "cleaning finished: {}/{} files, {} rows",
                        clean.cleaned,
                        clean.cleaned + clean.failed,
                        clean.total_rows
                    ),
                ),
                Err(err) => state.push_log("ERROR", format!("cleaning failed: {err:#}")),
            }
            match consolidate(&layout.cleaned_dir(), &layout.master_path()) {
                Ok(master) => state.push_log(
                    "INFO",
                    format!(
                        "master dataset written: {} rows from {} files",
                        master.rows, master.files
                    ),
                ),
                Err(err) => state.push_log("ERROR", format!("consolidation failed: {err:#}")),
            }
        });

        Ok(true)
    }

    pub fn request_stop(&self) {
        self.cancel.request();
        self.state.push_log("WARN", "stop requested");
    }
}

#[derive(Debug, Error)]
pub enum CleanError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanSummary {
    pub cleaned: usize,
    pub failed: usize,
    pub total_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationSummary {
    pub files: usize,
    pub rows: usize,
}

/// Cleans one raw artifact: drops the trailing total row (positional, not
/// content-matched), zero-pads the Finess identifier, substitutes the privacy
/// sentinel, and coerces the count columns to integers (unparseable => 0).
pub fn clean_file(input: &Path, output: &Path) -> Result<usize, CleanError> {
    let mut reader = csv::Reader::from_path(input)?;
    let headers = reader.headers()?.clone();
    let mut records = reader
        .records()
        .collect::<Result<Vec<csv::StringRecord>, _>>()?;
    // The server always appends a rollup row; it is not an observation.
    records.pop();

    let finess_index = headers.iter().position(|h| h == FINESS_COLUMN);
    let count_indexes: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| COUNT_COLUMNS.contains(h))
        .map(|(i, _)| i)
        .collect();

    let mut writer = csv::Writer::from_path(output)?;
    writer.write_record(&headers)?;
    for record in &records {
        let mut row: Vec<String> = record.iter().map(str::to_string).collect();
        if let Some(index) = finess_index {
            if let Some(value) = row.get_mut(index) {
                let padded = format!("{:0>width$}", value.trim(), width = FINESS_WIDTH);
                *value = padded;
            }
        }
        for &index in &count_indexes {
            if let Some(value) = row.get_mut(index) {
                let raw = if value.trim() == SMALL_COUNT_SENTINEL {
                    SMALL_COUNT_VALUE.to_string()
                } else {
                    value.trim().to_string()
                };
                *value = raw.parse::<i64>().unwrap_or(0).to_string();
            }
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// Cleans every raw CSV artifact under `raw_root` into `cleaned_dir`. One bad
/// file is logged and counted, never aborts the batch.
pub fn clean_all(raw_root: &Path, cleaned_dir: &Path) -> Result<CleanSummary> {
    std::fs::create_dir_all(cleaned_dir)
        .with_context(|| format!("creating {}", cleaned_dir.display()))?;

    let files = collect_csv_files(raw_root)?;
    if files.is_empty() {
        warn!(dir = %raw_root.display(), "no raw artifacts to clean");
        return Ok(CleanSummary::default());
    }

    let mut summary = CleanSummary::default();
    for input in files {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let output = cleaned_dir.join(format!("{CLEANED_PREFIX}{name}"));
        match clean_file(&input, &output) {
            Ok(rows) => {
                info!(file = %name, rows, "cleaned artifact");
                summary.cleaned += 1;
                summary.total_rows += rows;
            }
            Err(err) => {
                error!(file = %input.display(), %err, "cleaning failed");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Merges every cleaned artifact into one master CSV, preserving the column
/// union and tagging each row with its source file. Fails only when there is
/// nothing at all to consolidate.
pub fn consolidate(cleaned_dir: &Path, master_path: &Path) -> Result<ConsolidationSummary> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(cleaned_dir)
        .with_context(|| format!("reading {}", cleaned_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "csv")
                && path
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().starts_with(CLEANED_PREFIX))
        })
        .collect();
    files.sort();

    if files.is_empty() {
        bail!("no cleaned artifacts in {}", cleaned_dir.display());
    }

    // Load readable files up front; a malformed one is logged and skipped
    // without halting the rest.
    let mut loaded: Vec<(String, Vec<String>, Vec<csv::StringRecord>)> = Vec::new();
    for path in &files {
        match read_cleaned_file(path) {
            Ok((headers, records)) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                loaded.push((name, headers, records));
            }
            Err(err) => {
                error!(file = %path.display(), %err, "skipping malformed cleaned artifact");
            }
        }
    }
    if loaded.is_empty() {
        bail!("no readable cleaned artifacts in {}", cleaned_dir.display());
    }

    let mut union_headers: Vec<String> = Vec::new();
    for (_, headers, _) in &loaded {
        for header in headers {
            if !union_headers.contains(header) {
                union_headers.push(header.clone());
            }
        }
    }

    if let Some(parent) = master_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(master_path)
        .with_context(|| format!("creating {}", master_path.display()))?;
    let mut out_headers = union_headers.clone();
    out_headers.push(PROVENANCE_COLUMN.to_string());
    writer.write_record(&out_headers).context("writing master header")?;

    let mut rows = 0usize;
    for (name, headers, records) in &loaded {
        let indexes: Vec<Option<usize>> = union_headers
            .iter()
            .map(|column| headers.iter().position(|h| h == column))
            .collect();
        for record in records {
            let mut row: Vec<String> = indexes
                .iter()
                .map(|index| {
                    index
                        .and_then(|i| record.get(i))
                        .unwrap_or_default()
                        .to_string()
                })
                .collect();
            row.push(name.clone());
            writer.write_record(&row).context("writing master row")?;
            rows += 1;
        }
    }
    writer.flush().context("flushing master dataset")?;

    Ok(ConsolidationSummary {
        files: loaded.len(),
        rows,
    })
}

fn read_cleaned_file(path: &Path) -> Result<(Vec<String>, Vec<csv::StringRecord>), CleanError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader
        .headers()?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let records = reader
        .records()
        .collect::<Result<Vec<csv::StringRecord>, _>>()?;
    Ok((headers, records))
}

fn collect_csv_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "csv") {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use carto_core::{
        EstablishmentCategory, GeoScope, Priority, RequestCombination, NATIONAL_GEO_CODE,
    };
    use carto_storage::{FetchError, PageFetcher};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    const POPULATED_PAGE: &str = "<html><body><table class=\"tableau\">\
        <tr><th>Finess</th><th>Raison sociale</th><th>Nombre de séjours/séances total</th>\
        <th>Nombre de séances</th><th>Part</th></tr>\
        <tr><td>123</td><td>CH A</td><td>10</td><td>1</td><td>x</td></tr>\
        <tr><td>456</td><td>CH B</td><td>1 à 10</td><td>2</td><td>y</td></tr>\
        <tr><td>789</td><td>CH C</td><td>30</td><td>3</td><td>z</td></tr>\
        <tr><td>Total</td><td></td><td>45</td><td>6</td><td></td></tr>\
        </table></body></html>";

    struct ScriptedFetcher {
        calls: AtomicUsize,
        fail_years: Vec<u16>,
    }

    impl ScriptedFetcher {
        fn new(fail_years: Vec<u16>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_years,
            }
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(
            &self,
            combination: &RequestCombination,
        ) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_years.contains(&combination.year()) {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    url: "https://www.scansante.fr/submit".to_string(),
                });
            }
            Ok(POPULATED_PAGE.to_string())
        }
    }

    fn national(year: u16) -> RequestCombination {
        RequestCombination::all_stays(
            year,
            GeoScope::Nation,
            NATIONAL_GEO_CODE,
            EstablishmentCategory::Public,
            Priority::Critical,
        )
    }

    fn controller_with(
        fetcher: ScriptedFetcher,
        root: &Path,
    ) -> (RunController<ScriptedFetcher>, RunStateHandle, CancelFlag) {
        let state = RunStateHandle::default();
        let cancel = CancelFlag::default();
        let controller = RunController::with_fetcher(
            fetcher,
            ArtifactStore::new(OutputLayout::new(root)),
            state.clone(),
            cancel.clone(),
        );
        (controller, state, cancel)
    }

    #[tokio::test]
    async fn cancellation_before_first_combination_processes_nothing() {
        let dir = tempdir().expect("tempdir");
        let (controller, state, cancel) = controller_with(ScriptedFetcher::new(vec![]), dir.path());
        assert!(state.try_begin(1));
        cancel.request();

        let summary = controller.run(&[national(2024)], Duration::ZERO).await;
        assert_eq!(summary.processed, 0);
        assert_eq!(controller.fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(!state.snapshot().is_running);
    }

    #[tokio::test]
    async fn failure_and_success_are_counted_separately() {
        let dir = tempdir().expect("tempdir");
        let (controller, state, _cancel) =
            controller_with(ScriptedFetcher::new(vec![2023]), dir.path());
        let combinations = vec![national(2024), national(2023)];
        assert!(state.try_begin(combinations.len()));

        let summary = controller.run(&combinations, Duration::ZERO).await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed, 2);

        let artifacts = collect_csv_files(dir.path()).expect("walk artifacts");
        assert_eq!(artifacts.len(), 1);

        let status = state.snapshot();
        assert_eq!(status.succeeded, 1);
        assert_eq!(status.failed, 1);
        assert_eq!(status.progress_percent, 100);
    }

    #[tokio::test]
    async fn rejected_combinations_are_skipped_without_requests() {
        let dir = tempdir().expect("tempdir");
        let (controller, state, _cancel) = controller_with(ScriptedFetcher::new(vec![]), dir.path());
        let overseas_private = RequestCombination::all_stays(
            2024,
            GeoScope::Department,
            "971",
            EstablishmentCategory::Private,
            Priority::Medium,
        );
        assert!(state.try_begin(1));

        let summary = controller.run(&[overseas_private], Duration::ZERO).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(controller.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn observer_sees_every_processed_combination() {
        struct CountingObserver(Arc<AtomicUsize>);
        impl ProgressObserver for CountingObserver {
            fn combination_finished(
                &self,
                _combination: &RequestCombination,
                _outcome: &RequestOutcome,
            ) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempdir().expect("tempdir");
        let seen = Arc::new(AtomicUsize::new(0));
        let (controller, state, _cancel) =
            controller_with(ScriptedFetcher::new(vec![2023]), dir.path());
        let controller = controller.with_observer(Box::new(CountingObserver(seen.clone())));
        let combinations = vec![national(2024), national(2023)];
        assert!(state.try_begin(combinations.len()));

        controller.run(&combinations, Duration::ZERO).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn run_slot_cannot_be_claimed_twice() {
        let state = RunStateHandle::default();
        assert!(state.try_begin(10));
        assert!(!state.try_begin(10));
        state.finish();
        assert!(state.try_begin(5));
    }

    #[test]
    fn log_buffer_evicts_beyond_the_cap() {
        let state = RunStateHandle::default();
        for i in 0..150 {
            state.push_log("INFO", format!("entry {i}"));
        }
        assert_eq!(state.log_len(), MAX_LOG_ENTRIES);
        let status = state.snapshot();
        assert_eq!(status.logs.len(), STATUS_LOG_LINES);
        assert_eq!(status.logs.last().unwrap().message, "entry 149");
    }

    fn write_csv(path: &Path, lines: &[&str]) {
        std::fs::write(path, lines.join("\n")).expect("write fixture");
    }

    #[test]
    fn cleaning_drops_the_total_row_and_normalizes_values() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("scan_2024_fe_99_tous.csv");
        let output = dir.path().join("cleaned_scan_2024_fe_99_tous.csv");
        write_csv(
            &input,
            &[
                "Finess,Raison sociale,Nombre de séjours/séances total,Nombre de séances",
                "123,CH A,1 à 10,12",
                "456789123,CH B,n/a,3",
                "Total,,999,15",
            ],
        );

        let rows = clean_file(&input, &output).expect("clean");
        assert_eq!(rows, 2);

        let text = std::fs::read_to_string(&output).expect("read cleaned");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "000000123,CH A,5,12");
        // Unparseable counts coerce to zero; full-width Finess is untouched.
        assert_eq!(lines[2], "456789123,CH B,0,3");
    }

    #[test]
    fn clean_all_isolates_per_file_failures() {
        let dir = tempdir().expect("tempdir");
        let raw = dir.path().join("raw/national/public/tous_sejours");
        std::fs::create_dir_all(&raw).expect("mkdirs");
        write_csv(
            &raw.join("good.csv"),
            &["Finess,Nombre de séances", "1,2", "Total,2"],
        );
        // Ragged row: the strict CSV reader reports it as an error.
        write_csv(&raw.join("bad.csv"), &["a,b", "1,2,3,4"]);

        let cleaned = dir.path().join("cleaned");
        let summary = clean_all(&dir.path().join("raw"), &cleaned).expect("clean all");
        assert_eq!(summary.cleaned, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_rows, 1);
    }

    #[test]
    fn consolidation_unions_rows_and_tags_provenance() {
        let dir = tempdir().expect("tempdir");
        let cleaned = dir.path().join("cleaned");
        std::fs::create_dir_all(&cleaned).expect("mkdirs");

        let mut ten: Vec<String> = vec!["Finess,Nombre de séances".to_string()];
        ten.extend((0..10).map(|i| format!("{i},{i}")));
        std::fs::write(cleaned.join("cleaned_a.csv"), ten.join("\n")).expect("write");
        write_csv(&cleaned.join("cleaned_b.csv"), &["Finess,Nombre de séances"]);
        let mut five: Vec<String> = vec!["Finess,Part".to_string()];
        five.extend((0..5).map(|i| format!("{i},{i}")));
        std::fs::write(cleaned.join("cleaned_c.csv"), five.join("\n")).expect("write");

        let master = dir.path().join("master.csv");
        let summary = consolidate(&cleaned, &master).expect("consolidate");
        assert_eq!(summary.files, 3);
        assert_eq!(summary.rows, 15);

        let text = std::fs::read_to_string(&master).expect("read master");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Finess,Nombre de séances,Part,fichier_source");
        assert_eq!(lines.len(), 16);
        assert!(lines[1].ends_with(",cleaned_a.csv"));
        assert!(lines[15].ends_with(",cleaned_c.csv"));
    }

    #[test]
    fn consolidating_nothing_is_a_hard_error() {
        let dir = tempdir().expect("tempdir");
        let cleaned = dir.path().join("cleaned");
        std::fs::create_dir_all(&cleaned).expect("mkdirs");
        let err = consolidate(&cleaned, &dir.path().join("master.csv")).unwrap_err();
        assert!(err.to_string().contains("no cleaned artifacts"));
    }

    #[test]
    fn config_defaults_are_polite() {
        let config = RunConfig::default();
        assert_eq!(config.delay, Duration::from_secs(2));
        assert_eq!(config.output_dir, PathBuf::from("./donnees_mco"));
    }
}
