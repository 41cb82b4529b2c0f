//! Session-stateful HTTP client and artifact storage for the MCO collector.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use carto_core::{RawTable, RequestCombination};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const CRATE_NAME: &str = "carto-storage";

pub const BOOTSTRAP_PATH: &str = "/applications/cartographie-activite-MCO";
pub const SUBMIT_PATH: &str = "/applications/cartographie-activite-MCO/submit";

const DEFAULT_BASE_URL: &str = "https://www.scansante.fr";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "fr-FR,fr;q=0.8,en-US;q=0.5,en;q=0.3";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub accept_language: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("CARTO_BASE_URL").unwrap_or(defaults.base_url),
            timeout: std::env::var("CARTO_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("CARTO_USER_AGENT").unwrap_or(defaults.user_agent),
            accept_language: defaults.accept_language,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Seam between the run controller and the network, so orchestration can be
/// exercised against canned pages.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, combination: &RequestCombination) -> Result<String, FetchError>;
}

/// One cookie-bearing session shared across the whole run. The target server
/// only answers the parameterized query once the bootstrap page has been
/// visited on the same session, so every fetch replays the two-step sequence.
#[derive(Debug)]
pub struct SessionClient {
    client: reqwest::Client,
    base_url: String,
}

impl SessionClient {
    pub fn new(config: &SessionConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language)
                .context("building Accept-Language header")?,
        );
        headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("{}{}", config.base_url, BOOTSTRAP_PATH))
                .context("building Referer header")?,
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    fn bootstrap_url(&self) -> String {
        format!("{}{}", self.base_url, BOOTSTRAP_PATH)
    }

    fn submit_url(&self) -> String {
        format!("{}{}", self.base_url, SUBMIT_PATH)
    }

    async fn checked_get(
        &self,
        url: &str,
        params: Option<&[(&'static str, String)]>,
    ) -> Result<reqwest::Response, FetchError> {
        let mut request = self.client.get(url);
        if let Some(params) = params {
            request = request.query(params);
        }
        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl PageFetcher for SessionClient {
    async fn fetch_page(&self, combination: &RequestCombination) -> Result<String, FetchError> {
        // Step 1: refresh session state; the submit endpoint returns stale or
        // default content without it.
        self.checked_get(&self.bootstrap_url(), None).await?;

        // Step 2: the parameterized query itself.
        let params = combination.query_params();
        let response = self.checked_get(&self.submit_url(), Some(&params)).await?;
        let body = response.text().await?;
        debug!(label = %combination.label(), bytes = body.len(), "submit response received");
        Ok(body)
    }
}

/// On-disk layout of everything the collector persists. The filesystem is the
/// persistence layer; there is no database.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn cleaned_dir(&self) -> PathBuf {
        self.root.join("cleaned")
    }

    pub fn master_path(&self) -> PathBuf {
        self.root.join("mco_master_cleaned.csv")
    }
}

/// Writes one CSV artifact per combination into the three-level
/// geography/establishment/aggregation tree, atomically via a temp file.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: OutputLayout,
}

impl ArtifactStore {
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn artifact_path(&self, combination: &RequestCombination) -> PathBuf {
        self.layout
            .raw_dir()
            .join(combination.storage_dir())
            .join(combination.file_name())
    }

    pub async fn write_raw_table(
        &self,
        combination: &RequestCombination,
        table: &RawTable,
    ) -> anyhow::Result<PathBuf> {
        let path = self.artifact_path(combination);
        let bytes = encode_csv(table).context("encoding raw table as CSV")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        let temp_path = path.with_extension("csv.tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        // Rename over any previous run's artifact: idempotent overwrite.
        fs::rename(&temp_path, &path).await.with_context(|| {
            format!(
                "renaming temp artifact {} -> {}",
                temp_path.display(),
                path.display()
            )
        })?;

        Ok(path)
    }
}

fn encode_csv(table: &RawTable) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.headers)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(std::io::Error::other(e.to_string())))
}
