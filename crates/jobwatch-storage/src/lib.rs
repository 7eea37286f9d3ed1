//! Append-only history ledger, raw page archive and HTTP fetch utilities for jobwatch.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use jobwatch_core::{history_key, HistoryEntry, Posting, Source, HISTORY_HEADER};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-storage";

/// Header written by earlier deployments of the digest bot. Same columns, same order.
const LEGACY_HISTORY_HEADER: [&str; 6] = [
    "fecha_extraccion",
    "portal",
    "titulo",
    "empresa",
    "ubicacion",
    "link",
];

const URL_COLUMN: usize = 5;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("history file {path} has unexpected header {found:?}")]
    HeaderMismatch { path: PathBuf, found: Vec<String> },
    #[error("history file {path} has a malformed row: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("history file {path} row {line}: {reason}")]
    InvalidField {
        path: PathBuf,
        line: u64,
        reason: String,
    },
    #[error("encoding history rows: {0}")]
    Encode(String),
}

/// Lower-cased url set built from one full read of the ledger.
#[derive(Debug, Clone, Default)]
pub struct HistoryIndex {
    urls: HashSet<String>,
    rows: usize,
}

impl HistoryIndex {
    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(&history_key(url))
    }

    pub fn insert(&mut self, url: &str) -> bool {
        self.rows += 1;
        self.urls.insert(history_key(url))
    }

    /// Number of rows read, duplicates included.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn distinct_urls(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Whole file contents, or `None` when the ledger has not been created yet.
    async fn read_all(&self) -> Result<Option<Vec<u8>>, HistoryError> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_err(err)),
        }
    }

    fn reader<'a>(&self, bytes: &'a [u8]) -> Result<csv::Reader<&'a [u8]>, HistoryError> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(bytes);
        let headers = reader.headers().map_err(|source| HistoryError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        let found: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
        let known = [HISTORY_HEADER, LEGACY_HISTORY_HEADER]
            .iter()
            .any(|expected| found.iter().map(String::as_str).eq(expected.iter().copied()));
        if !known {
            return Err(HistoryError::HeaderMismatch {
                path: self.path.clone(),
                found,
            });
        }
        Ok(reader)
    }

    /// Read the full ledger into a url index. Any unreadable row fails the whole read.
    pub async fn load_index(&self) -> Result<HistoryIndex, HistoryError> {
        let mut index = HistoryIndex::default();
        let Some(bytes) = self.read_all().await? else {
            return Ok(index);
        };
        let mut reader = self.reader(&bytes)?;
        for record in reader.records() {
            let record = record.map_err(|source| HistoryError::Malformed {
                path: self.path.clone(),
                source,
            })?;
            let url = record.get(URL_COLUMN).unwrap_or_default();
            index.insert(url);
        }
        debug!(
            path = %self.path.display(),
            rows = index.rows(),
            distinct = index.distinct_urls(),
            "loaded history index"
        );
        Ok(index)
    }

    pub async fn exists(&self, url: &str) -> Result<bool, HistoryError> {
        Ok(self.load_index().await?.contains(url))
    }

    pub async fn entries(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let Some(bytes) = self.read_all().await? else {
            return Ok(Vec::new());
        };
        let mut reader = self.reader(&bytes)?;
        let mut out = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|source| HistoryError::Malformed {
                path: self.path.clone(),
                source,
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let invalid = |reason: String| HistoryError::InvalidField {
                path: self.path.clone(),
                line,
                reason,
            };
            let field = |i: usize| record.get(i).unwrap_or_default().to_string();

            let extraction_time = parse_extraction_time(&field(0))
                .ok_or_else(|| invalid(format!("bad extraction_time `{}`", field(0))))?;
            let source = field(1)
                .parse::<Source>()
                .map_err(|e| invalid(e.to_string()))?;
            out.push(HistoryEntry {
                extraction_time,
                source,
                title: field(2),
                company: field(3),
                location: field(4),
                url: field(5),
            });
        }
        Ok(out)
    }

    /// Append one row per posting in the given order. Creates the file with its
    /// header on first use; existing bytes are never rewritten.
    pub async fn append(
        &self,
        postings: &[Posting],
        extraction_time: DateTime<Utc>,
    ) -> Result<usize, HistoryError> {
        if postings.is_empty() {
            return Ok(0);
        }

        // Same emptiness rule as the read path: a missing or blank ledger starts
        // over with a header, replacing the blank bytes.
        let fresh = self.read_all().await?.is_none();

        let mut buf = Vec::new();
        if !fresh && !self.ends_with_newline().await? {
            buf.push(b'\n');
        }
        buf.extend(encode_rows(postings, extraction_time, fresh)?);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| self.io_err(e))?;
        }
        let mut options = fs::OpenOptions::new();
        options.create(true);
        if fresh {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let mut file = options
            .open(&self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(&buf).await.map_err(|e| self.io_err(e))?;
        file.flush().await.map_err(|e| self.io_err(e))?;
        file.sync_data().await.map_err(|e| self.io_err(e))?;

        debug!(path = %self.path.display(), rows = postings.len(), "appended history rows");
        Ok(postings.len())
    }

    async fn ends_with_newline(&self) -> Result<bool, HistoryError> {
        let mut file = fs::File::open(&self.path).await.map_err(|e| self.io_err(e))?;
        file.seek(SeekFrom::End(-1)).await.map_err(|e| self.io_err(e))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await.map_err(|e| self.io_err(e))?;
        Ok(last[0] == b'\n')
    }
}

fn encode_rows(
    postings: &[Posting],
    extraction_time: DateTime<Utc>,
    with_header: bool,
) -> Result<Vec<u8>, HistoryError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    let encode = |e: csv::Error| HistoryError::Encode(e.to_string());
    if with_header {
        writer.write_record(HISTORY_HEADER).map_err(encode)?;
    }
    let stamp = extraction_time.to_rfc3339();
    for p in postings {
        writer
            .write_record([
                stamp.as_str(),
                p.source.display_name(),
                p.title.as_str(),
                p.company.as_str(),
                p.location.as_str(),
                p.url.as_str(),
            ])
            .map_err(encode)?;
    }
    writer
        .into_inner()
        .map_err(|e| HistoryError::Encode(e.to_string()))
}

/// RFC 3339, or the naive ISO form older ledgers were written with (read as UTC).
fn parse_extraction_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Content-addressed archive of fetched listing pages, kept for diagnosing parser drift.
#[derive(Debug, Clone)]
pub struct RawPageArchive {
    root: PathBuf,
}

impl RawPageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn page_path(&self, fetched_at: DateTime<Utc>, source: Source, hash: &str, ext: &str) -> PathBuf {
        let ext = match ext.trim_start_matches('.').trim() {
            "" => "bin",
            other => other,
        };
        self.root
            .join(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source.as_str())
            .join(format!("{hash}.{ext}"))
    }

    /// Write the page once under its hash; an identical page already on disk is left alone.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        source: Source,
        ext: &str,
        bytes: &[u8],
    ) -> anyhow::Result<PathBuf> {
        let hash = Self::sha256_hex(bytes);
        let path = self.page_path(fetched_at, source, &hash, ext);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking archive path {}", path.display()))?
        {
            return Ok(path);
        }

        let temp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp, bytes)
            .await
            .with_context(|| format!("writing temp page {}", temp.display()))?;
        if let Err(err) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err).with_context(|| format!("renaming {} -> {}", temp.display(), path.display()));
        }
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 6,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

/// Shared HTTP client with global and per-source concurrency limits and
/// exponential backoff on retryable failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<Source, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(FetchError::Client)?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: Source) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source: Source,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", %run_id, source = %source, url);
        self.fetch_with_retries(url, headers).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let retry_allowed = attempt < self.backoff.max_retries;
            match self.client.get(url).headers(headers.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }
                    if !(retry_allowed && classify_status(status) == RetryDisposition::Retryable) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    warn!(status = status.as_u16(), attempt, "retryable http status");
                }
                Err(err) => {
                    if !(retry_allowed && classify_reqwest_error(&err) == RetryDisposition::Retryable) {
                        return Err(FetchError::Request(err));
                    }
                    warn!(error = %err, attempt, "retryable request error");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
