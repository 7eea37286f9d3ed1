//! Pipeline orchestration: configuration, source fan-out, dedup and
//! history-gated notification.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use jobwatch_adapters::{
    adapter_for_source, load_fixture_page, AdapterContext, AdapterSettings, FetchedPage,
    ListingTarget, SourceAdapter,
};
use jobwatch_core::{
    format_digest, is_eligible, normalize_record, normalize_terms, Posting, Profile, RawRecord,
    Source,
};
use jobwatch_storage::{
    HistoryError, HistoryIndex, HistoryStore, HttpClientConfig, HttpFetcher, RawPageArchive,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source: Source,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub fixture_paths: Vec<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn live(source: Source) -> Self {
        Self {
            source,
            enabled: true,
            mode: SourceMode::Live,
            listing_urls: default_listing_urls(source),
            fixture_paths: Vec::new(),
        }
    }
}

/// Search pages queried when the registry does not name any.
pub fn default_listing_urls(source: Source) -> Vec<String> {
    let url = match source {
        Source::LinkedIn => {
            "https://www.linkedin.com/jobs/search/?f_TPR=r86400&keywords=data&location=Spain"
        }
        Source::InfoJobs => "https://api.infojobs.net/api/7/offer?maxResults=20&maxDaysOld=1",
        Source::Indeed => "https://es.indeed.com/jobs?q=data&fromage=1&l=Espa%C3%B1a",
    };
    vec![url.to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self {
            sources: Source::ALL.into_iter().map(SourceConfig::live).collect(),
        }
    }
}

impl SourceRegistry {
    /// Load the YAML registry. A missing file yields the built-in defaults;
    /// relative fixture paths resolve against the registry's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "source registry not found; using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let mut registry: SourceRegistry =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for source in &mut registry.sources {
            if source.mode == SourceMode::Live && source.listing_urls.is_empty() {
                source.listing_urls = default_listing_urls(source.source);
            }
            for fixture in &mut source.fixture_paths {
                if fixture.is_relative() {
                    *fixture = base.join(&*fixture);
                }
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// One run per process, triggered externally.
    Cron,
    /// Long-running; a run per on-demand request.
    Bot,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cron" | "batch" | "once" => Ok(RunMode::Cron),
            "bot" | "interactive" => Ok(RunMode::Bot),
            other => bail!("unknown run mode `{other}` (expected `cron` or `bot`)"),
        }
    }
}

/// Credential wrapper that keeps its value out of `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct JobwatchConfig {
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub include_locations: Vec<String>,
    pub remote_allowed: bool,
    pub hours_back: i64,
    pub run_mode: RunMode,
    pub history_file: PathBuf,
    pub sources_file: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub telegram_bot_token: Option<Secret>,
    pub telegram_user_id: Option<i64>,
    pub infojobs_auth: Option<Secret>,
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got `{other}`"),
    }
}

impl JobwatchConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let list = |key: &str| normalize_terms(var(key).unwrap_or_default().split(','));

        let remote_allowed = match var("REMOTE_ALLOWED") {
            Some(v) => parse_bool(&v).context("parsing REMOTE_ALLOWED")?,
            None => true,
        };
        let hours_back = match var("HOURS_BACK") {
            Some(v) => v
                .parse::<i64>()
                .with_context(|| format!("parsing HOURS_BACK=`{v}`"))?,
            None => 24,
        };
        if hours_back < 0 {
            bail!("HOURS_BACK must not be negative (got {hours_back})");
        }
        let run_mode = match var("RUN_MODE") {
            Some(v) => v.parse::<RunMode>().context("parsing RUN_MODE")?,
            None => RunMode::Cron,
        };
        let http_timeout_secs = match var("JOBWATCH_HTTP_TIMEOUT_SECS") {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("parsing JOBWATCH_HTTP_TIMEOUT_SECS=`{v}`"))?,
            None => 20,
        };
        if http_timeout_secs == 0 {
            bail!("JOBWATCH_HTTP_TIMEOUT_SECS must be at least 1");
        }
        let telegram_user_id = match var("TELEGRAM_USER_ID") {
            Some(v) => Some(
                v.parse::<i64>()
                    .with_context(|| format!("parsing TELEGRAM_USER_ID=`{v}`"))?,
            ),
            None => None,
        };

        Ok(Self {
            include_keywords: list("KEYWORDS_INCLUDE"),
            exclude_keywords: list("KEYWORDS_EXCLUDE"),
            include_locations: list("LOCATIONS_INCLUDE"),
            remote_allowed,
            hours_back,
            run_mode,
            history_file: var("JOBWATCH_HISTORY_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ofertas_historico.csv")),
            sources_file: var("JOBWATCH_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            artifacts_dir: var("JOBWATCH_ARTIFACTS_DIR").map(PathBuf::from),
            user_agent: var("JOBWATCH_USER_AGENT").unwrap_or_else(|| {
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string()
            }),
            http_timeout_secs,
            telegram_bot_token: var("TELEGRAM_BOT_TOKEN").map(Secret::new),
            telegram_user_id,
            infojobs_auth: var("INFOJOBS_AUTH").map(Secret::new),
        })
    }

    pub fn profile(&self) -> Profile {
        Profile::new(
            &self.include_keywords,
            &self.exclude_keywords,
            &self.include_locations,
            self.remote_allowed,
            Duration::hours(self.hours_back),
        )
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: StdDuration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source_id} fetch failed: {message}")]
pub struct SourceFetchError {
    pub source_id: Source,
    pub message: String,
}

impl SourceFetchError {
    pub fn new(source_id: Source, message: impl Into<String>) -> Self {
        Self {
            source_id,
            message: message.into(),
        }
    }
}

/// Produces the raw records of one source for one run.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawRecord>, SourceFetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notifier not configured: {0}")]
    NotConfigured(String),
    #[error("notification rejected: {0}")]
    Rejected(String),
    #[error("notification transport failed: {0}")]
    Transport(String),
}

/// Outbound channel for the run digest.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

/// Parse every page; the source fails only when no page could be parsed.
fn parse_pages(
    adapter: &dyn SourceAdapter,
    pages: &[FetchedPage],
) -> Result<Vec<RawRecord>, SourceFetchError> {
    let mut records = Vec::new();
    let mut last_error = None;
    let mut failed = 0usize;
    for page in pages {
        match adapter.parse_listing(page) {
            Ok(mut parsed) => records.append(&mut parsed),
            Err(err) => {
                warn!(source = %adapter.source(), url = %page.url, error = %err, "listing page did not parse");
                failed += 1;
                last_error = Some(err.to_string());
            }
        }
    }
    if failed > 0 && failed == pages.len() {
        return Err(SourceFetchError::new(
            adapter.source(),
            last_error.unwrap_or_default(),
        ));
    }
    Ok(records)
}

fn page_extension(content_type: &str) -> &'static str {
    if content_type.contains("json") {
        "json"
    } else if content_type.contains("html") {
        "html"
    } else {
        "bin"
    }
}

pub struct HttpSourceFetcher {
    adapter: Box<dyn SourceAdapter>,
    http: Arc<HttpFetcher>,
    targets: Vec<ListingTarget>,
    archive: Option<RawPageArchive>,
}

impl HttpSourceFetcher {
    pub fn new(
        adapter: Box<dyn SourceAdapter>,
        http: Arc<HttpFetcher>,
        listing_urls: &[String],
        archive: Option<RawPageArchive>,
    ) -> Self {
        Self {
            adapter,
            http,
            targets: listing_urls
                .iter()
                .map(|url| ListingTarget { url: url.clone() })
                .collect(),
            archive,
        }
    }
}

#[async_trait]
impl Fetcher for HttpSourceFetcher {
    fn source(&self) -> Source {
        self.adapter.source()
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawRecord>, SourceFetchError> {
        let pages = self
            .adapter
            .fetch_listing(&self.http, ctx, &self.targets)
            .await
            .map_err(|e| SourceFetchError::new(self.source(), e.to_string()))?;

        if let Some(archive) = &self.archive {
            for page in &pages {
                let ext = page_extension(&page.content_type);
                if let Err(err) = archive.store(ctx.fetched_at, page.source, ext, &page.body).await {
                    warn!(source = %page.source, url = %page.url, error = %err, "could not archive listing page");
                }
            }
        }
        parse_pages(self.adapter.as_ref(), &pages)
    }
}

/// Replays captured listing pages from disk instead of the network.
pub struct FixtureSourceFetcher {
    adapter: Box<dyn SourceAdapter>,
    base_url: String,
    paths: Vec<PathBuf>,
}

impl FixtureSourceFetcher {
    pub fn new(adapter: Box<dyn SourceAdapter>, base_url: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self {
            adapter,
            base_url: base_url.into(),
            paths,
        }
    }
}

#[async_trait]
impl Fetcher for FixtureSourceFetcher {
    fn source(&self) -> Source {
        self.adapter.source()
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawRecord>, SourceFetchError> {
        let pages = self
            .paths
            .iter()
            .map(|path| load_fixture_page(path, self.source(), &self.base_url, ctx.fetched_at))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| SourceFetchError::new(self.source(), format!("{e:#}")))?;
        parse_pages(self.adapter.as_ref(), &pages)
    }
}

/// Instantiate one fetcher per enabled registry entry.
pub fn build_fetchers(
    config: &JobwatchConfig,
    registry: &SourceRegistry,
) -> Result<Vec<Box<dyn Fetcher>>> {
    let http = Arc::new(HttpFetcher::new(config.http_client_config()).context("building http client")?);
    let archive = config.artifacts_dir.clone().map(RawPageArchive::new);
    let settings = AdapterSettings {
        authorization: config.infojobs_auth.as_ref().map(|s| s.expose().to_string()),
    };

    let mut fetchers: Vec<Box<dyn Fetcher>> = Vec::new();
    for entry in registry.enabled() {
        let adapter = adapter_for_source(entry.source, &settings);
        match entry.mode {
            SourceMode::Live => {
                if entry.source == Source::InfoJobs && settings.authorization.is_none() {
                    warn!(source = %entry.source, "INFOJOBS_AUTH not set; skipping source");
                    continue;
                }
                fetchers.push(Box::new(HttpSourceFetcher::new(
                    adapter,
                    http.clone(),
                    &entry.listing_urls,
                    archive.clone(),
                )));
            }
            SourceMode::Fixture => {
                let base_url = entry
                    .listing_urls
                    .first()
                    .cloned()
                    .or_else(|| default_listing_urls(entry.source).into_iter().next())
                    .unwrap_or_default();
                fetchers.push(Box::new(FixtureSourceFetcher::new(
                    adapter,
                    base_url,
                    entry.fixture_paths.clone(),
                )));
            }
        }
    }
    Ok(fetchers)
}

/// Result of gating eligible postings against the history ledger.
#[derive(Debug, Clone, Default)]
pub struct HistoryGate {
    pub fresh: Vec<Posting>,
    pub already_notified: usize,
    pub repeated_urls: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DedupEngine;

impl DedupEngine {
    pub fn new() -> Self {
        Self
    }

    /// Keep the first posting per `(title, company, url)` identity, in arrival order.
    pub fn dedup_intra_run(&self, postings: Vec<Posting>) -> (Vec<Posting>, usize) {
        let mut seen = HashSet::with_capacity(postings.len());
        let mut kept = Vec::with_capacity(postings.len());
        let mut dropped = 0usize;
        for posting in postings {
            if seen.insert(posting.identity_key()) {
                kept.push(posting);
            } else {
                debug!(source = %posting.source, url = %posting.url, "dropping duplicate within run");
                dropped += 1;
            }
        }
        (kept, dropped)
    }

    /// Drop postings whose url is already in the history, and later postings of
    /// this run that share a url with an earlier survivor.
    pub fn gate_on_history(&self, postings: Vec<Posting>, history: &HistoryIndex) -> HistoryGate {
        let mut gate = HistoryGate::default();
        let mut run_urls = HashSet::new();
        for posting in postings {
            if history.contains(&posting.url) {
                debug!(source = %posting.source, url = %posting.url, "already notified");
                gate.already_notified += 1;
            } else if !run_urls.insert(posting.history_key()) {
                gate.repeated_urls += 1;
            } else {
                gate.fresh.push(posting);
            }
        }
        gate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Fetching,
    Normalizing,
    FilteringIntraRunDuplicates,
    ApplyingEligibility,
    CheckingHistory,
    Persisting,
    Formatting,
    Dispatched,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Fetching => "fetching",
            PipelineState::Normalizing => "normalizing",
            PipelineState::FilteringIntraRunDuplicates => "filtering_intra_run_duplicates",
            PipelineState::ApplyingEligibility => "applying_eligibility",
            PipelineState::CheckingHistory => "checking_history",
            PipelineState::Persisting => "persisting",
            PipelineState::Formatting => "formatting",
            PipelineState::Dispatched => "dispatched",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub source: Source,
    pub records: usize,
    pub postings: usize,
    pub rejected: usize,
    pub error: Option<String>,
}

impl SourceOutcome {
    fn new(source: Source) -> Self {
        Self {
            source,
            records: 0,
            postings: 0,
            rejected: 0,
            error: None,
        }
    }
}

/// End-of-run summary aggregated from every step.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: PipelineState,
    pub sources: Vec<SourceOutcome>,
    pub intra_run_duplicates: usize,
    pub ineligible: usize,
    pub already_notified: usize,
    pub repeated_urls: usize,
    pub persisted: usize,
    pub notified: usize,
    pub postings: Vec<Posting>,
    pub notify_error: Option<String>,
    pub failure: Option<String>,
}

impl RunReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            state: PipelineState::Idle,
            sources: Vec::new(),
            intra_run_duplicates: 0,
            ineligible: 0,
            already_notified: 0,
            repeated_urls: 0,
            persisted: 0,
            notified: 0,
            postings: Vec::new(),
            notify_error: None,
            failure: None,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug!(from = %self.state, to = %next, "pipeline transition");
        self.state = next;
    }

    fn fail(&mut self, err: PipelineError) -> PipelineError {
        error!(run_id = %self.run_id, during = %self.state, error = %err, "pipeline run failed");
        self.failure = Some(err.to_string());
        self.state = PipelineState::Failed;
        self.finished_at = Some(Utc::now());
        err
    }

    pub fn fetched_records(&self) -> usize {
        self.sources.iter().map(|s| s.records).sum()
    }

    pub fn failed_sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|s| s.error.is_some())
            .map(|s| s.source)
            .collect()
    }

    pub fn summary_line(&self) -> String {
        format!(
            "run {} {}: records={} duplicates={} ineligible={} already_notified={} new={} failed_sources={}",
            self.run_id,
            self.state,
            self.fetched_records(),
            self.intra_run_duplicates,
            self.ineligible,
            self.already_notified,
            self.persisted,
            self.failed_sources().len()
        )
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("history unavailable: {0}")]
    HistoryUnavailable(#[source] HistoryError),
    #[error("history write failed: {0}")]
    HistoryWrite(#[source] HistoryError),
}

pub struct Pipeline {
    profile: Profile,
    history: HistoryStore,
    fetchers: Vec<Box<dyn Fetcher>>,
    dedup: DedupEngine,
    persist: bool,
}

impl Pipeline {
    pub fn new(profile: Profile, history: HistoryStore, fetchers: Vec<Box<dyn Fetcher>>) -> Self {
        Self {
            profile,
            history,
            fetchers,
            dedup: DedupEngine::new(),
            persist: true,
        }
    }

    /// Read the history but never append to it.
    pub fn dry_run(mut self) -> Self {
        self.persist = false;
        self
    }

    pub fn from_config(config: &JobwatchConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file)?;
        let fetchers = build_fetchers(config, &registry)?;
        if fetchers.is_empty() {
            warn!("no sources enabled; runs will only report the empty digest");
        }
        Ok(Self::new(
            config.profile(),
            HistoryStore::new(config.history_file.clone()),
            fetchers,
        ))
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn sources(&self) -> Vec<Source> {
        self.fetchers.iter().map(|f| f.source()).collect()
    }

    pub async fn run_once(&self, notifier: &dyn Notifier) -> Result<RunReport, PipelineError> {
        self.run_at(notifier, Utc::now()).await
    }

    /// Execute one full pass with `now` as extraction time and recency reference.
    pub async fn run_at(
        &self,
        notifier: &dyn Notifier,
        now: DateTime<Utc>,
    ) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.execute(run_id, notifier, now).instrument(span).await
    }

    async fn fetch_all(
        &self,
        ctx: &AdapterContext,
    ) -> Vec<(Source, Result<Vec<RawRecord>, SourceFetchError>)> {
        let pending = self.fetchers.iter().map(|fetcher| {
            let source = fetcher.source();
            let span = info_span!("source_fetch", source = %source);
            async move { (source, fetcher.fetch(ctx).await) }.instrument(span)
        });
        join_all(pending).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        notifier: &dyn Notifier,
        now: DateTime<Utc>,
    ) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new(run_id, now);
        let ctx = AdapterContext {
            run_id,
            fetched_at: now,
        };

        report.advance(PipelineState::Fetching);
        let fetched = self.fetch_all(&ctx).await;

        report.advance(PipelineState::Normalizing);
        let mut postings = Vec::new();
        for (source, result) in fetched {
            let mut outcome = SourceOutcome::new(source);
            match result {
                Ok(records) => {
                    outcome.records = records.len();
                    for (position, raw) in records.iter().enumerate() {
                        match normalize_record(raw, source, now) {
                            Ok(posting) => {
                                outcome.postings += 1;
                                postings.push(posting);
                            }
                            Err(err) => {
                                outcome.rejected += 1;
                                warn!(source = %source, position, url = ?raw.url, error = %err, "dropping record");
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(source = %source, error = %err, "source failed; continuing without it");
                    outcome.error = Some(err.to_string());
                }
            }
            report.sources.push(outcome);
        }

        report.advance(PipelineState::FilteringIntraRunDuplicates);
        let (postings, duplicates) = self.dedup.dedup_intra_run(postings);
        report.intra_run_duplicates = duplicates;

        report.advance(PipelineState::ApplyingEligibility);
        let candidates = postings.len();
        let eligible: Vec<Posting> = postings
            .into_iter()
            .filter(|p| is_eligible(p, &self.profile, now))
            .collect();
        report.ineligible = candidates - eligible.len();

        report.advance(PipelineState::CheckingHistory);
        let index = match self.history.load_index().await {
            Ok(index) => index,
            Err(err) => return Err(report.fail(PipelineError::HistoryUnavailable(err))),
        };
        let gate = self.dedup.gate_on_history(eligible, &index);
        report.already_notified = gate.already_notified;
        report.repeated_urls = gate.repeated_urls;
        let fresh = gate.fresh;

        report.advance(PipelineState::Persisting);
        if self.persist {
            match self.history.append(&fresh, now).await {
                Ok(written) => report.persisted = written,
                Err(err) => return Err(report.fail(PipelineError::HistoryWrite(err))),
            }
        } else {
            info!(new = fresh.len(), "dry run; history left untouched");
        }

        report.advance(PipelineState::Formatting);
        let text = format_digest(&fresh);

        match notifier.send(&text).await {
            Ok(()) => report.notified = fresh.len(),
            Err(err) => {
                error!(notifier = notifier.name(), error = %err, "notification failed; history already records these postings");
                report.notify_error = Some(err.to_string());
            }
        }
        report.postings = fresh;
        report.advance(PipelineState::Dispatched);
        report.finished_at = Some(Utc::now());

        info!(
            records = report.fetched_records(),
            duplicates = report.intra_run_duplicates,
            ineligible = report.ineligible,
            already_notified = report.already_notified,
            new = report.persisted,
            notified = report.notified,
            "pipeline run complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).single().unwrap()
    }

    fn posting(source: Source, title: &str, company: &str, url: &str) -> Posting {
        Posting {
            source,
            title: title.to_string(),
            company: company.to_string(),
            location: "Madrid".to_string(),
            observed_at: ts(),
            url: url.to_string(),
        }
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_defaults_apply_when_unset() {
        let config = JobwatchConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.include_keywords.is_empty());
        assert!(config.remote_allowed);
        assert_eq!(config.hours_back, 24);
        assert_eq!(config.run_mode, RunMode::Cron);
        assert_eq!(config.history_file, PathBuf::from("ofertas_historico.csv"));
        assert_eq!(config.http_timeout_secs, 20);
        assert!(config.telegram_bot_token.is_none());
    }

    #[test]
    fn config_parses_lists_and_flags() {
        let config = JobwatchConfig::from_lookup(lookup(&[
            ("KEYWORDS_INCLUDE", " Data, Analytics ,,"),
            ("KEYWORDS_EXCLUDE", "Intern,Becario"),
            ("LOCATIONS_INCLUDE", "Madrid"),
            ("REMOTE_ALLOWED", "false"),
            ("HOURS_BACK", "48"),
            ("RUN_MODE", "bot"),
            ("TELEGRAM_USER_ID", "123456"),
            ("TELEGRAM_BOT_TOKEN", "token"),
        ]))
        .unwrap();
        assert_eq!(config.include_keywords, ["data", "analytics"]);
        assert_eq!(config.exclude_keywords, ["intern", "becario"]);
        assert!(!config.remote_allowed);
        assert_eq!(config.run_mode, RunMode::Bot);
        assert_eq!(config.telegram_user_id, Some(123456));
        assert_eq!(config.profile().recency_window, Duration::hours(48));
        assert!(format!("{config:?}").contains("Secret(***)"));
    }

    #[test]
    fn config_rejects_bad_values() {
        assert!(JobwatchConfig::from_lookup(lookup(&[("HOURS_BACK", "soon")])).is_err());
        assert!(JobwatchConfig::from_lookup(lookup(&[("HOURS_BACK", "-1")])).is_err());
        assert!(JobwatchConfig::from_lookup(lookup(&[("REMOTE_ALLOWED", "maybe")])).is_err());
        assert!(JobwatchConfig::from_lookup(lookup(&[("RUN_MODE", "daemon")])).is_err());
        assert!(JobwatchConfig::from_lookup(lookup(&[("JOBWATCH_HTTP_TIMEOUT_SECS", "fast")])).is_err());
        assert!(JobwatchConfig::from_lookup(lookup(&[("JOBWATCH_HTTP_TIMEOUT_SECS", "0")])).is_err());
        let config =
            JobwatchConfig::from_lookup(lookup(&[("JOBWATCH_HTTP_TIMEOUT_SECS", "45")])).unwrap();
        assert_eq!(config.http_client_config().timeout, StdDuration::from_secs(45));
    }

    #[test]
    fn registry_resolves_relative_fixtures_and_default_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            "sources:\n  - source: linkedin\n  - source: indeed\n    mode: fixture\n    fixture_paths: [pages/indeed.html]\n  - source: infojobs\n    enabled: false\n",
        )
        .unwrap();
        let registry = SourceRegistry::load(&path).unwrap();
        assert_eq!(registry.sources.len(), 3);
        assert_eq!(registry.sources[0].listing_urls, default_listing_urls(Source::LinkedIn));
        assert_eq!(registry.sources[1].fixture_paths[0], dir.path().join("pages/indeed.html"));
        let enabled: Vec<Source> = registry.enabled().map(|s| s.source).collect();
        assert_eq!(enabled, [Source::LinkedIn, Source::Indeed]);
    }

    #[test]
    fn missing_registry_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(registry, SourceRegistry::default());
    }

    #[test]
    fn infojobs_is_skipped_without_credentials() {
        let config = JobwatchConfig::from_lookup(lookup(&[])).unwrap();
        let fetchers = build_fetchers(&config, &SourceRegistry::default()).unwrap();
        let sources: Vec<Source> = fetchers.iter().map(|f| f.source()).collect();
        assert_eq!(sources, [Source::LinkedIn, Source::Indeed]);
    }

    #[test]
    fn intra_run_dedup_keeps_first_occurrence() {
        let engine = DedupEngine::new();
        let (kept, dropped) = engine.dedup_intra_run(vec![
            posting(Source::LinkedIn, "Data Engineer", "Acme", "https://x/1"),
            posting(Source::Indeed, " DATA ENGINEER", "acme ", "HTTPS://X/1"),
            posting(Source::Indeed, "Data Engineer", "Other", "https://x/1"),
        ]);
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].source, Source::LinkedIn);
        assert_eq!(kept[1].company, "Other");
    }

    #[test]
    fn history_gate_suppresses_known_and_repeated_urls() {
        let engine = DedupEngine::new();
        let mut index = HistoryIndex::default();
        index.insert("https://x/1");
        let gate = engine.gate_on_history(
            vec![
                posting(Source::LinkedIn, "A", "Acme", "HTTPS://X/1"),
                posting(Source::LinkedIn, "B", "Acme", "https://x/2"),
                posting(Source::Indeed, "B (reposted)", "Acme", "https://x/2"),
            ],
            &index,
        );
        assert_eq!(gate.already_notified, 1);
        assert_eq!(gate.repeated_urls, 1);
        assert_eq!(gate.fresh.len(), 1);
        assert_eq!(gate.fresh[0].title, "B");
    }

    #[test]
    fn page_extensions_follow_content_type() {
        assert_eq!(page_extension("application/json; charset=utf-8"), "json");
        assert_eq!(page_extension("text/html"), "html");
        assert_eq!(page_extension("application/octet-stream"), "bin");
    }
}
