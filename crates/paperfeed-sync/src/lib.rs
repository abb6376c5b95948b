//! Harvest pipeline orchestration: subjects → paginated listings → normalization →
//! first-seen-wins merge → one atomic save.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use paperfeed_adapters::{
    ArxivListingSource, FetchSettings, ListingFetcher, ListingSource, ARXIV_API_BASE,
};
use paperfeed_core::Collection;
use paperfeed_storage::{BackoffPolicy, CollectionStore, HttpClientConfig, PageArchive, RequestPacer};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod merge;
pub mod normalize;
pub mod pages;

pub use merge::{merge, MergeOutcome};
pub use normalize::{normalize, normalize_batch, NormalizationError, NormalizedBatch};
pub use pages::{export_subject_pages, subject_pages_dir, SUBJECT_PAGE_SIZE};

pub const CRATE_NAME: &str = "paperfeed-sync";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub output_path: PathBuf,
    pub subjects_file: PathBuf,
    pub inline_subjects: Option<String>,
    pub api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_size: usize,
    pub max_pages: usize,
    pub request_interval: Duration,
    pub max_retries: usize,
    pub retry_base_delay: Duration,
    pub retry_multiplier: u32,
    pub concurrency: usize,
    pub run_timeout: Option<Duration>,
    pub archive_dir: Option<PathBuf>,
    pub subject_pages: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("data/papers.json"),
            subjects_file: PathBuf::from("subjects.txt"),
            inline_subjects: None,
            api_base: ARXIV_API_BASE.to_string(),
            user_agent: "paperfeed/0.1 (arXiv listing harvester)".to_string(),
            http_timeout_secs: 30,
            page_size: 200,
            max_pages: 5,
            request_interval: Duration::from_millis(3000),
            max_retries: 4,
            retry_base_delay: Duration::from_millis(1000),
            retry_multiplier: 2,
            concurrency: 1,
            run_timeout: None,
            archive_dir: None,
            subject_pages: false,
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            output_path: std::env::var("PAPERFEED_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            subjects_file: std::env::var("PAPERFEED_SUBJECTS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.subjects_file),
            inline_subjects: None,
            api_base: std::env::var("PAPERFEED_API_BASE").unwrap_or(defaults.api_base),
            user_agent: std::env::var("PAPERFEED_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("PAPERFEED_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            page_size: env_parse("PAPERFEED_PAGE_SIZE").unwrap_or(defaults.page_size),
            max_pages: env_parse("PAPERFEED_MAX_PAGES").unwrap_or(defaults.max_pages),
            request_interval: env_parse("PAPERFEED_REQUEST_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_interval),
            max_retries: env_parse("PAPERFEED_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_base_delay: env_parse("PAPERFEED_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            retry_multiplier: env_parse("PAPERFEED_RETRY_MULTIPLIER")
                .unwrap_or(defaults.retry_multiplier),
            concurrency: env_parse("PAPERFEED_CONCURRENCY").unwrap_or(defaults.concurrency),
            run_timeout: env_parse("PAPERFEED_RUN_TIMEOUT_SECS").map(Duration::from_secs),
            archive_dir: std::env::var("PAPERFEED_ARCHIVE_DIR").ok().map(PathBuf::from),
            subject_pages: std::env::var("PAPERFEED_SUBJECT_PAGES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.subject_pages),
        }
    }

    fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            page_size: self.page_size,
            max_pages: self.max_pages,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: self.retry_base_delay,
                multiplier: self.retry_multiplier,
                ..BackoffPolicy::default()
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Subjects from an inline list separated by commas and/or whitespace.
pub fn subjects_from_inline(list: &str) -> Vec<String> {
    dedup_subjects(list.split(|c: char| c == ',' || c.is_whitespace()))
}

/// Subjects from a file body: one per line, `#` comments and blank lines ignored.
pub fn subjects_from_lines(text: &str) -> Vec<String> {
    dedup_subjects(text.lines().filter(|l| !l.trim_start().starts_with('#')))
}

fn dedup_subjects<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items.map(str::trim).filter(|s| !s.is_empty()) {
        if !out.iter().any(|s| s == item) {
            out.push(item.to_string());
        }
    }
    out
}

/// Inline subjects win over the subjects file; a missing file is a configuration error.
pub async fn load_subjects(config: &HarvestConfig) -> Result<Vec<String>> {
    if let Some(inline) = &config.inline_subjects {
        return Ok(subjects_from_inline(inline));
    }
    let text = tokio::fs::read_to_string(&config.subjects_file)
        .await
        .with_context(|| format!("reading subjects file {}", config.subjects_file.display()))?;
    Ok(subjects_from_lines(&text))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStatus {
    Completed,
    Abandoned,
    /// Still in flight (or never started) when the run timeout fired.
    Unfinished,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectReport {
    pub subject: String,
    pub status: SubjectStatus,
    pub pages_fetched: usize,
    pub records_added: usize,
    pub records_skipped: usize,
    pub records_dropped: usize,
    pub error: Option<String>,
}

impl SubjectReport {
    fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            status: SubjectStatus::Unfinished,
            pages_fetched: 0,
            records_added: 0,
            records_skipped: 0,
            records_dropped: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store_path: String,
    pub subjects_total: usize,
    pub subjects_completed: usize,
    pub subjects_abandoned: usize,
    pub subjects_unfinished: usize,
    pub pages_fetched: usize,
    pub records_added: usize,
    pub records_skipped: usize,
    pub records_dropped: usize,
    pub collection_size: usize,
    pub timed_out: bool,
    pub subject_pages_written: usize,
    /// Set when the store was saved but writing subject pages failed.
    pub subject_pages_error: Option<String>,
    pub subjects: Vec<SubjectReport>,
}

impl HarvestSummary {
    fn from_reports(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        store_path: &Path,
        reports: Vec<SubjectReport>,
        collection_size: usize,
        timed_out: bool,
    ) -> Self {
        let count = |status: SubjectStatus| reports.iter().filter(|r| r.status == status).count();
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            store_path: store_path.display().to_string(),
            subjects_total: reports.len(),
            subjects_completed: count(SubjectStatus::Completed),
            subjects_abandoned: count(SubjectStatus::Abandoned),
            subjects_unfinished: count(SubjectStatus::Unfinished),
            pages_fetched: reports.iter().map(|r| r.pages_fetched).sum(),
            records_added: reports.iter().map(|r| r.records_added).sum(),
            records_skipped: reports.iter().map(|r| r.records_skipped).sum(),
            records_dropped: reports.iter().map(|r| r.records_dropped).sum(),
            collection_size,
            timed_out,
            subject_pages_written: 0,
            subject_pages_error: None,
            subjects: reports,
        }
    }
}

/// Everything subject tasks mutate, behind one lock.
struct HarvestState {
    collection: Collection,
    reports: BTreeMap<String, SubjectReport>,
}

pub struct HarvestPipeline {
    config: HarvestConfig,
    store: CollectionStore,
    fetcher: ListingFetcher,
}

impl HarvestPipeline {
    pub fn new(config: HarvestConfig) -> Result<Self> {
        let mut source = ArxivListingSource::new(
            HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
            },
            config.api_base.clone(),
        )?;
        if let Some(dir) = &config.archive_dir {
            source = source.with_archive(PageArchive::new(dir.clone()));
        }
        Ok(Self::with_source(config, Arc::new(source)))
    }

    pub fn with_source(config: HarvestConfig, source: Arc<dyn ListingSource>) -> Self {
        let pacer = Arc::new(RequestPacer::new(config.request_interval));
        let fetcher = ListingFetcher::new(source, pacer, config.fetch_settings());
        let store = CollectionStore::new(config.output_path.clone());
        Self {
            config,
            store,
            fetcher,
        }
    }

    pub fn store(&self) -> &CollectionStore {
        &self.store
    }

    /// One full harvest. Fails only when the store cannot be loaded or saved; fetch
    /// problems and subject page write failures are reported in the summary.
    pub async fn run_once(&self, subjects: &[String]) -> Result<HarvestSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let subjects = dedup_subjects(subjects.iter().map(String::as_str));

        let collection = self
            .store
            .load()
            .await
            .with_context(|| format!("loading store {}", self.store.path().display()))?;
        info!(
            %run_id,
            source = self.fetcher.source_id(),
            subjects = subjects.len(),
            existing = collection.len(),
            "harvest starting"
        );

        let state = Mutex::new(HarvestState {
            collection,
            reports: subjects
                .iter()
                .map(|s| (s.clone(), SubjectReport::new(s)))
                .collect(),
        });

        let harvest = stream::iter(subjects.iter())
            .map(|subject| self.harvest_subject(run_id, subject, &state))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<()>>();
        let timed_out = match self.config.run_timeout {
            Some(budget) => tokio::time::timeout(budget, harvest).await.is_err(),
            None => {
                harvest.await;
                false
            }
        };
        if timed_out {
            warn!(%run_id, "run timeout reached; abandoning in-flight subjects");
        }

        let HarvestState {
            collection,
            mut reports,
        } = state.into_inner();
        self.store
            .save_atomic(&collection)
            .await
            .with_context(|| format!("saving store {}", self.store.path().display()))?;

        let ordered = subjects
            .iter()
            .filter_map(|s| reports.remove(s))
            .collect::<Vec<_>>();
        let mut summary = HarvestSummary::from_reports(
            run_id,
            started_at,
            self.store.path(),
            ordered,
            collection.len(),
            timed_out,
        );

        if self.config.subject_pages {
            let out_dir = subject_pages_dir(self.store.path());
            match export_subject_pages(&collection, &out_dir, &subjects, SUBJECT_PAGE_SIZE).await
            {
                Ok(written) => summary.subject_pages_written = written,
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(%run_id, error = %message, "store saved but subject pages were not written");
                    summary.subject_pages_error = Some(message);
                }
            }
        }

        info!(
            %run_id,
            completed = summary.subjects_completed,
            abandoned = summary.subjects_abandoned,
            unfinished = summary.subjects_unfinished,
            pages = summary.pages_fetched,
            added = summary.records_added,
            skipped = summary.records_skipped,
            dropped = summary.records_dropped,
            total = summary.collection_size,
            "harvest finished"
        );
        Ok(summary)
    }

    async fn harvest_subject(&self, run_id: Uuid, subject: &str, state: &Mutex<HarvestState>) {
        let span = info_span!("harvest_subject", %run_id, subject);
        async move {
            let mut listing = self.fetcher.fetch_subject(subject);
            while let Some(page) = listing.next_page().await {
                let raw = match page {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(error = %err, terminal = err.is_terminal(), "abandoning subject");
                        let mut state = state.lock().await;
                        if let Some(report) = state.reports.get_mut(subject) {
                            report.status = SubjectStatus::Abandoned;
                            report.error = Some(err.to_string());
                        }
                        return;
                    }
                };

                let batch = normalize_batch(&raw);
                let mut guard = state.lock().await;
                let state = &mut *guard;
                let outcome = merge(std::mem::take(&mut state.collection), batch.records);
                state.collection = outcome.collection;
                if let Some(report) = state.reports.get_mut(subject) {
                    report.pages_fetched += 1;
                    report.records_added += outcome.added;
                    report.records_skipped += outcome.skipped;
                    report.records_dropped += batch.dropped;
                }
                debug!(
                    page = listing.pages_requested(),
                    added = outcome.added,
                    skipped = outcome.skipped,
                    dropped = batch.dropped,
                    "page merged"
                );
            }

            let mut state = state.lock().await;
            if let Some(report) = state.reports.get_mut(subject) {
                report.status = SubjectStatus::Completed;
                info!(
                    pages = report.pages_fetched,
                    added = report.records_added,
                    "subject complete"
                );
            }
        }
        .instrument(span)
        .await
    }
}

pub async fn run_harvest_once(config: HarvestConfig) -> Result<HarvestSummary> {
    let subjects = load_subjects(&config).await?;
    if subjects.is_empty() {
        warn!("no subjects configured; the store will be rewritten unchanged");
    }
    let pipeline = HarvestPipeline::new(config)?;
    pipeline.run_once(&subjects).await
}

/// Export subject pages for every subject present in the store at `store_path`.
pub async fn export_pages_from_store(store_path: &Path) -> Result<usize> {
    let store = CollectionStore::new(store_path);
    let collection = store
        .load()
        .await
        .with_context(|| format!("loading store {}", store_path.display()))?;
    let subjects: Vec<String> = collection.subjects().into_iter().collect();
    export_subject_pages(
        &collection,
        &subject_pages_dir(store_path),
        &subjects,
        SUBJECT_PAGE_SIZE,
    )
    .await
}
