//! Listing source contracts, the arXiv Atom API source and the paginated per-subject
//! fetcher.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use paperfeed_core::RawRecord;
use paperfeed_storage::{
    BackoffPolicy, HttpClientConfig, HttpError, HttpFetcher, PageArchive, RequestPacer,
    RetryDisposition,
};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "paperfeed-adapters";

pub const ARXIV_API_BASE: &str = "https://export.arxiv.org/api/query";
pub const ARXIV_MAX_PAGE_SIZE: usize = 2000;

static SUBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z\-]*(?:\.[A-Za-z][A-Za-z\-]*)?$").expect("subject regex is valid")
});

/// One page of one subject's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest<'a> {
    pub subject: &'a str,
    pub page_index: usize,
    pub start: usize,
    pub max_results: usize,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("unparseable listing page: {0}")]
    Parse(String),
    #[error("listing source rejected the query: {0}")]
    Rejected(String),
}

impl SourceError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SourceError::Http(err) => err.disposition(),
            // Garbled bodies come from throttling or truncation.
            SourceError::Parse(_) => RetryDisposition::Retryable,
            SourceError::Rejected(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Largest page the remote side accepts.
    fn max_page_size(&self) -> usize;

    /// Fetch a single page. Implementations make exactly one request; pacing and
    /// retries are handled by [`ListingFetcher`].
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Vec<RawRecord>, SourceError>;
}

/// Listing source backed by the arXiv Atom query API.
#[derive(Debug, Clone)]
pub struct ArxivListingSource {
    http: HttpFetcher,
    api_base: String,
    archive: Option<PageArchive>,
}

impl ArxivListingSource {
    pub fn new(config: HttpClientConfig, api_base: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
            api_base: api_base.into(),
            archive: None,
        })
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn is_valid_subject(subject: &str) -> bool {
        SUBJECT.is_match(subject)
    }

    pub fn query_url(&self, request: &PageRequest<'_>) -> Result<String, SourceError> {
        let url = reqwest::Url::parse_with_params(
            &self.api_base,
            &[
                ("search_query", format!("cat:{}", request.subject)),
                ("start", request.start.to_string()),
                ("max_results", request.max_results.to_string()),
                ("sortBy", "submittedDate".to_string()),
                ("sortOrder", "descending".to_string()),
            ],
        )
        .map_err(|e| SourceError::Rejected(format!("invalid api base {:?}: {e}", self.api_base)))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl ListingSource for ArxivListingSource {
    fn source_id(&self) -> &'static str {
        "arxiv"
    }

    fn max_page_size(&self) -> usize {
        ARXIV_MAX_PAGE_SIZE
    }

    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Vec<RawRecord>, SourceError> {
        if !Self::is_valid_subject(request.subject) {
            return Err(SourceError::Rejected(format!(
                "not an arXiv category: {:?}",
                request.subject
            )));
        }
        let url = self.query_url(request)?;
        let response = self.http.fetch_bytes(&url).await?;

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .store(Utc::now(), request.subject, "xml", &response.body)
                .await
            {
                warn!(subject = request.subject, error = %err, "failed to archive listing page");
            }
        }

        parse_atom_page(&response.body)
    }
}

/// Parse one Atom response of the arXiv API into raw records.
pub fn parse_atom_page(body: &[u8]) -> Result<Vec<RawRecord>, SourceError> {
    let feed = feed_rs::parser::parse(body).map_err(|e| SourceError::Parse(e.to_string()))?;

    let mut records = Vec::with_capacity(feed.entries.len());
    for entry in feed.entries {
        if entry.id.contains("arxiv.org/api/errors") {
            let detail = entry
                .summary
                .map(|s| s.content)
                .unwrap_or_else(|| entry.id.clone());
            return Err(SourceError::Rejected(detail.trim().to_string()));
        }
        records.push(RawRecord {
            reference: Some(entry.id).filter(|id| !id.trim().is_empty()),
            title: entry.title.map(|t| t.content),
            authors: entry.authors.into_iter().map(|a| a.name).collect(),
            categories: entry.categories.into_iter().map(|c| c.term).collect(),
            summary: entry.summary.map(|s| s.content),
            published: entry.published.map(|d| d.to_rfc3339()),
        });
    }
    Ok(records)
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("subject {subject}: page {page} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        subject: String,
        page: usize,
        attempts: usize,
        #[source]
        source: SourceError,
    },
    #[error("subject {subject}: page {page} failed terminally: {source}")]
    Terminal {
        subject: String,
        page: usize,
        #[source]
        source: SourceError,
    },
}

impl FetchError {
    pub fn subject(&self) -> &str {
        match self {
            FetchError::RetriesExhausted { subject, .. } | FetchError::Terminal { subject, .. } => {
                subject
            }
        }
    }

    pub fn page(&self) -> usize {
        match self {
            FetchError::RetriesExhausted { page, .. } | FetchError::Terminal { page, .. } => *page,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchError::Terminal { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub page_size: usize,
    pub max_pages: usize,
    pub backoff: BackoffPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: 200,
            max_pages: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Paginates subjects against a [`ListingSource`], pacing every request through a
/// shared [`RequestPacer`] and retrying transient failures per page.
#[derive(Clone)]
pub struct ListingFetcher {
    source: Arc<dyn ListingSource>,
    pacer: Arc<RequestPacer>,
    page_size: usize,
    max_pages: usize,
    backoff: BackoffPolicy,
}

impl ListingFetcher {
    pub fn new(
        source: Arc<dyn ListingSource>,
        pacer: Arc<RequestPacer>,
        settings: FetchSettings,
    ) -> Self {
        let page_size = settings.page_size.clamp(1, source.max_page_size().max(1));
        Self {
            source,
            pacer,
            page_size,
            max_pages: settings.max_pages,
            backoff: settings.backoff,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn source_id(&self) -> &'static str {
        self.source.source_id()
    }

    /// Start a fresh listing for `subject`, beginning at page one.
    pub fn fetch_subject(&self, subject: impl Into<String>) -> SubjectListing<'_> {
        SubjectListing {
            fetcher: self,
            subject: subject.into(),
            next_page: 0,
            finished: false,
        }
    }

    async fn fetch_with_retry(
        &self,
        subject: &str,
        page: usize,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let request = PageRequest {
            subject,
            page_index: page,
            start: page * self.page_size,
            max_results: self.page_size,
        };

        let mut attempt = 0usize;
        loop {
            self.pacer.wait().await;
            let err = match self.source.fetch_page(&request).await {
                Ok(records) => return Ok(records),
                Err(err) => err,
            };

            if err.disposition() == RetryDisposition::NonRetryable {
                return Err(FetchError::Terminal {
                    subject: subject.to_string(),
                    page,
                    source: err,
                });
            }
            if attempt >= self.backoff.max_retries {
                return Err(FetchError::RetriesExhausted {
                    subject: subject.to_string(),
                    page,
                    attempts: attempt + 1,
                    source: err,
                });
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(subject, page, attempt, ?delay, error = %err, "transient listing failure; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Lazy, finite sequence of one subject's pages.
///
/// Ends after the first empty page, after `max_pages` pages, or after yielding an
/// error.
pub struct SubjectListing<'a> {
    fetcher: &'a ListingFetcher,
    subject: String,
    next_page: usize,
    finished: bool,
}

impl SubjectListing<'_> {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Number of pages requested successfully so far, including a final empty one.
    pub fn pages_requested(&self) -> usize {
        self.next_page
    }

    pub async fn next_page(&mut self) -> Option<Result<Vec<RawRecord>, FetchError>> {
        if self.finished {
            return None;
        }
        if self.next_page >= self.fetcher.max_pages {
            debug!(subject = %self.subject, pages = self.next_page, "page limit reached");
            self.finished = true;
            return None;
        }

        match self.fetcher.fetch_with_retry(&self.subject, self.next_page).await {
            Ok(records) => {
                self.next_page += 1;
                if records.is_empty() {
                    debug!(subject = %self.subject, pages = self.next_page, "end of listing");
                    self.finished = true;
                    None
                } else {
                    Some(Ok(records))
                }
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
