//! Collection store, raw page archive and HTTP fetch utilities for Paperfeed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use paperfeed_core::Collection;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "paperfeed-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store file {} is corrupt", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{action} {}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file {} holds record {id:?} under key {key:?}", .path.display())]
    KeyMismatch { path: PathBuf, key: String, id: String },
    #[error("serializing {}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The persisted collection file.
#[derive(Debug, Clone)]
pub struct CollectionStore {
    path: PathBuf,
}

impl CollectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored collection. A missing file is an empty collection; a file that
    /// exists but does not parse is an error, never silently replaced.
    pub async fn load(&self) -> Result<Collection, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Collection::new());
            }
            Err(err) => return Err(StoreError::io("reading", &self.path, err)),
        };
        let collection: Collection =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if let Some((key, id)) = collection.mismatched_key() {
            return Err(StoreError::KeyMismatch {
                path: self.path.clone(),
                key: key.to_string(),
                id: id.to_string(),
            });
        }
        Ok(collection)
    }

    /// Write the full collection and swap it into place with a rename.
    pub async fn save_atomic(&self, collection: &Collection) -> Result<(), StoreError> {
        self.stage(collection).await?.commit().await?;
        info!(path = %self.path.display(), records = collection.len(), "collection saved");
        Ok(())
    }

    /// First half of [`save_atomic`](Self::save_atomic): the new contents are fully
    /// written to a temp file next to the target, but the target is untouched until
    /// [`PendingWrite::commit`].
    pub async fn stage(&self, collection: &Collection) -> Result<PendingWrite, StoreError> {
        stage_json(&self.path, collection).await
    }
}

/// A fully written temp file waiting to replace its target.
#[derive(Debug)]
#[must_use = "a staged write does nothing until committed"]
pub struct PendingWrite {
    temp_path: PathBuf,
    target: PathBuf,
}

impl PendingWrite {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(StoreError::io("renaming temp file onto", &self.target, err));
        }
        sync_parent_dir(&self.target).await
    }

    pub async fn discard(self) {
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

/// Flush the directory entry created by a rename so it survives power loss.
#[cfg(unix)]
async fn sync_parent_dir(target: &Path) -> Result<(), StoreError> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let dir = fs::File::open(parent)
        .await
        .map_err(|err| StoreError::io("opening directory", parent, err))?;
    dir.sync_all()
        .await
        .map_err(|err| StoreError::io("syncing directory", parent, err))
}

#[cfg(not(unix))]
async fn sync_parent_dir(_target: &Path) -> Result<(), StoreError> {
    Ok(())
}

/// Serialize `value` as pretty JSON into a temp file beside `target`.
pub async fn stage_json<T: Serialize + ?Sized>(
    target: &Path,
    value: &T,
) -> Result<PendingWrite, StoreError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
        path: target.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');

    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|err| StoreError::io("creating directory", &parent, err))?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "collection".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<(), std::io::Error>(())
    }
    .await;
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io("writing temp file", &temp_path, err));
    }

    Ok(PendingWrite {
        temp_path,
        target: target.to_path_buf(),
    })
}

pub async fn write_json_atomic<T: Serialize + ?Sized>(
    target: &Path,
    value: &T,
) -> Result<(), StoreError> {
    stage_json(target, value).await?.commit().await
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of raw listing responses.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(
        fetched_at: DateTime<Utc>,
        subject: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(subject.replace('/', "_"))
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store a response body once; identical bodies within the same second and
    /// subject map to the same file.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        subject: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(fetched_at, subject, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPage {
                content_hash,
                relative_path,
                absolute_path,
                deduplicated: true,
            });
        }

        write_bytes_atomic(&absolute_path, bytes)
            .await
            .with_context(|| format!("archiving page {}", absolute_path.display()))?;
        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            deduplicated: false,
        })
    }
}

async fn write_bytes_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);
    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
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
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule: `base_delay * multiplier^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = self
            .multiplier
            .max(1)
            .checked_pow(exponent)
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Enforces a minimum spacing between request starts, shared by every caller.
///
/// Slots are reserved under the lock and slept on outside it, so concurrent callers
/// queue up one interval apart.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            HttpError::Request(err) => classify_reqwest_error(err),
            HttpError::HttpStatus { status, .. } => match StatusCode::from_u16(*status) {
                Ok(status) => classify_status(status),
                Err(_) => RetryDisposition::NonRetryable,
            },
        }
    }
}

/// Thin reqwest wrapper performing exactly one attempt per call; pacing and retries
/// belong to the caller.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(HttpError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok::<_, HttpError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
