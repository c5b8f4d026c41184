//! Durable record store, backups, audit log and HTTP fetch utilities for SKED.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sked_core::{GroupingSpec, StoreSnapshot};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod audit;
pub mod xml;

pub use audit::{AuditContext, AuditLog};

pub const CRATE_NAME: &str = "sked-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("reading store {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("backing up store to {}: {source}", .path.display())]
    BackupFailed { path: PathBuf, source: io::Error },
    #[error("writing store {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("encoding store document: {0}")]
    Encode(String),
    #[error("appending to audit log {}: {source}", .path.display())]
    Audit { path: PathBuf, source: io::Error },
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `dest` through a sibling temp file and a rename, so `dest` is
/// either the old content or the complete new content.
pub async fn write_atomically(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, dest).await
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupNaming {
    /// `<stem>.backup.xml`, overwritten each run.
    #[default]
    Fixed,
    /// `<stem>.<YYYYmmdd_HHMMSS>.backup.xml`, one per run.
    Timestamped,
}

/// What a backup produced. Empty when there was no store to copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHandle {
    pub path: Option<PathBuf>,
    pub sha256: Option<String>,
    pub byte_size: u64,
}

impl BackupHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none()
    }
}

/// XML-backed record store at a single path.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
    backup_naming: BackupNaming,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_naming: BackupNaming::default(),
        }
    }

    pub fn with_backup_naming(mut self, naming: BackupNaming) -> Self {
        self.backup_naming = naming;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path_for(&self, at: DateTime<Utc>) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let name = match self.backup_naming {
            BackupNaming::Fixed => format!("{stem}.backup.xml"),
            BackupNaming::Timestamped => format!("{stem}.{}.backup.xml", at.format("%Y%m%d_%H%M%S")),
        };
        self.path.with_file_name(name)
    }

    /// Missing document is an empty snapshot; an unreadable one is `Corrupt`.
    pub async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no store document yet");
                return Ok(StoreSnapshot::empty());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        xml::decode_snapshot(&bytes).map_err(|reason| StoreError::Corrupt {
            path: self.path.clone(),
            reason,
        })
    }

    pub async fn save(&self, snapshot: &StoreSnapshot, grouping: &GroupingSpec) -> Result<(), StoreError> {
        let bytes = xml::encode_snapshot(snapshot, grouping).map_err(StoreError::Encode)?;
        write_atomically(&self.path, &bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })?;
        info!(path = %self.path.display(), records = snapshot.len(), "store written");
        Ok(())
    }

    /// Where an unreadable document is set aside: `<stem>.corrupt.<YYYYmmdd_HHMMSS>.xml`.
    /// Never the routine backup path, so the last good backup survives recovery.
    pub fn corrupt_copy_path_for(&self, at: DateTime<Utc>) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        self.path
            .with_file_name(format!("{stem}.corrupt.{}.xml", at.format("%Y%m%d_%H%M%S")))
    }

    /// Copy the current document aside before any mutation.
    pub async fn backup(&self, at: DateTime<Utc>) -> Result<BackupHandle, StoreError> {
        let handle = self.copy_aside(self.backup_path_for(at)).await?;
        if let Some(path) = &handle.path {
            info!(path = %path.display(), bytes = handle.byte_size, "backup created");
        }
        Ok(handle)
    }

    /// Copy an unreadable document aside before it is replaced.
    pub async fn preserve_corrupt(&self, at: DateTime<Utc>) -> Result<BackupHandle, StoreError> {
        let handle = self.copy_aside(self.corrupt_copy_path_for(at)).await?;
        if let Some(path) = &handle.path {
            warn!(path = %path.display(), bytes = handle.byte_size, "corrupt store document preserved");
        }
        Ok(handle)
    }

    async fn copy_aside(&self, dest: PathBuf) -> Result<BackupHandle, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BackupHandle::empty()),
            Err(source) => return Err(StoreError::BackupFailed { path: dest, source }),
        };

        write_atomically(&dest, &bytes)
            .await
            .map_err(|source| StoreError::BackupFailed {
                path: dest.clone(),
                source,
            })?;

        Ok(BackupHandle {
            path: Some(dest),
            sha256: Some(sha256_hex(&bytes)),
            byte_size: bytes.len() as u64,
        })
    }

    pub async fn discard_backup(&self, handle: &BackupHandle) -> Result<bool, StoreError> {
        let Some(path) = &handle.path else {
            return Ok(false);
        };
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Write {
                path: path.clone(),
                source,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Raw fetched pages kept under hash-addressed paths for later re-parsing.
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

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(source_id)
            .join(stamp)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomically(&absolute_path, bytes)
                .await
                .with_context(|| format!("archiving page to {}", absolute_path.display()))?;
        }

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
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
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// A numeric `Retry-After` wins over the exponential schedule, capped at `max_delay`.
    pub fn delay_with_retry_after(&self, attempt_index: usize, retry_after: Option<&str>) -> Duration {
        match retry_after.and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(secs) => Duration::from_secs(secs).min(self.max_delay),
            None => self.delay_for_attempt(attempt_index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between consecutive requests.
    pub request_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            request_delay: Duration::from_millis(1000),
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
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    request_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

fn retry_after_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
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

        Ok(Self {
            client,
            backoff: config.backoff,
            request_delay: config.request_delay,
            last_request: Mutex::new(None),
        })
    }

    async fn wait_for_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.request_delay {
                tokio::time::sleep(self.request_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            self.wait_for_turn().await;
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        let retry_after = retry_after_header(resp.headers());
                        let delay = self
                            .backoff
                            .delay_with_retry_after(attempt, retry_after.as_deref());
                        debug!(status = status.as_u16(), ?delay, attempt, "retrying after http status");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(error = %err, ?delay, attempt, "retrying after request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::HttpStatus {
                status: 0,
                url: url.to_string(),
            }),
        }
    }
}
