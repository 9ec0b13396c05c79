//! Source file access, object storage and the asset uploader for migrated media.

mod s3;

pub use s3::{S3Config, S3Credentials, S3ObjectStore};

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use newsmig_core::{file_name_from_path, percent_decode};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsmig-storage";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source file not found: {0}")]
    NotFound(String),
    #[error("source read failed: {0}")]
    Transient(String),
    #[error("source read rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectStoreError {
    #[error("object key not found: {0}")]
    NotFound(String),
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("object storage request failed: {0}")]
    Transient(String),
    #[error("object storage request rejected: {0}")]
    Rejected(String),
}

/// Non-fatal upload outcome; the caller decides whether to skip the reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("source for {file_name} not found: {reason}")]
    NotFound { file_name: String, reason: String },
    #[error("upload of {file_name} failed: {reason}")]
    Transient { file_name: String, reason: String },
}

impl UploadError {
    pub fn file_name(&self) -> &str {
        match self {
            Self::NotFound { file_name, .. } | Self::Transient { file_name, .. } => file_name,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Where legacy media files are read from.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn read(&self, relative_path: &str) -> Result<Vec<u8>, SourceError>;
}

/// Durable object storage keyed by file name.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Overwrites any existing object under `key`.
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), ObjectStoreError>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    async fn object_exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
}

/// Upload capability handed to the reconciler.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Returns the stored file name, which is also the catalog deduplication key.
    async fn upload(&self, relative_path: &str) -> Result<String, UploadError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
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
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

/// Legacy media checked out on local disk, e.g. the old site's document root.
#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative_path: &str) -> Result<PathBuf, SourceError> {
        let decoded = percent_decode(relative_path.trim());
        let rel = Path::new(decoded.trim_start_matches('/'));
        let escapes_root = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if rel.as_os_str().is_empty() || escapes_root {
            return Err(SourceError::NotFound(format!(
                "{relative_path:?} does not name a file under {}",
                self.root.display()
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl SourceReader for LocalSource {
    async fn read(&self, relative_path: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.resolve(relative_path)?;
        fs::read(&path).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound(path.display().to_string()),
            _ => SourceError::Transient(format!("reading {}: {err}", path.display())),
        })
    }
}

/// Legacy media served over HTTP from the old site.
#[derive(Debug, Clone)]
pub struct HttpSource {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(base_url: &str, config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut parsed =
            Url::parse(base_url).with_context(|| format!("parsing source base url {base_url}"))?;
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }
        Ok(Self {
            base_url: parsed,
            client: build_http_client(config)?,
        })
    }

    /// Foreign absolute URLs and dot-segments never leave the base URL.
    pub fn url_for(&self, relative_path: &str) -> Result<Url, SourceError> {
        let trimmed = relative_path.trim().trim_start_matches('/');
        if trimmed.is_empty() || trimmed.contains("://") || trimmed.split('/').any(|s| s == "..")
        {
            return Err(SourceError::NotFound(format!(
                "{relative_path:?} is not a path under {}",
                self.base_url
            )));
        }
        self.base_url
            .join(trimmed)
            .map_err(|err| SourceError::NotFound(format!("{relative_path:?}: {err}")))
    }
}

#[async_trait]
impl SourceReader for HttpSource {
    async fn read(&self, relative_path: &str) -> Result<Vec<u8>, SourceError> {
        let url = self.url_for(relative_path)?;
        let resp = self.client.get(url.clone()).send().await.map_err(|err| {
            let reason = format!("fetching {url}: {err}");
            match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => SourceError::Transient(reason),
                RetryDisposition::NonRetryable => SourceError::Rejected(reason),
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .bytes()
                .await
                .map(|body| body.to_vec())
                .map_err(|err| SourceError::Transient(format!("reading body of {url}: {err}")));
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(SourceError::NotFound(url.to_string()));
        }
        let reason = format!("http status {status} for {url}");
        Err(match classify_status(status) {
            RetryDisposition::Retryable => SourceError::Transient(reason),
            RetryDisposition::NonRetryable => SourceError::Rejected(reason),
        })
    }
}

/// Filesystem-backed object store; writes go through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.is_empty() || key == "." || key == ".." || key.contains(['/', '\\']) {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

fn io_failure(action: &str, path: &Path, err: std::io::Error) -> ObjectStoreError {
    ObjectStoreError::Transient(format!("{action} {}: {err}", path.display()))
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), ObjectStoreError> {
        let absolute_path = self.object_path(key)?;
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| io_failure("creating object directory", &self.root, err))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), body.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| io_failure("opening temp object file", &temp_path, err))?;
        file.write_all(&body)
            .await
            .map_err(|err| io_failure("writing temp object file", &temp_path, err))?;
        file.flush()
            .await
            .map_err(|err| io_failure("flushing temp object file", &temp_path, err))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_failure("renaming temp object onto", &absolute_path, err));
        }
        debug!(key, content_type = ?content_type, bytes = body.len(), "object stored on disk");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.object_path(key)?;
        fs::read(&path).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => ObjectStoreError::NotFound(key.to_string()),
            _ => io_failure("reading object", &path, err),
        })
    }

    async fn object_exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let path = self.object_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|err| io_failure("checking object", &path, err))
    }
}

const IMAGE_SIGNATURES: &[(&[u8], &str)] = &[
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"II*\0", "image/tiff"),
    (b"MM\0*", "image/tiff"),
    (b"\0\0\x01\0", "image/x-icon"),
    (b"BM", "image/bmp"),
];

const SNIFF_WINDOW: usize = 2048;

/// Best-effort content type for image payloads; `None` for anything else.
pub fn sniff_image_content_type(bytes: &[u8]) -> Option<&'static str> {
    if let Some((_, mime)) = IMAGE_SIGNATURES
        .iter()
        .find(|(magic, _)| bytes.starts_with(magic))
    {
        return Some(*mime);
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(SNIFF_WINDOW)]);
    let head = head.trim_start();
    if (head.starts_with("<svg") || head.starts_with("<?xml")) && head.contains("<svg") {
        return Some("image/svg+xml");
    }
    None
}

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Applies to each attempt, covering both the source read and the store write.
    pub timeout: Duration,
    pub max_concurrent_uploads: usize,
    pub backoff: BackoffPolicy,
    pub skip_existing: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_concurrent_uploads: 4,
            backoff: BackoffPolicy::default(),
            skip_existing: false,
        }
    }
}

enum AttemptFailure {
    Missing(String),
    Retryable(String),
    Fatal(String),
}

impl From<SourceError> for AttemptFailure {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound(_) => Self::Missing(err.to_string()),
            SourceError::Transient(_) => Self::Retryable(err.to_string()),
            SourceError::Rejected(_) => Self::Fatal(err.to_string()),
        }
    }
}

impl From<ObjectStoreError> for AttemptFailure {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::Transient(_) => Self::Retryable(err.to_string()),
            _ => Self::Fatal(err.to_string()),
        }
    }
}

/// Copies legacy media into object storage under its deduplication key.
pub struct AssetUploader {
    source: Arc<dyn SourceReader>,
    store: Arc<dyn ObjectStore>,
    limit: Arc<Semaphore>,
    config: UploaderConfig,
}

impl AssetUploader {
    pub fn new(
        source: Arc<dyn SourceReader>,
        store: Arc<dyn ObjectStore>,
        config: UploaderConfig,
    ) -> Self {
        Self {
            source,
            store,
            limit: Arc::new(Semaphore::new(config.max_concurrent_uploads.max(1))),
            config,
        }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    async fn transfer(&self, relative_path: &str, file_name: &str) -> Result<(), AttemptFailure> {
        if self.config.skip_existing && self.store.object_exists(file_name).await? {
            debug!("object already stored; skipping transfer");
            return Ok(());
        }
        let body = self.source.read(relative_path).await?;
        let content_type = sniff_image_content_type(&body);
        self.store
            .put_object(file_name, body, content_type)
            .await
            .map_err(AttemptFailure::from)
    }

    async fn upload_with_retries(
        &self,
        relative_path: &str,
        file_name: &str,
    ) -> Result<(), UploadError> {
        let backoff = self.config.backoff;
        let mut attempt = 0usize;
        loop {
            let failure = match tokio::time::timeout(
                self.config.timeout,
                self.transfer(relative_path, file_name),
            )
            .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(failure)) => failure,
                Err(_) => AttemptFailure::Retryable(format!(
                    "timed out after {}ms",
                    self.config.timeout.as_millis()
                )),
            };

            let reason = match failure {
                AttemptFailure::Missing(reason) => {
                    return Err(UploadError::NotFound {
                        file_name: file_name.to_string(),
                        reason,
                    })
                }
                AttemptFailure::Fatal(reason) => {
                    return Err(UploadError::Transient {
                        file_name: file_name.to_string(),
                        reason,
                    })
                }
                AttemptFailure::Retryable(reason) => reason,
            };
            if attempt >= backoff.max_retries {
                return Err(UploadError::Transient {
                    file_name: file_name.to_string(),
                    reason: format!("{reason} (after {} attempts)", attempt + 1),
                });
            }

            let delay = backoff.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, %reason, "retrying upload");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl MediaUploader for AssetUploader {
    async fn upload(&self, relative_path: &str) -> Result<String, UploadError> {
        let file_name = file_name_from_path(relative_path.trim());
        if file_name.is_empty() {
            warn!(relative_path, "media reference has no file name");
            return Err(UploadError::NotFound {
                file_name,
                reason: format!("{relative_path:?} has no final path segment"),
            });
        }

        let span = info_span!("asset_upload", relative_path, file_name = %file_name);
        async {
            let _permit = match self.limit.acquire().await {
                Ok(permit) => permit,
                Err(err) => {
                    return Err(UploadError::Transient {
                        file_name: file_name.clone(),
                        reason: err.to_string(),
                    })
                }
            };
            match self.upload_with_retries(relative_path, &file_name).await {
                Ok(()) => {
                    info!("asset uploaded");
                    Ok(file_name.clone())
                }
                Err(err) => {
                    warn!(error = %err, "asset upload failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}
