//! HTTP feed fetching + durable payload fingerprints for geohaz.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Raw payload of one poll attempt plus its content digest.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub source_id: String,
    pub url: String,
    pub body: Vec<u8>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

impl FetchResult {
    pub fn new(source_id: &str, url: &str, body: Vec<u8>) -> Self {
        let content_hash = sha256_hex(&body);
        Self {
            source_id: source_id.to_string(),
            url: url.to_string(),
            body,
            content_hash,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    Remote,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },
    #[error("http status {status} for {url}")]
    Remote { status: u16, url: String },
    #[error("reading response body from {url}: {message}")]
    Body { url: String, message: String },
}

impl FetchError {
    /// Timeouts, refused connections and truncated bodies are transient; a
    /// non-2xx answer means the remote side rejected us.
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network { .. } | FetchError::Body { .. } => FetchErrorKind::Network,
            FetchError::Remote { .. } => FetchErrorKind::Remote,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub fn classify_status(status: StatusCode, url: &str) -> Result<(), FetchError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(FetchError::Remote {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error, url: &str) -> FetchError {
    if let Some(status) = err.status() {
        return FetchError::Remote {
            status: status.as_u16(),
            url: url.to_string(),
        };
    }
    let message = if err.is_timeout() {
        format!("timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    };
    FetchError::Network {
        url: url.to_string(),
        message,
    }
}

/// Retrieves one payload. Implementations never retry; the scheduler decides
/// what happens after a failure.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, source_id: &str, url: &str) -> Result<FetchResult, FetchError>;
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
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, source_id: &str, url: &str) -> Result<FetchResult, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| classify_reqwest_error(&err, url))?;
            classify_status(resp.status(), url)?;
            let body = resp.bytes().await.map_err(|err| FetchError::Body {
                url: url.to_string(),
                message: err.to_string(),
            })?;
            Ok(FetchResult::new(source_id, url, body.to_vec()))
        }
        .instrument(span)
        .await
    }
}

/// Outcome of comparing a payload against the last committed digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintCheck {
    pub changed: bool,
    pub hash: String,
}

/// Last committed payload digest per source, persisted as a small JSON file.
///
/// A digest is only committed after the data it describes has been written,
/// so a crash in between means the payload is processed again on restart.
#[derive(Debug)]
pub struct FingerprintCache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FingerprintCache {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Loads the persisted digests. A missing file is an empty cache; an
    /// unreadable one is discarded with a warning.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking fingerprint file {}", path.display()))?
        {
            return Ok(Self::empty(path));
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading fingerprint file {}", path.display()))?;
        match serde_json::from_str::<BTreeMap<String, String>>(&text) {
            Ok(entries) => Ok(Self { path, entries }),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "discarding unreadable fingerprint file");
                Ok(Self::empty(path))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, source_id: &str) -> Option<&str> {
        self.entries.get(source_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn should_process(&self, source_id: &str, payload: &[u8]) -> FingerprintCheck {
        let hash = sha256_hex(payload);
        let changed = self.get(source_id) != Some(hash.as_str());
        FingerprintCheck { changed, hash }
    }

    /// Durably replaces the digest for `source_id`. The in-memory entry only
    /// moves once the file is on disk.
    pub async fn commit(&mut self, source_id: &str, hash: &str) -> anyhow::Result<()> {
        let mut next = self.entries.clone();
        next.insert(source_id.to_string(), hash.to_string());
        let bytes = serde_json::to_vec_pretty(&next).context("serializing fingerprints")?;
        write_atomically(&self.path, &bytes).await?;
        self.entries = next;
        Ok(())
    }
}

/// Writes via a uniquely named temp file in the target directory, then renames over the target.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating fingerprint directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp fingerprint file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp fingerprint file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp fingerprint file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp fingerprint {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
