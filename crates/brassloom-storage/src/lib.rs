//! HTTP fetch + opportunities hand-off file utilities for BrassLoom.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use brassloom_core::OpportunityRecord;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "brassloom-storage";

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

/// Single-shot HTTP client. Each request blocks its caller until it completes
/// or hits the configured timeout; nothing is retried.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{source_id}: request to {url} failed: {cause}")]
    Request {
        source_id: String,
        url: String,
        #[source]
        cause: reqwest::Error,
    },
    #[error("{source_id}: http status {status} for {url}")]
    HttpStatus {
        source_id: String,
        status: u16,
        url: String,
    },
}

impl FetchError {
    pub fn source_id(&self) -> &str {
        match self {
            Self::Request { source_id, .. } | Self::HttpStatus { source_id, .. } => source_id,
        }
    }
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

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_once(source_id, url, query).instrument(span).await
    }

    async fn fetch_once(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let request_error = |cause| FetchError::Request {
            source_id: source_id.to_string(),
            url: url.to_string(),
            cause,
        };

        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                source_id: source_id.to_string(),
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await.map_err(request_error)?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("opportunities file not found: {0}")]
    Missing(PathBuf),
    #[error("reading opportunities file {path}: {cause}")]
    Io {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },
    #[error("opportunities file {path} is not a list of opportunity records: {cause}")]
    Invalid {
        path: PathBuf,
        #[source]
        cause: serde_json::Error,
    },
}

/// Write the ranked list as pretty JSON via a temp file + rename, so readers
/// never observe a half-written file.
pub async fn write_opportunities(
    path: impl AsRef<Path>,
    records: &[OpportunityRecord],
) -> anyhow::Result<()> {
    let path = path.as_ref();
    let bytes = serde_json::to_vec_pretty(records).context("serializing opportunities")?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp output file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp output file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp output file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp output {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub async fn read_opportunities(
    path: impl AsRef<Path>,
) -> Result<Vec<OpportunityRecord>, InputError> {
    let path = path.as_ref();
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(InputError::Missing(path.to_path_buf()))
        }
        Err(cause) => {
            return Err(InputError::Io {
                path: path.to_path_buf(),
                cause,
            })
        }
    };
    serde_json::from_slice(&bytes).map_err(|cause| InputError::Invalid {
        path: path.to_path_buf(),
        cause,
    })
}
