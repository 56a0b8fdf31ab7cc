//! Model archive download over HTTP
//!
//! Streams response bodies to a temporary file next to the destination and
//! renames it into place once complete, so an interrupted transfer never
//! leaves a truncated archive at the destination path.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Fetches a remote resource to a local file
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `url` to `destination`.
    ///
    /// With `overwrite` false an existing destination is left untouched and
    /// no request is made.
    async fn download(&self, url: &str, destination: &Path, overwrite: bool) -> StoreResult<()>;
}

/// HTTP(S) downloader backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    retries: u32,
    retry_delay: Duration,
}

impl HttpDownloader {
    /// Create a downloader with the given stall timeout and retry budget.
    ///
    /// `stall_timeout` bounds connecting and each wait for the next body
    /// chunk, not the whole transfer, so a slow but steady download of a
    /// large archive runs to completion.
    pub fn new(stall_timeout: Duration, retries: u32) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(stall_timeout)
            .read_timeout(stall_timeout)
            .user_agent(concat!("gluon-model-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            retries,
            retry_delay: Duration::from_secs(1),
        })
    }

    /// Override the base delay between attempts (grows linearly per attempt)
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn fetch_once(&self, url: &str, destination: &Path) -> StoreResult<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StoreError::download(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::download(url, format!("HTTP status {}", status)));
        }

        let parent = destination.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(parent)
            .map_err(|e| StoreError::io(parent, e))?;
        let std_file = tmp.reopen().map_err(|e| StoreError::io(tmp.path(), e))?;
        let mut file = tokio::fs::File::from_std(std_file);

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StoreError::download(url, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| StoreError::io(tmp.path(), e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| StoreError::io(tmp.path(), e))?;
        drop(file);

        tmp.persist(destination)
            .map_err(|e| StoreError::io(destination, e.error))?;
        Ok(written)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, destination: &Path, overwrite: bool) -> StoreResult<()> {
        let exists = tokio::fs::try_exists(destination)
            .await
            .map_err(|e| StoreError::io(destination, e))?;
        if !overwrite && exists {
            tracing::debug!(url = %url, destination = ?destination, "Destination exists, skipping download");
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            tracing::info!(url = %url, destination = ?destination, attempt, "Downloading");
            match self.fetch_once(url, destination).await {
                Ok(bytes) => {
                    tracing::debug!(url = %url, bytes, "Download complete");
                    return Ok(());
                }
                Err(e @ StoreError::Io { .. }) => return Err(e),
                Err(e) if attempt >= self.retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        url = %url,
                        error = %e,
                        remaining = self.retries - attempt + 1,
                        "Download failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
            }
        }
    }
}
