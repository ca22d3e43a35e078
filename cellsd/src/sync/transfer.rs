use std::{
    env, io,
    path::{Path, PathBuf},
    sync::Arc,
    sync::atomic::{AtomicU64, Ordering},
};

use futures_util::StreamExt;
use md5::Context;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Request(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().is_some_and(|status| status.is_server_error())
            }
            _ => false,
        }
    }
}

/// Shared state between a running transfer and its observers.
#[derive(Clone, Default)]
pub struct TransferControl {
    pub cancel: CancellationToken,
    pub progress: Arc<AtomicU64>,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: read_limit("CELLS_DOWNLOAD_CONCURRENCY", 4),
            upload_concurrency: read_limit("CELLS_UPLOAD_CONCURRENCY", 2),
        }
    }
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            http: Client::new(),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Streams `href` into `target` through a `.partial` sibling that is renamed
    /// once complete. Returns the number of bytes written.
    pub async fn download(
        &self,
        href: &str,
        target: &Path,
        expected_md5: Option<&str>,
        control: Option<&TransferControl>,
    ) -> Result<u64, TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let response = self.http.get(url).send().await?.error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut md5 = Context::new();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            if control.is_some_and(|c| c.cancel.is_cancelled()) {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(TransferError::Cancelled);
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(err.into());
                }
            };
            file.write_all(&chunk).await?;
            if expected_md5.is_some() {
                md5.consume(&chunk);
            }
            written += chunk.len() as u64;
            if let Some(control) = control {
                control
                    .progress
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected_md5) = expected_md5 {
            let actual_md5 = format!("{:x}", md5.compute());
            if actual_md5 != expected_md5.to_ascii_lowercase() {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(TransferError::IntegrityMismatch {
                    expected_md5: expected_md5.to_ascii_lowercase(),
                    actual_md5,
                });
            }
        }

        tokio::fs::rename(partial, target).await?;
        Ok(written)
    }

    pub async fn upload(
        &self,
        href: &str,
        source: &Path,
        control: Option<&TransferControl>,
    ) -> Result<u64, TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let file = tokio::fs::File::open(source).await?;
        let size = file.metadata().await?.len();
        let progress = control.map(|c| Arc::clone(&c.progress));
        let stream = ReaderStream::new(file).inspect(move |chunk| {
            if let (Some(progress), Ok(chunk)) = (&progress, chunk) {
                progress.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        });
        let body = reqwest::Body::wrap_stream(stream);
        let request = self.http.put(url).body(body).send();

        let response = match control {
            Some(control) => {
                tokio::select! {
                    _ = control.cancel.cancelled() => return Err(TransferError::Cancelled),
                    response = request => response?,
                }
            }
            None => request.await?,
        };
        response.error_for_status()?;
        Ok(size)
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

/// ETags that look like an MD5 digest are used to verify downloads.
pub fn md5_from_etag(etag: Option<&str>) -> Option<&str> {
    let etag = etag?.trim_matches('"');
    (etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit())).then_some(etag)
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
