use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;

use super::backoff::Backoff;
use super::transfer::{TransferClient, TransferControl, TransferError};
use crate::jobs::JobStatus;
use crate::storage::{Database, StoreError, now_unix};

const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum TransferServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("transfer #{0} not found")]
    NotFound(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Upload,
    Download,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Upload => "upload",
            TransferKind::Download => "download",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "upload" => Ok(TransferKind::Upload),
            "download" => Ok(TransferKind::Download),
            other => Err(StoreError::invalid("transfer kind", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub transfer_id: i64,
    pub external_id: i64,
    pub encoded_state: String,
    pub local_path: String,
    pub kind: TransferKind,
    pub byte_size: i64,
    pub progress: i64,
    pub status: JobStatus,
    pub error: Option<String>,
    pub creation_ts: i64,
    pub start_ts: i64,
    pub update_ts: i64,
    pub done_ts: i64,
}

/// Persisted uploads and downloads with byte progress and cooperative cancellation.
#[derive(Clone)]
pub struct TransferService {
    pool: SqlitePool,
    client: TransferClient,
    backoff: Backoff,
    max_attempts: u32,
    watch_interval: Duration,
}

impl TransferService {
    pub fn new(db: &Database, client: TransferClient) -> Self {
        Self {
            pool: db.pool().clone(),
            client,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(8), true),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            watch_interval: DEFAULT_WATCH_INTERVAL,
        }
    }

    pub fn with_retry(mut self, backoff: Backoff, max_attempts: u32) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    pub fn client(&self) -> &TransferClient {
        &self.client
    }

    pub async fn create(
        &self,
        encoded_state: &str,
        local_path: &Path,
        kind: TransferKind,
        byte_size: i64,
        external_id: Option<i64>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO transfers (external_id, encoded_state, local_path, kind, byte_size, status, creation_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(external_id.unwrap_or(-1))
        .bind(encoded_state)
        .bind(local_path.to_string_lossy().as_ref())
        .bind(kind.as_str())
        .bind(byte_size)
        .bind(JobStatus::New.as_str())
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, transfer_id: i64) -> Result<Option<Transfer>, StoreError> {
        let row = sqlx::query(&format!("{TRANSFER_COLUMNS} WHERE transfer_id = ?1"))
            .bind(transfer_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| transfer_from_row(&row)).transpose()
    }

    pub async fn request_cancel(&self, transfer_id: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO transfer_cancellations (transfer_id, ts) VALUES (?1, ?2)")
            .bind(transfer_id)
            .bind(now_unix())
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "UPDATE transfers SET status = ?1 WHERE transfer_id = ?2 AND status IN ('new', 'processing')",
        )
        .bind(JobStatus::Cancelling.as_str())
        .bind(transfer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_cancel_requested(&self, transfer_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT transfer_id FROM transfer_cancellations WHERE transfer_id = ?1")
            .bind(transfer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Runs a persisted download. Retryable failures are retried with jittered
    /// exponential backoff.
    pub async fn run_download(
        &self,
        transfer_id: i64,
        href: &str,
        expected_md5: Option<&str>,
    ) -> Result<u64, TransferServiceError> {
        let transfer = self
            .get(transfer_id)
            .await?
            .ok_or(TransferServiceError::NotFound(transfer_id))?;
        let target = std::path::PathBuf::from(&transfer.local_path);
        self.run(transfer_id, |control| {
            let target = target.clone();
            let client = self.client.clone();
            async move {
                control.progress.store(0, std::sync::atomic::Ordering::Relaxed);
                client
                    .download(href, &target, expected_md5, Some(&control))
                    .await
            }
        })
        .await
    }

    pub async fn run_upload(&self, transfer_id: i64, href: &str) -> Result<u64, TransferServiceError> {
        let transfer = self
            .get(transfer_id)
            .await?
            .ok_or(TransferServiceError::NotFound(transfer_id))?;
        let source = std::path::PathBuf::from(&transfer.local_path);
        self.run(transfer_id, |control| {
            let source = source.clone();
            let client = self.client.clone();
            async move {
                control.progress.store(0, std::sync::atomic::Ordering::Relaxed);
                client.upload(href, &source, Some(&control)).await
            }
        })
        .await
    }

    async fn run<F, Fut>(&self, transfer_id: i64, attempt_fn: F) -> Result<u64, TransferServiceError>
    where
        F: Fn(TransferControl) -> Fut,
        Fut: std::future::Future<Output = Result<u64, TransferError>>,
    {
        self.mark_started(transfer_id).await?;
        let control = TransferControl::new();
        let watcher = self.spawn_watcher(transfer_id, control.clone());

        let mut attempt = 0u32;
        let outcome = loop {
            match attempt_fn(control.clone()).await {
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(transfer_id, attempt, error = %err, ?delay, "transfer failed, retrying");
                    attempt += 1;
                    tokio::select! {
                        _ = control.cancel.cancelled() => break Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => break other,
            }
        };

        watcher.abort();
        let _ = watcher.await;
        self.persist_progress(transfer_id, control.bytes() as i64).await?;

        match outcome {
            Ok(bytes) => {
                self.finish(transfer_id, JobStatus::Done, None).await?;
                Ok(bytes)
            }
            Err(TransferError::Cancelled) => {
                self.finish(transfer_id, JobStatus::Cancelled, None).await?;
                Err(TransferError::Cancelled.into())
            }
            Err(err) => {
                self.finish(transfer_id, JobStatus::Error, Some(&err.to_string()))
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Polls the cancellation table and flushes byte progress while the transfer runs.
    fn spawn_watcher(
        &self,
        transfer_id: i64,
        control: TransferControl,
    ) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut last = 0u64;
            loop {
                tokio::time::sleep(service.watch_interval).await;
                match service.is_cancel_requested(transfer_id).await {
                    Ok(true) => {
                        control.cancel.cancel();
                        return;
                    }
                    Ok(false) => {}
                    Err(err) => tracing::warn!(transfer_id, error = %err, "cannot read cancellation"),
                }
                let bytes = control.bytes();
                if bytes != last {
                    last = bytes;
                    if let Err(err) = service.persist_progress(transfer_id, bytes as i64).await {
                        tracing::warn!(transfer_id, error = %err, "cannot persist progress");
                    }
                }
            }
        })
    }

    async fn mark_started(&self, transfer_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE transfers SET status = ?1, start_ts = ?2, update_ts = ?2 WHERE transfer_id = ?3")
            .bind(JobStatus::Processing.as_str())
            .bind(now_unix())
            .bind(transfer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn persist_progress(&self, transfer_id: i64, bytes: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE transfers SET progress = ?1, update_ts = ?2 WHERE transfer_id = ?3")
            .bind(bytes)
            .bind(now_unix())
            .bind(transfer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        transfer_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = now_unix();
        sqlx::query(
            "UPDATE transfers SET status = ?1, error = ?2, done_ts = ?3, update_ts = ?3 WHERE transfer_id = ?4",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(transfer_id)
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM transfer_cancellations WHERE transfer_id = ?1")
            .bind(transfer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_terminated(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM transfers WHERE status IN ('cancelled', 'done', 'warning', 'error', 'timeout')",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

const TRANSFER_COLUMNS: &str = "SELECT transfer_id, external_id, encoded_state, local_path, kind, byte_size, progress, status, error, creation_ts, start_ts, update_ts, done_ts FROM transfers";

fn transfer_from_row(row: &SqliteRow) -> Result<Transfer, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(Transfer {
        transfer_id: row.try_get("transfer_id")?,
        external_id: row.try_get("external_id")?,
        encoded_state: row.try_get("encoded_state")?,
        local_path: row.try_get("local_path")?,
        kind: TransferKind::parse(&kind)?,
        byte_size: row.try_get("byte_size")?,
        progress: row.try_get("progress")?,
        status: JobStatus::parse(&status)?,
        error: row.try_get("error")?,
        creation_ts: row.try_get("creation_ts")?,
        start_ts: row.try_get("start_ts")?,
        update_ts: row.try_get("update_ts")?,
        done_ts: row.try_get("done_ts")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn make_service() -> TransferService {
        let db = Database::in_memory().await.unwrap();
        TransferService::new(&db, TransferClient::new())
            .with_retry(
                Backoff::new(Duration::from_millis(1), Duration::from_millis(2), false),
                3,
            )
            .with_watch_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn download_completes_and_records_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789"))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let target = dir.path().join("f.bin");
        let service = make_service().await;
        let id = service
            .create("state", &target, TransferKind::Download, 10, None)
            .await
            .unwrap();

        let bytes = service
            .run_download(id, &format!("{}/f", server.uri()), None)
            .await
            .unwrap();

        assert_eq!(bytes, 10);
        let transfer = service.get(id).await.unwrap().unwrap();
        assert_eq!(transfer.status, JobStatus::Done);
        assert_eq!(transfer.progress, 10);
        assert!(transfer.done_ts > 0);
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let service = make_service().await;
        let id = service
            .create("state", &dir.path().join("f"), TransferKind::Download, 0, None)
            .await
            .unwrap();

        let err = service
            .run_download(id, &format!("{}/f", server.uri()), None)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferServiceError::Transfer(_)));
        let transfer = service.get(id).await.unwrap().unwrap();
        assert_eq!(transfer.status, JobStatus::Error);
        assert!(transfer.error.is_some());
    }

    #[tokio::test]
    async fn cancellation_row_stops_a_slow_transfer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(503).set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let service = make_service()
            .await
            .with_retry(Backoff::new(Duration::from_secs(5), Duration::from_secs(5), false), 5);
        let id = service
            .create("state", &dir.path().join("slow"), TransferKind::Download, 0, None)
            .await
            .unwrap();
        service.request_cancel(id).await.unwrap();

        let err = service
            .run_download(id, &format!("{}/slow", server.uri()), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferServiceError::Transfer(TransferError::Cancelled)
        ));
        let transfer = service.get(id).await.unwrap().unwrap();
        assert_eq!(transfer.status, JobStatus::Cancelled);
        assert!(!service.is_cancel_requested(id).await.unwrap());
    }
}
