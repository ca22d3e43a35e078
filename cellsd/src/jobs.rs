use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::storage::{Database, StoreError, now_unix};

pub const FULL_SYNC_TEMPLATE: &str = "full-sync";
const SYNC_TEMPLATE_PREFIX: &str = "sync-";

/// Seconds without a progress update after which a running job is considered dead.
pub const DEFAULT_UPDATE_TIMEOUT_SECS: i64 = 120;
/// Seconds after start (or creation) for a job that never reported progress.
pub const DEFAULT_START_TIMEOUT_SECS: i64 = 300;

pub fn sync_template(key: &str) -> String {
    format!("{SYNC_TEMPLATE_PREFIX}{key}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Processing,
    Cancelling,
    Paused,
    Cancelled,
    Done,
    Warning,
    Error,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Processing => "processing",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Done => "done",
            JobStatus::Warning => "warning",
            JobStatus::Error => "error",
            JobStatus::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "new" => Ok(JobStatus::New),
            "processing" => Ok(JobStatus::Processing),
            "cancelling" => Ok(JobStatus::Cancelling),
            "paused" => Ok(JobStatus::Paused),
            "cancelled" => Ok(JobStatus::Cancelled),
            "done" => Ok(JobStatus::Done),
            "warning" => Ok(JobStatus::Warning),
            "error" => Ok(JobStatus::Error),
            "timeout" => Ok(JobStatus::Timeout),
            other => Err(StoreError::invalid("job status", other)),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobStatus::New | JobStatus::Processing | JobStatus::Cancelling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled
                | JobStatus::Done
                | JobStatus::Warning
                | JobStatus::Error
                | JobStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub job_id: i64,
    pub parent_id: i64,
    pub owner: String,
    pub template: String,
    pub label: String,
    pub status: JobStatus,
    pub message: Option<String>,
    pub progress: i64,
    pub progress_msg: Option<String>,
    pub total: i64,
    pub creation_ts: i64,
    pub start_ts: i64,
    pub update_ts: i64,
    pub done_ts: i64,
}

impl Job {
    /// Timestamp and limit used to decide whether a running job went stale.
    pub fn staleness_reference(&self, update_timeout: i64, start_timeout: i64) -> (i64, i64) {
        if self.update_ts > 0 {
            (self.update_ts, update_timeout)
        } else if self.start_ts > 0 {
            (self.start_ts, start_timeout)
        } else {
            (self.creation_ts, start_timeout)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(StoreError::invalid("log level", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub ts: i64,
    pub level: LogLevel,
    pub tag: String,
    pub message: String,
    pub caller_id: Option<i64>,
}

impl LogEntry {
    pub fn format_line(&self) -> String {
        let when = OffsetDateTime::from_unix_timestamp(self.ts)
            .ok()
            .and_then(|ts| ts.format(&Rfc3339).ok())
            .unwrap_or_else(|| self.ts.to_string());
        format!(
            "{when} [{}] {}: {}",
            self.level.as_str(),
            self.tag,
            self.message
        )
    }
}

/// Persists long-running operation records and their log lines.
#[derive(Clone)]
pub struct JobService {
    pool: SqlitePool,
    update_timeout: i64,
    start_timeout: i64,
}

impl JobService {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
            update_timeout: DEFAULT_UPDATE_TIMEOUT_SECS,
            start_timeout: DEFAULT_START_TIMEOUT_SECS,
        }
    }

    pub fn with_timeouts(mut self, update_timeout: i64, start_timeout: i64) -> Self {
        self.update_timeout = update_timeout;
        self.start_timeout = start_timeout;
        self
    }

    pub async fn create(
        &self,
        owner: &str,
        template: &str,
        label: &str,
        parent_id: Option<i64>,
        total: i64,
    ) -> Result<i64, StoreError> {
        self.insert(owner, template, label, parent_id, total, JobStatus::New, -1)
            .await
    }

    /// Creates the job directly in `processing` with its start time set.
    pub async fn create_and_launch(
        &self,
        owner: &str,
        template: &str,
        label: &str,
        parent_id: Option<i64>,
        total: i64,
    ) -> Result<i64, StoreError> {
        self.insert(
            owner,
            template,
            label,
            parent_id,
            total,
            JobStatus::Processing,
            now_unix(),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert(
        &self,
        owner: &str,
        template: &str,
        label: &str,
        parent_id: Option<i64>,
        total: i64,
        status: JobStatus,
        start_ts: i64,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (parent_id, owner, template, label, status, total, creation_ts, start_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(parent_id.unwrap_or(-1))
        .bind(owner)
        .bind(template)
        .bind(label)
        .bind(status.as_str())
        .bind(total)
        .bind(now_unix())
        .bind(start_ts)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("{JOB_COLUMNS} WHERE job_id = ?1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    pub async fn increment_progress(
        &self,
        job_id: i64,
        step: i64,
        progress_msg: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE jobs SET progress = progress + ?1, progress_msg = COALESCE(?2, progress_msg), update_ts = ?3
             WHERE job_id = ?4",
        )
        .bind(step)
        .bind(progress_msg)
        .bind(now_unix())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        job_id: i64,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let done_ts = if status.is_terminal() { now_unix() } else { -1 };
        sqlx::query(
            "UPDATE jobs SET status = ?1, message = COALESCE(?2, message), done_ts = ?3, update_ts = ?4
             WHERE job_id = ?5",
        )
        .bind(status.as_str())
        .bind(message)
        .bind(done_ts)
        .bind(now_unix())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn done(&self, job_id: i64, message: &str) -> Result<(), StoreError> {
        let now = now_unix();
        sqlx::query(
            "UPDATE jobs SET status = ?1, message = ?2, progress = CASE WHEN total > 0 THEN total ELSE progress END,
                done_ts = ?3, update_ts = ?3
             WHERE job_id = ?4",
        )
        .bind(JobStatus::Done.as_str())
        .bind(message)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn failed(&self, job_id: i64, message: &str) -> Result<(), StoreError> {
        self.update_status(job_id, JobStatus::Error, Some(message))
            .await
    }

    pub async fn list_running(&self, template: &str) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "{JOB_COLUMNS} WHERE template = ?1 AND status IN ('new', 'processing', 'cancelling')
             ORDER BY job_id ASC"
        ))
        .bind(template)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!("{JOB_COLUMNS} ORDER BY job_id DESC LIMIT ?1"))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn has_existing_job(&self, label: &str, template: &str) -> Result<bool, StoreError> {
        self.has_existing_job_at(label, template, now_unix()).await
    }

    /// Times out stale running jobs of `template`, then reports whether a live one remains.
    pub async fn has_existing_job_at(
        &self,
        label: &str,
        template: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        let running = self.list_running(template).await?;
        if running.is_empty() {
            return Ok(false);
        }
        for job in &running {
            let (reference, limit) = job.staleness_reference(self.update_timeout, self.start_timeout);
            if now - reference > limit {
                let message = format!(
                    "no progress for {}s, giving up on job #{}",
                    now - reference,
                    job.job_id
                );
                self.update_status(job.job_id, JobStatus::Timeout, Some(&message))
                    .await?;
                self.log(LogLevel::Warning, template, &message, Some(job.job_id))
                    .await?;
            }
        }

        let remaining = self.list_running(template).await?;
        if let Some(job) = remaining.first() {
            let message = format!(
                "could not launch {label}: job #{} ({}) is already running",
                job.job_id, job.label
            );
            self.log(LogLevel::Warning, template, &message, None).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn request_cancel(&self, job_id: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO job_cancellations (job_id, ts) VALUES (?1, ?2)")
            .bind(job_id)
            .bind(now_unix())
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE jobs SET status = ?1 WHERE job_id = ?2 AND status IN ('new', 'processing')")
            .bind(JobStatus::Cancelling.as_str())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_cancel_requested(&self, job_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT job_id FROM job_cancellations WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn clear_terminated(&self, older_than: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('cancelled', 'done', 'warning', 'error', 'timeout')
             AND done_ts > 0 AND done_ts < ?1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM job_cancellations WHERE job_id NOT IN (SELECT job_id FROM jobs)")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Persists a log line and mirrors it to tracing.
    pub async fn log(
        &self,
        level: LogLevel,
        tag: &str,
        message: &str,
        caller_id: Option<i64>,
    ) -> Result<(), StoreError> {
        match level {
            LogLevel::Debug => tracing::debug!(tag, job_id = ?caller_id, "{message}"),
            LogLevel::Info => tracing::info!(tag, job_id = ?caller_id, "{message}"),
            LogLevel::Warning => tracing::warn!(tag, job_id = ?caller_id, "{message}"),
            LogLevel::Error => tracing::error!(tag, job_id = ?caller_id, "{message}"),
        }
        sqlx::query("INSERT INTO logs (ts, level, tag, message, caller_id) VALUES (?1, ?2, ?3, ?4, ?5)")
            .bind(now_unix())
            .bind(level.as_str())
            .bind(tag)
            .bind(message)
            .bind(caller_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn i(&self, tag: &str, message: &str, caller_id: Option<i64>) {
        self.log_or_trace(LogLevel::Info, tag, message, caller_id).await;
    }

    pub async fn w(&self, tag: &str, message: &str, caller_id: Option<i64>) {
        self.log_or_trace(LogLevel::Warning, tag, message, caller_id)
            .await;
    }

    pub async fn e(&self, tag: &str, message: &str, caller_id: Option<i64>) {
        self.log_or_trace(LogLevel::Error, tag, message, caller_id).await;
    }

    async fn log_or_trace(&self, level: LogLevel, tag: &str, message: &str, caller_id: Option<i64>) {
        if let Err(err) = self.log(level, tag, message, caller_id).await {
            tracing::warn!(tag, error = %err, "failed to persist log line");
        }
    }

    pub async fn list_logs(
        &self,
        caller_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let rows = match caller_id {
            Some(id) => {
                sqlx::query(
                    "SELECT id, ts, level, tag, message, caller_id FROM logs WHERE caller_id = ?1
                     ORDER BY id DESC LIMIT ?2",
                )
                .bind(id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, ts, level, tag, message, caller_id FROM logs ORDER BY id DESC LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter()
            .map(|row| {
                let level: String = row.try_get("level")?;
                Ok(LogEntry {
                    id: row.try_get("id")?,
                    ts: row.try_get("ts")?,
                    level: LogLevel::parse(&level)?,
                    tag: row.try_get("tag")?,
                    message: row.try_get("message")?,
                    caller_id: row.try_get("caller_id")?,
                })
            })
            .collect()
    }
}

const JOB_COLUMNS: &str = "SELECT job_id, parent_id, owner, template, label, status, message, progress, progress_msg, total, creation_ts, start_ts, update_ts, done_ts FROM jobs";

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        job_id: row.try_get("job_id")?,
        parent_id: row.try_get("parent_id")?,
        owner: row.try_get("owner")?,
        template: row.try_get("template")?,
        label: row.try_get("label")?,
        status: JobStatus::parse(&status)?,
        message: row.try_get("message")?,
        progress: row.try_get("progress")?,
        progress_msg: row.try_get("progress_msg")?,
        total: row.try_get("total")?,
        creation_ts: row.try_get("creation_ts")?,
        start_ts: row.try_get("start_ts")?,
        update_ts: row.try_get("update_ts")?,
        done_ts: row.try_get("done_ts")?,
    })
}

#[cfg(test)]
#[path = "jobs_tests.rs"]
mod tests;
