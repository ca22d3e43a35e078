use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cells_core::CellsClient;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;

use super::SyncError;
use super::downloader::{DownloadContext, FileDownloader};
use super::index::{FLAG_OFFLINE, NodeIndex, OfflineRoot, OfflineStatus};
use super::transfers::TransferService;
use super::tree_diff::{DEFAULT_PAGE_SIZE, TreeDiff};
use crate::client_factory::ClientFactory;
use crate::credentials::{AppCredentialService, CredentialError};
use crate::jobs::{FULL_SYNC_TEMPLATE, JobService, JobStatus, sync_template};
use crate::state_id::{StateId, StateIdError};
use crate::storage::{AccountStore, Database, LifecycleState, StoreError, now_unix};

const TAG: &str = "offline";

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("{0} is not in the local index")]
    UnknownNode(String),
    #[error("job #{0} was cancelled")]
    Cancelled(i64),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    State(#[from] StateIdError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountSyncOutcome {
    /// Another live job already covers this account; nothing was created.
    NotStarted,
    Aborted { job_id: i64, reason: String },
    Done { job_id: i64, changes: usize },
}

#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// Pause after a token refresh before the walk starts.
    pub post_refresh_delay: Duration,
    pub page_size: u32,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            post_refresh_delay: Duration::from_secs(2),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Offline roots and the recursive walks that keep them available locally.
pub struct OfflineService {
    accounts: AccountStore,
    index: NodeIndex,
    jobs: JobService,
    clients: ClientFactory,
    credentials: Arc<AppCredentialService>,
    transfers: TransferService,
    cache_root: PathBuf,
    config: OfflineConfig,
}

impl OfflineService {
    pub fn new(
        db: &Database,
        jobs: JobService,
        credentials: Arc<AppCredentialService>,
        transfers: TransferService,
        cache_root: PathBuf,
    ) -> Self {
        Self {
            accounts: AccountStore::new(db),
            index: NodeIndex::new(db),
            jobs,
            clients: ClientFactory::new(db),
            credentials,
            transfers,
            cache_root,
            config: OfflineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OfflineConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn list_roots(&self, account_id: &str) -> Result<Vec<OfflineRoot>, OfflineError> {
        Ok(self.index.list_offline_roots(account_id).await?)
    }

    /// Marks or unmarks `state` as an offline root. Repeating a call is a no-op.
    pub async fn toggle_offline(&self, state: &StateId, enable: bool) -> Result<(), OfflineError> {
        let encoded_state = state.id();
        if !enable {
            self.index.delete_offline_root(&encoded_state).await?;
            self.index.set_flag(&encoded_state, FLAG_OFFLINE, false).await?;
            tracing::info!(state = %state, "offline root removed");
            return Ok(());
        }

        let node = self
            .index
            .get_node(&encoded_state)
            .await?
            .ok_or_else(|| OfflineError::UnknownNode(state.to_string()))?;
        let existing = self.index.get_offline_root(&encoded_state).await?;
        let root = OfflineRoot {
            encoded_state: encoded_state.clone(),
            uuid: node.uuid.clone(),
            account_id: node.account_id.clone(),
            status: existing
                .as_ref()
                .map(|root| root.status)
                .unwrap_or(OfflineStatus::New),
            local_mod_ts: existing
                .as_ref()
                .map(|root| root.local_mod_ts)
                .unwrap_or_else(now_unix),
            last_check_ts: existing.as_ref().map(|root| root.last_check_ts).unwrap_or(0),
            message: existing.and_then(|root| root.message),
            sort_name: node.sort_name.clone(),
        };
        self.index.upsert_offline_root(&root).await?;
        self.index.set_flag(&encoded_state, FLAG_OFFLINE, true).await?;
        tracing::info!(state = %state, "offline root registered");
        Ok(())
    }

    /// Syncs every account owning a live offline root. Returns the parent job id.
    pub async fn run_full_sync(&self, caller: &str) -> Result<i64, OfflineError> {
        if self
            .jobs
            .has_existing_job("full offline sync", FULL_SYNC_TEMPLATE)
            .await?
        {
            return Err(OfflineError::AlreadyRunning(FULL_SYNC_TEMPLATE.to_string()));
        }
        let account_ids = self.index.list_offline_accounts().await?;
        let job_id = self
            .jobs
            .create_and_launch(
                caller,
                FULL_SYNC_TEMPLATE,
                "Full offline sync",
                None,
                account_ids.len() as i64,
            )
            .await?;

        let mut changes = 0;
        let mut failures = 0;
        for account_id in &account_ids {
            let step_msg = match self.accounts.get(account_id).await? {
                None => format!("skipped {account_id}: unknown account"),
                Some(account) if !account.is_connected() => format!(
                    "skipped {account_id}: session is {}",
                    account.auth_status.as_str()
                ),
                Some(account) if account.lifecycle_state == LifecycleState::Paused => {
                    format!("skipped {account_id}: session is paused")
                }
                Some(_) => match self
                    .launch_account_sync(account_id, caller, Some(job_id))
                    .await
                {
                    Ok(AccountSyncOutcome::Done { changes: c, .. }) => {
                        changes += c;
                        format!("synced {account_id}: {c} change(s)")
                    }
                    Ok(AccountSyncOutcome::NotStarted) => {
                        format!("skipped {account_id}: a sync is already running")
                    }
                    Ok(AccountSyncOutcome::Aborted { reason, .. }) => {
                        failures += 1;
                        format!("sync of {account_id} aborted: {reason}")
                    }
                    Err(err) => {
                        failures += 1;
                        format!("sync of {account_id} failed: {err}")
                    }
                },
            };
            self.jobs
                .increment_progress(job_id, 1, Some(&step_msg))
                .await?;
        }

        let summary = format!(
            "{} account(s), {changes} change(s), {failures} failure(s)",
            account_ids.len()
        );
        if failures > 0 {
            self.jobs
                .update_status(job_id, JobStatus::Warning, Some(&summary))
                .await?;
        } else {
            self.jobs.done(job_id, &summary).await?;
        }
        self.jobs.i(TAG, &summary, Some(job_id)).await;
        Ok(job_id)
    }

    pub async fn launch_account_sync(
        &self,
        account_id: &str,
        caller: &str,
        parent_job_id: Option<i64>,
    ) -> Result<AccountSyncOutcome, OfflineError> {
        let template = sync_template(account_id);
        let label = format!("Sync {account_id}");
        if self.jobs.has_existing_job(&label, &template).await? {
            return Ok(AccountSyncOutcome::NotStarted);
        }
        let roots = self.index.list_offline_roots(account_id).await?;
        let job_id = self
            .jobs
            .create_and_launch(caller, &template, &label, parent_job_id, roots.len() as i64)
            .await?;

        let result = match self.prepare_credentials(account_id, job_id).await {
            Ok(()) => self.walk_roots(job_id, account_id, roots).await,
            Err(err) => Err(err),
        };
        self.finish(job_id, result).await
    }

    /// Syncs a single offline root in the background. Returns the job id.
    pub async fn launch_offline_root_sync(
        self: Arc<Self>,
        state: &StateId,
        caller: &str,
    ) -> Result<i64, OfflineError> {
        let encoded_state = state.id();
        let template = sync_template(&encoded_state);
        let label = format!("Sync {state}");
        if self.jobs.has_existing_job(&label, &template).await? {
            return Err(OfflineError::AlreadyRunning(label));
        }
        let root = self
            .index
            .get_offline_root(&encoded_state)
            .await?
            .ok_or_else(|| OfflineError::UnknownNode(state.to_string()))?;
        let job_id = self
            .jobs
            .create_and_launch(caller, &template, &label, None, 1)
            .await?;

        let service = Arc::clone(&self);
        tokio::spawn(async move {
            let account_id = root.account_id.clone();
            let result = service.walk_roots(job_id, &account_id, vec![root]).await;
            if let Err(err) = service.finish(job_id, result).await {
                tracing::error!(job_id, error = %err, "cannot record root sync outcome");
            }
        });
        Ok(job_id)
    }

    /// Depth-first walk below `state`. Returns the number of changes applied.
    pub fn sync_node_at<'a>(
        &'a self,
        state: StateId,
        client: &'a CellsClient,
        downloader: Option<&'a FileDownloader>,
    ) -> BoxFuture<'a, Result<usize, SyncError>> {
        async move {
            let mut diff = TreeDiff::new(state.clone(), client, &self.index, &self.cache_root)
                .with_page_size(self.config.page_size);
            if let Some(downloader) = downloader {
                diff = diff.with_downloader(downloader);
            }
            let mut changes = diff.compare_with_remote().await?.total();

            let Some(path) = state.path() else {
                return Ok(changes);
            };
            let account = state.account();
            let children = self.index.list_children(&account.account_id(), path).await?;
            for child in children.iter().filter(|child| child.is_folder()) {
                changes += self
                    .sync_node_at(child.state_id(&account), client, downloader)
                    .await?;
            }
            Ok(changes)
        }
        .boxed()
    }

    async fn prepare_credentials(&self, account_id: &str, job_id: i64) -> Result<(), OfflineError> {
        match self.credentials.refresh_token(account_id).await {
            Ok(outcome) => {
                tracing::debug!(account = account_id, ?outcome, "credentials ready");
                if !self.config.post_refresh_delay.is_zero() {
                    tokio::time::sleep(self.config.post_refresh_delay).await;
                }
                Ok(())
            }
            Err(err) if err.is_logout() => {
                self.credentials.logout(account_id).await?;
                self.jobs
                    .e(TAG, &format!("no valid credentials for {account_id}: {err}"), Some(job_id))
                    .await;
                Err(err.into())
            }
            Err(err) => {
                self.jobs
                    .w(TAG, &format!("token refresh failed, trying current token: {err}"), Some(job_id))
                    .await;
                Ok(())
            }
        }
    }

    async fn walk_roots(
        &self,
        job_id: i64,
        account_id: &str,
        roots: Vec<OfflineRoot>,
    ) -> Result<usize, OfflineError> {
        let client = self
            .clients
            .client_for(account_id)
            .await
            .map_err(SyncError::from)?;
        let account = StateId::from_id(account_id)?;
        let downloader = FileDownloader::spawn(DownloadContext {
            account,
            client: client.clone(),
            index: self.index.clone(),
            transfers: self.transfers.clone(),
            cache_root: self.cache_root.clone(),
        });

        let mut changes = 0;
        let mut failure = None;
        for root in roots {
            if self.jobs.is_cancel_requested(job_id).await? {
                failure = Some(OfflineError::Cancelled(job_id));
                break;
            }
            let state = StateId::from_id(&root.encoded_state)?;
            match self.sync_root(&client, &downloader, &state, root).await {
                Ok(count) => changes += count,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
            self.jobs
                .increment_progress(job_id, 1, Some(&format!("synced {state}")))
                .await?;
        }

        let summary = downloader.walking_done().await;
        if summary.failed > 0 {
            self.jobs
                .w(
                    TAG,
                    &format!("{} download(s) failed, will retry next sync", summary.failed),
                    Some(job_id),
                )
                .await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(changes),
        }
    }

    async fn sync_root(
        &self,
        client: &CellsClient,
        downloader: &FileDownloader,
        state: &StateId,
        root: OfflineRoot,
    ) -> Result<usize, OfflineError> {
        let changes = self
            .sync_node_at(state.clone(), client, Some(downloader))
            .await?;
        let now = now_unix();
        let mut updated = root;
        if self.index.get_node(&updated.encoded_state).await?.is_none() {
            updated.status = OfflineStatus::Lost;
            updated.message = Some("remote node is gone".to_string());
            tracing::warn!(root = %state, "offline root lost");
        } else {
            updated.status = OfflineStatus::Active;
            updated.message = None;
            updated.last_check_ts = now;
            if changes > 0 {
                updated.local_mod_ts = now;
            }
        }
        self.index.upsert_offline_root(&updated).await?;
        Ok(changes)
    }

    async fn finish(
        &self,
        job_id: i64,
        result: Result<usize, OfflineError>,
    ) -> Result<AccountSyncOutcome, OfflineError> {
        match result {
            Ok(changes) => {
                self.jobs
                    .done(job_id, &format!("{changes} change(s)"))
                    .await?;
                Ok(AccountSyncOutcome::Done { job_id, changes })
            }
            Err(OfflineError::Cancelled(_)) => {
                self.jobs
                    .update_status(job_id, JobStatus::Cancelled, Some("cancelled"))
                    .await?;
                Ok(AccountSyncOutcome::Aborted {
                    job_id,
                    reason: "cancelled".to_string(),
                })
            }
            Err(err) => {
                let reason = err.to_string();
                self.jobs.failed(job_id, &reason).await?;
                self.jobs.e(TAG, &reason, Some(job_id)).await;
                Ok(AccountSyncOutcome::Aborted { job_id, reason })
            }
        }
    }
}

#[cfg(test)]
#[path = "offline_tests.rs"]
mod tests;
