use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cells_core::OAuthToken;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::credentials::{AppCredentialService, CredentialConfig, CredentialWatcher};
use crate::jobs::{Job, JobService};
use crate::network::NetworkMonitor;
use crate::node_service::NodeService;
use crate::state_id::StateId;
use crate::storage::{Account, AccountStore, Database, default_data_dir, now_unix};
use crate::sync::offline::{OfflineError, OfflineService};
use crate::sync::poll::PollService;
use crate::sync::transfer::{TransferClient, TransferConfig};
use crate::sync::transfers::TransferService;

const DB_FILE_NAME: &str = "cells.db";
const DEFAULT_FULL_SYNC_SECS: u64 = 3600;
const DEFAULT_NETWORK_PROBE_SECS: u64 = 30;
const DEFAULT_JOB_RETENTION_SECS: u64 = 7 * 24 * 3600;
const DAEMON_CALLER: &str = "cellsd";

/// Account registered at startup from `CELLS_SERVER_URL`, `CELLS_USERNAME`
/// and `CELLS_ACCESS_TOKEN`.
#[derive(Clone, Debug)]
pub struct AccountSeed {
    pub server_url: String,
    pub username: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub legacy: bool,
}

impl AccountSeed {
    pub fn from_env() -> Option<Self> {
        let server_url = read_string_env("CELLS_SERVER_URL")?;
        let username = read_string_env("CELLS_USERNAME")?;
        let access_token = read_string_env("CELLS_ACCESS_TOKEN")?;
        Some(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            username,
            access_token,
            refresh_token: read_string_env("CELLS_REFRESH_TOKEN"),
            expires_in: read_string_env("CELLS_TOKEN_EXPIRES_IN").and_then(|v| v.parse().ok()),
            legacy: read_bool_env("CELLS_LEGACY_SERVER", false),
        })
    }

    pub fn state_id(&self) -> StateId {
        StateId::new(self.username.clone(), self.server_url.clone())
    }

    fn grant(&self) -> OAuthToken {
        OAuthToken {
            access_token: self.access_token.clone(),
            token_type: "bearer".to_string(),
            expires_in: self.expires_in,
            refresh_token: self.refresh_token.clone(),
            scope: None,
            id_token: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub full_sync_interval: Duration,
    pub network_probe_interval: Duration,
    pub job_retention: Duration,
    pub client_id: String,
    pub transfer: TransferConfig,
    pub seed: Option<AccountSeed>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_dir = match std::env::var("CELLS_DATA_DIR") {
            Ok(value) => expand_with_home(&value, &home),
            Err(_) => default_data_dir().context("data directory is unavailable")?,
        };
        let cache_dir = std::env::var("CELLS_CACHE_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_cache_root);
        let full_sync_interval =
            Duration::from_secs(read_u64_env("CELLS_FULL_SYNC_SECS", DEFAULT_FULL_SYNC_SECS));
        let network_probe_interval = Duration::from_secs(read_u64_env(
            "CELLS_NETWORK_PROBE_SECS",
            DEFAULT_NETWORK_PROBE_SECS,
        ));
        let job_retention = Duration::from_secs(read_u64_env(
            "CELLS_JOB_RETENTION_SECS",
            DEFAULT_JOB_RETENTION_SECS,
        ));
        let client_id = read_string_env("CELLS_CLIENT_ID")
            .unwrap_or_else(|| cells_core::DEFAULT_CLIENT_ID.to_string());

        Ok(Self {
            data_dir,
            cache_dir,
            full_sync_interval,
            network_probe_interval,
            job_retention,
            client_id,
            transfer: TransferConfig::default(),
            seed: AccountSeed::from_env(),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }
}

/// Wires the services around one database and drives the background loops.
pub struct DaemonRuntime {
    config: DaemonConfig,
    db: Database,
    network: NetworkMonitor,
    jobs: JobService,
    credentials: Arc<AppCredentialService>,
    watcher: Arc<CredentialWatcher>,
    offline: Arc<OfflineService>,
    nodes: NodeService,
    poll: Arc<PollService>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.cache_dir)
            .await
            .with_context(|| format!("failed to create cache dir at {:?}", config.cache_dir))?;
        let db = Database::open(&config.db_path())
            .await
            .with_context(|| format!("failed to open database at {:?}", config.db_path()))?;
        let runtime = Self::with_database(config, db);
        if let Some(seed) = runtime.config.seed.clone() {
            runtime.register_account(&seed).await?;
        }
        Ok(runtime)
    }

    pub fn with_database(config: DaemonConfig, db: Database) -> Self {
        let network = NetworkMonitor::default();
        let jobs = JobService::new(&db);
        let credentials = Arc::new(AppCredentialService::with_config(
            &db,
            CredentialConfig {
                client_id: config.client_id.clone(),
                ..CredentialConfig::default()
            },
        ));
        let watcher = Arc::new(CredentialWatcher::new(
            Arc::clone(&credentials),
            network.clone(),
        ));
        let transfers = TransferService::new(&db, TransferClient::with_config(config.transfer));
        let offline = Arc::new(OfflineService::new(
            &db,
            jobs.clone(),
            Arc::clone(&credentials),
            transfers.clone(),
            config.cache_dir.clone(),
        ));
        let nodes = NodeService::new(&db, transfers, config.cache_dir.clone());
        let poll = Arc::new(PollService::new(nodes.clone(), network.clone()));
        Self {
            config,
            db,
            network,
            jobs,
            credentials,
            watcher,
            offline,
            nodes,
            poll,
        }
    }

    pub fn jobs(&self) -> &JobService {
        &self.jobs
    }

    pub fn offline(&self) -> &Arc<OfflineService> {
        &self.offline
    }

    pub fn nodes(&self) -> &NodeService {
        &self.nodes
    }

    pub fn poll(&self) -> &Arc<PollService> {
        &self.poll
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Creates or updates the account row and stores its credentials.
    pub async fn register_account(&self, seed: &AccountSeed) -> anyhow::Result<StateId> {
        let state = seed.state_id();
        let accounts = AccountStore::new(&self.db);
        let mut account = accounts
            .get(&state.account_id())
            .await?
            .unwrap_or_else(|| Account::new(&state));
        account.is_legacy = seed.legacy;
        accounts.upsert(&account).await?;
        self.credentials
            .store_token(&state.account_id(), &seed.grant())
            .await
            .with_context(|| format!("failed to store credentials for {state}"))?;
        tracing::info!(account = %state, "account registered");
        Ok(state)
    }

    pub async fn logout(&self, account_id: &str) -> anyhow::Result<()> {
        AccountStore::new(&self.db)
            .get(account_id)
            .await?
            .with_context(|| format!("unknown account {account_id}"))?;
        self.watcher.unwatch(account_id).await;
        self.credentials.logout(account_id).await?;
        tracing::info!(account = account_id, "logged out");
        Ok(())
    }

    /// Runs one full offline sync in the foreground and returns its job.
    pub async fn sync_once(&self) -> anyhow::Result<Job> {
        let job_id = self.offline.run_full_sync(DAEMON_CALLER).await?;
        self.jobs
            .get(job_id)
            .await?
            .with_context(|| format!("job {job_id} vanished"))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let accounts = AccountStore::new(&self.db).list().await?;
        tracing::info!(
            data_dir = %self.config.data_dir.display(),
            cache_dir = %self.config.cache_dir.display(),
            accounts = accounts.len(),
            "started"
        );

        let cancel = CancellationToken::new();
        for account in accounts.iter().filter(|account| account.is_connected()) {
            self.watcher.watch(&account.account_id).await;
        }
        let probe_handle = accounts.first().map(|account| {
            self.network.spawn_probe(
                account.url.clone(),
                self.config.network_probe_interval,
                cancel.clone(),
            )
        });
        let poll_listener = self.poll.spawn_network_listener(cancel.clone());

        let sync_handle = spawn_scheduler(
            Arc::clone(&self.offline),
            self.jobs.clone(),
            self.network.clone(),
            self.config.full_sync_interval,
            self.config.job_retention.as_secs() as i64,
            cancel.clone(),
        );

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        tracing::info!("shutting down");

        cancel.cancel();
        if let Some(handle) = probe_handle {
            join_quietly("network probe", handle).await;
        }
        join_quietly("poll listener", poll_listener).await;
        join_quietly("scheduled sync", sync_handle).await;
        self.poll.shutdown().await;
        self.watcher.shutdown().await;
        Ok(())
    }
}

/// Periodic full sync plus job-table cleanup. Cancelling `cancel` also
/// interrupts a sync in progress; its job is left to go stale.
fn spawn_scheduler(
    offline: Arc<OfflineService>,
    jobs: JobService,
    network: NetworkMonitor,
    interval: Duration,
    retention_secs: i64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if network.current().is_connected() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("scheduled sync interrupted");
                        break;
                    }
                    _ = run_scheduled_sync(&offline) => {}
                }
            } else {
                tracing::debug!("network unavailable, scheduled sync skipped");
            }
            match jobs.clear_terminated(now_unix() - retention_secs).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "old jobs cleared"),
                Err(err) => tracing::warn!(error = %err, "failed to clear old jobs"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

async fn run_scheduled_sync(offline: &OfflineService) {
    match offline.run_full_sync(DAEMON_CALLER).await {
        Ok(job_id) => tracing::info!(job_id, "scheduled sync finished"),
        Err(OfflineError::AlreadyRunning(label)) => {
            tracing::debug!(label, "scheduled sync skipped, already running")
        }
        Err(err) => tracing::warn!(error = %err, "scheduled sync failed"),
    }
}

async fn join_quietly(name: &str, handle: JoinHandle<()>) {
    if let Err(err) = handle.await {
        tracing::warn!(task = name, error = %err, "background task ended abnormally");
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
