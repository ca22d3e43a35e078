use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::app_credential_service::AppCredentialService;
use crate::network::NetworkMonitor;
use crate::storage::now_unix;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub check_interval: Duration,
    /// Refresh once the token expires within this many seconds.
    pub refresh_threshold_secs: i64,
    pub wait_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(20),
            refresh_threshold_secs: 120,
            wait_timeout: Duration::from_secs(30),
        }
    }
}

struct Monitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Keeps the tokens of registered accounts alive with one monitor task per
/// account. Monitors sleep while the network is unavailable.
pub struct CredentialWatcher {
    credentials: Arc<AppCredentialService>,
    network: NetworkMonitor,
    config: WatcherConfig,
    monitors: Mutex<HashMap<String, Monitor>>,
}

impl CredentialWatcher {
    pub fn new(credentials: Arc<AppCredentialService>, network: NetworkMonitor) -> Self {
        Self::with_config(credentials, network, WatcherConfig::default())
    }

    pub fn with_config(
        credentials: Arc<AppCredentialService>,
        network: NetworkMonitor,
        config: WatcherConfig,
    ) -> Self {
        Self {
            credentials,
            network,
            config,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Starts monitoring `account_id`, replacing any previous monitor for it.
    pub async fn watch(&self, account_id: &str) {
        let mut monitors = self.monitors.lock().await;
        if let Some(previous) = monitors.remove(account_id) {
            stop(previous).await;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor_loop(
            account_id.to_string(),
            Arc::clone(&self.credentials),
            self.network.clone(),
            self.config.clone(),
            cancel.clone(),
        ));
        monitors.insert(account_id.to_string(), Monitor { cancel, handle });
        tracing::debug!(account = account_id, "credential monitor started");
    }

    pub async fn unwatch(&self, account_id: &str) {
        let previous = self.monitors.lock().await.remove(account_id);
        if let Some(previous) = previous {
            stop(previous).await;
        }
    }

    pub async fn watched(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.monitors.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn shutdown(&self) {
        let drained: Vec<Monitor> = self.monitors.lock().await.drain().map(|(_, m)| m).collect();
        for monitor in drained {
            stop(monitor).await;
        }
    }
}

async fn stop(monitor: Monitor) {
    monitor.cancel.cancel();
    if let Err(err) = monitor.handle.await {
        tracing::error!(error = %err, "credential monitor panicked");
    }
}

async fn monitor_loop(
    account_id: String,
    credentials: Arc<AppCredentialService>,
    network: NetworkMonitor,
    config: WatcherConfig,
    cancel: CancellationToken,
) {
    let mut status = network.subscribe();
    loop {
        while !status.borrow_and_update().is_connected() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = status.changed() => if changed.is_err() { return },
            }
        }

        if check_once(&account_id, &credentials, &config).await == Flow::Stop {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(config.check_interval) => {}
            changed = status.changed() => if changed.is_err() { return },
        }
    }
}

async fn check_once(
    account_id: &str,
    credentials: &AppCredentialService,
    config: &WatcherConfig,
) -> Flow {
    let token = match credentials.get_token(account_id).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            tracing::debug!(account = account_id, "no credentials to watch");
            return Flow::Continue;
        }
        Err(err) => {
            tracing::warn!(account = account_id, error = %err, "cannot read token");
            return Flow::Continue;
        }
    };
    if !token.expires_within(now_unix(), config.refresh_threshold_secs) {
        return Flow::Continue;
    }

    match tokio::time::timeout(config.wait_timeout, credentials.refresh_token(account_id)).await {
        Ok(Ok(outcome)) => {
            tracing::debug!(account = account_id, ?outcome, "token checked");
            Flow::Continue
        }
        Ok(Err(err)) if err.is_logout() => {
            tracing::warn!(account = account_id, error = %err, "account logged out, monitor stops");
            Flow::Stop
        }
        Ok(Err(err)) => {
            tracing::warn!(account = account_id, error = %err, "background refresh failed");
            Flow::Continue
        }
        Err(_) => {
            tracing::warn!(
                account = account_id,
                timeout_secs = config.wait_timeout.as_secs(),
                "no fresh token in time"
            );
            Flow::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialConfig;
    use crate::network::NetworkStatus;
    use crate::state_id::StateId;
    use crate::storage::{Account, AccountStore, AuthStatus, Database, Token, TokenStore};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Database, String) {
        let db = Database::in_memory().await.unwrap();
        let mut account = Account::new(&StateId::new("alice", server.uri()));
        account.auth_status = AuthStatus::Connected;
        AccountStore::new(&db).upsert(&account).await.unwrap();
        TokenStore::new(&db)
            .put(&Token {
                account_id: account.account_id.clone(),
                value: "old".into(),
                refresh_token: Some("r1".into()),
                token_type: "bearer".into(),
                scope: None,
                id_token: None,
                expires_in: 600,
                expiration_time: now_unix() + 60,
                refreshing_since_ts: 0,
            })
            .await
            .unwrap();
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new",
                "expires_in": 3600
            })))
            .mount(server)
            .await;
        (db, account.account_id)
    }

    fn watcher(db: &Database, network: NetworkMonitor) -> CredentialWatcher {
        let credentials = Arc::new(AppCredentialService::with_config(
            db,
            CredentialConfig {
                poll_interval: Duration::from_millis(10),
                ..CredentialConfig::default()
            },
        ));
        CredentialWatcher::with_config(
            credentials,
            network,
            WatcherConfig {
                check_interval: Duration::from_millis(20),
                ..WatcherConfig::default()
            },
        )
    }

    async fn wait_for_value(db: &Database, account_id: &str, value: &str) -> bool {
        for _ in 0..100 {
            let token = TokenStore::new(db).get(account_id).await.unwrap();
            if token.is_some_and(|t| t.value == value) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn refreshes_token_close_to_expiry() {
        let server = MockServer::start().await;
        let (db, account_id) = setup(&server).await;
        let watcher = watcher(&db, NetworkMonitor::default());

        watcher.watch(&account_id).await;
        assert!(wait_for_value(&db, &account_id, "new").await);
        watcher.shutdown().await;
        assert!(watcher.watched().await.is_empty());
    }

    #[tokio::test]
    async fn waits_for_network_before_refreshing() {
        let server = MockServer::start().await;
        let (db, account_id) = setup(&server).await;
        let network = NetworkMonitor::new(NetworkStatus::Unavailable);
        let watcher = watcher(&db, network.clone());

        watcher.watch(&account_id).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let token = TokenStore::new(&db).get(&account_id).await.unwrap().unwrap();
        assert_eq!(token.value, "old");

        network.set(NetworkStatus::Ok);
        assert!(wait_for_value(&db, &account_id, "new").await);
        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn watching_twice_keeps_a_single_monitor() {
        let server = MockServer::start().await;
        let (db, account_id) = setup(&server).await;
        let watcher = watcher(&db, NetworkMonitor::default());

        watcher.watch(&account_id).await;
        watcher.watch(&account_id).await;
        assert_eq!(watcher.watched().await, vec![account_id.clone()]);
        watcher.unwatch(&account_id).await;
        assert!(watcher.watched().await.is_empty());
    }
}
