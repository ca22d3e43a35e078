use std::sync::Arc;
use std::time::Duration;

use cells_core::ErrorCode;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::BackOffTicker;
use crate::network::NetworkMonitor;
use crate::node_service::NodeService;
use crate::state_id::StateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    Idle,
    Starting,
    Processing,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Attempts for a pull failing with an expired token, first one included.
    pub token_retry_attempts: u32,
    pub token_retry_pause: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            token_retry_attempts: 4,
            token_retry_pause: Duration::from_millis(1500),
        }
    }
}

enum PullOutcome {
    Changes(usize),
    /// Network trouble: keep polling with backoff.
    Transient(String),
    /// Anything else stops the loop until the next `watch`.
    Fatal(String),
}

struct Shared {
    nodes: NodeService,
    ticker: BackOffTicker,
    config: PollConfig,
    loading: watch::Sender<LoadingState>,
    last_error: watch::Sender<Option<String>>,
    wake: Notify,
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    watched: Option<StateId>,
    task: Option<PollTask>,
}

/// Foreground polling of the folder currently on screen.
pub struct PollService {
    shared: Arc<Shared>,
    network: NetworkMonitor,
    inner: Mutex<Inner>,
}

impl PollService {
    pub fn new(nodes: NodeService, network: NetworkMonitor) -> Self {
        Self::with_config(nodes, network, BackOffTicker::new(), PollConfig::default())
    }

    pub fn with_config(
        nodes: NodeService,
        network: NetworkMonitor,
        ticker: BackOffTicker,
        config: PollConfig,
    ) -> Self {
        let (loading, _) = watch::channel(LoadingState::Idle);
        let (last_error, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                nodes,
                ticker,
                config,
                loading,
                last_error,
                wake: Notify::new(),
            }),
            network,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn loading_state(&self) -> watch::Receiver<LoadingState> {
        self.shared.loading.subscribe()
    }

    /// Message of the last failure that paused watching, cleared on `watch`.
    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.shared.last_error.subscribe()
    }

    pub async fn watched(&self) -> Option<StateId> {
        self.inner.lock().await.watched.clone()
    }

    pub async fn is_polling(&self) -> bool {
        self.inner
            .lock()
            .await
            .task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Starts polling `state`, replacing whatever was watched before.
    pub async fn watch(&self, state: StateId) {
        let mut inner = self.inner.lock().await;
        stop_task(inner.task.take()).await;
        self.shared.ticker.reset_index();
        self.shared.last_error.send_replace(None);
        inner.watched = Some(state.clone());
        if self.network.current().is_connected() {
            inner.task = Some(self.launch(state));
        } else {
            tracing::debug!(state = %state, "network unavailable, polling deferred");
        }
    }

    /// Stops polling if `state` is the watched one.
    pub async fn pause(&self, state: &StateId) {
        let mut inner = self.inner.lock().await;
        if inner.watched.as_ref() != Some(state) {
            return;
        }
        inner.watched = None;
        stop_task(inner.task.take()).await;
        self.shared.loading.send_replace(LoadingState::Idle);
    }

    /// Cuts the current backoff sleep short and restarts from the shortest delay.
    pub fn force_refresh(&self) {
        self.shared.ticker.reset_index();
        self.shared.wake.notify_one();
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.watched = None;
        stop_task(inner.task.take()).await;
        self.shared.loading.send_replace(LoadingState::Idle);
    }

    /// Follows network status: polling is torn down while the network is
    /// unavailable and relaunched when it comes back.
    pub fn spawn_network_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut status = self.network.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = status.changed() => if changed.is_err() { break },
                }
                let current = *status.borrow_and_update();
                if current.is_connected() {
                    service.resume().await;
                } else {
                    service.suspend().await;
                }
            }
        })
    }

    async fn suspend(&self) {
        let mut inner = self.inner.lock().await;
        if inner.task.is_some() {
            tracing::info!("network lost, polling suspended");
        }
        stop_task(inner.task.take()).await;
        self.shared.loading.send_replace(LoadingState::Idle);
    }

    async fn resume(&self) {
        let mut inner = self.inner.lock().await;
        let running = inner
            .task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished());
        if running {
            return;
        }
        // Watching paused on an error stays paused until the next `watch`.
        if self.shared.last_error.borrow().is_some() {
            return;
        }
        if let Some(state) = inner.watched.clone() {
            tracing::info!(state = %state, "network back, polling resumed");
            self.shared.ticker.reset_index();
            inner.task = Some(self.launch(state));
        }
    }

    fn launch(&self, state: StateId) -> PollTask {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(Arc::clone(&self.shared), state, cancel.clone()));
        PollTask { cancel, handle }
    }
}

async fn stop_task(task: Option<PollTask>) {
    if let Some(task) = task {
        task.cancel.cancel();
        if let Err(err) = task.handle.await {
            if !err.is_cancelled() {
                tracing::error!(error = %err, "poll task panicked");
            }
        }
    }
}

async fn poll_loop(shared: Arc<Shared>, state: StateId, cancel: CancellationToken) {
    shared.loading.send_replace(LoadingState::Starting);
    loop {
        shared.loading.send_replace(LoadingState::Processing);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = pull_with_retry(&shared, &state, &cancel) => outcome,
        };
        match outcome {
            PullOutcome::Changes(changes) => {
                if changes > 0 {
                    tracing::debug!(state = %state, changes, "poll found changes");
                    shared.ticker.reset_index();
                }
            }
            PullOutcome::Transient(message) => {
                tracing::debug!(state = %state, reason = %message, "poll deferred");
            }
            PullOutcome::Fatal(message) => {
                tracing::warn!(state = %state, reason = %message, "polling paused after error");
                shared.last_error.send_replace(Some(message));
                break;
            }
        }
        shared.loading.send_replace(LoadingState::Idle);

        let delay = shared.ticker.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
    shared.loading.send_replace(LoadingState::Idle);
}

async fn pull_with_retry(shared: &Shared, state: &StateId, cancel: &CancellationToken) -> PullOutcome {
    let mut attempt = 1;
    loop {
        let err = match shared.nodes.try_pull(state).await {
            Ok(changes) => return PullOutcome::Changes(changes),
            Err(err) => err,
        };
        let code = err.code();
        if code == Some(ErrorCode::TokenExpired) && attempt < shared.config.token_retry_attempts {
            attempt += 1;
            tracing::debug!(state = %state, attempt, "token expired, retrying pull");
            tokio::select! {
                _ = cancel.cancelled() => return PullOutcome::Changes(0),
                _ = tokio::time::sleep(shared.config.token_retry_pause) => {}
            }
            continue;
        }
        let message = shared.nodes.report_error(&state.account_id(), &err).await;
        return if matches!(code, Some(ErrorCode::ConnectionFailed | ErrorCode::Timeout)) {
            PullOutcome::Transient(message)
        } else {
            PullOutcome::Fatal(message)
        };
    }
}

#[cfg(test)]
#[path = "poll_tests.rs"]
mod tests;
