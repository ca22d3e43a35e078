use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Ok,
    Metered,
    Unavailable,
}

impl NetworkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkStatus::Ok => "ok",
            NetworkStatus::Metered => "metered",
            NetworkStatus::Unavailable => "unavailable",
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self, NetworkStatus::Unavailable)
    }
}

/// Current connectivity, broadcast to every long-lived loop of the daemon.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Ok)
    }
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Publishes `status`; subscribers are only woken on an actual change.
    pub fn set(&self, status: NetworkStatus) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::info!(status = status.as_str(), "network status changed");
        }
    }

    /// Periodically issues a HEAD request against `url`. Any HTTP answer means
    /// the server is reachable; a transport error means the network is down.
    pub fn spawn_probe(
        &self,
        url: String,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let http = Client::builder()
                .timeout(interval.min(Duration::from_secs(10)))
                .build()
                .unwrap_or_default();
            loop {
                let status = match http.head(&url).send().await {
                    Ok(_) => NetworkStatus::Ok,
                    Err(err) => {
                        tracing::debug!(url = %url, error = %err, "network probe failed");
                        NetworkStatus::Unavailable
                    }
                };
                monitor.set(status);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}
