use super::*;
use crate::network::NetworkStatus;
use crate::storage::{Account, AccountStore, AuthStatus, Database, Token, TokenStore};
use crate::sync::transfer::TransferClient;
use crate::sync::transfers::TransferService;
use cells_core::MIME_FOLDER;
use serde_json::json;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    server: MockServer,
    state: StateId,
    network: NetworkMonitor,
    service: Arc<PollService>,
    _cache: TempDir,
}

impl Fixture {
    async fn new(schedule_ms: &[u64]) -> Self {
        let server = MockServer::start().await;
        let db = Database::in_memory().await.unwrap();
        let account = StateId::new("alice", server.uri());
        let mut row = Account::new(&account);
        row.auth_status = AuthStatus::Connected;
        AccountStore::new(&db).upsert(&row).await.unwrap();
        TokenStore::new(&db)
            .put(&Token {
                account_id: account.account_id(),
                value: "token".into(),
                refresh_token: None,
                token_type: "bearer".into(),
                scope: None,
                id_token: None,
                expires_in: 0,
                expiration_time: 0,
                refreshing_since_ts: 0,
            })
            .await
            .unwrap();
        let cache = tempdir().unwrap();
        let nodes = NodeService::new(
            &db,
            TransferService::new(&db, TransferClient::new()),
            cache.path().to_path_buf(),
        );
        let network = NetworkMonitor::new(NetworkStatus::Ok);
        let ticker = BackOffTicker::with_schedule(
            schedule_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        );
        let service = PollService::with_config(
            nodes,
            network.clone(),
            ticker,
            PollConfig {
                token_retry_attempts: 4,
                token_retry_pause: Duration::from_millis(10),
            },
        );
        Self {
            server,
            state: account.with_path("/ws"),
            network,
            service: Arc::new(service),
            _cache: cache,
        }
    }

    async fn serve_folder(&self) {
        Mock::given(method("GET"))
            .and(path("/a/tree/stat"))
            .and(query_param("path", "/ws"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uuid": "ws", "path": "/ws", "mime": MIME_FOLDER
            })))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a/tree/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nodes": [{"uuid": "a", "path": "/ws/a.txt", "etag": "e", "mtime": 1}],
                "total": 1
            })))
            .mount(&self.server)
            .await;
    }

    async fn hits(&self, endpoint: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == endpoint)
            .count()
    }

    async fn wait_for_hits(&self, endpoint: &str, at_least: usize) {
        for _ in 0..200 {
            if self.hits(endpoint).await >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{endpoint} was called fewer than {at_least} times");
    }
}

#[tokio::test]
async fn watching_polls_until_paused() {
    let fx = Fixture::new(&[10]).await;
    fx.serve_folder().await;

    fx.service.watch(fx.state.clone()).await;
    fx.wait_for_hits("/a/tree/list", 3).await;
    assert!(fx.service.is_polling().await);

    fx.service.pause(&fx.state).await;
    assert!(!fx.service.is_polling().await);
    assert_eq!(fx.service.watched().await, None);
    assert_eq!(*fx.service.loading_state().borrow(), LoadingState::Idle);

    let settled = fx.hits("/a/tree/list").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.hits("/a/tree/list").await, settled);
}

#[tokio::test]
async fn pausing_another_folder_keeps_polling() {
    let fx = Fixture::new(&[10]).await;
    fx.serve_folder().await;

    fx.service.watch(fx.state.clone()).await;
    fx.service.pause(&fx.state.with_path("/other")).await;

    assert_eq!(fx.service.watched().await, Some(fx.state.clone()));
    assert!(fx.service.is_polling().await);
    fx.service.shutdown().await;
}

#[tokio::test]
async fn force_refresh_cuts_the_sleep_short() {
    let fx = Fixture::new(&[60_000]).await;
    fx.serve_folder().await;

    fx.service.watch(fx.state.clone()).await;
    fx.wait_for_hits("/a/tree/list", 1).await;
    fx.service.force_refresh();
    fx.wait_for_hits("/a/tree/list", 2).await;
    fx.service.shutdown().await;
}

#[tokio::test]
async fn expired_token_is_retried_before_reporting() {
    let fx = Fixture::new(&[60_000]).await;
    Mock::given(method("GET"))
        .and(path("/a/tree/stat"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .up_to_n_times(2)
        .mount(&fx.server)
        .await;
    fx.serve_folder().await;

    fx.service.watch(fx.state.clone()).await;
    fx.wait_for_hits("/a/tree/list", 1).await;

    assert_eq!(fx.hits("/a/tree/stat").await, 3);
    assert_eq!(*fx.service.last_error().borrow(), None);
    assert!(fx.service.is_polling().await);
    fx.service.shutdown().await;
}

#[tokio::test]
async fn remote_error_pauses_watching() {
    let fx = Fixture::new(&[10]).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&fx.server)
        .await;

    let mut errors = fx.service.last_error();
    fx.service.watch(fx.state.clone()).await;
    let message = tokio::time::timeout(
        Duration::from_secs(2),
        errors.wait_for(|message| message.is_some()),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();

    assert!(message.unwrap().contains("forbidden"));
    for _ in 0..100 {
        if !fx.service.is_polling().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!fx.service.is_polling().await);
    assert_eq!(fx.hits("/a/tree/stat").await, 1);
}

#[tokio::test]
async fn network_loss_suspends_and_reconnect_resumes() {
    let fx = Fixture::new(&[10]).await;
    fx.serve_folder().await;
    let cancel = CancellationToken::new();
    let listener = fx.service.spawn_network_listener(cancel.clone());

    fx.service.watch(fx.state.clone()).await;
    fx.wait_for_hits("/a/tree/list", 1).await;

    fx.network.set(NetworkStatus::Unavailable);
    for _ in 0..100 {
        if !fx.service.is_polling().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!fx.service.is_polling().await);
    assert_eq!(fx.service.watched().await, Some(fx.state.clone()));

    let suspended = fx.hits("/a/tree/list").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.hits("/a/tree/list").await, suspended);

    fx.network.set(NetworkStatus::Ok);
    fx.wait_for_hits("/a/tree/list", suspended + 1).await;

    cancel.cancel();
    listener.await.unwrap();
    fx.service.shutdown().await;
}

#[tokio::test]
async fn watch_while_offline_waits_for_network() {
    let fx = Fixture::new(&[10]).await;
    fx.serve_folder().await;
    fx.network.set(NetworkStatus::Unavailable);
    let cancel = CancellationToken::new();
    let _listener = fx.service.spawn_network_listener(cancel.clone());

    fx.service.watch(fx.state.clone()).await;
    assert!(!fx.service.is_polling().await);

    fx.network.set(NetworkStatus::Ok);
    fx.wait_for_hits("/a/tree/list", 1).await;
    cancel.cancel();
    fx.service.shutdown().await;
}

#[tokio::test]
async fn reconnect_does_not_revive_a_paused_error() {
    let fx = Fixture::new(&[10]).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&fx.server)
        .await;
    let cancel = CancellationToken::new();
    let listener = fx.service.spawn_network_listener(cancel.clone());

    let mut errors = fx.service.last_error();
    fx.service.watch(fx.state.clone()).await;
    tokio::time::timeout(
        Duration::from_secs(2),
        errors.wait_for(|message| message.is_some()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(fx.hits("/a/tree/stat").await, 1);

    fx.network.set(NetworkStatus::Unavailable);
    tokio::time::sleep(Duration::from_millis(30)).await;
    fx.network.set(NetworkStatus::Ok);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(fx.hits("/a/tree/stat").await, 1);
    assert!(!fx.service.is_polling().await);
    assert!(fx.service.last_error().borrow().is_some());

    cancel.cancel();
    listener.await.unwrap();
}
