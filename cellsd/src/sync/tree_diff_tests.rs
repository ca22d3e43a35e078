use super::*;
use crate::storage::Database;
use crate::sync::index::FLAG_OFFLINE;
use cells_core::MIME_FOLDER;
use serde_json::{Value, json};
use tempfile::tempdir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn folder(path: &str) -> Value {
    json!({"uuid": format!("uuid-{path}"), "path": path, "mime": MIME_FOLDER, "mtime": 1})
}

fn file(path: &str, etag: &str, mtime: i64) -> Value {
    json!({
        "uuid": format!("uuid-{path}"),
        "path": path,
        "mime": "text/plain",
        "etag": etag,
        "size": 4,
        "mtime": mtime
    })
}

async fn serve_folder(server: &MockServer, base: &str, children: Vec<Value>) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/a/tree/stat"))
        .and(query_param("path", base))
        .respond_with(ResponseTemplate::new(200).set_body_json(folder(base)))
        .mount(server)
        .await;
    let total = children.len();
    Mock::given(method("GET"))
        .and(path("/a/tree/list"))
        .and(query_param("path", base))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"nodes": children, "total": total})),
        )
        .mount(server)
        .await;
}

struct Fixture {
    server: MockServer,
    client: CellsClient,
    index: NodeIndex,
    account: StateId,
    cache: tempfile::TempDir,
}

impl Fixture {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let client = CellsClient::new(&server.uri(), "token").unwrap();
        let db = Database::in_memory().await.unwrap();
        let account = StateId::new("alice", server.uri());
        Self {
            server,
            client,
            index: NodeIndex::new(&db),
            account,
            cache: tempdir().unwrap(),
        }
    }

    async fn diff(&self, base: &str) -> DiffStats {
        TreeDiff::new(
            self.account.with_path(base),
            &self.client,
            &self.index,
            self.cache.path(),
        )
        .compare_with_remote()
        .await
        .unwrap()
    }

    async fn children(&self, parent: &str) -> Vec<String> {
        self.index
            .list_children(&self.account.account_id(), parent)
            .await
            .unwrap()
            .into_iter()
            .map(|node| node.name)
            .collect()
    }
}

#[tokio::test]
async fn converges_children_and_counts_changes() {
    let fx = Fixture::new().await;
    serve_folder(
        &fx.server,
        "/ws/docs",
        vec![
            file("/ws/docs/a.txt", "e1", 1),
            file("/ws/docs/b.txt", "e1", 1),
            file("/ws/docs/c.txt", "e1", 1),
        ],
    )
    .await;
    let first = fx.diff("/ws/docs").await;
    assert_eq!(first.inserted, 3);

    serve_folder(
        &fx.server,
        "/ws/docs",
        vec![
            file("/ws/docs/a.txt", "e1", 1),
            file("/ws/docs/b.txt", "e1", 1),
            file("/ws/docs/d.txt", "e1", 1),
        ],
    )
    .await;
    let second = fx.diff("/ws/docs").await;

    assert_eq!(second, DiffStats { inserted: 1, updated: 0, deleted: 1 });
    assert_eq!(second.total(), 2);
    assert_eq!(fx.children("/ws/docs").await, vec!["a.txt", "b.txt", "d.txt"]);
}

#[tokio::test]
async fn second_run_without_remote_changes_is_a_no_op() {
    let fx = Fixture::new().await;
    serve_folder(
        &fx.server,
        "/ws/docs",
        vec![folder("/ws/docs/sub"), file("/ws/docs/a.txt", "e1", 1)],
    )
    .await;

    assert_eq!(fx.diff("/ws/docs").await.total(), 2);
    assert_eq!(fx.diff("/ws/docs").await.total(), 0);
}

#[tokio::test]
async fn modified_file_is_updated_and_keeps_offline_flag() {
    let fx = Fixture::new().await;
    serve_folder(&fx.server, "/ws/docs", vec![file("/ws/docs/a.txt", "e1", 1)]).await;
    fx.diff("/ws/docs").await;
    let state = fx.account.with_path("/ws/docs/a.txt").id();
    fx.index.set_flag(&state, FLAG_OFFLINE, true).await.unwrap();

    serve_folder(&fx.server, "/ws/docs", vec![file("/ws/docs/a.txt", "e2", 2)]).await;
    let stats = fx.diff("/ws/docs").await;

    assert_eq!(stats, DiffStats { inserted: 0, updated: 1, deleted: 0 });
    let stored = fx.index.get_node(&state).await.unwrap().unwrap();
    assert_eq!(stored.etag.as_deref(), Some("e2"));
    assert!(stored.has_flag(FLAG_OFFLINE));
}

#[tokio::test]
async fn stale_cached_file_is_purged_when_content_changes() {
    let fx = Fixture::new().await;
    serve_folder(&fx.server, "/ws/docs", vec![file("/ws/docs/a.txt", "e1", 1)]).await;
    fx.diff("/ws/docs").await;

    let state = fx.account.with_path("/ws/docs/a.txt");
    let node = fx.index.get_node(&state.id()).await.unwrap().unwrap();
    let cached_path = local_path_for(fx.cache.path(), &state, LocalFileType::File).unwrap();
    std::fs::create_dir_all(cached_path.parent().unwrap()).unwrap();
    std::fs::write(&cached_path, b"old!").unwrap();
    fx.index
        .record_local_file(&LocalFile {
            encoded_state: node.encoded_state.clone(),
            file_type: LocalFileType::File,
            account_id: node.account_id.clone(),
            path: node.path.clone(),
            local_path: cached_path.to_string_lossy().into_owned(),
            etag: node.etag.clone(),
            size: node.size,
            remote_mod_ts: node.remote_mod_ts,
            local_mod_ts: 1,
        })
        .await
        .unwrap();

    serve_folder(&fx.server, "/ws/docs", vec![file("/ws/docs/a.txt", "e2", 2)]).await;
    fx.diff("/ws/docs").await;

    assert!(!cached_path.exists());
    assert!(
        fx.index
            .get_local_file(&node.encoded_state, LocalFileType::File)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn folder_replaced_by_file_counts_two_changes() {
    let fx = Fixture::new().await;
    serve_folder(
        &fx.server,
        "/ws/docs",
        vec![folder("/ws/docs/x"), file("/ws/docs/keep.txt", "e", 1)],
    )
    .await;
    fx.diff("/ws/docs").await;
    serve_folder(&fx.server, "/ws/docs/x", vec![file("/ws/docs/x/inner.txt", "e", 1)]).await;
    fx.diff("/ws/docs/x").await;
    assert_eq!(fx.children("/ws/docs/x").await, vec!["inner.txt"]);

    serve_folder(
        &fx.server,
        "/ws/docs",
        vec![file("/ws/docs/x", "e", 1), file("/ws/docs/keep.txt", "e", 1)],
    )
    .await;
    let stats = fx.diff("/ws/docs").await;

    assert_eq!(stats.total(), 2);
    let replaced = fx
        .index
        .get_node(&fx.account.with_path("/ws/docs/x").id())
        .await
        .unwrap()
        .unwrap();
    assert!(!replaced.is_folder());
    assert!(fx.children("/ws/docs/x").await.is_empty());
}

#[tokio::test]
async fn vanished_base_is_removed_with_its_subtree() {
    let fx = Fixture::new().await;
    serve_folder(&fx.server, "/ws/docs", vec![file("/ws/docs/a.txt", "e", 1)]).await;
    fx.diff("/ws/docs").await;

    fx.server.reset().await;
    Mock::given(method("GET"))
        .and(path("/a/tree/stat"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&fx.server)
        .await;
    let stats = fx.diff("/ws/docs").await;

    assert_eq!(stats, DiffStats { inserted: 0, updated: 0, deleted: 1 });
    let left = fx
        .index
        .list_subtree(&fx.account.account_id(), "/ws/docs")
        .await
        .unwrap();
    assert!(left.is_empty());

    // Nothing known locally any more.
    assert_eq!(fx.diff("/ws/docs").await.total(), 0);
}

#[tokio::test]
async fn network_errors_are_propagated() {
    let client = CellsClient::new("http://127.0.0.1:9", "token").unwrap();
    let db = Database::in_memory().await.unwrap();
    let index = NodeIndex::new(&db);
    let cache = tempdir().unwrap();
    let base = StateId::new("alice", "http://127.0.0.1:9").with_path("/ws");

    let err = TreeDiff::new(base, &client, &index, cache.path())
        .compare_with_remote()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Sdk(ref sdk) if sdk.is_network_error()));
}

#[tokio::test]
async fn account_root_is_not_a_node() {
    let fx = Fixture::new().await;
    let err = TreeDiff::new(fx.account.clone(), &fx.client, &fx.index, fx.cache.path())
        .compare_with_remote()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotANode(_)));
}
