use super::*;
use cells_core::MIME_FOLDER;

fn account() -> StateId {
    StateId::new("alice", "https://cells.local")
}

fn remote(path: &str, folder: bool, mtime: i64, etag: Option<&str>) -> Node {
    Node {
        uuid: format!("uuid-{path}"),
        path: path.to_string(),
        mime: if folder {
            MIME_FOLDER.to_string()
        } else {
            "text/plain".to_string()
        },
        etag: etag.map(str::to_string),
        size: 10,
        mtime,
        has_thumb: false,
        pre_viewable: false,
        bookmarked: false,
        shared: false,
    }
}

fn local_file(node: &TreeNode, file_type: LocalFileType) -> LocalFile {
    LocalFile {
        encoded_state: node.encoded_state.clone(),
        file_type,
        account_id: node.account_id.clone(),
        path: node.path.clone(),
        local_path: format!("/cache{}", node.path),
        etag: node.etag.clone(),
        size: node.size,
        remote_mod_ts: node.remote_mod_ts,
        local_mod_ts: 1,
    }
}

async fn make_index() -> NodeIndex {
    let db = Database::in_memory().await.unwrap();
    NodeIndex::new(&db)
}

#[test]
fn tree_node_from_remote_derives_location() {
    let mut node = remote("/ws/docs/Report.pdf", false, 5, Some("e1"));
    node.bookmarked = true;
    node.has_thumb = true;
    let tree = TreeNode::from_remote(&account(), &node, 100);

    assert_eq!(tree.workspace, "ws");
    assert_eq!(tree.parent_path, "/ws/docs");
    assert_eq!(tree.name, "Report.pdf");
    assert_eq!(tree.sort_name, "5_report.pdf");
    assert!(tree.has_flag(FLAG_BOOKMARK));
    assert!(tree.has_flag(FLAG_HAS_THUMB));
    assert!(!tree.has_flag(FLAG_SHARE));
    assert_eq!(tree.encoded_state, account().with_path("/ws/docs/Report.pdf").id());
}

#[test]
fn content_equality_honours_legacy_servers() {
    let a = TreeNode::from_remote(&account(), &remote("/ws/a", false, 5, Some("e1")), 1);
    let b = TreeNode::from_remote(&account(), &remote("/ws/a", false, 5, Some("e2")), 2);
    let no_etag = TreeNode::from_remote(&account(), &remote("/ws/a", false, 5, None), 2);

    assert!(!a.is_same_content(&b, false));
    assert!(a.is_same_content(&b, true));
    assert!(no_etag.is_same_content(&no_etag, false));
    assert!(!a.is_same_content(&no_etag, false));
    assert!(a.is_same_content(&a, false));
}

#[test]
fn offline_flag_survives_refresh() {
    let mut previous = TreeNode::from_remote(&account(), &remote("/ws/a", true, 5, None), 1);
    previous.flags |= FLAG_OFFLINE;
    let mut fresh = TreeNode::from_remote(&account(), &remote("/ws/a", true, 6, None), 2);
    fresh.carry_local_flags(&previous);

    assert!(fresh.has_flag(FLAG_OFFLINE));
    assert!(fresh.same_remote_flags(&previous));
}

#[tokio::test]
async fn lists_children_by_parent() {
    let index = make_index().await;
    for path in ["/ws/docs", "/ws/docs/a.txt", "/ws/docs/b.txt", "/ws/other.txt"] {
        let node = remote(path, path == "/ws/docs", 1, Some("e"));
        index
            .upsert_node(&TreeNode::from_remote(&account(), &node, 1))
            .await
            .unwrap();
    }

    let children = index
        .list_children(&account().account_id(), "/ws/docs")
        .await
        .unwrap();
    let names: Vec<_> = children.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
}

#[tokio::test]
async fn delete_subtree_does_not_touch_siblings_with_common_prefix() {
    let index = make_index().await;
    let account_id = account().account_id();
    for path in ["/ws/docs", "/ws/docs/a.txt", "/ws/docs2", "/ws/docs2/b.txt"] {
        let node = TreeNode::from_remote(&account(), &remote(path, !path.ends_with(".txt"), 1, None), 1);
        index.upsert_node(&node).await.unwrap();
        if path.ends_with(".txt") {
            assert!(
                index
                    .record_local_file(&local_file(&node, LocalFileType::File))
                    .await
                    .unwrap()
            );
        }
    }

    let (removed, files) = index.delete_subtree(&account_id, "/ws/docs").await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "/ws/docs/a.txt");

    let left = index.list_subtree(&account_id, "/ws/docs2").await.unwrap();
    assert_eq!(left.len(), 2);
    assert_eq!(
        index
            .list_local_files_under(&account_id, "/ws")
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn set_flag_toggles_bits() {
    let index = make_index().await;
    let node = TreeNode::from_remote(&account(), &remote("/ws/docs", true, 1, None), 1);
    index.upsert_node(&node).await.unwrap();

    assert!(index.set_flag(&node.encoded_state, FLAG_OFFLINE, true).await.unwrap());
    let stored = index.get_node(&node.encoded_state).await.unwrap().unwrap();
    assert!(stored.has_flag(FLAG_OFFLINE));

    index.set_flag(&node.encoded_state, FLAG_OFFLINE, false).await.unwrap();
    let stored = index.get_node(&node.encoded_state).await.unwrap().unwrap();
    assert!(!stored.has_flag(FLAG_OFFLINE));
    assert!(!index.set_flag("missing", FLAG_OFFLINE, true).await.unwrap());
}

#[tokio::test]
async fn offline_root_upsert_uses_uuid_as_key() {
    let index = make_index().await;
    let account_id = account().account_id();
    let mut root = OfflineRoot {
        encoded_state: account().with_path("/ws/docs").id(),
        uuid: "root-uuid".into(),
        account_id: account_id.clone(),
        status: OfflineStatus::New,
        local_mod_ts: 0,
        last_check_ts: 0,
        message: None,
        sort_name: "3_docs".into(),
    };
    index.upsert_offline_root(&root).await.unwrap();

    root.encoded_state = account().with_path("/ws/renamed").id();
    root.status = OfflineStatus::Active;
    index.upsert_offline_root(&root).await.unwrap();

    let roots = index.list_offline_roots(&account_id).await.unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].encoded_state, root.encoded_state);
    assert_eq!(roots[0].status, OfflineStatus::Active);
    assert_eq!(index.list_offline_accounts().await.unwrap(), vec![account_id.clone()]);

    root.status = OfflineStatus::Lost;
    index.upsert_offline_root(&root).await.unwrap();
    assert!(index.list_offline_accounts().await.unwrap().is_empty());
}

#[test]
fn local_file_staleness() {
    let node = TreeNode::from_remote(&account(), &remote("/ws/a", false, 5, Some("e1")), 1);
    let cached = local_file(&node, LocalFileType::File);
    assert!(!cached.is_stale_for(&node, false));

    let changed = TreeNode::from_remote(&account(), &remote("/ws/a", false, 5, Some("e2")), 1);
    assert!(cached.is_stale_for(&changed, false));
    assert!(!cached.is_stale_for(&changed, true));
}

#[tokio::test]
async fn local_file_is_not_recorded_for_a_deleted_node() {
    let index = make_index().await;
    let node = TreeNode::from_remote(&account(), &remote("/ws/gone.txt", false, 1, None), 1);
    index.upsert_node(&node).await.unwrap();
    index
        .delete_subtree(&account().account_id(), "/ws/gone.txt")
        .await
        .unwrap();

    let recorded = index
        .record_local_file(&local_file(&node, LocalFileType::File))
        .await
        .unwrap();
    assert!(!recorded);
    assert!(
        index
            .get_local_file(&node.encoded_state, LocalFileType::File)
            .await
            .unwrap()
            .is_none()
    );
}
