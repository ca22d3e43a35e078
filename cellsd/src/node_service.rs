use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cells_core::{CellsClient, ErrorCode, MIME_WS_ROOT, Node, SdkError};

use crate::client_factory::ClientFactory;
use crate::credentials::remove_credentials;
use crate::state_id::StateId;
use crate::storage::{AccountStore, AuthStatus, Database, TokenStore, now_unix};
use crate::sync::SyncError;
use crate::sync::index::{FLAG_BOOKMARK, FLAG_SHARE, LocalFileType, NodeIndex, TreeNode};
use crate::sync::paths::{local_path_for, remove_local_path};
use crate::sync::transfers::{TransferKind, TransferService};
use crate::sync::tree_diff::TreeDiff;

/// Remote operations on a single node. The subject is the `StateId` passed
/// alongside the action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    /// Creates `name` inside the subject folder.
    Mkdir { name: String },
    Copy { target: StateId },
    Move { target: StateId },
    Rename { new_name: String },
    Delete,
    Restore,
    Bookmark(bool),
    Unshare,
}

impl NodeAction {
    pub fn name(&self) -> &'static str {
        match self {
            NodeAction::Mkdir { .. } => "mkdir",
            NodeAction::Copy { .. } => "copy",
            NodeAction::Move { .. } => "move",
            NodeAction::Rename { .. } => "rename",
            NodeAction::Delete => "delete",
            NodeAction::Restore => "restore",
            NodeAction::Bookmark(_) => "bookmark",
            NodeAction::Unshare => "unshare",
        }
    }
}

/// Service boundary for folder pulls and node actions. Failures are turned
/// into account status transitions and a user-facing message.
#[derive(Clone)]
pub struct NodeService {
    accounts: AccountStore,
    tokens: TokenStore,
    index: NodeIndex,
    clients: ClientFactory,
    transfers: TransferService,
    cache_root: PathBuf,
}

impl NodeService {
    pub fn new(db: &Database, transfers: TransferService, cache_root: PathBuf) -> Self {
        Self {
            accounts: AccountStore::new(db),
            tokens: TokenStore::new(db),
            index: NodeIndex::new(db),
            clients: ClientFactory::new(db),
            transfers,
            cache_root,
        }
    }

    pub fn index(&self) -> &NodeIndex {
        &self.index
    }

    /// Pulls one level below `state` and returns the number of changes, or a
    /// message describing the failure.
    pub async fn pull(&self, state: &StateId) -> (usize, Option<String>) {
        match self.try_pull(state).await {
            Ok(changes) => (changes, None),
            Err(err) => (0, Some(self.report_error(&state.account_id(), &err).await)),
        }
    }

    pub async fn try_pull(&self, state: &StateId) -> Result<usize, SyncError> {
        let account_id = state.account_id();
        let client = self.clients.client_for(&account_id).await?;
        let changes = if state.is_account_root() {
            self.refresh_workspace_list(state, &client).await?
        } else {
            TreeDiff::new(state.clone(), &client, &self.index, &self.cache_root)
                .compare_with_remote()
                .await?
                .total()
        };
        self.mark_reachable(&account_id).await;
        Ok(changes)
    }

    /// Mirrors the workspace list of the account as children of the account root.
    pub async fn refresh_workspace_list(
        &self,
        account: &StateId,
        client: &CellsClient,
    ) -> Result<usize, SyncError> {
        let account = account.account();
        let account_id = account.account_id();
        let now = now_unix();
        let workspaces = client.list_workspaces().await?;
        let mut known: HashMap<String, TreeNode> = self
            .index
            .list_children(&account_id, "")
            .await?
            .into_iter()
            .map(|node| (node.encoded_state.clone(), node))
            .collect();

        let mut changes = 0;
        for workspace in workspaces {
            let remote = Node {
                uuid: workspace.uuid,
                path: format!("/{}", workspace.slug),
                mime: MIME_WS_ROOT.to_string(),
                etag: None,
                size: 0,
                mtime: 0,
                has_thumb: false,
                pre_viewable: false,
                bookmarked: false,
                shared: false,
            };
            let mut fresh = TreeNode::from_remote(&account, &remote, now);
            match known.remove(&fresh.encoded_state) {
                Some(previous) if previous.uuid == fresh.uuid => {
                    fresh.carry_local_flags(&previous);
                    fresh.local_mod_ts = previous.local_mod_ts;
                }
                Some(previous) => {
                    fresh.carry_local_flags(&previous);
                    changes += 1;
                }
                None => changes += 1,
            }
            self.index.upsert_node(&fresh).await?;
        }
        for gone in known.into_values() {
            self.delete_local_subtree(&account, &gone.path).await?;
            changes += 1;
        }
        Ok(changes)
    }

    /// Runs `action` on `state`, then refreshes the affected folders.
    /// Returns a message when the action failed.
    pub async fn perform(&self, state: &StateId, action: NodeAction) -> Option<String> {
        match self.try_perform(state, &action).await {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(state = %state, action = action.name(), error = %err, "node action failed");
                Some(self.report_error(&state.account_id(), &err).await)
            }
        }
    }

    pub async fn try_perform(&self, state: &StateId, action: &NodeAction) -> Result<(), SyncError> {
        let path = state
            .path()
            .ok_or_else(|| SyncError::NotANode(state.to_string()))?;
        let client = self.clients.client_for(&state.account_id()).await?;
        let mut refresh = vec![state.parent()];
        match action {
            NodeAction::Mkdir { name } => {
                client.mkdir(&format!("{path}/{name}")).await?;
                refresh = vec![state.clone()];
            }
            NodeAction::Copy { target } => {
                client.copy(&[path.to_string()], target_path(target)?).await?;
                refresh = vec![target.clone()];
            }
            NodeAction::Move { target } => {
                client
                    .move_nodes(&[path.to_string()], target_path(target)?)
                    .await?;
                refresh.push(target.clone());
            }
            NodeAction::Rename { new_name } => {
                let to = state.parent().child(new_name);
                client.rename(path, target_path(&to)?).await?;
            }
            NodeAction::Delete => client.delete(path).await?,
            NodeAction::Restore => {
                client.restore(&[path.to_string()]).await?;
                refresh.push(state.with_path(&format!("/{}", state.workspace().unwrap_or_default())));
            }
            NodeAction::Bookmark(enabled) => {
                let uuid = self.node_uuid(state).await?;
                client.bookmark(&uuid, *enabled).await?;
                self.index
                    .set_flag(&state.id(), FLAG_BOOKMARK, *enabled)
                    .await?;
                return Ok(());
            }
            NodeAction::Unshare => {
                let uuid = self.node_uuid(state).await?;
                client.remove_share(&uuid).await?;
                self.index.set_flag(&state.id(), FLAG_SHARE, false).await?;
                return Ok(());
            }
        }

        for folder in refresh {
            if let Err(err) = self.try_pull(&folder).await {
                tracing::debug!(folder = %folder, error = %err, "refresh after action failed");
            }
        }
        Ok(())
    }

    /// Creates a public link for `state` and returns its URL.
    pub async fn share(&self, state: &StateId, label: &str) -> Result<String, SyncError> {
        let client = self.clients.client_for(&state.account_id()).await?;
        let uuid = self.node_uuid(state).await?;
        let link = client.create_share(&uuid, label).await?;
        self.index.set_flag(&state.id(), FLAG_SHARE, true).await?;
        Ok(link.link_url)
    }

    pub async fn search(
        &self,
        account: &StateId,
        query: &str,
        limit: u32,
    ) -> Result<Vec<TreeNode>, SyncError> {
        let client = self.clients.client_for(&account.account_id()).await?;
        let now = now_unix();
        let account = account.account();
        Ok(client
            .search(query, limit)
            .await?
            .iter()
            .map(|node| TreeNode::from_remote(&account, node, now))
            .collect())
    }

    /// Uploads `source` to the remote path addressed by `state`. Returns the
    /// transfer id.
    pub async fn upload(&self, state: &StateId, source: &Path) -> Result<i64, SyncError> {
        let path = state
            .path()
            .ok_or_else(|| SyncError::NotANode(state.to_string()))?;
        let size = tokio::fs::metadata(source).await?.len() as i64;
        let client = self.clients.client_for(&state.account_id()).await?;
        let link = client.get_upload_link(path, true).await?;
        let transfer_id = self
            .transfers
            .create(&state.id(), source, TransferKind::Upload, size, None)
            .await?;
        self.transfers
            .run_upload(transfer_id, link.href.as_str())
            .await?;
        if let Err(err) = self.try_pull(&state.parent()).await {
            tracing::debug!(state = %state, error = %err, "refresh after upload failed");
        }
        Ok(transfer_id)
    }

    /// Maps a failure to an account status transition and returns the message
    /// shown to the user.
    pub async fn report_error(&self, account_id: &str, err: &SyncError) -> String {
        match err {
            SyncError::Sdk(sdk) => self.handle_sdk_error(account_id, sdk).await,
            other => {
                tracing::error!(account = account_id, error = %other, "local failure");
                other.to_string()
            }
        }
    }

    pub async fn handle_sdk_error(&self, account_id: &str, err: &SdkError) -> String {
        let code = err.code();
        let transition = match code {
            ErrorCode::Unauthorized => Some((AuthStatus::Connected, AuthStatus::Unauthorized)),
            ErrorCode::NoTokenAvailable => Some((AuthStatus::Connected, AuthStatus::NoCredentials)),
            _ => None,
        };
        if code == ErrorCode::RefreshTokenExpired {
            if let Err(logout) = remove_credentials(&self.accounts, &self.tokens, account_id).await {
                tracing::error!(account = account_id, error = %logout, "cannot drop credentials");
            }
        } else if let Some((from, to)) = transition {
            match self.accounts.transition_auth_status(account_id, from, to).await {
                Ok(true) => tracing::warn!(account = account_id, status = to.as_str(), "session downgraded"),
                Ok(false) => {}
                Err(store) => tracing::error!(account = account_id, error = %store, "cannot update session"),
            }
        } else if err.is_network_error() {
            if let Err(store) = self.accounts.set_reachable(account_id, false).await {
                tracing::error!(account = account_id, error = %store, "cannot update session");
            }
            tracing::info!(account = account_id, code = %code, "server unreachable");
        } else {
            tracing::warn!(account = account_id, code = %code, error = %err, "remote call failed");
        }
        match err {
            SdkError::Coded { .. } => err.to_string(),
            _ => format!("#{code}: {err}"),
        }
    }

    async fn mark_reachable(&self, account_id: &str) {
        if let Err(err) = self.accounts.set_reachable(account_id, true).await {
            tracing::warn!(account = account_id, error = %err, "cannot update session");
        }
    }

    async fn node_uuid(&self, state: &StateId) -> Result<String, SyncError> {
        self.index
            .get_node(&state.id())
            .await?
            .map(|node| node.uuid)
            .ok_or_else(|| SyncError::NotANode(state.to_string()))
    }

    async fn delete_local_subtree(&self, account: &StateId, path: &str) -> Result<(), SyncError> {
        let (_, files) = self.index.delete_subtree(&account.account_id(), path).await?;
        for file in files {
            if let Err(err) = remove_local_path(Path::new(&file.local_path)).await {
                tracing::warn!(path = %file.local_path, error = %err, "cannot remove cached file");
            }
        }
        let folder = local_path_for(
            &self.cache_root,
            &account.with_path(path),
            LocalFileType::File,
        )?;
        remove_local_path(&folder).await?;
        Ok(())
    }
}

fn target_path(target: &StateId) -> Result<&str, SyncError> {
    target
        .path()
        .ok_or_else(|| SyncError::NotANode(target.to_string()))
}

#[cfg(test)]
#[path = "node_service_tests.rs"]
mod tests;
