use std::collections::HashMap;
use std::path::Path;

use cells_core::CellsClient;

use super::SyncError;
use super::downloader::FileDownloader;
use super::index::{FLAG_HAS_THUMB, LocalFile, LocalFileType, NodeIndex, TreeNode};
use super::paths::{local_path_for, remove_local_path};
use crate::state_id::StateId;
use crate::storage::now_unix;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiffStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl DiffStats {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Single-level reconciliation of the cached children of `base` against the
/// server listing. Recursion is the caller's business.
pub struct TreeDiff<'a> {
    base: StateId,
    client: &'a CellsClient,
    index: &'a NodeIndex,
    cache_root: &'a Path,
    downloader: Option<&'a FileDownloader>,
    page_size: u32,
}

impl<'a> TreeDiff<'a> {
    pub fn new(
        base: StateId,
        client: &'a CellsClient,
        index: &'a NodeIndex,
        cache_root: &'a Path,
    ) -> Self {
        Self {
            base,
            client,
            index,
            cache_root,
            downloader: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// With a downloader attached, missing or stale thumbnails and file
    /// contents are ordered instead of purged.
    pub fn with_downloader(mut self, downloader: &'a FileDownloader) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn compare_with_remote(&self) -> Result<DiffStats, SyncError> {
        let path = self
            .base
            .path()
            .ok_or_else(|| SyncError::NotANode(self.base.to_string()))?;
        let account = self.base.account();
        let account_id = account.account_id();
        let now = now_unix();
        let mut stats = DiffStats::default();

        let Some(remote_base) = self.client.node_info(path).await? else {
            if self.delete_subtree(&account_id, path).await? {
                stats.deleted += 1;
            }
            tracing::debug!(base = %self.base, "base node vanished remotely");
            return Ok(stats);
        };
        let remote_base = TreeNode::from_remote(&account, &remote_base, now);
        if !remote_base.is_folder() {
            let local = self.index.get_node(&remote_base.encoded_state).await?;
            self.converge(local, remote_base, &mut stats).await?;
            return Ok(stats);
        }

        let remote_children = self.client.list_folder_all(path, self.page_size).await?;
        let mut local_children: HashMap<String, TreeNode> = self
            .index
            .list_children(&account_id, path)
            .await?
            .into_iter()
            .map(|node| (node.encoded_state.clone(), node))
            .collect();

        for child in &remote_children {
            let remote = TreeNode::from_remote(&account, child, now);
            if remote.encoded_state == remote_base.encoded_state {
                continue;
            }
            let local = local_children.remove(&remote.encoded_state);
            self.converge(local, remote, &mut stats).await?;
        }

        for orphan in local_children.into_values() {
            self.delete_subtree(&account_id, &orphan.path).await?;
            stats.deleted += 1;
        }

        self.refresh_base(remote_base).await?;
        if stats.total() > 0 {
            tracing::debug!(
                base = %self.base,
                inserted = stats.inserted,
                updated = stats.updated,
                deleted = stats.deleted,
                "folder converged"
            );
        }
        Ok(stats)
    }

    async fn converge(
        &self,
        local: Option<TreeNode>,
        mut remote: TreeNode,
        stats: &mut DiffStats,
    ) -> Result<(), SyncError> {
        let legacy = self.client.is_legacy();
        match local {
            None => {
                self.index.upsert_node(&remote).await?;
                stats.inserted += 1;
                self.check_files(&remote, false).await?;
            }
            Some(local) if local.is_folder() != remote.is_folder() => {
                self.delete_subtree(&local.account_id, &local.path).await?;
                self.index.upsert_node(&remote).await?;
                stats.deleted += 1;
                stats.inserted += 1;
                self.check_files(&remote, false).await?;
            }
            Some(local) => {
                remote.carry_local_flags(&local);
                if local.is_same_content(&remote, legacy) {
                    remote.local_mod_ts = local.local_mod_ts;
                    self.index.upsert_node(&remote).await?;
                    self.check_files(&remote, false).await?;
                } else {
                    self.index.upsert_node(&remote).await?;
                    stats.updated += 1;
                    self.check_files(&remote, true).await?;
                }
            }
        }
        Ok(())
    }

    async fn check_files(&self, node: &TreeNode, changed: bool) -> Result<(), SyncError> {
        if node.is_folder() {
            return Ok(());
        }
        let legacy = self.client.is_legacy();
        match self.downloader {
            Some(downloader) => {
                if node.has_flag(FLAG_HAS_THUMB)
                    && self
                        .needs_download(node, LocalFileType::Thumb, legacy)
                        .await?
                {
                    downloader.order(&node.encoded_state, LocalFileType::Thumb);
                }
                if self.needs_download(node, LocalFileType::File, legacy).await? {
                    downloader.order(&node.encoded_state, LocalFileType::File);
                }
            }
            None if changed => {
                for cached in self.index.list_local_files(&node.encoded_state).await? {
                    if cached.file_type != LocalFileType::Transfer
                        && cached.is_stale_for(node, legacy)
                    {
                        self.index
                            .delete_local_file(&cached.encoded_state, cached.file_type)
                            .await?;
                        purge_files(std::slice::from_ref(&cached)).await;
                    }
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn needs_download(
        &self,
        node: &TreeNode,
        kind: LocalFileType,
        legacy: bool,
    ) -> Result<bool, SyncError> {
        Ok(match self.index.get_local_file(&node.encoded_state, kind).await? {
            Some(cached) => {
                cached.is_stale_for(node, legacy)
                    || !tokio::fs::try_exists(&cached.local_path)
                        .await
                        .unwrap_or(false)
            }
            None => true,
        })
    }

    async fn refresh_base(&self, mut remote_base: TreeNode) -> Result<(), SyncError> {
        if let Some(previous) = self.index.get_node(&remote_base.encoded_state).await? {
            remote_base.carry_local_flags(&previous);
            if previous.is_same_content(&remote_base, self.client.is_legacy()) {
                remote_base.local_mod_ts = previous.local_mod_ts;
            }
        }
        self.index.upsert_node(&remote_base).await?;
        Ok(())
    }

    /// Drops the subtree rooted at `path` from the index and the disk cache.
    /// Returns whether anything was known locally.
    async fn delete_subtree(&self, account_id: &str, path: &str) -> Result<bool, SyncError> {
        let (removed, files) = self.index.delete_subtree(account_id, path).await?;
        purge_files(&files).await;
        let folder_cache = local_path_for(
            self.cache_root,
            &self.base.with_path(path),
            LocalFileType::File,
        )?;
        if let Err(err) = remove_local_path(&folder_cache).await {
            tracing::warn!(path = %folder_cache.display(), error = %err, "cannot remove cached tree");
        }
        Ok(removed > 0)
    }
}

async fn purge_files(files: &[LocalFile]) {
    for file in files {
        if let Err(err) = remove_local_path(Path::new(&file.local_path)).await {
            tracing::warn!(path = %file.local_path, error = %err, "cannot remove cached file");
        }
    }
}

#[cfg(test)]
#[path = "tree_diff_tests.rs"]
mod tests;
