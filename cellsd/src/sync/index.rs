use cells_core::{Node, NodeKind};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::state_id::StateId;
use crate::storage::{Database, StoreError};

pub const FLAG_BOOKMARK: i64 = 1;
pub const FLAG_SHARE: i64 = 2;
pub const FLAG_OFFLINE: i64 = 4;
pub const FLAG_HAS_THUMB: i64 = 8;
pub const FLAG_PRE_VIEWABLE: i64 = 16;

/// Flags that only exist locally and survive a refresh from the server.
const LOCAL_FLAGS: i64 = FLAG_OFFLINE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalFileType {
    Thumb,
    Preview,
    File,
    Transfer,
}

impl LocalFileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalFileType::Thumb => "thumb",
            LocalFileType::Preview => "preview",
            LocalFileType::File => "file",
            LocalFileType::Transfer => "transfer",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "thumb" => Ok(LocalFileType::Thumb),
            "preview" => Ok(LocalFileType::Preview),
            "file" => Ok(LocalFileType::File),
            "transfer" => Ok(LocalFileType::Transfer),
            other => Err(StoreError::invalid("local file type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineStatus {
    New,
    Active,
    Lost,
}

impl OfflineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineStatus::New => "new",
            OfflineStatus::Active => "active",
            OfflineStatus::Lost => "lost",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "new" => Ok(OfflineStatus::New),
            "active" => Ok(OfflineStatus::Active),
            "lost" => Ok(OfflineStatus::Lost),
            other => Err(StoreError::invalid("offline status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub encoded_state: String,
    pub uuid: String,
    pub account_id: String,
    pub workspace: String,
    pub path: String,
    pub parent_path: String,
    pub name: String,
    pub mime: String,
    pub etag: Option<String>,
    pub size: i64,
    pub remote_mod_ts: i64,
    pub last_check_ts: i64,
    pub local_mod_ts: i64,
    pub sort_name: String,
    pub flags: i64,
}

impl TreeNode {
    pub fn from_remote(account: &StateId, node: &Node, now: i64) -> Self {
        let state = account.with_path(&node.path);
        let kind = node.kind();
        let name = state.file_name().unwrap_or_default().to_string();
        let mut flags = 0;
        if node.bookmarked {
            flags |= FLAG_BOOKMARK;
        }
        if node.shared {
            flags |= FLAG_SHARE;
        }
        if node.has_thumb {
            flags |= FLAG_HAS_THUMB;
        }
        if node.pre_viewable {
            flags |= FLAG_PRE_VIEWABLE;
        }
        Self {
            encoded_state: state.id(),
            uuid: node.uuid.clone(),
            account_id: account.account_id(),
            workspace: state.workspace().unwrap_or_default().to_string(),
            path: state.path().unwrap_or("/").to_string(),
            parent_path: state.parent().path().unwrap_or_default().to_string(),
            sort_name: sort_name(kind, &name),
            name,
            mime: node.mime.clone(),
            etag: node.etag.clone(),
            size: node.size,
            remote_mod_ts: node.mtime,
            last_check_ts: now,
            local_mod_ts: now,
            flags,
        }
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mime(&self.mime)
    }

    pub fn is_folder(&self) -> bool {
        self.kind().is_folder()
    }

    pub fn has_flag(&self, flag: i64) -> bool {
        self.flags & flag != 0
    }

    pub fn state_id(&self, account: &StateId) -> StateId {
        account.with_path(&self.path)
    }

    /// Same remote content. Legacy servers do not maintain ETags, so only
    /// the modification time is compared there. An ETag that appeared or
    /// vanished counts as a change.
    pub fn is_same_content(&self, other: &TreeNode, legacy: bool) -> bool {
        if self.remote_mod_ts != other.remote_mod_ts {
            return false;
        }
        legacy || self.etag == other.etag
    }

    pub fn same_remote_flags(&self, other: &TreeNode) -> bool {
        self.flags & !LOCAL_FLAGS == other.flags & !LOCAL_FLAGS
    }

    /// Keeps local-only flags of `previous` when replacing it with fresh remote data.
    pub fn carry_local_flags(&mut self, previous: &TreeNode) {
        self.flags = (self.flags & !LOCAL_FLAGS) | (previous.flags & LOCAL_FLAGS);
    }
}

fn sort_name(kind: NodeKind, name: &str) -> String {
    let prefix = match kind {
        NodeKind::WorkspaceRoot => "1_",
        NodeKind::Folder => "3_",
        NodeKind::File => "5_",
        NodeKind::Recycle => "8_",
    };
    format!("{prefix}{}", name.to_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub encoded_state: String,
    pub file_type: LocalFileType,
    pub account_id: String,
    pub path: String,
    pub local_path: String,
    pub etag: Option<String>,
    pub size: i64,
    pub remote_mod_ts: i64,
    pub local_mod_ts: i64,
}

impl LocalFile {
    pub fn is_stale_for(&self, node: &TreeNode, legacy: bool) -> bool {
        if self.remote_mod_ts != node.remote_mod_ts {
            return true;
        }
        !legacy && self.etag != node.etag
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineRoot {
    pub encoded_state: String,
    pub uuid: String,
    pub account_id: String,
    pub status: OfflineStatus,
    pub local_mod_ts: i64,
    pub last_check_ts: i64,
    pub message: Option<String>,
    pub sort_name: String,
}

/// Local mirror of the remote tree: nodes, cached artefacts and offline roots.
#[derive(Clone)]
pub struct NodeIndex {
    pool: SqlitePool,
}

impl NodeIndex {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn upsert_node(&self, node: &TreeNode) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tree_nodes (
                encoded_state, uuid, account_id, workspace, path, parent_path, name, mime, etag,
                size, remote_mod_ts, last_check_ts, local_mod_ts, sort_name, flags
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(encoded_state) DO UPDATE SET
                uuid = excluded.uuid,
                workspace = excluded.workspace,
                path = excluded.path,
                parent_path = excluded.parent_path,
                name = excluded.name,
                mime = excluded.mime,
                etag = excluded.etag,
                size = excluded.size,
                remote_mod_ts = excluded.remote_mod_ts,
                last_check_ts = excluded.last_check_ts,
                local_mod_ts = excluded.local_mod_ts,
                sort_name = excluded.sort_name,
                flags = excluded.flags",
        )
        .bind(&node.encoded_state)
        .bind(&node.uuid)
        .bind(&node.account_id)
        .bind(&node.workspace)
        .bind(&node.path)
        .bind(&node.parent_path)
        .bind(&node.name)
        .bind(&node.mime)
        .bind(&node.etag)
        .bind(node.size)
        .bind(node.remote_mod_ts)
        .bind(node.last_check_ts)
        .bind(node.local_mod_ts)
        .bind(&node.sort_name)
        .bind(node.flags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_node(&self, encoded_state: &str) -> Result<Option<TreeNode>, StoreError> {
        let row = sqlx::query(&format!("{NODE_COLUMNS} WHERE encoded_state = ?1"))
            .bind(encoded_state)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| node_from_row(&row)).transpose()
    }

    pub async fn list_children(
        &self,
        account_id: &str,
        parent_path: &str,
    ) -> Result<Vec<TreeNode>, StoreError> {
        let rows = sqlx::query(&format!(
            "{NODE_COLUMNS} WHERE account_id = ?1 AND parent_path = ?2 ORDER BY sort_name ASC"
        ))
        .bind(account_id)
        .bind(parent_path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    /// The node at `path` and every descendant.
    pub async fn list_subtree(
        &self,
        account_id: &str,
        path: &str,
    ) -> Result<Vec<TreeNode>, StoreError> {
        let rows = sqlx::query(&format!(
            "{NODE_COLUMNS} WHERE account_id = ?1
                AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')
             ORDER BY path ASC"
        ))
        .bind(account_id)
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    /// Deletes the node at `path`, its descendants and their cached-file rows.
    /// Returns the removed cached-file rows so the caller can clean the disk.
    pub async fn delete_subtree(
        &self,
        account_id: &str,
        path: &str,
    ) -> Result<(u64, Vec<LocalFile>), StoreError> {
        let local_files = self.list_local_files_under(account_id, path).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM local_files WHERE account_id = ?1
                AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')",
        )
        .bind(account_id)
        .bind(path)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "DELETE FROM tree_nodes WHERE account_id = ?1
                AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')",
        )
        .bind(account_id)
        .bind(path)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((result.rows_affected(), local_files))
    }

    pub async fn set_flag(
        &self,
        encoded_state: &str,
        flag: i64,
        enabled: bool,
    ) -> Result<bool, StoreError> {
        let query = if enabled {
            "UPDATE tree_nodes SET flags = flags | ?1 WHERE encoded_state = ?2"
        } else {
            "UPDATE tree_nodes SET flags = flags & ~?1 WHERE encoded_state = ?2"
        };
        let result = sqlx::query(query)
            .bind(flag)
            .bind(encoded_state)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Inserts or replaces a cached file row, but only while the owning tree
    /// node is still indexed. Returns whether the row was written.
    pub async fn record_local_file(&self, file: &LocalFile) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO local_files (
                encoded_state, type, account_id, path, local_path, etag, size, remote_mod_ts, local_mod_ts
             )
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
             WHERE EXISTS (SELECT 1 FROM tree_nodes WHERE encoded_state = ?1)
             ON CONFLICT(encoded_state, type) DO UPDATE SET
                local_path = excluded.local_path,
                etag = excluded.etag,
                size = excluded.size,
                remote_mod_ts = excluded.remote_mod_ts,
                local_mod_ts = excluded.local_mod_ts",
        )
        .bind(&file.encoded_state)
        .bind(file.file_type.as_str())
        .bind(&file.account_id)
        .bind(&file.path)
        .bind(&file.local_path)
        .bind(&file.etag)
        .bind(file.size)
        .bind(file.remote_mod_ts)
        .bind(file.local_mod_ts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_local_file(
        &self,
        encoded_state: &str,
        file_type: LocalFileType,
    ) -> Result<Option<LocalFile>, StoreError> {
        let row = sqlx::query(&format!(
            "{LOCAL_FILE_COLUMNS} WHERE encoded_state = ?1 AND type = ?2"
        ))
        .bind(encoded_state)
        .bind(file_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| local_file_from_row(&row)).transpose()
    }

    pub async fn list_local_files(&self, encoded_state: &str) -> Result<Vec<LocalFile>, StoreError> {
        let rows = sqlx::query(&format!("{LOCAL_FILE_COLUMNS} WHERE encoded_state = ?1"))
            .bind(encoded_state)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(local_file_from_row).collect()
    }

    pub async fn list_local_files_under(
        &self,
        account_id: &str,
        path: &str,
    ) -> Result<Vec<LocalFile>, StoreError> {
        let rows = sqlx::query(&format!(
            "{LOCAL_FILE_COLUMNS} WHERE account_id = ?1
                AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')"
        ))
        .bind(account_id)
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(local_file_from_row).collect()
    }

    pub async fn delete_local_file(
        &self,
        encoded_state: &str,
        file_type: LocalFileType,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM local_files WHERE encoded_state = ?1 AND type = ?2")
            .bind(encoded_state)
            .bind(file_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Inserts or refreshes an offline root. The node uuid is the conflict key, so
    /// a root that moved remotely keeps a single row.
    pub async fn upsert_offline_root(&self, root: &OfflineRoot) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM offline_roots WHERE encoded_state = ?1 AND uuid <> ?2")
            .bind(&root.encoded_state)
            .bind(&root.uuid)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO offline_roots (
                encoded_state, uuid, account_id, status, local_mod_ts, last_check_ts, message, sort_name
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(uuid) DO UPDATE SET
                encoded_state = excluded.encoded_state,
                account_id = excluded.account_id,
                status = excluded.status,
                local_mod_ts = excluded.local_mod_ts,
                last_check_ts = excluded.last_check_ts,
                message = excluded.message,
                sort_name = excluded.sort_name",
        )
        .bind(&root.encoded_state)
        .bind(&root.uuid)
        .bind(&root.account_id)
        .bind(root.status.as_str())
        .bind(root.local_mod_ts)
        .bind(root.last_check_ts)
        .bind(&root.message)
        .bind(&root.sort_name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_offline_root(
        &self,
        encoded_state: &str,
    ) -> Result<Option<OfflineRoot>, StoreError> {
        let row = sqlx::query(&format!("{ROOT_COLUMNS} WHERE encoded_state = ?1"))
            .bind(encoded_state)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| root_from_row(&row)).transpose()
    }

    pub async fn list_offline_roots(&self, account_id: &str) -> Result<Vec<OfflineRoot>, StoreError> {
        let rows = sqlx::query(&format!(
            "{ROOT_COLUMNS} WHERE account_id = ?1 ORDER BY sort_name ASC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(root_from_row).collect()
    }

    /// Accounts owning at least one root that is not lost.
    pub async fn list_offline_accounts(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT account_id FROM offline_roots WHERE status <> 'lost' ORDER BY account_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("account_id").map_err(StoreError::from))
            .collect()
    }

    pub async fn delete_offline_root(&self, encoded_state: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM offline_roots WHERE encoded_state = ?1")
            .bind(encoded_state)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["local_files", "tree_nodes", "offline_roots"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE account_id = ?1"))
                .bind(account_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

const NODE_COLUMNS: &str = "SELECT encoded_state, uuid, account_id, workspace, path, parent_path, name, mime, etag, size, remote_mod_ts, last_check_ts, local_mod_ts, sort_name, flags FROM tree_nodes";
const LOCAL_FILE_COLUMNS: &str = "SELECT encoded_state, type, account_id, path, local_path, etag, size, remote_mod_ts, local_mod_ts FROM local_files";
const ROOT_COLUMNS: &str = "SELECT encoded_state, uuid, account_id, status, local_mod_ts, last_check_ts, message, sort_name FROM offline_roots";

fn node_from_row(row: &SqliteRow) -> Result<TreeNode, StoreError> {
    Ok(TreeNode {
        encoded_state: row.try_get("encoded_state")?,
        uuid: row.try_get("uuid")?,
        account_id: row.try_get("account_id")?,
        workspace: row.try_get("workspace")?,
        path: row.try_get("path")?,
        parent_path: row.try_get("parent_path")?,
        name: row.try_get("name")?,
        mime: row.try_get("mime")?,
        etag: row.try_get("etag")?,
        size: row.try_get("size")?,
        remote_mod_ts: row.try_get("remote_mod_ts")?,
        last_check_ts: row.try_get("last_check_ts")?,
        local_mod_ts: row.try_get("local_mod_ts")?,
        sort_name: row.try_get("sort_name")?,
        flags: row.try_get("flags")?,
    })
}

fn local_file_from_row(row: &SqliteRow) -> Result<LocalFile, StoreError> {
    let file_type: String = row.try_get("type")?;
    Ok(LocalFile {
        encoded_state: row.try_get("encoded_state")?,
        file_type: LocalFileType::parse(&file_type)?,
        account_id: row.try_get("account_id")?,
        path: row.try_get("path")?,
        local_path: row.try_get("local_path")?,
        etag: row.try_get("etag")?,
        size: row.try_get("size")?,
        remote_mod_ts: row.try_get("remote_mod_ts")?,
        local_mod_ts: row.try_get("local_mod_ts")?,
    })
}

fn root_from_row(row: &SqliteRow) -> Result<OfflineRoot, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(OfflineRoot {
        encoded_state: row.try_get("encoded_state")?,
        uuid: row.try_get("uuid")?,
        account_id: row.try_get("account_id")?,
        status: OfflineStatus::parse(&status)?,
        local_mod_ts: row.try_get("local_mod_ts")?,
        last_check_ts: row.try_get("last_check_ts")?,
        message: row.try_get("message")?,
        sort_name: row.try_get("sort_name")?,
    })
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
