use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::SdkError;

pub const MIME_FOLDER: &str = "pydio/nodes-list";
pub const MIME_WS_ROOT: &str = "pydio/workspace_root";
pub const MIME_RECYCLE: &str = "pydio/recycle";
const MIME_DEFAULT: &str = "application/octet-stream";

#[derive(Clone)]
pub struct CellsClient {
    http: Client,
    base_url: Url,
    token: String,
    legacy: bool,
}

impl CellsClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, SdkError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
            legacy: false,
        })
    }

    /// Legacy servers do not maintain reliable ETags on folder children.
    pub fn legacy(mut self, legacy: bool) -> Self {
        self.legacy = legacy;
        self
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>, SdkError> {
        let url = self.endpoint("/a/workspaces")?;
        let response = self.get(url).await?;
        let payload: WorkspaceListResponse = Self::handle_response(response).await?;
        Ok(payload.workspaces)
    }

    /// Returns `None` when the server does not know the node.
    pub async fn node_info(&self, path: &str) -> Result<Option<Node>, SdkError> {
        let mut url = self.endpoint("/a/tree/stat")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.get(url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::handle_response(response).await?))
    }

    pub async fn list_folder(
        &self,
        path: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<ListPage, SdkError> {
        let mut url = self.endpoint("/a/tree/list")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", path);
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = offset {
                query.append_pair("offset", &offset.to_string());
            }
        }
        let response = self.get(url).await?;
        Self::handle_response(response).await
    }

    pub async fn list_folder_all(&self, path: &str, page_size: u32) -> Result<Vec<Node>, SdkError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut nodes = Vec::new();
        loop {
            let page = self
                .list_folder(path, Some(page_size), Some(offset))
                .await?;
            let received = page.nodes.len() as u32;
            offset = offset.saturating_add(received);
            nodes.extend(page.nodes);
            if received == 0 || offset >= page.total {
                break;
            }
        }
        Ok(nodes)
    }

    pub async fn get_download_link(&self, path: &str) -> Result<TransferLink, SdkError> {
        let mut url = self.endpoint("/a/tree/download")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.get(url).await?;
        Self::handle_response(response).await
    }

    pub async fn get_upload_link(
        &self,
        path: &str,
        overwrite: bool,
    ) -> Result<TransferLink, SdkError> {
        let mut url = self.endpoint("/a/tree/upload")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        let response = self.get(url).await?;
        Self::handle_response(response).await
    }

    pub async fn get_thumbnail_link(&self, uuid: &str, size: u32) -> Result<TransferLink, SdkError> {
        let mut url = self.endpoint("/a/tree/thumbnail")?;
        url.query_pairs_mut()
            .append_pair("uuid", uuid)
            .append_pair("size", &size.to_string());
        let response = self.get(url).await?;
        Self::handle_response(response).await
    }

    pub async fn mkdir(&self, path: &str) -> Result<Node, SdkError> {
        let mut url = self.endpoint("/a/tree/folder")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn copy(&self, from: &[String], to: &str) -> Result<(), SdkError> {
        let url = self.endpoint("/a/tree/copy")?;
        let body = CopyMoveRequest { from, to };
        let response = self.post_json(url, &body).await?;
        Self::handle_empty(response).await
    }

    pub async fn move_nodes(&self, from: &[String], to: &str) -> Result<(), SdkError> {
        let url = self.endpoint("/a/tree/move")?;
        let body = CopyMoveRequest { from, to };
        let response = self.post_json(url, &body).await?;
        Self::handle_empty(response).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SdkError> {
        let url = self.endpoint("/a/tree/rename")?;
        let body = RenameRequest { from, to };
        let response = self.post_json(url, &body).await?;
        Self::handle_empty(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), SdkError> {
        let mut url = self.endpoint("/a/tree")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    pub async fn restore(&self, paths: &[String]) -> Result<(), SdkError> {
        let url = self.endpoint("/a/tree/restore")?;
        let body = RestoreRequest { paths };
        let response = self.post_json(url, &body).await?;
        Self::handle_empty(response).await
    }

    pub async fn bookmark(&self, uuid: &str, bookmarked: bool) -> Result<(), SdkError> {
        let mut url = self.endpoint("/a/bookmark")?;
        url.query_pairs_mut().append_pair("uuid", uuid);
        let request = if bookmarked {
            self.http.put(url)
        } else {
            self.http.delete(url)
        };
        let response = request.bearer_auth(&self.token).send().await?;
        Self::handle_empty(response).await
    }

    pub async fn create_share(&self, uuid: &str, label: &str) -> Result<ShareLink, SdkError> {
        let url = self.endpoint("/a/share")?;
        let body = ShareRequest { uuid, label };
        let response = self.post_json(url, &body).await?;
        Self::handle_response(response).await
    }

    pub async fn remove_share(&self, uuid: &str) -> Result<(), SdkError> {
        let mut url = self.endpoint("/a/share")?;
        url.query_pairs_mut().append_pair("uuid", uuid);
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<Node>, SdkError> {
        let mut url = self.endpoint("/a/search")?;
        url.query_pairs_mut()
            .append_pair("query", query)
            .append_pair("limit", &limit.to_string());
        let response = self.get(url).await?;
        let payload: SearchResponse = Self::handle_response(response).await?;
        Ok(payload.nodes)
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, SdkError> {
        Ok(self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<reqwest::Response, SdkError> {
        Ok(self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SdkError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SdkError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(SdkError::Api { status, body })
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), SdkError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(SdkError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
    WorkspaceRoot,
    Recycle,
}

impl NodeKind {
    pub fn from_mime(mime: &str) -> Self {
        match mime {
            MIME_FOLDER => NodeKind::Folder,
            MIME_WS_ROOT => NodeKind::WorkspaceRoot,
            MIME_RECYCLE => NodeKind::Recycle,
            _ => NodeKind::File,
        }
    }

    pub fn is_folder(&self) -> bool {
        !matches!(self, NodeKind::File)
    }
}

/// A remote file or folder. `path` includes the workspace slug as first segment.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Node {
    pub uuid: String,
    pub path: String,
    #[serde(default = "default_mime")]
    pub mime: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub has_thumb: bool,
    #[serde(default)]
    pub pre_viewable: bool,
    #[serde(default)]
    pub bookmarked: bool,
    #[serde(default)]
    pub shared: bool,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mime(&self.mime)
    }

    pub fn is_folder(&self) -> bool {
        self.kind().is_folder()
    }

    pub fn name(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

fn default_mime() -> String {
    MIME_DEFAULT.to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Workspace {
    pub uuid: String,
    pub slug: String,
    pub label: String,
    #[serde(rename = "type", default)]
    pub workspace_type: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListPage {
    pub nodes: Vec<Node>,
    pub total: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TransferLink {
    pub href: Url,
    #[serde(default)]
    pub method: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ShareLink {
    pub link_url: String,
}

#[derive(Debug, Deserialize)]
struct WorkspaceListResponse {
    #[serde(default)]
    workspaces: Vec<Workspace>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    nodes: Vec<Node>,
}

#[derive(Serialize)]
struct CopyMoveRequest<'a> {
    from: &'a [String],
    to: &'a str,
}

#[derive(Serialize)]
struct RenameRequest<'a> {
    from: &'a str,
    to: &'a str,
}

#[derive(Serialize)]
struct RestoreRequest<'a> {
    paths: &'a [String],
}

#[derive(Serialize)]
struct ShareRequest<'a> {
    uuid: &'a str,
    label: &'a str,
}
