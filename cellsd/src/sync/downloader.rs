use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use cells_core::CellsClient;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use super::SyncError;
use super::index::{FLAG_HAS_THUMB, LocalFile, LocalFileType, NodeIndex, TreeNode};
use super::paths::{local_path_for, remove_local_path};
use super::transfer::md5_from_etag;
use super::transfers::{TransferKind, TransferService};
use crate::state_id::StateId;
use crate::storage::now_unix;

const THUMB_SIZE: u32 = 256;
const PREVIEW_SIZE: u32 = 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSummary {
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Skipped,
}

struct DownloadOrder {
    encoded_state: String,
    kind: LocalFileType,
}

/// Everything a download worker needs for one account.
#[derive(Clone)]
pub struct DownloadContext {
    pub account: StateId,
    pub client: CellsClient,
    pub index: NodeIndex,
    pub transfers: TransferService,
    pub cache_root: PathBuf,
}

/// Accepts download orders during a tree walk and runs them in the background.
/// Concurrency is bounded by the transfer client's download limit.
pub struct FileDownloader {
    tx: mpsc::UnboundedSender<DownloadOrder>,
    worker: JoinHandle<DownloadSummary>,
}

impl FileDownloader {
    pub fn spawn(ctx: DownloadContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_orders(Arc::new(ctx), rx));
        Self { tx, worker }
    }

    pub fn order(&self, encoded_state: &str, kind: LocalFileType) {
        let order = DownloadOrder {
            encoded_state: encoded_state.to_string(),
            kind,
        };
        if self.tx.send(order).is_err() {
            tracing::warn!(encoded_state, kind = kind.as_str(), "download worker is gone");
        }
    }

    /// Signals that no more orders will come and waits for the queue to drain.
    pub async fn walking_done(self) -> DownloadSummary {
        drop(self.tx);
        match self.worker.await {
            Ok(summary) => summary,
            Err(err) => {
                tracing::error!(error = %err, "download worker panicked");
                DownloadSummary::default()
            }
        }
    }
}

async fn run_orders(
    ctx: Arc<DownloadContext>,
    mut rx: mpsc::UnboundedReceiver<DownloadOrder>,
) -> DownloadSummary {
    let mut seen = HashSet::new();
    let mut tasks = JoinSet::new();
    let mut summary = DownloadSummary::default();

    while let Some(order) = rx.recv().await {
        if !seen.insert((order.encoded_state.clone(), order.kind)) {
            continue;
        }
        let ctx = Arc::clone(&ctx);
        tasks.spawn(async move {
            let result = process(&ctx, &order).await;
            if let Err(err) = &result {
                tracing::warn!(
                    encoded_state = %order.encoded_state,
                    kind = order.kind.as_str(),
                    error = %err,
                    "download failed"
                );
            }
            result
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(Outcome::Done)) => summary.done += 1,
            Ok(Ok(Outcome::Skipped)) => summary.skipped += 1,
            Ok(Err(_)) => summary.failed += 1,
            Err(err) => {
                tracing::error!(error = %err, "download task aborted");
                summary.failed += 1;
            }
        }
    }
    summary
}

async fn process(ctx: &DownloadContext, order: &DownloadOrder) -> Result<Outcome, SyncError> {
    let Some(node) = ctx.index.get_node(&order.encoded_state).await? else {
        return Ok(Outcome::Skipped);
    };
    if node.is_folder() {
        return Ok(Outcome::Skipped);
    }
    let state = node.state_id(&ctx.account);
    let target = local_path_for(&ctx.cache_root, &state, order.kind)?;

    match order.kind {
        LocalFileType::File => {
            let link = ctx.client.get_download_link(&node.path).await?;
            let transfer_id = ctx
                .transfers
                .create(
                    &node.encoded_state,
                    &target,
                    TransferKind::Download,
                    node.size,
                    None,
                )
                .await?;
            ctx.transfers
                .run_download(
                    transfer_id,
                    link.href.as_str(),
                    md5_from_etag(node.etag.as_deref()),
                )
                .await?;
        }
        LocalFileType::Thumb | LocalFileType::Preview => {
            if !node.has_flag(FLAG_HAS_THUMB) {
                return Ok(Outcome::Skipped);
            }
            let size = if order.kind == LocalFileType::Thumb {
                THUMB_SIZE
            } else {
                PREVIEW_SIZE
            };
            let link = ctx.client.get_thumbnail_link(&node.uuid, size).await?;
            ctx.transfers
                .client()
                .download(link.href.as_str(), &target, None, None)
                .await?;
        }
        LocalFileType::Transfer => return Ok(Outcome::Skipped),
    }

    // The walk may have deleted the node while bytes were in flight.
    let recorded = ctx
        .index
        .record_local_file(&local_file_for(&node, order.kind, &target))
        .await?;
    if !recorded {
        remove_local_path(&target).await?;
        return Ok(Outcome::Skipped);
    }
    Ok(Outcome::Done)
}

fn local_file_for(node: &TreeNode, kind: LocalFileType, target: &std::path::Path) -> LocalFile {
    LocalFile {
        encoded_state: node.encoded_state.clone(),
        file_type: kind,
        account_id: node.account_id.clone(),
        path: node.path.clone(),
        local_path: target.to_string_lossy().into_owned(),
        etag: node.etag.clone(),
        size: node.size,
        remote_mod_ts: node.remote_mod_ts,
        local_mod_ts: now_unix(),
    }
}
