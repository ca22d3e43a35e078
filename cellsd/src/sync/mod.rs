pub mod backoff;
pub mod downloader;
pub mod index;
pub mod offline;
pub mod paths;
pub mod poll;
pub mod transfer;
pub mod transfers;
pub mod tree_diff;

use cells_core::{ErrorCode, SdkError};
use thiserror::Error;

use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Sdk(#[from] SdkError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transfer(#[from] transfer::TransferError),
    #[error(transparent)]
    TransferService(#[from] transfers::TransferServiceError),
    #[error(transparent)]
    Path(#[from] paths::PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} does not address a remote node")]
    NotANode(String),
}

impl SyncError {
    /// Remote error code, when the failure came from the server or the network.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SyncError::Sdk(err) => Some(err.code()),
            _ => None,
        }
    }
}
