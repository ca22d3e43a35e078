mod client;
mod error;
mod oauth;

pub use client::{
    CellsClient, ListPage, Node, NodeKind, ShareLink, TransferLink, Workspace, MIME_FOLDER,
    MIME_RECYCLE, MIME_WS_ROOT,
};
pub use error::{ErrorCode, SdkError};
pub use oauth::{DEFAULT_CLIENT_ID, OAuthClient, OAuthError, OAuthToken};
