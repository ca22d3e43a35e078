mod app_credential_service;
mod watcher;

pub use app_credential_service::{
    AppCredentialService, CredentialConfig, CredentialError, RefreshOutcome,
};
pub(crate) use app_credential_service::remove_credentials;
pub use watcher::{CredentialWatcher, WatcherConfig};
