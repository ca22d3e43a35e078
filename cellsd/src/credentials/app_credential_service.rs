use std::time::Duration;

use cells_core::{ErrorCode, OAuthClient, OAuthError, OAuthToken};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::storage::{AccountStore, AuthStatus, Database, StoreError, Token, TokenStore, now_unix};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("token refresh failed: {0}")]
    OAuth(#[from] OAuthError),
    #[error("no token stored for {0}")]
    NoToken(String),
    #[error("no refresh token stored for {0}")]
    NoRefreshToken(String),
    #[error("refresh token rejected for {0}")]
    RefreshTokenExpired(String),
    #[error("token for {0} is still expired after a concurrent refresh")]
    StillExpired(String),
    #[error("timed out waiting for a concurrent refresh of {0}")]
    Timeout(String),
    #[error("refresh of {0} ended abnormally")]
    Aborted(String),
}

impl CredentialError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CredentialError::NoToken(_) => ErrorCode::NoTokenAvailable,
            CredentialError::NoRefreshToken(_) | CredentialError::RefreshTokenExpired(_) => {
                ErrorCode::RefreshTokenExpired
            }
            CredentialError::OAuth(err) if err.is_network_error() => ErrorCode::ConnectionFailed,
            CredentialError::Timeout(_) => ErrorCode::Timeout,
            CredentialError::StillExpired(_) => ErrorCode::TokenExpired,
            _ => ErrorCode::Internal,
        }
    }

    /// The account has been logged out and needs new credentials.
    pub fn is_logout(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::NoTokenAvailable | ErrorCode::RefreshTokenExpired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This caller performed the network refresh.
    Refreshed,
    /// The stored token still has more than half of its lifetime ahead.
    AlreadyFresh,
    /// Another caller was refreshing; its result has been observed.
    RefreshedElsewhere,
}

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub client_id: String,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
    /// A refresh marker older than this is considered abandoned.
    pub stale_after_secs: i64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            client_id: cells_core::DEFAULT_CLIENT_ID.to_string(),
            poll_interval: Duration::from_millis(500),
            wait_timeout: Duration::from_secs(30),
            stale_after_secs: 300,
        }
    }
}

enum Launch {
    Fresh,
    Wait,
    Go { token: Token, refresh: String, url: String, previous: AuthStatus },
}

/// Serialises refresh-token grants: at most one network refresh per account is
/// in flight, other callers wait for its outcome in the token store.
pub struct AppCredentialService {
    accounts: AccountStore,
    tokens: TokenStore,
    config: CredentialConfig,
    lock: Mutex<()>,
}

impl AppCredentialService {
    pub fn new(db: &Database) -> Self {
        Self::with_config(db, CredentialConfig::default())
    }

    pub fn with_config(db: &Database, config: CredentialConfig) -> Self {
        Self {
            accounts: AccountStore::new(db),
            tokens: TokenStore::new(db),
            config,
            lock: Mutex::new(()),
        }
    }

    pub async fn get_token(&self, account_id: &str) -> Result<Option<Token>, CredentialError> {
        Ok(self.tokens.get(account_id).await?)
    }

    /// Stores a freshly granted token and marks the account connected.
    pub async fn store_token(
        &self,
        account_id: &str,
        grant: &OAuthToken,
    ) -> Result<Token, CredentialError> {
        let previous = self.tokens.get(account_id).await?;
        let token = Token::from_oauth(account_id, grant, previous.as_ref(), now_unix());
        self.tokens.put(&token).await?;
        self.accounts
            .set_auth_status(account_id, AuthStatus::Connected)
            .await?;
        Ok(token)
    }

    pub async fn refresh_token(&self, account_id: &str) -> Result<RefreshOutcome, CredentialError> {
        let launch = {
            let _guard = self.lock.lock().await;
            self.check_and_mark(account_id, now_unix()).await?
        };
        match launch {
            Launch::Fresh => Ok(RefreshOutcome::AlreadyFresh),
            Launch::Wait => self.wait_for_refresh(account_id).await,
            Launch::Go {
                token,
                refresh,
                url,
                previous,
            } => self.perform_refresh(token, refresh, url, previous).await,
        }
    }

    /// Deletes the stored credentials and flags the account as needing a login.
    pub async fn logout(&self, account_id: &str) -> Result<(), CredentialError> {
        remove_credentials(&self.accounts, &self.tokens, account_id).await
    }

    async fn check_and_mark(&self, account_id: &str, now: i64) -> Result<Launch, CredentialError> {
        let Some(mut token) = self.tokens.get(account_id).await? else {
            return Err(CredentialError::NoToken(account_id.to_string()));
        };
        if token.refreshing_since_ts > 0 {
            if now - token.refreshing_since_ts < self.config.stale_after_secs {
                return Ok(Launch::Wait);
            }
            tracing::warn!(
                account = account_id,
                since = token.refreshing_since_ts,
                "clearing abandoned refresh marker"
            );
            token.refreshing_since_ts = 0;
        }
        if token.is_fresh(now) {
            self.tokens.set_refreshing_since(account_id, 0).await?;
            return Ok(Launch::Fresh);
        }
        let Some(refresh) = token.refresh_token.clone() else {
            self.logout(account_id).await?;
            return Err(CredentialError::NoRefreshToken(account_id.to_string()));
        };
        let account = self.accounts.require(account_id).await?;

        self.tokens.set_refreshing_since(account_id, now).await?;
        self.accounts
            .set_auth_status(account_id, AuthStatus::Refreshing)
            .await?;
        token.refreshing_since_ts = now;
        Ok(Launch::Go {
            token,
            refresh,
            url: account.url,
            previous: account.auth_status,
        })
    }

    /// The grant and its bookkeeping run on their own task so that a caller
    /// dropping this future cannot leave the marker or `Refreshing` behind.
    async fn perform_refresh(
        &self,
        previous_token: Token,
        refresh: String,
        url: String,
        previous_status: AuthStatus,
    ) -> Result<RefreshOutcome, CredentialError> {
        let account_id = previous_token.account_id.clone();
        let grant = GrantTask {
            accounts: self.accounts.clone(),
            tokens: self.tokens.clone(),
            client_id: self.config.client_id.clone(),
        };
        let handle = tokio::spawn(grant.run(previous_token, refresh, url, previous_status));
        match handle.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(account = %account_id, error = %err, "refresh task aborted");
                self.tokens.set_refreshing_since(&account_id, 0).await?;
                self.accounts
                    .set_auth_status(&account_id, restored_status(previous_status))
                    .await?;
                Err(CredentialError::Aborted(account_id))
            }
        }
    }

    async fn wait_for_refresh(&self, account_id: &str) -> Result<RefreshOutcome, CredentialError> {
        let deadline = Instant::now() + self.config.wait_timeout;
        while Instant::now() < deadline {
            tokio::time::sleep(self.config.poll_interval).await;
            let Some(token) = self.tokens.get(account_id).await? else {
                return Err(CredentialError::NoToken(account_id.to_string()));
            };
            if token.refreshing_since_ts == 0 {
                if token.is_expired(now_unix()) {
                    return Err(CredentialError::StillExpired(account_id.to_string()));
                }
                return Ok(RefreshOutcome::RefreshedElsewhere);
            }
        }
        Err(CredentialError::Timeout(account_id.to_string()))
    }
}

struct GrantTask {
    accounts: AccountStore,
    tokens: TokenStore,
    client_id: String,
}

impl GrantTask {
    async fn run(
        self,
        previous_token: Token,
        refresh: String,
        url: String,
        previous_status: AuthStatus,
    ) -> Result<RefreshOutcome, CredentialError> {
        let account_id = previous_token.account_id.as_str();
        let grant = match OAuthClient::new(&url, self.client_id) {
            Ok(client) => client.refresh_token(&refresh).await,
            Err(err) => Err(err),
        };
        match grant {
            Ok(grant) => {
                let token = Token::from_oauth(account_id, &grant, Some(&previous_token), now_unix());
                self.tokens.put(&token).await?;
                self.accounts
                    .set_auth_status(account_id, AuthStatus::Connected)
                    .await?;
                tracing::info!(account = account_id, expires = token.expiration_time, "token refreshed");
                Ok(RefreshOutcome::Refreshed)
            }
            Err(err) if err.is_invalid_grant() => {
                tracing::warn!(account = account_id, error = %err, "refresh token rejected");
                remove_credentials(&self.accounts, &self.tokens, account_id).await?;
                Err(CredentialError::RefreshTokenExpired(account_id.to_string()))
            }
            Err(err) => {
                tracing::warn!(account = account_id, error = %err, "token refresh failed");
                self.tokens.set_refreshing_since(account_id, 0).await?;
                self.accounts
                    .set_auth_status(account_id, restored_status(previous_status))
                    .await?;
                Err(CredentialError::OAuth(err))
            }
        }
    }
}

/// `Refreshing` is never a status to go back to.
fn restored_status(previous: AuthStatus) -> AuthStatus {
    if previous == AuthStatus::Refreshing {
        AuthStatus::Connected
    } else {
        previous
    }
}

pub(crate) async fn remove_credentials(
    accounts: &AccountStore,
    tokens: &TokenStore,
    account_id: &str,
) -> Result<(), CredentialError> {
    tokens.delete(account_id).await?;
    accounts
        .set_auth_status(account_id, AuthStatus::NoCredentials)
        .await?;
    tracing::info!(account = account_id, "credentials removed");
    Ok(())
}

#[cfg(test)]
#[path = "app_credential_service_tests.rs"]
mod tests;
