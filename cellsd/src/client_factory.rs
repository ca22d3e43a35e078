use cells_core::{CellsClient, ErrorCode, SdkError};

use crate::storage::{AccountStore, Database, StoreError, TokenStore};

/// Builds authenticated SDK clients from the stored session of an account.
#[derive(Clone)]
pub struct ClientFactory {
    accounts: AccountStore,
    tokens: TokenStore,
}

impl ClientFactory {
    pub fn new(db: &Database) -> Self {
        Self {
            accounts: AccountStore::new(db),
            tokens: TokenStore::new(db),
        }
    }

    /// Fails with `NoTokenAvailable` when the account has no stored credentials.
    pub async fn client_for(&self, account_id: &str) -> Result<CellsClient, SdkError> {
        let account = self
            .accounts
            .get(account_id)
            .await
            .map_err(store_to_sdk)?
            .ok_or_else(|| {
                SdkError::new(ErrorCode::IllegalArgument, format!("unknown account {account_id}"))
            })?;
        let token = self
            .tokens
            .get(account_id)
            .await
            .map_err(store_to_sdk)?
            .ok_or_else(|| {
                SdkError::new(ErrorCode::NoTokenAvailable, format!("no token for {account_id}"))
            })?;
        Ok(CellsClient::new(&account.url, token.value)?.legacy(account.is_legacy))
    }
}

fn store_to_sdk(err: StoreError) -> SdkError {
    SdkError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_id::StateId;
    use crate::storage::{Account, Token};

    #[tokio::test]
    async fn builds_client_from_stored_session() {
        let db = Database::in_memory().await.unwrap();
        let mut account = Account::new(&StateId::new("alice", "https://cells.local/"));
        account.is_legacy = true;
        AccountStore::new(&db).upsert(&account).await.unwrap();
        let factory = ClientFactory::new(&db);

        let err = factory.client_for(&account.account_id).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::NoTokenAvailable);

        TokenStore::new(&db)
            .put(&Token {
                account_id: account.account_id.clone(),
                value: "secret".into(),
                refresh_token: None,
                token_type: "bearer".into(),
                scope: None,
                id_token: None,
                expires_in: 0,
                expiration_time: 0,
                refreshing_since_ts: 0,
            })
            .await
            .unwrap();
        let client = factory.client_for(&account.account_id).await.unwrap();
        assert!(client.is_legacy());
        assert_eq!(client.base_url().as_str(), "https://cells.local/");
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        let err = ClientFactory::new(&db).client_for("nobody").await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::IllegalArgument);
    }
}
