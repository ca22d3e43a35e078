use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use super::database::{Database, StoreError, bool_to_int};
use crate::state_id::StateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStatus {
    New,
    NoCredentials,
    Unauthorized,
    Expired,
    Refreshing,
    Connected,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::New => "new",
            AuthStatus::NoCredentials => "no-credentials",
            AuthStatus::Unauthorized => "unauthorized",
            AuthStatus::Expired => "expired",
            AuthStatus::Refreshing => "refreshing",
            AuthStatus::Connected => "connected",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "new" => Ok(AuthStatus::New),
            "no-credentials" => Ok(AuthStatus::NoCredentials),
            "unauthorized" => Ok(AuthStatus::Unauthorized),
            "expired" => Ok(AuthStatus::Expired),
            "refreshing" => Ok(AuthStatus::Refreshing),
            "connected" => Ok(AuthStatus::Connected),
            other => Err(StoreError::invalid("auth status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Foreground,
    Background,
    Paused,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Foreground => "foreground",
            LifecycleState::Background => "background",
            LifecycleState::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "foreground" => Ok(LifecycleState::Foreground),
            "background" => Ok(LifecycleState::Background),
            "paused" => Ok(LifecycleState::Paused),
            other => Err(StoreError::invalid("lifecycle state", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub account_id: String,
    pub url: String,
    pub username: String,
    pub auth_status: AuthStatus,
    pub lifecycle_state: LifecycleState,
    pub is_legacy: bool,
    pub is_reachable: bool,
}

impl Account {
    pub fn new(state: &StateId) -> Self {
        Self {
            account_id: state.account_id(),
            url: state.server_url().to_string(),
            username: state.username().to_string(),
            auth_status: AuthStatus::New,
            lifecycle_state: LifecycleState::Foreground,
            is_legacy: false,
            is_reachable: true,
        }
    }

    pub fn state_id(&self) -> StateId {
        StateId::new(self.username.clone(), self.url.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.auth_status == AuthStatus::Connected
    }
}

#[derive(Clone)]
pub struct AccountStore {
    pool: SqlitePool,
}

impl AccountStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn upsert(&self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO accounts (account_id, url, username, auth_status, lifecycle_state, is_legacy, is_reachable)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(account_id) DO UPDATE SET
                url = excluded.url,
                username = excluded.username,
                auth_status = excluded.auth_status,
                lifecycle_state = excluded.lifecycle_state,
                is_legacy = excluded.is_legacy,
                is_reachable = excluded.is_reachable",
        )
        .bind(&account.account_id)
        .bind(&account.url)
        .bind(&account.username)
        .bind(account.auth_status.as_str())
        .bind(account.lifecycle_state.as_str())
        .bind(bool_to_int(account.is_legacy))
        .bind(bool_to_int(account.is_reachable))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            "SELECT account_id, url, username, auth_status, lifecycle_state, is_legacy, is_reachable
             FROM accounts WHERE account_id = ?1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| account_from_row(&row)).transpose()
    }

    pub async fn require(&self, account_id: &str) -> Result<Account, StoreError> {
        self.get(account_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))
    }

    pub async fn list(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(
            "SELECT account_id, url, username, auth_status, lifecycle_state, is_legacy, is_reachable
             FROM accounts ORDER BY account_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    pub async fn set_auth_status(
        &self,
        account_id: &str,
        status: AuthStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET auth_status = ?1 WHERE account_id = ?2")
            .bind(status.as_str())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves the account to `to` only when it is currently in `from`.
    /// Returns whether a row changed.
    pub async fn transition_auth_status(
        &self,
        account_id: &str,
        from: AuthStatus,
        to: AuthStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE accounts SET auth_status = ?1 WHERE account_id = ?2 AND auth_status = ?3",
        )
        .bind(to.as_str())
        .bind(account_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_lifecycle_state(
        &self,
        account_id: &str,
        state: LifecycleState,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET lifecycle_state = ?1 WHERE account_id = ?2")
            .bind(state.as_str())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_reachable(&self, account_id: &str, reachable: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET is_reachable = ?1 WHERE account_id = ?2")
            .bind(bool_to_int(reachable))
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, account_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM accounts WHERE account_id = ?1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn account_from_row(row: &SqliteRow) -> Result<Account, StoreError> {
    let auth_status: String = row.try_get("auth_status")?;
    let lifecycle_state: String = row.try_get("lifecycle_state")?;
    let is_legacy: i64 = row.try_get("is_legacy")?;
    let is_reachable: i64 = row.try_get("is_reachable")?;
    Ok(Account {
        account_id: row.try_get("account_id")?,
        url: row.try_get("url")?,
        username: row.try_get("username")?,
        auth_status: AuthStatus::parse(&auth_status)?,
        lifecycle_state: LifecycleState::parse(&lifecycle_state)?,
        is_legacy: is_legacy != 0,
        is_reachable: is_reachable != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_and_transition_status() {
        let db = Database::in_memory().await.unwrap();
        let store = AccountStore::new(&db);
        let mut account = Account::new(&StateId::new("bob", "https://cells.local"));
        account.auth_status = AuthStatus::Connected;
        store.upsert(&account).await.unwrap();

        assert!(
            store
                .transition_auth_status(
                    &account.account_id,
                    AuthStatus::Connected,
                    AuthStatus::Unauthorized
                )
                .await
                .unwrap()
        );
        assert!(
            !store
                .transition_auth_status(
                    &account.account_id,
                    AuthStatus::Connected,
                    AuthStatus::NoCredentials
                )
                .await
                .unwrap()
        );

        let stored = store.require(&account.account_id).await.unwrap();
        assert_eq!(stored.auth_status, AuthStatus::Unauthorized);
        assert_eq!(stored.state_id(), account.state_id());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            AuthStatus::New,
            AuthStatus::NoCredentials,
            AuthStatus::Unauthorized,
            AuthStatus::Expired,
            AuthStatus::Refreshing,
            AuthStatus::Connected,
        ] {
            assert_eq!(AuthStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(LifecycleState::parse("sleeping").is_err());
    }
}
