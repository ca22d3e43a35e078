use cells_core::OAuthToken;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use super::database::{Database, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub account_id: String,
    pub value: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scope: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: i64,
    pub expiration_time: i64,
    /// Non-zero while a refresh request is in flight for this account.
    pub refreshing_since_ts: i64,
}

impl Token {
    /// Builds the stored token from a grant response. Fields the server omitted
    /// on refresh are carried over from `previous`.
    pub fn from_oauth(
        account_id: &str,
        token: &OAuthToken,
        previous: Option<&Token>,
        now: i64,
    ) -> Self {
        let expires_in = token.expires_in.map(|secs| secs as i64).unwrap_or(0);
        Self {
            account_id: account_id.to_string(),
            value: token.access_token.clone(),
            refresh_token: token
                .refresh_token
                .clone()
                .or_else(|| previous.and_then(|prev| prev.refresh_token.clone())),
            token_type: token.token_type.clone(),
            scope: token
                .scope
                .clone()
                .or_else(|| previous.and_then(|prev| prev.scope.clone())),
            id_token: token
                .id_token
                .clone()
                .or_else(|| previous.and_then(|prev| prev.id_token.clone())),
            expires_in,
            expiration_time: if expires_in > 0 { now + expires_in } else { 0 },
            refreshing_since_ts: 0,
        }
    }

    /// Tokens without an expiration never expire.
    pub fn expires_within(&self, now: i64, secs: i64) -> bool {
        self.expiration_time > 0 && self.expiration_time <= now.saturating_add(secs)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_within(now, 0)
    }

    /// More than half of the lifetime is still ahead.
    pub fn is_fresh(&self, now: i64) -> bool {
        self.expiration_time == 0 || self.expiration_time > now + self.expires_in / 2
    }
}

#[derive(Clone)]
pub struct TokenStore {
    pool: SqlitePool,
}

impl TokenStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn get(&self, account_id: &str) -> Result<Option<Token>, StoreError> {
        let row = sqlx::query(
            "SELECT account_id, value, refresh_token, token_type, scope, id_token, expires_in, expiration_time, refreshing_since_ts
             FROM tokens WHERE account_id = ?1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| token_from_row(&row)).transpose()
    }

    pub async fn put(&self, token: &Token) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tokens (account_id, value, refresh_token, token_type, scope, id_token, expires_in, expiration_time, refreshing_since_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(account_id) DO UPDATE SET
                value = excluded.value,
                refresh_token = excluded.refresh_token,
                token_type = excluded.token_type,
                scope = excluded.scope,
                id_token = excluded.id_token,
                expires_in = excluded.expires_in,
                expiration_time = excluded.expiration_time,
                refreshing_since_ts = excluded.refreshing_since_ts",
        )
        .bind(&token.account_id)
        .bind(&token.value)
        .bind(&token.refresh_token)
        .bind(&token.token_type)
        .bind(&token.scope)
        .bind(&token.id_token)
        .bind(token.expires_in)
        .bind(token.expiration_time)
        .bind(token.refreshing_since_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_refreshing_since(&self, account_id: &str, ts: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE tokens SET refreshing_since_ts = ?1 WHERE account_id = ?2")
            .bind(ts)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, account_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tokens WHERE account_id = ?1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn token_from_row(row: &SqliteRow) -> Result<Token, StoreError> {
    Ok(Token {
        account_id: row.try_get("account_id")?,
        value: row.try_get("value")?,
        refresh_token: row.try_get("refresh_token")?,
        token_type: row.try_get("token_type")?,
        scope: row.try_get("scope")?,
        id_token: row.try_get("id_token")?,
        expires_in: row.try_get("expires_in")?,
        expiration_time: row.try_get("expiration_time")?,
        refreshing_since_ts: row.try_get("refreshing_since_ts")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth(access: &str, refresh: Option<&str>) -> OAuthToken {
        OAuthToken {
            access_token: access.into(),
            token_type: "bearer".into(),
            expires_in: Some(600),
            refresh_token: refresh.map(str::to_string),
            scope: None,
            id_token: None,
        }
    }

    #[test]
    fn keeps_previous_refresh_token_when_omitted() {
        let first = Token::from_oauth("acct", &oauth("a1", Some("r1")), None, 1_000);
        let second = Token::from_oauth("acct", &oauth("a2", None), Some(&first), 2_000);
        assert_eq!(second.refresh_token.as_deref(), Some("r1"));
        assert_eq!(second.expiration_time, 2_600);
    }

    #[test]
    fn freshness_uses_half_lifetime() {
        let token = Token::from_oauth("acct", &oauth("a1", Some("r1")), None, 1_000);
        assert!(token.is_fresh(1_100));
        assert!(!token.is_fresh(1_400));
        assert!(token.expires_within(1_500, 120));
        assert!(!token.expires_within(1_000, 120));
    }

    #[tokio::test]
    async fn put_get_and_mark_refreshing() {
        let db = Database::in_memory().await.unwrap();
        let store = TokenStore::new(&db);
        let token = Token::from_oauth("acct", &oauth("a1", Some("r1")), None, 1_000);
        store.put(&token).await.unwrap();
        store.set_refreshing_since("acct", 1_234).await.unwrap();

        let loaded = store.get("acct").await.unwrap().unwrap();
        assert_eq!(loaded.value, "a1");
        assert_eq!(loaded.refreshing_since_ts, 1_234);

        store.delete("acct").await.unwrap();
        assert!(store.get("acct").await.unwrap().is_none());
    }
}
