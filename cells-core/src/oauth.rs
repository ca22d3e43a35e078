use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_CLIENT_ID: &str = "cells-client";
/// Upper bound for one grant request, connection included.
pub const GRANT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl OAuthError {
    /// The server rejected the refresh token itself; retrying cannot succeed.
    pub fn is_invalid_grant(&self) -> bool {
        match self {
            OAuthError::Api { status, body } => {
                (*status == StatusCode::BAD_REQUEST || *status == StatusCode::UNAUTHORIZED)
                    && (body.contains("invalid_grant") || body.contains("expired"))
            }
            _ => false,
        }
    }

    pub fn is_network_error(&self) -> bool {
        match self {
            OAuthError::Request(err) => !err.is_decode(),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: Option<String>,
}

impl OAuthClient {
    pub fn new(base_url: &str, client_id: impl Into<String>) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::builder().timeout(GRANT_TIMEOUT).build()?,
            base_url: Url::parse(base_url)?,
            client_id: client_id.into(),
            client_secret: None,
        })
    }

    pub fn with_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, OAuthError> {
        let url = self.base_url.join("/oauth2/token")?;
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self.http.post(url).form(&form).send().await?;
        if response.status().is_success() {
            Ok(response.json::<OAuthToken>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(OAuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}
