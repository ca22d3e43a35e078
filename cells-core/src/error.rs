use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("#{code}: {message}")]
    Coded { code: ErrorCode, message: String },
}

/// Closed set of error codes the sync layer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnectionFailed,
    Timeout,
    Unauthorized,
    TokenExpired,
    NoTokenAvailable,
    RefreshTokenExpired,
    Forbidden,
    NotFound,
    RateLimited,
    ServerError,
    BadRequest,
    IllegalArgument,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "con_failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Unauthorized => "authentication_required",
            ErrorCode::TokenExpired => "token_expired",
            ErrorCode::NoTokenAvailable => "no_token_available",
            ErrorCode::RefreshTokenExpired => "refresh_token_expired",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not_found",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::ServerError => "server_error",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::IllegalArgument => "illegal_argument",
            ErrorCode::Internal => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SdkError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        SdkError::Coded {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SdkError::Request(err) if err.is_timeout() => ErrorCode::Timeout,
            SdkError::Request(err) if err.is_decode() => ErrorCode::Internal,
            SdkError::Request(_) => ErrorCode::ConnectionFailed,
            SdkError::Url(_) => ErrorCode::IllegalArgument,
            SdkError::Api { status, body } => classify_api_status(*status, body),
            SdkError::Coded { code, .. } => *code,
        }
    }

    /// Unreachable host, closed connection or timeout: the caller should wait for
    /// connectivity rather than report a failure.
    pub fn is_network_error(&self) -> bool {
        matches!(self.code(), ErrorCode::ConnectionFailed | ErrorCode::Timeout)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::ConnectionFailed
                | ErrorCode::Timeout
                | ErrorCode::RateLimited
                | ErrorCode::ServerError
        )
    }
}

fn classify_api_status(status: StatusCode, body: &str) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => {
            if body.to_ascii_lowercase().contains("expired") {
                ErrorCode::TokenExpired
            } else {
                ErrorCode::Unauthorized
            }
        }
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorCode::Timeout,
        s if s.is_server_error() => ErrorCode::ServerError,
        _ => ErrorCode::BadRequest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, body: &str) -> SdkError {
        SdkError::Api {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
        }
    }

    #[test]
    fn classifies_unauthorized_and_expired_tokens() {
        assert_eq!(api(401, "").code(), ErrorCode::Unauthorized);
        assert_eq!(
            api(401, "{\"error\":\"Token is Expired\"}").code(),
            ErrorCode::TokenExpired
        );
    }

    #[test]
    fn classifies_server_and_client_errors() {
        assert_eq!(api(404, "").code(), ErrorCode::NotFound);
        assert_eq!(api(429, "").code(), ErrorCode::RateLimited);
        assert_eq!(api(503, "").code(), ErrorCode::ServerError);
        assert_eq!(api(400, "").code(), ErrorCode::BadRequest);
        assert!(api(503, "").is_retryable());
        assert!(!api(400, "").is_retryable());
    }

    #[test]
    fn coded_errors_keep_their_code() {
        let err = SdkError::new(ErrorCode::NoTokenAvailable, "no token for account");
        assert_eq!(err.code(), ErrorCode::NoTokenAvailable);
        assert!(!err.is_network_error());
        assert_eq!(err.to_string(), "#no_token_available: no token for account");
    }
}
