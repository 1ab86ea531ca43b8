use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Reasons an access token could not be turned into claims.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("token must have three dot-separated segments, found {0}")]
    Malformed(usize),
    #[error("token payload is not valid base64url: {0}")]
    Base64(String),
    #[error("token payload is not a JSON object: {0}")]
    Json(String),
    #[error("token is missing required claim '{0}'")]
    MissingClaim(&'static str),
}

/// Reasons a credential renewal failed. Cloned to every caller awaiting the same renewal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("refresh endpoint rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("refresh response did not include an access token")]
    IncompletePayload,
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refreshed token could not be decoded: {0}")]
    Decode(#[from] DecodeError),
    #[error("could not persist refreshed credential: {0}")]
    Storage(String),
    #[error("session changed while the refresh was in flight")]
    Superseded,
    #[error("refresh task aborted")]
    Aborted,
}

/// Errors surfaced by authentication, session management and authenticated requests.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid credential: {0}")]
    Decode(#[from] DecodeError),
    #[error("credential renewal failed: {0}")]
    Refresh(#[from] RefreshFailure),
    #[error("Sesión expirada. Por favor inicia sesión nuevamente.")]
    SessionExpired,
    #[error("{message}")]
    Api { status: StatusCode, message: String },
    #[error("invalid federated login redirect: {0}")]
    InvalidRedirect(String),
    #[error("{0}")]
    FederatedLogin(String),
    #[error("server response is missing '{0}'")]
    IncompleteResponse(&'static str),
}

impl AuthError {
    /// Whether this error ended the session (the caller should send the user back to login).
    pub fn is_session_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::SessionExpired | AuthError::Refresh(_) | AuthError::Decode(_)
        )
    }
}
