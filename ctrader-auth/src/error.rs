use crate::client::auth_client::ExchangeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Token storage error: {0}")]
    TokenStorage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

impl From<config::ConfigError> for AuthError {
    fn from(err: config::ConfigError) -> Self {
        AuthError::Configuration(err.to_string())
    }
}

/// Outcome of a failed refresh. Cloneable so every caller joined on one refresh sees it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("OAuth credentials are unavailable")]
    CredentialsUnavailable,

    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("token exchange failed: {0}")]
    Exchange(#[from] ExchangeError),
}

impl RefreshError {
    /// The endpoint refused the refresh token; only a new authorization can fix it.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Exchange(ExchangeError::Rejected { .. }))
    }
}
