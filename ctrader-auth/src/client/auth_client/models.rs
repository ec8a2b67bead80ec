use crate::common::TokenGrant;
use serde::Deserialize;

/// Raw token endpoint payload. Either the token fields or the OAuth error pair is set.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default, alias = "accessToken")]
    pub access_token: Option<String>,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub account_id: Option<i64>,
    #[serde(default, alias = "errorCode")]
    pub error: Option<String>,
    #[serde(default, alias = "description")]
    pub error_description: Option<String>,
}

impl TokenResponse {
    pub fn into_grant(self) -> Result<TokenGrant, ExchangeError> {
        if let Some(error) = self.error.filter(|e| !e.is_empty()) {
            return Err(ExchangeError::Rejected {
                error,
                description: self.error_description,
            });
        }

        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExchangeError::Malformed("missing access_token".into()))?;
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExchangeError::Malformed("missing refresh_token".into()))?;
        let expires_in = self
            .expires_in
            .filter(|secs| *secs > 0)
            .ok_or_else(|| ExchangeError::Malformed("missing or non-positive expires_in".into()))?;

        Ok(TokenGrant {
            access_token,
            refresh_token,
            expires_in,
            account_id: self.account_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    Transport(String),
    Rejected {
        error: String,
        description: Option<String>,
    },
    Malformed(String),
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "HTTP error: {}", msg),
            Self::Rejected {
                error,
                description: Some(description),
            } => write!(f, "OAuth error: {} ({})", description, error),
            Self::Rejected {
                error,
                description: None,
            } => write!(f, "OAuth error: {}", error),
            Self::Malformed(msg) => write!(f, "Invalid token response: {}", msg),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
