use chrono::Utc;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Default OAuth token endpoint.
pub const TOKEN_URL: &str = "https://openapi.ctrader.com/apps/token";
/// Browser entry point for the authorization-code flow.
pub const AUTH_URL: &str = "https://openapi.ctrader.com/apps/auth";

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostType {
    #[default]
    Demo,
    Live,
}

/// Application credentials issued by the broker. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_endpoint: String,
    pub host_type: HostType,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            token_endpoint: TOKEN_URL.to_string(),
            host_type: HostType::default(),
        }
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }
}

/// Successful answer from the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Always positive
    pub expires_in: i64,
    pub account_id: Option<i64>,
}

/// User tokens. Never mutated in place: a refresh produces a new value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Epoch seconds
    pub expires_at: Option<i64>,
    pub account_id: Option<i64>,
}

impl OAuthTokens {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: i64,
        account_id: Option<i64>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: Some(expires_at),
            account_id,
        }
    }

    /// Build tokens from a grant received at `now`. The grant's account wins over `existing_account_id`.
    pub fn from_grant(grant: TokenGrant, existing_account_id: Option<i64>, now: i64) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: Some(now + grant.expires_in),
            account_id: grant.account_id.or(existing_account_id),
        }
    }

    pub fn is_expired(&self, leeway_seconds: i64) -> bool {
        self.is_expired_at(Utc::now().timestamp(), leeway_seconds)
    }

    /// Unknown expiry counts as expired.
    pub fn is_expired_at(&self, now: i64, leeway_seconds: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => now + leeway_seconds.max(0) >= expires_at,
            None => true,
        }
    }

    pub fn seconds_to_expiry(&self) -> Option<i64> {
        self.seconds_to_expiry_at(Utc::now().timestamp())
    }

    pub fn seconds_to_expiry_at(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|expires_at| (expires_at - now).max(0))
    }
}

impl std::fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("account_id", &self.account_id)
            .finish()
    }
}
