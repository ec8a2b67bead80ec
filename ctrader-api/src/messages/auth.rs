use super::AccountId;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

// Requests

/// Authorizes the application on a freshly opened channel.
#[derive(Debug, Clone)]
pub struct ApplicationAuthReq {
    pub client_id: String,
    client_secret: SecretString,
}

impl ApplicationAuthReq {
    pub fn new(client_id: impl Into<String>, client_secret: SecretString) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
        }
    }

    pub fn client_secret(&self) -> &str {
        self.client_secret.expose_secret()
    }
}

/// Authorizes a trading account with the user's OAuth access token.
#[derive(Debug, Clone)]
pub struct AccountAuthReq {
    pub account_id: AccountId,
    access_token: SecretString,
}

impl AccountAuthReq {
    pub fn new(account_id: AccountId, access_token: impl Into<String>) -> Self {
        Self {
            account_id,
            access_token: SecretString::from(access_token.into()),
        }
    }

    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }
}

// Responses

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAuthRes {
    pub account_id: AccountId,
}
