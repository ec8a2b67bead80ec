pub mod auth_client;
mod config;
mod lifecycle;
mod token_storage;

pub use auth_client::{ExchangeError, TokenExchange, TokenExchanger};
pub use config::Settings;
pub use lifecycle::TokenLifecycleManager;
pub use token_storage::TokenStore;

use crate::common::{Credentials, HostType, TOKEN_URL};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    token_endpoint: Option<String>,
    #[serde(default)]
    host_type: HostType,
}

/// Load application credentials from a JSON file.
///
/// Fails softly: a missing, unreadable or incomplete file yields `None` and a warning.
/// Callers treat `None` as "no refresh possible".
pub fn load_credentials(path: &Path) -> Option<Credentials> {
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Credentials file unavailable: {}", e);
            return None;
        }
    };

    let file: CredentialsFile = match serde_json::from_str(&json) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Credentials file is malformed: {}", e);
            return None;
        }
    };

    if file.client_id.is_empty() || file.client_secret.is_empty() {
        tracing::warn!(path = %path.display(), "Credentials file lacks client_id or client_secret");
        return None;
    }

    Some(Credentials {
        client_id: file.client_id,
        client_secret: SecretString::from(file.client_secret),
        token_endpoint: file
            .token_endpoint
            .filter(|endpoint| !endpoint.is_empty())
            .unwrap_or_else(|| TOKEN_URL.to_string()),
        host_type: file.host_type,
    })
}
