mod models;

use crate::common::{Credentials, OAuthTokens, TokenGrant, AUTH_URL};
use crate::error::AuthError;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
pub use models::ExchangeError;
use models::*;
use reqwest::{Client, Url};
use secrecy::ExposeSecret;
use std::time::Duration;

/// Exchanges a refresh token for a new grant.
///
/// Object safe so the lifecycle manager can be driven by a scripted endpoint in tests.
pub trait TokenExchange: Send + Sync {
    fn refresh(
        &self,
        credentials: &Credentials,
        refresh_token: &str,
    ) -> BoxFuture<'static, Result<TokenGrant, ExchangeError>>;
}

/// HTTP client for the broker's OAuth token endpoint.
#[derive(Clone)]
pub struct TokenExchanger {
    http_client: Client,
}

impl TokenExchanger {
    pub fn new(timeout: Duration) -> Result<Self, AuthError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    /// URL the user opens to grant the `trading` scope.
    pub fn build_authorize_url(
        credentials: &Credentials,
        redirect_uri: &str,
    ) -> Result<String, AuthError> {
        let url = Url::parse_with_params(
            AUTH_URL,
            &[
                ("client_id", credentials.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", "trading"),
            ],
        )
        .map_err(|e| AuthError::Configuration(format!("Invalid authorize URL: {}", e)))?;

        Ok(url.into())
    }

    /// Trade an authorization code for the first set of tokens.
    pub async fn exchange_code(
        &self,
        credentials: &Credentials,
        code: &str,
        redirect_uri: &str,
        existing_account_id: Option<i64>,
    ) -> Result<OAuthTokens, ExchangeError> {
        let params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("client_id", credentials.client_id.clone()),
            ("client_secret", credentials.client_secret.expose_secret().to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
        ];

        let grant = post_token_request(
            self.http_client.clone(),
            credentials.token_endpoint.clone(),
            params,
        )
        .await?;

        Ok(OAuthTokens::from_grant(
            grant,
            existing_account_id,
            Utc::now().timestamp(),
        ))
    }
}

impl TokenExchange for TokenExchanger {
    fn refresh(
        &self,
        credentials: &Credentials,
        refresh_token: &str,
    ) -> BoxFuture<'static, Result<TokenGrant, ExchangeError>> {
        let params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", credentials.client_id.clone()),
            ("client_secret", credentials.client_secret.expose_secret().to_string()),
        ];

        post_token_request(
            self.http_client.clone(),
            credentials.token_endpoint.clone(),
            params,
        )
        .boxed()
    }
}

async fn post_token_request(
    http_client: Client,
    endpoint: String,
    params: Vec<(&'static str, String)>,
) -> Result<TokenGrant, ExchangeError> {
    let resp = http_client.post(&endpoint).form(&params).send().await?;
    let status = resp.status();
    let body = resp.text().await?;

    let parsed = match serde_json::from_str::<TokenResponse>(&body) {
        Ok(parsed) => parsed,
        Err(_) if !status.is_success() => {
            return Err(ExchangeError::Rejected {
                error: status.to_string(),
                description: None,
            });
        }
        Err(e) => return Err(ExchangeError::Malformed(e.to_string())),
    };

    if !status.is_success() && parsed.error.is_none() {
        return Err(ExchangeError::Rejected {
            error: status.to_string(),
            description: parsed.error_description,
        });
    }

    parsed.into_grant()
}
