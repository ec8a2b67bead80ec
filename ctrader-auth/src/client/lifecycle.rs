use crate::client::auth_client::{TokenExchange, TokenExchanger};
use crate::client::{load_credentials, Settings, TokenStore};
use crate::common::{Credentials, OAuthTokens};
use crate::error::{AuthError, RefreshError};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

type RefreshFlight = Shared<BoxFuture<'static, Result<Arc<OAuthTokens>, RefreshError>>>;

/// Owns the current OAuth tokens and serializes refreshes per account.
///
/// Concurrent refreshes for the same account join the exchange already in flight, because
/// the endpoint invalidates a refresh token on first use.
#[derive(Clone)]
pub struct TokenLifecycleManager {
    inner: Arc<Inner>,
}

struct Inner {
    credentials: Option<Credentials>,
    exchange: Arc<dyn TokenExchange>,
    current: RwLock<Option<Arc<OAuthTokens>>>,
    store: Option<TokenStore>,
    in_flight: DashMap<Option<i64>, RefreshFlight>,
}

impl TokenLifecycleManager {
    pub fn new(
        credentials: Option<Credentials>,
        exchange: Arc<dyn TokenExchange>,
        store: Option<TokenStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                credentials,
                exchange,
                current: RwLock::new(None),
                store,
                in_flight: DashMap::new(),
            }),
        }
    }

    /// Wire up credentials, the HTTP exchanger and the token file from settings.
    ///
    /// Missing credentials are not an error here; every later refresh fails instead.
    pub fn from_settings(settings: &Settings) -> Result<Self, AuthError> {
        settings.validate().map_err(AuthError::Configuration)?;

        let credentials = load_credentials(&settings.credentials_file);
        let exchanger = TokenExchanger::new(Duration::from_secs(settings.http_timeout_secs))?;
        let store = TokenStore::new(&settings.token_file);
        let tokens = store.load()?;

        let manager = Self::new(credentials, Arc::new(exchanger), Some(store));
        if let Some(tokens) = tokens {
            manager.set_tokens(tokens);
        }
        Ok(manager)
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.inner.credentials.as_ref()
    }

    pub fn current(&self) -> Option<Arc<OAuthTokens>> {
        self.inner.current.read().clone()
    }

    /// Replace the current tokens without persisting them.
    pub fn set_tokens(&self, tokens: OAuthTokens) {
        *self.inner.current.write() = Some(Arc::new(tokens));
    }

    /// Exchange `refresh_token` for new tokens, joining a refresh already running for the account.
    pub async fn refresh_tokens(
        &self,
        refresh_token: &str,
        existing_account_id: Option<i64>,
    ) -> Result<Arc<OAuthTokens>, RefreshError> {
        let credentials = self
            .inner
            .credentials
            .as_ref()
            .ok_or(RefreshError::CredentialsUnavailable)?;
        if refresh_token.is_empty() {
            return Err(RefreshError::MissingRefreshToken);
        }

        let flight = match self.inner.in_flight.entry(existing_account_id) {
            Entry::Occupied(entry) => {
                tracing::debug!(
                    account_id = ?existing_account_id,
                    "Joining in-flight token refresh"
                );
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let flight = self.start_refresh(credentials, refresh_token, existing_account_id);
                entry.insert(flight.clone());
                flight
            }
        };

        let result = flight.clone().await;
        self.inner
            .in_flight
            .remove_if(&existing_account_id, |_, running| running.ptr_eq(&flight));
        result
    }

    /// Refresh the current tokens unconditionally.
    pub async fn refresh_current(&self) -> Result<Arc<OAuthTokens>, RefreshError> {
        let current = self.current().ok_or(RefreshError::MissingRefreshToken)?;
        self.refresh_tokens(&current.refresh_token, current.account_id)
            .await
    }

    /// Current tokens, refreshed first when they expire within `leeway_seconds`.
    pub async fn ensure_fresh(&self, leeway_seconds: i64) -> Result<Arc<OAuthTokens>, RefreshError> {
        let current = self.current().ok_or(RefreshError::MissingRefreshToken)?;
        if !current.is_expired(leeway_seconds) {
            return Ok(current);
        }

        tracing::info!(
            account_id = ?current.account_id,
            seconds_left = ?current.seconds_to_expiry(),
            "Access token expiring, refreshing"
        );
        self.refresh_tokens(&current.refresh_token, current.account_id)
            .await
    }

    fn start_refresh(
        &self,
        credentials: &Credentials,
        refresh_token: &str,
        existing_account_id: Option<i64>,
    ) -> RefreshFlight {
        let exchange = self.inner.exchange.refresh(credentials, refresh_token);
        let inner = Arc::clone(&self.inner);

        async move {
            let grant = exchange.await.map_err(|e| {
                tracing::warn!(account_id = ?existing_account_id, "Token refresh failed: {}", e);
                RefreshError::from(e)
            })?;

            let tokens = Arc::new(OAuthTokens::from_grant(
                grant,
                existing_account_id,
                Utc::now().timestamp(),
            ));
            inner.install(Arc::clone(&tokens));
            tracing::info!(account_id = ?tokens.account_id, "Token refreshed");
            Ok(tokens)
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    fn install(&self, tokens: Arc<OAuthTokens>) {
        *self.current.write() = Some(Arc::clone(&tokens));

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&tokens) {
                tracing::warn!("Failed to persist refreshed tokens: {}", e);
            }
        }
    }
}
