//! Test doubles for code that depends on the token endpoint.

use crate::client::auth_client::{ExchangeError, TokenExchange};
use crate::common::{Credentials, TokenGrant};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Token endpoint that answers every refresh with the same scripted outcome.
pub struct ScriptedExchange {
    outcome: Result<TokenGrant, ExchangeError>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    last_refresh_token: Mutex<Option<String>>,
}

impl ScriptedExchange {
    /// Grants `access_token` (refresh token `<access_token>-refresh`) valid for an hour.
    pub fn granting(access_token: &str) -> Self {
        Self::with_outcome(Ok(TokenGrant {
            access_token: access_token.to_string(),
            refresh_token: format!("{}-refresh", access_token),
            expires_in: 3600,
            account_id: None,
        }))
    }

    pub fn rejecting(error: &str, description: &str) -> Self {
        Self::with_outcome(Err(ExchangeError::Rejected {
            error: error.to_string(),
            description: Some(description.to_string()),
        }))
    }

    pub fn with_outcome(outcome: Result<TokenGrant, ExchangeError>) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            last_refresh_token: Mutex::new(None),
        }
    }

    /// Hold every answer back for `delay` (tokio time, so paused clocks apply).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_refresh_token(&self) -> Option<String> {
        self.last_refresh_token.lock().clone()
    }
}

impl TokenExchange for ScriptedExchange {
    fn refresh(
        &self,
        _credentials: &Credentials,
        refresh_token: &str,
    ) -> BoxFuture<'static, Result<TokenGrant, ExchangeError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_refresh_token.lock() = Some(refresh_token.to_string());

        let outcome = self.outcome.clone();
        let delay = self.delay;
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outcome
        }
        .boxed()
    }
}
