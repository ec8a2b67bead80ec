use anyhow::{Context, Result};
use ctrader_api::{AccountId, Response, SymbolId};
use ctrader_auth::{Settings, TokenLifecycleManager};
use std::sync::Arc;

use crate::bus::EventBus;
use crate::config::RuntimeSettings;
use crate::log_buffer::LogHistory;
use crate::services::{
    AccountFundsRequest, AccountFundsService, FetchError, RequestOptions, RequestService,
    TrendbarHistoryRequest, TrendbarHistoryService,
};
use crate::session::{BrokerChannel, ConnectionStatus, Session, SessionError, Transport};

/// One broker account wired up: the session and the data services that ride on it.
///
/// Inbound messages from the transport go to [`Runtime::handle_message`]; the session hands
/// them to the services' handlers.
pub struct Runtime {
    bus: EventBus,
    logs: LogHistory,
    session: Session,
    funds: AccountFundsService,
    history: TrendbarHistoryService,
    history_count: u32,
}

impl Runtime {
    pub fn new(
        account_id: AccountId,
        transport: Arc<dyn Transport>,
        tokens: TokenLifecycleManager,
        settings: &RuntimeSettings,
        bus: EventBus,
        logs: LogHistory,
    ) -> Self {
        let session = Session::new(account_id, transport, tokens, bus.clone());
        let channel: Arc<dyn BrokerChannel> = Arc::new(session.clone());
        let options = RequestOptions {
            timeout: settings.request_timeout(),
            retry: settings.retry_policy(),
        };

        let funds = RequestService::new(
            AccountFundsRequest::new(settings.pnl_min_interval()),
            channel.clone(),
            bus.clone(),
            options,
        );
        let history = RequestService::new(TrendbarHistoryRequest::new(), channel, bus.clone(), options);

        Self {
            bus,
            logs,
            session,
            funds,
            history,
            history_count: settings.history_default_count,
        }
    }

    /// Build the token manager from auth settings and wire everything on top of it.
    pub fn from_settings(
        account_id: AccountId,
        transport: Arc<dyn Transport>,
        settings: &RuntimeSettings,
        auth: &Settings,
        bus: EventBus,
        logs: LogHistory,
    ) -> Result<Self> {
        settings
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid runtime settings")?;
        let tokens =
            TokenLifecycleManager::from_settings(auth).context("Failed to set up token lifecycle")?;
        let runtime = Self::new(account_id, transport, tokens, settings, bus, logs);
        runtime.session.set_leeway(auth.token_leeway_secs);
        Ok(runtime)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn logs(&self) -> &LogHistory {
        &self.logs
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn funds(&self) -> &AccountFundsService {
        &self.funds
    }

    pub fn history(&self) -> &TrendbarHistoryService {
        &self.history
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    pub fn connect(&self) -> Result<(), SessionError> {
        self.session.connect()
    }

    pub fn disconnect(&self) {
        self.funds.cancel();
        self.history.cancel();
        self.session.disconnect();
    }

    pub fn handle_message(&self, response: &Response) {
        self.session.handle_message(response);
    }

    pub fn on_transport_lost(&self, reason: &str) {
        self.session.on_transport_lost(reason);
    }

    /// Fetch funds for the session's account.
    pub fn refresh_funds(&self) -> Result<(), FetchError> {
        self.funds.request_funds(self.session.account_id())
    }

    /// Fetch the configured default number of bars for `symbol_id`.
    pub fn load_history(
        &self,
        symbol_id: SymbolId,
        timeframe: &str,
    ) -> Result<(), FetchError> {
        self.history.request_history(
            self.session.account_id(),
            symbol_id,
            self.history_count,
            timeframe,
        )
    }
}
