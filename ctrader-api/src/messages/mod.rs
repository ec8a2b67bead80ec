pub mod accounts;
pub mod auth;
pub mod trendbars;

use crate::error::BrokerError;
use accounts::*;
use auth::*;
use trendbars::*;

/// Broker account identifier (`ctidTraderAccountId`).
pub type AccountId = i64;
pub type SymbolId = i64;

/// Outbound messages understood by the broker session channel.
#[derive(Debug, Clone)]
pub enum Request {
    ApplicationAuth(ApplicationAuthReq),
    AccountAuth(AccountAuthReq),
    Trader(TraderReq),
    Reconcile(ReconcileReq),
    AssetList(AssetListReq),
    PositionUnrealizedPnl(PositionUnrealizedPnlReq),
    GetTrendbars(GetTrendbarsReq),
    Heartbeat,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApplicationAuth(_) => "application_auth",
            Self::AccountAuth(_) => "account_auth",
            Self::Trader(_) => "trader",
            Self::Reconcile(_) => "reconcile",
            Self::AssetList(_) => "asset_list",
            Self::PositionUnrealizedPnl(_) => "position_unrealized_pnl",
            Self::GetTrendbars(_) => "get_trendbars",
            Self::Heartbeat => "heartbeat",
        }
    }

    pub fn account_id(&self) -> Option<AccountId> {
        match self {
            Self::AccountAuth(req) => Some(req.account_id),
            Self::Trader(req) => Some(req.account_id),
            Self::Reconcile(req) => Some(req.account_id),
            Self::AssetList(req) => Some(req.account_id),
            Self::PositionUnrealizedPnl(req) => Some(req.account_id),
            Self::GetTrendbars(req) => Some(req.account_id),
            Self::ApplicationAuth(_) | Self::Heartbeat => None,
        }
    }
}

/// Inbound messages delivered by the broker session channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    ApplicationAuth,
    AccountAuth(AccountAuthRes),
    Trader(TraderRes),
    Reconcile(ReconcileRes),
    AssetList(AssetListRes),
    PositionUnrealizedPnl(PositionUnrealizedPnlRes),
    Trendbars(GetTrendbarsRes),
    Error(BrokerError),
    Heartbeat,
    /// The server dropped the account session.
    AccountDisconnect { account_id: AccountId },
    /// The access token was revoked for the listed accounts.
    AccountsTokenInvalidated {
        account_ids: Vec<AccountId>,
        reason: String,
    },
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApplicationAuth => "application_auth",
            Self::AccountAuth(_) => "account_auth",
            Self::Trader(_) => "trader",
            Self::Reconcile(_) => "reconcile",
            Self::AssetList(_) => "asset_list",
            Self::PositionUnrealizedPnl(_) => "position_unrealized_pnl",
            Self::Trendbars(_) => "trendbars",
            Self::Error(_) => "error",
            Self::Heartbeat => "heartbeat",
            Self::AccountDisconnect { .. } => "account_disconnect",
            Self::AccountsTokenInvalidated { .. } => "accounts_token_invalidated",
        }
    }
}

/// Scale an integer money amount by `10^digits`.
pub fn scale_money(value: i64, digits: u32) -> f64 {
    value as f64 / 10f64.powi(digits as i32)
}
