use super::AccountId;
use crate::macros::setter;
use serde::{Deserialize, Serialize};

// Common

/// Trader account snapshot. Money amounts are integers scaled by `10^money_digits`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trader {
    pub account_id: AccountId,
    pub balance: i64,
    pub balance_version: Option<i64>,
    pub money_digits: u32,
    /// Asset the account balance is held in
    pub deposit_asset_id: i64,
    #[serde(default)]
    pub manager_bonus: i64,
    #[serde(default)]
    pub ib_bonus: i64,
    #[serde(default)]
    pub non_withdrawable_bonus: i64,
    pub leverage_in_cents: Option<u32>,
    pub max_leverage: Option<u32>,
    #[serde(default)]
    pub swap_free: bool,
    pub trader_login: Option<i64>,
    pub broker_name: Option<String>,
    /// Milliseconds since the epoch
    pub registration_timestamp: Option<i64>,
}

impl Trader {
    pub fn new(account_id: AccountId, balance: i64, money_digits: u32) -> Self {
        Self {
            account_id,
            balance,
            balance_version: None,
            money_digits,
            deposit_asset_id: 0,
            manager_bonus: 0,
            ib_bonus: 0,
            non_withdrawable_bonus: 0,
            leverage_in_cents: None,
            max_leverage: None,
            swap_free: false,
            trader_login: None,
            broker_name: None,
            registration_timestamp: None,
        }
    }

    setter!(deposit_asset_id: i64);
    setter!(manager_bonus: i64);
    setter!(ib_bonus: i64);
    setter!(non_withdrawable_bonus: i64);
    setter!(swap_free: bool);
    setter!(opt balance_version: i64);
    setter!(opt leverage_in_cents: u32);
    setter!(opt max_leverage: u32);
    setter!(opt trader_login: i64);
    setter!(opt broker_name: String);
    setter!(opt registration_timestamp: i64);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: i64,
    pub used_margin: i64,
    /// Falls back to the trader's digits when absent
    pub money_digits: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: i64,
    pub name: String,
    pub display_name: Option<String>,
}

impl Asset {
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUnrealizedPnl {
    pub position_id: i64,
    pub gross_unrealized_pnl: i64,
    pub net_unrealized_pnl: i64,
}

// Requests

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraderReq {
    pub account_id: AccountId,
}

impl TraderReq {
    pub fn new(account_id: AccountId) -> Self {
        Self { account_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReq {
    pub account_id: AccountId,
    pub return_protection_orders: bool,
}

impl ReconcileReq {
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            return_protection_orders: false,
        }
    }

    setter!(return_protection_orders: bool);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetListReq {
    pub account_id: AccountId,
}

impl AssetListReq {
    pub fn new(account_id: AccountId) -> Self {
        Self { account_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionUnrealizedPnlReq {
    pub account_id: AccountId,
}

impl PositionUnrealizedPnlReq {
    pub fn new(account_id: AccountId) -> Self {
        Self { account_id }
    }
}

// Responses

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderRes {
    pub account_id: AccountId,
    pub trader: Trader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileRes {
    pub account_id: AccountId,
    pub positions: Vec<Position>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetListRes {
    pub account_id: AccountId,
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUnrealizedPnlRes {
    pub account_id: AccountId,
    pub money_digits: u32,
    pub positions: Vec<PositionUnrealizedPnl>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trader_setters() {
        let trader = Trader::new(9, 100_000, 2)
            .deposit_asset_id(15)
            .broker_name("Pepperstone")
            .leverage_in_cents(50_000u32);

        assert_eq!(trader.deposit_asset_id, 15);
        assert_eq!(trader.broker_name.as_deref(), Some("Pepperstone"));
        assert_eq!(trader.leverage_in_cents, Some(50_000));
        assert_eq!(trader.max_leverage, None);
    }

    #[test]
    fn test_asset_label_prefers_display_name() {
        let asset = Asset {
            asset_id: 1,
            name: "USD".into(),
            display_name: Some("US Dollar".into()),
        };
        assert_eq!(asset.label(), "US Dollar");

        let bare = Asset {
            display_name: Some(String::new()),
            ..asset
        };
        assert_eq!(bare.label(), "USD");
    }

    #[test]
    fn test_trader_deserializes_with_missing_bonuses() {
        let json = r#"{
            "account_id": 3,
            "balance": 250000,
            "balance_version": 12,
            "money_digits": 2,
            "deposit_asset_id": 15,
            "leverage_in_cents": null,
            "max_leverage": null,
            "trader_login": null,
            "broker_name": null,
            "registration_timestamp": null
        }"#;
        let trader: Trader = serde_json::from_str(json).unwrap();
        assert_eq!(trader.balance, 250000);
        assert_eq!(trader.manager_bonus, 0);
        assert!(!trader.swap_free);
    }
}
