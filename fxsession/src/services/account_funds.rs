use ctrader_api::messages::accounts::{
    Asset, AssetListReq, Position, PositionUnrealizedPnlReq, PositionUnrealizedPnlRes,
    ReconcileReq, Trader, TraderReq,
};
use ctrader_api::messages::scale_money;
use ctrader_api::{AccountId, Request, Response};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{FetchError, RequestService, Step, TimeBoundedRequest};

/// Balance and margin snapshot of one account, in account currency.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountFunds {
    pub account_id: AccountId,
    pub balance: f64,
    pub balance_version: Option<i64>,
    /// Balance plus net unrealized PnL
    pub equity: f64,
    pub free_margin: f64,
    pub used_margin: f64,
    /// Percent; `None` without open margin
    pub margin_level: Option<f64>,
    pub currency: String,
    pub money_digits: u32,
    pub deposit_asset_id: i64,
    pub manager_bonus: f64,
    pub ib_bonus: f64,
    pub non_withdrawable_bonus: f64,
    pub leverage: Option<f64>,
    pub max_leverage: Option<u32>,
    pub swap_free: bool,
    pub trader_login: Option<i64>,
    pub broker_name: Option<String>,
    pub registration_timestamp: Option<i64>,
    /// Net unrealized PnL per position id
    pub position_pnl: BTreeMap<i64, f64>,
}

#[derive(Debug, Default)]
pub struct FundsProgress {
    trader: Option<Trader>,
    positions: Option<Vec<Position>>,
    assets: Option<Vec<Asset>>,
    pnl: Option<PositionUnrealizedPnlRes>,
    awaiting_pnl: bool,
}

/// Trader, reconcile and asset-list requests combined into one [`AccountFunds`].
///
/// Unrealized PnL is requested only when positions are open, and at most once per
/// `pnl_min_interval`.
pub struct AccountFundsRequest {
    pnl_min_interval: Duration,
    last_pnl_request: Mutex<Option<Instant>>,
}

pub type AccountFundsService = RequestService<AccountFundsRequest>;

impl AccountFundsRequest {
    pub fn new(pnl_min_interval: Duration) -> Self {
        Self {
            pnl_min_interval,
            last_pnl_request: Mutex::new(None),
        }
    }

    fn pnl_allowed(&self) -> bool {
        let mut last = self.last_pnl_request.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.pnl_min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn settle(progress: &FundsProgress) -> Step<AccountFunds> {
        match (&progress.trader, &progress.positions, &progress.assets) {
            (Some(trader), Some(positions), Some(assets))
                if !progress.awaiting_pnl || progress.pnl.is_some() =>
            {
                Step::Complete(aggregate(trader, positions, assets, progress.pnl.as_ref()))
            }
            _ => Step::Claimed,
        }
    }
}

impl Default for AccountFundsRequest {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl TimeBoundedRequest for AccountFundsRequest {
    type Params = AccountId;
    type Progress = FundsProgress;
    type Output = AccountFunds;

    const NAME: &'static str = "account funds";

    fn requests(&self, account_id: &AccountId, _: &mut FundsProgress) -> Vec<Request> {
        vec![
            Request::Trader(TraderReq::new(*account_id)),
            Request::Reconcile(ReconcileReq::new(*account_id)),
            Request::AssetList(AssetListReq::new(*account_id)),
        ]
    }

    fn on_message(
        &self,
        account_id: &AccountId,
        progress: &mut FundsProgress,
        response: &Response,
    ) -> Step<AccountFunds> {
        match response {
            Response::Trader(res) if res.account_id == *account_id => {
                progress.trader = Some(res.trader.clone());
            }
            Response::Reconcile(res) if res.account_id == *account_id => {
                progress.positions = Some(res.positions.clone());
                if !res.positions.is_empty() && self.pnl_allowed() {
                    progress.awaiting_pnl = true;
                    return Step::FollowUp(vec![Request::PositionUnrealizedPnl(
                        PositionUnrealizedPnlReq::new(*account_id),
                    )]);
                }
            }
            Response::AssetList(res) if res.account_id == *account_id => {
                progress.assets = Some(res.assets.clone());
            }
            Response::PositionUnrealizedPnl(res)
                if res.account_id == *account_id && progress.awaiting_pnl =>
            {
                progress.pnl = Some(res.clone());
            }
            Response::Error(error) if error.account_id.map_or(true, |id| id == *account_id) => {
                if ctrader_api::is_already_subscribed(&error.error_code, &error.description) {
                    return Step::Claimed;
                }
                return Step::Failed(error.clone());
            }
            _ => return Step::Ignored,
        }

        Self::settle(progress)
    }
}

impl AccountFundsService {
    pub fn request_funds(&self, account_id: AccountId) -> Result<(), FetchError> {
        self.fetch(account_id)
    }
}

fn aggregate(
    trader: &Trader,
    positions: &[Position],
    assets: &[Asset],
    pnl: Option<&PositionUnrealizedPnlRes>,
) -> AccountFunds {
    let digits = trader.money_digits;
    let money = |value: i64| scale_money(value, digits);

    let mut position_pnl = BTreeMap::new();
    let mut net_pnl = 0.0;
    if let Some(pnl) = pnl {
        for item in &pnl.positions {
            let value = scale_money(item.net_unrealized_pnl, pnl.money_digits);
            net_pnl += value;
            if item.position_id != 0 {
                position_pnl.insert(item.position_id, value);
            }
        }
    }

    let used_margin: f64 = positions
        .iter()
        .map(|p| scale_money(p.used_margin, p.money_digits.unwrap_or(digits)))
        .sum();
    let balance = money(trader.balance);
    let equity = balance + net_pnl;

    let currency = assets
        .iter()
        .find(|asset| asset.asset_id == trader.deposit_asset_id)
        .map(|asset| asset.label().to_string())
        .unwrap_or_else(|| trader.deposit_asset_id.to_string());

    AccountFunds {
        account_id: trader.account_id,
        balance,
        balance_version: trader.balance_version,
        equity,
        free_margin: equity - used_margin,
        used_margin,
        margin_level: (used_margin > 0.0).then(|| equity / used_margin * 100.0),
        currency,
        money_digits: digits,
        deposit_asset_id: trader.deposit_asset_id,
        manager_bonus: money(trader.manager_bonus),
        ib_bonus: money(trader.ib_bonus),
        non_withdrawable_bonus: money(trader.non_withdrawable_bonus),
        leverage: trader.leverage_in_cents.map(|cents| f64::from(cents) / 100.0),
        max_leverage: trader.max_leverage,
        swap_free: trader.swap_free,
        trader_login: trader.trader_login,
        broker_name: trader.broker_name.clone(),
        registration_timestamp: trader.registration_timestamp,
        position_pnl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::services::{RequestOptions, ServiceCallbacks, SetCallbacks};
    use crate::testing::{ErrorProbe, RecordingChannel};
    use ctrader_api::messages::accounts::{
        AssetListRes, PositionUnrealizedPnl, ReconcileRes, TraderRes,
    };
    use ctrader_api::BrokerError;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const ACCOUNT: AccountId = 9;

    fn funds_service(channel: &Arc<RecordingChannel>, bus: &EventBus) -> AccountFundsService {
        RequestService::new(
            AccountFundsRequest::new(Duration::from_secs(2)),
            channel.clone(),
            bus.clone(),
            RequestOptions::default(),
        )
    }

    fn capture(service: &AccountFundsService) -> Arc<parking_lot::Mutex<Vec<AccountFunds>>> {
        let results = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = results.clone();
        service.set_callbacks(ServiceCallbacks {
            on_result: Some(Arc::new(move |funds: AccountFunds| sink.lock().push(funds))),
            ..Default::default()
        });
        results
    }

    fn trader() -> Response {
        Response::Trader(TraderRes {
            account_id: ACCOUNT,
            trader: Trader::new(ACCOUNT, 1_000_000, 2)
                .deposit_asset_id(15)
                .leverage_in_cents(50_000u32)
                .broker_name("Demo Broker"),
        })
    }

    fn assets() -> Response {
        Response::AssetList(AssetListRes {
            account_id: ACCOUNT,
            assets: vec![Asset {
                asset_id: 15,
                name: "USD".to_string(),
                display_name: None,
            }],
        })
    }

    fn reconcile(positions: Vec<Position>) -> Response {
        Response::Reconcile(ReconcileRes {
            account_id: ACCOUNT,
            positions,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_funds_without_positions() {
        let channel = RecordingChannel::authenticated();
        let service = funds_service(&channel, &EventBus::new());
        let results = capture(&service);

        service.request_funds(ACCOUNT).unwrap();
        assert_eq!(channel.sent_names(), vec!["trader", "reconcile", "asset_list"]);

        channel.deliver(&trader());
        channel.deliver(&reconcile(Vec::new()));
        assert!(results.lock().is_empty());
        channel.deliver(&assets());

        let results = results.lock();
        assert_eq!(results.len(), 1);
        let funds = &results[0];
        assert_eq!(funds.balance, 10_000.0);
        assert_eq!(funds.equity, 10_000.0);
        assert_eq!(funds.free_margin, 10_000.0);
        assert_eq!(funds.margin_level, None);
        assert_eq!(funds.currency, "USD");
        assert_eq!(funds.leverage, Some(500.0));
        assert_eq!(channel.send_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_funds_with_positions_include_pnl() {
        let channel = RecordingChannel::authenticated();
        let service = funds_service(&channel, &EventBus::new());
        let results = capture(&service);

        service.request_funds(ACCOUNT).unwrap();
        channel.deliver(&trader());
        channel.deliver(&assets());
        channel.deliver(&reconcile(vec![Position {
            position_id: 77,
            used_margin: 200_000,
            money_digits: None,
        }]));
        assert_eq!(
            channel.sent_names().last(),
            Some(&"position_unrealized_pnl")
        );
        assert!(results.lock().is_empty());

        channel.deliver(&Response::PositionUnrealizedPnl(PositionUnrealizedPnlRes {
            account_id: ACCOUNT,
            money_digits: 2,
            positions: vec![PositionUnrealizedPnl {
                position_id: 77,
                gross_unrealized_pnl: 60_000,
                net_unrealized_pnl: 50_000,
            }],
        }));

        let results = results.lock();
        let funds = &results[0];
        assert_eq!(funds.used_margin, 2_000.0);
        assert_eq!(funds.equity, 10_500.0);
        assert_eq!(funds.free_margin, 8_500.0);
        assert_eq!(funds.margin_level, Some(525.0));
        assert_eq!(funds.position_pnl, BTreeMap::from([(77, 500.0)]));
        assert_eq!((channel.added(), channel.removed()), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pnl_requests_are_rate_limited() {
        let channel = RecordingChannel::authenticated();
        let service = funds_service(&channel, &EventBus::new());
        let results = capture(&service);
        let open = || {
            reconcile(vec![Position {
                position_id: 1,
                used_margin: 100,
                money_digits: Some(2),
            }])
        };

        service.request_funds(ACCOUNT).unwrap();
        channel.deliver(&trader());
        channel.deliver(&assets());
        channel.deliver(&open());
        channel.deliver(&Response::PositionUnrealizedPnl(PositionUnrealizedPnlRes {
            account_id: ACCOUNT,
            money_digits: 2,
            positions: Vec::new(),
        }));
        assert_eq!(results.lock().len(), 1);

        // Within the interval the snapshot completes without PnL
        service.request_funds(ACCOUNT).unwrap();
        channel.deliver(&trader());
        channel.deliver(&assets());
        channel.deliver(&open());
        assert_eq!(results.lock().len(), 2);
        let pnl_requests = channel
            .sent_names()
            .into_iter()
            .filter(|name| *name == "position_unrealized_pnl")
            .count();
        assert_eq!(pnl_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_subscribed_error_is_consumed() {
        let channel = RecordingChannel::authenticated();
        let bus = EventBus::new();
        let probe = ErrorProbe::attach(&bus);
        let service = funds_service(&channel, &bus);

        service.request_funds(ACCOUNT).unwrap();
        assert!(channel.deliver(&Response::Error(BrokerError::new(
            "ALREADY_SUBSCRIBED",
            "Already subscribed"
        ))));
        assert!(service.is_busy());
        assert_eq!(probe.error_count(), 0);

        assert!(channel.deliver(&Response::Error(
            BrokerError::new("TRADING_DISABLED", "trading disabled").for_account(ACCOUNT)
        )));
        assert!(!service.is_busy());
        let errors = probe.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, "account funds");
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_accounts_are_ignored() {
        let channel = RecordingChannel::authenticated();
        let service = funds_service(&channel, &EventBus::new());
        service.request_funds(ACCOUNT).unwrap();

        assert!(!channel.deliver(&Response::Trader(TraderRes {
            account_id: 1,
            trader: Trader::new(1, 5, 2),
        })));
        assert!(!channel.deliver(&Response::Error(
            BrokerError::new("TRADING_DISABLED", "x").for_account(1)
        )));
    }
}
