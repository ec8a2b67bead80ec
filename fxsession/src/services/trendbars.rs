use chrono::Utc;
use ctrader_api::messages::trendbars::{Bar, GetTrendbarsReq, Trendbar, TrendbarPeriod};
use ctrader_api::{AccountId, Request, Response, SymbolId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{FetchError, RequestService, Step, TimeBoundedRequest};

/// Span asked for when the first answer comes back empty.
const WIDE_WINDOW_MINUTES: i64 = 60 * 24 * 14;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryParams {
    pub account_id: AccountId,
    pub symbol_id: SymbolId,
    pub count: u32,
    pub period: TrendbarPeriod,
    /// Explicit `[from, to]` in ms; the latest `count` bars otherwise
    pub range: Option<(i64, i64)>,
}

impl HistoryParams {
    pub fn latest(
        account_id: AccountId,
        symbol_id: SymbolId,
        count: u32,
        period: TrendbarPeriod,
    ) -> Self {
        Self {
            account_id,
            symbol_id,
            count,
            period,
            range: None,
        }
    }

    pub fn with_range(mut self, from_ms: i64, to_ms: i64) -> Self {
        self.range = Some((from_ms, to_ms));
        self
    }
}

#[derive(Debug, Default)]
pub struct HistoryProgress {
    period: Option<TrendbarPeriod>,
    ranges: VecDeque<(i64, i64)>,
    chunked: bool,
    current: Option<GetTrendbarsReq>,
    bars: Vec<Trendbar>,
    cursor: Option<i64>,
    widened: bool,
    fell_back: bool,
}

/// Decoded bars for one symbol, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendbarHistory {
    pub account_id: AccountId,
    pub symbol_id: SymbolId,
    pub period: TrendbarPeriod,
    pub bars: Vec<Bar>,
}

/// Historical bars, fetched in one or more span-limited requests.
///
/// The broker limits requests by time span rather than bar count, so each request covers
/// `count * period` minutes.
#[derive(Debug, Default)]
pub struct TrendbarHistoryRequest {
    last_window: AtomicI64,
}

pub type TrendbarHistoryService = RequestService<TrendbarHistoryRequest>;

impl TrendbarHistoryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Span in minutes of the most recently prepared request.
    pub fn last_request_window(&self) -> i64 {
        self.last_window.load(Ordering::SeqCst)
    }

    fn record_window(&self, minutes: i64) {
        self.last_window.store(minutes, Ordering::SeqCst);
    }

    fn prepare(
        &self,
        params: &HistoryParams,
        period: TrendbarPeriod,
        window_minutes: i64,
        range: Option<(i64, i64)>,
    ) -> GetTrendbarsReq {
        let (from, to) = range.unwrap_or_else(|| {
            let to = aligned_now(period);
            (to.saturating_sub(minutes_to_ms(window_minutes)), to)
        });
        self.record_window(window_minutes);

        GetTrendbarsReq::new(params.account_id, params.symbol_id, period)
            .range(from, to)
            .count(params.count)
    }

    fn first_request(&self, params: &HistoryParams, progress: &mut HistoryProgress) -> GetTrendbarsReq {
        let period = progress.period.unwrap_or(params.period);
        match progress.ranges.pop_front() {
            Some((from, to)) => self.prepare(params, period, span_minutes(from, to), Some((from, to))),
            None => self.prepare(params, period, period.window_minutes(params.count), None),
        }
    }
}

impl TimeBoundedRequest for TrendbarHistoryRequest {
    type Params = HistoryParams;
    type Progress = HistoryProgress;
    type Output = TrendbarHistory;

    const NAME: &'static str = "trendbar history";

    fn requests(&self, params: &HistoryParams, progress: &mut HistoryProgress) -> Vec<Request> {
        progress.period = Some(params.period);
        if let Some((from, to)) = params.range {
            progress.ranges = chunk_ranges(from, to, params.count, params.period).into();
            progress.chunked = !progress.ranges.is_empty();
        }

        let request = self.first_request(params, progress);
        progress.current = Some(request.clone());
        vec![Request::GetTrendbars(request)]
    }

    /// Resend the request that timed out, keeping bars already received.
    fn retry_requests(&self, params: &HistoryParams, progress: &mut HistoryProgress) -> Vec<Request> {
        match &progress.current {
            Some(request) => vec![Request::GetTrendbars(request.clone())],
            None => {
                *progress = HistoryProgress::default();
                self.requests(params, progress)
            }
        }
    }

    fn on_message(
        &self,
        params: &HistoryParams,
        progress: &mut HistoryProgress,
        response: &Response,
    ) -> Step<TrendbarHistory> {
        let res = match response {
            Response::Trendbars(res)
                if res.account_id == params.account_id && res.symbol_id == params.symbol_id =>
            {
                res
            }
            Response::Error(error)
                if error.account_id.map_or(true, |id| id == params.account_id) =>
            {
                return Step::Failed(error.clone());
            }
            _ => return Step::Ignored,
        };
        let Some(current) = progress.current.clone() else {
            return Step::Ignored;
        };
        if res.period != current.period {
            return Step::Ignored;
        }

        if res.trendbars.is_empty() && !progress.chunked && progress.bars.is_empty() {
            if !progress.widened {
                progress.widened = true;
                let to = current.to_timestamp;
                let request = self.prepare(
                    params,
                    current.period,
                    WIDE_WINDOW_MINUTES,
                    Some((to.saturating_sub(minutes_to_ms(WIDE_WINDOW_MINUTES)), to)),
                );
                return follow(progress, request);
            }
            if !progress.fell_back && current.period != TrendbarPeriod::M1 {
                progress.fell_back = true;
                progress.period = Some(TrendbarPeriod::M1);
                let window = TrendbarPeriod::M1.window_minutes(params.count);
                let to = current.to_timestamp;
                let from = to.saturating_sub(minutes_to_ms(window));
                let request = self.prepare(params, TrendbarPeriod::M1, window, Some((from, to)));
                return follow(progress, request);
            }
        }

        progress.bars.extend(res.trendbars.iter().cloned());

        if res.has_more {
            // Page backwards from the oldest bar, unless the cursor stopped moving
            let oldest = res.trendbars.iter().map(Trendbar::timestamp_ms).min();
            if let Some(oldest) = oldest {
                if oldest > current.from_timestamp && progress.cursor != Some(oldest) {
                    progress.cursor = Some(oldest);
                    let from = current.from_timestamp;
                    let request = current.range(from, oldest);
                    return follow(progress, request);
                }
            }
        }

        if let Some((from, to)) = progress.ranges.pop_front() {
            progress.cursor = None;
            let period = progress.period.unwrap_or(params.period);
            let request = self.prepare(params, period, span_minutes(from, to), Some((from, to)));
            return follow(progress, request);
        }

        Step::Complete(assemble(params, progress))
    }
}

impl TrendbarHistoryService {
    /// Fetch the latest `count` bars. Unknown timeframes fall back to M5.
    pub fn request_history(
        &self,
        account_id: AccountId,
        symbol_id: SymbolId,
        count: u32,
        timeframe: &str,
    ) -> Result<(), FetchError> {
        let period = TrendbarPeriod::resolve(timeframe);
        self.request().record_window(period.window_minutes(count));
        self.fetch(HistoryParams::latest(account_id, symbol_id, count, period))
    }

    /// Fetch `[from_ms, to_ms]` in chunks of `count` bars, delivered together at the end.
    pub fn fetch_range(
        &self,
        account_id: AccountId,
        symbol_id: SymbolId,
        count: u32,
        timeframe: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<(), FetchError> {
        let period = TrendbarPeriod::resolve(timeframe);
        let window = chunk_ranges(from_ms, to_ms, count, period)
            .first()
            .map(|(from, to)| span_minutes(*from, *to))
            .unwrap_or_else(|| period.window_minutes(count));
        self.request().record_window(window);
        self.fetch(HistoryParams::latest(account_id, symbol_id, count, period).with_range(from_ms, to_ms))
    }

    pub fn last_request_window(&self) -> i64 {
        self.request().last_request_window()
    }
}

/// Split `[from, to]` into consecutive spans of `count` bars.
pub fn chunk_ranges(from: i64, to: i64, count: u32, period: TrendbarPeriod) -> Vec<(i64, i64)> {
    let step = minutes_to_ms(period.window_minutes(count));
    if step <= 0 || to <= from {
        return Vec::new();
    }

    let mut ranges = Vec::new();
    let mut start = from;
    while start < to {
        let end = to.min(start.saturating_add(step));
        ranges.push((start, end));
        start = end;
    }
    ranges
}

fn minutes_to_ms(minutes: i64) -> i64 {
    minutes.saturating_mul(60_000)
}

fn span_minutes(from: i64, to: i64) -> i64 {
    ((to - from) / 60_000).max(1)
}

fn aligned_now(period: TrendbarPeriod) -> i64 {
    let now = Utc::now().timestamp_millis();
    let period_ms = period.minutes().max(1) * 60_000;
    now - now.rem_euclid(period_ms)
}

fn follow(progress: &mut HistoryProgress, request: GetTrendbarsReq) -> Step<TrendbarHistory> {
    progress.current = Some(request.clone());
    Step::FollowUp(vec![Request::GetTrendbars(request)])
}

fn assemble(params: &HistoryParams, progress: &mut HistoryProgress) -> TrendbarHistory {
    let mut bars = std::mem::take(&mut progress.bars);
    bars.sort_by_key(|bar| bar.utc_timestamp_in_minutes);
    bars.dedup_by_key(|bar| bar.utc_timestamp_in_minutes);

    TrendbarHistory {
        account_id: params.account_id,
        symbol_id: params.symbol_id,
        period: progress.period.unwrap_or(params.period),
        bars: bars.iter().map(Trendbar::decode).collect(),
    }
}
