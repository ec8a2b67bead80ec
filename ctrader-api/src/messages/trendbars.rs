use super::{AccountId, SymbolId};
use crate::macros::setter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

pub const MIN_TIMESTAMP_MS: i64 = 0;
/// Largest timestamp the broker accepts in a trendbar request.
pub const MAX_TIMESTAMP_MS: i64 = 2_147_483_646_000;

/// Prices are transmitted in 1/100000 of a unit.
const PRICE_DIVISOR: f64 = 100_000.0;

pub fn clamp_timestamp(ms: i64) -> i64 {
    ms.clamp(MIN_TIMESTAMP_MS, MAX_TIMESTAMP_MS)
}

// Common

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendbarPeriod {
    M1,
    M2,
    M3,
    M4,
    #[default]
    M5,
    M10,
    M15,
    M30,
    H1,
    H4,
    H12,
    D1,
    W1,
    MN1,
}

impl TrendbarPeriod {
    pub const ALL: [TrendbarPeriod; 14] = [
        Self::M1,
        Self::M2,
        Self::M3,
        Self::M4,
        Self::M5,
        Self::M10,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::H12,
        Self::D1,
        Self::W1,
        Self::MN1,
    ];

    /// Length of one bar in minutes. A month counts as 30 days.
    pub fn minutes(self) -> i64 {
        match self {
            Self::M1 => 1,
            Self::M2 => 2,
            Self::M3 => 3,
            Self::M4 => 4,
            Self::M5 => 5,
            Self::M10 => 10,
            Self::M15 => 15,
            Self::M30 => 30,
            Self::H1 => 60,
            Self::H4 => 240,
            Self::H12 => 720,
            Self::D1 => 1440,
            Self::W1 => 10080,
            Self::MN1 => 43200,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::M1 => "M1",
            Self::M2 => "M2",
            Self::M3 => "M3",
            Self::M4 => "M4",
            Self::M5 => "M5",
            Self::M10 => "M10",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::H12 => "H12",
            Self::D1 => "D1",
            Self::W1 => "W1",
            Self::MN1 => "MN1",
        }
    }

    /// Lenient lookup used for user-supplied timeframes; unknown labels fall back to M5.
    pub fn resolve(label: &str) -> Self {
        label.parse().unwrap_or_default()
    }

    /// Request span in minutes for `count` bars of this period.
    pub fn window_minutes(self, count: u32) -> i64 {
        i64::from(count).saturating_mul(self.minutes())
    }
}

impl Display for TrendbarPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPeriod(pub String);

impl Display for UnknownPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown trendbar period: {}", self.0)
    }
}

impl std::error::Error for UnknownPeriod {}

impl FromStr for TrendbarPeriod {
    type Err = UnknownPeriod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|period| period.label() == upper)
            .ok_or_else(|| UnknownPeriod(s.to_string()))
    }
}

/// Delta-encoded bar as sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trendbar {
    pub low: i64,
    pub delta_open: u64,
    pub delta_close: u64,
    pub delta_high: u64,
    pub volume: i64,
    pub utc_timestamp_in_minutes: i64,
}

impl Trendbar {
    pub fn timestamp_ms(&self) -> i64 {
        self.utc_timestamp_in_minutes * 60_000
    }

    pub fn decode(&self) -> Bar {
        let price = |delta: u64| (self.low + delta as i64) as f64 / PRICE_DIVISOR;
        let timestamp = DateTime::<Utc>::from_timestamp(self.utc_timestamp_in_minutes * 60, 0)
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();

        Bar {
            utc_timestamp_minutes: self.utc_timestamp_in_minutes,
            timestamp,
            open: price(self.delta_open),
            high: price(self.delta_high),
            low: self.low as f64 / PRICE_DIVISOR,
            close: price(self.delta_close),
            volume: self.volume,
        }
    }
}

/// Decoded OHLC bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub utc_timestamp_minutes: i64,
    /// UTC, `YYYY-MM-DD HH:MM`
    pub timestamp: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

// Requests

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetTrendbarsReq {
    pub account_id: AccountId,
    pub symbol_id: SymbolId,
    pub period: TrendbarPeriod,
    pub from_timestamp: i64,
    pub to_timestamp: i64,
    pub count: Option<u32>,
}

impl GetTrendbarsReq {
    pub fn new(account_id: AccountId, symbol_id: SymbolId, period: TrendbarPeriod) -> Self {
        Self {
            account_id,
            symbol_id,
            period,
            from_timestamp: MIN_TIMESTAMP_MS,
            to_timestamp: MIN_TIMESTAMP_MS,
            count: None,
        }
    }

    /// Sets the `[from, to]` range in milliseconds, clamped to what the broker accepts.
    pub fn range(mut self, from_ms: i64, to_ms: i64) -> Self {
        self.from_timestamp = clamp_timestamp(from_ms);
        self.to_timestamp = clamp_timestamp(to_ms);
        self
    }

    setter!(opt count: u32);

    pub fn span_minutes(&self) -> i64 {
        (self.to_timestamp - self.from_timestamp) / 60_000
    }
}

// Responses

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTrendbarsRes {
    pub account_id: AccountId,
    pub symbol_id: SymbolId,
    pub period: TrendbarPeriod,
    pub timestamp: i64,
    pub trendbars: Vec<Trendbar>,
    /// More bars exist before the oldest one returned
    #[serde(default)]
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_period_minutes_table() {
        assert_eq!(TrendbarPeriod::M5.minutes(), 5);
        assert_eq!(TrendbarPeriod::H1.minutes(), 60);
        assert_eq!(TrendbarPeriod::D1.minutes(), 1440);
        assert_eq!(TrendbarPeriod::MN1.minutes(), 43200);
    }

    #[test]
    fn test_window_minutes() {
        assert_eq!(TrendbarPeriod::H1.window_minutes(50), 3000);
        assert_eq!(TrendbarPeriod::M5.window_minutes(50), 250);
    }

    #[test]
    fn test_period_parsing() {
        assert_eq!("h4".parse::<TrendbarPeriod>(), Ok(TrendbarPeriod::H4));
        assert_eq!(" MN1 ".parse::<TrendbarPeriod>(), Ok(TrendbarPeriod::MN1));
        assert!("H2".parse::<TrendbarPeriod>().is_err());
        assert_eq!(TrendbarPeriod::resolve("H2"), TrendbarPeriod::M5);
        assert_eq!(TrendbarPeriod::resolve("d1"), TrendbarPeriod::D1);
    }

    #[test]
    fn test_request_range_is_clamped() {
        let req = GetTrendbarsReq::new(1, 2, TrendbarPeriod::M1).range(-5, i64::MAX);
        assert_eq!(req.from_timestamp, MIN_TIMESTAMP_MS);
        assert_eq!(req.to_timestamp, MAX_TIMESTAMP_MS);
    }

    #[test]
    fn test_decode_trendbar() {
        let bar = Trendbar {
            low: 108_000,
            delta_open: 120,
            delta_close: 80,
            delta_high: 200,
            volume: 42,
            utc_timestamp_in_minutes: 28_000_000,
        };
        let decoded = bar.decode();

        assert_eq!(decoded.low, 1.08);
        assert_eq!(decoded.open, 1.0812);
        assert_eq!(decoded.close, 1.0808);
        assert_eq!(decoded.high, 1.082);
        assert_eq!(decoded.timestamp, "2023-03-28 10:40");
        assert_eq!(bar.timestamp_ms(), 1_680_000_000_000);
    }
}
