//! Market reference data: clock, tradable assets, trading calendar.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Current state of the exchange clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketClock {
    pub timestamp: DateTime<Utc>,
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

/// A listed asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub tradable: bool,
}

impl Asset {
    /// Plain alphanumeric symbols only (no share classes, warrants, units).
    pub fn has_plain_symbol(&self) -> bool {
        !self.symbol.is_empty() && self.symbol.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

/// One session of the trading calendar. Times are exchange-local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingDay {
    pub date: NaiveDate,
    pub open: NaiveTime,
    pub close: NaiveTime,
}
