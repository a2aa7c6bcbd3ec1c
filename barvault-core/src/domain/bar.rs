//! MinuteBar: the unit of ingested market data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregated OHLCV record for one symbol over one timeframe interval.
///
/// `timestamp` is the interval's open time in UTC. The pair
/// `(symbol, timestamp)` identifies a bar everywhere in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    #[serde(default)]
    pub trade_count: Option<u64>,
    #[serde(default)]
    pub vwap: Option<f64>,
}

/// Dedup key of a bar.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BarKey {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
}

impl MinuteBar {
    pub fn key(&self) -> BarKey {
        BarKey {
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Returns true if any OHLC field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// True when every market value matches `other`. Symbol and timestamp are
    /// not compared; callers match on key first.
    pub fn same_values(&self, other: &MinuteBar) -> bool {
        self.open.to_bits() == other.open.to_bits()
            && self.high.to_bits() == other.high.to_bits()
            && self.low.to_bits() == other.low.to_bits()
            && self.close.to_bits() == other.close.to_bits()
            && self.volume == other.volume
            && self.trade_count == other.trade_count
            && self.vwap.map(f64::to_bits) == other.vwap.map(f64::to_bits)
    }

    /// Timestamp as milliseconds since the Unix epoch (the stored unit).
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}
