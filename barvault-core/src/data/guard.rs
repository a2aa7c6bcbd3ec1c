//! Row-level schema guard.
//!
//! Every fetched batch passes through `SchemaGuard::check` before the writer
//! sees it. Malformed rows are rejected with a reason; the rest come back
//! deduplicated by `(symbol, timestamp)` (last occurrence wins) and sorted.
//! Accepted timestamps are truncated to milliseconds, the precision the
//! store keeps, so keys compare the same before and after a round trip.

use super::provider::BarRequest;
use crate::domain::{BarKey, MinuteBar, Timeframe};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

const MAX_SYMBOL_LEN: usize = 16;

/// Why a row was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidSymbol,
    UnexpectedSymbol,
    NonFinitePrice,
    NonPositivePrice,
    InvertedRange,
    OpenOutOfRange,
    CloseOutOfRange,
    InvalidVwap,
    OutsideWindow,
    FutureTimestamp,
    Misaligned,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::InvalidSymbol => "invalid symbol",
            RejectReason::UnexpectedSymbol => "symbol not requested",
            RejectReason::NonFinitePrice => "non-finite price",
            RejectReason::NonPositivePrice => "non-positive price",
            RejectReason::InvertedRange => "high below low",
            RejectReason::OpenOutOfRange => "open outside [low, high]",
            RejectReason::CloseOutOfRange => "close outside [low, high]",
            RejectReason::InvalidVwap => "invalid vwap",
            RejectReason::OutsideWindow => "timestamp outside request window",
            RejectReason::FutureTimestamp => "timestamp in the future",
            RejectReason::Misaligned => "timestamp not on timeframe boundary",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default)]
pub struct GuardReport {
    /// Valid rows, unique by key, sorted by `(symbol, timestamp)`.
    pub accepted: Vec<MinuteBar>,
    pub rejected: Vec<Rejection>,
    /// Rows dropped because a later row in the same batch had the same key.
    pub duplicates: usize,
}

impl GuardReport {
    pub fn max_timestamp(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.accepted
            .iter()
            .filter(|b| b.symbol == symbol)
            .map(|b| b.timestamp)
            .max()
    }

    /// Rejection counts per reason, for logging.
    pub fn rejection_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.rejected {
            *counts.entry(r.reason.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// Symbol format check: ASCII uppercase, digits, `.` and `-`.
pub fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-')
}

/// Value rules that hold for any stored bar, independent of the request.
pub fn check_values(bar: &MinuteBar, timeframe: Timeframe) -> Result<(), RejectReason> {
    if !is_valid_symbol(&bar.symbol) {
        return Err(RejectReason::InvalidSymbol);
    }
    let prices = [bar.open, bar.high, bar.low, bar.close];
    if prices.iter().any(|p| !p.is_finite()) {
        return Err(RejectReason::NonFinitePrice);
    }
    if prices.iter().any(|p| *p <= 0.0) {
        return Err(RejectReason::NonPositivePrice);
    }
    if bar.high < bar.low {
        return Err(RejectReason::InvertedRange);
    }
    if bar.open < bar.low || bar.open > bar.high {
        return Err(RejectReason::OpenOutOfRange);
    }
    if bar.close < bar.low || bar.close > bar.high {
        return Err(RejectReason::CloseOutOfRange);
    }
    if let Some(vwap) = bar.vwap {
        if !vwap.is_finite() || vwap <= 0.0 {
            return Err(RejectReason::InvalidVwap);
        }
    }
    if !timeframe.is_aligned(bar.timestamp) {
        return Err(RejectReason::Misaligned);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SchemaGuard {
    future_tolerance: Duration,
}

impl Default for SchemaGuard {
    fn default() -> Self {
        Self {
            future_tolerance: Duration::minutes(5),
        }
    }
}

impl SchemaGuard {
    pub fn new(future_tolerance: Duration) -> Self {
        Self { future_tolerance }
    }

    pub fn check(&self, request: &BarRequest, bars: Vec<MinuteBar>) -> GuardReport {
        self.check_at(request, bars, Utc::now())
    }

    /// Same as `check` with an explicit clock.
    pub fn check_at(
        &self,
        request: &BarRequest,
        bars: Vec<MinuteBar>,
        now: DateTime<Utc>,
    ) -> GuardReport {
        let requested: HashSet<&str> = request.symbols.iter().map(|s| s.as_str()).collect();
        let horizon = now + self.future_tolerance;

        let mut kept: BTreeMap<BarKey, MinuteBar> = BTreeMap::new();
        let mut rejected = Vec::new();
        let mut duplicates = 0usize;

        for mut bar in bars {
            let verdict = check_values(&bar, request.timeframe).and_then(|()| {
                if !requested.contains(bar.symbol.as_str()) {
                    Err(RejectReason::UnexpectedSymbol)
                } else if !request.contains(bar.timestamp) {
                    Err(RejectReason::OutsideWindow)
                } else if bar.timestamp > horizon {
                    Err(RejectReason::FutureTimestamp)
                } else {
                    Ok(())
                }
            });

            match verdict {
                Ok(()) => {
                    bar.timestamp = bar.timestamp.trunc_subsecs(3);
                    if kept.insert(bar.key(), bar).is_some() {
                        duplicates += 1;
                    }
                }
                Err(reason) => rejected.push(Rejection {
                    symbol: bar.symbol,
                    timestamp: bar.timestamp,
                    reason,
                }),
            }
        }

        let report = GuardReport {
            accepted: kept.into_values().collect(),
            rejected,
            duplicates,
        };

        if !report.rejected.is_empty() {
            tracing::warn!(
                symbols = %request.symbols.join(","),
                rejected = report.rejected.len(),
                reasons = ?report.rejection_counts(),
                "schema guard rejected rows"
            );
        }
        if report.duplicates > 0 {
            tracing::debug!(duplicates = report.duplicates, "dropped in-batch duplicates");
        }

        report
    }
}
