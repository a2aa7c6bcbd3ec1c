//! Liquidity screen over the tradable universe.
//!
//! Lists active US equities, keeps tradable assets with plain symbols, and
//! passes those whose recent bars average at least `min_price` close and
//! `min_volume` volume.

use crate::config::ScreenConfig;
use barvault_core::data::{BarProvider, BarRequest, DataError, MarketInfo};
use barvault_core::domain::Timeframe;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ScreenResult {
    pub symbol: String,
    pub avg_close: f64,
    pub avg_volume: f64,
    /// Bars averaged (at most `sample_bars`).
    pub sampled: usize,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScreenSummary {
    /// Assets left after the tradable/plain-symbol filter.
    pub candidates: usize,
    pub results: Vec<ScreenResult>,
    /// Symbols that could not be evaluated, with the reason.
    pub skipped: Vec<(String, String)>,
}

impl ScreenSummary {
    pub fn passed(&self) -> impl Iterator<Item = &ScreenResult> {
        self.results.iter().filter(|r| r.passed)
    }
}

/// Screen the universe as of `now`. Only listing the assets can fail the
/// whole screen; per-symbol fetch errors are logged and skipped.
pub fn screen_universe(
    market: &dyn MarketInfo,
    provider: &dyn BarProvider,
    config: &ScreenConfig,
    timeframe: Timeframe,
    now: DateTime<Utc>,
) -> Result<ScreenSummary, DataError> {
    let mut symbols: Vec<String> = market
        .assets("active", "us_equity")?
        .into_iter()
        .filter(|a| a.tradable && a.has_plain_symbol())
        .map(|a| a.symbol)
        .collect();
    symbols.sort();
    symbols.dedup();
    if let Some(max) = config.max_symbols {
        symbols.truncate(max);
    }

    let mut summary = ScreenSummary {
        candidates: symbols.len(),
        ..ScreenSummary::default()
    };
    let start = now - Duration::hours(config.lookback_hours);

    for (i, symbol) in symbols.iter().enumerate() {
        if !provider.is_available() {
            tracing::warn!(remaining = symbols.len() - i, "provider unavailable, stopping screen");
            summary.skipped.extend(
                symbols[i..]
                    .iter()
                    .map(|s| (s.clone(), DataError::CircuitBreakerTripped.to_string())),
            );
            break;
        }

        let request = BarRequest::single(symbol.as_str(), timeframe, start, now);
        let mut bars = match provider.fetch_bars(&request) {
            Ok(fetched) => fetched.bars,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "screen fetch failed");
                summary.skipped.push((symbol.clone(), e.to_string()));
                continue;
            }
        };
        bars.retain(|b| b.symbol == *symbol && !b.is_void());
        bars.sort_by_key(|b| b.timestamp);

        let sample = &bars[bars.len().saturating_sub(config.sample_bars)..];
        if sample.is_empty() {
            summary.skipped.push((symbol.clone(), "no bars in lookback window".into()));
            continue;
        }

        let n = sample.len() as f64;
        let avg_close = sample.iter().map(|b| b.close).sum::<f64>() / n;
        let avg_volume = sample.iter().map(|b| b.volume as f64).sum::<f64>() / n;
        let passed = avg_close >= config.min_price && avg_volume >= config.min_volume;
        tracing::debug!(symbol = %symbol, avg_close, avg_volume, passed, "screened");

        summary.results.push(ScreenResult {
            symbol: symbol.clone(),
            avg_close,
            avg_volume,
            sampled: sample.len(),
            passed,
        });
    }

    tracing::info!(
        candidates = summary.candidates,
        passed = summary.passed().count(),
        skipped = summary.skipped.len(),
        "screen complete"
    );
    Ok(summary)
}
