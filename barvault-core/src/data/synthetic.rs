//! Synthetic bar provider for offline runs and tests.
//!
//! Every bar is derived from BLAKE3(symbol, timeframe, timestamp), so the
//! same bar comes out identical no matter which window requested it. That
//! keeps re-ingests idempotent.

use super::provider::{BarProvider, BarRequest, DataError, DataSource, FetchResult, MarketInfo};
use crate::domain::{Asset, MarketClock, MinuteBar, Timeframe, TradingDay};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Regular session in UTC (09:30–16:00 US/Eastern, standard time).
const SESSION_OPEN: (u32, u32) = (14, 30);
const SESSION_CLOSE: (u32, u32) = (21, 0);

pub struct SyntheticProvider {
    universe: Vec<String>,
}

impl SyntheticProvider {
    pub fn new() -> Self {
        Self::with_universe(["AAPL", "MSFT", "SPY", "QQQ", "BRK.B"])
    }

    /// Symbols reported by `assets()`.
    pub fn with_universe<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            universe: symbols.into_iter().map(Into::into).collect(),
        }
    }

    /// Bars for one symbol in `[start, end)`.
    pub fn generate(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<MinuteBar> {
        let mut bars = Vec::new();
        if start >= end {
            return bars;
        }

        let anchor = anchor_price(symbol);
        let mut day = start.date_naive();
        let last_day = end.date_naive();
        while day <= last_day {
            if is_weekday(day) {
                for ts in session_timestamps(day, timeframe) {
                    if ts >= start && ts < end {
                        bars.push(synthetic_bar(symbol, timeframe, ts, anchor));
                    }
                }
            }
            day += Duration::days(1);
        }
        bars
    }
}

impl Default for SyntheticProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn is_weekday(day: NaiveDate) -> bool {
    !matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

fn at(day: NaiveDate, (hour, minute): (u32, u32)) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&day.and_time(time)))
}

fn session_timestamps(day: NaiveDate, timeframe: Timeframe) -> Vec<DateTime<Utc>> {
    if timeframe == Timeframe::Day1 {
        return at(day, (0, 0)).into_iter().collect();
    }
    let (Some(open), Some(close)) = (at(day, SESSION_OPEN), at(day, SESSION_CLOSE)) else {
        return Vec::new();
    };

    let step = timeframe.duration();
    let mut ts = open;
    while !timeframe.is_aligned(ts) && ts < close {
        ts += Duration::minutes(1);
    }

    let mut out = Vec::new();
    while ts < close {
        out.push(ts);
        ts += step;
    }
    out
}

fn seeded(parts: &[&[u8]]) -> StdRng {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
        hasher.update(b"\x1f");
    }
    StdRng::from_seed(*hasher.finalize().as_bytes())
}

fn anchor_price(symbol: &str) -> f64 {
    let mut rng = seeded(&[symbol.as_bytes()]);
    rng.gen_range(20.0..400.0)
}

fn synthetic_bar(symbol: &str, timeframe: Timeframe, ts: DateTime<Utc>, anchor: f64) -> MinuteBar {
    let mut rng = seeded(&[
        symbol.as_bytes(),
        timeframe.as_str().as_bytes(),
        &ts.timestamp().to_le_bytes(),
    ]);

    // Slow drift so consecutive bars look like a walk.
    let days = ts.timestamp() as f64 / 86_400.0;
    let level = anchor * (1.0 + 0.15 * (days / 45.0).sin() + 0.02 * (days * 6.0).sin());

    let open = level * (1.0 + rng.gen_range(-0.002..0.002));
    let close = open * (1.0 + rng.gen_range(-0.004..0.004));
    let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.002));
    let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.002));
    let trade_count = rng.gen_range(20..2_000u64);
    let volume = trade_count * rng.gen_range(50..400u64);
    let vwap = (open + high + low + close) / 4.0;

    MinuteBar {
        symbol: symbol.to_string(),
        timestamp: ts,
        open,
        high,
        low,
        close,
        volume,
        trade_count: Some(trade_count),
        vwap: Some(vwap),
    }
}

impl BarProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn source(&self) -> DataSource {
        DataSource::Synthetic
    }

    fn fetch_bars(&self, request: &BarRequest) -> Result<FetchResult, DataError> {
        let bars = request
            .symbols
            .iter()
            .flat_map(|symbol| self.generate(symbol, request.timeframe, request.start, request.end))
            .collect();
        Ok(FetchResult {
            bars,
            pages: 1,
            source: DataSource::Synthetic,
        })
    }

    fn is_available(&self) -> bool {
        true
    }
}

impl MarketInfo for SyntheticProvider {
    fn clock(&self) -> Result<MarketClock, DataError> {
        let now = Utc::now();
        let today = now.date_naive();
        let open_close = |day: NaiveDate| at(day, SESSION_OPEN).zip(at(day, SESSION_CLOSE));

        let is_open = is_weekday(today)
            && open_close(today).is_some_and(|(open, close)| now >= open && now < close);

        let mut next_open = None;
        let mut next_close = None;
        let mut day = today;
        for _ in 0..8 {
            if is_weekday(day) {
                if let Some((open, close)) = open_close(day) {
                    if next_open.is_none() && open > now {
                        next_open = Some(open);
                    }
                    if next_close.is_none() && close > now {
                        next_close = Some(close);
                    }
                }
            }
            day += Duration::days(1);
        }

        match (next_open, next_close) {
            (Some(next_open), Some(next_close)) => Ok(MarketClock {
                timestamp: now,
                is_open,
                next_open,
                next_close,
            }),
            _ => Err(DataError::Other("no session within a week".into())),
        }
    }

    fn assets(&self, _status: &str, _asset_class: &str) -> Result<Vec<Asset>, DataError> {
        Ok(self
            .universe
            .iter()
            .map(|symbol| Asset {
                id: format!("synthetic-{}", symbol.to_lowercase()),
                symbol: symbol.clone(),
                name: format!("{symbol} (synthetic)"),
                exchange: "SYNTH".into(),
                tradable: true,
            })
            .collect())
    }

    fn calendar(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<TradingDay>, DataError> {
        let (Some(open), Some(close)) = (
            NaiveTime::from_hms_opt(9, 30, 0),
            NaiveTime::from_hms_opt(16, 0, 0),
        ) else {
            return Ok(Vec::new());
        };
        let mut days = Vec::new();
        let mut day = start;
        while day <= end {
            if is_weekday(day) {
                days.push(TradingDay {
                    date: day,
                    open,
                    close,
                });
            }
            day += Duration::days(1);
        }
        Ok(days)
    }
}
