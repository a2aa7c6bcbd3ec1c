//! Provider traits and structured error types.
//!
//! `BarProvider` abstracts over bar sources (Alpaca, CSV import, synthetic) so
//! the ingestor can swap implementations and tests can script responses.
//! The store and watermark layers sit above this trait; providers know
//! nothing about them.

use crate::domain::{Asset, MarketClock, MinuteBar, Timeframe, TradingDay};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error types for data operations.
///
/// These are designed to be displayable in CLI output and logs alike.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("schema error: {0}")]
    Schema(#[from] super::schema::SchemaError),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("corrupt partition {path}: {reason}")]
    CorruptPartition { path: String, reason: String },

    #[error("watermark error: {0}")]
    WatermarkError(String),

    #[error("store is locked by another writer ({path}); remove the file if no ingest is running")]
    StoreLocked { path: String },

    #[error("csv error at line {line}: {reason}")]
    Csv { line: u64, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data error: {0}")]
    Other(String),
}

/// Where a batch of bars came from. Stored as the `source` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Alpaca,
    Synthetic,
    CsvImport,
    Store,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Alpaca => "alpaca",
            DataSource::Synthetic => "synthetic",
            DataSource::CsvImport => "csv_import",
            DataSource::Store => "store",
        }
    }
}

/// A bar fetch over the half-open window `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BarRequest {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BarRequest {
    pub fn single(
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            symbols: vec![symbol.to_string()],
            timeframe,
            start,
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Result of a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub bars: Vec<MinuteBar>,
    /// HTTP pages consumed (1 for non-paginated sources).
    pub pages: usize,
    pub source: DataSource,
}

/// Trait for bar providers.
pub trait BarProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Provenance tag written alongside every bar from this provider.
    fn source(&self) -> DataSource;

    /// Fetch bars for every symbol in the request. An empty window is not an
    /// error; it yields zero bars.
    fn fetch_bars(&self, request: &BarRequest) -> Result<FetchResult, DataError>;

    /// Check if the provider is currently available (not blocked by the breaker).
    fn is_available(&self) -> bool;
}

/// Exchange reference data used for calendars and screening.
pub trait MarketInfo: Send + Sync {
    fn clock(&self) -> Result<MarketClock, DataError>;

    fn assets(&self, status: &str, asset_class: &str) -> Result<Vec<Asset>, DataError>;

    fn calendar(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<TradingDay>, DataError>;
}
