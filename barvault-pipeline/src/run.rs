//! Pipeline runs: wire config, provider, store and watermarks together
//! under the store lock.

use crate::config::{ConfigError, PipelineConfig};
use barvault_core::data::{
    AlpacaClient, BarProvider, BarStore, CircuitBreaker, Credentials, CsvProvider, DataError,
    IngestMode, IngestOptions, IngestProgress, IngestSummary, Ingestor, MarketInfo, RateLimiter,
    WatermarkStore,
};
use barvault_core::domain::Timeframe;
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Build the Alpaca client from config and `ALPACA_API_KEY`/`ALPACA_API_SECRET`.
pub fn build_alpaca(config: &PipelineConfig) -> Result<AlpacaClient, PipelineError> {
    let credentials = Credentials::from_env()?;
    let breaker = Arc::new(CircuitBreaker::default_provider());
    let limiter = Arc::new(RateLimiter::per_minute(config.alpaca.requests_per_minute));
    Ok(AlpacaClient::new(
        config.alpaca.clone(),
        credentials,
        breaker,
        limiter,
    )?)
}

pub fn open_store(config: &PipelineConfig) -> BarStore {
    BarStore::new(&config.store.root)
}

/// Ingest options for a run ending at `end`, windowed per config.
pub fn ingest_options(config: &PipelineConfig, mode: IngestMode, end: DateTime<Utc>) -> IngestOptions {
    IngestOptions {
        timeframe: config.ingest.timeframe,
        mode,
        end,
        window: Duration::days(config.ingest.window_days),
        calendar: None,
    }
}

/// Incremental mode with the configured initial lookback.
pub fn incremental_mode(config: &PipelineConfig) -> IngestMode {
    IngestMode::Incremental {
        initial_lookback: Duration::days(config.ingest.initial_lookback_days),
    }
}

/// Run an ingest (incremental or backfill) for `symbols` up to `end`.
///
/// Takes the store lock for the whole run. When `market` is given and the
/// config enables it, the trading calendar for the run's span is fetched
/// first; failing to fetch it only disables window skipping.
pub fn run_ingest(
    config: &PipelineConfig,
    provider: &dyn BarProvider,
    market: Option<&dyn MarketInfo>,
    symbols: &[String],
    mode: IngestMode,
    end: DateTime<Utc>,
    progress: &dyn IngestProgress,
) -> Result<IngestSummary, PipelineError> {
    if symbols.is_empty() {
        return Err(PipelineError::Invalid(
            "no symbols given (pass them on the command line or set ingest.symbols)".into(),
        ));
    }

    let store = open_store(config);
    let _lock = store.lock()?;
    let mut marks = WatermarkStore::open(store.root())?;

    let mut opts = ingest_options(config, mode, end);
    let ingestor = Ingestor::new(provider, &store).with_policy(config.store.on_conflict);

    if let Some(market) = market.filter(|_| config.ingest.use_calendar) {
        let earliest = symbols
            .iter()
            .map(|s| ingestor.resolve_start(&marks, s, &opts))
            .min()
            .unwrap_or(end);
        if earliest < end {
            let from = earliest.date_naive().pred_opt().unwrap_or(earliest.date_naive());
            match market.calendar(from, end.date_naive()) {
                Ok(days) => {
                    tracing::debug!(days = days.len(), %from, "trading calendar loaded");
                    opts.calendar = Some(days);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "calendar unavailable, fetching every window");
                }
            }
        }
    }

    tracing::info!(
        provider = provider.name(),
        timeframe = %opts.timeframe,
        symbols = symbols.len(),
        end = %end,
        "starting ingest"
    );
    let summary = ingestor.run(&mut marks, symbols, &opts, progress);
    marks.save()?;
    Ok(summary)
}

/// Import a CSV export (`symbol,timestamp,open,high,low,close,volume[,trade_count,vwap]`)
/// as a backfill over its own span, stored under `config.ingest.timeframe`.
pub fn import_csv(
    config: &PipelineConfig,
    path: &Path,
    progress: &dyn IngestProgress,
) -> Result<IngestSummary, PipelineError> {
    let provider = CsvProvider::from_path(path)?;
    let Some((first, last)) = provider.span() else {
        return Err(PipelineError::Invalid(format!("{} has no rows", path.display())));
    };
    let symbols = provider.symbols();
    let end = last + config.ingest.timeframe.duration();
    tracing::info!(
        path = %path.display(),
        rows = provider.bars().len(),
        symbols = symbols.len(),
        "importing csv"
    );
    run_ingest(
        config,
        &provider,
        None,
        &symbols,
        IngestMode::Backfill { start: first },
        end,
        progress,
    )
}

/// Forget the watermark for one symbol. Returns whether one existed.
pub fn reset_watermark(
    config: &PipelineConfig,
    timeframe: Timeframe,
    symbol: &str,
) -> Result<bool, PipelineError> {
    let store = open_store(config);
    let _lock = store.lock()?;
    let mut marks = WatermarkStore::open(store.root())?;
    let existed = marks.reset(timeframe, symbol);
    if existed {
        marks.save()?;
        tracing::info!(%timeframe, symbol, "watermark reset");
    }
    Ok(existed)
}

/// Recompute every watermark from stored data. Returns the entry count.
///
/// An unreadable watermark file is replaced rather than reported.
pub fn rebuild_watermarks(config: &PipelineConfig) -> Result<usize, PipelineError> {
    let store = open_store(config);
    let _lock = store.lock()?;
    let mut marks = match WatermarkStore::open(store.root()) {
        Ok(marks) => marks,
        Err(DataError::WatermarkError(reason)) => {
            tracing::warn!(%reason, "discarding unreadable watermark file");
            WatermarkStore::empty(store.root())
        }
        Err(e) => return Err(e.into()),
    };
    let count = marks.rebuild_from_store(&store)?;
    marks.save()?;
    tracing::info!(entries = count, "watermarks rebuilt");
    Ok(count)
}
