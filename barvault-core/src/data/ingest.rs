//! Ingestion orchestrator: fetch → guard → upsert → advance watermark, one
//! window at a time, per symbol.
//!
//! The watermark is saved after every committed window, so a run that dies
//! halfway resumes from the last window that reached the store.

use super::guard::SchemaGuard;
use super::provider::{BarProvider, BarRequest, DataError};
use super::store::BarStore;
use super::watermark::WatermarkStore;
use super::writer::{ConflictPolicy, UpsertWriter, WriteReport};
use crate::domain::{Timeframe, TradingDay};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Where a run starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IngestMode {
    /// Resume one bar after the watermark; without one, go back
    /// `initial_lookback` from the end.
    Incremental { initial_lookback: Duration },
    /// Explicit start. The watermark still only moves forward.
    Backfill { start: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub timeframe: Timeframe,
    pub mode: IngestMode,
    /// Exclusive end of the range.
    pub end: DateTime<Utc>,
    /// Length of one fetch window.
    pub window: Duration,
    /// When present, windows with no trading day are skipped.
    pub calendar: Option<Vec<TradingDay>>,
}

impl IngestOptions {
    pub fn incremental(timeframe: Timeframe, end: DateTime<Utc>) -> Self {
        Self {
            timeframe,
            mode: IngestMode::Incremental {
                initial_lookback: Duration::days(30),
            },
            end,
            window: Duration::days(7),
            calendar: None,
        }
    }

    pub fn backfill(timeframe: Timeframe, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            mode: IngestMode::Backfill { start },
            ..Self::incremental(timeframe, end)
        }
    }
}

/// Split `[start, end)` into consecutive windows of at most `window`.
pub fn plan_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut windows = Vec::new();
    if start >= end {
        return windows;
    }
    if window <= Duration::zero() {
        windows.push((start, end));
        return windows;
    }

    let mut cursor = start;
    while cursor < end {
        let next = (cursor + window).min(end);
        windows.push((cursor, next));
        cursor = next;
    }
    windows
}

/// Whether any trading day falls in `[start.date - 1, end.date]`. The extra
/// day before covers sessions that straddle midnight UTC.
pub fn window_has_session(
    calendar: &[TradingDay],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    let first = start.date_naive() - Duration::days(1);
    let last = end.date_naive();
    calendar.iter().any(|day| day.date >= first && day.date <= last)
}

/// Outcome of one window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub skipped: bool,
    pub fetched: usize,
    pub pages: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub write: WriteReport,
    /// Watermark after the window committed.
    pub watermark: Option<DateTime<Utc>>,
}

impl WindowReport {
    fn skipped(start: DateTime<Utc>, end: DateTime<Utc>, watermark: Option<DateTime<Utc>>) -> Self {
        Self {
            start,
            end,
            skipped: true,
            fetched: 0,
            pages: 0,
            accepted: 0,
            rejected: 0,
            duplicates: 0,
            write: WriteReport::default(),
            watermark,
        }
    }
}

/// Outcome of one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolReport {
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub windows: Vec<WindowReport>,
    pub write: WriteReport,
    pub rejected: usize,
    pub watermark: Option<DateTime<Utc>>,
    pub completed: bool,
}

/// Summary of an ingest run.
#[derive(Debug)]
pub struct IngestSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub symbols: Vec<SymbolReport>,
    pub errors: Vec<(String, DataError)>,
}

impl IngestSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Write counts over every symbol.
    pub fn totals(&self) -> WriteReport {
        let mut totals = WriteReport::default();
        for report in &self.symbols {
            totals.absorb(&report.write);
        }
        totals
    }
}

/// Progress callback for ingest runs.
pub trait IngestProgress: Send {
    fn on_symbol_start(&self, symbol: &str, index: usize, total: usize);

    fn on_window(&self, symbol: &str, window: &WindowReport);

    fn on_symbol_complete(&self, report: &SymbolReport, error: Option<&DataError>);

    fn on_batch_complete(&self, summary: &IngestSummary);
}

/// Reports progress through `tracing`.
pub struct LogProgress;

impl IngestProgress for LogProgress {
    fn on_symbol_start(&self, symbol: &str, index: usize, total: usize) {
        tracing::info!(symbol, "[{}/{}] ingesting", index + 1, total);
    }

    fn on_window(&self, symbol: &str, window: &WindowReport) {
        if window.skipped {
            tracing::debug!(symbol, start = %window.start, end = %window.end, "no session, window skipped");
            return;
        }
        tracing::info!(
            symbol,
            start = %window.start,
            end = %window.end,
            fetched = window.fetched,
            inserted = window.write.inserted,
            updated = window.write.updated,
            rejected = window.rejected,
            "window committed"
        );
    }

    fn on_symbol_complete(&self, report: &SymbolReport, error: Option<&DataError>) {
        match error {
            None => tracing::info!(
                symbol = %report.symbol,
                inserted = report.write.inserted,
                updated = report.write.updated,
                watermark = ?report.watermark,
                "symbol complete"
            ),
            Some(e) => tracing::error!(
                symbol = %report.symbol,
                windows_committed = report.windows.len(),
                watermark = ?report.watermark,
                error = %e,
                "symbol failed"
            ),
        }
    }

    fn on_batch_complete(&self, summary: &IngestSummary) {
        let totals = summary.totals();
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            total = summary.total,
            inserted = totals.inserted,
            updated = totals.updated,
            "ingest complete"
        );
    }
}

pub struct Ingestor<'a> {
    provider: &'a dyn BarProvider,
    store: &'a BarStore,
    guard: SchemaGuard,
    policy: ConflictPolicy,
}

impl<'a> Ingestor<'a> {
    pub fn new(provider: &'a dyn BarProvider, store: &'a BarStore) -> Self {
        Self {
            provider,
            store,
            guard: SchemaGuard::default(),
            policy: ConflictPolicy::default(),
        }
    }

    pub fn with_guard(mut self, guard: SchemaGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// First timestamp this run will request for `symbol`.
    pub fn resolve_start(
        &self,
        marks: &WatermarkStore,
        symbol: &str,
        opts: &IngestOptions,
    ) -> DateTime<Utc> {
        match opts.mode {
            IngestMode::Incremental { initial_lookback } => marks
                .resume_from(opts.timeframe, symbol)
                .unwrap_or(opts.end - initial_lookback),
            IngestMode::Backfill { start } => start,
        }
    }

    /// Ingest every symbol. Per-symbol failures are collected, not raised;
    /// once the provider becomes unavailable the remaining symbols fail
    /// without requests.
    pub fn run(
        &self,
        marks: &mut WatermarkStore,
        symbols: &[String],
        opts: &IngestOptions,
        progress: &dyn IngestProgress,
    ) -> IngestSummary {
        let total = symbols.len();
        let mut summary = IngestSummary {
            total,
            succeeded: 0,
            failed: 0,
            symbols: Vec::with_capacity(total),
            errors: Vec::new(),
        };

        for (i, symbol) in symbols.iter().enumerate() {
            progress.on_symbol_start(symbol, i, total);

            let start = self.resolve_start(marks, symbol, opts);
            let mut report = SymbolReport {
                symbol: symbol.clone(),
                start,
                end: opts.end,
                windows: Vec::new(),
                write: WriteReport::default(),
                rejected: 0,
                watermark: marks.last_timestamp(opts.timeframe, symbol),
                completed: false,
            };

            let result = self.ingest_symbol(marks, symbol, start, opts, progress, &mut report);
            report.completed = result.is_ok();
            progress.on_symbol_complete(&report, result.as_ref().err());
            summary.symbols.push(report);

            match result {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    summary.errors.push((symbol.clone(), e));
                    summary.failed += 1;
                }
            }

            // Bail out early if circuit breaker tripped
            if !self.provider.is_available() {
                for sym in &symbols[(i + 1)..total] {
                    summary
                        .errors
                        .push((sym.clone(), DataError::CircuitBreakerTripped));
                    summary.failed += 1;
                }
                break;
            }
        }

        progress.on_batch_complete(&summary);
        summary
    }

    fn ingest_symbol(
        &self,
        marks: &mut WatermarkStore,
        symbol: &str,
        start: DateTime<Utc>,
        opts: &IngestOptions,
        progress: &dyn IngestProgress,
        report: &mut SymbolReport,
    ) -> Result<(), DataError> {
        let writer = UpsertWriter::new(self.store, self.policy);
        let source = self.provider.source();

        for (window_start, window_end) in plan_windows(start, opts.end, opts.window) {
            if let Some(calendar) = &opts.calendar {
                if !window_has_session(calendar, window_start, window_end) {
                    let window = WindowReport::skipped(window_start, window_end, report.watermark);
                    progress.on_window(symbol, &window);
                    report.windows.push(window);
                    continue;
                }
            }

            if !self.provider.is_available() {
                return Err(DataError::CircuitBreakerTripped);
            }

            let request = BarRequest::single(symbol, opts.timeframe, window_start, window_end);
            let fetched = self.provider.fetch_bars(&request)?;
            let fetched_count = fetched.bars.len();

            let checked = self.guard.check(&request, fetched.bars);
            let write = writer.write(symbol, opts.timeframe, source.as_str(), &checked.accepted)?;

            if let Some(max) = checked.max_timestamp(symbol) {
                marks.advance(opts.timeframe, symbol, max, write.inserted as u64);
                marks.save()?;
            }

            let window = WindowReport {
                start: window_start,
                end: window_end,
                skipped: false,
                fetched: fetched_count,
                pages: fetched.pages,
                accepted: checked.accepted.len(),
                rejected: checked.rejected.len(),
                duplicates: checked.duplicates,
                write,
                watermark: marks.last_timestamp(opts.timeframe, symbol),
            };
            report.write.absorb(&window.write);
            report.rejected += window.rejected;
            report.watermark = window.watermark;
            progress.on_window(symbol, &window);
            report.windows.push(window);
        }
        Ok(())
    }
}
