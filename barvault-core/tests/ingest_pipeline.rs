//! End-to-end ingest runs against a scratch store.

use barvault_core::data::{
    BarProvider, BarRequest, BarStore, CsvProvider, DataError, DataSource, FetchResult, IngestOptions,
    IngestProgress, IngestSummary, Ingestor, StoredRow, SymbolReport, SyntheticProvider,
    WatermarkStore, WindowReport,
};
use barvault_core::domain::{MinuteBar, Timeframe};
use chrono::{DateTime, Duration, TimeZone, Utc};
use polars::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

struct Quiet;

impl IngestProgress for Quiet {
    fn on_symbol_start(&self, _: &str, _: usize, _: usize) {}
    fn on_window(&self, _: &str, _: &WindowReport) {}
    fn on_symbol_complete(&self, _: &SymbolReport, _: Option<&DataError>) {}
    fn on_batch_complete(&self, _: &IngestSummary) {}
}

/// Records every window it is told about.
#[derive(Default)]
struct Recording {
    windows: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl IngestProgress for Recording {
    fn on_symbol_start(&self, _: &str, _: usize, _: usize) {}
    fn on_window(&self, symbol: &str, window: &WindowReport) {
        self.windows
            .lock()
            .unwrap()
            .push((symbol.to_string(), window.start));
    }
    fn on_symbol_complete(&self, _: &SymbolReport, _: Option<&DataError>) {}
    fn on_batch_complete(&self, _: &IngestSummary) {}
}

/// Synthetic bars, but the `fail_on`-th call (0-based) errors.
struct Flaky {
    inner: SyntheticProvider,
    calls: AtomicUsize,
    fail_on: usize,
}

impl BarProvider for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn source(&self) -> DataSource {
        DataSource::Alpaca
    }

    fn fetch_bars(&self, request: &BarRequest) -> Result<FetchResult, DataError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_on {
            return Err(DataError::NetworkUnreachable("connection reset".into()));
        }
        self.inner.fetch_bars(request)
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Returns a fixed batch regardless of window.
struct Fixed(Vec<MinuteBar>);

impl BarProvider for Fixed {
    fn name(&self) -> &str {
        "fixed"
    }

    fn source(&self) -> DataSource {
        DataSource::Alpaca
    }

    fn fetch_bars(&self, _request: &BarRequest) -> Result<FetchResult, DataError> {
        Ok(FetchResult {
            bars: self.0.clone(),
            pages: 1,
            source: DataSource::Alpaca,
        })
    }

    fn is_available(&self) -> bool {
        true
    }
}

fn monday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
}

fn assert_unique(rows: &[StoredRow]) {
    let keys: HashSet<_> = rows.iter().map(|r| r.bar.timestamp).collect();
    assert_eq!(keys.len(), rows.len(), "duplicate timestamps in store");
    for pair in rows.windows(2) {
        assert!(pair[0].bar.timestamp < pair[1].bar.timestamp);
    }
}

#[test]
fn failure_mid_run_resumes_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let store = BarStore::new(dir.path());
    let symbols = vec!["AAPL".to_string()];
    let mut opts = IngestOptions::backfill(Timeframe::Minute15, monday(), monday() + Duration::days(5));
    opts.window = Duration::days(1);

    // Third window fails.
    let flaky = Flaky {
        inner: SyntheticProvider::new(),
        calls: AtomicUsize::new(0),
        fail_on: 2,
    };
    let mut marks = WatermarkStore::open(dir.path()).unwrap();
    let summary = Ingestor::new(&flaky, &store).run(&mut marks, &symbols, &opts, &Quiet);
    assert_eq!(summary.failed, 1);
    assert!(!summary.symbols[0].completed);
    assert_eq!(summary.symbols[0].windows.len(), 2);

    // Watermark persisted at the end of Tuesday's session.
    let reopened = WatermarkStore::open(dir.path()).unwrap();
    let tuesday_last = monday() + Duration::days(1) + Duration::minutes(20 * 60 + 45);
    assert_eq!(reopened.last_timestamp(Timeframe::Minute15, "AAPL"), Some(tuesday_last));

    // Incremental re-run picks up from there.
    let mut marks = reopened;
    let provider = SyntheticProvider::new();
    let opts = IngestOptions::incremental(Timeframe::Minute15, monday() + Duration::days(5));
    let summary = Ingestor::new(&provider, &store).run(&mut marks, &symbols, &opts, &Quiet);
    assert!(summary.all_succeeded());
    assert_eq!(summary.symbols[0].start, tuesday_last + Duration::minutes(15));
    assert_eq!(summary.totals().updated, 0);

    let rows = store.load(Timeframe::Minute15, "AAPL").unwrap();
    assert_eq!(rows.len(), 5 * 26);
    assert_unique(&rows);
    assert_eq!(
        store.meta(Timeframe::Minute15, "AAPL").unwrap().bar_count,
        rows.len()
    );
}

#[test]
fn overlapping_backfill_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = BarStore::new(dir.path());
    let provider = SyntheticProvider::new();
    let ingestor = Ingestor::new(&provider, &store);
    let mut marks = WatermarkStore::open(dir.path()).unwrap();
    let symbols = vec!["SPY".to_string(), "QQQ".to_string()];

    let first = IngestOptions::backfill(Timeframe::Minute30, monday(), monday() + Duration::days(3));
    ingestor.run(&mut marks, &symbols, &first, &Quiet);
    let hash = store.meta(Timeframe::Minute30, "SPY").unwrap().data_hash;

    let second = IngestOptions::backfill(
        Timeframe::Minute30,
        monday() + Duration::days(1),
        monday() + Duration::days(4),
    );
    let summary = ingestor.run(&mut marks, &symbols, &second, &Quiet);
    assert!(summary.all_succeeded());
    // Only Thursday is new: 13 half-hour bars per symbol.
    assert_eq!(summary.totals().inserted, 26);
    assert_eq!(summary.totals().updated, 0);
    assert_ne!(store.meta(Timeframe::Minute30, "SPY").unwrap().data_hash, hash);

    for symbol in ["SPY", "QQQ"] {
        let rows = store.load(Timeframe::Minute30, symbol).unwrap();
        assert_eq!(rows.len(), 4 * 13);
        assert_unique(&rows);
    }
}

#[test]
fn backfill_behind_watermark_does_not_move_it_back() {
    let dir = TempDir::new().unwrap();
    let store = BarStore::new(dir.path());
    let provider = SyntheticProvider::new();
    let ingestor = Ingestor::new(&provider, &store);
    let mut marks = WatermarkStore::open(dir.path()).unwrap();
    let symbols = vec!["MSFT".to_string()];

    let recent = IngestOptions::backfill(
        Timeframe::Hour1,
        monday() + Duration::days(7),
        monday() + Duration::days(8),
    );
    ingestor.run(&mut marks, &symbols, &recent, &Quiet);
    let mark = marks.last_timestamp(Timeframe::Hour1, "MSFT").unwrap();

    let older = IngestOptions::backfill(Timeframe::Hour1, monday(), monday() + Duration::days(1));
    let summary = ingestor.run(&mut marks, &symbols, &older, &Quiet);
    assert_eq!(summary.totals().inserted, 6);
    assert_eq!(marks.last_timestamp(Timeframe::Hour1, "MSFT"), Some(mark));
    assert_eq!(store.load(Timeframe::Hour1, "MSFT").unwrap().len(), 12);
}

#[test]
fn guard_rejections_never_reach_the_store() {
    let dir = TempDir::new().unwrap();
    let store = BarStore::new(dir.path());
    let ts = monday() + Duration::minutes(14 * 60 + 30);
    let good = MinuteBar {
        symbol: "AAPL".into(),
        timestamp: ts,
        open: 170.0,
        high: 171.0,
        low: 169.5,
        close: 170.5,
        volume: 900,
        trade_count: None,
        vwap: None,
    };
    let inverted = MinuteBar {
        timestamp: ts + Duration::minutes(1),
        high: 160.0,
        ..good.clone()
    };
    let outside = MinuteBar {
        timestamp: monday() - Duration::minutes(1),
        ..good.clone()
    };
    let provider = Fixed(vec![good.clone(), inverted, outside, good.clone()]);
    let mut marks = WatermarkStore::open(dir.path()).unwrap();
    let opts = IngestOptions::backfill(Timeframe::Minute1, monday(), monday() + Duration::days(1));

    let summary = Ingestor::new(&provider, &store).run(
        &mut marks,
        &["AAPL".to_string()],
        &opts,
        &Quiet,
    );
    let window = &summary.symbols[0].windows[0];
    assert_eq!(window.fetched, 4);
    assert_eq!(window.accepted, 1);
    assert_eq!(window.rejected, 2);
    assert_eq!(window.duplicates, 1);

    let rows = store.load(Timeframe::Minute1, "AAPL").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].bar, good);
    assert_eq!(rows[0].source, "alpaca");
    assert_eq!(marks.last_timestamp(Timeframe::Minute1, "AAPL"), Some(ts));
}

#[test]
fn progress_sees_every_window() {
    let dir = TempDir::new().unwrap();
    let store = BarStore::new(dir.path());
    let provider = SyntheticProvider::new();
    let mut marks = WatermarkStore::open(dir.path()).unwrap();
    let opts = IngestOptions::backfill(Timeframe::Day1, monday(), monday() + Duration::days(21));
    let progress = Recording::default();

    Ingestor::new(&provider, &store).run(&mut marks, &["SPY".to_string()], &opts, &progress);

    let windows = progress.windows.lock().unwrap();
    let starts: Vec<_> = windows.iter().map(|(_, start)| *start).collect();
    assert_eq!(
        starts,
        vec![monday(), monday() + Duration::days(7), monday() + Duration::days(14)]
    );
    assert_eq!(store.load(Timeframe::Day1, "SPY").unwrap().len(), 15);
}

#[test]
fn legacy_partition_loads_and_upgrades_on_write() {
    let dir = TempDir::new().unwrap();
    let store = BarStore::new(dir.path());
    let ts = monday() + Duration::minutes(14 * 60 + 30);

    // Hand-written v1 partition: Float64 volume, no optional columns.
    let mut df = DataFrame::new(vec![
        Column::new("timestamp".into(), vec![ts.timestamp_millis()])
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .unwrap(),
        Column::new("symbol".into(), vec!["SPY"]),
        Column::new("open".into(), vec![520.0]),
        Column::new("high".into(), vec![521.0]),
        Column::new("low".into(), vec![519.0]),
        Column::new("close".into(), vec![520.5]),
        Column::new("volume".into(), vec![15_000.0]),
    ])
    .unwrap();
    let dir_path = store.symbol_dir(Timeframe::Minute1, "SPY");
    std::fs::create_dir_all(&dir_path).unwrap();
    let file = std::fs::File::create(dir_path.join("2024-04.parquet")).unwrap();
    ParquetWriter::new(file).finish(&mut df).unwrap();

    let rows = store.load(Timeframe::Minute1, "SPY").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].bar.volume, 15_000);
    assert_eq!(rows[0].bar.trade_count, None);
    assert_eq!(rows[0].bar.vwap, None);
    assert_eq!(rows[0].source, "unknown");

    // Ingesting the same day merges into the legacy partition.
    let provider = SyntheticProvider::new();
    let mut marks = WatermarkStore::open(dir.path()).unwrap();
    let opts = IngestOptions::backfill(Timeframe::Minute1, monday(), monday() + Duration::days(1));
    let summary = Ingestor::new(&provider, &store).run(&mut marks, &["SPY".to_string()], &opts, &Quiet);
    assert_eq!(summary.totals().inserted, 389);
    assert_eq!(summary.totals().updated, 1);

    let rows = store.load(Timeframe::Minute1, "SPY").unwrap();
    assert_eq!(rows.len(), 390);
    assert!(rows.iter().all(|r| r.source == "alpaca" || r.source == "synthetic"));
}

#[test]
fn lock_serialises_writers() {
    let dir = TempDir::new().unwrap();
    let store = BarStore::new(dir.path());

    let held = store.lock().unwrap();
    assert!(matches!(store.lock(), Err(DataError::StoreLocked { .. })));
    drop(held);
    assert!(store.lock().is_ok());
}

#[test]
fn daily_csv_with_sub_millisecond_stamp_reimports_cleanly() {
    let dir = TempDir::new().unwrap();
    let store = BarStore::new(dir.path());
    let csv = "\
symbol,timestamp,open,high,low,close,volume
SPY,2024-01-02T05:00:00.000500Z,472.0,474.5,470.1,473.3,81000000
";
    let provider = CsvProvider::from_reader(csv.as_bytes(), "spy_daily.csv").unwrap();
    let (first, last) = provider.span().unwrap();
    let symbols = vec!["SPY".to_string()];
    let opts = IngestOptions::backfill(Timeframe::Day1, first, last + Duration::days(1));
    let mut marks = WatermarkStore::open(dir.path()).unwrap();

    let mut inserted = Vec::new();
    for _ in 0..3 {
        let summary = Ingestor::new(&provider, &store).run(&mut marks, &symbols, &opts, &Quiet);
        assert!(summary.all_succeeded());
        inserted.push(summary.totals().inserted);
    }
    assert_eq!(inserted, vec![1, 0, 0]);

    let rows = store.load(Timeframe::Day1, "SPY").unwrap();
    assert_eq!(rows.len(), 1);
    assert_unique(&rows);
    let midnight = Utc.with_ymd_and_hms(2024, 1, 2, 5, 0, 0).unwrap();
    assert_eq!(rows[0].bar.timestamp, midnight);
    assert_eq!(marks.last_timestamp(Timeframe::Day1, "SPY"), Some(midnight));
}
