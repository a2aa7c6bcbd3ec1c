//! CSV import provider.
//!
//! Expected header: `symbol,timestamp,open,high,low,close,volume` with
//! optional `trade_count,vwap`. Timestamps are RFC 3339. This is the same
//! format `barvault export` writes.

use super::provider::{BarProvider, BarRequest, DataError, DataSource, FetchResult};
use crate::domain::MinuteBar;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct CsvRecord {
    symbol: String,
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    trade_count: Option<u64>,
    #[serde(default)]
    vwap: Option<f64>,
}

pub struct CsvProvider {
    path: PathBuf,
    bars: Vec<MinuteBar>,
}

impl CsvProvider {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DataError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let bars = parse_bars(file)?;
        tracing::info!(path = %path.display(), rows = bars.len(), "csv loaded");
        Ok(Self {
            path: path.to_path_buf(),
            bars,
        })
    }

    /// Parse CSV from any reader (path is informational only).
    pub fn from_reader(reader: impl Read, path: impl Into<PathBuf>) -> Result<Self, DataError> {
        Ok(Self {
            path: path.into(),
            bars: parse_bars(reader)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows in the file, sorted by (symbol, timestamp).
    pub fn bars(&self) -> &[MinuteBar] {
        &self.bars
    }

    /// Distinct symbols in the file.
    pub fn symbols(&self) -> Vec<String> {
        self.bars
            .iter()
            .map(|b| b.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Earliest and latest timestamp in the file.
    pub fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.bars.iter().map(|b| b.timestamp).min()?;
        let last = self.bars.iter().map(|b| b.timestamp).max()?;
        Some((first, last))
    }
}

fn parse_bars(reader: impl Read) -> Result<Vec<MinuteBar>, DataError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut bars = Vec::new();
    for (i, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        // Header is line 1
        let line = i as u64 + 2;
        let record = result.map_err(|e| DataError::Csv {
            line,
            reason: e.to_string(),
        })?;

        let timestamp = DateTime::parse_from_rfc3339(&record.timestamp)
            .map_err(|e| DataError::Csv {
                line,
                reason: format!("timestamp '{}': {e}", record.timestamp),
            })?
            .with_timezone(&Utc);

        if !record.volume.is_finite() || record.volume < 0.0 {
            return Err(DataError::Csv {
                line,
                reason: format!("invalid volume {}", record.volume),
            });
        }

        bars.push(MinuteBar {
            symbol: record.symbol,
            timestamp,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume.round() as u64,
            trade_count: record.trade_count,
            vwap: record.vwap,
        });
    }

    bars.sort_by(|a, b| a.key().cmp(&b.key()));
    Ok(bars)
}

impl BarProvider for CsvProvider {
    fn name(&self) -> &str {
        "csv_import"
    }

    fn source(&self) -> DataSource {
        DataSource::CsvImport
    }

    fn fetch_bars(&self, request: &BarRequest) -> Result<FetchResult, DataError> {
        let bars = self
            .bars
            .iter()
            .filter(|b| request.symbols.iter().any(|s| s == &b.symbol) && request.contains(b.timestamp))
            .cloned()
            .collect();
        Ok(FetchResult {
            bars,
            pages: 1,
            source: DataSource::CsvImport,
        })
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timeframe;
    use chrono::TimeZone;

    const SAMPLE: &str = "\
symbol,timestamp,open,high,low,close,volume,trade_count,vwap
MSFT,2024-02-01T14:31:00Z,400.0,401.0,399.5,400.5,1200,15,400.2
AAPL,2024-02-01T14:30:00Z,185.0,185.5,184.8,185.2,3000,,
AAPL,2024-02-01T14:31:00+00:00,185.2,185.9,185.1,185.8,2500.0,22,185.5
";

    fn provider() -> CsvProvider {
        CsvProvider::from_reader(SAMPLE.as_bytes(), "sample.csv").unwrap()
    }

    #[test]
    fn parses_and_sorts() {
        let csv = provider();
        assert_eq!(csv.bars().len(), 3);
        assert_eq!(csv.bars()[0].symbol, "AAPL");
        assert_eq!(csv.bars()[0].trade_count, None);
        assert_eq!(csv.bars()[0].vwap, None);
        assert_eq!(csv.bars()[1].volume, 2500);
        assert_eq!(csv.bars()[2].symbol, "MSFT");
        assert_eq!(csv.symbols(), vec!["AAPL".to_string(), "MSFT".to_string()]);
    }

    #[test]
    fn span_covers_file() {
        let (first, last) = provider().span().unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2024, 2, 1, 14, 30, 0).unwrap());
        assert_eq!(last, Utc.with_ymd_and_hms(2024, 2, 1, 14, 31, 0).unwrap());
    }

    #[test]
    fn fetch_filters_symbol_and_window() {
        let csv = provider();
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 14, 31, 0).unwrap();
        let request = BarRequest::single("AAPL", Timeframe::Minute1, start, start + chrono::Duration::minutes(1));
        let fetched = csv.fetch_bars(&request).unwrap();
        assert_eq!(fetched.bars.len(), 1);
        assert_eq!(fetched.bars[0].close, 185.8);
        assert_eq!(fetched.source, DataSource::CsvImport);
    }

    #[test]
    fn bad_timestamp_reports_line() {
        let data = "symbol,timestamp,open,high,low,close,volume\nSPY,2024-02-01T14:30:00Z,1,1,1,1,1\nSPY,yesterday,1,1,1,1,1\n";
        let err = CsvProvider::from_reader(data.as_bytes(), "bad.csv").err().unwrap();
        assert!(matches!(err, DataError::Csv { line: 3, .. }), "{err}");
    }

    #[test]
    fn bad_number_reports_line() {
        let data = "symbol,timestamp,open,high,low,close,volume\nSPY,2024-02-01T14:30:00Z,abc,1,1,1,1\n";
        let err = CsvProvider::from_reader(data.as_bytes(), "bad.csv").err().unwrap();
        assert!(matches!(err, DataError::Csv { line: 2, .. }), "{err}");
    }

    #[test]
    fn empty_file_has_no_span() {
        let data = "symbol,timestamp,open,high,low,close,volume\n";
        let csv = CsvProvider::from_reader(data.as_bytes(), "empty.csv").unwrap();
        assert!(csv.span().is_none());
        assert!(csv.symbols().is_empty());
    }
}
