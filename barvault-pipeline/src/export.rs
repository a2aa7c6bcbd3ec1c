//! CSV export of stored bars.
//!
//! Columns: symbol, timestamp, open, high, low, close, volume, trade_count,
//! vwap. Timestamps are RFC 3339 UTC; absent optional fields are empty. The
//! output is accepted as-is by `import`.

use crate::run::PipelineError;
use barvault_core::domain::MinuteBar;
use chrono::SecondsFormat;
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const CSV_HEADER: [&str; 9] = [
    "symbol",
    "timestamp",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "trade_count",
    "vwap",
];

/// Write bars as CSV to any writer. Returns the number of rows written.
pub fn write_csv<W: Write>(writer: W, bars: &[MinuteBar]) -> Result<usize, PipelineError> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(CSV_HEADER)?;

    for bar in bars {
        wtr.write_record([
            bar.symbol.clone(),
            bar.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            bar.open.to_string(),
            bar.high.to_string(),
            bar.low.to_string(),
            bar.close.to_string(),
            bar.volume.to_string(),
            bar.trade_count.map(|n| n.to_string()).unwrap_or_default(),
            bar.vwap.map(|v| v.to_string()).unwrap_or_default(),
        ])?;
    }

    wtr.flush()?;
    Ok(bars.len())
}

/// Export bars to a CSV string.
pub fn export_csv_string(bars: &[MinuteBar]) -> Result<String, PipelineError> {
    let mut buf = Vec::new();
    write_csv(&mut buf, bars)?;
    String::from_utf8(buf).map_err(|e| PipelineError::Invalid(format!("CSV output is not valid UTF-8: {e}")))
}

/// Export bars to a file, creating parent directories.
pub fn export_csv(path: &Path, bars: &[MinuteBar]) -> Result<usize, PipelineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let rows = write_csv(file, bars)?;
    tracing::info!(path = %path.display(), rows, "exported csv");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use barvault_core::data::CsvProvider;
    use chrono::{TimeZone, Utc};

    fn bar(minute: u32, vwap: Option<f64>) -> MinuteBar {
        MinuteBar {
            symbol: "AAPL".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 14, minute, 0).unwrap(),
            open: 187.15,
            high: 188.0,
            low: 186.5,
            close: 187.42,
            volume: 12_345,
            trade_count: vwap.map(|_| 97),
            vwap,
        }
    }

    #[test]
    fn header_and_rows() {
        let csv = export_csv_string(&[bar(30, Some(187.3)), bar(31, None)]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "symbol,timestamp,open,high,low,close,volume,trade_count,vwap");
        assert_eq!(lines[1], "AAPL,2024-01-02T14:30:00Z,187.15,188,186.5,187.42,12345,97,187.3");
        assert_eq!(lines[2], "AAPL,2024-01-02T14:31:00Z,187.15,188,186.5,187.42,12345,,");
    }

    #[test]
    fn empty_export_has_header_only() {
        let csv = export_csv_string(&[]).unwrap();
        assert_eq!(csv.lines().count(), 1);
    }

    #[test]
    fn export_is_importable() {
        let bars = vec![bar(30, Some(187.3)), bar(31, None)];
        let csv = export_csv_string(&bars).unwrap();

        let imported = CsvProvider::from_reader(csv.as_bytes(), "export.csv").unwrap();
        assert_eq!(imported.bars(), bars.as_slice());
    }

    #[test]
    fn writes_file_with_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out").join("aapl.csv");
        let rows = export_csv(&path, &[bar(30, None)]).unwrap();
        assert_eq!(rows, 1);
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("symbol,timestamp"));
    }
}
