//! Frame-level bar schema and schema evolution.
//!
//! Version history of the partition layout:
//! - v1: `timestamp, symbol, open, high, low, close, volume(Float64)`
//! - v2: adds `trade_count`, `vwap`, `timeframe`, `source`, `fetched_at`;
//!   `volume` becomes `UInt64`.
//!
//! `BarSchema::conform` brings a frame read from any version up to the current
//! layout so the rest of the store only ever sees v2.

use super::store::StoredRow;
use crate::domain::{MinuteBar, Timeframe};
use chrono::DateTime;
use polars::prelude::*;

pub const SCHEMA_VERSION: u32 = 2;

/// Columns every partition must carry, in any schema version.
pub const REQUIRED_COLUMNS: [&str; 7] = ["symbol", "timestamp", "open", "high", "low", "close", "volume"];

const UNKNOWN_SOURCE: &str = "unknown";

fn millis() -> DataType {
    DataType::Datetime(TimeUnit::Milliseconds, None)
}

/// Expected schema for stored bars
pub struct BarSchema;

impl BarSchema {
    /// The current (v2) partition schema.
    pub fn schema() -> Schema {
        Schema::from_iter(vec![
            Field::new("symbol".into(), DataType::String),
            Field::new("timestamp".into(), millis()),
            Field::new("open".into(), DataType::Float64),
            Field::new("high".into(), DataType::Float64),
            Field::new("low".into(), DataType::Float64),
            Field::new("close".into(), DataType::Float64),
            Field::new("volume".into(), DataType::UInt64),
            Field::new("trade_count".into(), DataType::UInt64),
            Field::new("vwap".into(), DataType::Float64),
            Field::new("timeframe".into(), DataType::String),
            Field::new("source".into(), DataType::String),
            Field::new("fetched_at".into(), millis()),
        ])
    }

    /// Validate that a frame matches the current schema exactly.
    pub fn validate(df: &DataFrame) -> Result<(), SchemaError> {
        for field in Self::schema().iter_fields() {
            let column = df
                .column(field.name().as_str())
                .map_err(|_| SchemaError::MissingColumn(field.name().to_string()))?;
            if column.dtype() != field.dtype() {
                return Err(SchemaError::TypeMismatch {
                    column: field.name().to_string(),
                    expected: field.dtype().clone(),
                    actual: column.dtype().clone(),
                });
            }
        }
        Ok(())
    }

    /// Evolve a stored frame to the current schema.
    ///
    /// Missing required columns fail; castable numeric and datetime-unit
    /// differences are cast; missing optional columns are filled (`timeframe`
    /// from the partition, `source` as "unknown", the rest null); columns the
    /// schema does not know are dropped.
    pub fn conform(df: &DataFrame, timeframe: Timeframe) -> Result<DataFrame, SchemaError> {
        let schema = Self::schema();
        let height = df.height();
        let mut columns = Vec::with_capacity(schema.len());

        for field in schema.iter_fields() {
            let name = field.name().as_str();
            let column = match df.column(name) {
                Ok(existing) => coerce(existing, name, field.dtype())?,
                Err(_) if REQUIRED_COLUMNS.contains(&name) => {
                    return Err(SchemaError::MissingColumn(name.to_string()));
                }
                Err(_) => fill_missing(name, field.dtype(), height, timeframe)?,
            };
            columns.push(column);
        }

        for name in df.get_column_names() {
            if !schema.contains(name.as_str()) {
                tracing::debug!(column = %name, "dropping unknown column");
            }
        }

        Ok(DataFrame::new(columns)?)
    }

    /// Build a v2 frame from stored rows.
    pub fn to_frame(rows: &[StoredRow], timeframe: Timeframe) -> Result<DataFrame, SchemaError> {
        let n = rows.len();
        let symbols: Vec<&str> = rows.iter().map(|r| r.bar.symbol.as_str()).collect();
        let timestamps: Vec<i64> = rows.iter().map(|r| r.bar.timestamp_ms()).collect();
        let opens: Vec<f64> = rows.iter().map(|r| r.bar.open).collect();
        let highs: Vec<f64> = rows.iter().map(|r| r.bar.high).collect();
        let lows: Vec<f64> = rows.iter().map(|r| r.bar.low).collect();
        let closes: Vec<f64> = rows.iter().map(|r| r.bar.close).collect();
        let volumes: Vec<u64> = rows.iter().map(|r| r.bar.volume).collect();
        let trade_counts: Vec<Option<u64>> = rows.iter().map(|r| r.bar.trade_count).collect();
        let vwaps: Vec<Option<f64>> = rows.iter().map(|r| r.bar.vwap).collect();
        let timeframes: Vec<&str> = vec![timeframe.as_str(); n];
        let sources: Vec<&str> = rows.iter().map(|r| r.source.as_str()).collect();
        let fetched: Vec<Option<i64>> = rows
            .iter()
            .map(|r| r.fetched_at.map(|t| t.timestamp_millis()))
            .collect();

        let df = DataFrame::new(vec![
            Column::new("symbol".into(), symbols),
            Column::new("timestamp".into(), timestamps).cast(&millis())?,
            Column::new("open".into(), opens),
            Column::new("high".into(), highs),
            Column::new("low".into(), lows),
            Column::new("close".into(), closes),
            Column::new("volume".into(), volumes),
            Column::new("trade_count".into(), trade_counts),
            Column::new("vwap".into(), vwaps),
            Column::new("timeframe".into(), timeframes),
            Column::new("source".into(), sources),
            Column::new("fetched_at".into(), fetched).cast(&millis())?,
        ])?;
        Ok(df)
    }

    /// Read rows back out of a conformed frame.
    pub fn from_frame(df: &DataFrame) -> Result<Vec<StoredRow>, SchemaError> {
        let ts_col = df.column("timestamp")?.cast(&DataType::Int64)?;
        let fetched_col = df.column("fetched_at")?.cast(&DataType::Int64)?;

        let ts = ts_col.i64()?;
        let fetched = fetched_col.i64()?;
        let symbol = df.column("symbol")?.str()?;
        let open = df.column("open")?.f64()?;
        let high = df.column("high")?.f64()?;
        let low = df.column("low")?.f64()?;
        let close = df.column("close")?.f64()?;
        let volume = df.column("volume")?.u64()?;
        let trade_count = df.column("trade_count")?.u64()?;
        let vwap = df.column("vwap")?.f64()?;
        let source = df.column("source")?.str()?;

        let mut rows = Vec::with_capacity(df.height());
        for row in 0..df.height() {
            let null = |column: &str| SchemaError::NullValue {
                column: column.to_string(),
                row,
            };
            let ms = ts.get(row).ok_or_else(|| null("timestamp"))?;
            let timestamp = DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| SchemaError::Polars(format!("timestamp {ms} out of range")))?;

            rows.push(StoredRow {
                bar: MinuteBar {
                    symbol: symbol.get(row).ok_or_else(|| null("symbol"))?.to_string(),
                    timestamp,
                    open: open.get(row).ok_or_else(|| null("open"))?,
                    high: high.get(row).ok_or_else(|| null("high"))?,
                    low: low.get(row).ok_or_else(|| null("low"))?,
                    close: close.get(row).ok_or_else(|| null("close"))?,
                    volume: volume.get(row).ok_or_else(|| null("volume"))?,
                    trade_count: trade_count.get(row),
                    vwap: vwap.get(row),
                },
                source: source.get(row).unwrap_or(UNKNOWN_SOURCE).to_string(),
                fetched_at: fetched.get(row).and_then(DateTime::from_timestamp_millis),
            });
        }
        Ok(rows)
    }
}

fn is_number(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Float64
            | DataType::Float32
            | DataType::Int64
            | DataType::Int32
            | DataType::UInt64
            | DataType::UInt32
    )
}

fn coerce(column: &Column, name: &str, target: &DataType) -> Result<Column, SchemaError> {
    let actual = column.dtype();
    if actual == target {
        return Ok(column.clone());
    }
    let castable = (is_number(actual) && is_number(target))
        || (matches!(actual, DataType::Datetime(_, _)) && matches!(target, DataType::Datetime(_, _)));
    if !castable {
        return Err(SchemaError::TypeMismatch {
            column: name.to_string(),
            expected: target.clone(),
            actual: actual.clone(),
        });
    }
    tracing::debug!(column = name, from = ?actual, to = ?target, "casting column");
    Ok(column.cast(target)?)
}

fn fill_missing(
    name: &str,
    dtype: &DataType,
    height: usize,
    timeframe: Timeframe,
) -> Result<Column, SchemaError> {
    let column = match (name, dtype) {
        ("timeframe", _) => Column::new(name.into(), vec![timeframe.as_str(); height]),
        ("source", _) => Column::new(name.into(), vec![UNKNOWN_SOURCE; height]),
        (_, DataType::UInt64) => Column::new(name.into(), vec![None::<u64>; height]),
        (_, DataType::Float64) => Column::new(name.into(), vec![None::<f64>; height]),
        (_, DataType::Datetime(_, _)) => {
            Column::new(name.into(), vec![None::<i64>; height]).cast(dtype)?
        }
        _ => {
            return Err(SchemaError::MissingColumn(name.to_string()));
        }
    };
    Ok(column)
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("Null value in required column {column} at row {row}")]
    NullValue { column: String, row: usize },

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<PolarsError> for SchemaError {
    fn from(e: PolarsError) -> Self {
        SchemaError::Polars(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_rows() -> Vec<StoredRow> {
        vec![
            StoredRow {
                bar: MinuteBar {
                    symbol: "AAPL".into(),
                    timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap(),
                    open: 187.15,
                    high: 187.40,
                    low: 186.90,
                    close: 187.05,
                    volume: 412_300,
                    trade_count: Some(5120),
                    vwap: Some(187.11),
                },
                source: "alpaca".into(),
                fetched_at: Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()),
            },
            StoredRow {
                bar: MinuteBar {
                    symbol: "AAPL".into(),
                    timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 14, 31, 0).unwrap(),
                    open: 187.05,
                    high: 187.20,
                    low: 186.95,
                    close: 187.10,
                    volume: 98_100,
                    trade_count: None,
                    vwap: None,
                },
                source: "alpaca".into(),
                fetched_at: None,
            },
        ]
    }

    #[test]
    fn test_schema_has_all_columns() {
        let schema = BarSchema::schema();
        for name in REQUIRED_COLUMNS {
            assert!(schema.contains(name), "missing {name}");
        }
        assert!(schema.contains("vwap"));
        assert!(schema.contains("fetched_at"));
        assert_eq!(schema.len(), 12);
    }

    #[test]
    fn test_frame_matches_schema_and_reads_back() {
        let rows = sample_rows();
        let df = BarSchema::to_frame(&rows, Timeframe::Minute1).unwrap();
        BarSchema::validate(&df).unwrap();

        let back = BarSchema::from_frame(&df).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn test_conform_evolves_v1_frame() {
        // v1 layout: Float64 volume, no trade_count/vwap/provenance.
        let df = DataFrame::new(vec![
            Column::new("timestamp".into(), vec![1_704_205_800_000i64])
                .cast(&millis())
                .unwrap(),
            Column::new("symbol".into(), vec!["SPY"]),
            Column::new("open".into(), vec![470.0]),
            Column::new("high".into(), vec![471.5]),
            Column::new("low".into(), vec![469.8]),
            Column::new("close".into(), vec![471.0]),
            Column::new("volume".into(), vec![120_000.0]),
        ])
        .unwrap();

        let conformed = BarSchema::conform(&df, Timeframe::Minute1).unwrap();
        BarSchema::validate(&conformed).unwrap();

        let rows = BarSchema::from_frame(&conformed).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bar.volume, 120_000);
        assert_eq!(rows[0].bar.trade_count, None);
        assert_eq!(rows[0].bar.vwap, None);
        assert_eq!(rows[0].source, "unknown");
        assert_eq!(rows[0].fetched_at, None);
        let timeframes = conformed.column("timeframe").unwrap();
        assert_eq!(timeframes.str().unwrap().get(0), Some("1Min"));
    }

    #[test]
    fn test_conform_casts_datetime_unit_and_drops_extras() {
        let df = DataFrame::new(vec![
            Column::new("timestamp".into(), vec![1_704_205_800_000_000_000i64])
                .cast(&DataType::Datetime(TimeUnit::Nanoseconds, None))
                .unwrap(),
            Column::new("symbol".into(), vec!["SPY"]),
            Column::new("open".into(), vec![470.0]),
            Column::new("high".into(), vec![471.5]),
            Column::new("low".into(), vec![469.8]),
            Column::new("close".into(), vec![471.0]),
            Column::new("volume".into(), vec![120_000u64]),
            Column::new("exchange".into(), vec!["V"]),
        ])
        .unwrap();

        let conformed = BarSchema::conform(&df, Timeframe::Minute5).unwrap();
        assert!(conformed.column("exchange").is_err());
        let rows = BarSchema::from_frame(&conformed).unwrap();
        assert_eq!(rows[0].bar.timestamp_ms(), 1_704_205_800_000);
    }

    #[test]
    fn test_conform_rejects_missing_required_column() {
        let df = DataFrame::new(vec![
            Column::new("symbol".into(), vec!["SPY"]),
            Column::new("open".into(), vec![470.0]),
        ])
        .unwrap();

        let err = BarSchema::conform(&df, Timeframe::Minute1).unwrap_err();
        assert!(matches!(err, SchemaError::MissingColumn(ref c) if c == "timestamp"));
    }

    #[test]
    fn test_conform_rejects_wrong_type() {
        let df = DataFrame::new(vec![
            Column::new("timestamp".into(), vec![1_704_205_800_000i64])
                .cast(&millis())
                .unwrap(),
            Column::new("symbol".into(), vec!["SPY"]),
            Column::new("open".into(), vec!["not_a_number"]),
            Column::new("high".into(), vec![471.5]),
            Column::new("low".into(), vec![469.8]),
            Column::new("close".into(), vec![471.0]),
            Column::new("volume".into(), vec![1u64]),
        ])
        .unwrap();

        let err = BarSchema::conform(&df, Timeframe::Minute1).unwrap_err();
        assert!(matches!(err, SchemaError::TypeMismatch { .. }));
    }

    #[test]
    fn test_null_in_required_column_is_reported() {
        let mut df = BarSchema::to_frame(&sample_rows(), Timeframe::Minute1).unwrap();
        df.with_column(Column::new("close".into(), vec![Some(1.0), None::<f64>]))
            .unwrap();

        let err = BarSchema::from_frame(&df).unwrap_err();
        assert!(matches!(err, SchemaError::NullValue { ref column, row: 1 } if column == "close"));
    }
}
