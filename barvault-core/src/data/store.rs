//! Parquet bar store with Hive-style partitioning.
//!
//! Layout:
//! ```text
//! {root}/timeframe={TF}/symbol={SYMBOL}/{YYYY}-{MM}.parquet
//! {root}/timeframe={TF}/symbol={SYMBOL}/meta.json
//! {root}/_state/watermarks.json
//! {root}/.lock
//! ```
//!
//! Features:
//! - Atomic writes (write to .tmp, rename into place)
//! - Strict partition reads for writers, tolerant loads that quarantine
//!   corrupt files ({filename}.quarantined)
//! - Schema evolution on read (see [`BarSchema::conform`])
//! - Metadata sidecar per symbol (row counts, range, BLAKE3 hashes)

use super::lock::StoreLock;
use super::provider::DataError;
use super::schema::{BarSchema, SCHEMA_VERSION};
use crate::domain::{MinuteBar, Timeframe};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const META_FILE: &str = "meta.json";
pub const LOCK_FILE: &str = ".lock";
pub const STATE_DIR: &str = "_state";

/// A bar as it sits in the store: market data plus provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub bar: MinuteBar,
    pub source: String,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// One calendar month of one symbol's bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn of(ts: DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{self}.parquet")
    }

    /// Parse a file stem like `2024-03`.
    pub fn parse(stem: &str) -> Option<Self> {
        let (year, month) = stem.split_once('-')?;
        let year: i32 = year.parse().ok()?;
        let month: u32 = month.parse().ok()?;
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    /// First instant of the month.
    pub fn start(&self) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0).single()
    }

    /// First instant of the following month.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        let (year, month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
    }

    /// Whether the month overlaps `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match (self.start(), self.end()) {
            (Some(p_start), Some(p_end)) => p_start < end && start < p_end,
            _ => false,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Per-partition entry in `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub rows: usize,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub hash: String,
}

impl PartitionMeta {
    /// Summarise sorted rows. `None` for an empty partition.
    pub fn from_rows(rows: &[StoredRow]) -> Option<Self> {
        let first = rows.first()?;
        let last = rows.last()?;
        Some(Self {
            rows: rows.len(),
            first_timestamp: first.bar.timestamp,
            last_timestamp: last.bar.timestamp,
            hash: partition_hash(rows),
        })
    }
}

/// Metadata sidecar for a stored (timeframe, symbol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub schema_version: u32,
    pub bar_count: usize,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub partitions: BTreeMap<String, PartitionMeta>,
    pub data_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl StoreMeta {
    pub fn from_partitions(
        symbol: &str,
        timeframe: Timeframe,
        partitions: BTreeMap<String, PartitionMeta>,
    ) -> Self {
        let bar_count = partitions.values().map(|p| p.rows).sum();
        let first_timestamp = partitions.values().map(|p| p.first_timestamp).min();
        let last_timestamp = partitions.values().map(|p| p.last_timestamp).max();
        let data_hash = meta_hash(&partitions);
        Self {
            symbol: symbol.to_string(),
            timeframe,
            schema_version: SCHEMA_VERSION,
            bar_count,
            first_timestamp,
            last_timestamp,
            partitions,
            data_hash,
            updated_at: Utc::now(),
        }
    }
}

/// BLAKE3 over the market-data fields of sorted rows. Provenance is excluded
/// so re-fetching identical bars does not change the hash.
pub fn partition_hash(rows: &[StoredRow]) -> String {
    let mut hasher = blake3::Hasher::new();
    for row in rows {
        let bar = &row.bar;
        hasher.update(bar.symbol.as_bytes());
        hasher.update(&bar.timestamp_ms().to_le_bytes());
        for price in [bar.open, bar.high, bar.low, bar.close] {
            hasher.update(&price.to_bits().to_le_bytes());
        }
        hasher.update(&bar.volume.to_le_bytes());
        hasher.update(&bar.trade_count.unwrap_or(u64::MAX).to_le_bytes());
        hasher.update(&bar.vwap.map_or(u64::MAX, f64::to_bits).to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// BLAKE3 over partition hashes in key order.
pub fn meta_hash(partitions: &BTreeMap<String, PartitionMeta>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (key, partition) in partitions {
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hasher.update(partition.hash.as_bytes());
        hasher.update(b";");
    }
    hasher.finalize().to_hex().to_string()
}

/// Store status for a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub stored: bool,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub bar_count: Option<usize>,
    pub partitions: usize,
}

/// The Parquet bar store.
pub struct BarStore {
    root: PathBuf,
}

impl BarStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for internal state files: `{root}/_state/`
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    fn timeframe_dir(&self, timeframe: Timeframe) -> PathBuf {
        self.root.join(format!("timeframe={timeframe}"))
    }

    /// `{root}/timeframe={TF}/symbol={SYMBOL}/`
    pub fn symbol_dir(&self, timeframe: Timeframe, symbol: &str) -> PathBuf {
        self.timeframe_dir(timeframe).join(format!("symbol={symbol}"))
    }

    pub fn partition_path(&self, timeframe: Timeframe, symbol: &str, key: PartitionKey) -> PathBuf {
        self.symbol_dir(timeframe, symbol).join(key.file_name())
    }

    fn meta_path(&self, timeframe: Timeframe, symbol: &str) -> PathBuf {
        self.symbol_dir(timeframe, symbol).join(META_FILE)
    }

    /// Take the exclusive writer lock.
    pub fn lock(&self) -> Result<StoreLock, DataError> {
        StoreLock::acquire(self.root.join(LOCK_FILE))
    }

    /// Partition keys present on disk for a symbol, ascending.
    pub fn partitions(
        &self,
        timeframe: Timeframe,
        symbol: &str,
    ) -> Result<Vec<PartitionKey>, DataError> {
        let dir = self.symbol_dir(timeframe, symbol);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            // Skip meta.json, .tmp and .quarantined files
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(PartitionKey::parse)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Read one partition. A missing file is an empty partition; an
    /// unreadable one is `CorruptPartition` and is left in place.
    pub fn read_partition(
        &self,
        timeframe: Timeframe,
        symbol: &str,
        key: PartitionKey,
    ) -> Result<Vec<StoredRow>, DataError> {
        let path = self.partition_path(timeframe, symbol, key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let df = read_parquet(&path)?;
        conform_rows(&df, timeframe).map_err(|e| corrupt(&path, e))
    }

    /// Replace one partition with `rows` (sorted, unique). Writes are atomic;
    /// an empty `rows` removes the partition.
    pub fn write_partition(
        &self,
        timeframe: Timeframe,
        symbol: &str,
        key: PartitionKey,
        rows: &[StoredRow],
    ) -> Result<Option<PartitionMeta>, DataError> {
        let path = self.partition_path(timeframe, symbol, key);
        let Some(meta) = PartitionMeta::from_rows(rows) else {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            return Ok(None);
        };

        let dir = self.symbol_dir(timeframe, symbol);
        fs::create_dir_all(&dir)
            .map_err(|e| DataError::StoreError(format!("failed to create dir: {e}")))?;

        let mut df = BarSchema::to_frame(rows, timeframe)?;
        let tmp_path = path.with_extension("parquet.tmp");
        write_parquet(&mut df, &tmp_path)?;

        // Atomic rename
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            DataError::StoreError(format!("atomic rename failed: {e}"))
        })?;

        tracing::debug!(
            timeframe = %timeframe,
            symbol,
            partition = %key,
            rows = meta.rows,
            "partition written"
        );
        Ok(Some(meta))
    }

    /// Load every stored row for a symbol, sorted by timestamp.
    ///
    /// Corrupt partitions are quarantined and skipped.
    pub fn load(&self, timeframe: Timeframe, symbol: &str) -> Result<Vec<StoredRow>, DataError> {
        let mut rows = Vec::new();
        for key in self.partitions(timeframe, symbol)? {
            match self.read_partition(timeframe, symbol, key) {
                Ok(partition) => rows.extend(partition),
                Err(DataError::CorruptPartition { path, reason }) => {
                    quarantine(Path::new(&path), &reason);
                }
                Err(e) => return Err(e),
            }
        }
        rows.sort_by_key(|r| r.bar.timestamp);
        Ok(rows)
    }

    /// Load bars in `[start, end)` using a lazy timestamp filter on each
    /// overlapping partition. Corrupt partitions are quarantined and skipped.
    pub fn load_range(
        &self,
        timeframe: Timeframe,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MinuteBar>, DataError> {
        let mut bars = Vec::new();
        if start >= end {
            return Ok(bars);
        }

        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        for key in self.partitions(timeframe, symbol)? {
            if !key.overlaps(start, end) {
                continue;
            }
            let path = self.partition_path(timeframe, symbol, key);
            let filtered = read_parquet(&path).and_then(|df| {
                let df = BarSchema::conform(&df, timeframe).map_err(|e| corrupt(&path, e))?;
                let ts = || col("timestamp").cast(DataType::Int64);
                df.lazy()
                    .filter(ts().gt_eq(lit(start_ms)).and(ts().lt(lit(end_ms))))
                    .collect()
                    .map_err(|e| corrupt(&path, e))
            });

            match filtered.and_then(|df| BarSchema::from_frame(&df).map_err(|e| corrupt(&path, e))) {
                Ok(rows) => bars.extend(rows.into_iter().map(|r| r.bar)),
                Err(DataError::CorruptPartition { path, reason }) => {
                    quarantine(Path::new(&path), &reason);
                }
                Err(e) => return Err(e),
            }
        }
        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }

    /// Metadata sidecar for a symbol, if present and readable.
    pub fn meta(&self, timeframe: Timeframe, symbol: &str) -> Option<StoreMeta> {
        let content = fs::read_to_string(self.meta_path(timeframe, symbol)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn write_meta(&self, meta: &StoreMeta) -> Result<(), DataError> {
        let path = self.meta_path(meta.timeframe, &meta.symbol);
        let json = serde_json::to_string_pretty(meta)
            .map_err(|e| DataError::StoreError(format!("meta serialization: {e}")))?;
        write_atomic(&path, json.as_bytes())
    }

    /// Apply partition changes (`None` = removed) to the sidecar and persist
    /// it. Without an existing sidecar, the partitions on disk are summarised
    /// first.
    pub fn update_meta(
        &self,
        timeframe: Timeframe,
        symbol: &str,
        changes: BTreeMap<PartitionKey, Option<PartitionMeta>>,
    ) -> Result<StoreMeta, DataError> {
        let mut partitions = match self.meta(timeframe, symbol) {
            Some(meta) => meta.partitions,
            None => self.scan_partitions(timeframe, symbol)?,
        };
        for (key, change) in changes {
            match change {
                Some(partition) => partitions.insert(key.to_string(), partition),
                None => partitions.remove(&key.to_string()),
            };
        }
        let meta = StoreMeta::from_partitions(symbol, timeframe, partitions);
        self.write_meta(&meta)?;
        Ok(meta)
    }

    /// Summarise every readable partition on disk.
    pub fn scan_partitions(
        &self,
        timeframe: Timeframe,
        symbol: &str,
    ) -> Result<BTreeMap<String, PartitionMeta>, DataError> {
        let mut partitions = BTreeMap::new();
        for key in self.partitions(timeframe, symbol)? {
            let rows = self.read_partition(timeframe, symbol, key)?;
            if let Some(meta) = PartitionMeta::from_rows(&rows) {
                partitions.insert(key.to_string(), meta);
            }
        }
        Ok(partitions)
    }

    /// Timeframes that have a directory in the store.
    pub fn timeframes(&self) -> Vec<Timeframe> {
        let mut found: Vec<Timeframe> = list_prefixed(&self.root, "timeframe=")
            .into_iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        found.sort();
        found
    }

    /// Symbols stored for a timeframe, sorted.
    pub fn symbols(&self, timeframe: Timeframe) -> Vec<String> {
        let mut found = list_prefixed(&self.timeframe_dir(timeframe), "symbol=");
        found.sort();
        found
    }

    /// Which symbols have stored data, and their ranges.
    pub fn status(&self, timeframe: Timeframe, symbols: &[&str]) -> Vec<SymbolStatus> {
        symbols
            .iter()
            .map(|sym| {
                let meta = self.meta(timeframe, sym);
                SymbolStatus {
                    symbol: sym.to_string(),
                    timeframe,
                    stored: meta.is_some(),
                    first_timestamp: meta.as_ref().and_then(|m| m.first_timestamp),
                    last_timestamp: meta.as_ref().and_then(|m| m.last_timestamp),
                    bar_count: meta.as_ref().map(|m| m.bar_count),
                    partitions: meta.as_ref().map_or(0, |m| m.partitions.len()),
                }
            })
            .collect()
    }
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn corrupt(path: &Path, reason: impl fmt::Display) -> DataError {
    DataError::CorruptPartition {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn quarantine(path: &Path, reason: &str) {
    let target = path.with_extension("parquet.quarantined");
    tracing::warn!(
        path = %path.display(),
        reason,
        "quarantining corrupt partition"
    );
    if let Err(e) = fs::rename(path, &target) {
        tracing::warn!(path = %path.display(), error = %e, "quarantine rename failed");
    }
}

fn conform_rows(df: &DataFrame, timeframe: Timeframe) -> Result<Vec<StoredRow>, DataError> {
    let conformed = BarSchema::conform(df, timeframe)?;
    Ok(BarSchema::from_frame(&conformed)?)
}

fn read_parquet(path: &Path) -> Result<DataFrame, DataError> {
    let file = fs::File::open(path)?;
    ParquetReader::new(file).finish().map_err(|e| corrupt(path, e))
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), DataError> {
    let file = fs::File::create(path)?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| DataError::StoreError(format!("write parquet: {e}")))?;
    Ok(())
}

/// Write a small file via `.tmp` + rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), DataError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        DataError::StoreError(format!("atomic rename failed: {e}"))
    })
}

fn list_prefixed(dir: &Path, prefix: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(prefix))
                .map(str::to_string)
        })
        .collect()
}
