//! Per-(timeframe, symbol) watermarks: the latest bar timestamp committed to
//! the store. Incremental ingests resume one bar after the watermark.
//!
//! File: `{root}/_state/watermarks.json`
//! ```json
//! { "version": 1, "entries": { "1Min/AAPL": { "last_timestamp": "...",
//!   "updated_at": "...", "bars_ingested": 390 } } }
//! ```

use super::provider::DataError;
use super::store::{write_atomic, BarStore, STATE_DIR};
use crate::domain::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const WATERMARK_FILE: &str = "watermarks.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkEntry {
    pub last_timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub bars_ingested: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, WatermarkEntry>,
}

/// Key of an entry: `"{timeframe}/{symbol}"`.
pub fn watermark_key(timeframe: Timeframe, symbol: &str) -> String {
    format!("{timeframe}/{symbol}")
}

/// Split a key back into its parts.
pub fn parse_watermark_key(key: &str) -> Option<(Timeframe, &str)> {
    let (timeframe, symbol) = key.split_once('/')?;
    Some((timeframe.parse().ok()?, symbol))
}

pub struct WatermarkStore {
    path: PathBuf,
    entries: BTreeMap<String, WatermarkEntry>,
}

impl WatermarkStore {
    /// Load watermarks for the store at `root`, or start empty if none were
    /// saved yet.
    pub fn open(root: &Path) -> Result<Self, DataError> {
        let path = root.join(STATE_DIR).join(WATERMARK_FILE);
        if !path.exists() {
            return Ok(Self::empty(root));
        }

        let content = fs::read_to_string(&path)?;
        let file: WatermarkFile = serde_json::from_str(&content).map_err(|e| {
            DataError::WatermarkError(format!("{}: {e}", path.display()))
        })?;
        if file.version != FORMAT_VERSION {
            return Err(DataError::WatermarkError(format!(
                "{}: unsupported version {} (expected {FORMAT_VERSION})",
                path.display(),
                file.version
            )));
        }

        Ok(Self {
            path,
            entries: file.entries,
        })
    }

    /// An empty tracker for `root`, ignoring whatever is on disk. Used to
    /// rebuild over an unreadable file.
    pub fn empty(root: &Path) -> Self {
        Self {
            path: root.join(STATE_DIR).join(WATERMARK_FILE),
            entries: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, timeframe: Timeframe, symbol: &str) -> Option<&WatermarkEntry> {
        self.entries.get(&watermark_key(timeframe, symbol))
    }

    pub fn last_timestamp(&self, timeframe: Timeframe, symbol: &str) -> Option<DateTime<Utc>> {
        self.get(timeframe, symbol).map(|e| e.last_timestamp)
    }

    /// First bar timestamp an incremental run should request.
    pub fn resume_from(&self, timeframe: Timeframe, symbol: &str) -> Option<DateTime<Utc>> {
        self.last_timestamp(timeframe, symbol)
            .map(|ts| ts + timeframe.duration())
    }

    /// Move the watermark to `ts` if that is later than the current one.
    /// `bars` is added to the ingested counter either way. Returns whether the
    /// watermark moved.
    pub fn advance(
        &mut self,
        timeframe: Timeframe,
        symbol: &str,
        ts: DateTime<Utc>,
        bars: u64,
    ) -> bool {
        let now = Utc::now();
        match self.entries.get_mut(&watermark_key(timeframe, symbol)) {
            Some(entry) => {
                entry.bars_ingested += bars;
                if ts <= entry.last_timestamp {
                    return false;
                }
                entry.last_timestamp = ts;
                entry.updated_at = now;
                true
            }
            None => {
                self.entries.insert(
                    watermark_key(timeframe, symbol),
                    WatermarkEntry {
                        last_timestamp: ts,
                        updated_at: now,
                        bars_ingested: bars,
                    },
                );
                true
            }
        }
    }

    /// Forget a symbol's watermark. Returns whether one existed.
    pub fn reset(&mut self, timeframe: Timeframe, symbol: &str) -> bool {
        self.entries
            .remove(&watermark_key(timeframe, symbol))
            .is_some()
    }

    pub fn entries(&self) -> &BTreeMap<String, WatermarkEntry> {
        &self.entries
    }

    /// Replace every watermark with the last timestamp actually stored.
    /// Returns the number of entries rebuilt.
    pub fn rebuild_from_store(&mut self, store: &BarStore) -> Result<usize, DataError> {
        let now = Utc::now();
        let mut rebuilt = BTreeMap::new();
        for timeframe in store.timeframes() {
            for symbol in store.symbols(timeframe) {
                let rows = store.load(timeframe, &symbol)?;
                if let Some(last) = rows.last() {
                    rebuilt.insert(
                        watermark_key(timeframe, &symbol),
                        WatermarkEntry {
                            last_timestamp: last.bar.timestamp,
                            updated_at: now,
                            bars_ingested: rows.len() as u64,
                        },
                    );
                }
            }
        }
        tracing::info!(entries = rebuilt.len(), "watermarks rebuilt from store");
        self.entries = rebuilt;
        Ok(self.entries.len())
    }

    /// Persist atomically.
    pub fn save(&self) -> Result<(), DataError> {
        let file = WatermarkFile {
            version: FORMAT_VERSION,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| DataError::WatermarkError(format!("serialization: {e}")))?;
        write_atomic(&self.path, json.as_bytes())
    }
}
