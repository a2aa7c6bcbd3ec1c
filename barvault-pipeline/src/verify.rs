//! Read-only integrity check of the whole store.
//!
//! Every (timeframe, symbol) is checked in parallel. A symbol is clean when:
//! - every partition file reads and conforms to the schema
//! - rows are strictly increasing, carry the directory's symbol and sit in
//!   the month partition their timestamp belongs to
//! - row values pass the guard's value checks
//! - `meta.json` agrees with the data (counts, bounds, hashes)
//! - the watermark is not ahead of the last stored bar

use barvault_core::data::guard::check_values;
use barvault_core::data::store::{meta_hash, PartitionMeta};
use barvault_core::data::{BarStore, PartitionKey, WatermarkStore};
use barvault_core::domain::Timeframe;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct VerifyIssue {
    /// Partition name (`YYYY-MM`), or `None` for symbol-level issues.
    pub partition: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolVerification {
    pub timeframe: Timeframe,
    pub symbol: String,
    pub partitions: usize,
    pub rows: usize,
    pub issues: Vec<VerifyIssue>,
}

impl SymbolVerification {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    fn issue(&mut self, partition: Option<PartitionKey>, message: impl Into<String>) {
        self.issues.push(VerifyIssue {
            partition: partition.map(|k| k.to_string()),
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub symbols: Vec<SymbolVerification>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.symbols.iter().all(SymbolVerification::is_clean)
    }

    pub fn issue_count(&self) -> usize {
        self.symbols.iter().map(|s| s.issues.len()).sum()
    }

    pub fn total_rows(&self) -> usize {
        self.symbols.iter().map(|s| s.rows).sum()
    }
}

/// Verify every stored series. Nothing is written or quarantined.
pub fn verify_store(store: &BarStore, marks: &WatermarkStore) -> VerifyReport {
    let targets: Vec<(Timeframe, String)> = store
        .timeframes()
        .into_iter()
        .flat_map(|tf| store.symbols(tf).into_iter().map(move |sym| (tf, sym)))
        .collect();

    let symbols: Vec<SymbolVerification> = targets
        .par_iter()
        .map(|(tf, sym)| verify_symbol(store, marks, *tf, sym))
        .collect();

    let report = VerifyReport { symbols };
    tracing::info!(
        series = report.symbols.len(),
        rows = report.total_rows(),
        issues = report.issue_count(),
        "store verified"
    );
    report
}

/// Counters for row-level problems in one partition; reported once each.
#[derive(Default)]
struct RowProblems {
    foreign_symbol: usize,
    misplaced: usize,
    unordered: usize,
    invalid: usize,
    first_invalid: Option<String>,
}

pub fn verify_symbol(
    store: &BarStore,
    marks: &WatermarkStore,
    timeframe: Timeframe,
    symbol: &str,
) -> SymbolVerification {
    let mut out = SymbolVerification {
        timeframe,
        symbol: symbol.to_string(),
        partitions: 0,
        rows: 0,
        issues: Vec::new(),
    };

    let keys = match store.partitions(timeframe, symbol) {
        Ok(keys) => keys,
        Err(e) => {
            out.issue(None, format!("cannot list partitions: {e}"));
            return out;
        }
    };
    out.partitions = keys.len();

    let mut computed: BTreeMap<String, PartitionMeta> = BTreeMap::new();
    let mut unreadable = false;
    let mut previous: Option<DateTime<Utc>> = None;

    for key in keys {
        let rows = match store.read_partition(timeframe, symbol, key) {
            Ok(rows) => rows,
            Err(e) => {
                out.issue(Some(key), format!("unreadable: {e}"));
                unreadable = true;
                continue;
            }
        };
        if rows.is_empty() {
            out.issue(Some(key), "empty partition file");
            continue;
        }

        let mut problems = RowProblems::default();
        for row in &rows {
            let bar = &row.bar;
            if bar.symbol != symbol {
                problems.foreign_symbol += 1;
            }
            if PartitionKey::of(bar.timestamp) != key {
                problems.misplaced += 1;
            }
            if previous.is_some_and(|p| bar.timestamp <= p) {
                problems.unordered += 1;
            }
            previous = Some(bar.timestamp);
            if let Err(reason) = check_values(bar, timeframe) {
                problems.invalid += 1;
                problems
                    .first_invalid
                    .get_or_insert_with(|| format!("{}: {reason}", bar.timestamp));
            }
        }

        if problems.foreign_symbol > 0 {
            out.issue(Some(key), format!("{} rows belong to another symbol", problems.foreign_symbol));
        }
        if problems.misplaced > 0 {
            out.issue(Some(key), format!("{} rows outside the partition's month", problems.misplaced));
        }
        if problems.unordered > 0 {
            out.issue(Some(key), format!("{} rows out of order or duplicated", problems.unordered));
        }
        if let Some(first) = problems.first_invalid {
            out.issue(Some(key), format!("{} rows fail value checks (first at {first})", problems.invalid));
        }

        out.rows += rows.len();
        if let Some(meta) = PartitionMeta::from_rows(&rows) {
            computed.insert(key.to_string(), meta);
        }
    }

    check_meta(store, &mut out, &computed, unreadable);
    check_watermark(marks, &mut out, &computed);
    out
}

fn check_meta(
    store: &BarStore,
    out: &mut SymbolVerification,
    computed: &BTreeMap<String, PartitionMeta>,
    unreadable: bool,
) {
    let Some(meta) = store.meta(out.timeframe, &out.symbol) else {
        if !computed.is_empty() {
            out.issue(None, "meta.json missing or unreadable");
        }
        return;
    };

    for (name, actual) in computed {
        match meta.partitions.get(name) {
            None => out.issues.push(VerifyIssue {
                partition: Some(name.clone()),
                message: "partition missing from meta.json".into(),
            }),
            Some(recorded) if recorded != actual => out.issues.push(VerifyIssue {
                partition: Some(name.clone()),
                message: format!(
                    "meta.json disagrees with data (recorded {} rows, found {}; hash {})",
                    recorded.rows,
                    actual.rows,
                    if recorded.hash == actual.hash { "matches" } else { "differs" }
                ),
            }),
            Some(_) => {}
        }
    }
    // Partitions that failed to read are already reported.
    if !unreadable {
        for name in meta.partitions.keys().filter(|n| !computed.contains_key(*n)) {
            out.issues.push(VerifyIssue {
                partition: Some(name.clone()),
                message: "listed in meta.json but not on disk".into(),
            });
        }
    }

    let count: usize = meta.partitions.values().map(|p| p.rows).sum();
    if meta.bar_count != count {
        out.issue(None, format!("meta.json bar_count {} != partition total {count}", meta.bar_count));
    }
    if meta.data_hash != meta_hash(&meta.partitions) {
        out.issue(None, "meta.json data_hash does not match its partitions");
    }
    let first = meta.partitions.values().map(|p| p.first_timestamp).min();
    let last = meta.partitions.values().map(|p| p.last_timestamp).max();
    if meta.first_timestamp != first || meta.last_timestamp != last {
        out.issue(None, "meta.json first/last timestamps do not match its partitions");
    }
}

fn check_watermark(
    marks: &WatermarkStore,
    out: &mut SymbolVerification,
    computed: &BTreeMap<String, PartitionMeta>,
) {
    let Some(watermark) = marks.last_timestamp(out.timeframe, &out.symbol) else {
        return;
    };
    let last_stored = computed.values().map(|p| p.last_timestamp).max();
    match last_stored {
        Some(last) if watermark <= last => {}
        Some(last) => out.issue(
            None,
            format!("watermark {watermark} is ahead of last stored bar {last}"),
        ),
        None => out.issue(None, format!("watermark {watermark} but no stored bars")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barvault_core::data::{ConflictPolicy, SyntheticProvider, UpsertWriter};
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn seeded(dir: &TempDir) -> (BarStore, WatermarkStore) {
        let store = BarStore::new(dir.path());
        let start = Utc.with_ymd_and_hms(2024, 2, 28, 0, 0, 0).unwrap();
        let bars = SyntheticProvider::new().generate("MSFT", Timeframe::Hour1, start, start + Duration::days(3));
        UpsertWriter::new(&store, ConflictPolicy::Replace)
            .write("MSFT", Timeframe::Hour1, "synthetic", &bars)
            .unwrap();

        let mut marks = WatermarkStore::open(dir.path()).unwrap();
        marks.advance(Timeframe::Hour1, "MSFT", bars.last().unwrap().timestamp, bars.len() as u64);
        (store, marks)
    }

    #[test]
    fn clean_store_verifies() {
        let dir = TempDir::new().unwrap();
        let (store, marks) = seeded(&dir);

        let report = verify_store(&store, &marks);
        assert!(report.is_clean(), "{:?}", report.symbols);
        assert_eq!(report.symbols.len(), 1);
        // Feb 28-29 and Mar 1: two partitions.
        assert_eq!(report.symbols[0].partitions, 2);
        assert_eq!(report.total_rows(), 18);
    }

    #[test]
    fn watermark_ahead_of_data_is_flagged() {
        let dir = TempDir::new().unwrap();
        let (store, mut marks) = seeded(&dir);
        marks.advance(Timeframe::Hour1, "MSFT", Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(), 0);

        let report = verify_store(&store, &marks);
        assert_eq!(report.issue_count(), 1);
        assert!(report.symbols[0].issues[0].message.contains("ahead"));
    }

    #[test]
    fn stale_meta_is_flagged() {
        let dir = TempDir::new().unwrap();
        let (store, marks) = seeded(&dir);
        let mut meta = store.meta(Timeframe::Hour1, "MSFT").unwrap();
        meta.bar_count += 1;
        store.write_meta(&meta).unwrap();

        let report = verify_store(&store, &marks);
        assert!(!report.is_clean());
        assert!(report.symbols[0].issues.iter().any(|i| i.message.contains("bar_count")));
    }

    #[test]
    fn corrupt_partition_is_reported_and_left_in_place() {
        let dir = TempDir::new().unwrap();
        let (store, marks) = seeded(&dir);
        let key = PartitionKey { year: 2024, month: 3 };
        let path = store.partition_path(Timeframe::Hour1, "MSFT", key);
        std::fs::write(&path, b"not parquet").unwrap();

        let report = verify_store(&store, &marks);
        let issues = &report.symbols[0].issues;
        assert!(issues.iter().any(|i| i.partition.as_deref() == Some("2024-03") && i.message.contains("unreadable")));
        assert!(path.exists());
    }
}
