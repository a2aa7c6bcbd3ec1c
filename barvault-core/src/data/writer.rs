//! Dedup/upsert writer: merges incoming bars into month partitions keyed by
//! timestamp, so repeated or overlapping ingests never duplicate a bar.

use super::provider::DataError;
use super::store::{BarStore, PartitionKey, PartitionMeta, StoredRow};
use crate::domain::{MinuteBar, Timeframe};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// What to do when an incoming bar has the same key as a stored bar but
/// different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Incoming value wins; provenance is updated.
    #[default]
    Replace,
    /// Stored value wins.
    Keep,
}

/// Outcome of one upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub partitions_written: usize,
}

impl WriteReport {
    pub fn absorb(&mut self, other: &WriteReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.partitions_written += other.partitions_written;
    }

    /// Rows that changed the store.
    pub fn changed(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Merge `incoming` into `existing` by timestamp. Both inputs must belong to
/// one symbol; the result is sorted and unique.
pub fn merge_rows(
    existing: Vec<StoredRow>,
    incoming: Vec<StoredRow>,
    policy: ConflictPolicy,
) -> (Vec<StoredRow>, WriteReport) {
    let mut merged: BTreeMap<DateTime<Utc>, StoredRow> = existing
        .into_iter()
        .map(|row| (row.bar.timestamp, row))
        .collect();
    let mut report = WriteReport::default();

    for row in incoming {
        match merged.entry(row.bar.timestamp) {
            Entry::Vacant(slot) => {
                slot.insert(row);
                report.inserted += 1;
            }
            Entry::Occupied(mut slot) => {
                if slot.get().bar.same_values(&row.bar) {
                    report.unchanged += 1;
                    continue;
                }
                match policy {
                    ConflictPolicy::Replace => {
                        slot.insert(row);
                        report.updated += 1;
                    }
                    ConflictPolicy::Keep => report.unchanged += 1,
                }
            }
        }
    }

    (merged.into_values().collect(), report)
}

pub struct UpsertWriter<'a> {
    store: &'a BarStore,
    policy: ConflictPolicy,
}

impl<'a> UpsertWriter<'a> {
    pub fn new(store: &'a BarStore, policy: ConflictPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Upsert validated bars for one symbol, stamping provenance.
    pub fn write(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        source: &str,
        bars: &[MinuteBar],
    ) -> Result<WriteReport, DataError> {
        let fetched_at = Utc::now();
        let rows = bars
            .iter()
            .map(|bar| StoredRow {
                bar: bar.clone(),
                source: source.to_string(),
                fetched_at: Some(fetched_at),
            })
            .collect();
        self.write_rows(symbol, timeframe, rows)
    }

    /// Upsert rows that already carry provenance.
    ///
    /// Rows are grouped by month; each touched partition is read, merged and
    /// rewritten only if something was inserted or updated. Within `rows`,
    /// the last occurrence of a timestamp wins. Timestamps are kept at
    /// millisecond precision.
    ///
    /// If a partition fails, `meta.json` is still brought up to date with
    /// the partitions already rewritten before the error is returned.
    pub fn write_rows(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        rows: Vec<StoredRow>,
    ) -> Result<WriteReport, DataError> {
        let mut by_partition: BTreeMap<PartitionKey, BTreeMap<DateTime<Utc>, StoredRow>> =
            BTreeMap::new();
        for mut row in rows {
            if row.bar.symbol != symbol {
                return Err(DataError::StoreError(format!(
                    "bar for {} passed to writer for {symbol}",
                    row.bar.symbol
                )));
            }
            row.bar.timestamp = row.bar.timestamp.trunc_subsecs(3);
            by_partition
                .entry(PartitionKey::of(row.bar.timestamp))
                .or_default()
                .insert(row.bar.timestamp, row);
        }

        let mut report = WriteReport::default();
        let mut changes = BTreeMap::new();

        for (key, incoming) in by_partition {
            match self.upsert_partition(timeframe, symbol, key, incoming.into_values().collect()) {
                Ok((partial, written)) => {
                    if let Some(meta) = written {
                        changes.insert(key, meta);
                        report.partitions_written += 1;
                    }
                    report.absorb(&partial);
                }
                Err(e) => {
                    if !changes.is_empty() {
                        if let Err(meta_err) = self.store.update_meta(timeframe, symbol, changes) {
                            tracing::error!(
                                symbol,
                                timeframe = %timeframe,
                                error = %meta_err,
                                "failed to record partitions written before error"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        if !changes.is_empty() {
            self.store.update_meta(timeframe, symbol, changes)?;
        }

        tracing::debug!(
            symbol,
            timeframe = %timeframe,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            partitions = report.partitions_written,
            "upsert complete"
        );
        Ok(report)
    }

    /// Merge into one partition. The second value is `Some` when the
    /// partition was rewritten, carrying its new summary.
    fn upsert_partition(
        &self,
        timeframe: Timeframe,
        symbol: &str,
        key: PartitionKey,
        incoming: Vec<StoredRow>,
    ) -> Result<(WriteReport, Option<Option<PartitionMeta>>), DataError> {
        let existing = self.store.read_partition(timeframe, symbol, key)?;
        let (merged, partial) = merge_rows(existing, incoming, self.policy);
        if partial.changed() == 0 {
            return Ok((partial, None));
        }
        let meta = self.store.write_partition(timeframe, symbol, key, &merged)?;
        Ok((partial, Some(meta)))
    }
}
