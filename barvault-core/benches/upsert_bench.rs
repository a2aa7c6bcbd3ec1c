//! Criterion benchmarks for the ingest hot paths.
//!
//! Benchmarks:
//! 1. In-memory upsert merge (fresh insert, full overlap, half overlap)
//! 2. Schema guard over a session of bars
//! 3. Partition frame encode/decode

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use barvault_core::data::writer::merge_rows;
use barvault_core::data::{BarRequest, BarSchema, ConflictPolicy, SchemaGuard, StoredRow, SyntheticProvider};
use barvault_core::domain::Timeframe;
use chrono::{DateTime, Duration, TimeZone, Utc};

// ── Helpers ──────────────────────────────────────────────────────────

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
}

/// `days` sessions of synthetic minute bars as stored rows.
fn make_rows(days: i64, offset_days: i64) -> Vec<StoredRow> {
    let from = start() + Duration::days(offset_days);
    SyntheticProvider::new()
        .generate("SPY", Timeframe::Minute1, from, from + Duration::days(days))
        .into_iter()
        .map(|bar| StoredRow {
            bar,
            source: "synthetic".into(),
            fetched_at: None,
        })
        .collect()
}

// ── 1. Upsert merge ──────────────────────────────────────────────────

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_rows");
    let existing = make_rows(5, 0);

    for (name, incoming) in [
        ("fresh", make_rows(5, 7)),
        ("full_overlap", make_rows(5, 0)),
        ("half_overlap", make_rows(5, 2)),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &incoming, |b, incoming| {
            b.iter(|| {
                merge_rows(
                    black_box(existing.clone()),
                    black_box(incoming.clone()),
                    ConflictPolicy::Replace,
                )
            })
        });
    }
    group.finish();
}

// ── 2. Schema guard ──────────────────────────────────────────────────

fn bench_guard(c: &mut Criterion) {
    let bars: Vec<_> = make_rows(5, 0).into_iter().map(|r| r.bar).collect();
    let request = BarRequest::single("SPY", Timeframe::Minute1, start(), start() + Duration::days(7));
    let guard = SchemaGuard::default();
    let now = start() + Duration::days(30);

    c.bench_function("guard_one_week", |b| {
        b.iter(|| guard.check_at(black_box(&request), black_box(bars.clone()), now))
    });
}

// ── 3. Frame conversion ──────────────────────────────────────────────

fn bench_frame(c: &mut Criterion) {
    let rows = make_rows(20, 0);
    let frame = BarSchema::to_frame(&rows, Timeframe::Minute1).unwrap();

    c.bench_function("to_frame_month", |b| {
        b.iter(|| BarSchema::to_frame(black_box(&rows), Timeframe::Minute1).unwrap())
    });
    c.bench_function("from_frame_month", |b| {
        b.iter(|| BarSchema::from_frame(black_box(&frame)).unwrap())
    });
}

criterion_group!(benches, bench_merge, bench_guard, bench_frame);
criterion_main!(benches);
