//! barvault CLI: ingest, inspect and maintain the minute-bar store.
//!
//! Commands:
//! - `ingest` / `backfill`: fetch bars from Alpaca (or `--synthetic`) into the store
//! - `import`: load a CSV export into the store
//! - `status`: stored range and watermark per symbol
//! - `watermark show|reset|rebuild`: inspect or repair watermarks
//! - `verify`: read-only integrity check of every partition
//! - `export`: write stored bars as CSV
//! - `clock` / `screen`: market clock and liquidity screen

use anyhow::{bail, Context, Result};
use barvault_core::data::{
    AlpacaClient, BarProvider, DataError, IngestMode, IngestProgress, IngestSummary, MarketInfo,
    SymbolReport, SyntheticProvider, WatermarkStore, WindowReport,
};
use barvault_core::domain::Timeframe;
use barvault_pipeline::{
    build_alpaca, export_csv, import_csv, incremental_mode, load_bars, open_store,
    rebuild_watermarks, reset_watermark, run_ingest, screen_universe, verify_store,
    PipelineConfig,
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "barvault", version, about = "barvault: minute-bar ingestion and storage")]
struct Cli {
    /// Config file. Defaults to ./barvault.toml when present.
    #[arg(long, global = true, env = "BARVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory (overrides store.root).
    #[arg(long, global = true, env = "BARVAULT_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Log output format (logs go to stderr).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// More logging (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new bars since each symbol's watermark.
    Ingest {
        /// Symbols (default: ingest.symbols from config).
        symbols: Vec<String>,

        /// Bar timeframe: 1Min, 5Min, 15Min, 30Min, 1Hour, 1Day.
        #[arg(long)]
        timeframe: Option<Timeframe>,

        /// Exclusive end (YYYY-MM-DD or RFC 3339). Defaults to now.
        #[arg(long)]
        end: Option<String>,

        /// Use generated bars instead of Alpaca.
        #[arg(long, default_value_t = false)]
        synthetic: bool,
    },
    /// Fetch an explicit range. Re-fetching stored bars is safe.
    Backfill {
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Inclusive start (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        start: String,

        /// Exclusive end (YYYY-MM-DD or RFC 3339). Defaults to now when omitted.
        #[arg(long)]
        end: Option<String>,

        #[arg(long)]
        timeframe: Option<Timeframe>,

        /// Days per fetch window (overrides ingest.window_days).
        #[arg(long)]
        window_days: Option<i64>,

        #[arg(long, default_value_t = false)]
        synthetic: bool,
    },
    /// Import bars from a CSV file (the format `export` writes).
    Import {
        #[arg(long = "csv")]
        path: PathBuf,

        /// Timeframe the rows are stored under (default: ingest.timeframe).
        #[arg(long)]
        timeframe: Option<Timeframe>,
    },
    /// Stored range, bar count and watermark per symbol.
    Status {
        /// Symbols (default: every stored symbol).
        symbols: Vec<String>,

        #[arg(long)]
        timeframe: Option<Timeframe>,
    },
    /// Watermark maintenance.
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },
    /// Check every stored partition against its metadata and the watermarks.
    Verify {
        /// Print the full report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Export stored bars as CSV.
    Export {
        #[arg(required = true)]
        symbols: Vec<String>,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: Option<String>,

        #[arg(long)]
        timeframe: Option<Timeframe>,

        /// Output file.
        #[arg(long, short)]
        out: PathBuf,
    },
    /// Show the market clock.
    Clock {
        #[arg(long, default_value_t = false)]
        synthetic: bool,
    },
    /// Screen tradable assets by recent price and volume.
    Screen {
        #[arg(long)]
        timeframe: Option<Timeframe>,

        /// Screen at most this many assets.
        #[arg(long)]
        max_symbols: Option<usize>,

        #[arg(long, default_value_t = false)]
        synthetic: bool,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum WatermarkAction {
    /// List every watermark.
    Show,
    /// Forget one symbol's watermark so the next ingest starts from the lookback.
    Reset {
        symbol: String,

        #[arg(long)]
        timeframe: Option<Timeframe>,
    },
    /// Recompute all watermarks from stored data.
    Rebuild,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.verbose);

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.store_dir {
        config.store.root = dir;
    }

    match cli.command {
        Commands::Ingest {
            symbols,
            timeframe,
            end,
            synthetic,
        } => {
            apply_timeframe(&mut config, timeframe);
            let symbols = if symbols.is_empty() {
                config.ingest.symbols.clone()
            } else {
                symbols
            };
            let end = parse_time_or_now(end.as_deref())?;
            let mode = incremental_mode(&config);
            let source = Source::open(&config, synthetic)?;
            let summary = run_ingest(
                &config,
                source.provider(),
                Some(source.market()),
                &normalize(symbols),
                mode,
                end,
                &StdoutProgress,
            )?;
            exit_on_failure(&summary);
        }
        Commands::Backfill {
            symbols,
            start,
            end,
            timeframe,
            window_days,
            synthetic,
        } => {
            apply_timeframe(&mut config, timeframe);
            if let Some(days) = window_days {
                config.ingest.window_days = days;
                config.validate()?;
            }
            let start = parse_time(&start)?;
            let end = parse_time_or_now(end.as_deref())?;
            if start >= end {
                bail!("--start must be before --end");
            }
            let source = Source::open(&config, synthetic)?;
            let summary = run_ingest(
                &config,
                source.provider(),
                Some(source.market()),
                &normalize(symbols),
                IngestMode::Backfill { start },
                end,
                &StdoutProgress,
            )?;
            exit_on_failure(&summary);
        }
        Commands::Import { path, timeframe } => {
            apply_timeframe(&mut config, timeframe);
            let summary = import_csv(&config, &path, &StdoutProgress)?;
            exit_on_failure(&summary);
        }
        Commands::Status { symbols, timeframe } => {
            apply_timeframe(&mut config, timeframe);
            run_status(&config, normalize(symbols))?;
        }
        Commands::Watermark { action } => match action {
            WatermarkAction::Show => run_watermark_show(&config)?,
            WatermarkAction::Reset { symbol, timeframe } => {
                apply_timeframe(&mut config, timeframe);
                let symbol = symbol.trim().to_uppercase();
                if reset_watermark(&config, config.ingest.timeframe, &symbol)? {
                    println!("Reset watermark for {symbol} ({})", config.ingest.timeframe);
                } else {
                    println!("No watermark for {symbol} ({})", config.ingest.timeframe);
                }
            }
            WatermarkAction::Rebuild => {
                let count = rebuild_watermarks(&config)?;
                println!("Rebuilt {count} watermark(s) from stored data.");
            }
        },
        Commands::Verify { json } => run_verify(&config, json)?,
        Commands::Export {
            symbols,
            start,
            end,
            timeframe,
            out,
        } => {
            apply_timeframe(&mut config, timeframe);
            let start = parse_time(&start)?;
            let end = parse_time_or_now(end.as_deref())?;
            let store = open_store(&config);
            let loaded = load_bars(&store, config.ingest.timeframe, &normalize(symbols), start, end)?;
            let rows = export_csv(&out, &loaded.flatten())?;
            println!("Exported {rows} bars to {}", out.display());
            println!("Dataset hash: {}", loaded.dataset_hash);
        }
        Commands::Clock { synthetic } => {
            let source = Source::open(&config, synthetic)?;
            let clock = source.market().clock()?;
            println!("Now:        {}", fmt_ts(clock.timestamp));
            println!("Open:       {}", if clock.is_open { "yes" } else { "no" });
            println!("Next open:  {}", fmt_ts(clock.next_open));
            println!("Next close: {}", fmt_ts(clock.next_close));
        }
        Commands::Screen {
            timeframe,
            max_symbols,
            synthetic,
            json,
        } => {
            apply_timeframe(&mut config, timeframe);
            if max_symbols.is_some() {
                config.screen.max_symbols = max_symbols;
            }
            run_screen(&config, synthetic, json)?;
        }
    }

    Ok(())
}

fn init_logging(format: LogFormat, verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Alpaca unless `--synthetic`.
enum Source {
    Alpaca(Box<AlpacaClient>),
    Synthetic(SyntheticProvider),
}

impl Source {
    fn open(config: &PipelineConfig, synthetic: bool) -> Result<Self> {
        if synthetic {
            return Ok(Source::Synthetic(SyntheticProvider::new()));
        }
        let client = build_alpaca(config)
            .context("Alpaca credentials required (set ALPACA_API_KEY and ALPACA_API_SECRET, or pass --synthetic)")?;
        Ok(Source::Alpaca(Box::new(client)))
    }

    fn provider(&self) -> &dyn BarProvider {
        match self {
            Source::Alpaca(client) => client.as_ref(),
            Source::Synthetic(synthetic) => synthetic,
        }
    }

    fn market(&self) -> &dyn MarketInfo {
        match self {
            Source::Alpaca(client) => client.as_ref(),
            Source::Synthetic(synthetic) => synthetic,
        }
    }
}

/// Prints per-symbol progress to stdout alongside the structured log.
struct StdoutProgress;

impl IngestProgress for StdoutProgress {
    fn on_symbol_start(&self, symbol: &str, index: usize, total: usize) {
        println!("[{}/{}] {symbol}...", index + 1, total);
    }

    fn on_window(&self, _symbol: &str, window: &WindowReport) {
        tracing::debug!(
            start = %window.start,
            skipped = window.skipped,
            inserted = window.write.inserted,
            "window"
        );
    }

    fn on_symbol_complete(&self, report: &SymbolReport, error: Option<&DataError>) {
        let watermark = report.watermark.map(fmt_ts).unwrap_or_else(|| "-".into());
        match error {
            None => println!(
                "  OK: {} +{} new, {} updated, {} rejected (watermark {watermark})",
                report.symbol, report.write.inserted, report.write.updated, report.rejected
            ),
            Some(e) => println!("  FAIL: {}: {e} (watermark {watermark})", report.symbol),
        }
    }

    fn on_batch_complete(&self, summary: &IngestSummary) {
        let totals = summary.totals();
        println!(
            "\nIngest complete: {}/{} succeeded, {} failed, {} bars inserted, {} updated",
            summary.succeeded, summary.total, summary.failed, totals.inserted, totals.updated
        );
    }
}

fn exit_on_failure(summary: &IngestSummary) {
    if !summary.all_succeeded() {
        for (sym, err) in &summary.errors {
            eprintln!("Error for {sym}: {err}");
        }
        std::process::exit(1);
    }
}

fn run_status(config: &PipelineConfig, symbols: Vec<String>) -> Result<()> {
    let timeframe = config.ingest.timeframe;
    let store = open_store(config);
    let symbols = if symbols.is_empty() {
        store.symbols(timeframe)
    } else {
        symbols
    };
    if symbols.is_empty() {
        println!("No {timeframe} data in {}", store.root().display());
        return Ok(());
    }

    let marks = WatermarkStore::open(store.root())?;
    let refs: Vec<&str> = symbols.iter().map(String::as_str).collect();

    println!("Store: {} ({timeframe})", store.root().display());
    println!();
    println!(
        "{:<8} {:<22} {:<22} {:>10} {:>6}  {:<22}",
        "Symbol", "First", "Last", "Bars", "Parts", "Watermark"
    );
    println!("{}", "-".repeat(96));
    for status in store.status(timeframe, &refs) {
        let watermark = marks
            .last_timestamp(timeframe, &status.symbol)
            .map(fmt_ts)
            .unwrap_or_else(|| "-".into());
        if !status.stored {
            println!("{:<8} {:<22} {:<22} {:>10} {:>6}  {:<22}", status.symbol, "(none)", "", "", "", watermark);
            continue;
        }
        println!(
            "{:<8} {:<22} {:<22} {:>10} {:>6}  {:<22}",
            status.symbol,
            status.first_timestamp.map(fmt_ts).unwrap_or_default(),
            status.last_timestamp.map(fmt_ts).unwrap_or_default(),
            status.bar_count.unwrap_or(0),
            status.partitions,
            watermark
        );
    }
    Ok(())
}

fn run_watermark_show(config: &PipelineConfig) -> Result<()> {
    let marks = WatermarkStore::open(&config.store.root)?;
    if marks.entries().is_empty() {
        println!("No watermarks in {}", marks.path().display());
        return Ok(());
    }

    println!("{:<20} {:<22} {:<22} {:>12}", "Series", "Last bar", "Updated", "Ingested");
    println!("{}", "-".repeat(80));
    for (key, entry) in marks.entries() {
        println!(
            "{:<20} {:<22} {:<22} {:>12}",
            key,
            fmt_ts(entry.last_timestamp),
            fmt_ts(entry.updated_at),
            entry.bars_ingested
        );
    }
    Ok(())
}

fn run_verify(config: &PipelineConfig, json: bool) -> Result<()> {
    let store = open_store(config);
    let marks = WatermarkStore::open(store.root())?;
    let report = verify_store(&store, &marks);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.is_clean() {
            std::process::exit(1);
        }
        return Ok(());
    }

    if report.symbols.is_empty() {
        println!("Store is empty: {}", store.root().display());
        return Ok(());
    }

    for series in &report.symbols {
        let state = if series.is_clean() { "OK" } else { "FAIL" };
        println!(
            "{state:<5} {:<6} {:<8} {:>4} partitions {:>10} rows",
            series.timeframe, series.symbol, series.partitions, series.rows
        );
        for issue in &series.issues {
            match &issue.partition {
                Some(partition) => println!("        [{partition}] {}", issue.message),
                None => println!("        {}", issue.message),
            }
        }
    }
    println!();
    println!(
        "Verified {} series, {} rows, {} issue(s).",
        report.symbols.len(),
        report.total_rows(),
        report.issue_count()
    );

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_screen(config: &PipelineConfig, synthetic: bool, json: bool) -> Result<()> {
    let source = Source::open(config, synthetic)?;
    let summary = screen_universe(
        source.market(),
        source.provider(),
        &config.screen,
        config.ingest.timeframe,
        Utc::now(),
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "Screened {} candidates (min price {:.2}, min volume {:.0}, last {} bars)",
        summary.candidates, config.screen.min_price, config.screen.min_volume, config.screen.sample_bars
    );
    println!();
    println!("{:<8} {:>12} {:>14}", "Symbol", "Avg close", "Avg volume");
    println!("{}", "-".repeat(36));
    for result in summary.passed() {
        println!("{:<8} {:>12.2} {:>14.0}", result.symbol, result.avg_close, result.avg_volume);
    }
    println!();
    println!(
        "{} passed, {} below threshold, {} skipped",
        summary.passed().count(),
        summary.results.len() - summary.passed().count(),
        summary.skipped.len()
    );
    Ok(())
}

fn apply_timeframe(config: &mut PipelineConfig, timeframe: Option<Timeframe>) {
    if let Some(tf) = timeframe {
        config.ingest.timeframe = tf;
    }
}

/// Upper-case, drop blanks and repeats, keep first-seen order.
fn normalize(symbols: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

/// `YYYY-MM-DD` (midnight UTC) or RFC 3339.
fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    let ts = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid time '{s}' (expected YYYY-MM-DD or RFC 3339)"))?;
    Ok(ts.with_timezone(&Utc))
}

fn parse_time_or_now(s: Option<&str>) -> Result<DateTime<Utc>> {
    s.map(parse_time).transpose().map(|t| t.unwrap_or_else(Utc::now))
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
