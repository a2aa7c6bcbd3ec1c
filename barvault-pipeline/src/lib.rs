//! barvault pipeline: configuration and the runs built on the core store.
//!
//! - `config`: TOML + `.env` configuration
//! - `run`: ingest, backfill, CSV import and watermark maintenance under the
//!   store lock
//! - `loader` / `export`: read stored bars back out
//! - `verify`: parallel, read-only integrity check
//! - `screen`: price/volume liquidity screen over the tradable universe

pub mod config;
pub mod export;
pub mod loader;
pub mod run;
pub mod screen;
pub mod verify;

pub use config::{
    ConfigError, IngestConfig, PipelineConfig, ScreenConfig, StoreConfig, DEFAULT_CONFIG_FILE,
};
pub use export::{export_csv, export_csv_string, write_csv};
pub use loader::{compute_dataset_hash, load_bars, LoadedBars};
pub use run::{
    build_alpaca, import_csv, incremental_mode, ingest_options, open_store, rebuild_watermarks,
    reset_watermark, run_ingest, PipelineError,
};
pub use screen::{screen_universe, ScreenResult, ScreenSummary};
pub use verify::{verify_store, verify_symbol, SymbolVerification, VerifyIssue, VerifyReport};
