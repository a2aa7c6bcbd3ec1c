//! Data ingestion and storage

pub mod alpaca;
pub mod circuit_breaker;
pub mod csv_import;
pub mod guard;
pub mod ingest;
pub mod lock;
pub mod provider;
pub mod rate_limit;
pub mod schema;
pub mod store;
pub mod synthetic;
pub mod watermark;
pub mod writer;

pub use alpaca::{AlpacaClient, AlpacaSettings, Credentials};
pub use circuit_breaker::CircuitBreaker;
pub use csv_import::CsvProvider;
pub use guard::{GuardReport, RejectReason, SchemaGuard};
pub use ingest::{
    IngestMode, IngestOptions, IngestProgress, IngestSummary, Ingestor, LogProgress, SymbolReport,
    WindowReport,
};
pub use lock::StoreLock;
pub use provider::{BarProvider, BarRequest, DataError, DataSource, FetchResult, MarketInfo};
pub use rate_limit::RateLimiter;
pub use schema::{BarSchema, SchemaError, SCHEMA_VERSION};
pub use store::{BarStore, PartitionKey, StoreMeta, StoredRow, SymbolStatus};
pub use synthetic::SyntheticProvider;
pub use watermark::{WatermarkEntry, WatermarkStore};
pub use writer::{ConflictPolicy, UpsertWriter, WriteReport};
