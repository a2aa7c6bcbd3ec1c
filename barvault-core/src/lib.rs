//! barvault core: minute-bar domain, fetch client, schema guard, Parquet
//! store, upsert writer and watermark tracker.
//!
//! Data flows one way:
//! - a `BarProvider` (Alpaca, CSV, synthetic) fetches a window of bars
//! - the `SchemaGuard` rejects malformed rows
//! - the `UpsertWriter` merges the rest into month partitions
//! - the `WatermarkStore` records how far each symbol has been committed
//!
//! The `Ingestor` runs that loop per symbol and per window.

pub mod data;
pub mod domain;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: types shared across threads are Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        // Domain types
        require_send::<domain::MinuteBar>();
        require_sync::<domain::MinuteBar>();
        require_send::<domain::Timeframe>();
        require_sync::<domain::Timeframe>();
        require_send::<domain::TradingDay>();
        require_sync::<domain::TradingDay>();

        // Shared fetch plumbing
        require_send::<data::CircuitBreaker>();
        require_sync::<data::CircuitBreaker>();
        require_send::<data::RateLimiter>();
        require_sync::<data::RateLimiter>();
        require_send::<data::AlpacaClient>();
        require_sync::<data::AlpacaClient>();

        // Store types (verification fans out over these)
        require_send::<data::BarStore>();
        require_sync::<data::BarStore>();
        require_send::<data::StoreMeta>();
        require_sync::<data::StoreMeta>();
        require_send::<data::StoredRow>();
        require_sync::<data::StoredRow>();
        require_send::<data::DataError>();
    }

    /// Providers are usable as trait objects.
    #[test]
    fn providers_are_object_safe() {
        fn _as_provider(p: &dyn data::BarProvider) -> &str {
            p.name()
        }
        fn _as_market(m: &dyn data::MarketInfo) -> Result<domain::MarketClock, data::DataError> {
            m.clock()
        }
        let synthetic = data::SyntheticProvider::new();
        assert_eq!(_as_provider(&synthetic), "synthetic");
    }
}
