//! Pipeline configuration.
//!
//! Read from a TOML file (default `barvault.toml`, optional) with four
//! tables:
//!
//! ```toml
//! [store]
//! root = "data/bars"
//! on_conflict = "replace"
//!
//! [alpaca]
//! feed = "iex"
//! requests_per_minute = 200
//!
//! [ingest]
//! symbols = ["AAPL", "MSFT"]
//! timeframe = "1Min"
//! initial_lookback_days = 30
//! window_days = 7
//! use_calendar = true
//!
//! [screen]
//! min_price = 5.0
//! min_volume = 500000
//! ```
//!
//! Every key has a default. `.env` is loaded before the environment is read;
//! `ALPACA_BASE_URL` and `ALPACA_DATA_URL` override the API endpoints.

use barvault_core::data::{AlpacaSettings, ConflictPolicy};
use barvault_core::domain::Timeframe;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "barvault.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub on_conflict: ConflictPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/bars"),
            on_conflict: ConflictPolicy::Replace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Symbols ingested when none are given on the command line.
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    /// How far back an incremental run starts for a symbol with no watermark.
    pub initial_lookback_days: i64,
    /// Length of one fetch window.
    pub window_days: i64,
    /// Skip windows with no trading session (needs the trading API).
    pub use_calendar: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            timeframe: Timeframe::Minute1,
            initial_lookback_days: 30,
            window_days: 7,
            use_calendar: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    /// Minimum average close over the sampled bars.
    pub min_price: f64,
    /// Minimum average volume over the sampled bars.
    pub min_volume: f64,
    pub lookback_hours: i64,
    /// Number of most recent bars averaged.
    pub sample_bars: usize,
    /// Cap on assets screened (useful against the full exchange list).
    pub max_symbols: Option<usize>,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            min_price: 5.0,
            min_volume: 500_000.0,
            lookback_hours: 24,
            sample_bars: 5,
            max_symbols: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub alpaca: AlpacaSettings,
    pub ingest: IngestConfig,
    pub screen: ScreenConfig,
}

impl PipelineConfig {
    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the effective config: `.env`, then the file (explicit path,
    /// or `barvault.toml` if present, else defaults), then environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Ok(env_file) = dotenvy::dotenv() {
            tracing::debug!(path = %env_file.display(), "loaded .env");
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty("ALPACA_BASE_URL") {
            self.alpaca.trading_url = url;
        }
        if let Some(url) = non_empty("ALPACA_DATA_URL") {
            self.alpaca.data_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.ingest.window_days <= 0 {
            return invalid(format!("ingest.window_days must be > 0 (got {})", self.ingest.window_days));
        }
        if self.ingest.initial_lookback_days <= 0 {
            return invalid(format!(
                "ingest.initial_lookback_days must be > 0 (got {})",
                self.ingest.initial_lookback_days
            ));
        }
        if !(1..=10_000).contains(&self.alpaca.page_limit) {
            return invalid(format!(
                "alpaca.page_limit must be in 1..=10000 (got {})",
                self.alpaca.page_limit
            ));
        }
        if self.alpaca.requests_per_minute == 0 {
            return invalid("alpaca.requests_per_minute must be > 0".into());
        }
        if self.alpaca.max_pages == 0 {
            return invalid("alpaca.max_pages must be > 0".into());
        }
        if self.screen.sample_bars == 0 {
            return invalid("screen.sample_bars must be > 0".into());
        }
        if self.screen.lookback_hours <= 0 {
            return invalid(format!(
                "screen.lookback_hours must be > 0 (got {})",
                self.screen.lookback_hours
            ));
        }
        if !(self.screen.min_price >= 0.0 && self.screen.min_volume >= 0.0) {
            return invalid("screen thresholds must be non-negative".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_config_uses_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.store.root, PathBuf::from("data/bars"));
        assert_eq!(config.ingest.window_days, 7);
        assert_eq!(config.ingest.initial_lookback_days, 30);
        assert_eq!(config.screen.min_price, 5.0);
        assert_eq!(config.screen.min_volume, 500_000.0);
        assert_eq!(config.screen.sample_bars, 5);
        assert_eq!(config.alpaca.feed, "iex");
        assert_eq!(config.alpaca.page_limit, 10_000);
    }

    #[test]
    fn partial_tables_merge_with_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [store]
            root = "/srv/bars"
            on_conflict = "keep"

            [alpaca]
            feed = "sip"

            [ingest]
            symbols = ["AAPL", "BRK.B"]
            timeframe = "5Min"
            use_calendar = false

            [screen]
            max_symbols = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.store.root, PathBuf::from("/srv/bars"));
        assert_eq!(config.store.on_conflict, ConflictPolicy::Keep);
        assert_eq!(config.alpaca.feed, "sip");
        assert_eq!(config.alpaca.requests_per_minute, 200);
        assert_eq!(config.ingest.symbols, vec!["AAPL", "BRK.B"]);
        assert_eq!(config.ingest.timeframe, Timeframe::Minute5);
        assert!(!config.ingest.use_calendar);
        assert_eq!(config.ingest.window_days, 7);
        assert_eq!(config.screen.max_symbols, Some(50));
    }

    #[test]
    fn rejects_bad_values() {
        for toml in [
            "[ingest]\nwindow_days = 0",
            "[ingest]\ninitial_lookback_days = -1",
            "[alpaca]\npage_limit = 20000",
            "[alpaca]\nrequests_per_minute = 0",
            "[screen]\nsample_bars = 0",
            "[screen]\nmin_price = -1.0",
        ] {
            let err = PipelineConfig::from_toml(toml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{toml}: {err}");
        }
    }

    #[test]
    fn rejects_unknown_timeframe_and_policy() {
        assert!(matches!(
            PipelineConfig::from_toml("[ingest]\ntimeframe = \"2Min\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            PipelineConfig::from_toml("[store]\non_conflict = \"merge\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_endpoints() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ALPACA_BASE_URL", "https://api.alpaca.markets"),
            ("ALPACA_DATA_URL", "  "),
        ]);
        let mut config = PipelineConfig::default();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.alpaca.trading_url, "https://api.alpaca.markets");
        // Blank values are ignored.
        assert_eq!(config.alpaca.data_url, AlpacaSettings::default().data_url);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = PipelineConfig::from_file(Path::new("/nonexistent/barvault.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
