//! Alpaca market-data provider.
//!
//! Fetches stock bars from the v2 multi-symbol bars endpoint, following
//! `next_page_token` until the window is exhausted. Every request goes through
//! the shared rate limiter and circuit breaker and is retried with exponential
//! backoff on 429, 5xx, and transport failures. The same client answers the
//! trading API's clock, assets, and calendar endpoints.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{BarProvider, BarRequest, DataError, DataSource, FetchResult, MarketInfo};
use super::rate_limit::RateLimiter;
use crate::domain::{Asset, MarketClock, MinuteBar, TradingDay};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_DATA_URL: &str = "https://data.alpaca.markets";
pub const DEFAULT_TRADING_URL: &str = "https://paper-api.alpaca.markets";

const KEY_HEADER: &str = "APCA-API-KEY-ID";
const SECRET_HEADER: &str = "APCA-API-SECRET-KEY";

/// Tunables for the Alpaca client. Deserializes from the `[alpaca]` config table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlpacaSettings {
    pub data_url: String,
    pub trading_url: String,
    /// `iex` (free plan) or `sip`.
    pub feed: String,
    /// Bars per page (API maximum is 10000).
    pub page_limit: u32,
    pub max_pages: usize,
    pub requests_per_minute: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_backoff_secs: u64,
    pub timeout_secs: u64,
}

impl Default for AlpacaSettings {
    fn default() -> Self {
        Self {
            data_url: DEFAULT_DATA_URL.to_string(),
            trading_url: DEFAULT_TRADING_URL.to_string(),
            feed: "iex".to_string(),
            page_limit: 10_000,
            max_pages: 1_000,
            requests_per_minute: 200,
            max_retries: 3,
            base_delay_ms: 500,
            max_backoff_secs: 60,
            timeout_secs: 30,
        }
    }
}

/// API key pair. The secret never appears in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Read `ALPACA_API_KEY` / `ALPACA_API_SECRET` from the environment.
    pub fn from_env() -> Result<Self, DataError> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| DataError::AuthenticationRequired(format!("{name} is not set")))
        };
        Ok(Self::new(read("ALPACA_API_KEY")?, read("ALPACA_API_SECRET")?))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BarsPage {
    #[serde(default)]
    bars: Option<BTreeMap<String, Vec<ApiBar>>>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiBar {
    t: DateTime<Utc>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    #[serde(default)]
    n: Option<u64>,
    #[serde(default)]
    vw: Option<f64>,
}

impl ApiBar {
    fn into_bar(self, symbol: &str) -> MinuteBar {
        MinuteBar {
            symbol: symbol.to_string(),
            timestamp: self.t,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v.max(0.0).round() as u64,
            trade_count: self.n,
            vwap: self.vw,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiCalendarDay {
    date: NaiveDate,
    open: String,
    close: String,
}

fn parse_session_time(raw: &str) -> Result<NaiveTime, DataError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|e| DataError::ResponseFormatChanged(format!("calendar time '{raw}': {e}")))
}

/// RFC 3339 at second precision, the format the bars endpoint expects.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ── Client ───────────────────────────────────────────────────────────

pub struct AlpacaClient {
    client: Client,
    settings: AlpacaSettings,
    credentials: Credentials,
    circuit_breaker: Arc<CircuitBreaker>,
    rate_limiter: Arc<RateLimiter>,
}

impl AlpacaClient {
    pub fn new(
        settings: AlpacaSettings,
        credentials: Credentials,
        circuit_breaker: Arc<CircuitBreaker>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, DataError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(concat!("barvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;

        tracing::info!(
            data_url = %settings.data_url,
            trading_url = %settings.trading_url,
            feed = %settings.feed,
            "alpaca client initialized"
        );

        Ok(Self {
            client,
            settings,
            credentials,
            circuit_breaker,
            rate_limiter,
        })
    }

    pub fn settings(&self) -> &AlpacaSettings {
        &self.settings
    }

    /// Query parameters for one page of bars. `page_token` is always last so
    /// the first page's query ends in `sort=asc`.
    fn bars_query(
        settings: &AlpacaSettings,
        request: &BarRequest,
        page_token: Option<&str>,
    ) -> Vec<(&'static str, String)> {
        // `end` is inclusive on the API side; the request window is half-open.
        let end = request.end - ChronoDuration::seconds(1);
        let mut query = vec![
            ("symbols", request.symbols.join(",")),
            ("timeframe", request.timeframe.to_string()),
            ("start", format_ts(request.start)),
            ("end", format_ts(end)),
            ("limit", settings.page_limit.to_string()),
            ("adjustment", "raw".to_string()),
            ("feed", settings.feed.clone()),
            ("sort", "asc".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("page_token", token.to_string()));
        }
        query
    }

    fn backoff(&self, attempt: u32, last_error: Option<&DataError>) -> Duration {
        let base = Duration::from_millis(self.settings.base_delay_ms);
        let exponential = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let delay = match last_error {
            Some(DataError::RateLimited { retry_after_secs }) => {
                exponential.max(Duration::from_secs(*retry_after_secs))
            }
            _ => exponential,
        };
        delay.min(Duration::from_secs(self.settings.max_backoff_secs))
    }

    /// Issue a GET with rate limiting, retry, and circuit-breaker bookkeeping.
    ///
    /// `context` names the request in errors; `symbol` is reported on 404.
    fn get_with_retry(
        &self,
        url: &str,
        query: &[(&'static str, String)],
        context: &str,
        symbol: Option<&str>,
    ) -> Result<Response, DataError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(DataError::CircuitBreakerTripped);
        }

        let mut last_error: Option<DataError> = None;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt, last_error.as_ref());
                tracing::warn!(
                    context,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "retrying request"
                );
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(DataError::CircuitBreakerTripped);
            }

            self.rate_limiter.acquire();
            tracing::debug!(url, context, attempt, "GET");

            let sent = self
                .client
                .get(url)
                .query(query)
                .header(KEY_HEADER, &self.credentials.api_key)
                .header(SECRET_HEADER, &self.credentials.api_secret)
                .send();

            let resp = match sent {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(DataError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(DataError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();
            if status.is_success() {
                self.circuit_breaker.record_success();
                return Ok(resp);
            }

            match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(DataError::AuthenticationRequired(format!(
                        "{context}: HTTP {status} (check ALPACA_API_KEY / ALPACA_API_SECRET)"
                    )));
                }
                StatusCode::NOT_FOUND => {
                    return Err(match symbol {
                        Some(symbol) => DataError::SymbolNotFound {
                            symbol: symbol.to_string(),
                        },
                        None => DataError::InvalidRequest(format!("{context}: HTTP {status}")),
                    });
                }
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                    let body = resp.text().unwrap_or_default();
                    return Err(DataError::InvalidRequest(format!(
                        "{context}: HTTP {status}: {}",
                        body.trim()
                    )));
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    self.circuit_breaker.record_failure();
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .unwrap_or(60);
                    last_error = Some(DataError::RateLimited {
                        retry_after_secs: retry_after,
                    });
                }
                _ => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(DataError::Other(format!("HTTP {status} for {context}")));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("max retries exceeded".into())))
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&'static str, String)],
        context: &str,
    ) -> Result<T, DataError> {
        let resp = self.get_with_retry(url, query, context, None)?;
        resp.json().map_err(|e| {
            DataError::ResponseFormatChanged(format!("failed to parse {context} response: {e}"))
        })
    }

    /// Fetch every page of bars for the request.
    fn fetch_pages(&self, request: &BarRequest) -> Result<(Vec<MinuteBar>, usize), DataError> {
        let url = format!("{}/v2/stocks/bars", self.settings.data_url.trim_end_matches('/'));
        let symbols = request.symbols.join(",");
        let context = format!("bars {symbols} {}", request.timeframe);

        let mut bars = Vec::new();
        let mut pages = 0usize;
        let mut token: Option<String> = None;
        let mut seen_tokens: HashSet<String> = HashSet::new();

        loop {
            if pages >= self.settings.max_pages {
                return Err(DataError::ResponseFormatChanged(format!(
                    "{context}: more than {} pages",
                    self.settings.max_pages
                )));
            }

            let query = Self::bars_query(&self.settings, request, token.as_deref());
            let resp = self.get_with_retry(&url, &query, &context, Some(&symbols))?;
            let page: BarsPage = resp.json().map_err(|e| {
                DataError::ResponseFormatChanged(format!("failed to parse {context} page: {e}"))
            })?;
            pages += 1;

            for (symbol, list) in page.bars.unwrap_or_default() {
                bars.extend(list.into_iter().map(|b| b.into_bar(&symbol)));
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => {
                    if !seen_tokens.insert(next.clone()) {
                        return Err(DataError::ResponseFormatChanged(format!(
                            "{context}: page token '{next}' repeated"
                        )));
                    }
                    token = Some(next);
                }
                None => break,
            }
        }

        Ok((bars, pages))
    }
}

impl BarProvider for AlpacaClient {
    fn name(&self) -> &str {
        "alpaca"
    }

    fn source(&self) -> DataSource {
        DataSource::Alpaca
    }

    fn fetch_bars(&self, request: &BarRequest) -> Result<FetchResult, DataError> {
        if request.symbols.is_empty() {
            return Err(DataError::InvalidRequest("no symbols requested".into()));
        }
        if request.end <= request.start {
            return Err(DataError::InvalidRequest(format!(
                "empty window {} .. {}",
                request.start, request.end
            )));
        }

        tracing::info!(
            symbols = %request.symbols.join(","),
            timeframe = %request.timeframe,
            start = %format_ts(request.start),
            end = %format_ts(request.end),
            "fetching bars"
        );

        let (bars, pages) = self.fetch_pages(request)?;
        if bars.is_empty() {
            tracing::warn!(
                symbols = %request.symbols.join(","),
                start = %request.start,
                end = %request.end,
                "no bars returned"
            );
        }

        Ok(FetchResult {
            bars,
            pages,
            source: DataSource::Alpaca,
        })
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

impl MarketInfo for AlpacaClient {
    fn clock(&self) -> Result<MarketClock, DataError> {
        let url = format!("{}/v2/clock", self.settings.trading_url.trim_end_matches('/'));
        self.get_json(&url, &[], "clock")
    }

    fn assets(&self, status: &str, asset_class: &str) -> Result<Vec<Asset>, DataError> {
        let url = format!("{}/v2/assets", self.settings.trading_url.trim_end_matches('/'));
        let query = [
            ("status", status.to_string()),
            ("asset_class", asset_class.to_string()),
        ];
        self.get_json(&url, &query, "assets")
    }

    fn calendar(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<TradingDay>, DataError> {
        let url = format!("{}/v2/calendar", self.settings.trading_url.trim_end_matches('/'));
        let query = [("start", start.to_string()), ("end", end.to_string())];
        let days: Vec<ApiCalendarDay> = self.get_json(&url, &query, "calendar")?;
        days.into_iter()
            .map(|d| {
                Ok(TradingDay {
                    date: d.date,
                    open: parse_session_time(&d.open)?,
                    close: parse_session_time(&d.close)?,
                })
            })
            .collect()
    }
}
