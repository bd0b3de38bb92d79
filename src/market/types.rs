use crate::error::StreamError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_STREAM_BASE_URL: &str = "wss://stream.binance.com:9443/ws";
pub const DEFAULT_REST_BASE_URL: &str = "https://api.binance.com";
pub const DEFAULT_HISTORY_CAPACITY: usize = 600;
pub const MIN_HISTORY_CAPACITY: usize = 50;
pub const MAX_HISTORY_CAPACITY: usize = 10_000;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const MIN_INITIAL_BACKOFF_MS: u64 = 100;
pub const MAX_BACKOFF_CEILING_MS: u64 = 300_000;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 20_000;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 10_000;
pub const MIN_PING_INTERVAL_MS: u64 = 1_000;
pub const MAX_PING_INTERVAL_MS: u64 = 120_000;
pub const DEFAULT_TICKER_CACHE_TTL_MS: u64 = 30_000;
pub const MIN_TICKER_CACHE_TTL_MS: u64 = 30_000;
pub const MAX_TICKER_CACHE_TTL_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub ts: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub status: ConnectionStatus,
    pub symbol: Option<String>,
    pub error_count: u64,
    pub message_count: u64,
    pub uptime_secs: f64,
    pub last_update: f64,
    pub history_len: usize,
    pub latest_price: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamArgs {
    pub history_capacity: Option<usize>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub ping_timeout_ms: Option<u64>,
    pub ticker_cache_ttl_ms: Option<u64>,
    pub stream_base_url: Option<String>,
    pub rest_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub history_capacity: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub ticker_cache_ttl_ms: u64,
    pub stream_base_url: String,
    pub rest_base_url: String,
}

impl StreamArgs {
    pub fn normalize(self) -> Result<StreamConfig, StreamError> {
        let history_capacity = self.history_capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY);
        if !(MIN_HISTORY_CAPACITY..=MAX_HISTORY_CAPACITY).contains(&history_capacity) {
            return Err(StreamError::InvalidArgument(format!(
                "historyCapacity must be between {MIN_HISTORY_CAPACITY} and {MAX_HISTORY_CAPACITY}"
            )));
        }

        let initial_backoff_ms = self.initial_backoff_ms.unwrap_or(DEFAULT_INITIAL_BACKOFF_MS);
        let max_backoff_ms = self.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS);
        if initial_backoff_ms < MIN_INITIAL_BACKOFF_MS {
            return Err(StreamError::InvalidArgument(format!(
                "initialBackoffMs must be at least {MIN_INITIAL_BACKOFF_MS}"
            )));
        }
        if max_backoff_ms < initial_backoff_ms || max_backoff_ms > MAX_BACKOFF_CEILING_MS {
            return Err(StreamError::InvalidArgument(format!(
                "maxBackoffMs must be between initialBackoffMs and {MAX_BACKOFF_CEILING_MS}"
            )));
        }

        let ping_interval_ms = self.ping_interval_ms.unwrap_or(DEFAULT_PING_INTERVAL_MS);
        if !(MIN_PING_INTERVAL_MS..=MAX_PING_INTERVAL_MS).contains(&ping_interval_ms) {
            return Err(StreamError::InvalidArgument(format!(
                "pingIntervalMs must be between {MIN_PING_INTERVAL_MS} and {MAX_PING_INTERVAL_MS}"
            )));
        }
        let ping_timeout_ms = self.ping_timeout_ms.unwrap_or(DEFAULT_PING_TIMEOUT_MS);
        if ping_timeout_ms == 0 {
            return Err(StreamError::InvalidArgument(
                "pingTimeoutMs must be positive".to_string(),
            ));
        }

        let ticker_cache_ttl_ms = self.ticker_cache_ttl_ms.unwrap_or(DEFAULT_TICKER_CACHE_TTL_MS);
        if !(MIN_TICKER_CACHE_TTL_MS..=MAX_TICKER_CACHE_TTL_MS).contains(&ticker_cache_ttl_ms) {
            return Err(StreamError::InvalidArgument(format!(
                "tickerCacheTtlMs must be between {MIN_TICKER_CACHE_TTL_MS} and {MAX_TICKER_CACHE_TTL_MS}"
            )));
        }

        let stream_base_url = self
            .stream_base_url
            .unwrap_or_else(|| DEFAULT_STREAM_BASE_URL.to_string());
        let rest_base_url = self
            .rest_base_url
            .unwrap_or_else(|| DEFAULT_REST_BASE_URL.to_string());
        if stream_base_url.trim().is_empty() || rest_base_url.trim().is_empty() {
            return Err(StreamError::InvalidArgument(
                "base URLs must be non-empty".to_string(),
            ));
        }

        Ok(StreamConfig {
            history_capacity,
            initial_backoff_ms,
            max_backoff_ms,
            ping_interval_ms,
            ping_timeout_ms,
            ticker_cache_ttl_ms,
            stream_base_url,
            rest_base_url,
        })
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            ticker_cache_ttl_ms: DEFAULT_TICKER_CACHE_TTL_MS,
            stream_base_url: DEFAULT_STREAM_BASE_URL.to_string(),
            rest_base_url: DEFAULT_REST_BASE_URL.to_string(),
        }
    }
}

pub fn normalize_symbol(symbol: &str) -> Result<String, StreamError> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(StreamError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(trimmed.to_ascii_lowercase())
}

// The feed encodes prices as decimal strings, but the spec for the wire
// format allows plain numbers too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WirePrice {
    Number(f64),
    Text(String),
}

impl WirePrice {
    fn parse(self) -> Result<f64, StreamError> {
        match self {
            Self::Number(value) => Ok(value),
            Self::Text(text) => Ok(text.parse::<f64>()?),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TradeWire {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "p")]
    pub price: WirePrice,
    #[serde(rename = "T")]
    pub trade_time: i64,
}

impl TryFrom<TradeWire> for Sample {
    type Error = StreamError;

    fn try_from(value: TradeWire) -> Result<Self, Self::Error> {
        if value.event_type != "trade" {
            return Err(StreamError::InvalidArgument(format!(
                "unexpected event type '{}' for trade stream",
                value.event_type
            )));
        }

        let price = value.price.parse()?;
        if !price.is_finite() || price <= 0.0 {
            return Err(StreamError::InvalidArgument(
                "trade price must be finite and positive".to_string(),
            ));
        }
        if value.trade_time <= 0 {
            return Err(StreamError::InvalidArgument(
                "trade time must be positive".to_string(),
            ));
        }

        Ok(Self {
            ts: value.trade_time as f64 / 1_000.0,
            price,
        })
    }
}

pub fn parse_trade_payload(payload: &mut [u8]) -> Result<Sample, StreamError> {
    let wire: TradeWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

#[derive(Debug, Deserialize)]
pub struct TickerWire {
    pub symbol: String,
    #[serde(rename = "lastPrice")]
    pub last_price: String,
    #[serde(rename = "priceChangePercent")]
    pub price_change_percent: String,
    pub volume: String,
    #[serde(rename = "count")]
    pub trade_count: u64,
    #[serde(rename = "highPrice")]
    pub high_price: String,
    #[serde(rename = "lowPrice")]
    pub low_price: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    pub change_pct_24h: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub high_24h: f64,
    pub low_24h: f64,
}

impl TryFrom<TickerWire> for Ticker {
    type Error = StreamError;

    fn try_from(value: TickerWire) -> Result<Self, Self::Error> {
        let price = value.last_price.parse::<f64>()?;
        let change_pct_24h = value.price_change_percent.parse::<f64>()?;
        let volume = value.volume.parse::<f64>()?;
        let high_24h = value.high_price.parse::<f64>()?;
        let low_24h = value.low_price.parse::<f64>()?;

        if !price.is_finite() || !change_pct_24h.is_finite() || !volume.is_finite() {
            return Err(StreamError::InvalidArgument(
                "ticker values must be finite".to_string(),
            ));
        }

        Ok(Self {
            symbol: value.symbol,
            price,
            change_pct_24h,
            volume,
            trade_count: value.trade_count,
            high_24h,
            low_24h,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct PriceWire {
    pub price: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_trade_payload() {
        let mut payload =
            br#"{"e":"trade","E":1700000000100,"s":"BTCUSDT","t":55,"p":"1000.5","q":"0.25","T":1700000000000,"m":false}"#
                .to_vec();
        let sample = parse_trade_payload(&mut payload).expect("trade payload should parse");

        assert_eq!(sample.price, 1000.5);
        assert_eq!(sample.ts, 1_700_000_000.0);
    }

    #[test]
    fn parses_numeric_price_field() {
        let mut payload = br#"{"e":"trade","p":1000.5,"T":1700000000000}"#.to_vec();
        let sample = parse_trade_payload(&mut payload).expect("numeric price should parse");

        assert_eq!(sample.price, 1000.5);
    }

    #[test]
    fn rejects_non_numeric_price() {
        let mut payload = br#"{"e":"trade","p":"broken","T":1700000000000}"#.to_vec();
        assert!(parse_trade_payload(&mut payload).is_err());
    }

    #[test]
    fn rejects_non_positive_price() {
        let mut payload = br#"{"e":"trade","p":"-3.5","T":1700000000000}"#.to_vec();
        assert!(parse_trade_payload(&mut payload).is_err());
    }

    #[test]
    fn rejects_unexpected_event_type() {
        let mut payload = br#"{"e":"aggTrade","p":"1000.5","T":1700000000000}"#.to_vec();
        assert!(parse_trade_payload(&mut payload).is_err());
    }

    #[test]
    fn rejects_missing_fields() {
        let mut payload = br#"{"e":"trade","T":1700000000000}"#.to_vec();
        assert!(parse_trade_payload(&mut payload).is_err());
    }

    #[test]
    fn normalizes_symbol_to_lowercase() {
        assert_eq!(normalize_symbol(" BTCUSDT ").unwrap(), "btcusdt");
        assert!(normalize_symbol("").is_err());
        assert!(normalize_symbol("BTC/USDT").is_err());
    }

    #[test]
    fn normalizes_stream_args_defaults() {
        let config = StreamArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.history_capacity, DEFAULT_HISTORY_CAPACITY);
        assert_eq!(config.initial_backoff_ms, DEFAULT_INITIAL_BACKOFF_MS);
        assert_eq!(config.max_backoff_ms, DEFAULT_MAX_BACKOFF_MS);
        assert_eq!(config.ping_interval_ms, DEFAULT_PING_INTERVAL_MS);
        assert_eq!(config.ticker_cache_ttl_ms, DEFAULT_TICKER_CACHE_TTL_MS);
        assert_eq!(config.stream_base_url, DEFAULT_STREAM_BASE_URL);
        assert_eq!(config.rest_base_url, DEFAULT_REST_BASE_URL);
    }

    #[test]
    fn validates_history_capacity_range() {
        let result = StreamArgs {
            history_capacity: Some(10),
            ..StreamArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_backoff_ordering() {
        let result = StreamArgs {
            initial_backoff_ms: Some(5_000),
            max_backoff_ms: Some(1_000),
            ..StreamArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_ticker_cache_ttl_range() {
        let result = StreamArgs {
            ticker_cache_ttl_ms: Some(1_000),
            ..StreamArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn converts_ticker_wire_rows() {
        let wire = TickerWire {
            symbol: "BTCUSDT".to_string(),
            last_price: "50000.25".to_string(),
            price_change_percent: "-1.75".to_string(),
            volume: "1234.5".to_string(),
            trade_count: 98_765,
            high_price: "51000".to_string(),
            low_price: "49000".to_string(),
        };

        let ticker: Ticker = wire.try_into().expect("ticker wire should convert");
        assert_eq!(ticker.price, 50_000.25);
        assert_eq!(ticker.change_pct_24h, -1.75);
        assert_eq!(ticker.trade_count, 98_765);
    }

    #[test]
    fn rejects_ticker_with_broken_numeric_field() {
        let wire = TickerWire {
            symbol: "BTCUSDT".to_string(),
            last_price: "not-a-number".to_string(),
            price_change_percent: "0.0".to_string(),
            volume: "1.0".to_string(),
            trade_count: 1,
            high_price: "1.0".to_string(),
            low_price: "1.0".to_string(),
        };

        let result: Result<Ticker, _> = wire.try_into();
        assert!(result.is_err());
    }
}
