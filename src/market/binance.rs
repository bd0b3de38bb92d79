use crate::error::StreamError;
use crate::market::types::{PriceWire, Ticker, TickerWire};
use parking_lot::Mutex;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::warn;

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_RETRY_DELAY_MS: u64 = 500;

// Stablecoin quote pairs carry no price signal worth ranking.
const EXCLUDED_SYMBOLS: [&str; 4] = ["USDCUSDT", "BUSDUSDT", "TUSDUSDT", "USTCUSDT"];

pub type ExchangeWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn trade_stream_endpoint(base_url: &str, symbol: &str) -> String {
    format!("{base_url}/{}@trade", symbol.to_ascii_lowercase())
}

fn day_ticker_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/v3/ticker/24hr")
}

fn price_endpoint(base_url: &str, symbol: &str) -> String {
    format!(
        "{base_url}/api/v3/ticker/price?symbol={}",
        symbol.to_ascii_uppercase()
    )
}

pub async fn connect_trade_stream(
    base_url: &str,
    symbol: &str,
) -> Result<ExchangeWsStream, StreamError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let request = trade_stream_endpoint(base_url, symbol);
    let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
    Ok(stream)
}

pub async fn fetch_top_symbols(
    client: &Client,
    base_url: &str,
    limit: usize,
) -> Result<Vec<Ticker>, StreamError> {
    let endpoint = day_ticker_endpoint(base_url);
    let payload = fetch_with_retry::<Vec<TickerWire>>(client, &endpoint).await?;

    let mut tickers = Vec::with_capacity(payload.len());
    for wire in payload {
        match Ticker::try_from(wire) {
            Ok(ticker) => tickers.push(ticker),
            Err(error) => warn!(error = %error, "skipping unparseable ticker row"),
        }
    }

    Ok(rank_tickers(tickers, limit))
}

pub async fn fetch_symbol_price(
    client: &Client,
    base_url: &str,
    symbol: &str,
) -> Result<f64, StreamError> {
    let endpoint = price_endpoint(base_url, symbol);
    let payload = fetch_with_retry::<PriceWire>(client, &endpoint).await?;

    let price = payload.price.parse::<f64>()?;
    if !price.is_finite() || price <= 0.0 {
        return Err(StreamError::InvalidArgument(
            "spot price must be finite and positive".to_string(),
        ));
    }
    Ok(price)
}

async fn fetch_with_retry<T>(client: &Client, endpoint: &str) -> Result<T, StreamError>
where
    T: serde::de::DeserializeOwned,
{
    let mut attempt = 0_u32;
    loop {
        let result = async {
            let response = client.get(endpoint).send().await?.error_for_status()?;
            response.json::<T>().await
        }
        .await;

        match result {
            Ok(payload) => return Ok(payload),
            Err(error) => {
                attempt += 1;
                if attempt >= FETCH_ATTEMPTS {
                    return Err(error.into());
                }
                warn!(endpoint, attempt, error = %error, "market data request failed, retrying");
                let delay = FETCH_RETRY_DELAY_MS.saturating_mul(1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

pub fn rank_tickers(tickers: Vec<Ticker>, limit: usize) -> Vec<Ticker> {
    let mut ranked: Vec<Ticker> = tickers
        .into_iter()
        .filter(|ticker| {
            ticker.symbol.ends_with("USDT")
                && !EXCLUDED_SYMBOLS.contains(&ticker.symbol.as_str())
                && ticker.volume > 0.0
                && ticker.price > 0.0
        })
        .collect();

    ranked.sort_by(|lhs, rhs| rhs.volume.total_cmp(&lhs.volume));
    ranked.truncate(limit);
    ranked
}

#[derive(Debug)]
pub struct TickerCache {
    ttl: Duration,
    slot: Mutex<Option<(Instant, Vec<Ticker>)>>,
}

impl TickerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub async fn top_symbols(
        &self,
        client: &Client,
        base_url: &str,
        limit: usize,
    ) -> Result<Vec<Ticker>, StreamError> {
        if let Some(rows) = self.fresh(limit) {
            return Ok(rows);
        }

        let rows = fetch_top_symbols(client, base_url, limit).await?;
        let mut slot = self.slot.lock();
        *slot = Some((Instant::now(), rows.clone()));
        Ok(rows)
    }

    pub fn invalidate(&self) {
        *self.slot.lock() = None;
    }

    fn fresh(&self, limit: usize) -> Option<Vec<Ticker>> {
        let slot = self.slot.lock();
        let (fetched_at, rows) = slot.as_ref()?;
        if fetched_at.elapsed() >= self.ttl || rows.len() < limit {
            return None;
        }
        Some(rows[..limit.min(rows.len())].to_vec())
    }
}
