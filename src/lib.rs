pub mod error;
pub mod market;

pub use error::StreamError;
pub use market::binance::{fetch_symbol_price, fetch_top_symbols, TickerCache};
pub use market::client::PriceStreamClient;
pub use market::history::PriceHistory;
pub use market::reader::StreamReader;
pub use market::types::{
    ConnectionInfo, ConnectionStatus, Sample, StreamArgs, StreamConfig, Ticker,
};
