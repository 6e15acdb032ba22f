// =============================================================================
// Exchange access — REST market data, history downloads, trade stream
// =============================================================================

pub mod client;
pub mod provider;
pub mod stream;
pub mod syminfo;

pub use client::ExchangeClient;
pub use syminfo::SymInfo;

/// REST base URL for a configured exchange name. Unknown names fall back to
/// the spot API so that a typo fails loudly at the first request, not here.
pub fn rest_base_url(exchange: &str) -> &'static str {
    match exchange.to_lowercase().as_str() {
        "binanceusdm" => "https://fapi.binance.com",
        _ => "https://api.binance.com",
    }
}

/// Kline/stream endpoint prefix for a configured exchange name.
pub fn ws_base_url(exchange: &str) -> &'static str {
    match exchange.to_lowercase().as_str() {
        "binanceusdm" => "wss://fstream.binance.com/ws",
        _ => "wss://stream.binance.com:9443/ws",
    }
}

/// Exchange-native symbol: `BTC/USDT` -> `BTCUSDT` (settlement suffixes such
/// as `:USDT` are dropped).
pub fn native_symbol(symbol: &str) -> String {
    let base = symbol.split(':').next().unwrap_or(symbol);
    base.replace('/', "").to_uppercase()
}
