// =============================================================================
// Trade WebSocket stream — live tick feed for the collector
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::bar::Trade;
use crate::exchange::{native_symbol, ws_base_url};

/// Connect to the exchange aggTrade WebSocket stream for `symbol` and push
/// each trade into `tx`.
///
/// Runs until the stream disconnects or an error occurs, then returns so
/// that the caller can handle reconnection.
pub async fn run_trade_stream(
    exchange: &str,
    symbol: &str,
    tx: &UnboundedSender<Trade>,
) -> Result<()> {
    let lower = native_symbol(symbol).to_lowercase();
    let url = format!("{}/{lower}@aggTrade", ws_base_url(exchange));
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_agg_trade(&text) {
                        Ok(trade) => {
                            if tx.send(trade).is_err() {
                                // Receiver gone -- the collector is shutting down.
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse aggTrade message");
                        }
                    }
                }
                // Ping/Pong/Binary/Close frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse an aggTrade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "T": 1700000000123, "p": "37000.00", "q": "0.123", "m": true }
/// ```
fn parse_agg_trade(text: &str) -> Result<Trade> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let ts = root["T"].as_i64().context("missing field T")?;
    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;
    let amount: f64 = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    Ok(Trade { ts, price, amount })
}
