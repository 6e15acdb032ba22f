// =============================================================================
// Symbol info — the .toml sidecar the strategy reads market metadata from
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths::SymbolKey;

/// Market metadata stored beside the canonical bar file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymInfo {
    pub provider: String,
    pub exchange: String,
    pub symbol: String,
    pub description: String,
    #[serde(rename = "type", default = "default_type")]
    pub market_type: String,
    pub currency: String,
    pub base_currency: String,
    /// Smallest price increment.
    pub mintick: f64,
    /// 1 / mintick, rounded.
    pub pricescale: i64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_type() -> String {
    "crypto".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl SymInfo {
    /// Build from an exchangeInfo symbol entry. Missing filters degrade to a
    /// mintick of 0.01.
    pub fn from_exchange_info(key: &SymbolKey, entry: &serde_json::Value) -> Self {
        let base = entry["baseAsset"].as_str().unwrap_or_default().to_string();
        let quote = entry["quoteAsset"].as_str().unwrap_or_default().to_string();

        let mintick = entry["filters"]
            .as_array()
            .and_then(|filters| {
                filters
                    .iter()
                    .find(|f| f["filterType"].as_str() == Some("PRICE_FILTER"))
            })
            .and_then(|f| f["tickSize"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|t| *t > 0.0)
            .unwrap_or(0.01);

        Self {
            provider: key.provider.clone(),
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            description: format!("{}/{}", base, quote),
            market_type: default_type(),
            currency: quote,
            base_currency: base,
            mintick,
            pricescale: (1.0 / mintick).round() as i64,
            timezone: default_timezone(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read symbol info {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse symbol info {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("failed to serialise symbol info")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write symbol info {}", path.display()))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SymbolKey {
        SymbolKey {
            provider: "ccxt".into(),
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            timeframe: "5m".parse().unwrap(),
        }
    }

    #[test]
    fn from_exchange_info_extracts_tick_size() {
        let entry = serde_json::json!({
            "symbol": "BTCUSDT",
            "baseAsset": "BTC",
            "quoteAsset": "USDT",
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.01000000" },
                { "filterType": "LOT_SIZE", "stepSize": "0.00001000" }
            ]
        });
        let info = SymInfo::from_exchange_info(&key(), &entry);
        assert_eq!(info.base_currency, "BTC");
        assert_eq!(info.currency, "USDT");
        assert!((info.mintick - 0.01).abs() < 1e-12);
        assert_eq!(info.pricescale, 100);
    }

    #[test]
    fn missing_filters_degrade_to_default_tick() {
        let entry = serde_json::json!({ "symbol": "BTCUSDT" });
        let info = SymInfo::from_exchange_info(&key(), &entry);
        assert!((info.mintick - 0.01).abs() < 1e-12);
    }

    #[test]
    fn toml_round_trip() {
        let entry = serde_json::json!({
            "baseAsset": "ETH",
            "quoteAsset": "USDT",
            "filters": [{ "filterType": "PRICE_FILTER", "tickSize": "0.05" }]
        });
        let info = SymInfo::from_exchange_info(&key(), &entry);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sym.toml");
        info.save(&path).unwrap();

        let back = SymInfo::load(&path).unwrap();
        assert_eq!(back.base_currency, "ETH");
        assert_eq!(back.pricescale, 20);
        assert_eq!(back.timezone, "UTC");
    }
}
