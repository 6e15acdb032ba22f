// =============================================================================
// Canonical file paths — one symbol key, one file stem
// =============================================================================

use std::path::PathBuf;

use crate::config::{RealtimeConfig, Workdir};
use crate::timeframe::Timeframe;

/// Identity of a persistent cache partition and its canonical file pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolKey {
    pub provider: String,
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SymbolKey {
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            provider: config.realtime.provider.clone(),
            exchange: config.realtime.exchange.clone(),
            symbol: config.realtime.symbol.clone(),
            timeframe: config.timeframe(),
        }
    }

    /// Timeframe as the string stored in the cache key column.
    pub fn timeframe_str(&self) -> String {
        self.timeframe.to_string()
    }

    /// File stem shared by the `.ohlcv` and `.toml` files:
    /// `{provider}_{EXCHANGE}_{SYMBOL with / -> : -> _}_{tf_minutes}`.
    pub fn file_stem(&self) -> String {
        let symbol = self
            .symbol
            .to_uppercase()
            .replace('/', ":")
            .replace(':', "_");
        format!(
            "{}_{}_{}_{}",
            self.provider,
            self.exchange.to_uppercase(),
            symbol,
            self.timeframe.minutes_key()
        )
    }

    /// Canonical packed bar file path.
    pub fn ohlcv_path(&self, workdir: &Workdir) -> PathBuf {
        workdir.data_dir.join(format!("{}.ohlcv", self.file_stem()))
    }

    /// Symbol-info TOML path.
    pub fn toml_path(&self, workdir: &Workdir) -> PathBuf {
        workdir.data_dir.join(format!("{}.toml", self.file_stem()))
    }
}

/// Plot CSV path for the configured script: `{script_stem}.csv` in the
/// output dir.
pub fn plot_path(workdir: &Workdir, script_name: &str) -> PathBuf {
    let stem = std::path::Path::new(script_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| script_name.to_string());
    workdir.output_dir.join(format!("{stem}.csv"))
}

/// Persisted script-hash file, kept beside the script itself.
pub fn script_hash_path(script_path: &std::path::Path) -> PathBuf {
    script_path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join(".script_hash.csv")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn key(symbol: &str, tf: &str) -> SymbolKey {
        SymbolKey {
            provider: "ccxt".into(),
            exchange: "binance".into(),
            symbol: symbol.into(),
            timeframe: tf.parse().unwrap(),
        }
    }

    #[test]
    fn stem_replaces_slash_and_colon() {
        assert_eq!(key("BTC/USDT", "5m").file_stem(), "ccxt_BINANCE_BTC_USDT_5");
        // Futures-style symbols carry a colon already.
        assert_eq!(
            key("BTC/USDT:USDT", "5m").file_stem(),
            "ccxt_BINANCE_BTC_USDT_USDT_5"
        );
    }

    #[test]
    fn stem_uses_minutes_key() {
        assert_eq!(key("ETH/USDT", "1h").file_stem(), "ccxt_BINANCE_ETH_USDT_60");
        assert_eq!(key("ETH/USDT", "1d").file_stem(), "ccxt_BINANCE_ETH_USDT_1440");
    }

    #[test]
    fn paths_land_in_the_right_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let wd = Workdir::at(dir.path()).unwrap();
        let k = key("BTC/USDT", "5m");
        assert!(k.ohlcv_path(&wd).ends_with("ccxt_BINANCE_BTC_USDT_5.ohlcv"));
        assert!(k.toml_path(&wd).ends_with("ccxt_BINANCE_BTC_USDT_5.toml"));
        assert!(plot_path(&wd, "demo.py").ends_with("output/demo.csv"));
    }

    #[test]
    fn hash_path_sits_beside_script() {
        let p = script_hash_path(std::path::Path::new("/x/scripts/demo.py"));
        assert_eq!(p, PathBuf::from("/x/scripts/.script_hash.csv"));
    }
}
