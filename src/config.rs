// =============================================================================
// Configuration — realtime_trade.toml and the workdir layout
// =============================================================================
//
// Both services read the same `realtime_trade.toml` from the workdir config
// directory. Every field carries `#[serde(default)]` so that adding new
// fields never breaks loading an older config file; the four identity fields
// (provider/exchange/symbol/timeframe) are validated at load and missing any
// of them is a fatal startup error.
//
// Workdir layout (root overridable via BARFLOW_WORKDIR, default ./workdir):
//   config/   realtime_trade.toml
//   data/     canonical .ohlcv files, .toml symbol infos, bars.db cache
//   output/   plot CSVs written by the runner
//   scripts/  strategy scripts (+ .script_hash.csv)
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::timeframe::Timeframe;

pub const CONFIG_FILE_NAME: &str = "realtime_trade.toml";

// =============================================================================
// Sections
// =============================================================================

/// `[pyne]` section — engine-wide toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PyneSection {
    #[serde(default)]
    pub no_logo: bool,
}

fn default_data_service_addr() -> String {
    "0.0.0.0:9001".to_string()
}

/// `[realtime]` section — what to trade and where the bus lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeSection {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub timeframe: String,
    #[serde(default)]
    pub script_name: String,
    /// Absolute date `YYYY-MM-DD` or relative day count; empty selects the
    /// default window (2 months, 1 month on the 1-minute timeframe).
    #[serde(default)]
    pub history_since: String,
    #[serde(default = "default_data_service_addr")]
    pub data_service_addr: String,
    #[serde(default)]
    pub enabled: bool,
}

/// `[webhook]` section — alert delivery. `BOT_TOKEN` / `CHAT_ID` come from
/// the environment, not from this file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub telegram_notification: bool,
    #[serde(default)]
    pub url: String,
}

// =============================================================================
// RealtimeConfig
// =============================================================================

/// Parsed `realtime_trade.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub pyne: PyneSection,
    #[serde(default)]
    pub realtime: RealtimeSection,
    #[serde(default)]
    pub webhook: WebhookSection,
}

impl RealtimeConfig {
    /// Load and validate the config from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        let rt = &config.realtime;
        if rt.provider.is_empty()
            || rt.exchange.is_empty()
            || rt.symbol.is_empty()
            || rt.timeframe.is_empty()
        {
            bail!(
                "missing provider/exchange/symbol/timeframe in {}",
                path.display()
            );
        }
        // Fail fast on an unparsable timeframe too.
        rt.timeframe
            .parse::<Timeframe>()
            .with_context(|| format!("bad timeframe in {}", path.display()))?;

        info!(
            provider = %rt.provider,
            exchange = %rt.exchange,
            symbol = %rt.symbol,
            timeframe = %rt.timeframe,
            "realtime config loaded"
        );
        Ok(config)
    }

    /// The parsed timeframe. `load` has already validated it.
    pub fn timeframe(&self) -> Timeframe {
        self.realtime
            .timeframe
            .parse()
            .expect("timeframe validated at load")
    }

    /// Host portion of `data_service_addr` (bind address for D).
    pub fn service_host(&self) -> String {
        self.realtime
            .data_service_addr
            .split(':')
            .next()
            .filter(|h| !h.is_empty())
            .unwrap_or("0.0.0.0")
            .to_string()
    }

    /// Port portion of `data_service_addr`.
    pub fn service_port(&self) -> u16 {
        self.realtime
            .data_service_addr
            .split(':')
            .nth(1)
            .and_then(|p| p.parse().ok())
            .unwrap_or(9001)
    }

    /// The runner's dial URL for the data-service bus.
    pub fn bus_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.service_port())
    }

    /// Persist the current configuration with an atomic tmp + rename write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).context("failed to serialise realtime config")?;

        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "realtime config saved");
        Ok(())
    }
}

// =============================================================================
// Workdir
// =============================================================================

/// Resolved workdir directories. Created on demand by `Workdir::resolve`.
#[derive(Debug, Clone)]
pub struct Workdir {
    pub root: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub scripts_dir: PathBuf,
}

impl Workdir {
    /// Resolve the workdir from `BARFLOW_WORKDIR` (default `./workdir`) and
    /// create the subdirectories if absent.
    pub fn resolve() -> Result<Self> {
        let root = std::env::var("BARFLOW_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("workdir"));
        Self::at(root)
    }

    /// Build a workdir rooted at `root` (used directly by tests).
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let workdir = Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            output_dir: root.join("output"),
            scripts_dir: root.join("scripts"),
            root,
        };
        for dir in [
            &workdir.config_dir,
            &workdir.data_dir,
            &workdir.output_dir,
            &workdir.scripts_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(workdir)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    /// Path of the sqlite bar cache.
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("bars.db")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, body).unwrap();
        path
    }

    const VALID: &str = r#"
[pyne]
no_logo = true

[realtime]
provider = "ccxt"
exchange = "binance"
symbol = "BTC/USDT"
timeframe = "5m"
script_name = "demo.py"
history_since = ""
data_service_addr = "0.0.0.0:9001"
enabled = true

[webhook]
enabled = false
telegram_notification = false
url = ""
"#;

    #[test]
    fn load_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), VALID);
        let cfg = RealtimeConfig::load(&path).unwrap();
        assert_eq!(cfg.realtime.exchange, "binance");
        assert_eq!(cfg.timeframe().to_ms(), 5 * 60 * 1000);
        assert_eq!(cfg.service_port(), 9001);
        assert_eq!(cfg.bus_url(), "ws://127.0.0.1:9001/ws");
        assert!(cfg.pyne.no_logo);
        assert!(!cfg.webhook.enabled);
    }

    #[test]
    fn missing_identity_field_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[realtime]
provider = "ccxt"
exchange = "binance"
symbol = ""
timeframe = "5m"
"#,
        );
        assert!(RealtimeConfig::load(&path).is_err());
    }

    #[test]
    fn bad_timeframe_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[realtime]
provider = "ccxt"
exchange = "binance"
symbol = "BTC/USDT"
timeframe = "5x"
"#,
        );
        assert!(RealtimeConfig::load(&path).is_err());
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[realtime]
provider = "ccxt"
exchange = "binance"
symbol = "BTC/USDT"
timeframe = "1h"
"#,
        );
        let cfg = RealtimeConfig::load(&path).unwrap();
        assert_eq!(cfg.realtime.data_service_addr, "0.0.0.0:9001");
        assert!(!cfg.webhook.enabled);
        assert!(!cfg.pyne.no_logo);
    }

    #[test]
    fn save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), VALID);
        let mut cfg = RealtimeConfig::load(&path).unwrap();
        cfg.webhook.enabled = true;
        cfg.webhook.url = "https://example.test/hook".into();
        cfg.save(&path).unwrap();

        let reloaded = RealtimeConfig::load(&path).unwrap();
        assert!(reloaded.webhook.enabled);
        assert_eq!(reloaded.webhook.url, "https://example.test/hook");
    }

    #[test]
    fn workdir_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let wd = Workdir::at(dir.path().join("wd")).unwrap();
        assert!(wd.config_dir.is_dir());
        assert!(wd.data_dir.is_dir());
        assert!(wd.output_dir.is_dir());
        assert!(wd.scripts_dir.is_dir());
        assert!(wd.cache_path().ends_with("bars.db"));
    }
}
