// =============================================================================
// Data-service state — the buffer mutex and the shared AppState
// =============================================================================
//
// `DataState` is everything the bar pipeline mutates: collected trades, the
// live bar buffer, the gap-fixer guard, and the pending lifecycle event. The
// collector, gap fixer, and file updater all take the same
// `parking_lot::Mutex` around it — deliberately not a RwLock, since the file
// updater writes on every tick.
//
// Everything else on `AppState` (event histories, plot options, the fan-out
// channel) sits outside the pipeline's critical section behind its own
// RwLocks.
// =============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::bar::{Bar, Trade};
use crate::bus::{BusMessage, PlotStyle};
use crate::cache::BarCache;
use crate::config::{RealtimeConfig, Workdir};
use crate::paths::SymbolKey;

/// Maximum number of trade events retained for the UI history.
const MAX_TRADE_EVENTS: usize = 1000;
/// Maximum number of plotchar events retained for the UI history.
const MAX_PLOTCHAR_EVENTS: usize = 1000;

// =============================================================================
// DataState — guarded by the buffer mutex
// =============================================================================

/// Mutable pipeline state. One instance per process, behind one mutex.
#[derive(Debug, Default)]
pub struct DataState {
    /// Raw trades accumulated since the last bar rollover.
    pub collected_trades: Vec<Trade>,
    /// Live bar buffer ordered by open time; the last element is in-progress.
    pub live_bars: Vec<Bar>,
    /// Open time of the last synthetic fill bar, to keep gap filling
    /// idempotent per expected boundary.
    pub last_fix_bar_ts: Option<i64>,
    /// Lifecycle event awaiting a runner ACK; replayed to fresh subscribers.
    pub pending_prerun_event: Option<BusMessage>,
}

// =============================================================================
// AppState
// =============================================================================

/// Shared state of the data service, held as `Arc<AppState>` by every task.
pub struct AppState {
    pub config: RwLock<RealtimeConfig>,
    pub workdir: Workdir,
    pub symbol_key: SymbolKey,
    pub ohlcv_path: PathBuf,
    pub toml_path: PathBuf,
    pub plot_path: PathBuf,

    pub cache: Arc<BarCache>,

    /// The buffer mutex. See the module header.
    pub state: Mutex<DataState>,

    /// Fan-out channel; payloads are already-encoded JSON frames.
    pub events: broadcast::Sender<String>,

    // ── UI-facing event histories (outside the buffer mutex) ────────────
    pub trades_history: RwLock<Vec<BusMessage>>,
    pub plotchar_history: RwLock<Vec<BusMessage>>,
    pub plot_options: RwLock<BTreeMap<String, PlotStyle>>,
    pub script_title: RwLock<Option<String>>,
}

impl AppState {
    pub fn new(config: RealtimeConfig, workdir: Workdir, cache: Arc<BarCache>) -> Self {
        let symbol_key = SymbolKey::from_config(&config);
        let ohlcv_path = symbol_key.ohlcv_path(&workdir);
        let toml_path = symbol_key.toml_path(&workdir);
        let plot_path = crate::paths::plot_path(&workdir, &config.realtime.script_name);
        let (events, _) = broadcast::channel(256);

        Self {
            config: RwLock::new(config),
            workdir,
            symbol_key,
            ohlcv_path,
            toml_path,
            plot_path,
            cache,
            state: Mutex::new(DataState::default()),
            events,
            trades_history: RwLock::new(Vec::new()),
            plotchar_history: RwLock::new(Vec::new()),
            plot_options: RwLock::new(BTreeMap::new()),
            script_title: RwLock::new(None),
        }
    }

    /// Broadcast a message to every connected subscriber. Lagging or absent
    /// subscribers are not an error.
    pub fn broadcast(&self, msg: &BusMessage) {
        let _ = self.events.send(msg.encode());
    }

    /// Record a trade event for the UI history, skipping exact duplicates
    /// (the runner re-emits queued events after a reconnect replay).
    pub fn push_trade_event(&self, event: BusMessage) {
        let mut history = self.trades_history.write();
        if history.contains(&event) {
            return;
        }
        history.push(event);
        while history.len() > MAX_TRADE_EVENTS {
            history.remove(0);
        }
    }

    /// Record a plotchar event for the UI history.
    pub fn push_plotchar_event(&self, event: BusMessage) {
        let mut history = self.plotchar_history.write();
        if history.contains(&event) {
            return;
        }
        history.push(event);
        while history.len() > MAX_PLOTCHAR_EVENTS {
            history.remove(0);
        }
    }

    /// Clear every UI-facing history; invoked on `reset_history` from the
    /// runner after a script change.
    pub fn reset_histories(&self) {
        self.trades_history.write().clear();
        self.plotchar_history.write().clear();
        self.plot_options.write().clear();
        debug!("event histories reset");
    }

    /// Stage the pending lifecycle event (at-most-one).
    pub fn stage_pending_prerun(&self, event: BusMessage) {
        self.state.lock().pending_prerun_event = Some(event);
    }

    /// Clear the pending event once the runner has ACKed it.
    pub fn clear_pending_prerun(&self) {
        self.state.lock().pending_prerun_event = None;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_app() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::at(dir.path()).unwrap();
        let config = RealtimeConfig {
            realtime: crate::config::RealtimeSection {
                provider: "ccxt".into(),
                exchange: "binance".into(),
                symbol: "BTC/USDT".into(),
                timeframe: "5m".into(),
                script_name: "demo.py".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let cache = Arc::new(BarCache::in_memory().unwrap());
        AppState::new(config, workdir, cache)
    }

    fn entry(ts: i64) -> BusMessage {
        BusMessage::TradeEntry {
            time: ts,
            price: 1.0,
            size: 1.0,
            id: "Long 1".into(),
            comment: String::new(),
        }
    }

    #[test]
    fn trade_history_deduplicates() {
        let app = test_app();
        app.push_trade_event(entry(1));
        app.push_trade_event(entry(1));
        app.push_trade_event(entry(2));
        assert_eq!(app.trades_history.read().len(), 2);
    }

    #[test]
    fn reset_clears_all_histories() {
        let app = test_app();
        app.push_trade_event(entry(1));
        app.plot_options
            .write()
            .insert("Fast EMA".into(), PlotStyle::default());
        app.reset_histories();
        assert!(app.trades_history.read().is_empty());
        assert!(app.plot_options.read().is_empty());
    }

    #[test]
    fn pending_event_stage_and_clear() {
        let app = test_app();
        assert!(app.state.lock().pending_prerun_event.is_none());

        app.stage_pending_prerun(BusMessage::PrerunReadyAfterHistoryDownload {
            ohlcv_path: "x.ohlcv".into(),
            toml_path: "x.toml".into(),
        });
        assert!(app.state.lock().pending_prerun_event.is_some());

        app.clear_pending_prerun();
        assert!(app.state.lock().pending_prerun_event.is_none());
    }

    #[test]
    fn broadcast_without_subscribers_is_fine() {
        let app = test_app();
        app.broadcast(&BusMessage::ScriptModified);
    }
}
