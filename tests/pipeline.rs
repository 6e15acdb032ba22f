// =============================================================================
// Cross-module pipeline scenarios
// =============================================================================
//
// End-to-end flows that single modules cannot cover: canonical-file/cache
// round-trips with gap sentinels, a full pre-run + rollover through the
// strategy runtime, and runner outputs landing in the data-service state.
// =============================================================================

use std::sync::Arc;

use barflow::bar::Bar;
use barflow::bus::{decode_frame, BusMessage, Frame, PlotStyle};
use barflow::cache::BarCache;
use barflow::config::{RealtimeConfig, RealtimeSection, Workdir};
use barflow::data_service::hub::handle_inbound;
use barflow::data_service::state::AppState;
use barflow::exchange::SymInfo;
use barflow::ohlcv_file::{OhlcvReader, OhlcvWriter};
use barflow::paths::SymbolKey;
use barflow::runner_service::strategy::{resolve_strategy, ScriptRunner};
use barflow::runner_service::stream::BarStream;
use barflow::webhook::AlertSink;

fn test_config() -> RealtimeConfig {
    RealtimeConfig {
        realtime: RealtimeSection {
            provider: "ccxt".into(),
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            timeframe: "5m".into(),
            script_name: "demo.py".into(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn syminfo() -> SymInfo {
    SymInfo {
        provider: "ccxt".into(),
        exchange: "binance".into(),
        symbol: "BTC/USDT".into(),
        description: "BTC/USDT".into(),
        market_type: "crypto".into(),
        currency: "USDT".into(),
        base_currency: "BTC".into(),
        mintick: 0.01,
        pricescale: 100,
        timezone: "UTC".into(),
    }
}

fn file_bar(ts_sec: i64, close: f64) -> Bar {
    Bar::new(ts_sec, close, close + 1.0, close - 1.0, close, 5.0)
}

// =============================================================================
// File <-> cache round-trip
// =============================================================================

#[test]
fn file_cache_round_trip_preserves_gap_sentinels() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.ohlcv");
    let exported = dir.path().join("exported.ohlcv");

    // History with two provider gap sentinels in the middle.
    {
        let mut writer = OhlcvWriter::open(&source, true).unwrap();
        for i in 0..20i64 {
            let bar = if i == 7 || i == 8 {
                Bar::new(i * 300, 100.0, 100.0, 100.0, 100.0, -1.0)
            } else {
                file_bar(i * 300, 100.0 + i as f64)
            };
            writer.write(&bar).unwrap();
        }
    }

    let cache = BarCache::init(dir.path().join("bars.db")).unwrap();
    let key = SymbolKey::from_config(&test_config());

    cache.import_from_file(&key, &source).unwrap();
    cache.export_to_file(&key, &exported, None).unwrap();

    let mut a = OhlcvReader::open(&source).unwrap();
    let mut b = OhlcvReader::open(&exported).unwrap();
    assert_eq!(a.size(), b.size());

    let original = a.read_all().unwrap();
    let round_tripped = b.read_all().unwrap();
    assert_eq!(original, round_tripped);

    // The sentinels survived with their negative volume intact.
    assert_eq!(
        round_tripped.iter().filter(|b| b.volume < 0.0).count(),
        2
    );
}

#[test]
fn export_since_matches_backfilled_window() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BarCache::init(dir.path().join("bars.db")).unwrap();
    let key = SymbolKey::from_config(&test_config());

    // Seed a cache partition, then "backfill" an older range, then export
    // from the middle: ordering must hold and the head must be cut.
    let recent: Vec<Bar> = (10..20).map(|i| file_bar(i * 300, 1.0)).collect();
    let older: Vec<Bar> = (0..10).map(|i| file_bar(i * 300, 2.0)).collect();
    cache.upsert_batch(&key, &recent).unwrap();
    cache.upsert_batch(&key, &older).unwrap();

    let exported = dir.path().join("window.ohlcv");
    cache.export_to_file(&key, &exported, Some(5 * 300)).unwrap();

    let mut reader = OhlcvReader::open(&exported).unwrap();
    let bars = reader.read_all().unwrap();
    assert_eq!(bars.len(), 15);
    assert_eq!(bars.first().unwrap().ts, 5 * 300);
    assert!(bars.windows(2).all(|w| w[1].ts - w[0].ts == 300));
}

// =============================================================================
// Pre-run + rollover through the strategy runtime
// =============================================================================

#[test]
fn prerun_then_rollover_steps_exactly_once_per_bar() {
    let dir = tempfile::tempdir().unwrap();

    // Alternating closes so the EMA crossover actually trades.
    let mut closes: Vec<f64> = (0..40).map(|i| 100.0 - i as f64 * 0.5).collect();
    closes.extend((0..40).map(|i| 80.0 + i as f64));
    let bars: Vec<Bar> = closes
        .iter()
        .enumerate()
        .map(|(i, c)| file_bar(i as i64 * 300, *c))
        .collect();
    let total = bars.len() as i64;

    let stream = Arc::new(BarStream::prefilled(bars));
    let mut runner = ScriptRunner::new(
        resolve_strategy("demo").unwrap(),
        stream.clone(),
        syminfo(),
        AlertSink::default(),
        total - 1,
        dir.path().join("demo.csv"),
        "Simple Crossover Strategy".into(),
    );

    // Pre-run: all but the in-progress bar.
    runner.step_n(total - 1);
    assert_eq!(runner.bar_index(), total - 2);

    let prerun_outputs = runner.take_outputs();
    assert!(prerun_outputs.plot_options.contains_key("Fast EMA"));
    assert!(!prerun_outputs.trade_events.is_empty());

    // Rollover: confirm the tail, append the next bar, finish, and step to
    // completion. The index advances by exactly one bar pair.
    let confirmed = file_bar((total - 1) * 300, 121.0);
    let new = file_bar(total * 300, 121.5);
    assert!(stream.replace_last(confirmed));
    stream.append(new);
    stream.finish();

    runner.last_bar_index += 1;
    runner.pre_run = false;
    runner.step_to_completion();

    assert_eq!(runner.bar_index(), total);
    runner.flush_plots();

    // The plot CSV covers every stepped bar, one row each.
    let csv = std::fs::read_to_string(dir.path().join("demo.csv")).unwrap();
    assert_eq!(csv.lines().count() as i64, total + 2); // header + bars + new
}

// =============================================================================
// Runner outputs landing in data-service state
// =============================================================================

#[test]
fn runner_outputs_populate_data_service_state() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = Workdir::at(dir.path()).unwrap();
    let cache = Arc::new(BarCache::init(workdir.cache_path()).unwrap());
    let app = Arc::new(AppState::new(test_config(), workdir, cache));

    let mut rx = app.events.subscribe();

    // Stage the pending event and let the "runner" ACK it.
    app.stage_pending_prerun(BusMessage::PrerunReadyAfterHistoryDownload {
        ohlcv_path: app.ohlcv_path.display().to_string(),
        toml_path: app.toml_path.display().to_string(),
    });
    handle_inbound(&app, BusMessage::AckPrerunReadyAfterHistoryDownload);
    assert!(app.state.lock().pending_prerun_event.is_none());

    // Trade events arrive (as after a pre-run flush).
    handle_inbound(
        &app,
        BusMessage::TradeEntry {
            time: 600,
            price: 101.0,
            size: 1.0,
            id: "Long 1".into(),
            comment: String::new(),
        },
    );
    handle_inbound(
        &app,
        BusMessage::TradeClose {
            time: 1200,
            price: 103.0,
            size: 1.0,
            id: "Long 1".into(),
            comment: String::new(),
            profit: 2.0,
        },
    );
    assert_eq!(app.trades_history.read().len(), 2);

    // Plot options arrive with a plot CSV on disk: plot_data is broadcast
    // for the confirmed bar row.
    std::fs::write(&app.plot_path, "time,Fast EMA\n300,1.5\n600,1.6\n900,1.7\n").unwrap();
    handle_inbound(
        &app,
        BusMessage::PlotOptions {
            data: [(
                "Fast EMA".to_string(),
                PlotStyle {
                    color: Some("blue".into()),
                    linewidth: Some(1),
                    style: None,
                },
            )]
            .into_iter()
            .collect(),
            confirmed_bar_index: 1,
        },
    );
    assert!(app.plot_options.read().contains_key("Fast EMA"));

    let mut saw_plot_data = false;
    while let Ok(text) = rx.try_recv() {
        if let Frame::Messages(msgs) = decode_frame(&text) {
            for msg in msgs {
                if let BusMessage::PlotData { title, time, value } = msg {
                    assert_eq!(title, "Fast EMA");
                    assert_eq!(time, 600);
                    assert_eq!(value, Some(1.6));
                    saw_plot_data = true;
                }
            }
        }
    }
    assert!(saw_plot_data);

    // Script change: histories reset.
    handle_inbound(&app, BusMessage::ResetHistory);
    assert!(app.trades_history.read().is_empty());
    assert!(app.plot_options.read().is_empty());
}
