// =============================================================================
// Strategy runtime — step-per-bar execution over the bar stream
// =============================================================================
//
// The runtime drives one `Strategy` implementation over a `BarStream`, one
// bar per step, collecting entries, closes, alerts, plots, and plotchars.
// Strategy implementations are compiled in and selected by the configured
// script file's stem; the script file itself stays the source of truth for
// the title and for change detection.
//
// A `ScriptRunner` lives for exactly one run: constructed on a lifecycle
// event, destroyed after its outputs are flushed. Stepping is synchronous
// and runs on a blocking worker; `stream.next()` parks on the condvar while
// the tail bar has not arrived yet.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::bar::Bar;
use crate::bus::{BusMessage, PlotStyle};
use crate::exchange::SymInfo;
use crate::runner_service::stream::BarStream;
use crate::webhook::AlertSink;

// =============================================================================
// Step environment
// =============================================================================

/// What a strategy sees and can do during one bar step.
pub struct StepEnv {
    pub bar: Bar,
    /// 0-based index of this bar within the run.
    pub bar_index: i64,
    /// Index of the last bar of the run's history prefix.
    pub last_bar_index: i64,
    /// True while replaying history; realtime side effects (alerts) are
    /// suppressed.
    pub pre_run: bool,
    /// Smallest price increment of the market.
    pub mintick: f64,

    entries: Vec<EntryAction>,
    closes: Vec<CloseAction>,
    alerts: Vec<String>,
    plots: Vec<(String, Option<f64>, PlotStyle)>,
    plotchars: Vec<PlotcharAction>,
}

pub struct EntryAction {
    pub id: String,
    pub size: f64,
    pub comment: String,
    pub alert_message: Option<String>,
}

pub struct CloseAction {
    pub id: String,
    pub comment: String,
    pub alert_message: Option<String>,
}

pub struct PlotcharAction {
    pub title: String,
    pub mark: String,
    pub location: Option<String>,
    pub color: Option<String>,
}

impl StepEnv {
    fn new(bar: Bar, bar_index: i64, last_bar_index: i64, pre_run: bool, mintick: f64) -> Self {
        Self {
            bar,
            bar_index,
            last_bar_index,
            pre_run,
            mintick,
            entries: Vec::new(),
            closes: Vec::new(),
            alerts: Vec::new(),
            plots: Vec::new(),
            plotchars: Vec::new(),
        }
    }

    /// Open a position under `id` at this bar's close.
    pub fn entry(&mut self, id: &str, size: f64, alert_message: Option<String>) {
        self.entries.push(EntryAction {
            id: id.to_string(),
            size,
            comment: String::new(),
            alert_message,
        });
    }

    /// Close the position under `id` at this bar's close.
    pub fn close(&mut self, id: &str, alert_message: Option<String>) {
        self.closes.push(CloseAction {
            id: id.to_string(),
            comment: String::new(),
            alert_message,
        });
    }

    /// Fire a free-form alert.
    pub fn alert(&mut self, message: impl Into<String>) {
        self.alerts.push(message.into());
    }

    /// Record a plot point for `title` on this bar.
    pub fn plot(&mut self, title: &str, value: Option<f64>, style: PlotStyle) {
        self.plots.push((title.to_string(), value, style));
    }

    /// Record a chart marker on this bar.
    pub fn plotchar(
        &mut self,
        title: &str,
        mark: &str,
        location: Option<&str>,
        color: Option<&str>,
    ) {
        self.plotchars.push(PlotcharAction {
            title: title.to_string(),
            mark: mark.to_string(),
            location: location.map(str::to_string),
            color: color.map(str::to_string),
        });
    }
}

// =============================================================================
// Strategy trait and registry
// =============================================================================

/// Step-per-bar strategy interface. One instance per run; state accumulates
/// across steps and dies with the run.
pub trait Strategy: Send {
    fn on_bar(&mut self, env: &mut StepEnv);
}

/// Resolve a compiled-in strategy by script stem. Unknown stems fail the
/// current run only.
pub fn resolve_strategy(script_stem: &str) -> Option<Box<dyn Strategy>> {
    match script_stem {
        "demo" | "demo_1m" => Some(Box::new(EmaCrossStrategy::new(9, 21))),
        _ => None,
    }
}

/// Pull the strategy title out of the script source: the first string
/// argument (or `title=` keyword) of a `script.strategy(...)` /
/// `script.indicator(...)` call. Any failure yields "No title".
pub fn extract_script_title(script_path: &Path) -> String {
    let fallback = "No title".to_string();
    let Ok(source) = std::fs::read_to_string(script_path) else {
        return fallback;
    };

    for marker in ["script.strategy(", "script.indicator(", "script.library("] {
        if let Some(pos) = source.find(marker) {
            let rest = &source[pos + marker.len()..];
            let candidate = match rest.find("title=") {
                Some(kw) => first_string_literal(&rest[kw..]),
                None => first_string_literal(rest),
            };
            if let Some(title) = candidate {
                if !title.is_empty() {
                    return title;
                }
            }
        }
    }
    fallback
}

fn first_string_literal(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let rest = &text[start + 1..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

// =============================================================================
// Demo strategy — EMA 9/21 crossover
// =============================================================================

/// Incremental EMA, seeded with the SMA of the first `period` closes.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: f64,
    seed: Vec<f64>,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            multiplier: 2.0 / (period as f64 + 1.0),
            seed: Vec::with_capacity(period),
            value: None,
        }
    }

    /// Feed one close; returns the current EMA once warmed up.
    pub fn update(&mut self, close: f64) -> Option<f64> {
        match self.value {
            Some(prev) => {
                let ema = close * self.multiplier + prev * (1.0 - self.multiplier);
                self.value = Some(ema);
            }
            None => {
                self.seed.push(close);
                if self.seed.len() == self.period {
                    let sma = self.seed.iter().sum::<f64>() / self.period as f64;
                    self.value = Some(sma);
                }
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// The built-in crossover strategy: long when the fast EMA crosses over the
/// slow EMA, flat when it crosses under. Mirrors the stock demo script.
pub struct EmaCrossStrategy {
    fast: Ema,
    slow: Ema,
    was_above: Option<bool>,
}

impl EmaCrossStrategy {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        Self {
            fast: Ema::new(fast_period),
            slow: Ema::new(slow_period),
            was_above: None,
        }
    }
}

impl Strategy for EmaCrossStrategy {
    fn on_bar(&mut self, env: &mut StepEnv) {
        let close = env.bar.close;
        let fast = self.fast.update(close);
        let slow = self.slow.update(close);

        env.plot(
            "Fast EMA",
            fast,
            PlotStyle {
                color: Some("blue".into()),
                linewidth: Some(1),
                style: None,
            },
        );
        env.plot(
            "Slow EMA",
            slow,
            PlotStyle {
                color: Some("red".into()),
                linewidth: Some(1),
                style: None,
            },
        );

        let (Some(fast), Some(slow)) = (fast, slow) else {
            return;
        };

        let above = fast > slow;
        if let Some(was_above) = self.was_above {
            if above && !was_above {
                env.entry(
                    "Long 1",
                    1.0,
                    Some(format!(r#"{{"signal": "Long 1", "price": {close}}}"#)),
                );
            } else if !above && was_above {
                env.close(
                    "Long 1",
                    Some(format!(r#"{{"signal": "Close 1", "price": {close}}}"#)),
                );
            }
        }
        self.was_above = Some(above);
    }
}

// =============================================================================
// Plot writer
// =============================================================================

/// Accumulates one row per step and writes the whole CSV on flush. Each run
/// replays the full history, so the file is rebuilt from scratch every run;
/// row index equals bar index by construction.
pub struct PlotWriter {
    path: PathBuf,
    titles: BTreeSet<String>,
    rows: Vec<(i64, BTreeMap<String, f64>)>,
}

impl PlotWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            titles: BTreeSet::new(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, time: i64, plots: &[(String, Option<f64>, PlotStyle)]) {
        let mut values = BTreeMap::new();
        for (title, value, _) in plots {
            self.titles.insert(title.clone());
            if let Some(v) = value {
                values.insert(title.clone(), *v);
            }
        }
        self.rows.push((time, values));
    }

    /// Write `time,<title>,...` with one row per recorded step.
    pub fn flush(&self) -> Result<()> {
        if self.titles.is_empty() {
            return Ok(());
        }
        let mut writer = csv::Writer::from_path(&self.path)
            .with_context(|| format!("failed to open plot CSV {}", self.path.display()))?;

        let mut header = vec!["time".to_string()];
        header.extend(self.titles.iter().cloned());
        writer.write_record(&header)?;

        for (time, values) in &self.rows {
            let mut record = vec![time.to_string()];
            for title in &self.titles {
                record.push(
                    values
                        .get(title)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                );
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

// =============================================================================
// Run outputs
// =============================================================================

/// Queued strategy outputs, drained and sent to the data service after each
/// stepping phase.
#[derive(Debug, Default)]
pub struct RunOutputs {
    pub trade_events: Vec<BusMessage>,
    pub plotchar_events: Vec<BusMessage>,
    pub plot_options: BTreeMap<String, PlotStyle>,
}

impl RunOutputs {
    pub fn is_empty(&self) -> bool {
        self.trade_events.is_empty()
            && self.plotchar_events.is_empty()
            && self.plot_options.is_empty()
    }
}

// =============================================================================
// ScriptRunner
// =============================================================================

struct OpenPosition {
    price: f64,
    size: f64,
}

/// Drives one strategy instance over one bar stream for one run.
pub struct ScriptRunner {
    strategy: Box<dyn Strategy>,
    stream: Arc<BarStream>,
    syminfo: SymInfo,
    alert_sink: AlertSink,
    script_title: String,

    pub last_bar_index: i64,
    pub pre_run: bool,
    bar_index: i64,

    open_positions: BTreeMap<String, OpenPosition>,
    outputs: RunOutputs,
    plot_writer: PlotWriter,
}

impl ScriptRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy: Box<dyn Strategy>,
        stream: Arc<BarStream>,
        syminfo: SymInfo,
        alert_sink: AlertSink,
        last_bar_index: i64,
        plot_path: PathBuf,
        script_title: String,
    ) -> Self {
        Self {
            strategy,
            stream,
            syminfo,
            alert_sink,
            script_title,
            last_bar_index,
            pre_run: true,
            bar_index: -1,
            open_positions: BTreeMap::new(),
            outputs: RunOutputs::default(),
            plot_writer: PlotWriter::new(plot_path),
        }
    }

    pub fn title(&self) -> &str {
        &self.script_title
    }

    pub fn bar_index(&self) -> i64 {
        self.bar_index
    }

    pub fn stream(&self) -> &Arc<BarStream> {
        &self.stream
    }

    /// Consume one bar and run the strategy over it. Provider gap sentinels
    /// (negative volume) are skipped so bar indices count real bars only.
    /// Returns `None` once the stream is finished and drained.
    pub fn step(&mut self) -> Option<()> {
        let bar = loop {
            let bar = self.stream.next()?;
            if bar.volume >= 0.0 {
                break bar;
            }
            debug!(ts = bar.ts, "gap sentinel skipped");
        };

        self.bar_index += 1;
        let mut env = StepEnv::new(
            bar,
            self.bar_index,
            self.last_bar_index,
            self.pre_run,
            self.syminfo.mintick,
        );
        self.strategy.on_bar(&mut env);
        self.apply_actions(env, &bar);
        Some(())
    }

    /// Step exactly `count` times (the pre-run replay).
    pub fn step_n(&mut self, count: i64) {
        for _ in 0..count {
            if self.step().is_none() {
                break;
            }
        }
    }

    /// Step until the stream is drained (requires `finish` to have been
    /// signalled, otherwise this would block forever).
    pub fn step_to_completion(&mut self) {
        while self.step().is_some() {}
    }

    /// Drain the queued outputs.
    pub fn take_outputs(&mut self) -> RunOutputs {
        std::mem::take(&mut self.outputs)
    }

    /// Flush the plot CSV.
    pub fn flush_plots(&self) {
        if let Err(e) = self.plot_writer.flush() {
            warn!(error = %e, "failed to flush plot CSV");
        }
    }

    fn apply_actions(&mut self, env: StepEnv, bar: &Bar) {
        let StepEnv {
            entries,
            closes,
            alerts,
            plots,
            plotchars,
            pre_run,
            ..
        } = env;

        for action in entries {
            if self.open_positions.contains_key(&action.id) {
                continue;
            }
            self.open_positions.insert(
                action.id.clone(),
                OpenPosition {
                    price: bar.close,
                    size: action.size,
                },
            );
            self.outputs.trade_events.push(BusMessage::TradeEntry {
                time: bar.ts,
                price: bar.close,
                size: action.size,
                id: action.id,
                comment: action.comment,
            });
            if let Some(message) = action.alert_message {
                self.fire_alert(&message, pre_run);
            }
        }

        for action in closes {
            let Some(position) = self.open_positions.remove(&action.id) else {
                continue;
            };
            let profit = (bar.close - position.price) * position.size;
            self.outputs.trade_events.push(BusMessage::TradeClose {
                time: bar.ts,
                price: bar.close,
                size: position.size,
                id: action.id,
                comment: action.comment,
                profit,
            });
            if let Some(message) = action.alert_message {
                self.fire_alert(&message, pre_run);
            }
        }

        for message in alerts {
            self.fire_alert(&message, pre_run);
        }

        for (title, _, style) in &plots {
            // De-duplicate by (title, options); only changed options are
            // worth re-sending.
            if self.outputs.plot_options.get(title) != Some(style) {
                self.outputs.plot_options.insert(title.clone(), style.clone());
            }
        }
        self.plot_writer.push_row(bar.ts, &plots);

        for action in plotchars {
            self.outputs.plotchar_events.push(BusMessage::Plotchar {
                title: action.title,
                time: bar.ts,
                mark: action.mark,
                text: None,
                location: action.location,
                color: action.color,
                size: None,
            });
        }
    }

    /// Alerts only fire in realtime; history replay stays silent.
    fn fire_alert(&self, message: &str, pre_run: bool) {
        if pre_run {
            return;
        }
        let payload: serde_json::Value = serde_json::from_str(message)
            .unwrap_or_else(|_| serde_json::Value::String(message.to_string()));
        let envelope = serde_json::json!({ "message": payload });
        self.alert_sink
            .send(&self.script_title, &envelope.to_string());
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

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

    fn bar(ts: i64, close: f64) -> Bar {
        Bar::new(ts, close, close + 1.0, close - 1.0, close, 5.0)
    }

    fn runner_over(bars: Vec<Bar>, strategy: Box<dyn Strategy>) -> ScriptRunner {
        let dir = tempfile::tempdir().unwrap();
        let stream = Arc::new(BarStream::prefilled(bars));
        stream.finish();
        ScriptRunner::new(
            strategy,
            stream,
            syminfo(),
            AlertSink::default(),
            0,
            dir.path().join("plot.csv"),
            "Test".into(),
        )
    }

    // ── Ema ─────────────────────────────────────────────────────────────

    #[test]
    fn ema_seeds_with_sma() {
        let mut ema = Ema::new(3);
        assert!(ema.update(2.0).is_none());
        assert!(ema.update(4.0).is_none());
        // Seed: SMA of [2, 4, 6] = 4.0.
        assert_eq!(ema.update(6.0), Some(4.0));
        // Next: 8 * 0.5 + 4 * 0.5 = 6.0 (multiplier = 2/4).
        assert_eq!(ema.update(8.0), Some(6.0));
    }

    // ── Demo strategy ───────────────────────────────────────────────────

    struct Scripted {
        steps: Vec<fn(&mut StepEnv)>,
        at: usize,
    }

    impl Strategy for Scripted {
        fn on_bar(&mut self, env: &mut StepEnv) {
            if let Some(f) = self.steps.get(self.at) {
                f(env);
            }
            self.at += 1;
        }
    }

    #[test]
    fn entry_then_close_produces_trade_pair() {
        let strategy = Scripted {
            steps: vec![
                |env| env.entry("Long 1", 1.0, None),
                |_| {},
                |env| env.close("Long 1", None),
            ],
            at: 0,
        };
        let mut runner = runner_over(
            vec![bar(100, 10.0), bar(400, 11.0), bar(700, 13.0)],
            Box::new(strategy),
        );
        runner.step_to_completion();

        let outputs = runner.take_outputs();
        assert_eq!(outputs.trade_events.len(), 2);
        match &outputs.trade_events[0] {
            BusMessage::TradeEntry { time, price, .. } => {
                assert_eq!(*time, 100);
                assert_eq!(*price, 10.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &outputs.trade_events[1] {
            BusMessage::TradeClose { profit, price, .. } => {
                assert_eq!(*price, 13.0);
                assert_eq!(*profit, 3.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn duplicate_entry_is_ignored_while_open() {
        let strategy = Scripted {
            steps: vec![
                |env| env.entry("Long 1", 1.0, None),
                |env| env.entry("Long 1", 1.0, None),
            ],
            at: 0,
        };
        let mut runner = runner_over(vec![bar(100, 10.0), bar(400, 11.0)], Box::new(strategy));
        runner.step_to_completion();
        assert_eq!(runner.take_outputs().trade_events.len(), 1);
    }

    #[test]
    fn close_without_position_is_ignored() {
        let strategy = Scripted {
            steps: vec![|env| env.close("Long 1", None)],
            at: 0,
        };
        let mut runner = runner_over(vec![bar(100, 10.0)], Box::new(strategy));
        runner.step_to_completion();
        assert!(runner.take_outputs().trade_events.is_empty());
    }

    #[test]
    fn gap_sentinels_do_not_count_as_steps() {
        let gap = Bar::new(400, 10.0, 10.0, 10.0, 10.0, -1.0);
        let strategy = Scripted {
            steps: vec![|_| {}, |_| {}],
            at: 0,
        };
        let mut runner = runner_over(vec![bar(100, 10.0), gap, bar(700, 11.0)], Box::new(strategy));
        runner.step_to_completion();
        // Two real bars -> bar_index ends at 1.
        assert_eq!(runner.bar_index(), 1);
    }

    #[test]
    fn ema_cross_strategy_trades_on_crossover() {
        // Descending then sharply ascending closes force a crossunder-free
        // warmup, then a crossover, then a crossunder.
        let mut closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        closes.extend((0..15).map(|i| 71.0 + (i as f64) * 5.0));
        closes.extend((0..15).map(|i| 140.0 - (i as f64) * 6.0));

        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| bar(100 + (i as i64) * 300, *c))
            .collect();

        let mut runner = runner_over(bars, Box::new(EmaCrossStrategy::new(9, 21)));
        runner.step_to_completion();

        let outputs = runner.take_outputs();
        let entries = outputs
            .trade_events
            .iter()
            .filter(|e| matches!(e, BusMessage::TradeEntry { .. }))
            .count();
        let closes_n = outputs
            .trade_events
            .iter()
            .filter(|e| matches!(e, BusMessage::TradeClose { .. }))
            .count();
        assert!(entries >= 1, "expected at least one entry");
        assert!(closes_n >= 1, "expected at least one close");

        // Both EMAs registered as plot series.
        assert!(outputs.plot_options.contains_key("Fast EMA"));
        assert!(outputs.plot_options.contains_key("Slow EMA"));
    }

    #[test]
    fn plot_rows_align_with_bar_indices() {
        let dir = tempfile::tempdir().unwrap();
        let plot_path = dir.path().join("plot.csv");
        let stream = Arc::new(BarStream::prefilled(vec![
            bar(100, 1.0),
            bar(400, 2.0),
            bar(700, 3.0),
        ]));
        stream.finish();

        struct AlwaysPlot;
        impl Strategy for AlwaysPlot {
            fn on_bar(&mut self, env: &mut StepEnv) {
                let v = env.bar.close * 2.0;
                env.plot("Doubled", Some(v), PlotStyle::default());
            }
        }

        let mut runner = ScriptRunner::new(
            Box::new(AlwaysPlot),
            stream,
            syminfo(),
            AlertSink::default(),
            2,
            plot_path.clone(),
            "Test".into(),
        );
        runner.step_to_completion();
        runner.flush_plots();

        let content = std::fs::read_to_string(&plot_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "time,Doubled");
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with("400,"));
    }

    #[test]
    fn registry_resolves_demo_only() {
        assert!(resolve_strategy("demo").is_some());
        assert!(resolve_strategy("demo_1m").is_some());
        assert!(resolve_strategy("mystery").is_none());
    }

    #[test]
    fn title_extraction_variants() {
        let dir = tempfile::tempdir().unwrap();

        let positional = dir.path().join("a.py");
        std::fs::write(
            &positional,
            "@script.strategy(\"Simple Crossover Strategy\", overlay=True)\ndef main():\n    pass\n",
        )
        .unwrap();
        assert_eq!(extract_script_title(&positional), "Simple Crossover Strategy");

        let keyword = dir.path().join("b.py");
        std::fs::write(
            &keyword,
            "@script.indicator(overlay=True, title=\"My Indicator\")\n",
        )
        .unwrap();
        assert_eq!(extract_script_title(&keyword), "My Indicator");

        let missing = dir.path().join("ghost.py");
        assert_eq!(extract_script_title(&missing), "No title");

        let untitled = dir.path().join("c.py");
        std::fs::write(&untitled, "def main():\n    pass\n").unwrap();
        assert_eq!(extract_script_title(&untitled), "No title");
    }
}
