// =============================================================================
// Runner orchestrator — lifecycle events in, strategy outputs out
// =============================================================================
//
// Dials the data service's bus, keeps the connection alive with a 15 s ping,
// and reacts to the three lifecycle events:
//
//   prerun_ready_after_history_download  ACK, full replay incl. the
//                                        in-progress bar, then destroy.
//   prerun_ready                         replay history, retain the Run
//                                        Context for the coming rollover.
//   run_ready                            feed [confirmed, new] into the
//                                        retained context, step, destroy.
//
// A Run Context is never reused across events. Strategy stepping happens on
// a blocking worker so the bus loop stays responsive.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bar::Bar;
use crate::bus::{decode_frame, BusMessage, Frame};
use crate::config::{RealtimeConfig, Workdir};
use crate::ohlcv_file::OhlcvReader;
use crate::paths::{plot_path, script_hash_path};
use crate::runner_service::strategy::{
    extract_script_title, resolve_strategy, ScriptRunner,
};
use crate::runner_service::stream::BarStream;
use crate::script_hash::{compute_script_hashes, load_script_hashes, write_script_hashes};
use crate::exchange::SymInfo;
use crate::webhook::AlertSink;

/// Keepalive period for the bus connection.
const KEEPALIVE_SECS: u64 = 15;
/// Reconnect backoff after a failed or dropped connection.
const RECONNECT_SECS: u64 = 1;

/// 1 when the new bar lands exactly one timeframe after the previous new
/// bar, 0 for an out-of-schedule update (which must not advance strategy
/// state).
pub fn incremented_size(new_ts_sec: i64, last_new_bar_ts_sec: i64, timeframe_ms: i64) -> i64 {
    let interval_ms = (new_ts_sec - last_new_bar_ts_sec) * 1000;
    if interval_ms == timeframe_ms {
        1
    } else {
        0
    }
}

/// Narrow a live wire bar (ts in ms, f64) to file precision (ts in seconds,
/// f32 values) so realtime steps see exactly what a file round-trip yields.
pub fn wire_bar_to_file(bar: &Bar) -> Bar {
    let narrowed = bar.narrowed();
    Bar {
        ts: bar.ts / 1000,
        ..narrowed
    }
}

// =============================================================================
// Run context
// =============================================================================

/// Everything owned by one pre-run awaiting its rollover.
struct RunCtx {
    runner: ScriptRunner,
    last_new_bar_ts_sec: i64,
}

// =============================================================================
// RunnerService
// =============================================================================

pub struct RunnerService {
    config: RealtimeConfig,
    script_path: PathBuf,
    hash_path: PathBuf,
    plot_path: PathBuf,
    timeframe_ms: i64,
    ctx: Option<RunCtx>,
}

impl RunnerService {
    /// Construct and validate. A missing script file is a fatal
    /// configuration error.
    pub fn new(config: RealtimeConfig, workdir: &Workdir) -> Result<Self> {
        let script_name = config.realtime.script_name.clone();
        if script_name.is_empty() {
            bail!("script_name is empty in realtime_trade.toml");
        }
        let script_path = workdir.scripts_dir.join(&script_name);
        if !script_path.exists() {
            bail!("script not found: {}", script_path.display());
        }

        let timeframe_ms = config.timeframe().to_ms();
        Ok(Self {
            hash_path: script_hash_path(&script_path),
            plot_path: plot_path(workdir, &script_name),
            script_path,
            timeframe_ms,
            config,
            ctx: None,
        })
    }

    /// Dial-and-serve forever, reconnecting with backoff.
    pub async fn run(mut self) {
        let url = self.config.bus_url();
        loop {
            match connect_async(&url).await {
                Ok((ws, _)) => {
                    info!(url = %url, "bus connected");
                    if let Err(e) = self.session(ws).await {
                        warn!(error = %e, "bus session ended");
                    }
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "bus connect failed");
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_SECS)).await;
        }
    }

    /// One connected session: greeting, hash check, then the receive loop.
    async fn session(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Result<()> {
        let (mut sink, mut stream) = ws.split();

        // All outbound traffic funnels through one writer task.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let keepalive_tx = out_tx.clone();
        let keepalive = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(KEEPALIVE_SECS));
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                if keepalive_tx.send(Message::Text("ping".into())).is_err() {
                    return;
                }
            }
        });

        // Greeting: script title, then the connect-time change check.
        self.send(&out_tx, &BusMessage::ScriptInfo {
            title: extract_script_title(&self.script_path),
        });
        self.check_script_hashes(&out_tx, false);

        let result = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Frame::Messages(messages) = decode_frame(&text) {
                        for message in messages {
                            if let Err(e) = self.handle_message(message, &out_tx).await {
                                warn!(error = %e, "lifecycle handler failed");
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(anyhow::Error::from(e)),
            }
        };

        keepalive.abort();
        writer.abort();
        result
    }

    fn send(&self, out: &UnboundedSender<Message>, message: &BusMessage) {
        let _ = out.send(Message::Text(message.encode()));
    }

    /// Compare current and persisted script hashes. On mismatch, notify the
    /// data service (`reset_history` at connect, `script_modified` inside
    /// the prerun handler) and persist the new hashes. Never fails.
    fn check_script_hashes(&mut self, out: &UnboundedSender<Message>, in_prerun: bool) {
        let current = compute_script_hashes(&self.script_path);
        let previous = load_script_hashes(&self.hash_path);
        if current == previous {
            return;
        }

        info!("script change detected");
        let notice = if in_prerun {
            BusMessage::ScriptModified
        } else {
            BusMessage::ResetHistory
        };
        self.send(out, &notice);
        self.ctx = None;
        if let Err(e) = write_script_hashes(&self.hash_path, &current) {
            warn!(error = %e, "failed to persist script hashes");
        }
    }

    async fn handle_message(
        &mut self,
        message: BusMessage,
        out: &UnboundedSender<Message>,
    ) -> Result<()> {
        match message {
            BusMessage::PrerunReadyAfterHistoryDownload { .. }
            | BusMessage::PrerunReady { .. } => self.handle_prerun(message, out).await,
            BusMessage::RunReady { .. } => self.handle_run_ready(message, out).await,
            _ => Ok(()),
        }
    }

    // ── Pre-run ─────────────────────────────────────────────────────────

    async fn handle_prerun(
        &mut self,
        message: BusMessage,
        out: &UnboundedSender<Message>,
    ) -> Result<()> {
        let after_download =
            matches!(message, BusMessage::PrerunReadyAfterHistoryDownload { .. });
        if after_download {
            // ACK immediately so the data service clears its pending slot.
            self.send(out, &BusMessage::AckPrerunReadyAfterHistoryDownload);
        }

        let (ohlcv_path, toml_path) = match &message {
            BusMessage::PrerunReadyAfterHistoryDownload {
                ohlcv_path,
                toml_path,
            }
            | BusMessage::PrerunReady {
                ohlcv_path,
                toml_path,
                ..
            } => (PathBuf::from(ohlcv_path), PathBuf::from(toml_path)),
            _ => unreachable!("caller matched the variant"),
        };

        if !ohlcv_path.exists() || !toml_path.exists() {
            warn!(
                ohlcv = %ohlcv_path.display(),
                toml = %toml_path.display(),
                "prerun event received but files are missing"
            );
            return Ok(());
        }

        // Duplicate prerun for the same window: the live context wins.
        if self.ctx.is_some() {
            debug!("prerun event ignored — a run context is already live");
            return Ok(());
        }

        // Safety re-check inside the handler.
        self.check_script_hashes(out, true);

        let (runner, effective_size) = self.prepare_runner(&ohlcv_path, &toml_path)?;

        // Replay history: effective - 1 steps observe confirmed bars; the
        // post-download path takes one extra step to observe the in-progress
        // bar as well.
        let mut runner = runner;
        runner.pre_run = true;
        let mut runner = tokio::task::spawn_blocking(move || {
            runner.step_n(effective_size - 1);
            if after_download {
                runner.pre_run = false;
                runner.step_n(1);
            }
            runner.flush_plots();
            runner
        })
        .await
        .context("prerun worker panicked")?;

        info!(
            steps = runner.bar_index() + 1,
            after_download, "pre-run complete"
        );

        self.send(out, &BusMessage::ScriptInfo {
            title: runner.title().to_string(),
        });
        self.send(out, &BusMessage::LastBarOpenFix {
            last_bar_index: Some(runner.last_bar_index),
            data: None,
        });
        self.flush_outputs(out, &mut runner);

        if after_download {
            // One-shot replay: tear the context down immediately.
            runner.stream().finish();
            return Ok(());
        }

        let last_new_bar_ts_sec = match message.bar_pair() {
            Some((_, new)) => new.ts / 1000,
            None => OhlcvReader::open(&ohlcv_path)?.end_ts()?,
        };
        self.ctx = Some(RunCtx {
            runner,
            last_new_bar_ts_sec,
        });
        Ok(())
    }

    /// Read the canonical file, count gap sentinels, and build the runner
    /// with its prefilled stream.
    fn prepare_runner(
        &self,
        ohlcv_path: &Path,
        toml_path: &Path,
    ) -> Result<(ScriptRunner, i64)> {
        let syminfo = SymInfo::load(toml_path)?;

        let mut reader = OhlcvReader::open(ohlcv_path)?;
        let bars = reader.read_all()?;
        let gaps = bars.iter().filter(|b| b.volume < 0.0).count();
        let effective_size = (bars.len() - gaps) as i64;
        if effective_size < 2 {
            bail!("bar file too short for a pre-run ({effective_size} bars)");
        }

        let stem = self
            .script_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let strategy = resolve_strategy(&stem)
            .with_context(|| format!("no strategy registered for script '{stem}'"))?;

        let runner = ScriptRunner::new(
            strategy,
            Arc::new(BarStream::prefilled(bars)),
            syminfo,
            AlertSink::from_config(&self.config.webhook),
            effective_size - 1,
            self.plot_path.clone(),
            extract_script_title(&self.script_path),
        );
        Ok((runner, effective_size))
    }

    // ── Run step ────────────────────────────────────────────────────────

    async fn handle_run_ready(
        &mut self,
        message: BusMessage,
        out: &UnboundedSender<Message>,
    ) -> Result<()> {
        // The context is destroyed unconditionally at the end of this
        // handler; `take` makes that structural.
        let Some(mut ctx) = self.ctx.take() else {
            debug!("run_ready without a live run context — ignored");
            return Ok(());
        };

        let Some((confirmed, new)) = message.bar_pair() else {
            warn!("run_ready carried a malformed bar pair");
            return Ok(());
        };
        let confirmed = wire_bar_to_file(&confirmed);
        let new = wire_bar_to_file(&new);

        // The stream's tail is the bar the pre-run left in progress:
        // swap in its confirmed form and extend with the new bar.
        ctx.runner.stream().replace_last(confirmed);
        ctx.runner.stream().append(new);
        ctx.runner.stream().finish();

        if incremented_size(new.ts, ctx.last_new_bar_ts_sec, self.timeframe_ms) == 0 {
            warn!(
                new_ts = new.ts,
                last_new_ts = ctx.last_new_bar_ts_sec,
                "out-of-schedule run_ready — strategy not advanced"
            );
            return Ok(());
        }

        ctx.runner.last_bar_index += 1;
        ctx.runner.pre_run = false;

        let mut runner = ctx.runner;
        let mut runner = tokio::task::spawn_blocking(move || {
            runner.step_to_completion();
            runner.flush_plots();
            runner
        })
        .await
        .context("run-step worker panicked")?;

        info!(
            last_bar_index = runner.last_bar_index,
            "confirmed bar evaluated"
        );
        self.flush_outputs(out, &mut runner);
        Ok(())
    }

    /// Send queued trade, plotchar, and plot-option outputs to the data
    /// service.
    fn flush_outputs(&self, out: &UnboundedSender<Message>, runner: &mut ScriptRunner) {
        let outputs = runner.take_outputs();
        if !outputs.trade_events.is_empty() {
            let _ = out.send(Message::Text(BusMessage::encode_batch(
                &outputs.trade_events,
            )));
        }
        if !outputs.plotchar_events.is_empty() {
            let _ = out.send(Message::Text(BusMessage::encode_batch(
                &outputs.plotchar_events,
            )));
        }
        if !outputs.plot_options.is_empty() {
            self.send(out, &BusMessage::PlotOptions {
                data: outputs.plot_options,
                confirmed_bar_index: runner.last_bar_index - 1,
            });
        }
    }
}
