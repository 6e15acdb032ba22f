// =============================================================================
// File updater — reconciles live buffer, cache, and canonical file
// =============================================================================
//
// The central state machine of the data service. Startup brings the cache
// and canonical file up to date (backfill + tail refresh + export); the
// steady-state loop then applies three rules every poll:
//
//   Rule A — canonical file missing: full provider download (offloaded to a
//            blocking worker), populate the cache, stage the pending
//            post-download prerun event.
//   Rule B — pre-run window: half a timeframe into the in-progress bar,
//            refresh/repair the file's last open price and emit
//            `prerun_ready` (deduplicated per bar).
//   Rule C — rollover: three buffered bars mean the middle one confirmed;
//            rewrite the file tail with [confirmed, new] and emit
//            `run_ready`.
//
// The buffer mutex is only ever held for buffer inspection and the
// non-network file rewrite; provider and exchange calls happen outside it.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use crate::bar::Bar;
use crate::bus::{bar_pair_rows, BusMessage};
use crate::data_service::state::AppState;
use crate::exchange::provider::{download_history, download_range_to_file, resolve_history_since, write_symbol_info};
use crate::exchange::ExchangeClient;
use crate::ohlcv_file::{OhlcvReader, OhlcvWriter};

/// Poll period of the steady-state loop.
pub const POLL_INTERVAL_MS: u64 = 100;

// =============================================================================
// File helpers
// =============================================================================

/// Repair the file's last open price when it disagrees with the previous
/// close. Returns the corrected open (the previous close), or 0.0 when no
/// fix was needed or the file is too short to compare.
pub fn fix_last_open_if_needed(path: &Path) -> Result<f64> {
    let (need_fix, last, prev_close) = {
        let mut reader = OhlcvReader::open(path)?;
        if reader.size() < 2 {
            return Ok(0.0);
        }
        let last = reader.read(reader.size() - 1)?;
        let prev = reader.read(reader.size() - 2)?;
        (last.open != prev.close, last, prev.close)
    };

    if !need_fix {
        return Ok(0.0);
    }

    let mut writer = OhlcvWriter::open(path, false)?;
    writer.overwrite_at_ts(
        last.ts,
        &Bar {
            open: prev_close,
            ..last
        },
    )?;
    writer.flush()?;
    info!(ts = last.ts, open = prev_close, "last bar open price repaired");
    Ok(prev_close)
}

/// Write `[.., confirmed, new]` live bars (ts in ms) over the file tail:
/// seek to each bar's slot, truncate, write. When a bar overwrites the
/// record at the file's current end with a different open, the open already
/// in the file wins. Returns the total size growth in records.
pub fn apply_bar_updates(path: &Path, bars: &[Bar]) -> Result<i64> {
    let mut writer = OhlcvWriter::open(path, false)?;

    let (last_ts, last_open) = if writer.size() > 0 {
        let end_ts = writer.end_ts()?;
        let mut reader = OhlcvReader::open(path)?;
        let last = reader.read(reader.size() - 1)?;
        (end_ts, last.open)
    } else {
        (0, 0.0)
    };

    let mut incremented: i64 = 0;
    for bar in bars {
        let ts_sec = bar.ts / 1000;
        let open = if ts_sec == last_ts && bar.open != last_open {
            last_open
        } else {
            bar.open
        };
        let original_size = writer.size() as i64;
        writer.seek_to_ts(ts_sec)?;
        writer.truncate()?;
        writer.write(&Bar {
            ts: ts_sec,
            open,
            ..*bar
        })?;
        incremented += writer.size() as i64 - original_size;
    }
    writer.flush()?;
    Ok(incremented)
}

// =============================================================================
// FileUpdater
// =============================================================================

pub struct FileUpdater {
    app: Arc<AppState>,
    client: ExchangeClient,
    timeframe_ms: i64,
    pre_run_delay_ms: i64,
    history_since: String,

    // Start-of-history preserved from a deleted file (warm restart with an
    // empty `history_since`).
    preserved_since_ms: Option<i64>,

    history_download_complete: bool,
    first_fetch_after_download_done: bool,
    open_fix_done: bool,
    fixed_open_price: f64,
    prerun_sent_for_bar_ts: Option<i64>,
}

impl FileUpdater {
    pub fn new(app: Arc<AppState>) -> Self {
        let (exchange, timeframe, history_since) = {
            let config = app.config.read();
            (
                config.realtime.exchange.clone(),
                config.timeframe(),
                config.realtime.history_since.clone(),
            )
        };
        let timeframe_ms = timeframe.to_ms();
        Self {
            app,
            client: ExchangeClient::new(&exchange),
            timeframe_ms,
            pre_run_delay_ms: timeframe_ms / 2,
            history_since,
            preserved_since_ms: None,
            history_download_complete: false,
            first_fetch_after_download_done: false,
            open_fix_done: false,
            fixed_open_price: 0.0,
            prerun_sent_for_bar_ts: None,
        }
    }

    /// Run the updater until process shutdown.
    pub async fn run(mut self) {
        if let Err(e) = self.startup().await {
            error!(error = %e, "file updater startup failed — falling back to full download");
            // Clear the canonical files so Rule A takes over; a stale file
            // with history_download_complete unset would stall the pipeline.
            for path in [&self.app.ohlcv_path, &self.app.toml_path] {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
            }
        }

        let mut ticker = interval(Duration::from_millis(POLL_INTERVAL_MS));
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                warn!(error = %e, "file updater tick failed");
            }
        }
    }

    // ── Startup: cache-first reconstruction ─────────────────────────────

    async fn startup(&mut self) -> Result<()> {
        let key = self.app.symbol_key.clone();
        let timeframe = key.timeframe;

        if !self.app.cache.has_any(&key)? {
            // Nothing cached: preserve the old file's start for the
            // re-download window, then clear stale files for Rule A.
            if self.app.ohlcv_path.exists() && self.history_since.is_empty() {
                if let Ok(mut reader) = OhlcvReader::open(&self.app.ohlcv_path) {
                    if let Ok(start) = reader.start_ts() {
                        self.preserved_since_ms = Some(start * 1000);
                    }
                }
            }
            for path in [&self.app.ohlcv_path, &self.app.toml_path] {
                if path.exists() {
                    std::fs::remove_file(path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
            }
            info!("cache empty — full history download pending");
            return Ok(());
        }

        info!("cache has history — reconstructing canonical file");

        if !self.app.toml_path.exists() {
            let toml_key = key.clone();
            let toml_path = self.app.toml_path.clone();
            tokio::task::spawn_blocking(move || write_symbol_info(&toml_key, &toml_path))
                .await
                .context("symbol info worker panicked")??;
        }

        let now_ms = Utc::now().timestamp_millis();
        let desired_ms = resolve_history_since(&self.history_since, timeframe, now_ms);
        let desired_sec = desired_ms / 1000;

        // Backfill the head when the requested window reaches further back
        // than what the cache holds.
        if let Some(min_ts) = self.app.cache.min_ts(&key)? {
            if desired_sec < min_ts {
                info!(from = desired_sec, to = min_ts, "backfilling cache head");
                let cache = self.app.cache.clone();
                let dl_key = key.clone();
                let to_ms = min_ts * 1000;
                let result = tokio::task::spawn_blocking(move || {
                    cache.download_range_into_cache(&dl_key, |staged| {
                        download_range_to_file(&dl_key, desired_ms, to_ms, staged).map(|_| ())
                    })
                })
                .await
                .context("backfill worker panicked")?;
                if let Err(e) = result {
                    warn!(error = %e, "cache head backfill failed — continuing with what we have");
                }
            }
        }

        // Refresh the tail from one bar before the newest cached bar to now.
        if let Some(max_ts) = self.app.cache.max_ts(&key)? {
            let from_ms = (max_ts - timeframe.to_secs()) * 1000;
            let cache = self.app.cache.clone();
            let dl_key = key.clone();
            let result = tokio::task::spawn_blocking(move || {
                cache.download_range_into_cache(&dl_key, |staged| {
                    download_range_to_file(&dl_key, from_ms, Utc::now().timestamp_millis(), staged)
                        .map(|_| ())
                })
            })
            .await
            .context("tail refresh worker panicked")?;
            if let Err(e) = result {
                warn!(error = %e, "cache tail refresh failed — continuing with what we have");
            }
        }

        // Export cache -> canonical file, honouring a changed window start.
        let existing_start = if self.app.ohlcv_path.exists() {
            OhlcvReader::open(&self.app.ohlcv_path)
                .and_then(|mut r| r.start_ts())
                .ok()
        } else {
            None
        };
        let since = match existing_start {
            Some(start) if start != desired_sec => Some(desired_sec),
            None => Some(desired_sec),
            _ => None,
        };
        self.app
            .cache
            .export_to_file(&key, &self.app.ohlcv_path, since)?;

        self.history_download_complete = true;
        self.first_fetch_after_download_done = false;
        self.stage_post_download_event();
        Ok(())
    }

    // ── Steady-state tick ───────────────────────────────────────────────

    async fn tick(&mut self) -> Result<()> {
        // Rule A: file missing -> download. At most one lifecycle event per
        // tick, so each rule returns.
        if !self.app.ohlcv_path.exists() {
            return self.rule_a_download().await;
        }

        let bars = { self.app.state.lock().live_bars.clone() };
        let now_ms = Utc::now().timestamp_millis();

        // Rule B: pre-run open fix, half a timeframe into the new bar.
        if bars.len() == 2
            && !self.open_fix_done
            && now_ms >= bars[1].ts + self.pre_run_delay_ms
        {
            if !self.history_download_complete {
                return Ok(());
            }
            return self.rule_b_open_fix(&bars).await;
        }

        // Rule C: rollover.
        if bars.len() >= 3 {
            return self.rule_c_rollover();
        }

        Ok(())
    }

    async fn rule_a_download(&mut self) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let since_ms = self.preserved_since_ms.unwrap_or_else(|| {
            resolve_history_since(&self.history_since, self.app.symbol_key.timeframe, now_ms)
        });

        info!(since_ms, "canonical file missing — downloading full history");

        let key = self.app.symbol_key.clone();
        let ohlcv_path = self.app.ohlcv_path.clone();
        let toml_path = self.app.toml_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            download_history(&key, since_ms, &ohlcv_path, &toml_path)
        })
        .await
        .context("history download worker panicked")?;

        match result {
            Ok(written) => {
                info!(bars = written, "history download complete");

                let cache = self.app.cache.clone();
                let key = self.app.symbol_key.clone();
                let path = self.app.ohlcv_path.clone();
                tokio::task::spawn_blocking(move || cache.import_from_file(&key, &path))
                    .await
                    .context("cache import worker panicked")??;

                self.history_download_complete = true;
                self.first_fetch_after_download_done = false;
                self.fixed_open_price = 0.0;
                self.open_fix_done = false;
                self.prerun_sent_for_bar_ts = None;
                self.stage_post_download_event();
            }
            Err(e) => {
                warn!(error = %e, "history download failed — removing partial files, retrying");
                for path in [&self.app.ohlcv_path, &self.app.toml_path] {
                    if path.exists() {
                        let _ = std::fs::remove_file(path);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rule_b_open_fix(&mut self, bars: &[Bar]) -> Result<()> {
        if !self.first_fetch_after_download_done {
            // First pre-run after a download: the file tail may lag the live
            // feed, so refresh it from the exchange candle endpoint.
            if let Err(e) = self.refresh_tail_from_exchange().await {
                warn!(error = %e, "post-download tail refresh failed — continuing");
            }
            self.first_fetch_after_download_done = true;
        } else {
            let fixed = fix_last_open_if_needed(&self.app.ohlcv_path)?;
            if fixed > 0.0 {
                self.fixed_open_price = fixed;
                // Sync the corrected record into the cache.
                let mut reader = OhlcvReader::open(&self.app.ohlcv_path)?;
                let last = reader.read(reader.size() - 1)?;
                self.app.cache.upsert_batch(&self.app.symbol_key, &[last])?;
            }
        }
        self.open_fix_done = true;

        let mut confirmed = bars[0];
        let new = bars[1];
        if self.fixed_open_price > 0.0 {
            confirmed.open = self.fixed_open_price;
        }

        // One prerun_ready per in-progress bar.
        if self.prerun_sent_for_bar_ts != Some(new.ts) {
            self.prerun_sent_for_bar_ts = Some(new.ts);
            self.app.broadcast(&BusMessage::PrerunReady {
                ohlcv_path: self.app.ohlcv_path.display().to_string(),
                toml_path: self.app.toml_path.display().to_string(),
                confirmed_bar_and_new_bar: bar_pair_rows(&confirmed, &new),
            });
            info!(bar_ts = new.ts, "prerun_ready emitted");
        }
        Ok(())
    }

    /// Exchange candle fetch from one bar before the file's end, overwriting
    /// the file suffix and upserting the same rows into the cache.
    async fn refresh_tail_from_exchange(&mut self) -> Result<()> {
        let since_ms = {
            let mut reader = OhlcvReader::open(&self.app.ohlcv_path)?;
            let end_ts = reader.end_ts()?;
            let interval = reader.interval()?.max(self.timeframe_ms / 1000);
            (end_ts - interval) * 1000
        };

        let (symbol, timeframe) = (
            self.app.symbol_key.symbol.clone(),
            self.app.symbol_key.timeframe,
        );
        let fetched = self
            .client
            .fetch_ohlcv(&symbol, timeframe, Some(since_ms), 1000)
            .await?;
        if fetched.is_empty() {
            warn!("exchange returned no candles for tail refresh");
            return Ok(());
        }

        apply_bar_updates(&self.app.ohlcv_path, &fetched)?;
        let seconds: Vec<Bar> = fetched
            .iter()
            .map(|b| Bar {
                ts: b.ts / 1000,
                ..*b
            })
            .collect();
        self.app
            .cache
            .upsert_batch(&self.app.symbol_key, &seconds)?;
        info!(bars = fetched.len(), "file tail refreshed from exchange");
        Ok(())
    }

    fn rule_c_rollover(&mut self) -> Result<()> {
        // Trim the buffer to [confirmed, new] under the lock; the write
        // below works from the snapshot.
        let pair = {
            let mut state = self.app.state.lock();
            if state.live_bars.len() < 3 {
                return Ok(());
            }
            let n = state.live_bars.len();
            let pair: Vec<Bar> = state.live_bars[n - 2..].to_vec();
            state.live_bars = pair.clone();
            pair
        };

        if !self.history_download_complete {
            return Ok(());
        }

        let mut confirmed = pair[0];
        let new = pair[1];
        if self.fixed_open_price > 0.0 {
            confirmed.open = self.fixed_open_price;
        }

        let incremented = apply_bar_updates(&self.app.ohlcv_path, &[confirmed, new])?;
        if incremented > 0 {
            let seconds: Vec<Bar> = [confirmed, new]
                .iter()
                .map(|b| Bar {
                    ts: b.ts / 1000,
                    ..*b
                })
                .collect();
            self.app
                .cache
                .upsert_batch(&self.app.symbol_key, &seconds)?;

            self.app.broadcast(&BusMessage::RunReady {
                ohlcv_path: self.app.ohlcv_path.display().to_string(),
                toml_path: self.app.toml_path.display().to_string(),
                confirmed_bar_and_new_bar: bar_pair_rows(&confirmed, &new),
            });
            info!(confirmed_ts = confirmed.ts, new_ts = new.ts, "run_ready emitted");
        } else {
            warn!(
                confirmed_ts = confirmed.ts,
                new_ts = new.ts,
                "rollover produced no file growth — run_ready suppressed"
            );
        }

        self.fixed_open_price = 0.0;
        self.open_fix_done = false;
        self.prerun_sent_for_bar_ts = None;
        Ok(())
    }

    fn stage_post_download_event(&self) {
        let event = BusMessage::PrerunReadyAfterHistoryDownload {
            ohlcv_path: self.app.ohlcv_path.display().to_string(),
            toml_path: self.app.toml_path.display().to_string(),
        };
        // Staged for the next subscriber *and* broadcast to anyone already
        // attached; the runner ACK clears the staged copy.
        self.app.stage_pending_prerun(event.clone());
        self.app.broadcast(&event);
        info!("post-download prerun event staged");
    }
}
