// =============================================================================
// Gap fixer — keeps the in-progress bar index advancing through quiet tape
// =============================================================================
//
// Downstream consumers assume monotone bar production; a boundary with no
// trades would otherwise stall strategy execution indefinitely. Every poll
// the fixer compares exchange server time against the buffer tail and, past
// the grace window, appends a flat synthetic bar at the expected open time.
// =============================================================================

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::bar::Bar;
use crate::bus::{BarData, BusMessage};
use crate::data_service::state::{AppState, DataState};
use crate::exchange::ExchangeClient;

/// Poll period.
pub const POLL_INTERVAL_MS: u64 = 100;
/// How long past the expected boundary before a fill bar is inserted.
pub const GRACE_MS: i64 = 200;

/// Append a synthetic fill bar if the expected boundary has passed without
/// a bar appearing. Idempotent per expected timestamp via `last_fix_bar_ts`.
pub fn maybe_fill_gap(state: &mut DataState, now_ms: i64, timeframe_ms: i64) -> Option<Bar> {
    if state.live_bars.len() < 2 {
        return None;
    }

    let last = *state.live_bars.last().expect("len checked");
    let expected = last.ts + timeframe_ms;

    if now_ms < expected + GRACE_MS {
        return None;
    }
    if state.live_bars.iter().any(|b| b.ts == expected) {
        return None;
    }
    if state.last_fix_bar_ts == Some(expected) {
        return None;
    }

    let fill = Bar::fill(expected, last.close);
    state.live_bars.push(fill);
    state.last_fix_bar_ts = Some(expected);
    Some(fill)
}

/// Run the gap fixer until process shutdown. Server-time fetch failures
/// rebuild the REST client and fall back to the local clock for that tick.
pub async fn gap_fixer_loop(app: Arc<AppState>) {
    let (exchange, timeframe_ms) = {
        let config = app.config.read();
        (config.realtime.exchange.clone(), config.timeframe().to_ms())
    };

    info!(exchange = %exchange, "gap fixer starting");
    let mut client = ExchangeClient::new(&exchange);
    let mut ticker = interval(Duration::from_millis(POLL_INTERVAL_MS));

    loop {
        ticker.tick().await;

        let now_ms = match client.fetch_time().await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(error = %e, "server time fetch failed — rebuilding client, using local clock");
                client = ExchangeClient::new(&exchange);
                chrono::Utc::now().timestamp_millis()
            }
        };

        let filled = {
            let mut state = app.state.lock();
            maybe_fill_gap(&mut state, now_ms, timeframe_ms)
        };

        if let Some(bar) = filled {
            debug!(ts = bar.ts, close = bar.close, "synthetic fill bar appended");
            app.broadcast(&BusMessage::Bar {
                data: BarData::from_live(&bar),
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::FILL_BAR_VOLUME;

    const TF: i64 = 300_000;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar::new(ts, close, close + 1.0, close - 1.0, close, 5.0)
    }

    fn seeded() -> DataState {
        DataState {
            live_bars: vec![bar(0, 100.0), bar(TF, 101.0)],
            ..Default::default()
        }
    }

    #[test]
    fn fills_after_grace_window() {
        let mut state = seeded();
        let expected = 2 * TF;

        // Just before the grace boundary: nothing.
        assert!(maybe_fill_gap(&mut state, expected + GRACE_MS - 1, TF).is_none());

        // At the grace boundary: a flat fill bar at prev close.
        let fill = maybe_fill_gap(&mut state, expected + GRACE_MS, TF).unwrap();
        assert_eq!(fill.ts, expected);
        assert_eq!(fill.open, 101.0);
        assert_eq!(fill.close, 101.0);
        assert_eq!(fill.volume, FILL_BAR_VOLUME);
        assert!(fill.is_fill());
        assert_eq!(state.live_bars.len(), 3);
    }

    #[test]
    fn never_fills_the_same_boundary_twice() {
        let mut state = seeded();
        let now = 2 * TF + GRACE_MS;
        assert!(maybe_fill_gap(&mut state, now, TF).is_some());

        // Remove the fill (as the file updater's rollover would) and poll
        // again at the same wall time: the guard must hold.
        state.live_bars.pop();
        assert!(maybe_fill_gap(&mut state, now, TF).is_none());
        assert_eq!(state.last_fix_bar_ts, Some(2 * TF));
    }

    #[test]
    fn existing_bar_at_expected_ts_suppresses_fill() {
        let mut state = seeded();
        state.live_bars.push(bar(2 * TF, 102.0));
        assert!(maybe_fill_gap(&mut state, 3 * TF + GRACE_MS - 1, TF).is_none());
    }

    #[test]
    fn short_buffer_never_fills() {
        let mut state = DataState {
            live_bars: vec![bar(0, 100.0)],
            ..Default::default()
        };
        assert!(maybe_fill_gap(&mut state, 10 * TF, TF).is_none());
    }

    #[test]
    fn consecutive_boundaries_fill_one_per_poll() {
        let mut state = seeded();
        let fill1 = maybe_fill_gap(&mut state, 2 * TF + GRACE_MS, TF).unwrap();
        assert_eq!(fill1.ts, 2 * TF);

        // Next boundary later on: a new fill extends from the previous fill.
        let fill2 = maybe_fill_gap(&mut state, 3 * TF + GRACE_MS, TF).unwrap();
        assert_eq!(fill2.ts, 3 * TF);
        assert_eq!(fill2.open, fill1.close);
    }
}
