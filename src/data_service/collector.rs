// =============================================================================
// Trade collector — folds the live tick stream into the bar buffer
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::bar::{build_ohlcv, Bar, Trade};
use crate::bus::{BarData, BusMessage};
use crate::data_service::state::{AppState, DataState};
use crate::exchange::stream::run_trade_stream;

/// Fold a batch of trades into the live buffer.
///
/// `since_ms` is the aggregation epoch: the first observed trade timestamp
/// rounded down to the timeframe boundary. Produced bars either refine the
/// in-progress tail (same open time) or are appended; on append, trades
/// older than the new bar are discarded to bound memory.
///
/// Returns the bar to publish, if the buffer changed.
pub fn apply_trades(
    state: &mut DataState,
    batch: &[Trade],
    timeframe_ms: i64,
    since_ms: i64,
) -> Option<Bar> {
    state.collected_trades.extend_from_slice(batch);
    let generated = build_ohlcv(&state.collected_trades, timeframe_ms, since_ms);

    let mut bar_to_push = None;
    for bar in generated {
        let last_ts = state.live_bars.last().map(|b| b.ts).unwrap_or(0);
        if bar.ts == last_ts {
            *state.live_bars.last_mut().expect("non-empty when ts matches") = bar;
            bar_to_push = Some(bar);
        } else if bar.ts > last_ts {
            state.live_bars.push(bar);
            state.collected_trades.retain(|t| t.ts >= bar.ts);
            bar_to_push = Some(bar);
        }
    }
    bar_to_push
}

/// Run the trade collector until process shutdown. The exchange client is
/// torn down and recreated on every stream failure; nothing escapes.
pub async fn collector_loop(app: Arc<AppState>) {
    let (exchange, symbol, timeframe_ms) = {
        let config = app.config.read();
        (
            config.realtime.exchange.clone(),
            config.realtime.symbol.clone(),
            config.timeframe().to_ms(),
        )
    };

    info!(exchange = %exchange, symbol = %symbol, "trade collector starting");

    loop {
        let (tx, mut rx) = mpsc::unbounded_channel::<Trade>();

        let stream_exchange = exchange.clone();
        let stream_symbol = symbol.clone();
        let stream_task = tokio::spawn(async move {
            run_trade_stream(&stream_exchange, &stream_symbol, &tx).await
        });

        // Aggregation epoch: first trade of this connection, floored.
        let mut since_ms: Option<i64> = None;

        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(more) = rx.try_recv() {
                batch.push(more);
            }

            let epoch =
                *since_ms.get_or_insert_with(|| first.ts - first.ts.rem_euclid(timeframe_ms));

            let bar_to_push = {
                let mut state = app.state.lock();
                apply_trades(&mut state, &batch, timeframe_ms, epoch)
            };

            if let Some(bar) = bar_to_push {
                app.broadcast(&BusMessage::Bar {
                    data: BarData::from_live(&bar),
                });
            }
        }

        match stream_task.await {
            Ok(Ok(())) => info!(symbol = %symbol, "trade stream ended — reconnecting"),
            Ok(Err(e)) => error!(symbol = %symbol, error = %e, "trade stream error — reconnecting"),
            Err(e) => error!(symbol = %symbol, error = %e, "trade stream task panicked — reconnecting"),
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const TF: i64 = 300_000;

    fn t(ts: i64, price: f64) -> Trade {
        Trade {
            ts,
            price,
            amount: 1.0,
        }
    }

    #[test]
    fn first_batch_seeds_the_buffer() {
        let mut state = DataState::default();
        let pushed = apply_trades(&mut state, &[t(10_000, 100.0)], TF, 0);
        assert_eq!(state.live_bars.len(), 1);
        assert_eq!(pushed.unwrap().ts, 0);
    }

    #[test]
    fn same_bucket_refines_in_progress_bar() {
        let mut state = DataState::default();
        apply_trades(&mut state, &[t(10_000, 100.0)], TF, 0);
        let pushed = apply_trades(&mut state, &[t(20_000, 105.0)], TF, 0);

        assert_eq!(state.live_bars.len(), 1);
        let bar = pushed.unwrap();
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.close, 105.0);
        assert!((bar.volume - 2.0).abs() < 1e-12);
    }

    #[test]
    fn boundary_cross_appends_and_discards_old_trades() {
        let mut state = DataState::default();
        apply_trades(&mut state, &[t(10_000, 100.0), t(20_000, 101.0)], TF, 0);
        let pushed = apply_trades(&mut state, &[t(TF + 1_000, 102.0)], TF, 0);

        assert_eq!(state.live_bars.len(), 2);
        assert_eq!(pushed.unwrap().ts, TF);
        // Old trades were discarded at the rollover.
        assert!(state.collected_trades.iter().all(|t| t.ts >= TF));
    }

    #[test]
    fn stale_bucket_is_ignored() {
        let mut state = DataState::default();
        apply_trades(&mut state, &[t(TF + 1_000, 102.0)], TF, TF);
        let before = state.live_bars.clone();

        // A trade older than the epoch cannot produce a bar.
        let pushed = apply_trades(&mut state, &[t(1_000, 50.0)], TF, TF);
        assert!(pushed.is_none() || pushed.unwrap().ts >= TF);
        assert_eq!(state.live_bars, before);
    }

    #[test]
    fn monotone_buffer_order_is_preserved() {
        let mut state = DataState::default();
        for i in 0..4 {
            apply_trades(&mut state, &[t(i * TF + 5_000, 100.0 + i as f64)], TF, 0);
        }
        let ts: Vec<i64> = state.live_bars.iter().map(|b| b.ts).collect();
        assert_eq!(ts, vec![0, TF, 2 * TF, 3 * TF]);
    }
}
