// =============================================================================
// Bar model — live bars, trades, and trade-to-bar aggregation
// =============================================================================
//
// Live-path bars carry millisecond timestamps and f64 prices; the canonical
// file narrows to seconds and f32 (see ohlcv_file.rs). `narrowed()` applies
// the same f32 rounding to a live bar so that pre-run history and realtime
// bars agree bit-for-bit.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Volume assigned to synthetic fill bars inserted by the gap fixer. Tests
/// and consumers recognize fill bars by this sentinel.
pub const FILL_BAR_VOLUME: f64 = 0.01;

/// A single OHLCV bar. `ts` is the bar's open time in **milliseconds** on
/// every live path; the file layer converts to seconds at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(ts: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            ts,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A synthetic fill bar: flat at `prev_close` with the sentinel volume.
    pub fn fill(ts: i64, prev_close: f64) -> Self {
        Self::new(ts, prev_close, prev_close, prev_close, prev_close, FILL_BAR_VOLUME)
    }

    /// True when this bar was inserted by the gap fixer.
    pub fn is_fill(&self) -> bool {
        self.volume == FILL_BAR_VOLUME && self.open == self.close && self.high == self.low
    }

    /// Narrow every price field through f32, so a live bar matches the value
    /// a round-trip through the canonical file would produce.
    pub fn narrowed(&self) -> Self {
        Self {
            ts: self.ts,
            open: self.open as f32 as f64,
            high: self.high as f32 as f64,
            low: self.low as f32 as f64,
            close: self.close as f32 as f64,
            volume: self.volume as f32 as f64,
        }
    }

    /// Wire representation: `[ts_ms, open, high, low, close, volume]`.
    pub fn to_row(&self) -> [f64; 6] {
        [
            self.ts as f64,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        ]
    }

    pub fn from_row(row: &[f64; 6]) -> Self {
        Self::new(row[0] as i64, row[1], row[2], row[3], row[4], row[5])
    }
}

/// A single exchange trade tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trade {
    /// Trade time in milliseconds.
    pub ts: i64,
    pub price: f64,
    pub amount: f64,
}

/// Fold a slice of trades into OHLCV bars for `timeframe_ms`.
///
/// Each trade lands in the bar whose open time is its timestamp floored to
/// the timeframe boundary. Trades older than `since_ms` are skipped. Input
/// order is preserved within a bar (the first trade sets the open, the last
/// sets the close); output bars are sorted by open time.
pub fn build_ohlcv(trades: &[Trade], timeframe_ms: i64, since_ms: i64) -> Vec<Bar> {
    let mut bars: Vec<Bar> = Vec::new();

    for trade in trades {
        if trade.ts < since_ms {
            continue;
        }
        let bucket = trade.ts - trade.ts.rem_euclid(timeframe_ms);

        match bars.iter_mut().find(|b| b.ts == bucket) {
            Some(bar) => {
                bar.high = bar.high.max(trade.price);
                bar.low = bar.low.min(trade.price);
                bar.close = trade.price;
                bar.volume += trade.amount;
            }
            None => {
                bars.push(Bar::new(
                    bucket,
                    trade.price,
                    trade.price,
                    trade.price,
                    trade.price,
                    trade.amount,
                ));
            }
        }
    }

    bars.sort_by_key(|b| b.ts);
    bars
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const TF: i64 = 60_000;

    fn t(ts: i64, price: f64, amount: f64) -> Trade {
        Trade { ts, price, amount }
    }

    #[test]
    fn single_bucket_aggregation() {
        let trades = [t(1_000, 100.0, 1.0), t(20_000, 105.0, 2.0), t(59_000, 99.0, 0.5)];
        let bars = build_ohlcv(&trades, TF, 0);
        assert_eq!(bars.len(), 1);
        let b = bars[0];
        assert_eq!(b.ts, 0);
        assert_eq!(b.open, 100.0);
        assert_eq!(b.high, 105.0);
        assert_eq!(b.low, 99.0);
        assert_eq!(b.close, 99.0);
        assert!((b.volume - 3.5).abs() < 1e-12);
    }

    #[test]
    fn buckets_align_to_timeframe_boundary() {
        let trades = [t(61_000, 10.0, 1.0), t(125_000, 11.0, 1.0), t(179_999, 12.0, 1.0)];
        let bars = build_ohlcv(&trades, TF, 0);
        assert_eq!(bars.iter().map(|b| b.ts).collect::<Vec<_>>(), vec![60_000, 120_000]);
        for b in &bars {
            assert_eq!(b.ts % TF, 0);
        }
    }

    #[test]
    fn since_filters_old_trades() {
        let trades = [t(1_000, 10.0, 1.0), t(61_000, 11.0, 1.0)];
        let bars = build_ohlcv(&trades, TF, 60_000);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].ts, 60_000);
    }

    #[test]
    fn fill_bar_is_recognizable() {
        let fill = Bar::fill(120_000, 42.5);
        assert!(fill.is_fill());
        assert_eq!(fill.open, 42.5);
        assert_eq!(fill.close, 42.5);
        assert_eq!(fill.volume, FILL_BAR_VOLUME);

        let real = Bar::new(120_000, 42.5, 43.0, 42.0, 42.8, 10.0);
        assert!(!real.is_fill());
    }

    #[test]
    fn narrowing_matches_f32_precision() {
        let b = Bar::new(0, 0.1234567890123, 1.1, 0.9, 1.0, 2.0).narrowed();
        assert_eq!(b.open, 0.1234567890123_f32 as f64);
    }

    #[test]
    fn row_round_trip() {
        let b = Bar::new(1_700_000_000_000, 1.0, 2.0, 0.5, 1.5, 10.0);
        assert_eq!(Bar::from_row(&b.to_row()), b);
    }
}
