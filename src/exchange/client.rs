// =============================================================================
// Exchange REST client — public market-data endpoints only
// =============================================================================
//
// Everything the realtime loops need from the exchange REST surface: server
// time (gap fixer) and klines (open-fix tail refresh). No signed endpoints,
// no order flow. The long-running history downloads live in provider.rs.
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::bar::Bar;
use crate::exchange::{native_symbol, rest_base_url};
use crate::timeframe::Timeframe;

/// Thin reqwest wrapper over the exchange's public REST API. Cheap to
/// rebuild: failure-handling loops drop the client and construct a new one.
#[derive(Clone)]
pub struct ExchangeClient {
    base_url: String,
    client: reqwest::Client,
}

impl ExchangeClient {
    pub fn new(exchange: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: rest_base_url(exchange).to_string(),
            client,
        }
    }

    /// GET /api/v3/time — exchange server time in milliseconds.
    pub async fn fetch_time(&self) -> Result<i64> {
        let url = format!("{}/api/v3/time", self.base_url);
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/time request failed")?
            .json()
            .await
            .context("failed to parse server time response")?;
        body["serverTime"]
            .as_i64()
            .context("server time response missing serverTime")
    }

    /// GET /api/v3/klines — closed and in-progress candles for `symbol`.
    ///
    /// Returns bars with **millisecond** open times, the unit this endpoint
    /// speaks natively.
    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Bar>> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            native_symbol(symbol),
            timeframe,
            limit
        );
        if let Some(since) = since_ms {
            url.push_str(&format!("&startTime={since}"));
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("exchange GET /api/v3/klines returned {status}: {body}");
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            match parse_kline_row(entry) {
                Ok(bar) => bars.push(bar),
                Err(e) => warn!(error = %e, "skipping malformed kline entry"),
            }
        }

        debug!(symbol, count = bars.len(), "klines fetched");
        Ok(bars)
    }

}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Parse one kline array entry into a bar (ts in ms).
///
/// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
/// [5] volume — the remaining fields are not used here.
pub(crate) fn parse_kline_row(entry: &serde_json::Value) -> Result<Bar> {
    let arr = entry.as_array().context("kline entry is not an array")?;
    if arr.len() < 6 {
        anyhow::bail!("kline entry has {} elements, expected >= 6", arr.len());
    }
    Ok(Bar {
        ts: arr[0].as_i64().context("kline openTime is not an integer")?,
        open: parse_str_f64(&arr[1])?,
        high: parse_str_f64(&arr[2])?,
        low: parse_str_f64(&arr[3])?,
        close: parse_str_f64(&arr[4])?,
        volume: parse_str_f64(&arr[5])?,
    })
}

/// Parse a JSON value that may be either a string or a number into `f64`.
/// The exchange sends numeric candle fields as JSON strings.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kline_row_string_fields() {
        let entry = serde_json::json!([
            1700000000000_i64,
            "37000.00",
            "37050.00",
            "36990.00",
            "37020.00",
            "123.456",
            1700000299999_i64,
            "4567890.12",
            1500,
            "60.1",
            "2224455.6",
            "0"
        ]);
        let bar = parse_kline_row(&entry).unwrap();
        assert_eq!(bar.ts, 1_700_000_000_000);
        assert!((bar.close - 37020.0).abs() < f64::EPSILON);
        assert!((bar.volume - 123.456).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_kline_row_rejects_short_entries() {
        let entry = serde_json::json!([1700000000000_i64, "1", "2"]);
        assert!(parse_kline_row(&entry).is_err());
    }

    #[test]
    fn parse_str_f64_accepts_both_forms() {
        assert_eq!(parse_str_f64(&serde_json::json!("1.5")).unwrap(), 1.5);
        assert_eq!(parse_str_f64(&serde_json::json!(2.5)).unwrap(), 2.5);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
    }
}
