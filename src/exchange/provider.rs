// =============================================================================
// Provider downloads — blocking full-history and range fetches
// =============================================================================
//
// These calls page through the exchange kline endpoint and can run for many
// seconds, so they use the blocking reqwest client and are invoked from
// `tokio::task::spawn_blocking` — never while the buffer mutex is held.
//
// Where the exchange skipped whole intervals (delistings, outages), filler
// records with negative volume are written so that downstream consumers can
// keep bar spacing uniform while excluding the fillers from bar counts.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use tracing::{info, warn};

use crate::bar::Bar;
use crate::exchange::client::parse_kline_row;
use crate::exchange::syminfo::SymInfo;
use crate::exchange::{native_symbol, rest_base_url};
use crate::ohlcv_file::OhlcvWriter;
use crate::paths::SymbolKey;
use crate::timeframe::Timeframe;

/// Klines per request page.
const PAGE_LIMIT: u32 = 1000;

/// Volume written into historic gap sentinel records.
pub const GAP_VOLUME: f64 = -1.0;

/// Resolve a `history_since` config value to a millisecond timestamp.
///
/// Accepts an absolute `YYYY-MM-DD` date or a relative day count. Anything
/// unparsable — and dates in the future — falls through to the default
/// window: 2 months back, 1 month for the 1-minute timeframe.
pub fn resolve_history_since(history_since: &str, timeframe: Timeframe, now_ms: i64) -> i64 {
    let trimmed = history_since.trim();

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        let ts = Utc
            .from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"))
            .timestamp_millis();
        if ts < now_ms {
            return ts;
        }
    } else if let Ok(days) = trimmed.parse::<i64>() {
        if days > 0 {
            return now_ms - days * 24 * 60 * 60 * 1000;
        }
    }

    default_since_ms(timeframe, now_ms)
}

/// Default history window: 2 months, shortened to 1 for the 1-minute
/// timeframe (the bar count would be unmanageable otherwise).
pub fn default_since_ms(timeframe: Timeframe, now_ms: i64) -> i64 {
    let months = if timeframe.is_one_minute() { 1 } else { 2 };
    let now = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(Utc::now);

    // Walk back month-by-month, clamping the day into the target month.
    let mut year = now.year();
    let mut month = now.month() as i32 - months;
    while month < 1 {
        month += 12;
        year -= 1;
    }
    let day = now.day().min(days_in_month(year, month as u32));
    let date = NaiveDate::from_ymd_opt(year, month as u32, day).expect("clamped date is valid");
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"))
        .timestamp_millis()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

// =============================================================================
// Paged download
// =============================================================================

fn fetch_page(
    client: &reqwest::blocking::Client,
    base_url: &str,
    symbol: &str,
    timeframe: Timeframe,
    since_ms: i64,
) -> Result<Vec<Bar>> {
    let url = format!(
        "{base_url}/api/v3/klines?symbol={}&interval={timeframe}&limit={PAGE_LIMIT}&startTime={since_ms}",
        native_symbol(symbol)
    );
    let resp = client
        .get(&url)
        .send()
        .context("kline page request failed")?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().context("failed to parse kline page")?;
    if !status.is_success() {
        anyhow::bail!("exchange kline page returned {status}: {body}");
    }

    let raw = body.as_array().context("kline page is not an array")?;
    let mut bars = Vec::with_capacity(raw.len());
    for entry in raw {
        match parse_kline_row(entry) {
            Ok(bar) => bars.push(bar),
            Err(e) => warn!(error = %e, "skipping malformed kline entry"),
        }
    }
    Ok(bars)
}

/// Page klines over `[from_ms, to_ms)` and write them as canonical records
/// (seconds, truncating). Skipped intervals become negative-volume fillers.
/// Returns the number of records written, fillers included.
pub fn download_range_to_file(
    key: &SymbolKey,
    from_ms: i64,
    to_ms: i64,
    path: &Path,
) -> Result<u64> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build blocking client")?;
    let base_url = rest_base_url(&key.exchange);
    let tf_ms = key.timeframe.to_ms();

    let mut writer = OhlcvWriter::open(path, true)?;
    let mut written: u64 = 0;
    let mut prev: Option<Bar> = None;
    let mut since = from_ms;

    loop {
        let page = fetch_page(&client, base_url, &key.symbol, key.timeframe, since)?;
        if page.is_empty() {
            break;
        }

        for bar in &page {
            if bar.ts >= to_ms {
                break;
            }
            if bar.ts < since {
                continue;
            }
            // Fill skipped intervals with gap sentinels so spacing stays
            // uniform; consumers exclude them via the negative volume.
            if let Some(p) = prev {
                let mut expected = p.ts + tf_ms;
                while expected < bar.ts {
                    writer.write(&Bar {
                        ts: expected / 1000,
                        open: p.close,
                        high: p.close,
                        low: p.close,
                        close: p.close,
                        volume: GAP_VOLUME,
                    })?;
                    written += 1;
                    expected += tf_ms;
                }
            }
            writer.write(&Bar {
                ts: bar.ts / 1000,
                ..*bar
            })?;
            written += 1;
            prev = Some(*bar);
        }

        let last_ts = page.last().map(|b| b.ts).unwrap_or(since);
        if last_ts >= to_ms || (page.len() as u32) < PAGE_LIMIT {
            break;
        }
        since = last_ts + tf_ms;
    }

    writer.flush()?;
    info!(
        path = %path.display(),
        bars = written,
        "history range downloaded"
    );
    Ok(written)
}

/// Full-history download for Rule A: klines from `since_ms` to now into the
/// canonical file, plus the symbol-info `.toml` sidecar.
pub fn download_history(
    key: &SymbolKey,
    since_ms: i64,
    ohlcv_path: &Path,
    toml_path: &Path,
) -> Result<u64> {
    let now_ms = Utc::now().timestamp_millis();
    let written = download_range_to_file(key, since_ms, now_ms, ohlcv_path)?;
    if written == 0 {
        anyhow::bail!("provider returned no bars since {since_ms}");
    }
    write_symbol_info(key, toml_path)?;
    Ok(written)
}

/// Fetch exchange metadata for the symbol and write the `.toml` sidecar.
pub fn write_symbol_info(key: &SymbolKey, toml_path: &Path) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build blocking client")?;
    let url = format!(
        "{}/api/v3/exchangeInfo?symbol={}",
        rest_base_url(&key.exchange),
        native_symbol(&key.symbol)
    );
    let resp = client
        .get(&url)
        .send()
        .context("exchangeInfo request failed")?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().context("failed to parse exchangeInfo")?;
    if !status.is_success() {
        anyhow::bail!("exchangeInfo returned {status}: {body}");
    }

    let entry = body["symbols"]
        .as_array()
        .and_then(|arr| arr.first().cloned())
        .context("symbol not found in exchangeInfo")?;

    let syminfo = SymInfo::from_exchange_info(key, &entry);
    syminfo.save(toml_path)?;
    info!(path = %toml_path.display(), "symbol info written");
    Ok(())
}
