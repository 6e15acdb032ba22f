// =============================================================================
// Bus protocol — JSON messages between the data service, runner, and UI
// =============================================================================
//
// Every frame is a JSON object with a `type` field, or a JSON array batching
// several such objects. Frames that fail to parse are keepalives by
// definition (the runner sends a literal "ping" text every 15 s).
//
// Bar payloads come in two shapes, matching the wire contract:
//   - lifecycle events carry raw rows `[ts_ms, o, h, l, c, v]`;
//   - streaming `bar` / `last_bar_open_fix` events carry an object with
//     `time` in **seconds**.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bar::Bar;

// =============================================================================
// Payload fragments
// =============================================================================

/// Bar object payload (`time` in seconds) for UI-facing events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BarData {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl BarData {
    /// Convert a live bar (ts in ms) into the wire shape.
    pub fn from_live(bar: &Bar) -> Self {
        Self {
            time: bar.ts / 1000,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }

    /// Convert a file bar (ts already in seconds) into the wire shape.
    pub fn from_file(bar: &Bar) -> Self {
        Self {
            time: bar.ts,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

/// Plot rendering options, deduplicated by (title, options) on the runner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlotStyle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linewidth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

// =============================================================================
// Messages
// =============================================================================

/// One bus message. The serde tag is the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    // ── D -> R lifecycle ────────────────────────────────────────────────
    PrerunReadyAfterHistoryDownload {
        ohlcv_path: String,
        toml_path: String,
    },
    PrerunReady {
        ohlcv_path: String,
        toml_path: String,
        /// `[confirmed, new]` as raw rows, timestamps in ms.
        confirmed_bar_and_new_bar: Vec<[f64; 6]>,
    },
    RunReady {
        ohlcv_path: String,
        toml_path: String,
        confirmed_bar_and_new_bar: Vec<[f64; 6]>,
    },

    // ── D -> subscribers ────────────────────────────────────────────────
    Bar {
        data: BarData,
    },
    PlotData {
        title: String,
        time: i64,
        value: Option<f64>,
    },

    // ── R -> D ──────────────────────────────────────────────────────────
    AckPrerunReadyAfterHistoryDownload,
    ScriptInfo {
        title: String,
    },
    ScriptModified,
    ResetHistory,
    /// R -> D carries `last_bar_index`; the D -> subscriber echo carries the
    /// re-read bar in `data`.
    LastBarOpenFix {
        #[serde(skip_serializing_if = "Option::is_none")]
        last_bar_index: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<BarData>,
    },
    TradeEntry {
        time: i64,
        price: f64,
        size: f64,
        id: String,
        comment: String,
    },
    TradeClose {
        time: i64,
        price: f64,
        size: f64,
        id: String,
        comment: String,
        profit: f64,
    },
    Plotchar {
        title: String,
        time: i64,
        #[serde(rename = "char")]
        mark: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<String>,
    },
    PlotOptions {
        data: BTreeMap<String, PlotStyle>,
        confirmed_bar_index: i64,
    },
}

impl BusMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("bus messages serialise")
    }

    pub fn encode_batch(batch: &[BusMessage]) -> String {
        serde_json::to_string(batch).expect("bus messages serialise")
    }

    /// The `[confirmed, new]` pair of a lifecycle event, when present and
    /// well-formed.
    pub fn bar_pair(&self) -> Option<(Bar, Bar)> {
        let rows = match self {
            BusMessage::PrerunReady {
                confirmed_bar_and_new_bar,
                ..
            }
            | BusMessage::RunReady {
                confirmed_bar_and_new_bar,
                ..
            } => confirmed_bar_and_new_bar,
            _ => return None,
        };
        if rows.len() != 2 {
            return None;
        }
        Some((Bar::from_row(&rows[0]), Bar::from_row(&rows[1])))
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// One or more messages (arrays arrive from the runner's batched sends).
    Messages(Vec<BusMessage>),
    /// Anything that is not valid protocol JSON, e.g. the "ping" text.
    Keepalive,
}

/// Decode an inbound text frame. Unknown message types and malformed JSON
/// degrade to `Keepalive`; in a batch, undecodable elements are dropped.
pub fn decode_frame(text: &str) -> Frame {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Frame::Keepalive,
    };

    match value {
        serde_json::Value::Array(items) => {
            let messages: Vec<BusMessage> = items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect();
            if messages.is_empty() {
                Frame::Keepalive
            } else {
                Frame::Messages(messages)
            }
        }
        obj @ serde_json::Value::Object(_) => match serde_json::from_value(obj) {
            Ok(msg) => Frame::Messages(vec![msg]),
            Err(_) => Frame::Keepalive,
        },
        _ => Frame::Keepalive,
    }
}

/// Build the `[confirmed, new]` wire rows from two live bars.
pub fn bar_pair_rows(confirmed: &Bar, new: &Bar) -> Vec<[f64; 6]> {
    vec![confirmed.to_row(), new.to_row()]
}
