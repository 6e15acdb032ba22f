// =============================================================================
// REST API — chart data, event histories, and webhook config
// =============================================================================
//
// Every endpoint degrades to an empty JSON array when its backing file does
// not exist yet; only the webhook-config POST can fail, with a 400 on
// malformed input.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::bus::{BarData, PlotStyle};
use crate::data_service::state::AppState;
use crate::ohlcv_file::OhlcvReader;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router: UI assets, REST API, and the `/ws` bus endpoint.
pub fn router(app: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(crate::data_service::ui::router())
        .route("/api/ohlcv", get(get_ohlcv))
        .route("/api/trades", get(get_trades))
        .route("/api/plotchar", get(get_plotchar))
        .route("/api/plot", get(get_plot))
        .route("/api/info", get(get_info))
        .route("/api/webhook-config", get(get_webhook_config))
        .route("/api/webhook-config", post(set_webhook_config))
        .route("/ws", get(crate::data_service::hub::ws_handler))
        .layer(cors)
        .with_state(app)
}

#[derive(Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

// =============================================================================
// OHLCV tail
// =============================================================================

async fn get_ohlcv(
    State(app): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(2000);
    if !app.ohlcv_path.exists() {
        return Json(Vec::<BarData>::new());
    }

    let bars = OhlcvReader::open(&app.ohlcv_path)
        .and_then(|mut reader| reader.tail(limit as u64))
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to read ohlcv tail");
            Vec::new()
        });

    Json(bars.iter().map(BarData::from_file).collect::<Vec<_>>())
}

// =============================================================================
// Event histories
// =============================================================================

async fn get_trades(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app.trades_history.read().clone())
}

async fn get_plotchar(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app.plotchar_history.read().clone())
}

// =============================================================================
// Plot series
// =============================================================================

/// One reconstructed plot series for the chart UI.
#[derive(Debug, Clone, Serialize)]
pub struct PlotSeries {
    pub title: String,
    pub color: Option<String>,
    pub linewidth: Option<u32>,
    pub style: Option<String>,
    pub data: Vec<PlotPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlotPoint {
    pub time: i64,
    pub value: Option<f64>,
}

async fn get_plot(
    State(app): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(2000);
    let options = app.plot_options.read().clone();
    if options.is_empty() || !app.plot_path.exists() {
        return Json(Vec::<PlotSeries>::new());
    }

    match read_plot_series(&app.plot_path, &options, limit) {
        Ok(series) => Json(series),
        Err(e) => {
            warn!(error = %e, "failed to read plot CSV");
            Json(Vec::new())
        }
    }
}

// =============================================================================
// Info
// =============================================================================

#[derive(Debug, Clone, Serialize)]
struct InfoResponse {
    script_title: Option<String>,
    provider: String,
    exchange: String,
    symbol: String,
    timeframe: String,
    enabled: bool,
}

async fn get_info(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let config = app.config.read();
    Json(InfoResponse {
        script_title: app.script_title.read().clone(),
        provider: config.realtime.provider.clone(),
        exchange: config.realtime.exchange.clone(),
        symbol: config.realtime.symbol.clone(),
        timeframe: config.realtime.timeframe.clone(),
        enabled: config.realtime.enabled,
    })
}

// =============================================================================
// Webhook config
// =============================================================================

#[derive(Debug, Clone, Serialize)]
struct WebhookConfigResponse {
    enabled: bool,
    telegram_notification: bool,
    url: String,
}

async fn get_webhook_config(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let config = app.config.read();
    Json(WebhookConfigResponse {
        enabled: config.webhook.enabled,
        telegram_notification: config.webhook.telegram_notification,
        url: config.webhook.url.clone(),
    })
}

/// Validate and apply a webhook-config mutation, rewriting the `[webhook]`
/// section of the config file. Non-boolean values for the boolean fields are
/// a 400.
async fn set_webhook_config(
    State(app): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let mut config = app.config.read().clone();

    for field in ["enabled", "telegram_notification"] {
        if let Some(value) = body.get(field) {
            let Some(flag) = value.as_bool() else {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("{field} must be a boolean") })),
                );
            };
            match field {
                "enabled" => config.webhook.enabled = flag,
                _ => config.webhook.telegram_notification = flag,
            }
        }
    }
    if let Some(value) = body.get("url") {
        let Some(url) = value.as_str() else {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "url must be a string" })),
            );
        };
        config.webhook.url = url.to_string();
    }

    let config_path = app.workdir.config_path();
    if let Err(e) = config.save(&config_path) {
        warn!(error = %e, "failed to persist webhook config");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "failed to persist config" })),
        );
    }
    *app.config.write() = config.clone();
    info!(enabled = config.webhook.enabled, "webhook config updated");

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "enabled": config.webhook.enabled,
            "telegram_notification": config.webhook.telegram_notification,
            "url": config.webhook.url,
        })),
    )
}

// =============================================================================
// Plot CSV readers
// =============================================================================
//
// The plot file is `time,<title>,...` with one row per strategy step and
// empty cells where a series had no value.

/// Read one row by index: `(time, title -> value)`.
pub fn read_plot_row(
    path: &Path,
    index: usize,
) -> Result<Option<(i64, BTreeMap<String, Option<f64>>)>> {
    let mut reader = csv::Reader::from_path(path).context("failed to open plot CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("failed to read plot CSV header")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let Some(record) = reader.records().nth(index) else {
        return Ok(None);
    };
    let record = record.context("failed to read plot CSV row")?;

    let time: i64 = record
        .get(0)
        .unwrap_or("0")
        .parse()
        .context("plot CSV row has a bad time column")?;

    let mut values = BTreeMap::new();
    for (i, header) in headers.iter().enumerate().skip(1) {
        let cell = record.get(i).unwrap_or("");
        values.insert(
            header.clone(),
            if cell.is_empty() {
                None
            } else {
                cell.parse().ok()
            },
        );
    }
    Ok(Some((time, values)))
}

/// Reconstruct the last `limit` rows into one series per configured title.
pub fn read_plot_series(
    path: &Path,
    options: &BTreeMap<String, PlotStyle>,
    limit: usize,
) -> Result<Vec<PlotSeries>> {
    let mut reader = csv::Reader::from_path(path).context("failed to open plot CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("failed to read plot CSV header")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows: Vec<(i64, Vec<Option<f64>>)> = Vec::new();
    for record in reader.records() {
        let record = record.context("failed to read plot CSV row")?;
        let time: i64 = record.get(0).unwrap_or("0").parse().unwrap_or(0);
        let values = (1..headers.len())
            .map(|i| {
                let cell = record.get(i).unwrap_or("");
                if cell.is_empty() {
                    None
                } else {
                    cell.parse().ok()
                }
            })
            .collect();
        rows.push((time, values));
    }
    let start = rows.len().saturating_sub(limit);
    let rows = &rows[start..];

    let mut series = Vec::new();
    for (title, style) in options {
        let column = headers.iter().skip(1).position(|h| h == title);
        let data = rows
            .iter()
            .map(|(time, values)| PlotPoint {
                time: *time,
                value: column.and_then(|c| values.get(c).copied().flatten()),
            })
            .collect();
        series.push(PlotSeries {
            title: title.clone(),
            color: style.color.clone(),
            linewidth: style.linewidth,
            style: style.style.clone(),
            data,
        });
    }
    Ok(series)
}
