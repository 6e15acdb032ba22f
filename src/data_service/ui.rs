// =============================================================================
// UI assets — embedded dashboard page
// =============================================================================

use axum::{
    http::header,
    response::{Html, IntoResponse},
    routing::get,
    Router,
};

use std::sync::Arc;

use crate::data_service::state::AppState;

const INDEX_HTML: &str = include_str!("../../static/index.html");
const STYLES_CSS: &str = include_str!("../../static/styles.css");
const APP_JS: &str = include_str!("../../static/app.js");

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(index))
        .route("/static/styles.css", get(styles))
        .route("/static/app.js", get(app_js))
}

async fn index() -> impl IntoResponse {
    Html(INDEX_HTML)
}

async fn styles() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css")], STYLES_CSS)
}

async fn app_js() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/javascript")], APP_JS)
}
