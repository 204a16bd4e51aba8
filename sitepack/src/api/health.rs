//! Health check endpoints.

use axum::{response::IntoResponse, Json};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

static START_TIME: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn init_start_time() {
    START_TIME.get_or_init(now_secs);
}

/// GET /health - Health check endpoint
pub async fn health() -> impl IntoResponse {
    let uptime = now_secs().saturating_sub(*START_TIME.get().unwrap_or(&0));

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
    }))
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "archive": "zip",
        "compression": ["store", "deflate"],
        "database": "sqlite",
    }))
}
