//! Read-only status surface: liveness plus aggregate runtime state.
//!
//! `/healthz` never blocks and has no dependencies — safe as a container
//! liveness probe. The `/status` endpoints expose runtime aggregates over
//! the stats, blacklist and session tables; they never mutate anything and
//! never include credentials.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(status))
        .route("/status/channels", get(channels))
        .route("/status/blacklist", get(blacklist))
        .route("/status/usage", get(usage_today))
        .with_state(state)
}

/// `GET /healthz` — always 200.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// `GET /status` — uptime and aggregate request counters.
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (total, failures) = state.stats.totals();
    let error_rate = if total == 0 {
        0.0
    } else {
        failures as f64 / total as f64
    };
    let config = state.config.get();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "channels": {
            "configured": config.channels.len(),
            "enabled": config.enabled_channels().count(),
        },
        "requests": {
            "total": total,
            "errors": failures,
            "error_rate": error_rate,
        },
        "active_sessions": state.sessions.active_count(),
        "selection_cache_entries": state.router.selection_cache.len(),
    }))
}

/// `GET /status/channels` — per-channel health scores and latency.
async fn channels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config.get();
    let health = state.stats.snapshot();
    let channels: Vec<_> = config
        .channels
        .iter()
        .map(|c| {
            let h = health.iter().find(|h| h.channel_id == c.id);
            json!({
                "id": c.id,
                "name": c.name,
                "provider": c.provider,
                "enabled": c.enabled,
                "priority": c.priority,
                "reliability": h.map(|h| h.reliability).unwrap_or(1.0),
                "avg_latency_ms": h.and_then(|h| h.avg_latency_ms),
                "total_requests": h.map(|h| h.total_requests).unwrap_or(0),
                "total_failures": h.map(|h| h.total_failures).unwrap_or(0),
                "blacklisted": state.blacklist.is_channel_blacklisted(&c.id),
            })
        })
        .collect();
    Json(json!({ "channels": channels }))
}

/// `GET /status/blacklist` — the read-only blacklist view.
async fn blacklist(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.blacklist.snapshot())
}

/// `GET /status/usage` — today's aggregates, derived by scanning the day's
/// usage file on each read.
async fn usage_today(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let today = chrono::Utc::now().date_naive();
    Json(state.usage.daily_stats(today).await)
}
