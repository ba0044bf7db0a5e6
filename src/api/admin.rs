//! Admin API — operator-facing mutations over channels and the blacklist.
//!
//! Everything under `/admin` sits behind the admin bearer token (see
//! [`super::auth::admin_auth_middleware`]). Channel mutations persist back
//! to the YAML config atomically; blacklist mutations are in-memory.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{delete, get, patch},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/channels", get(list_channels))
        .route("/channels/{id}", patch(patch_channel))
        .route("/blacklist", get(blacklist_snapshot))
        .route("/blacklist/{channel_id}/{model}", delete(clear_entry))
        .route("/blacklist/channels/{channel_id}", delete(clear_channel))
        .with_state(state)
}

/// `GET /admin/channels` — config view with the API key redacted to a prefix.
async fn list_channels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config.get();
    let channels: Vec<_> = config
        .channels
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "name": c.name,
                "provider": c.provider,
                "model_name": c.model_name,
                "enabled": c.enabled,
                "priority": c.priority,
                "tags": c.tags,
                "min_request_interval": c.min_request_interval,
                "api_key": format!("{}…", c.api_key.chars().take(6).collect::<String>()),
                "blacklisted": state.blacklist.is_channel_blacklisted(&c.id),
            })
        })
        .collect();
    Json(json!({ "channels": channels }))
}

#[derive(Debug, Deserialize)]
struct ChannelPatch {
    enabled: Option<bool>,
    priority: Option<i32>,
}

/// `PATCH /admin/channels/{id}` — toggle or reprioritise, persisted to YAML.
async fn patch_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<ChannelPatch>,
) -> Result<impl IntoResponse, GatewayError> {
    if patch.enabled.is_none() && patch.priority.is_none() {
        return Err(GatewayError::Validation(
            "provide `enabled` and/or `priority`".into(),
        ));
    }
    if let Some(enabled) = patch.enabled {
        state
            .config
            .set_channel_enabled(&id, enabled)
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        // A disabled channel must not be served from the selection cache.
        if !enabled {
            state.router.selection_cache.invalidate_channel(&id);
        }
    }
    if let Some(priority) = patch.priority {
        state
            .config
            .set_channel_priority(&id, priority)
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
    }
    let config = state.config.get();
    let channel = config.channel_by_id(&id);
    Ok(Json(json!({
        "id": id,
        "enabled": channel.map(|c| c.enabled),
        "priority": channel.map(|c| c.priority),
    })))
}

/// `GET /admin/blacklist`
async fn blacklist_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.blacklist.snapshot())
}

/// `DELETE /admin/blacklist/{channel_id}/{model}` — clear one pair.
async fn clear_entry(
    State(state): State<Arc<AppState>>,
    Path((channel_id, model)): Path<(String, String)>,
) -> impl IntoResponse {
    let removed = state.blacklist.remove(&channel_id, &model);
    Json(json!({ "removed": removed }))
}

/// `DELETE /admin/blacklist/channels/{channel_id}` — lift a channel-wide
/// blacklist (including permanent auth failures) and reset its counters.
async fn clear_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> impl IntoResponse {
    let removed = state.blacklist.clear_channel(&channel_id);
    state.intervals.clear(&channel_id);
    Json(json!({ "channel_id": channel_id, "entries_removed": removed }))
}
