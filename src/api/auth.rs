//! Client and admin authentication middlewares.
//!
//! Client auth is a single shared token (`auth.api_token`), accepted from
//! whichever header the ingress dialect uses: `Authorization: Bearer`,
//! `x-api-key` (Anthropic) or `x-goog-api-key` (Gemini). When
//! `auth.enabled` is false the middleware passes everything through.
//!
//! Admin auth is a separate bearer token (`auth.admin.admin_token`); the
//! whole `/admin` subtree is refused when the admin API is disabled or the
//! token is unconfigured.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::GatewayError;
use crate::state::AppState;

fn presented_client_token(req: &Request) -> Option<&str> {
    let headers = req.headers();
    if let Some(bearer) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer);
    }
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(token) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return Some(token);
        }
    }
    None
}

pub async fn client_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let config = state.config.get();
    if !config.auth.enabled {
        return next.run(req).await;
    }
    let Some(expected) = config.auth.api_token.as_deref().filter(|t| !t.is_empty()) else {
        // Auth enabled with no token is a lockout, not an open door.
        return GatewayError::Unauthorized("client auth is enabled but no api_token is configured".into())
            .into_response();
    };
    match presented_client_token(&req) {
        Some(token) if token == expected => next.run(req).await,
        _ => GatewayError::Unauthorized("valid API token required".into()).into_response(),
    }
}

pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let config = state.config.get();
    if !config.auth.admin.enabled {
        return GatewayError::Forbidden("admin API is disabled".into()).into_response();
    }
    let Some(expected) = config
        .auth
        .admin
        .admin_token
        .as_deref()
        .filter(|t| !t.is_empty())
    else {
        return GatewayError::Forbidden("admin API has no admin_token configured".into())
            .into_response();
    };
    let presented = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => next.run(req).await,
        _ => GatewayError::Unauthorized("valid admin token required".into()).into_response(),
    }
}
