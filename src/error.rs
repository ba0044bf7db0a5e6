//! Unified error taxonomy for the gateway.
//!
//! Everything that can go wrong between ingress and upstream is a
//! [`GatewayError`] variant; handlers return `Result<T, GatewayError>` and
//! propagate with `?`. The [`IntoResponse`] impl below is the **only** place
//! in the codebase that maps errors to HTTP status codes, so the mapping
//! table has exactly one source of truth:
//!
//! | Kind | Status |
//! |---|---|
//! | validation | 400 |
//! | authentication | 401 / 403 |
//! | `TagNotFound` | 404 |
//! | `NoChannelsAvailable`, `AllChannelsFailed` | 503 |
//! | terminal upstream status | surfaced as-is |
//! | upstream timeout / transport / stream | 503 |
//! | internal | 500 |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Every failure the gateway can surface to a client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed request body or a missing required field.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Missing or wrong client credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Valid credential without access to the requested surface.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A `tag:` selector matched no concrete model on any enabled channel.
    #[error("no models match tags: {}", .0.join(","))]
    TagNotFound(Vec<String>),

    /// Routing produced zero candidates before any upstream was attempted.
    #[error("no channels available for model '{0}'")]
    NoChannelsAvailable(String),

    /// Every scored candidate was attempted and failed.
    #[error("all channels failed; last error: {last}")]
    AllChannelsFailed { last: String },

    /// The upstream answered with a terminal non-2xx status that should be
    /// surfaced to the client unchanged (e.g. a 400 the client caused).
    #[error("upstream returned HTTP {code}: {body}")]
    UpstreamStatus { code: u16, body: String },

    /// The upstream did not answer within the per-attempt deadline.
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// Connection-level failure talking to the upstream.
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// The upstream emitted an error event mid-stream.
    #[error("upstream stream error: {0}")]
    UpstreamStream(String),

    /// Anything unexpected. Logged at error level, surfaced as 500.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::TagNotFound(_) => StatusCode::NOT_FOUND,
            Self::NoChannelsAvailable(_) | Self::AllChannelsFailed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::UpstreamStatus { code, .. } => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::UpstreamTimeout | Self::UpstreamTransport(_) | Self::UpstreamStream(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable discriminator used in error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::TagNotFound(_) => "tag_not_found",
            Self::NoChannelsAvailable(_) => "no_channels",
            Self::AllChannelsFailed { .. } => "all_channels_failed",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamTransport(_) => "upstream_transport",
            Self::UpstreamStream(_) => "upstream_stream",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::warn!(kind = self.kind(), error = %self, "request rejected");
        }

        let mut body = json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        });
        if let Self::TagNotFound(tags) = &self {
            body["error"]["tags"] = json!(tags);
        }

        (status, Json(body)).into_response()
    }
}
