//! Request context middleware.
//!
//! Every inbound request gets:
//!
//! - a request ID — accepted from `X-Request-ID` when the caller provides
//!   one, freshly minted (UUID v4) otherwise, echoed back on the response
//!   and wrapped in a tracing span so every log line carries it;
//! - a session key — SHA-256 over the masked client credential, the first
//!   100 bytes of the User-Agent and the peer IP, used purely for the
//!   cumulative cost figures in the summary event.
//!
//! Both travel as one [`RequestContext`] extension into the handlers.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tracing::Instrument as _;
use uuid::Uuid;

use crate::dispatch::RequestContext;
use crate::sessions::session_key;

/// Pull the client credential out of whichever header the dialect uses.
fn credential_of(req: &Request) -> Option<String> {
    let headers = req.headers();
    if let Some(bearer) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.to_string());
    }
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(key) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return Some(key.to_string());
        }
    }
    None
}

pub async fn context_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let credential = credential_of(&req);
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string());

    let session = session_key(credential.as_deref(), user_agent.as_deref(), ip.as_deref());
    req.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        session_key: session,
    });

    let span = tracing::debug_span!("request", id = %request_id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, middleware, routing::get, Extension, Router};
    use tower::ServiceExt;

    async fn echo(Extension(ctx): Extension<RequestContext>) -> String {
        format!("{}|{}", ctx.request_id, ctx.session_key)
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(echo))
            .layer(middleware::from_fn(context_middleware))
    }

    async fn body_of(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn caller_request_id_is_kept_and_echoed() {
        let resp = app()
            .oneshot(
                HttpRequest::get("/")
                    .header("x-request-id", "caller-id-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()["x-request-id"], "caller-id-1");
        let body = body_of(resp).await;
        assert!(body.starts_with("caller-id-1|"));
    }

    #[tokio::test]
    async fn missing_request_id_is_minted() {
        let resp = app()
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let echoed = resp.headers()["x-request-id"].to_str().unwrap().to_string();
        assert!(Uuid::parse_str(&echoed).is_ok(), "minted id must be a UUID");
    }

    #[tokio::test]
    async fn session_key_is_stable_per_caller() {
        let make = |ua: &'static str| {
            app().oneshot(
                HttpRequest::get("/")
                    .header("authorization", "Bearer sk-someclientkey")
                    .header("user-agent", ua)
                    .body(Body::empty())
                    .unwrap(),
            )
        };
        let a = body_of(make("curl/8").await.unwrap()).await;
        let b = body_of(make("curl/8").await.unwrap()).await;
        let c = body_of(make("python/3").await.unwrap()).await;

        let session = |s: &str| s.split('|').nth(1).unwrap().to_string();
        assert_eq!(session(&a), session(&b));
        assert_ne!(session(&a), session(&c));
    }
}
