//! HTTP ingress assembly.
//!
//! One listener serves three surfaces:
//! - the client API (OpenAI, Anthropic and Gemini dialects) behind the
//!   shared client token,
//! - the read-only `/status` endpoints and `/healthz`, unauthenticated,
//! - the `/admin` subtree behind the admin bearer token.
//!
//! All routing logic lives in [`crate::routing`] and [`crate::dispatch`];
//! handlers here only translate HTTP concerns.

pub mod admin;
pub mod anthropic;
pub mod auth;
pub mod context;
pub mod gemini;
pub mod models;
pub mod openai;
pub mod status;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Build the complete application router.
pub fn app(state: Arc<AppState>) -> Router {
    let client_api = Router::new()
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(models::list_models))
        .route("/v1/messages", post(anthropic::messages))
        .route("/v1/models/{model_action}", post(gemini::generate))
        .route("/v1beta/models/{model_action}", post(gemini::generate))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::client_auth_middleware,
        ));

    let admin_api = admin::router(Arc::clone(&state)).layer(middleware::from_fn_with_state(
        Arc::clone(&state),
        auth::admin_auth_middleware,
    ));

    Router::new()
        .merge(client_api)
        .nest("/admin", admin_api)
        .merge(status::router(Arc::clone(&state)))
        .route("/healthz", get(status::healthz))
        .layer(middleware::from_fn(context::context_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::state_from_yaml;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn yaml(base_url: &str) -> String {
        format!(
            r#"
auth:
  enabled: false
  admin:
    enabled: true
    admin_token: admin-secret-1

providers:
  openai:
    display_name: OpenAI
    adapter_class: openai
    base_url: {base_url}

channels:
  - id: c1
    name: One
    provider: openai
    model_name: test-model
    api_key: sk-1234567890abc
    tags: [free]
"#
        )
    }

    async fn json_of(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn full_stack_routes_a_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "model": "test-model",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "hello" },
                    "finish_reason": "stop",
                }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4 },
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = state_from_yaml(&yaml(&server.uri()), dir.path());
        let resp = app(state)
            .oneshot(
                Request::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"model":"tag:free","messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));
        let body = json_of(resp).await;
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["smart_ai_router"]["routing"]["channel"]["id"], "c1");
    }

    #[tokio::test]
    async fn tag_miss_maps_to_404_with_tags() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_from_yaml(&yaml("http://127.0.0.1:9"), dir.path());
        let resp = app(state)
            .oneshot(
                Request::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"model":"tag:nonexistent","messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = json_of(resp).await;
        assert_eq!(body["error"]["type"], "tag_not_found");
        assert_eq!(body["error"]["tags"][0], "nonexistent");
    }

    #[tokio::test]
    async fn anthropic_surface_requires_version_header() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_from_yaml(&yaml("http://127.0.0.1:9"), dir.path());
        let resp = app(state)
            .oneshot(
                Request::post("/v1/messages")
                    .header("content-type", "application/json")
                    .header("anthropic-version", "2024-01-01")
                    .body(Body::from(
                        r#"{"model":"test-model","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_subtree_is_token_protected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_from_yaml(&yaml("http://127.0.0.1:9"), dir.path());

        let denied = app(state.clone())
            .oneshot(Request::get("/admin/channels").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app(state)
            .oneshot(
                Request::get("/admin/channels")
                    .header("authorization", "Bearer admin-secret-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_and_healthz_are_open() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_from_yaml(&yaml("http://127.0.0.1:9"), dir.path());
        for uri in ["/healthz", "/status"] {
            let resp = app(state.clone())
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
        }
    }
}
