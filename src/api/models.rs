//! `GET /v1/models` — the model list a client can route to: every declared
//! virtual selector (tags and strategies) plus every discovered concrete
//! model, deduplicated.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::state::AppState;

const BUILTIN_STRATEGIES: [&str; 7] = [
    "cost_first",
    "free_first",
    "local_first",
    "cost_optimized",
    "speed_optimized",
    "quality_optimized",
    "balanced",
];

pub async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config.get();

    // Virtual selectors: auto:<strategy> for built-ins and config-defined
    // strategies, tag:<t> for operator-declared channel tags.
    let mut strategies: BTreeSet<String> =
        BUILTIN_STRATEGIES.iter().map(|s| s.to_string()).collect();
    strategies.extend(config.routing.sorting_strategies.keys().cloned());

    let mut tags: BTreeSet<String> = state.registry.known_tags().into_iter().collect();
    for channel in config.enabled_channels() {
        tags.extend(channel.tag_set());
    }

    // Concrete models: discovered catalogs plus every channel default.
    let mut concrete: BTreeSet<(String, String)> = BTreeSet::new();
    for channel in config.enabled_channels() {
        concrete.insert((channel.model_name.clone(), channel.provider.clone()));
        for model in state.catalog.models_for(&channel.id) {
            concrete.insert((model, channel.provider.clone()));
        }
    }

    let mut data: Vec<Value> = Vec::new();
    for name in strategies {
        data.push(json!({
            "id": format!("auto:{name}"),
            "object": "model",
            "owned_by": "smart-ai-router",
        }));
    }
    for tag in tags {
        data.push(json!({
            "id": format!("tag:{tag}"),
            "object": "model",
            "owned_by": "smart-ai-router",
        }));
    }
    for (model, provider) in concrete {
        data.push(json!({
            "id": model,
            "object": "model",
            "owned_by": provider,
        }));
    }

    Json(json!({ "object": "list", "data": data }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::state_from_yaml;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn lists_selectors_and_concrete_models() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_from_yaml(
            r#"
providers:
  groq:
    display_name: Groq
    adapter_class: openai
    base_url: https://api.groq.com/openai

channels:
  - id: groq_1
    name: Groq
    provider: groq
    model_name: llama-3.1-8b-instant
    api_key: gsk-1234567890
    tags: [free]

routing:
  default_strategy: balanced
  sorting_strategies:
    custom_mix:
      - { field: cost, weight: 1.0 }
"#,
            dir.path(),
        );
        state
            .catalog
            .store("groq_1", "gsk-1234567890", vec!["mixtral-8x7b-32768".into()]);

        let app = Router::new()
            .route("/v1/models", get(list_models))
            .with_state(state);
        let resp = app
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();

        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();

        assert!(ids.contains(&"auto:balanced"));
        assert!(ids.contains(&"auto:custom_mix"));
        assert!(ids.contains(&"tag:free"));
        assert!(ids.contains(&"llama-3.1-8b-instant"));
        assert!(ids.contains(&"mixtral-8x7b-32768"));
        // No duplicates.
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }
}
