//! Candidate discovery: resolve a request's `model` field into
//! (channel, concrete model) pairs.
//!
//! Three resolution modes, keyed off the `model` field's shape:
//!
//! 1. **Exact** — channels whose default model matches, or whose discovered
//!    catalog contains a match. Matching is case-insensitive and tolerant of
//!    provider prefixes (`openai/gpt-4o-mini` ≍ `gpt-4o-mini`).
//! 2. **`tag:a,b`** — every (channel, model) whose combined tag set (tags
//!    derived from the model id plus the channel's declared tags) is a
//!    superset of the request. Zero matches is a hard `TagNotFound`.
//! 3. **`auto:strategy`** — every enabled channel with its default model;
//!    the strategy name rides along to the scorer.
//!
//! Blacklisted pairs (or channel-wide-blacklisted channels) are dropped at
//! the end, so the scorer only ever sees attemptable candidates.

use crate::blacklist::Blacklist;
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::registry::{derive_tags, ChannelCatalog};

use super::types::{ChannelCandidate, ModelSelector, RoutingRequest};

/// Case-insensitive, provider-prefix-tolerant model id comparison.
pub fn models_match(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return true;
    }
    let bare = |s: &str| s.rsplit('/').next().map(str::to_string).unwrap_or_default();
    bare(&a) == bare(&b)
}

/// Resolve candidates for `request`, before blacklist filtering.
fn raw_candidates(
    config: &AppConfig,
    catalog: &ChannelCatalog,
    request: &RoutingRequest,
) -> Result<Vec<ChannelCandidate>, GatewayError> {
    let mut candidates = Vec::new();

    match request.selector() {
        ModelSelector::Exact(wanted) => {
            for channel in config.enabled_channels() {
                if models_match(&channel.model_name, &wanted) {
                    candidates.push(ChannelCandidate {
                        channel: channel.clone(),
                        matched_model: channel.model_name.clone(),
                    });
                    continue;
                }
                if let Some(discovered) = catalog
                    .models_for(&channel.id)
                    .into_iter()
                    .find(|m| models_match(m, &wanted))
                {
                    candidates.push(ChannelCandidate {
                        channel: channel.clone(),
                        matched_model: discovered,
                    });
                }
            }
        }
        ModelSelector::Tags(tags) => {
            if tags.is_empty() {
                return Err(GatewayError::Validation(
                    "`tag:` selector needs at least one tag".into(),
                ));
            }
            for channel in config.enabled_channels() {
                let channel_tags = channel.tag_set();
                let mut models = catalog.models_for(&channel.id);
                if models.is_empty() {
                    models.push(channel.model_name.clone());
                }
                for model in models {
                    let mut model_tags = derive_tags(&model);
                    model_tags.extend(channel_tags.iter().cloned());
                    let covered = tags.iter().all(|t| model_tags.iter().any(|m| m == t));
                    if covered {
                        candidates.push(ChannelCandidate {
                            channel: channel.clone(),
                            matched_model: model,
                        });
                    }
                }
            }
            if candidates.is_empty() {
                return Err(GatewayError::TagNotFound(tags));
            }
        }
        ModelSelector::Auto(_) => {
            for channel in config.enabled_channels() {
                candidates.push(ChannelCandidate {
                    channel: channel.clone(),
                    matched_model: channel.model_name.clone(),
                });
            }
        }
    }

    Ok(candidates)
}

/// Full discovery: resolve, then drop blacklisted pairs.
pub fn discover(
    config: &AppConfig,
    catalog: &ChannelCatalog,
    blacklist: &Blacklist,
    request: &RoutingRequest,
) -> Result<Vec<ChannelCandidate>, GatewayError> {
    let candidates = raw_candidates(config, catalog, request)?;
    let total = candidates.len();
    let available: Vec<ChannelCandidate> = candidates
        .into_iter()
        .filter(|c| {
            !blacklist
                .is_model_blacklisted(&c.channel.id, &c.matched_model)
                .0
        })
        .collect();
    if available.len() < total {
        tracing::debug!(
            dropped = total - available.len(),
            remaining = available.len(),
            "discovery dropped blacklisted candidates"
        );
    }
    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> AppConfig {
        let mut config: AppConfig = serde_yaml::from_str(
            r#"
providers:
  openai:
    display_name: OpenAI
    adapter_class: openai
    base_url: https://api.openai.com
  groq:
    display_name: Groq
    adapter_class: openai
    base_url: https://api.groq.com/openai

channels:
  - id: openai_1
    name: OpenAI main
    provider: openai
    model_name: gpt-4o-mini
    api_key: sk-1234567890
    priority: 10
  - id: groq_1
    name: Groq free
    provider: groq
    model_name: llama-3.1-8b-instant
    api_key: gsk-1234567890
    priority: 10
    tags: [free]
  - id: disabled_1
    name: Disabled
    provider: openai
    model_name: gpt-4o-mini
    api_key: sk-1234567890
    enabled: false
"#,
        )
        .unwrap();
        config.validate().unwrap();
        config
    }

    fn request_for(model: &str) -> RoutingRequest {
        RoutingRequest::from_payload(json!({
            "model": model,
            "messages": [{ "role": "user", "content": "hi" }],
        }))
        .unwrap()
    }

    fn empty_catalog() -> ChannelCatalog {
        ChannelCatalog::new(std::path::Path::new("/nonexistent"))
    }

    // -----------------------------------------------------------------------
    // Model matching
    // -----------------------------------------------------------------------

    #[test]
    fn matching_is_case_insensitive_and_prefix_tolerant() {
        assert!(models_match("gpt-4o-mini", "GPT-4O-MINI"));
        assert!(models_match("openai/gpt-4o-mini", "gpt-4o-mini"));
        assert!(models_match("gpt-4o-mini", "openai/gpt-4o-mini"));
        assert!(!models_match("gpt-4o-mini", "gpt-4o"));
    }

    // -----------------------------------------------------------------------
    // Exact mode
    // -----------------------------------------------------------------------

    #[test]
    fn exact_matches_default_model_on_enabled_channels_only() {
        let config = test_config();
        let blacklist = Blacklist::new();
        let found = discover(
            &config,
            &empty_catalog(),
            &blacklist,
            &request_for("gpt-4o-mini"),
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].channel.id, "openai_1");
    }

    #[test]
    fn exact_matches_discovered_catalog_models() {
        let config = test_config();
        let catalog = empty_catalog();
        catalog.store("groq_1", "gsk-1234567890", vec!["mixtral-8x7b-32768".into()]);

        let found = discover(
            &config,
            &catalog,
            &Blacklist::new(),
            &request_for("mixtral-8x7b-32768"),
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].channel.id, "groq_1");
        assert_eq!(found[0].matched_model, "mixtral-8x7b-32768");
    }

    #[test]
    fn exact_with_no_match_yields_empty_not_error() {
        let config = test_config();
        let found = discover(
            &config,
            &empty_catalog(),
            &Blacklist::new(),
            &request_for("nonexistent-model"),
        )
        .unwrap();
        assert!(found.is_empty());
    }

    // -----------------------------------------------------------------------
    // Tag mode
    // -----------------------------------------------------------------------

    #[test]
    fn tag_mode_combines_model_and_channel_tags() {
        let config = test_config();
        // `free` is a channel tag on groq_1; `llama` derives from the model id.
        let found = discover(
            &config,
            &empty_catalog(),
            &Blacklist::new(),
            &request_for("tag:free,llama"),
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].channel.id, "groq_1");
        assert_eq!(found[0].matched_model, "llama-3.1-8b-instant");
    }

    #[test]
    fn tag_mode_is_case_insensitive() {
        let config = test_config();
        let found = discover(
            &config,
            &empty_catalog(),
            &Blacklist::new(),
            &request_for("tag:FREE"),
        )
        .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn unmatched_tags_raise_tag_not_found() {
        let config = test_config();
        let err = discover(
            &config,
            &empty_catalog(),
            &Blacklist::new(),
            &request_for("tag:quantum,teleport"),
        )
        .unwrap_err();
        match err {
            GatewayError::TagNotFound(tags) => {
                assert_eq!(tags, vec!["quantum".to_string(), "teleport".to_string()]);
            }
            other => panic!("expected TagNotFound, got {other:?}"),
        }
    }

    #[test]
    fn tag_mode_enumerates_catalog_models_per_channel() {
        let config = test_config();
        let catalog = empty_catalog();
        catalog.store(
            "openai_1",
            "sk-1234567890",
            vec!["gpt-4o-mini".into(), "gpt-4o".into()],
        );
        let found = discover(
            &config,
            &catalog,
            &Blacklist::new(),
            &request_for("tag:gpt,4o"),
        )
        .unwrap();
        // Both catalog models carry the gpt+4o tags.
        assert_eq!(found.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Auto mode
    // -----------------------------------------------------------------------

    #[test]
    fn auto_mode_yields_every_enabled_channel() {
        let config = test_config();
        let found = discover(
            &config,
            &empty_catalog(),
            &Blacklist::new(),
            &request_for("auto:balanced"),
        )
        .unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.channel.id.as_str()).collect();
        assert_eq!(ids, vec!["openai_1", "groq_1"]);
    }

    // -----------------------------------------------------------------------
    // Blacklist filtering
    // -----------------------------------------------------------------------

    #[test]
    fn blacklisted_pairs_are_dropped() {
        let config = test_config();
        let blacklist = Blacklist::new();
        blacklist.add("openai_1", "gpt-4o-mini", 500, "server error");

        let found = discover(
            &config,
            &empty_catalog(),
            &blacklist,
            &request_for("auto:balanced"),
        )
        .unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.channel.id.as_str()).collect();
        assert_eq!(ids, vec!["groq_1"]);
    }

    #[test]
    fn channel_wide_blacklist_drops_every_model() {
        let config = test_config();
        let catalog = empty_catalog();
        catalog.store("groq_1", "gsk-1234567890", vec!["other-model".into()]);
        let blacklist = Blacklist::new();
        blacklist.add("groq_1", "anything", 401, "bad key");

        let found = discover(
            &config,
            &catalog,
            &blacklist,
            &request_for("other-model"),
        )
        .unwrap();
        assert!(found.is_empty());
    }
}
