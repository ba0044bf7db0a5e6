//! Capability filtering.
//!
//! Drops candidates that cannot satisfy the request's detected requirements
//! (vision, tool calls, streaming, context window). Metadata gaps are
//! resolved optimistically for cloud providers — a wrong guess there costs
//! one failover hop — and pessimistically for local runtimes (`ollama`,
//! `lmstudio`), where a wrong guess wedges a long local inference. Local
//! models can still qualify through explicit name markers (`llava`,
//! `hermes`, …) or operator-declared channel capabilities.
//!
//! When more than [`PRE_FILTER_LIMIT`] candidates survive, a cheap
//! (priority, health) heuristic trims the set before the scorer runs.

use crate::registry::ModelRegistry;
use crate::stats::ChannelStats;

use super::types::{Capability, ChannelCandidate, RoutingRequest};

/// Candidates kept for detailed scoring when the pool is large.
pub const PRE_FILTER_LIMIT: usize = 20;

/// Providers whose models run on-box and get the pessimistic treatment.
fn is_local_runtime(provider: &str, registry: &ModelRegistry) -> bool {
    matches!(provider, "ollama" | "lmstudio") || registry.is_local_provider(provider)
}

/// Name markers that vouch for a capability on unknown local models.
fn name_implies(model: &str, capability: Capability) -> bool {
    let lower = model.to_lowercase();
    match capability {
        Capability::Vision => ["llava", "vision", "-vl", "qwen-vl", "moondream"]
            .iter()
            .any(|m| lower.contains(m)),
        Capability::FunctionCalling => ["hermes", "functionary", "tool", "command-r"]
            .iter()
            .any(|m| lower.contains(m)),
        Capability::Streaming => true,
    }
}

fn channel_declares(candidate: &ChannelCandidate, capability: Capability) -> bool {
    candidate
        .channel
        .capabilities
        .iter()
        .any(|c| c.eq_ignore_ascii_case(capability.as_str()))
}

/// Keep only candidates that satisfy every required capability and the
/// context-length lower bound.
pub fn filter_by_capabilities(
    candidates: Vec<ChannelCandidate>,
    request: &RoutingRequest,
    registry: &ModelRegistry,
) -> Vec<ChannelCandidate> {
    candidates
        .into_iter()
        .filter(|candidate| satisfies(candidate, request, registry))
        .collect()
}

fn satisfies(
    candidate: &ChannelCandidate,
    request: &RoutingRequest,
    registry: &ModelRegistry,
) -> bool {
    let provider = candidate.channel.provider.as_str();
    let known = registry.contains(&candidate.matched_model);
    let local = is_local_runtime(provider, registry);

    if !known {
        // Unknown cloud models pass optimistically; unknown local models
        // must prove each capability through markers or declarations.
        if !local {
            return true;
        }
        return request.required_capabilities.iter().all(|cap| {
            channel_declares(candidate, *cap) || name_implies(&candidate.matched_model, *cap)
        });
    }

    let meta = registry.get(
        &candidate.matched_model,
        Some(provider),
        Some(&candidate.channel.id),
    );

    for cap in &request.required_capabilities {
        let supported = match cap {
            Capability::Vision => meta.supports_vision,
            Capability::FunctionCalling => meta.supports_function_calling,
            Capability::Streaming => meta.supports_streaming,
        };
        if !supported && !channel_declares(candidate, *cap) {
            tracing::debug!(
                channel = %candidate.channel.id,
                model = %candidate.matched_model,
                capability = cap.as_str(),
                "candidate dropped: missing capability"
            );
            return false;
        }
    }

    if meta.context_length < request.min_context_length {
        tracing::debug!(
            channel = %candidate.channel.id,
            model = %candidate.matched_model,
            context = meta.context_length,
            needed = request.min_context_length,
            "candidate dropped: context window too small"
        );
        return false;
    }

    true
}

/// Trim an oversized candidate pool by a weighted (priority, health) key
/// before detailed scoring. Order within the kept set is irrelevant — the
/// scorer re-ranks.
pub fn pre_filter(
    mut candidates: Vec<ChannelCandidate>,
    stats: &ChannelStats,
    limit: usize,
) -> Vec<ChannelCandidate> {
    if candidates.len() <= limit {
        return candidates;
    }
    let key = |c: &ChannelCandidate| {
        let priority_score = 1.0 / (1.0 + c.channel.priority.max(0) as f64);
        let health = stats.health_score(&c.channel.id);
        priority_score * 0.6 + health * 0.4
    };
    candidates.sort_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.channel.id.cmp(&b.channel.id))
    });
    candidates.truncate(limit);
    candidates
}
