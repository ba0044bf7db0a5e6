//! Multi-factor candidate scoring.
//!
//! Eight dimensions, each a pure function into [0,1]; a strategy is a list
//! of weighted rules over those dimensions; the total is the weighted sum
//! (with `asc` rules contributing `1 − score`). Final ordering is
//! hierarchical: totals within [`EPSILON`] tie-break by channel priority
//! (asc), then parameter score (desc), then channel id (asc) — fully
//! deterministic for equal inputs.
//!
//! For five or more candidates the scorer takes the batch path: one
//! metadata pass per distinct (channel, model) pair, with the four
//! metadata-derived dimensions memoised by `(sorted channel ids, model)`
//! for five minutes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::{ChannelConfig, ScoreField, SortOrder, StrategyRule};
use crate::registry::{quality_from_parameters, ModelMetadata, ModelRegistry};
use crate::stats::ChannelStats;

use super::types::{ChannelCandidate, RoutingScore};

/// Totals closer than this are considered tied.
pub const EPSILON: f64 = 1e-6;

/// Candidate count at which the batch path engages.
const BATCH_THRESHOLD: usize = 5;

/// Lifetime of memoised model-spec dimensions.
const MEMO_TTL: Duration = Duration::from_secs(300);

/// Reference price ceiling for cost normalisation: $10 per 1M tokens
/// (blended) scores 0.
const COST_CEILING_PER_1M: f64 = 10.0;

/// Latency at which the speed score bottoms out.
const SPEED_CEILING_MS: f64 = 2000.0;

/// Speed score for channels with neither latency samples nor an operator hint.
const DEFAULT_SPEED_SCORE: f64 = 0.8;

fn rule(field: ScoreField, weight: f64) -> StrategyRule {
    StrategyRule {
        field,
        order: SortOrder::Desc,
        weight,
    }
}

/// Built-in strategies. Config-defined strategies with the same name win.
pub fn builtin_strategy(name: &str) -> Option<Vec<StrategyRule>> {
    use ScoreField::*;
    let rules = match name {
        "cost_first" => vec![rule(Cost, 0.6), rule(Free, 0.2), rule(Quality, 0.1), rule(Reliability, 0.1)],
        "free_first" => vec![rule(Free, 0.7), rule(Cost, 0.1), rule(Quality, 0.1), rule(Reliability, 0.1)],
        "local_first" => vec![rule(Local, 0.6), rule(Speed, 0.2), rule(Quality, 0.1), rule(Reliability, 0.1)],
        "cost_optimized" => vec![rule(Cost, 0.5), rule(Quality, 0.2), rule(Reliability, 0.2), rule(Speed, 0.1)],
        "speed_optimized" => vec![rule(Speed, 0.5), rule(Reliability, 0.2), rule(Cost, 0.15), rule(Quality, 0.15)],
        "quality_optimized" => vec![rule(Quality, 0.45), rule(Parameter, 0.2), rule(Reliability, 0.2), rule(Context, 0.15)],
        "balanced" => vec![
            rule(Cost, 0.2),
            rule(Quality, 0.2),
            rule(Reliability, 0.2),
            rule(Speed, 0.15),
            rule(Context, 0.1),
            rule(Parameter, 0.05),
            rule(Free, 0.05),
            rule(Local, 0.05),
        ],
        _ => return None,
    };
    Some(rules)
}

// ─────────────────────────────────────────────────────────────────────────────
// Dimension functions — pure, individually testable
// ─────────────────────────────────────────────────────────────────────────────

/// Blended effective price (per 1M tokens) after currency exchange, using
/// registry pricing when present and the channel's per-token fallback
/// otherwise. `None` means "no pricing anywhere" — treated as free.
fn blended_price_per_million(meta: &ModelMetadata, channel: &ChannelConfig) -> Option<f64> {
    let rate = channel
        .currency_exchange
        .as_ref()
        .map(|x| x.rate)
        .unwrap_or(1.0);
    if meta.pricing_input > 0.0 || meta.pricing_output > 0.0 {
        return Some((meta.pricing_input + meta.pricing_output) / 2.0 * rate);
    }
    let cost = channel.cost_per_token?;
    if cost.input == 0.0 && cost.output == 0.0 {
        return None;
    }
    Some((cost.input + cost.output) / 2.0 * 1e6 * rate)
}

pub fn cost_score(meta: &ModelMetadata, channel: &ChannelConfig) -> f64 {
    match blended_price_per_million(meta, channel) {
        None => 1.0,
        Some(price) => 1.0 - (price / COST_CEILING_PER_1M).min(1.0),
    }
}

pub fn speed_score(channel: &ChannelConfig, stats: &ChannelStats) -> f64 {
    if let Some(avg_ms) = stats.avg_latency_ms(&channel.id) {
        return (1.0 - avg_ms / SPEED_CEILING_MS).clamp(0.1, 1.0);
    }
    channel
        .performance
        .as_ref()
        .and_then(|p| p.speed_score)
        .map(|hint| hint.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_SPEED_SCORE)
}

pub fn quality_score(meta: &ModelMetadata) -> f64 {
    meta.quality_score
        .unwrap_or_else(|| quality_from_parameters(meta.parameter_count))
}

pub fn reliability_score(channel: &ChannelConfig, stats: &ChannelStats) -> f64 {
    stats.reliability(&channel.id)
}

pub fn parameter_score(meta: &ModelMetadata) -> f64 {
    quality_from_parameters(meta.parameter_count)
}

pub fn context_score(meta: &ModelMetadata) -> f64 {
    match meta.context_length {
        c if c >= 1_000_000 => 1.0,
        c if c >= 200_000 => 0.9,
        c if c >= 32_000 => 0.8,
        c if c >= 16_000 => 0.7,
        c if c >= 8_000 => 0.6,
        c if c >= 4_000 => 0.5,
        _ => 0.3,
    }
}

pub fn free_score(meta: &ModelMetadata, channel: &ChannelConfig) -> f64 {
    if blended_price_per_million(meta, channel).is_none() {
        1.0
    } else {
        0.1
    }
}

const LOCAL_TAGS: &[&str] = &["local", "localhost", "ollama", "lmstudio", "self-hosted"];

fn is_private_or_loopback_host(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        return ip.is_loopback() || ip.is_private();
    }
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<std::net::Ipv6Addr>() {
        return ip.is_loopback();
    }
    false
}

pub fn local_score(channel: &ChannelConfig, base_url: &str) -> f64 {
    let tagged_local = channel
        .tags
        .iter()
        .any(|t| LOCAL_TAGS.contains(&t.to_lowercase().as_str()));
    if tagged_local || is_private_or_loopback_host(base_url) {
        1.0
    } else {
        0.1
    }
}

/// Weighted total over the strategy rules.
pub fn total_score(rules: &[StrategyRule], dims: &Dimensions) -> f64 {
    rules
        .iter()
        .map(|rule| {
            let value = dims.get(rule.field);
            let oriented = match rule.order {
                SortOrder::Desc => value,
                SortOrder::Asc => 1.0 - value,
            };
            rule.weight * oriented
        })
        .sum()
}

/// All eight dimension values for one candidate.
#[derive(Debug, Clone, Copy)]
pub struct Dimensions {
    pub cost: f64,
    pub speed: f64,
    pub quality: f64,
    pub reliability: f64,
    pub parameter: f64,
    pub context: f64,
    pub free: f64,
    pub local: f64,
}

impl Dimensions {
    fn get(&self, field: ScoreField) -> f64 {
        match field {
            ScoreField::Cost => self.cost,
            ScoreField::Speed => self.speed,
            ScoreField::Quality => self.quality,
            ScoreField::Reliability => self.reliability,
            ScoreField::Parameter => self.parameter,
            ScoreField::Context => self.context,
            ScoreField::Free => self.free,
            ScoreField::Local => self.local,
        }
    }
}

/// The metadata-derived half of [`Dimensions`], cheap to memoise.
#[derive(Debug, Clone, Copy)]
struct SpecDims {
    quality: f64,
    parameter: f64,
    context: f64,
    free: f64,
}

struct MemoEntry {
    at: Instant,
    dims: HashMap<String, SpecDims>,
}

/// The scorer, with its batch memo. One instance per process.
#[derive(Default)]
pub struct Scorer {
    memo: DashMap<String, MemoEntry>,
}

/// Everything the scorer needs besides the candidates.
pub struct ScoringContext<'a> {
    pub registry: &'a ModelRegistry,
    pub stats: &'a ChannelStats,
    /// Resolver from channel → effective base URL (provider default applied).
    pub base_urls: &'a HashMap<String, String>,
    pub rules: &'a [StrategyRule],
}

impl Scorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score and rank a candidate set. Always returns exactly one
    /// [`RoutingScore`] per input candidate.
    pub fn score(
        &self,
        candidates: &[ChannelCandidate],
        ctx: &ScoringContext<'_>,
        request_model: &str,
    ) -> Vec<RoutingScore> {
        let spec_dims = if candidates.len() >= BATCH_THRESHOLD {
            Some(self.batch_spec_dims(candidates, ctx, request_model))
        } else {
            None
        };

        let mut scored: Vec<RoutingScore> = candidates
            .iter()
            .map(|candidate| {
                let meta = ctx.registry.get(
                    &candidate.matched_model,
                    Some(&candidate.channel.provider),
                    Some(&candidate.channel.id),
                );
                let spec = spec_dims
                    .as_ref()
                    .and_then(|m| m.get(&candidate_key(candidate)).copied())
                    .unwrap_or_else(|| spec_dims_for(&meta, &candidate.channel));

                let base_url = ctx
                    .base_urls
                    .get(&candidate.channel.id)
                    .map(String::as_str)
                    .unwrap_or("");
                let dims = Dimensions {
                    cost: cost_score(&meta, &candidate.channel),
                    speed: speed_score(&candidate.channel, ctx.stats),
                    reliability: reliability_score(&candidate.channel, ctx.stats),
                    local: local_score(&candidate.channel, base_url),
                    quality: spec.quality,
                    parameter: spec.parameter,
                    context: spec.context,
                    free: spec.free,
                };
                let total = total_score(ctx.rules, &dims);
                RoutingScore {
                    channel: candidate.channel.clone(),
                    matched_model: candidate.matched_model.clone(),
                    cost_score: dims.cost,
                    speed_score: dims.speed,
                    quality_score: dims.quality,
                    reliability_score: dims.reliability,
                    parameter_score: dims.parameter,
                    context_score: dims.context,
                    free_score: dims.free,
                    local_score: dims.local,
                    total_score: total,
                    reason: format!(
                        "cost:{:.2} speed:{:.2} quality:{:.2} reliability:{:.2}",
                        dims.cost, dims.speed, dims.quality, dims.reliability
                    ),
                }
            })
            .collect();

        hierarchical_sort(&mut scored);
        scored
    }

    /// One metadata pass over the batch, memoised by (sorted ids, model).
    fn batch_spec_dims(
        &self,
        candidates: &[ChannelCandidate],
        ctx: &ScoringContext<'_>,
        request_model: &str,
    ) -> HashMap<String, SpecDims> {
        let mut ids: Vec<&str> = candidates.iter().map(|c| c.channel.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        let memo_key = format!("{}|{request_model}", ids.join(","));

        if let Some(entry) = self.memo.get(&memo_key) {
            if entry.at.elapsed() < MEMO_TTL {
                return entry.dims.clone();
            }
        }

        let mut dims = HashMap::with_capacity(candidates.len());
        for candidate in candidates {
            let key = candidate_key(candidate);
            if dims.contains_key(&key) {
                continue;
            }
            let meta = ctx.registry.get(
                &candidate.matched_model,
                Some(&candidate.channel.provider),
                Some(&candidate.channel.id),
            );
            dims.insert(key, spec_dims_for(&meta, &candidate.channel));
        }

        self.memo.insert(
            memo_key,
            MemoEntry {
                at: Instant::now(),
                dims: dims.clone(),
            },
        );
        dims
    }

    /// Drop memo entries past their TTL (called by the cache sweeper).
    pub fn sweep_memo(&self) {
        self.memo.retain(|_, entry| entry.at.elapsed() < MEMO_TTL);
    }
}

fn candidate_key(candidate: &ChannelCandidate) -> String {
    format!("{}#{}", candidate.channel.id, candidate.matched_model)
}

fn spec_dims_for(meta: &ModelMetadata, channel: &ChannelConfig) -> SpecDims {
    SpecDims {
        quality: quality_score(meta),
        parameter: parameter_score(meta),
        context: context_score(meta),
        free: free_score(meta, channel),
    }
}

/// Stable hierarchical ordering: total desc (ε-tied), priority asc,
/// parameter desc, id asc.
pub fn hierarchical_sort(scores: &mut [RoutingScore]) {
    scores.sort_by(|a, b| {
        if (a.total_score - b.total_score).abs() > EPSILON {
            return b
                .total_score
                .partial_cmp(&a.total_score)
                .unwrap_or(std::cmp::Ordering::Equal);
        }
        a.channel
            .priority
            .cmp(&b.channel.priority)
            .then_with(|| {
                b.parameter_score
                    .partial_cmp(&a.parameter_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.channel.id.cmp(&b.channel.id))
    });
}
