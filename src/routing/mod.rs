//! The routing core: candidate discovery → capability filter → scorer →
//! selection cache, behind one facade.
//!
//! [`Router::route`] is synchronous and pure over shared-state snapshots —
//! all I/O (upstream calls, cache files) happens elsewhere. Errors that the
//! client caused (`tag:` miss, bad selector) surface as values; an empty
//! result means "nothing routable right now" and is the dispatcher's cue
//! for `503 no_channels`.

pub mod cache;
pub mod capability;
pub mod discovery;
pub mod scoring;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::blacklist::Blacklist;
use crate::config::ConfigStore;
use crate::error::GatewayError;
use crate::estimator;
use crate::registry::{ChannelCatalog, ModelRegistry};
use crate::stats::ChannelStats;
use crate::usage::resolve_pricing;

use cache::{CachedSelection, RequestFingerprint, SelectionCache, BACKUP_LIMIT};
use scoring::{Scorer, ScoringContext};
use types::{RoutingRequest, RoutingScore};

/// Facade over the routing pipeline. One instance per process, shared via
/// `Arc` with the dispatcher and the admin API.
pub struct Router {
    config: Arc<ConfigStore>,
    registry: Arc<ModelRegistry>,
    catalog: Arc<ChannelCatalog>,
    blacklist: Arc<Blacklist>,
    stats: Arc<ChannelStats>,
    pub selection_cache: Arc<SelectionCache>,
    scorer: Scorer,
}

impl Router {
    pub fn new(
        config: Arc<ConfigStore>,
        registry: Arc<ModelRegistry>,
        catalog: Arc<ChannelCatalog>,
        blacklist: Arc<Blacklist>,
        stats: Arc<ChannelStats>,
    ) -> Self {
        Self {
            config,
            registry,
            catalog,
            blacklist,
            stats,
            selection_cache: Arc::new(SelectionCache::new()),
            scorer: Scorer::new(),
        }
    }

    /// The strategy name this request resolves to.
    pub fn strategy_name(&self, request: &RoutingRequest) -> String {
        request
            .strategy
            .clone()
            .unwrap_or_else(|| self.config.get().routing.default_strategy.clone())
    }

    /// Run the full pipeline and return ranked candidates, best first.
    pub fn route(&self, request: &RoutingRequest) -> Result<Vec<RoutingScore>, GatewayError> {
        let config = self.config.get();
        let strategy_name = self.strategy_name(request);

        let fingerprint =
            RequestFingerprint::from_request(request, &config.routing.default_strategy);
        let cache_key = fingerprint.to_cache_key();

        if let Some(cached) = self.selection_cache.get(&cache_key) {
            if let Some(scores) = self.scores_from_cache(&cached, &config) {
                info!(model = %request.model, primary = %cached.primary_channel_id, "selection cache hit");
                return Ok(scores);
            }
        }

        let candidates = discovery::discover(&config, &self.catalog, &self.blacklist, request)?;
        debug!(model = %request.model, count = candidates.len(), "discovery complete");
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = capability::filter_by_capabilities(candidates, request, &self.registry);
        debug!(count = candidates.len(), "capability filter complete");
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let candidates =
            capability::pre_filter(candidates, &self.stats, capability::PRE_FILTER_LIMIT);

        let rules = config
            .strategy_rules(&strategy_name)
            .or_else(|| scoring::builtin_strategy("balanced"))
            .expect("balanced strategy always exists");

        let base_urls: HashMap<String, String> = candidates
            .iter()
            .map(|c| {
                let provider = config.provider(&c.channel.provider);
                (
                    c.channel.id.clone(),
                    c.channel.effective_base_url(provider).to_string(),
                )
            })
            .collect();

        let scored = self.scorer.score(
            &candidates,
            &ScoringContext {
                registry: &self.registry,
                stats: &self.stats,
                base_urls: &base_urls,
                rules: &rules,
            },
            &request.model,
        );

        if let Some(best) = scored.first() {
            info!(
                model = %request.model,
                strategy = %strategy_name,
                primary = %best.channel.id,
                matched = %best.matched_model,
                score = best.total_score,
                candidates = scored.len(),
                "routing complete"
            );
            let estimated_cost = self.estimate_for(best, request);
            let backups = scored
                .iter()
                .skip(1)
                .take(BACKUP_LIMIT)
                .map(|s| (s.channel.id.clone(), s.matched_model.clone()))
                .collect();
            self.selection_cache.store(
                cache_key,
                CachedSelection::new(
                    best.channel.id.clone(),
                    best.matched_model.clone(),
                    backups,
                    best.reason.clone(),
                    estimated_cost,
                ),
            );
        }

        Ok(scored)
    }

    /// Pre-flight cost projection for the winning candidate.
    fn estimate_for(&self, score: &RoutingScore, request: &RoutingRequest) -> f64 {
        let meta = self.registry.get(
            &score.matched_model,
            Some(&score.channel.provider),
            Some(&score.channel.id),
        );
        let pricing = resolve_pricing(&meta, &score.channel);
        estimator::estimate_cost(
            request.messages(),
            request.max_tokens,
            pricing.input_per_token,
            pricing.output_per_token,
            pricing.exchange_rate,
        )
        .estimated_cost
    }

    /// Rebuild a ranked list from a cached selection. Returns `None` when the
    /// cached primary no longer exists or is disabled — that forces a fresh
    /// route instead of dispatching into a dead channel.
    fn scores_from_cache(
        &self,
        cached: &CachedSelection,
        config: &crate::config::AppConfig,
    ) -> Option<Vec<RoutingScore>> {
        let primary = config
            .channel_by_id(&cached.primary_channel_id)
            .filter(|c| c.enabled)?;

        let synthetic = |channel: &crate::config::ChannelConfig,
                         matched_model: &str,
                         total: f64,
                         reason: String| RoutingScore {
            channel: channel.clone(),
            matched_model: matched_model.to_string(),
            cost_score: if cached.estimated_cost == 0.0 { 1.0 } else { 0.8 },
            speed_score: 0.9,
            quality_score: 0.8,
            reliability_score: 0.9,
            parameter_score: 0.5,
            context_score: 0.5,
            free_score: if cached.estimated_cost == 0.0 { 1.0 } else { 0.1 },
            local_score: 0.1,
            total_score: total,
            reason,
        };

        let mut scores = vec![synthetic(
            primary,
            &cached.primary_matched_model,
            1.0,
            format!("CACHED: {}", cached.reason),
        )];
        for (index, (channel_id, matched_model)) in cached.backups.iter().enumerate() {
            let Some(channel) = config.channel_by_id(channel_id).filter(|c| c.enabled) else {
                continue;
            };
            scores.push(synthetic(
                channel,
                matched_model,
                0.9 - index as f64 * 0.1,
                format!("CACHED_BACKUP_{}", index + 1),
            ));
        }
        Some(scores)
    }

    /// Shared handles for collaborators that only need parts of the pipeline.
    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    pub fn scorer_sweep(&self) {
        self.scorer.sweep_memo();
    }
}
