//! Request fingerprinting and the short-TTL selection cache.
//!
//! The fingerprint is a canonical serialisation of every routing-relevant
//! request field — equal requests hash to equal keys across runs. Numeric
//! fields that vary harmlessly between calls are bucketed (`max_tokens` to
//! the nearest 512 upward, `temperature` to one decimal) so near-identical
//! requests share cache entries.
//!
//! The cache stores the winning (channel, model) plus up to five backups
//! for 60 seconds behind a single reader-writer lock. Expired entries are
//! evicted lazily on read; a background sweeper reclaims the rest. The
//! dispatcher invalidates a channel's entries the moment it observes a
//! permanent failure there.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::types::RoutingRequest;

pub const SELECTION_TTL: Duration = Duration::from_secs(60);
/// Backups stored beside the primary.
pub const BACKUP_LIMIT: usize = 5;

/// Canonical, hashable routing inputs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequestFingerprint {
    model: String,
    strategy: String,
    required_capabilities: Vec<&'static str>,
    min_context_length: u64,
    max_cost_per_1k: Option<String>,
    prefer_local: bool,
    exclude_providers: Vec<String>,
    max_tokens_bucket: Option<u64>,
    /// Tenths, so float formatting can't perturb the key.
    temperature_tenths: Option<i64>,
    stream: bool,
    has_functions: bool,
}

impl RequestFingerprint {
    pub fn from_request(request: &RoutingRequest, default_strategy: &str) -> Self {
        let mut caps: Vec<&'static str> = request
            .required_capabilities
            .iter()
            .map(|c| c.as_str())
            .collect();
        caps.sort_unstable();

        let mut exclude_providers: Vec<String> = request
            .payload
            .get("exclude_providers")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        exclude_providers.sort_unstable();

        Self {
            model: request.model.clone(),
            strategy: request
                .strategy
                .clone()
                .unwrap_or_else(|| default_strategy.to_string()),
            required_capabilities: caps,
            min_context_length: request.min_context_length,
            max_cost_per_1k: request
                .payload
                .get("max_cost_per_1k")
                .and_then(Value::as_f64)
                .map(|v| format!("{v:.4}")),
            prefer_local: request
                .payload
                .get("prefer_local")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            exclude_providers,
            max_tokens_bucket: request.max_tokens.map(|m| m.div_ceil(512) * 512),
            temperature_tenths: request.temperature.map(|t| (t * 10.0).round() as i64),
            stream: request.stream,
            has_functions: request.has_functions,
        }
    }

    /// SHA-256 hex over the canonical JSON form.
    pub fn to_cache_key(&self) -> String {
        let canonical = serde_json::to_string(self).expect("fingerprint serialises");
        let digest = Sha256::digest(canonical.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// One cached routing decision.
#[derive(Debug, Clone)]
pub struct CachedSelection {
    pub primary_channel_id: String,
    pub primary_matched_model: String,
    /// (channel_id, matched_model) pairs, best first.
    pub backups: Vec<(String, String)>,
    pub reason: String,
    pub estimated_cost: f64,
    cached_at: Instant,
}

impl CachedSelection {
    pub fn new(
        primary_channel_id: String,
        primary_matched_model: String,
        backups: Vec<(String, String)>,
        reason: String,
        estimated_cost: f64,
    ) -> Self {
        Self {
            primary_channel_id,
            primary_matched_model,
            backups,
            reason,
            estimated_cost,
            cached_at: Instant::now(),
        }
    }

    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= SELECTION_TTL
    }

    fn involves_channel(&self, channel_id: &str) -> bool {
        self.primary_channel_id == channel_id
            || self.backups.iter().any(|(c, _)| c == channel_id)
    }
}

/// The 60 s selection cache.
#[derive(Default)]
pub struct SelectionCache {
    entries: RwLock<HashMap<String, CachedSelection>>,
}

impl SelectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<CachedSelection> {
        {
            let entries = self.entries.read().expect("selection cache poisoned");
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired() => return Some(entry.clone()),
                Some(_) => {}
            }
        }
        // Expired: evict under the write lock.
        self.entries
            .write()
            .expect("selection cache poisoned")
            .remove(key);
        None
    }

    pub fn store(&self, key: String, selection: CachedSelection) {
        self.entries
            .write()
            .expect("selection cache poisoned")
            .insert(key, selection);
    }

    /// Drop every entry whose primary or backups touch `channel_id`.
    pub fn invalidate_channel(&self, channel_id: &str) -> usize {
        let mut entries = self.entries.write().expect("selection cache poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !entry.involves_channel(channel_id));
        before - entries.len()
    }

    /// Periodic sweep of expired entries.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write().expect("selection cache poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("selection cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
