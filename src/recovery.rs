//! Background blacklist recovery.
//!
//! Every five minutes, expired non-permanent entries are probed with a
//! lightweight `GET {base_url}/v1/models` using the channel's credentials.
//! A 200 whose model list contains the barred model (case-insensitive
//! substring, both directions) clears the entry; anything else pushes the
//! expiry forward with doubled backoff, capped at one hour. Probe failures
//! never remove entries.
//!
//! Exclusions:
//! - auth errors never auto-recover (admin clears them);
//! - channels holding a permanent auth entry are never probed at all;
//! - a pair is probed at most three times per hour.
//!
//! The loop is cancellable; a stop request drains the tick in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::blacklist::{Blacklist, BlacklistEntry, ErrorKind};
use crate::config::{AuthType, ConfigStore};
use crate::pool::ConnectionPool;

pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS_PER_HOUR: usize = 3;
const ATTEMPT_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct Attempt {
    at: Instant,
    success: bool,
}

/// Outcome counters for one tick, surfaced in logs and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub probed: usize,
    pub recovered: usize,
    pub extended: usize,
}

pub struct RecoveryLoop {
    config: Arc<ConfigStore>,
    blacklist: Arc<Blacklist>,
    pool: Arc<ConnectionPool>,
    attempts: DashMap<String, Vec<Attempt>>,
}

impl RecoveryLoop {
    pub fn new(
        config: Arc<ConfigStore>,
        blacklist: Arc<Blacklist>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            config,
            blacklist,
            pool,
            attempts: DashMap::new(),
        }
    }

    /// Run until cancelled. The tick in flight always completes.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(RECOVERY_INTERVAL);
        interval.tick().await; // immediate first tick is pointless at startup
        info!("blacklist recovery loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    if summary.probed > 0 {
                        info!(
                            probed = summary.probed,
                            recovered = summary.recovered,
                            extended = summary.extended,
                            "recovery tick complete"
                        );
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("blacklist recovery loop stopping");
                    break;
                }
            }
        }
    }

    /// One recovery pass. Public so tests can drive it without the timer.
    pub async fn tick(&self) -> TickSummary {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return TickSummary::default();
        }
        debug!(count = candidates.len(), "recovery candidates found");

        let probes = candidates
            .iter()
            .map(|entry| self.attempt_recovery(entry));
        let results = join_all(probes).await;

        let mut summary = TickSummary {
            probed: results.len(),
            ..Default::default()
        };
        for recovered in results {
            if recovered {
                summary.recovered += 1;
            } else {
                summary.extended += 1;
            }
        }
        summary
    }

    /// Expired, non-permanent, non-auth entries on probeable channels that
    /// have not exhausted their hourly attempt budget.
    fn candidates(&self) -> Vec<BlacklistEntry> {
        self.blacklist
            .expired_entries()
            .into_iter()
            .filter(|e| e.kind != ErrorKind::AuthError)
            .filter(|e| !self.channel_has_permanent_auth(&e.channel_id))
            .filter(|e| {
                self.recent_attempts(&e.channel_id, &e.model_name) < MAX_ATTEMPTS_PER_HOUR
            })
            .collect()
    }

    fn channel_has_permanent_auth(&self, channel_id: &str) -> bool {
        // A channel-wide escalation caused by auth is permanent until the
        // admin clears it; probing it would violate the never-probe rule.
        self.blacklist.is_channel_blacklisted(channel_id)
    }

    fn attempt_key(channel_id: &str, model: &str) -> String {
        format!("{channel_id}#{}", model.to_lowercase())
    }

    fn recent_attempts(&self, channel_id: &str, model: &str) -> usize {
        let key = Self::attempt_key(channel_id, model);
        self.attempts
            .get(&key)
            .map(|log| {
                log.iter()
                    .filter(|a| a.at.elapsed() < ATTEMPT_WINDOW)
                    .count()
            })
            .unwrap_or(0)
    }

    fn record_attempt(&self, channel_id: &str, model: &str, success: bool) {
        let key = Self::attempt_key(channel_id, model);
        let mut log = self.attempts.entry(key).or_default();
        log.push(Attempt {
            at: Instant::now(),
            success,
        });
        // Bound the per-pair history.
        if log.len() > 16 {
            let drain = log.len() - 16;
            log.drain(..drain);
        }
    }

    /// Probe one entry; true when it recovered and was removed.
    async fn attempt_recovery(&self, entry: &BlacklistEntry) -> bool {
        match self.probe(&entry.channel_id, &entry.model_name).await {
            Ok(()) => {
                self.record_attempt(&entry.channel_id, &entry.model_name, true);
                self.blacklist.remove(&entry.channel_id, &entry.model_name);
                info!(
                    channel = %entry.channel_id,
                    model = %entry.model_name,
                    "recovery probe succeeded — entry cleared"
                );
                true
            }
            Err(reason) => {
                self.record_attempt(&entry.channel_id, &entry.model_name, false);
                let extended = entry.backoff.saturating_mul(2);
                self.blacklist
                    .extend(&entry.channel_id, &entry.model_name, extended);
                debug!(
                    channel = %entry.channel_id,
                    model = %entry.model_name,
                    reason = %reason,
                    extended_secs = extended.min(Duration::from_secs(3600)).as_secs(),
                    "recovery probe failed — expiry extended"
                );
                false
            }
        }
    }

    /// `GET {base_url}/v1/models` with the channel's credentials.
    async fn probe(&self, channel_id: &str, model: &str) -> Result<(), String> {
        let config = self.config.get();
        let channel = config
            .channel_by_id(channel_id)
            .ok_or_else(|| format!("channel {channel_id} no longer configured"))?;
        let provider = config.provider(&channel.provider);
        let base_url = channel.effective_base_url(provider);
        if base_url.is_empty() {
            return Err("channel has no base url".to_string());
        }
        let url = format!("{base_url}/v1/models");

        let (header, value) = match provider.map(|p| p.auth_type).unwrap_or_default() {
            AuthType::Bearer => ("authorization", format!("Bearer {}", channel.api_key)),
            AuthType::XApiKey => ("x-api-key", channel.api_key.clone()),
        };

        let response = self
            .pool
            .client(&url)
            .get(&url)
            .header(header, value)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    "probe timeout".to_string()
                } else {
                    format!("probe transport error: {e}")
                }
            })?;

        if !response.status().is_success() {
            return Err(format!("probe returned HTTP {}", response.status()));
        }

        // When the body parses, the target model must appear in the list;
        // an unparseable 200 still counts as healthy.
        let Ok(body) = response.json::<Value>().await else {
            return Ok(());
        };
        let Some(models) = body.get("data").and_then(Value::as_array) else {
            return Ok(());
        };
        let wanted = model.to_lowercase();
        let listed = models
            .iter()
            .filter_map(|m| m.get("id").and_then(Value::as_str))
            .any(|id| {
                let id = id.to_lowercase();
                id.contains(&wanted) || wanted.contains(&id)
            });
        if listed {
            Ok(())
        } else {
            Err(format!("model {model} not present in /v1/models"))
        }
    }
}
