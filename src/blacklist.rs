//! (channel, model) blacklist with typed error classification.
//!
//! Failures are classified into an [`ErrorKind`] which fixes the initial
//! backoff; repeated failures double the backoff up to one hour. Three
//! conditions escalate to a **channel-wide** blacklist (every model on the
//! channel is barred): any auth error, five total failures, or three
//! distinct models simultaneously blacklisted.
//!
//! Expired entries are garbage-collected on read, so queries stay O(1) and
//! no sweeper is required for correctness (the periodic `cleanup_expired`
//! only reclaims memory for keys nobody queries).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tracing::{error, info, warn};

/// Longest backoff any entry can reach.
const MAX_BACKOFF: Duration = Duration::from_secs(3600);
/// Total failures after which the whole channel is barred.
const CHANNEL_FAILURE_LIMIT: u32 = 5;
/// Simultaneously blacklisted models after which the whole channel is barred.
const CHANNEL_MODEL_LIMIT: usize = 3;

/// Typed failure classes, ordered roughly by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    AuthError,
    ModelUnavailable,
    QuotaExceeded,
    ServerError,
    Timeout,
    ConnectionError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::AuthError => "auth_error",
            Self::ModelUnavailable => "model_unavailable",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ServerError => "server_error",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection_error",
            Self::Unknown => "unknown",
        }
    }
}

/// Result of classifying one upstream failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classified {
    pub kind: ErrorKind,
    /// `None` for permanent failures.
    pub backoff: Option<Duration>,
    pub permanent: bool,
}

/// Classify an upstream failure by status code and message body.
///
/// `code` 0 means a non-HTTP failure; pass [`ErrorKind::Timeout`] /
/// [`ErrorKind::ConnectionError`] through [`classify_transport`] instead.
pub fn classify(code: u16, message: &str) -> Classified {
    let lower = message.to_lowercase();
    match code {
        401 => permanent(),
        403 => {
            if lower.contains("rate") || lower.contains("limit") {
                temporary(ErrorKind::RateLimit, 10)
            } else {
                permanent()
            }
        }
        404 => temporary(ErrorKind::ModelUnavailable, 300),
        429 => {
            if lower.contains("quota") || lower.contains("balance") {
                temporary(ErrorKind::QuotaExceeded, 1800)
            } else if let Some(wait) = extract_retry_after(&lower) {
                temporary(ErrorKind::RateLimit, wait.min(300))
            } else {
                temporary(ErrorKind::RateLimit, 10)
            }
        }
        c if c >= 500 => temporary(ErrorKind::ServerError, 60),
        _ => temporary(ErrorKind::Unknown, 60),
    }
}

/// Classify a transport-level failure (no HTTP status).
pub fn classify_transport(timed_out: bool) -> Classified {
    if timed_out {
        temporary(ErrorKind::Timeout, 30)
    } else {
        temporary(ErrorKind::ConnectionError, 30)
    }
}

fn permanent() -> Classified {
    Classified {
        kind: ErrorKind::AuthError,
        backoff: None,
        permanent: true,
    }
}

fn temporary(kind: ErrorKind, secs: u64) -> Classified {
    Classified {
        kind,
        backoff: Some(Duration::from_secs(secs)),
        permanent: false,
    }
}

/// Pull a suggested wait (seconds) out of a rate-limit message body.
///
/// Handles the phrasings the big providers actually emit; matches are capped
/// by the caller.
pub fn extract_retry_after(lower_message: &str) -> Option<u64> {
    for marker in [
        "retry after ",
        "retry-after: ",
        "try again in ",
        "please wait ",
        "wait ",
    ] {
        let Some(idx) = lower_message.find(marker) else {
            continue;
        };
        let rest = &lower_message[idx + marker.len()..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if let Ok(secs) = digits.parse::<u64>() {
            if secs > 0 {
                return Some(secs);
            }
        }
    }
    None
}

/// One barred (channel, model) pair.
#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub channel_id: String,
    pub model_name: String,
    pub kind: ErrorKind,
    pub error_code: u16,
    pub error_message: String,
    pub blacklisted_at: DateTime<Utc>,
    /// `None` for permanent entries.
    pub expires_at: Option<Instant>,
    pub failure_count: u32,
    pub is_permanent: bool,
    pub backoff: Duration,
}

impl BlacklistEntry {
    pub fn is_expired(&self) -> bool {
        self.expires_at_passed(Instant::now())
    }

    fn expires_at_passed(&self, now: Instant) -> bool {
        match (self.is_permanent, self.expires_at) {
            (true, _) | (false, None) => false,
            (false, Some(at)) => now >= at,
        }
    }

    /// Seconds until expiry; -1 for permanent entries.
    pub fn remaining_secs(&self) -> i64 {
        match (self.is_permanent, self.expires_at) {
            (true, _) | (false, None) => -1,
            (false, Some(at)) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
        }
    }
}

/// JSON view of the blacklist for the status and admin APIs.
#[derive(Debug, Serialize)]
pub struct BlacklistSnapshot {
    pub total: usize,
    pub permanent: usize,
    pub channel_wide: Vec<String>,
    pub entries: Vec<BlacklistEntryView>,
}

#[derive(Debug, Serialize)]
pub struct BlacklistEntryView {
    pub channel_id: String,
    pub model: String,
    pub error_type: ErrorKind,
    pub error_code: u16,
    pub failure_count: u32,
    pub remaining_secs: i64,
}

/// Concurrent (channel, model) blacklist with channel-wide escalation.
#[derive(Default)]
pub struct Blacklist {
    entries: DashMap<String, BlacklistEntry>,
    channel_failures: DashMap<String, u32>,
    channel_wide: DashSet<String>,
}

fn entry_key(channel_id: &str, model_name: &str) -> String {
    format!("{channel_id}#{}", model_name.to_lowercase())
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `(channel, model)` and return whether the whole
    /// channel escalated to blacklisted as a result.
    pub fn add(
        &self,
        channel_id: &str,
        model_name: &str,
        error_code: u16,
        error_message: &str,
    ) -> bool {
        self.add_classified(
            channel_id,
            model_name,
            error_code,
            error_message,
            classify(error_code, error_message),
        )
    }

    /// Same as [`add`](Self::add) with a pre-computed classification — used
    /// for transport failures that carry no HTTP status.
    pub fn add_classified(
        &self,
        channel_id: &str,
        model_name: &str,
        error_code: u16,
        error_message: &str,
        classified: Classified,
    ) -> bool {
        let key = entry_key(channel_id, model_name);
        let now = Instant::now();
        let base = classified.backoff.unwrap_or(Duration::ZERO);

        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.failure_count += 1;
                entry.kind = classified.kind;
                entry.error_code = error_code;
                entry.error_message = error_message.to_string();
                entry.blacklisted_at = Utc::now();
                entry.is_permanent = entry.is_permanent || classified.permanent;

                if entry.is_permanent {
                    entry.expires_at = None;
                } else {
                    // Exponential backoff once a pair has failed twice.
                    let backoff = if entry.failure_count >= 2 {
                        let doubled = base
                            .saturating_mul(1 << (entry.failure_count - 1).min(12));
                        doubled.min(MAX_BACKOFF)
                    } else {
                        base
                    };
                    entry.backoff = backoff;
                    entry.expires_at = Some(now + backoff);
                }
                warn!(
                    channel = %channel_id,
                    model = %model_name,
                    failures = entry.failure_count,
                    kind = classified.kind.as_str(),
                    backoff_secs = entry.backoff.as_secs(),
                    permanent = entry.is_permanent,
                    "blacklist entry updated"
                );
            }
            Entry::Vacant(vacant) => {
                warn!(
                    channel = %channel_id,
                    model = %model_name,
                    kind = classified.kind.as_str(),
                    code = error_code,
                    backoff_secs = base.as_secs(),
                    permanent = classified.permanent,
                    "model blacklisted"
                );
                vacant.insert(BlacklistEntry {
                    channel_id: channel_id.to_string(),
                    model_name: model_name.to_string(),
                    kind: classified.kind,
                    error_code,
                    error_message: error_message.to_string(),
                    blacklisted_at: Utc::now(),
                    expires_at: (!classified.permanent).then(|| now + base),
                    failure_count: 1,
                    is_permanent: classified.permanent,
                    backoff: base,
                });
            }
        }

        let total_failures = {
            let mut counter = self.channel_failures.entry(channel_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        let escalate = classified.kind == ErrorKind::AuthError
            || total_failures >= CHANNEL_FAILURE_LIMIT
            || self.active_models_for_channel(channel_id).len() >= CHANNEL_MODEL_LIMIT;

        if escalate && self.channel_wide.insert(channel_id.to_string()) {
            error!(
                channel = %channel_id,
                failures = total_failures,
                "channel escalated to channel-wide blacklist"
            );
        }
        escalate
    }

    /// True (with the entry when per-model) iff the pair is currently barred.
    ///
    /// Expired entries are removed as a side effect of the lookup.
    pub fn is_model_blacklisted(
        &self,
        channel_id: &str,
        model_name: &str,
    ) -> (bool, Option<BlacklistEntry>) {
        if self.channel_wide.contains(channel_id) {
            return (true, None);
        }

        let key = entry_key(channel_id, model_name);
        let expired = match self.entries.get(&key) {
            None => return (false, None),
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return (true, Some(entry.clone())),
        };
        if expired {
            self.entries.remove(&key);
            info!(channel = %channel_id, model = %model_name, "blacklist entry expired");
        }
        (false, None)
    }

    pub fn is_channel_blacklisted(&self, channel_id: &str) -> bool {
        self.channel_wide.contains(channel_id)
    }

    /// Unexpired per-model entries currently barring models on a channel.
    fn active_models_for_channel(&self, channel_id: &str) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.channel_id == channel_id && !e.expires_at_passed(now))
            .map(|e| e.model_name.clone())
            .collect()
    }

    pub fn blacklisted_models_for_channel(&self, channel_id: &str) -> Vec<String> {
        self.cleanup_expired();
        self.active_models_for_channel(channel_id)
    }

    /// Subset of `all_ids` on which `model_name` may still be attempted.
    pub fn available_channels_for_model(
        &self,
        model_name: &str,
        all_ids: &[String],
    ) -> Vec<String> {
        all_ids
            .iter()
            .filter(|id| !self.is_model_blacklisted(id, model_name).0)
            .cloned()
            .collect()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.expires_at_passed(now));
        before - self.entries.len()
    }

    /// Remove one pair (recovery or admin). Returns whether it existed.
    pub fn remove(&self, channel_id: &str, model_name: &str) -> bool {
        let removed = self
            .entries
            .remove(&entry_key(channel_id, model_name))
            .is_some();
        if removed {
            info!(channel = %channel_id, model = %model_name, "blacklist entry removed");
        }
        removed
    }

    /// Admin: clear a channel's channel-wide flag, its failure counter, and
    /// every per-model entry (including permanent ones).
    pub fn clear_channel(&self, channel_id: &str) -> usize {
        self.channel_wide.remove(channel_id);
        self.channel_failures.remove(channel_id);
        let before = self.entries.len();
        self.entries.retain(|_, e| e.channel_id != channel_id);
        let removed = before - self.entries.len();
        info!(channel = %channel_id, removed, "channel blacklist cleared by admin");
        removed
    }

    /// Non-permanent entries whose expiry has passed — recovery candidates.
    pub fn expired_entries(&self) -> Vec<BlacklistEntry> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| !e.is_permanent && e.expires_at_passed(now))
            .map(|e| e.clone())
            .collect()
    }

    /// Push a pair's expiry forward (recovery probe failed).
    pub fn extend(&self, channel_id: &str, model_name: &str, backoff: Duration) {
        if let Some(mut entry) = self.entries.get_mut(&entry_key(channel_id, model_name)) {
            let capped = backoff.min(MAX_BACKOFF);
            entry.backoff = capped;
            entry.expires_at = Some(Instant::now() + capped);
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_mut_for_tests(
        &self,
        channel_id: &str,
        model: &str,
    ) -> Option<dashmap::mapref::one::RefMut<'_, String, BlacklistEntry>> {
        self.entries.get_mut(&entry_key(channel_id, model))
    }

    pub fn snapshot(&self) -> BlacklistSnapshot {
        self.cleanup_expired();
        let mut entries: Vec<BlacklistEntryView> = self
            .entries
            .iter()
            .map(|e| BlacklistEntryView {
                channel_id: e.channel_id.clone(),
                model: e.model_name.clone(),
                error_type: e.kind,
                error_code: e.error_code,
                failure_count: e.failure_count,
                remaining_secs: e.remaining_secs(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.channel_id, &a.model).cmp(&(&b.channel_id, &b.model)));
        let mut channel_wide: Vec<String> =
            self.channel_wide.iter().map(|c| c.clone()).collect();
        channel_wide.sort();
        BlacklistSnapshot {
            total: entries.len(),
            permanent: entries.iter().filter(|e| e.remaining_secs == -1).count(),
            channel_wide,
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Classification table
    // -----------------------------------------------------------------------

    #[test]
    fn auth_statuses_are_permanent() {
        let c = classify(401, "invalid api key");
        assert_eq!(c.kind, ErrorKind::AuthError);
        assert!(c.permanent);
        assert!(c.backoff.is_none());

        let c = classify(403, "access denied");
        assert!(c.permanent);
    }

    #[test]
    fn rate_limited_403_is_temporary() {
        let c = classify(403, "Rate limit exceeded for this key");
        assert_eq!(c.kind, ErrorKind::RateLimit);
        assert_eq!(c.backoff, Some(Duration::from_secs(10)));
        assert!(!c.permanent);
    }

    #[test]
    fn not_found_is_model_unavailable() {
        let c = classify(404, "model does not exist");
        assert_eq!(c.kind, ErrorKind::ModelUnavailable);
        assert_eq!(c.backoff, Some(Duration::from_secs(300)));
    }

    #[test]
    fn quota_429_gets_long_backoff() {
        let c = classify(429, "insufficient quota, check your balance");
        assert_eq!(c.kind, ErrorKind::QuotaExceeded);
        assert_eq!(c.backoff, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn plain_429_uses_short_backoff() {
        let c = classify(429, "too many requests");
        assert_eq!(c.kind, ErrorKind::RateLimit);
        assert_eq!(c.backoff, Some(Duration::from_secs(10)));
    }

    #[test]
    fn retry_after_hint_is_honored_and_capped() {
        let c = classify(429, "rate limited, retry after 45 seconds");
        assert_eq!(c.backoff, Some(Duration::from_secs(45)));

        let c = classify(429, "retry after 9000 seconds");
        assert_eq!(c.backoff, Some(Duration::from_secs(300)), "hint capped at 300s");
    }

    #[test]
    fn server_errors_and_unknowns() {
        assert_eq!(classify(500, "oops").kind, ErrorKind::ServerError);
        assert_eq!(classify(503, "").backoff, Some(Duration::from_secs(60)));
        assert_eq!(classify(418, "teapot").kind, ErrorKind::Unknown);
    }

    #[test]
    fn transport_classification() {
        assert_eq!(classify_transport(true).kind, ErrorKind::Timeout);
        assert_eq!(
            classify_transport(false).backoff,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn extract_retry_after_patterns() {
        assert_eq!(extract_retry_after("please try again in 30 seconds"), Some(30));
        assert_eq!(extract_retry_after("retry after 5 seconds"), Some(5));
        assert_eq!(extract_retry_after("no hint here"), None);
    }

    // -----------------------------------------------------------------------
    // Entry lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn add_and_query_roundtrip() {
        let bl = Blacklist::new();
        assert!(!bl.add("c1", "gpt-4o-mini", 500, "server error"));

        let (barred, entry) = bl.is_model_blacklisted("c1", "gpt-4o-mini");
        assert!(barred);
        let entry = entry.unwrap();
        assert_eq!(entry.kind, ErrorKind::ServerError);
        assert_eq!(entry.failure_count, 1);

        // Lookup is case-insensitive on the model name.
        assert!(bl.is_model_blacklisted("c1", "GPT-4O-MINI").0);
        // Other pairs unaffected.
        assert!(!bl.is_model_blacklisted("c1", "other-model").0);
        assert!(!bl.is_model_blacklisted("c2", "gpt-4o-mini").0);
    }

    #[test]
    fn refail_doubles_backoff_capped_at_one_hour() {
        let bl = Blacklist::new();
        bl.add("c1", "m", 429, "quota exceeded, balance empty"); // base 1800s
        bl.add("c1", "m", 429, "quota exceeded, balance empty"); // fc=2 → 3600
        let (_, entry) = bl.is_model_blacklisted("c1", "m");
        assert_eq!(entry.as_ref().unwrap().backoff, Duration::from_secs(3600));

        bl.add("c1", "m", 429, "quota exceeded, balance empty"); // fc=3 → capped
        let (_, entry) = bl.is_model_blacklisted("c1", "m");
        assert_eq!(entry.unwrap().backoff, MAX_BACKOFF);
    }

    #[test]
    fn permanent_entry_has_no_expiry_and_survives_refail() {
        let bl = Blacklist::new();
        bl.add("c1", "m", 401, "bad key");
        let (_, entry) = bl.is_model_blacklisted("c1", "m");
        let entry = entry.unwrap();
        assert!(entry.is_permanent);
        assert!(entry.expires_at.is_none());
        assert_eq!(entry.remaining_secs(), -1);

        // A later temporary failure must not demote the entry.
        bl.add("c1", "m", 500, "oops");
        let (_, entry) = bl.is_model_blacklisted("c1", "m");
        assert!(entry.unwrap().is_permanent);
    }

    // -----------------------------------------------------------------------
    // Channel-wide escalation
    // -----------------------------------------------------------------------

    #[test]
    fn auth_error_escalates_immediately() {
        let bl = Blacklist::new();
        assert!(bl.add("c1", "m", 401, "invalid key"));
        assert!(bl.is_channel_blacklisted("c1"));
        // Every model on the channel is now barred.
        assert!(bl.is_model_blacklisted("c1", "never-seen-model").0);
    }

    #[test]
    fn five_total_failures_escalate() {
        let bl = Blacklist::new();
        for i in 0..4 {
            assert!(!bl.add("c1", "model-a", 500, &format!("fail {i}")));
        }
        assert!(bl.add("c1", "model-a", 500, "fifth failure"));
        assert!(bl.is_channel_blacklisted("c1"));
    }

    #[test]
    fn three_distinct_blacklisted_models_escalate() {
        let bl = Blacklist::new();
        assert!(!bl.add("c1", "model-a", 500, "x"));
        assert!(!bl.add("c1", "model-b", 500, "x"));
        // Third distinct model trips the limit.
        assert!(bl.add("c1", "model-c", 500, "x"));
    }

    #[test]
    fn clear_channel_resets_everything() {
        let bl = Blacklist::new();
        bl.add("c1", "m", 401, "bad key");
        assert!(bl.is_channel_blacklisted("c1"));

        let removed = bl.clear_channel("c1");
        assert_eq!(removed, 1);
        assert!(!bl.is_channel_blacklisted("c1"));
        assert!(!bl.is_model_blacklisted("c1", "m").0);
        // Failure counter restarted — next failure does not re-escalate.
        assert!(!bl.add("c1", "m", 500, "x"));
    }

    // -----------------------------------------------------------------------
    // Expiry & recovery hooks
    // -----------------------------------------------------------------------

    #[test]
    fn expired_entry_is_gc_ed_on_read() {
        let bl = Blacklist::new();
        bl.add_classified(
            "c1",
            "m",
            500,
            "x",
            Classified {
                kind: ErrorKind::ServerError,
                backoff: Some(Duration::ZERO),
                permanent: false,
            },
        );
        // Zero backoff → already expired.
        let (barred, _) = bl.is_model_blacklisted("c1", "m");
        assert!(!barred);
        assert_eq!(bl.entries.len(), 0, "expired entry must be removed on read");
    }

    #[test]
    fn expired_entries_skips_permanent() {
        let bl = Blacklist::new();
        bl.add("c1", "m1", 401, "bad key");
        bl.add_classified(
            "c2",
            "m2",
            500,
            "x",
            Classified {
                kind: ErrorKind::ServerError,
                backoff: Some(Duration::ZERO),
                permanent: false,
            },
        );
        let expired = bl.expired_entries();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].channel_id, "c2");
    }

    #[test]
    fn extend_pushes_expiry_forward() {
        let bl = Blacklist::new();
        bl.add_classified(
            "c1",
            "m",
            500,
            "x",
            Classified {
                kind: ErrorKind::ServerError,
                backoff: Some(Duration::ZERO),
                permanent: false,
            },
        );
        bl.extend("c1", "m", Duration::from_secs(120));
        let (barred, entry) = bl.is_model_blacklisted("c1", "m");
        assert!(barred);
        assert_eq!(entry.unwrap().backoff, Duration::from_secs(120));
    }

    #[test]
    fn available_channels_excludes_barred_ones() {
        let bl = Blacklist::new();
        bl.add("c1", "m", 500, "x");
        let all = vec!["c1".to_string(), "c2".to_string()];
        assert_eq!(bl.available_channels_for_model("m", &all), vec!["c2"]);
    }

    #[test]
    fn snapshot_counts_and_sorts() {
        let bl = Blacklist::new();
        bl.add("c2", "m2", 500, "x");
        bl.add("c1", "m1", 401, "bad key");
        let snap = bl.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.permanent, 1);
        assert_eq!(snap.channel_wide, vec!["c1"]);
        assert_eq!(snap.entries[0].channel_id, "c1");
    }
}
