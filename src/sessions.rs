//! Per-client session accounting.
//!
//! A session identifies "the same caller" across requests without storing
//! the raw credential: the key is a SHA-256 over the masked API key, the
//! first 100 bytes of the User-Agent, and the client IP when known. Sessions
//! expire after one hour idle and exist purely to enrich the summary event
//! with cumulative cost — they are not an isolation boundary.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

const SESSION_IDLE_SECS: i64 = 3600;

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub total_requests: u64,
    pub total_cost: f64,
    pub models_used: HashMap<String, u64>,
    pub channels_used: HashMap<String, u64>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    fn new() -> Self {
        Self {
            total_requests: 0,
            total_cost: 0.0,
            models_used: HashMap::new(),
            channels_used: HashMap::new(),
            last_active_at: Utc::now(),
        }
    }
}

/// Build the opaque session key for a caller.
///
/// The API key is masked to its first 8 chars before hashing so the full
/// credential never reaches the hash input; the UA is truncated to 100 bytes
/// to bound the input.
pub fn session_key(api_key: Option<&str>, user_agent: Option<&str>, ip: Option<&str>) -> String {
    let masked_key = api_key
        .map(|k| k.chars().take(8).collect::<String>())
        .unwrap_or_else(|| "anonymous".to_string());
    let ua: String = user_agent.unwrap_or("").chars().take(100).collect();

    let mut hasher = Sha256::new();
    hasher.update(masked_key.as_bytes());
    hasher.update(b"|");
    hasher.update(ua.as_bytes());
    hasher.update(b"|");
    hasher.update(ip.unwrap_or("").as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Shared session table.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<String, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed request and return the session's cumulative
    /// (cost, request count) for the summary event.
    pub fn add_request(&self, key: &str, cost: f64, model: &str, channel_id: &str) -> (f64, u64) {
        let mut session = self
            .sessions
            .entry(key.to_string())
            .or_insert_with(Session::new);
        session.total_requests += 1;
        session.total_cost += cost;
        *session.models_used.entry(model.to_string()).or_default() += 1;
        *session
            .channels_used
            .entry(channel_id.to_string())
            .or_default() += 1;
        session.last_active_at = Utc::now();
        (session.total_cost, session.total_requests)
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.sessions.get(key).map(|s| s.clone())
    }

    /// Drop sessions idle for over an hour; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let cutoff = Utc::now() - Duration::seconds(SESSION_IDLE_SECS);
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.last_active_at > cutoff);
        before - self.sessions.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}
