//! Runtime channel statistics.
//!
//! [`ChannelStats`] is the coarse runtime-state companion to the config: a
//! per-channel bounded window of recent outcomes plus a smoothed reliability
//! score, updated on every request outcome. The scorer reads it for the
//! speed and reliability dimensions; the status API exposes it read-only.
//!
//! Memory is bounded: each channel keeps at most [`WINDOW`] samples.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;

/// Samples retained per channel.
const WINDOW: usize = 50;

/// Minimum samples before the rolling latency average is trusted.
pub const MIN_LATENCY_SAMPLES: usize = 3;

#[derive(Debug, Clone)]
struct ChannelWindow {
    /// Recent (latency_ms, success) outcomes, oldest first.
    samples: VecDeque<(u64, bool)>,
    /// Smoothed success score, seeded at 1.0: −0.05 per failure, +0.01 per
    /// success, clamped to [0,1].
    reliability: f64,
    total_requests: u64,
    total_failures: u64,
}

impl Default for ChannelWindow {
    fn default() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW),
            reliability: 1.0,
            total_requests: 0,
            total_failures: 0,
        }
    }
}

/// Shared per-channel outcome tracker. Safe to share via `Arc<ChannelStats>`.
#[derive(Default)]
pub struct ChannelStats {
    channels: DashMap<String, ChannelWindow>,
}

/// Read-only snapshot of one channel's runtime health.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealth {
    pub channel_id: String,
    pub reliability: f64,
    pub avg_latency_ms: Option<f64>,
    pub total_requests: u64,
    pub total_failures: u64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request outcome for a channel.
    pub fn record(&self, channel_id: &str, latency_ms: u64, success: bool) {
        let mut window = self.channels.entry(channel_id.to_string()).or_default();
        if window.samples.len() == WINDOW {
            window.samples.pop_front();
        }
        window.samples.push_back((latency_ms, success));
        window.total_requests += 1;
        if success {
            window.reliability = (window.reliability + 0.01).min(1.0);
        } else {
            window.total_failures += 1;
            window.reliability = (window.reliability - 0.05).max(0.0);
        }
    }

    /// Rolling average latency over successful samples, once at least
    /// [`MIN_LATENCY_SAMPLES`] exist. `None` means "not enough data — use the
    /// operator hint instead".
    pub fn avg_latency_ms(&self, channel_id: &str) -> Option<f64> {
        let window = self.channels.get(channel_id)?;
        let ok: Vec<u64> = window
            .samples
            .iter()
            .filter(|(_, success)| *success)
            .map(|(ms, _)| *ms)
            .collect();
        if ok.len() < MIN_LATENCY_SAMPLES {
            return None;
        }
        Some(ok.iter().sum::<u64>() as f64 / ok.len() as f64)
    }

    /// Smoothed reliability in [0,1]. Channels with no history score 1.0.
    pub fn reliability(&self, channel_id: &str) -> f64 {
        self.channels
            .get(channel_id)
            .map(|w| w.reliability)
            .unwrap_or(1.0)
    }

    /// Combined health heuristic used by the capability pre-filter: weights
    /// reliability against recent failure rate.
    pub fn health_score(&self, channel_id: &str) -> f64 {
        let Some(window) = self.channels.get(channel_id) else {
            return 1.0;
        };
        if window.samples.is_empty() {
            return window.reliability;
        }
        let failures = window.samples.iter().filter(|(_, ok)| !ok).count();
        let failure_rate = failures as f64 / window.samples.len() as f64;
        (window.reliability * 0.7 + (1.0 - failure_rate) * 0.3).clamp(0.0, 1.0)
    }

    /// Snapshot all tracked channels for the status API.
    pub fn snapshot(&self) -> Vec<ChannelHealth> {
        let mut out: Vec<ChannelHealth> = self
            .channels
            .iter()
            .map(|entry| {
                // Compute inline: re-entering the map while iterating a
                // shard can deadlock against a waiting writer.
                let window = entry.value();
                let ok: Vec<u64> = window
                    .samples
                    .iter()
                    .filter(|(_, success)| *success)
                    .map(|(ms, _)| *ms)
                    .collect();
                let avg_latency_ms = (ok.len() >= MIN_LATENCY_SAMPLES)
                    .then(|| ok.iter().sum::<u64>() as f64 / ok.len() as f64);
                ChannelHealth {
                    channel_id: entry.key().clone(),
                    reliability: window.reliability,
                    avg_latency_ms,
                    total_requests: window.total_requests,
                    total_failures: window.total_failures,
                }
            })
            .collect();
        out.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        out
    }

    /// Aggregate counters for the public `/status` endpoint.
    pub fn totals(&self) -> (u64, u64) {
        let mut requests = 0;
        let mut failures = 0;
        for entry in self.channels.iter() {
            requests += entry.value().total_requests;
            failures += entry.value().total_failures;
        }
        (requests, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_channel_has_full_reliability_and_no_latency() {
        let stats = ChannelStats::new();
        assert_eq!(stats.reliability("c1"), 1.0);
        assert!(stats.avg_latency_ms("c1").is_none());
    }

    #[test]
    fn latency_average_requires_minimum_samples() {
        let stats = ChannelStats::new();
        stats.record("c1", 100, true);
        stats.record("c1", 200, true);
        assert!(stats.avg_latency_ms("c1").is_none(), "2 samples is not enough");

        stats.record("c1", 300, true);
        let avg = stats.avg_latency_ms("c1").unwrap();
        assert!((avg - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failed_samples_do_not_pollute_latency() {
        let stats = ChannelStats::new();
        stats.record("c1", 100, true);
        stats.record("c1", 100, true);
        stats.record("c1", 100, true);
        stats.record("c1", 99_999, false);
        let avg = stats.avg_latency_ms("c1").unwrap();
        assert!((avg - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reliability_decays_on_failure_and_recovers_slowly() {
        let stats = ChannelStats::new();
        stats.record("c1", 10, false);
        assert!((stats.reliability("c1") - 0.95).abs() < 1e-9);

        // Recovery is 5x slower than decay.
        for _ in 0..5 {
            stats.record("c1", 10, true);
        }
        assert!((stats.reliability("c1") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reliability_is_clamped_to_zero() {
        let stats = ChannelStats::new();
        for _ in 0..40 {
            stats.record("c1", 10, false);
        }
        assert_eq!(stats.reliability("c1"), 0.0);
    }

    #[test]
    fn window_is_bounded() {
        let stats = ChannelStats::new();
        for i in 0..(WINDOW as u64 + 100) {
            stats.record("c1", i, true);
        }
        let window = stats.channels.get("c1").unwrap();
        assert_eq!(window.samples.len(), WINDOW);
        assert_eq!(window.total_requests, WINDOW as u64 + 100);
    }

    #[test]
    fn health_score_penalises_recent_failures() {
        let stats = ChannelStats::new();
        for _ in 0..10 {
            stats.record("good", 10, true);
        }
        for _ in 0..10 {
            stats.record("bad", 10, false);
        }
        assert!(stats.health_score("good") > stats.health_score("bad"));
    }

    #[test]
    fn snapshot_is_sorted_and_complete() {
        let stats = ChannelStats::new();
        stats.record("b", 10, true);
        stats.record("a", 20, false);
        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].channel_id, "a");
        assert_eq!(snap[0].total_failures, 1);
        assert_eq!(snap[1].channel_id, "b");
    }
}
