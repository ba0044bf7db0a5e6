//! Per-channel minimum-interval gate.
//!
//! Some upstreams (OpenRouter free tiers in particular) enforce coarse
//! per-account rate limits. This gate keeps a monotonic last-dispatch
//! timestamp per channel so the dispatcher can *skip* channels that are not
//! ready instead of queueing on them. The read path takes no lock that can
//! block a request; only `wait_if_needed` serialises per channel.
//!
//! The dispatcher records the dispatch time **before** sending — recording
//! after a long streaming call would let a herd of requests through while
//! the first one is still streaming.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct IntervalGate {
    last_dispatch: DashMap<String, Instant>,
    /// Per-channel wait serialisation for `wait_if_needed`.
    waiters: DashMap<String, std::sync::Arc<Mutex<()>>>,
}

impl IntervalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a dispatch on `channel_id` would respect `min_interval` now.
    /// Channels with `min_interval == 0` are always ready.
    pub fn is_ready(&self, channel_id: &str, min_interval: Duration) -> bool {
        self.remaining_wait(channel_id, min_interval).is_zero()
    }

    /// Time left until the channel is ready; zero when it already is.
    pub fn remaining_wait(&self, channel_id: &str, min_interval: Duration) -> Duration {
        if min_interval.is_zero() {
            return Duration::ZERO;
        }
        let Some(last) = self.last_dispatch.get(channel_id) else {
            return Duration::ZERO;
        };
        min_interval.saturating_sub(last.elapsed())
    }

    /// Record a dispatch on `channel_id` now.
    pub fn record(&self, channel_id: &str) {
        self.last_dispatch
            .insert(channel_id.to_string(), Instant::now());
    }

    /// Sleep until the channel is ready, then record the dispatch. Returns
    /// whether any waiting actually happened.
    ///
    /// Concurrent callers for the same channel are serialised so that two
    /// waiters cannot both wake and dispatch inside one interval.
    pub async fn wait_if_needed(&self, channel_id: &str, min_interval: Duration) -> bool {
        if min_interval.is_zero() {
            self.record(channel_id);
            return false;
        }

        let lock = self
            .waiters
            .entry(channel_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let wait = self.remaining_wait(channel_id, min_interval);
        let waited = !wait.is_zero();
        if waited {
            tracing::info!(
                channel = %channel_id,
                wait_ms = wait.as_millis() as u64,
                "holding dispatch for min request interval"
            );
            tokio::time::sleep(wait).await;
        }
        self.record(channel_id);
        waited
    }

    /// Forget a channel's history (admin reset).
    pub fn clear(&self, channel_id: &str) {
        self.last_dispatch.remove(channel_id);
        self.waiters.remove(channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_channel_is_always_ready() {
        let gate = IntervalGate::new();
        gate.record("c1");
        assert!(gate.is_ready("c1", Duration::ZERO));
    }

    #[test]
    fn unseen_channel_is_ready() {
        let gate = IntervalGate::new();
        assert!(gate.is_ready("new", Duration::from_secs(5)));
    }

    #[test]
    fn recent_dispatch_blocks_until_interval_elapses() {
        let gate = IntervalGate::new();
        gate.record("c1");
        assert!(!gate.is_ready("c1", Duration::from_secs(60)));
        let remaining = gate.remaining_wait("c1", Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
    }

    #[test]
    fn clear_resets_history() {
        let gate = IntervalGate::new();
        gate.record("c1");
        gate.clear("c1");
        assert!(gate.is_ready("c1", Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn wait_if_needed_sleeps_out_the_interval() {
        let gate = IntervalGate::new();
        let interval = Duration::from_millis(50);

        // First call: nothing recorded, no wait.
        assert!(!gate.wait_if_needed("c1", interval).await);

        // Second call immediately after must wait.
        let start = Instant::now();
        assert!(gate.wait_if_needed("c1", interval).await);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn concurrent_waiters_are_serialised() {
        let gate = std::sync::Arc::new(IntervalGate::new());
        let interval = Duration::from_millis(30);
        gate.record("c1");

        let a = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait_if_needed("c1", interval).await }
        });
        let b = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait_if_needed("c1", interval).await }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        // Both must have waited: the second waiter sees the first's record.
        assert!(a && b);
    }
}
