//! Shared upstream HTTP connection pool.
//!
//! One pooled [`reqwest::Client`] pair per `scheme://host` origin:
//!
//! - the **buffered** client carries a 300 s total deadline for ordinary
//!   JSON round-trips;
//! - the **stream** client has no total deadline (bodies arrive
//!   incrementally over minutes) but keeps the connect and read timeouts.
//!
//! Both share the same pool limits: ≤ 20 idle keep-alive per host, 30 s
//! idle, 10 s connect, 300 s read (slow models), HTTP/2 via ALPN, automatic
//! redirects. The pool also hosts the 30 s availability-probe cache used by
//! the dispatcher's top-k pre-check.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::Client;

const POOL_MAX_IDLE_PER_HOST: usize = 20;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(300);
const PROBE_CACHE_TTL: Duration = Duration::from_secs(30);

struct OriginClients {
    buffered: Client,
    stream: Client,
}

/// Per-origin client cache plus the probe-result cache.
#[derive(Default)]
pub struct ConnectionPool {
    clients: DashMap<String, std::sync::Arc<OriginClients>>,
    probes: DashMap<String, (Instant, bool)>,
}

/// Reduce a URL to its pooling key: `scheme://host[:port]`.
fn origin_of(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => {
            let mut origin = format!(
                "{}://{}",
                parsed.scheme(),
                parsed.host_str().unwrap_or_default()
            );
            if let Some(port) = parsed.port() {
                origin.push_str(&format!(":{port}"));
            }
            origin
        }
        Err(_) => url.to_string(),
    }
}

fn build_clients() -> OriginClients {
    let base = || {
        Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
    };
    OriginClients {
        buffered: base()
            .timeout(READ_TIMEOUT)
            .build()
            .expect("failed to build pooled client"),
        stream: base().build().expect("failed to build streaming client"),
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients_for(&self, url: &str) -> std::sync::Arc<OriginClients> {
        self.clients
            .entry(origin_of(url))
            .or_insert_with(|| std::sync::Arc::new(build_clients()))
            .clone()
    }

    /// Client for ordinary buffered requests against `url`'s origin.
    pub fn client(&self, url: &str) -> Client {
        self.clients_for(url).buffered.clone()
    }

    /// Client for streaming requests: no total deadline.
    pub fn stream_client(&self, url: &str) -> Client {
        self.clients_for(url).stream.clone()
    }

    /// Cached availability-probe result for an origin, if still fresh.
    pub fn cached_probe(&self, origin_url: &str) -> Option<bool> {
        let key = origin_of(origin_url);
        let entry = self.probes.get(&key)?;
        let (at, available) = *entry;
        (at.elapsed() < PROBE_CACHE_TTL).then_some(available)
    }

    pub fn store_probe(&self, origin_url: &str, available: bool) {
        self.probes
            .insert(origin_of(origin_url), (Instant::now(), available));
    }

    /// Drop every pooled client and cached probe. Called once at shutdown;
    /// in-flight requests keep their cloned clients alive until they finish.
    pub fn close_all(&self) {
        self.clients.clear();
        self.probes.clear();
    }
}
