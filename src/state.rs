//! Shared application state.
//!
//! One [`AppState`] is built at startup and handed to every request handler
//! and background task as an explicit `Arc` — nothing in this codebase
//! reaches for a global. Each field is its own concurrency domain (see the
//! per-module docs); no operation takes two of their locks at once.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::blacklist::Blacklist;
use crate::config::{AppConfig, AuthType, ChannelConfig, ConfigStore};
use crate::interval::IntervalGate;
use crate::pool::ConnectionPool;
use crate::registry::{ChannelCatalog, ModelRegistry};
use crate::routing::Router;
use crate::sessions::SessionTable;
use crate::stats::ChannelStats;
use crate::usage::UsageTracker;

pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub registry: Arc<ModelRegistry>,
    pub catalog: Arc<ChannelCatalog>,
    pub blacklist: Arc<Blacklist>,
    pub intervals: Arc<IntervalGate>,
    pub stats: Arc<ChannelStats>,
    pub sessions: Arc<SessionTable>,
    pub usage: Arc<UsageTracker>,
    pub pool: Arc<ConnectionPool>,
    pub router: Router,
    pub started_at: Instant,
}

impl AppState {
    /// Wire up every component from a loaded config.
    pub fn new(config: AppConfig, config_path: std::path::PathBuf, data_dir: &Path) -> Self {
        let cache_dir = data_dir.join("cache");
        let logs_dir = data_dir.join("logs");

        let config = Arc::new(ConfigStore::new(config, config_path));
        let registry = Arc::new(ModelRegistry::load(&cache_dir));
        registry.persist_pricing_table(&cache_dir);
        let catalog = Arc::new(ChannelCatalog::new(&cache_dir));
        {
            let snapshot = config.get();
            let keys: Vec<(String, String)> = snapshot
                .channels
                .iter()
                .map(|c| (c.id.clone(), c.api_key.clone()))
                .collect();
            catalog.load(&keys);
        }
        let blacklist = Arc::new(Blacklist::new());
        let stats = Arc::new(ChannelStats::new());

        let router = Router::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&blacklist),
            Arc::clone(&stats),
        );

        Self {
            config,
            registry,
            catalog,
            blacklist,
            intervals: Arc::new(IntervalGate::new()),
            stats,
            sessions: Arc::new(SessionTable::new()),
            usage: Arc::new(UsageTracker::new(&logs_dir)),
            pool: Arc::new(ConnectionPool::new()),
            router,
            started_at: Instant::now(),
        }
    }

    /// The auth header for one channel: scheme per the provider's declared
    /// auth type.
    pub fn auth_header(&self, channel: &ChannelConfig) -> (&'static str, String) {
        let auth_type = self
            .config
            .get()
            .provider(&channel.provider)
            .map(|p| p.auth_type)
            .unwrap_or_default();
        match auth_type {
            AuthType::Bearer => ("authorization", format!("Bearer {}", channel.api_key)),
            AuthType::XApiKey => ("x-api-key", channel.api_key.clone()),
        }
    }

    /// Effective base URL for one channel.
    pub fn base_url(&self, channel: &ChannelConfig) -> String {
        let config = self.config.get();
        channel
            .effective_base_url(config.provider(&channel.provider))
            .to_string()
    }
}
