//! Configuration types and the live channel registry.
//!
//! Config is loaded once at startup from a YAML file and validated before the
//! server opens any ports. Channels that fail validation are force-disabled
//! with a warning rather than aborting startup — one bad credential must not
//! take down the whole pool.
//!
//! # Example
//! ```yaml
//! server:
//!   host: 0.0.0.0
//!   port: 8000
//!
//! providers:
//!   openai:
//!     display_name: OpenAI
//!     adapter_class: openai
//!     base_url: https://api.openai.com
//!     auth_type: bearer
//!
//! channels:
//!   - id: openai_1
//!     name: OpenAI main
//!     provider: openai
//!     model_name: gpt-4o-mini
//!     api_key: sk-xxxxxxxxxxxx
//!     priority: 10
//!
//! routing:
//!   default_strategy: balanced
//! ```
//!
//! Runtime mutations (admin API) go through [`ConfigStore`], which swaps an
//! immutable snapshot under a read lock and persists the new document back to
//! disk atomically (write tmp + rename).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How a provider authenticates upstream requests.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// `Authorization: Bearer <key>` — OpenAI, OpenRouter, Groq, most others.
    #[default]
    Bearer,
    /// `x-api-key: <key>` — Anthropic-style.
    #[serde(alias = "x-api-key")]
    XApiKey,
}

/// A provider definition: protocol family shared by one or more channels.
/// Read-only at runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub display_name: String,
    /// Which wire dialect the provider speaks (`openai`, `anthropic`, `gemini`).
    pub adapter_class: String,
    pub base_url: String,
    #[serde(default)]
    pub auth_type: AuthType,
}

/// Per-token prices in the channel's billing currency.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct CostPerToken {
    pub input: f64,
    pub output: f64,
}

/// Conversion applied to channel-billed costs before they are recorded.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CurrencyExchange {
    pub rate: f64,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Operator-declared performance hints for a channel.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default)]
pub struct PerformanceHints {
    /// Seed for the speed dimension before enough latency samples exist, in [0,1].
    #[serde(default)]
    pub speed_score: Option<f64>,
}

/// One upstream account. `id` is unique and stable for the process lifetime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,
    /// Key into the `providers` map.
    pub provider: String,
    /// Default concrete model for this channel (used by `auto:` selectors).
    pub model_name: String,
    pub api_key: String,
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    /// Lower is better. Used as the first tiebreak after total score.
    #[serde(default = "defaults::priority")]
    pub priority: i32,
    /// Overrides the provider's base URL when set.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Operator-declared tags, merged with model-derived tags during discovery.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Operator-declared capability markers (e.g. `vision`), trusted as-is.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Minimum seconds between dispatches on this channel. 0 = unlimited.
    #[serde(default)]
    pub min_request_interval: u64,
    /// Fallback per-token pricing when the model registry has none.
    #[serde(default)]
    pub cost_per_token: Option<CostPerToken>,
    #[serde(default)]
    pub currency_exchange: Option<CurrencyExchange>,
    #[serde(default)]
    pub performance: Option<PerformanceHints>,
}

impl ChannelConfig {
    /// The base URL this channel actually dials: its own override, or the
    /// provider's default.
    pub fn effective_base_url<'a>(&'a self, provider: Option<&'a ProviderConfig>) -> &'a str {
        self.base_url
            .as_deref()
            .or(provider.map(|p| p.base_url.as_str()))
            .unwrap_or("")
            .trim_end_matches('/')
    }

    /// Lowercased declared tags.
    pub fn tag_set(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.to_lowercase()).collect()
    }
}

/// A named routing view over a subset of channels.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ModelGroupConfig {
    #[serde(default)]
    pub routing_strategy: Option<String>,
    /// Free-form filter expressions (tag/provider names) evaluated by discovery.
    #[serde(default)]
    pub filters: Vec<String>,
}

/// One of the eight score dimensions a strategy rule can weight.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScoreField {
    Cost,
    Speed,
    Quality,
    Reliability,
    Parameter,
    Context,
    Free,
    Local,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Higher dimension score is better (use the score as-is).
    #[default]
    Desc,
    /// Lower dimension score is better (use `1 − score`).
    Asc,
}

/// One weighted rule inside a sorting strategy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct StrategyRule {
    pub field: ScoreField,
    #[serde(default)]
    pub order: SortOrder,
    pub weight: f64,
}

/// Routing section: default strategy plus operator-defined strategies.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default = "defaults::default_strategy")]
    pub default_strategy: String,
    #[serde(default)]
    pub sorting_strategies: HashMap<String, Vec<StrategyRule>>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: defaults::default_strategy(),
            sorting_strategies: HashMap::new(),
        }
    }
}

/// Core server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
    /// Strip `<think>`/`<reasoning>` blocks from non-streaming responses.
    #[serde(default)]
    pub clean_reasoning: bool,
    /// Days of usage logs kept in `logs/` before moving to `logs/archive/`.
    #[serde(default = "defaults::usage_retention_days")]
    pub usage_retention_days: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            debug: false,
            clean_reasoning: false,
            usage_retention_days: defaults::usage_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AdminAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuthConfig {
    /// When true, every client request must carry `Authorization: Bearer api_token`.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub admin: AdminAuthConfig,
}

/// A single background task's schedule.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TaskSchedule {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::task_interval")]
    pub interval_secs: u64,
}

impl Default for TaskSchedule {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: defaults::task_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TasksConfig {
    #[serde(default)]
    pub model_discovery: TaskSchedule,
    #[serde(default)]
    pub health_check: TaskSchedule,
    #[serde(default)]
    pub cache_cleanup: TaskSchedule,
}

/// The full parsed config document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub model_groups: HashMap<String, ModelGroupConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&content).context("parsing config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation plus per-channel sanitation.
    ///
    /// Hard errors (duplicate ids, unknown provider references) abort; a bad
    /// API key only force-disables the one channel.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            anyhow::ensure!(
                seen.insert(channel.id.as_str()),
                "duplicate channel id `{}`",
                channel.id
            );
            anyhow::ensure!(
                self.providers.contains_key(&channel.provider),
                "channel `{}` references unknown provider `{}`",
                channel.id,
                channel.provider
            );
        }

        for (name, rules) in &self.routing.sorting_strategies {
            anyhow::ensure!(
                !rules.is_empty(),
                "sorting strategy `{name}` has no rules"
            );
            for rule in rules {
                anyhow::ensure!(
                    rule.weight.is_finite() && rule.weight >= 0.0,
                    "sorting strategy `{name}` has a negative or non-finite weight"
                );
            }
        }

        // API keys under 10 chars cannot be real credentials; disable rather
        // than letting the channel burn failover attempts.
        for channel in &mut self.channels {
            if channel.enabled && channel.api_key.trim().len() < 10 {
                warn!(
                    channel = %channel.id,
                    "api_key missing or too short — channel force-disabled"
                );
                channel.enabled = false;
            }
        }

        Ok(())
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    pub fn channel_by_id(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Resolve a strategy's rules: config-defined first, then built-ins.
    pub fn strategy_rules(&self, name: &str) -> Option<Vec<StrategyRule>> {
        self.routing
            .sorting_strategies
            .get(name)
            .cloned()
            .or_else(|| crate::routing::scoring::builtin_strategy(name))
    }
}

/// Live config handle: immutable snapshots swapped under a short read lock,
/// with admin mutations serialised through a single writer lock and persisted
/// atomically.
pub struct ConfigStore {
    snapshot: RwLock<Arc<AppConfig>>,
    path: PathBuf,
    /// Serialises mutate-and-persist cycles so two admin calls can't
    /// interleave their read-modify-write.
    writer: Mutex<()>,
}

impl ConfigStore {
    pub fn new(config: AppConfig, path: PathBuf) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(config)),
            path,
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot. The lock is held only for the `Arc::clone`.
    pub fn get(&self) -> Arc<AppConfig> {
        self.snapshot.read().expect("config lock poisoned").clone()
    }

    /// Swap the live snapshot without persisting (reload paths, tests).
    pub fn replace(&self, new: Arc<AppConfig>) {
        *self.snapshot.write().expect("config lock poisoned") = new;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enable or disable a channel, persisting the change.
    pub fn set_channel_enabled(&self, id: &str, enabled: bool) -> anyhow::Result<()> {
        self.mutate(|config| {
            let channel = config
                .channels
                .iter_mut()
                .find(|c| c.id == id)
                .with_context(|| format!("unknown channel `{id}`"))?;
            channel.enabled = enabled;
            Ok(())
        })
    }

    /// Change a channel's priority, persisting the change.
    pub fn set_channel_priority(&self, id: &str, priority: i32) -> anyhow::Result<()> {
        self.mutate(|config| {
            let channel = config
                .channels
                .iter_mut()
                .find(|c| c.id == id)
                .with_context(|| format!("unknown channel `{id}`"))?;
            channel.priority = priority;
            Ok(())
        })
    }

    fn mutate(
        &self,
        f: impl FnOnce(&mut AppConfig) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let _guard = self.writer.lock().expect("config writer lock poisoned");

        let mut next = (*self.get()).clone();
        f(&mut next)?;
        self.persist(&next)?;

        *self.snapshot.write().expect("config lock poisoned") = Arc::new(next);
        Ok(())
    }

    /// Write tmp + rename so readers never observe a half-written document.
    fn persist(&self, config: &AppConfig) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(config).context("serialising config")?;
        let tmp = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }
}

mod defaults {
    pub fn host() -> String {
        "0.0.0.0".to_string()
    }
    pub fn port() -> u16 {
        8000
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn priority() -> i32 {
        100
    }
    pub fn default_strategy() -> String {
        "balanced".to_string()
    }
    pub fn task_interval() -> u64 {
        300
    }
    pub fn usage_retention_days() -> u32 {
        30
    }
}
