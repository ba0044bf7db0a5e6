//! Unified model metadata registry.
//!
//! Merges three layers into one queryable view, in precedence order:
//!
//! 1. **Base catalog** — an OpenRouter-style JSON document
//!    (`cache/openrouter_models.json`), the source of truth for
//!    capabilities, context lengths and list pricing.
//! 2. **Provider overrides** — `cache/provider_overrides.json`, small static
//!    adjustments (e.g. a pricing multiplier for a reseller, `force_free`
//!    for a free tier, `local` for on-box providers).
//! 3. **Channel overrides** — `cache/channel_overrides.json`, optional
//!    per-channel corrections.
//!
//! A metadata query for an unknown model never fails: missing values are
//! inferred deterministically from the model id alone (parameter count,
//! context window, and the quality ladder derived from them). All inference
//! lives in the free functions at the bottom of this module so the rules
//! are testable on their own.
//!
//! [`ChannelCatalog`] lives here too: the per-channel discovered-model lists
//! cached under `cache/channels/` with API-key-salted file names, refreshed
//! from `GET {base_url}/v1/models`.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Unified metadata for one (provider, model) pair.
#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub model_id: String,
    pub provider: String,
    /// Parameter count in millions, when known or inferable from the id.
    pub parameter_count: Option<u64>,
    pub context_length: u64,
    pub modality: String,
    pub input_modalities: Vec<String>,
    pub output_modalities: Vec<String>,
    pub supported_parameters: Vec<String>,
    pub supports_vision: bool,
    pub supports_function_calling: bool,
    pub supports_streaming: bool,
    pub supports_audio: bool,
    /// USD per 1e6 input tokens.
    pub pricing_input: f64,
    /// USD per 1e6 output tokens.
    pub pricing_output: f64,
    pub quality_score: Option<f64>,
    /// Lowercased tags derived from the model id.
    pub tags: Vec<String>,
}

impl ModelMetadata {
    /// Free iff both list prices are exactly zero.
    pub fn is_free(&self) -> bool {
        self.pricing_input == 0.0 && self.pricing_output == 0.0
    }

    /// True when this model's tag set covers every requested tag.
    pub fn matches_tags(&self, required: &[String]) -> bool {
        required.iter().all(|t| self.tags.iter().any(|own| own == t))
    }
}

/// Static per-provider adjustments applied on top of the base catalog.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderOverride {
    /// Multiplied into both list prices (e.g. 0.1 for a discount reseller).
    #[serde(default)]
    pub pricing_multiplier: Option<f64>,
    /// Treat every model on this provider as free.
    #[serde(default)]
    pub force_free: bool,
    /// Provider runs on-box (ollama, lmstudio).
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub quality_bonus: Option<f64>,
}

/// Per-channel metadata corrections, keyed by model id.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelOverride {
    #[serde(default)]
    pub context_length: Option<u64>,
    #[serde(default)]
    pub pricing_input: Option<f64>,
    #[serde(default)]
    pub pricing_output: Option<f64>,
    #[serde(default)]
    pub quality_score: Option<f64>,
}

/// The merged, queryable registry. Built once at startup; read-only after.
pub struct ModelRegistry {
    base: HashMap<String, ModelMetadata>,
    provider_overrides: HashMap<String, ProviderOverride>,
    channel_overrides: HashMap<String, HashMap<String, ModelOverride>>,
    tag_index: HashMap<String, HashSet<String>>,
}

impl ModelRegistry {
    /// Load all three layers from `cache_dir`, tolerating missing files.
    pub fn load(cache_dir: &Path) -> Self {
        let base = load_catalog(&cache_dir.join("openrouter_models.json"));
        let provider_overrides =
            load_json(&cache_dir.join("provider_overrides.json")).unwrap_or_default();
        let channel_overrides =
            load_json(&cache_dir.join("channel_overrides.json")).unwrap_or_default();
        Self::from_parts(base, provider_overrides, channel_overrides)
    }

    pub fn from_parts(
        base: Vec<ModelMetadata>,
        provider_overrides: HashMap<String, ProviderOverride>,
        channel_overrides: HashMap<String, HashMap<String, ModelOverride>>,
    ) -> Self {
        let mut map = HashMap::with_capacity(base.len());
        let mut tag_index: HashMap<String, HashSet<String>> = HashMap::new();
        for meta in base {
            for tag in &meta.tags {
                tag_index
                    .entry(tag.clone())
                    .or_default()
                    .insert(meta.model_id.clone());
            }
            map.insert(meta.model_id.to_lowercase(), meta);
        }
        Self {
            base: map,
            provider_overrides,
            channel_overrides,
            tag_index,
        }
    }

    /// Look up metadata with full precedence applied.
    ///
    /// Never fails: unknown models get a heuristic record derived from the
    /// id alone, so callers can score anything discovery produces.
    pub fn get(&self, model_id: &str, provider: Option<&str>, channel_id: Option<&str>) -> ModelMetadata {
        let mut meta = self
            .base
            .get(&model_id.to_lowercase())
            .cloned()
            .unwrap_or_else(|| synthesize(model_id, provider.unwrap_or("")));

        if let Some(provider) = provider {
            meta.provider = provider.to_string();
            if let Some(ov) = self.provider_overrides.get(provider) {
                if let Some(mult) = ov.pricing_multiplier {
                    meta.pricing_input *= mult;
                    meta.pricing_output *= mult;
                }
                if ov.force_free {
                    meta.pricing_input = 0.0;
                    meta.pricing_output = 0.0;
                }
                if let Some(bonus) = ov.quality_bonus {
                    let q = meta.quality_score.unwrap_or_else(|| {
                        quality_from_parameters(meta.parameter_count)
                    });
                    meta.quality_score = Some((q + bonus).clamp(0.0, 1.0));
                }
            }
        }

        if let Some(channel_id) = channel_id {
            if let Some(ov) = self
                .channel_overrides
                .get(channel_id)
                .and_then(|per_model| per_model.get(&model_id.to_lowercase()))
            {
                if let Some(ctx) = ov.context_length {
                    meta.context_length = ctx;
                }
                if let Some(p) = ov.pricing_input {
                    meta.pricing_input = p;
                }
                if let Some(p) = ov.pricing_output {
                    meta.pricing_output = p;
                }
                if let Some(q) = ov.quality_score {
                    meta.quality_score = Some(q);
                }
            }
        }

        meta
    }

    /// True when the base catalog has a real entry for this model (as
    /// opposed to the heuristic record [`get`](Self::get) would synthesise).
    pub fn contains(&self, model_id: &str) -> bool {
        self.base.contains_key(&model_id.to_lowercase())
    }

    /// True when the provider is declared local (on-box) via overrides.
    pub fn is_local_provider(&self, provider: &str) -> bool {
        self.provider_overrides
            .get(provider)
            .map(|ov| ov.local)
            .unwrap_or(false)
    }

    /// All catalog models whose tag set covers `tags`, optionally restricted
    /// to one provider.
    pub fn find_by_tags(&self, tags: &[String], provider: Option<&str>) -> Vec<&ModelMetadata> {
        self.base
            .values()
            .filter(|m| m.matches_tags(tags))
            .filter(|m| provider.map_or(true, |p| m.provider == p))
            .collect()
    }

    pub fn free_models(&self) -> Vec<&ModelMetadata> {
        self.base.values().filter(|m| m.is_free()).collect()
    }

    pub fn vision_models(&self) -> Vec<&ModelMetadata> {
        self.base.values().filter(|m| m.supports_vision).collect()
    }

    /// All tags present in the catalog index.
    pub fn known_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.tag_index.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Write the derived per-model pricing table to
    /// `cache/model_pricing.json` so operators can inspect what the router
    /// is actually billing against.
    pub fn persist_pricing_table(&self, cache_dir: &Path) {
        let mut table: std::collections::BTreeMap<&str, Value> = std::collections::BTreeMap::new();
        for meta in self.base.values() {
            table.insert(
                meta.model_id.as_str(),
                serde_json::json!({
                    "input_per_1m": meta.pricing_input,
                    "output_per_1m": meta.pricing_output,
                }),
            );
        }
        let path = cache_dir.join("model_pricing.json");
        if let Err(e) = std::fs::create_dir_all(cache_dir).and_then(|_| {
            std::fs::write(&path, serde_json::to_vec_pretty(&table).unwrap_or_default())
        }) {
            warn!(path = %path.display(), error = %e, "failed to persist pricing table");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog loading
// ─────────────────────────────────────────────────────────────────────────────

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unparseable cache file");
            None
        }
    }
}

fn load_catalog(path: &Path) -> Vec<ModelMetadata> {
    let Some(doc) = load_json::<Value>(path) else {
        debug!(path = %path.display(), "no base model catalog — heuristics only");
        return Vec::new();
    };
    let Some(entries) = doc.get("data").and_then(Value::as_array) else {
        warn!(path = %path.display(), "catalog has no `data` array");
        return Vec::new();
    };
    entries.iter().filter_map(parse_catalog_model).collect()
}

/// Parse one OpenRouter-style catalog entry. Entries without an id are
/// dropped; everything else degrades to inference.
pub(crate) fn parse_catalog_model(entry: &Value) -> Option<ModelMetadata> {
    let model_id = entry.get("id")?.as_str()?.to_string();
    let provider = model_id
        .split_once('/')
        .map(|(p, _)| p.to_string())
        .unwrap_or_default();

    let arch = entry.get("architecture");
    let modality = arch
        .and_then(|a| a.get("modality"))
        .and_then(Value::as_str)
        .unwrap_or("text->text")
        .to_string();
    let string_list = |v: Option<&Value>| -> Vec<String> {
        v.and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let input_modalities = string_list(arch.and_then(|a| a.get("input_modalities")));
    let output_modalities = string_list(arch.and_then(|a| a.get("output_modalities")));
    let supported_parameters = string_list(entry.get("supported_parameters"));

    // OpenRouter prices are USD per token as strings; store per 1M.
    let price = |key: &str| -> f64 {
        entry
            .get("pricing")
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str().and_then(|s| s.parse::<f64>().ok()).or(v.as_f64()))
            .unwrap_or(0.0)
            * 1e6
    };

    let supports_vision = input_modalities.iter().any(|m| m == "image")
        || modality.starts_with("text+image");
    let supports_audio = input_modalities.iter().any(|m| m == "audio");
    let supports_function_calling = supported_parameters
        .iter()
        .any(|p| p == "tools" || p == "tool_choice");

    let parameter_count = infer_parameter_count(&model_id);
    let context_length = entry
        .get("context_length")
        .and_then(Value::as_u64)
        .unwrap_or_else(|| infer_context_length(&model_id));

    Some(ModelMetadata {
        tags: derive_tags(&model_id),
        supports_vision,
        supports_function_calling,
        supports_streaming: true,
        supports_audio,
        pricing_input: price("prompt"),
        pricing_output: price("completion"),
        quality_score: None,
        model_id,
        provider,
        parameter_count,
        context_length,
        modality,
        input_modalities,
        output_modalities,
        supported_parameters,
    })
}

/// Build a heuristic record for a model the catalog has never seen.
fn synthesize(model_id: &str, provider: &str) -> ModelMetadata {
    ModelMetadata {
        model_id: model_id.to_string(),
        provider: provider.to_string(),
        parameter_count: infer_parameter_count(model_id),
        context_length: infer_context_length(model_id),
        modality: "text->text".to_string(),
        input_modalities: vec!["text".to_string()],
        output_modalities: vec!["text".to_string()],
        supported_parameters: Vec::new(),
        supports_vision: false,
        supports_function_calling: false,
        supports_streaming: true,
        supports_audio: false,
        pricing_input: 0.0,
        pricing_output: 0.0,
        quality_score: None,
        tags: derive_tags(model_id),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deterministic inference rules
// ─────────────────────────────────────────────────────────────────────────────

/// Split a model id into lowercase tags on `: / \ - _ @ ,`.
pub fn derive_tags(model_id: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    model_id
        .to_lowercase()
        .split(|c| matches!(c, ':' | '/' | '\\' | '-' | '_' | '@' | ','))
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(str::to_string)
        .collect()
}

/// Infer parameter count (millions) from size markers in the id, e.g.
/// `llama-3.1-70b` → 70 000, `qwen2.5-0.5b` → 500, `minilm-33m` → 33.
pub fn infer_parameter_count(model_id: &str) -> Option<u64> {
    let lower = model_id.to_lowercase();
    for token in lower.split(|c: char| !(c.is_ascii_digit() || c == '.' || c == 'b' || c == 'm')) {
        let Some(stripped) = token.strip_suffix('b').or_else(|| token.strip_suffix('m')) else {
            continue;
        };
        let Ok(value) = stripped.parse::<f64>() else {
            continue;
        };
        if value <= 0.0 || value > 3000.0 {
            continue;
        }
        return Some(if token.ends_with('b') {
            (value * 1000.0) as u64
        } else {
            value as u64
        });
    }
    None
}

/// Infer a context window from markers like `-128k` / `-32k`; default 8k.
pub fn infer_context_length(model_id: &str) -> u64 {
    let lower = model_id.to_lowercase();
    for (marker, ctx) in [
        ("1m", 1_000_000),
        ("200k", 200_000),
        ("128k", 131_072),
        ("64k", 65_536),
        ("32k", 32_768),
        ("16k", 16_384),
        ("8k", 8_192),
        ("4k", 4_096),
    ] {
        if lower.contains(marker) {
            return ctx;
        }
    }
    8_192
}

/// Quality ladder bucketed by parameter count (millions).
pub fn quality_from_parameters(parameter_count: Option<u64>) -> f64 {
    match parameter_count {
        Some(p) if p >= 70_000 => 1.0,
        Some(p) if p >= 30_000 => 0.9,
        Some(p) if p >= 13_000 => 0.8,
        Some(p) if p >= 7_000 => 0.7,
        Some(p) if p >= 3_000 => 0.6,
        Some(p) if p >= 1_000 => 0.5,
        Some(p) if p >= 100 => 0.4,
        _ => 0.3,
    }
}


// ─────────────────────────────────────────────────────────────────────────────
// Per-channel discovered-model catalog
// ─────────────────────────────────────────────────────────────────────────────

/// On-disk shape of one channel's discovered model list.
#[derive(Debug, Serialize, Deserialize, Default)]
struct ChannelCacheFile {
    models: Vec<String>,
}

/// Discovered concrete models per channel, cached under
/// `cache/channels/{channel_id}_{sha256(api_key)[..8]}.json`.
///
/// The API-key salt keeps two channels pointed at the same provider but
/// holding different keys (different entitlements) from sharing a cache file.
pub struct ChannelCatalog {
    dir: PathBuf,
    models: DashMap<String, Vec<String>>,
}

impl ChannelCatalog {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: cache_dir.join("channels"),
            models: DashMap::new(),
        }
    }

    /// `{channel_id}_{sha256(api_key)[..8]}`; bare channel id when keyless.
    pub fn cache_key(channel_id: &str, api_key: &str) -> String {
        if api_key.is_empty() {
            return channel_id.to_string();
        }
        let digest = Sha256::digest(api_key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{channel_id}_{}", &hex[..8])
    }

    /// Load every channel's cached list from disk. Missing files are fine —
    /// discovery falls back to the channel's default model.
    pub fn load(&self, channels: &[(String, String)]) {
        for (channel_id, api_key) in channels {
            let path = self
                .dir
                .join(format!("{}.json", Self::cache_key(channel_id, api_key)));
            if let Some(file) = load_json::<ChannelCacheFile>(&path) {
                debug!(channel = %channel_id, count = file.models.len(), "loaded model cache");
                self.models.insert(channel_id.clone(), file.models);
            }
        }
    }

    pub fn models_for(&self, channel_id: &str) -> Vec<String> {
        self.models
            .get(channel_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Replace a channel's list in memory and persist it.
    pub fn store(&self, channel_id: &str, api_key: &str, models: Vec<String>) {
        let path = self
            .dir
            .join(format!("{}.json", Self::cache_key(channel_id, api_key)));
        if let Err(e) = std::fs::create_dir_all(&self.dir).and_then(|_| {
            std::fs::write(
                &path,
                serde_json::to_vec_pretty(&ChannelCacheFile {
                    models: models.clone(),
                })
                .unwrap_or_default(),
            )
        }) {
            warn!(channel = %channel_id, error = %e, "failed to persist model cache");
        }
        self.models.insert(channel_id.to_string(), models);
    }

    /// Refresh one channel's list from `GET {base_url}/v1/models`.
    pub async fn refresh(
        &self,
        client: &reqwest::Client,
        channel_id: &str,
        api_key: &str,
        base_url: &str,
        auth_header: (&'static str, String),
    ) -> anyhow::Result<usize> {
        let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
        let response = client
            .get(&url)
            .header(auth_header.0, auth_header.1)
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "model discovery returned HTTP {}",
            response.status()
        );
        let body: Value = response.json().await?;
        let models: Vec<String> = body
            .get("data")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let count = models.len();
        self.store(channel_id, api_key, models);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Tag derivation
    // -----------------------------------------------------------------------

    #[test]
    fn tags_split_on_all_separators() {
        assert_eq!(
            derive_tags("meta/llama-3.1:free"),
            vec!["meta", "llama", "3.1", "free"]
        );
        assert_eq!(derive_tags("qwen2.5_7b@latest"), vec!["qwen2.5", "7b", "latest"]);
    }

    #[test]
    fn tags_are_lowercased_and_deduped() {
        assert_eq!(derive_tags("Free-FREE-Model"), vec!["free", "model"]);
    }

    // -----------------------------------------------------------------------
    // Inference rules
    // -----------------------------------------------------------------------

    #[test]
    fn parameter_count_from_size_markers() {
        assert_eq!(infer_parameter_count("llama-3.1-70b-instruct"), Some(70_000));
        assert_eq!(infer_parameter_count("qwen2.5-0.5b"), Some(500));
        assert_eq!(infer_parameter_count("all-minilm-33m"), Some(33));
        assert_eq!(infer_parameter_count("gpt-4o-mini"), None);
    }

    #[test]
    fn context_length_from_markers_defaults_to_8k() {
        assert_eq!(infer_context_length("yi-34b-200k"), 200_000);
        assert_eq!(infer_context_length("gpt-3.5-turbo-16k"), 16_384);
        assert_eq!(infer_context_length("mystery-model"), 8_192);
    }

    #[test]
    fn quality_ladder_buckets() {
        assert_eq!(quality_from_parameters(Some(70_000)), 1.0);
        assert_eq!(quality_from_parameters(Some(34_000)), 0.9);
        assert_eq!(quality_from_parameters(Some(8_000)), 0.7);
        assert_eq!(quality_from_parameters(Some(500)), 0.4);
        assert_eq!(quality_from_parameters(Some(33)), 0.3);
        assert_eq!(quality_from_parameters(None), 0.3);
    }

    // -----------------------------------------------------------------------
    // Registry merge & precedence
    // -----------------------------------------------------------------------

    fn catalog_entry(id: &str, prompt: f64, completion: f64, ctx: u64) -> ModelMetadata {
        parse_catalog_model(&json!({
            "id": id,
            "context_length": ctx,
            "architecture": {
                "modality": "text->text",
                "input_modalities": ["text"],
                "output_modalities": ["text"],
            },
            "pricing": { "prompt": format!("{}", prompt / 1e6), "completion": format!("{}", completion / 1e6) },
            "supported_parameters": ["tools", "response_format"],
        }))
        .unwrap()
    }

    fn registry_with_overrides() -> ModelRegistry {
        let base = vec![catalog_entry("openai/gpt-4o-mini", 0.15, 0.6, 128_000)];
        let mut provider_overrides = HashMap::new();
        provider_overrides.insert(
            "siliconflow".to_string(),
            ProviderOverride {
                pricing_multiplier: Some(0.1),
                ..Default::default()
            },
        );
        provider_overrides.insert(
            "groq".to_string(),
            ProviderOverride {
                force_free: true,
                ..Default::default()
            },
        );
        provider_overrides.insert(
            "ollama".to_string(),
            ProviderOverride {
                local: true,
                force_free: true,
                ..Default::default()
            },
        );
        let mut channel_overrides = HashMap::new();
        let mut per_model = HashMap::new();
        per_model.insert(
            "openai/gpt-4o-mini".to_string(),
            ModelOverride {
                context_length: Some(64_000),
                ..Default::default()
            },
        );
        channel_overrides.insert("override_channel".to_string(), per_model);
        ModelRegistry::from_parts(base, provider_overrides, channel_overrides)
    }

    #[test]
    fn catalog_pricing_is_stored_per_million() {
        let registry = registry_with_overrides();
        let meta = registry.get("openai/gpt-4o-mini", None, None);
        assert!((meta.pricing_input - 0.15).abs() < 1e-9);
        assert!((meta.pricing_output - 0.6).abs() < 1e-9);
        assert!(meta.supports_function_calling);
    }

    #[test]
    fn provider_override_applies_pricing_multiplier() {
        let registry = registry_with_overrides();
        let meta = registry.get("openai/gpt-4o-mini", Some("siliconflow"), None);
        assert!((meta.pricing_input - 0.015).abs() < 1e-9);
    }

    #[test]
    fn force_free_override_zeroes_pricing() {
        let registry = registry_with_overrides();
        let meta = registry.get("openai/gpt-4o-mini", Some("groq"), None);
        assert!(meta.is_free());
    }

    #[test]
    fn channel_override_wins_over_catalog() {
        let registry = registry_with_overrides();
        let meta = registry.get("openai/gpt-4o-mini", None, Some("override_channel"));
        assert_eq!(meta.context_length, 64_000);
    }

    #[test]
    fn unknown_model_never_fails() {
        let registry = registry_with_overrides();
        let meta = registry.get("totally-new-13b-32k", Some("openai"), None);
        assert_eq!(meta.parameter_count, Some(13_000));
        assert_eq!(meta.context_length, 32_768);
        assert!(!meta.tags.is_empty());
    }

    #[test]
    fn local_provider_flag_comes_from_overrides() {
        let registry = registry_with_overrides();
        assert!(registry.is_local_provider("ollama"));
        assert!(!registry.is_local_provider("openai"));
    }

    #[test]
    fn free_and_vision_queries_filter_the_catalog() {
        let free = catalog_entry("meta/llama-free", 0.0, 0.0, 8_192);
        let vision = parse_catalog_model(&json!({
            "id": "openai/gpt-4o",
            "context_length": 128000,
            "architecture": {
                "modality": "text+image->text",
                "input_modalities": ["text", "image"],
                "output_modalities": ["text"],
            },
            "pricing": { "prompt": "0.0000025", "completion": "0.00001" },
            "supported_parameters": ["tools"],
        }))
        .unwrap();
        let registry = ModelRegistry::from_parts(
            vec![free, vision],
            HashMap::new(),
            HashMap::new(),
        );
        let free_ids: Vec<&str> = registry.free_models().iter().map(|m| m.model_id.as_str()).collect();
        assert_eq!(free_ids, vec!["meta/llama-free"]);
        let vision_ids: Vec<&str> = registry.vision_models().iter().map(|m| m.model_id.as_str()).collect();
        assert_eq!(vision_ids, vec!["openai/gpt-4o"]);
    }

    #[test]
    fn find_by_tags_requires_superset() {
        let registry = registry_with_overrides();
        let hits = registry.find_by_tags(&["gpt".into(), "4o".into()], None);
        assert_eq!(hits.len(), 1);
        let misses = registry.find_by_tags(&["gpt".into(), "vision".into()], None);
        assert!(misses.is_empty());
    }

    // -----------------------------------------------------------------------
    // ChannelCatalog
    // -----------------------------------------------------------------------

    #[test]
    fn cache_key_is_api_key_salted() {
        let a = ChannelCatalog::cache_key("siliconflow_1", "sk-abc123");
        let b = ChannelCatalog::cache_key("siliconflow_1", "sk-other");
        assert!(a.starts_with("siliconflow_1_"));
        assert_eq!(a.len(), "siliconflow_1_".len() + 8);
        assert_ne!(a, b);
        // Keyless channels fall back to the bare id.
        assert_eq!(ChannelCatalog::cache_key("local_1", ""), "local_1");
    }

    #[test]
    fn store_and_reload_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ChannelCatalog::new(dir.path());
        catalog.store(
            "groq_1",
            "sk-123456789012",
            vec!["llama-3.1-8b-instant".into()],
        );

        let fresh = ChannelCatalog::new(dir.path());
        fresh.load(&[("groq_1".into(), "sk-123456789012".into())]);
        assert_eq!(fresh.models_for("groq_1"), vec!["llama-3.1-8b-instant"]);
        // Wrong key → different cache file → no models.
        let wrong = ChannelCatalog::new(dir.path());
        wrong.load(&[("groq_1".into(), "sk-different-key".into())]);
        assert!(wrong.models_for("groq_1").is_empty());
    }
}
