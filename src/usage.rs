//! Post-flight cost accounting and the append-only usage log.
//!
//! One JSONL row per completed (or cancelled) request, written to
//! `logs/usage_YYYYMMDD.jsonl` under a single writer lock. Files rotate by
//! calendar day; files older than the retention window are moved into
//! `logs/archive/`. Daily statistics are derived on read by scanning the
//! day's file — there is no database.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::{info, warn};

use crate::config::ChannelConfig;
use crate::registry::ModelMetadata;

/// Per-token prices actually used for a request, after precedence resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPricing {
    pub input_per_token: f64,
    pub output_per_token: f64,
    /// Currency conversion applied to the final amounts (1.0 = none).
    pub exchange_rate: f64,
}

/// Resolve pricing for a (channel, model) pair.
///
/// Model-metadata pricing (USD per 1M tokens) is authoritative when present;
/// the channel's `cost_per_token` is the fallback. The channel's currency
/// exchange rate applies in either case.
pub fn resolve_pricing(meta: &ModelMetadata, channel: &ChannelConfig) -> ResolvedPricing {
    let exchange_rate = channel
        .currency_exchange
        .as_ref()
        .map(|x| x.rate)
        .unwrap_or(1.0);

    if meta.pricing_input > 0.0 || meta.pricing_output > 0.0 {
        return ResolvedPricing {
            input_per_token: meta.pricing_input / 1e6,
            output_per_token: meta.pricing_output / 1e6,
            exchange_rate,
        };
    }
    if let Some(cost) = &channel.cost_per_token {
        return ResolvedPricing {
            input_per_token: cost.input,
            output_per_token: cost.output,
            exchange_rate,
        };
    }
    ResolvedPricing {
        input_per_token: 0.0,
        output_per_token: 0.0,
        exchange_rate,
    }
}

/// Cost breakdown for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestCost {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

/// `tokens × per-token price`, converted to the target currency.
pub fn compute_cost(input_tokens: u64, output_tokens: u64, pricing: ResolvedPricing) -> RequestCost {
    let input_cost = input_tokens as f64 * pricing.input_per_token * pricing.exchange_rate;
    let output_cost = output_tokens as f64 * pricing.output_per_token * pricing.exchange_rate;
    RequestCost {
        input_cost,
        output_cost,
        total_cost: input_cost + output_cost,
    }
}

/// One appended row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub channel_id: String,
    pub channel_name: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    /// `success`, `error`, or `cancelled`.
    pub status: String,
    pub response_time_ms: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Aggregates derived by scanning one day's file.
#[derive(Debug, Default, Serialize)]
pub struct DailyStats {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
    pub errors: u64,
    pub by_model: std::collections::HashMap<String, u64>,
    pub by_channel: std::collections::HashMap<String, u64>,
}

/// Alert row appended when a channel escalates to channel-wide blacklist.
#[derive(Debug, Serialize)]
pub struct ChannelAlert<'a> {
    pub timestamp: DateTime<Utc>,
    pub channel_id: &'a str,
    pub reason: &'a str,
}

/// Append-only usage log with daily rotation.
pub struct UsageTracker {
    logs_dir: PathBuf,
    /// Single-writer lock: rows from concurrent requests must not interleave.
    writer: Mutex<()>,
}

impl UsageTracker {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            logs_dir: logs_dir.to_path_buf(),
            writer: Mutex::new(()),
        }
    }

    fn usage_path(&self, date: NaiveDate) -> PathBuf {
        self.logs_dir
            .join(format!("usage_{}.jsonl", date.format("%Y%m%d")))
    }

    /// Append one record to today's file.
    pub async fn record(&self, record: &UsageRecord) -> anyhow::Result<()> {
        let path = self.usage_path(record.timestamp.date_naive());
        let line = serde_json::to_string(record).context("serialising usage record")?;
        self.append_line(&path, &line).await
    }

    /// Append one alert row to `channel_alerts.jsonl`.
    pub async fn record_alert(&self, channel_id: &str, reason: &str) -> anyhow::Result<()> {
        let alert = ChannelAlert {
            timestamp: Utc::now(),
            channel_id,
            reason,
        };
        let line = serde_json::to_string(&alert).context("serialising channel alert")?;
        self.append_line(&self.logs_dir.join("channel_alerts.jsonl"), &line)
            .await
    }

    async fn append_line(&self, path: &Path, line: &str) -> anyhow::Result<()> {
        let _guard = self.writer.lock().await;
        tokio::fs::create_dir_all(&self.logs_dir)
            .await
            .context("creating logs dir")?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .context("appending usage line")?;
        Ok(())
    }

    /// Scan one day's file into aggregates. Missing file → empty stats.
    pub async fn daily_stats(&self, date: NaiveDate) -> DailyStats {
        let path = self.usage_path(date);
        let Ok(content) = tokio::fs::read_to_string(&path).await else {
            return DailyStats::default();
        };
        let mut stats = DailyStats::default();
        for line in content.lines() {
            let Ok(record) = serde_json::from_str::<UsageRecord>(line) else {
                continue;
            };
            stats.requests += 1;
            stats.input_tokens += record.input_tokens;
            stats.output_tokens += record.output_tokens;
            stats.total_cost += record.total_cost;
            if record.status != "success" {
                stats.errors += 1;
            }
            *stats.by_model.entry(record.model).or_default() += 1;
            *stats.by_channel.entry(record.channel_id).or_default() += 1;
        }
        stats
    }

    /// Move usage files older than `retention_days` into `archive/`.
    pub async fn archive_old_files(&self, retention_days: u32) -> anyhow::Result<usize> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
        let archive_dir = self.logs_dir.join("archive");

        let mut moved = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.logs_dir).await else {
            return Ok(0);
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(date) = parse_usage_file_date(&name) else {
                continue;
            };
            if date >= cutoff {
                continue;
            }
            tokio::fs::create_dir_all(&archive_dir)
                .await
                .context("creating archive dir")?;
            let dest = archive_dir.join(&name);
            match tokio::fs::rename(entry.path(), &dest).await {
                Ok(()) => {
                    info!(file = %name, "archived usage log");
                    moved += 1;
                }
                Err(e) => warn!(file = %name, error = %e, "failed to archive usage log"),
            }
        }
        Ok(moved)
    }
}

/// Extract the date from a `usage_YYYYMMDD.jsonl` file name.
fn parse_usage_file_date(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_prefix("usage_")?.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stem, "%Y%m%d").ok()
}
