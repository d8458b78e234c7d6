//! Typed view over the merged config JSON.
//!
//! ```yaml
//! ingest:
//!   fetch_timeout_secs: 30
//!   schedule_interval_secs: 300
//!   scheduler_token_env: MDR_SCHEDULER_TOKEN
//! sources:
//!   - label: coinpaprika
//!     kind: http
//!     base_url: https://api.coinpaprika.com
//!     limit: 250
//!     api_key_env: COINPAPRIKA_API_KEY
//!   - label: csv
//!     kind: csv
//!     path: data/tickers.csv
//! priority:
//!   default_rank: 99
//!   ranks: { coinpaprika: 1, coingecko: 2, csv: 3 }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mdr_reconcile::{SourcePriority, DEFAULT_UNKNOWN_RANK};
use mdr_schemas::SourceKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SCHEDULE_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub fetch_timeout_secs: u64,
    pub schedule_interval_secs: u64,
    /// Env var NAME holding the token required by trigger/purge endpoints.
    pub scheduler_token_env: Option<String>,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            schedule_interval_secs: DEFAULT_SCHEDULE_INTERVAL_SECS,
            scheduler_token_env: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub label: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Env var NAME for the API key, never the key itself.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub default_rank: u32,
    /// Empty means "use the built-in table".
    pub ranks: BTreeMap<String, u32>,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            default_rank: DEFAULT_UNKNOWN_RANK,
            ranks: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub ingest: IngestSection,
    pub sources: Vec<SourceConfig>,
    pub priority: PriorityConfig,
}

impl IngestConfig {
    /// Decode from the merged config JSON and validate.
    pub fn from_json(config_json: &Value) -> Result<Self> {
        let cfg: IngestConfig = serde_json::from_value(config_json.clone())
            .context("config does not match the ingest schema")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.fetch_timeout_secs == 0 {
            bail!("ingest.fetch_timeout_secs must be > 0");
        }
        if self.ingest.schedule_interval_secs == 0 {
            bail!("ingest.schedule_interval_secs must be > 0");
        }

        let mut seen = BTreeSet::new();
        for (i, s) in self.sources.iter().enumerate() {
            let label = s.label.trim();
            if label.is_empty() {
                bail!("sources[{i}].label must not be empty");
            }
            if !seen.insert(label.to_ascii_lowercase()) {
                bail!("duplicate source label: {label}");
            }
            match s.kind {
                SourceKind::Http => {
                    if blank(&s.base_url) {
                        bail!("source {label}: kind http requires base_url");
                    }
                }
                SourceKind::Csv => {
                    if blank(&s.path) {
                        bail!("source {label}: kind csv requires path");
                    }
                }
            }
            if s.limit == Some(0) {
                bail!("source {label}: limit must be > 0 when set");
            }
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest.fetch_timeout_secs)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.ingest.schedule_interval_secs)
    }

    pub fn source_priority(&self) -> SourcePriority {
        if self.priority.ranks.is_empty() {
            let builtin = SourcePriority::default();
            SourcePriority::new(builtin.labels(), self.priority.default_rank)
        } else {
            SourcePriority::new(
                self.priority.ranks.iter().map(|(k, v)| (k.as_str(), *v)),
                self.priority.default_rank,
            )
        }
    }
}

fn blank(v: &Option<String>) -> bool {
    v.as_deref().map(str::trim).unwrap_or("").is_empty()
}
