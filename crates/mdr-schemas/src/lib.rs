//! Shared data model for the market-data reconciler.
//!
//! Plain data only: no IO, no async, no persistence logic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod price;

pub use price::{PriceE8, PriceError, PRICE_SCALE};

/// One raw payload as produced by a source adapter (field name -> value).
///
/// The shape is source-specific; only the transform knows how to read it.
pub type RawPayload = serde_json::Map<String, serde_json::Value>;

/// Payload field every adapter stamps with the source's external identifier.
pub const EXTERNAL_ID_FIELD: &str = "external_id";

/// Extract the adapter-stamped external id from a raw payload, if present.
pub fn payload_external_id(payload: &RawPayload) -> Option<&str> {
    payload
        .get(EXTERNAL_ID_FIELD)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Canonical key form shared by the write and read paths: trimmed and
/// uppercased. `None` when blank.
pub fn normalize_key(raw: &str) -> Option<String> {
    let k = raw.trim();
    (!k.is_empty()).then(|| k.to_uppercase())
}

/// Raw schema family a source produces. Selects the transform mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// HTTP ticker API (CoinPaprika-shaped ticker objects).
    Http,
    /// Headed CSV file.
    Csv,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Http => "http",
            SourceKind::Csv => "csv",
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical record
// ---------------------------------------------------------------------------

/// The single reconciled snapshot for one entity key.
///
/// At most one exists per `key` at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Normalized entity identifier (trimmed, uppercased ticker).
    pub key: String,
    /// Display name; resolved by source priority during merge.
    pub name: Option<String>,
    /// Source label that supplied `name`. Independent of `source`, which
    /// tracks the volatile fields.
    #[serde(default)]
    pub name_source: Option<String>,
    /// Price in USD, fixed at 8 decimal places.
    pub price: PriceE8,
    pub market_cap_usd: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub percent_change_24h: Option<f64>,
    /// Source label that last won the volatile-field merge.
    pub source: String,
    /// Timestamp of the data as reported by its source (UTC).
    pub created_at: DateTime<Utc>,
    /// When this system last wrote the record.
    pub ingested_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// Equal in every field except `ingested_at`.
    ///
    /// Used to suppress no-op writes when re-merging data already stored.
    pub fn same_content(&self, other: &CanonicalRecord) -> bool {
        self.key == other.key
            && self.name == other.name
            && self.name_source == other.name_source
            && self.price == other.price
            && self.market_cap_usd == other.market_cap_usd
            && self.volume_24h_usd == other.volume_24h_usd
            && self.percent_change_24h == other.percent_change_24h
            && self.source == other.source
            && self.created_at == other.created_at
    }

    /// Label whose rank governs `name`. Records without explicit provenance
    /// fall back to `source`.
    pub fn name_origin(&self) -> &str {
        self.name_source.as_deref().unwrap_or(&self.source)
    }
}

/// Transform output: a candidate record not yet merged or persisted,
/// plus the external id it came from (drives checkpoint tracking).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub external_id: String,
    pub record: CanonicalRecord,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Per-source cursor: the last successfully processed external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: String,
    pub last_id: Option<String>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Zero-value checkpoint returned on first access for a source.
    pub fn zero(source: &str) -> Self {
        Self {
            source: source.to_string(),
            last_id: None,
            last_timestamp: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Run ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failure" => Some(RunStatus::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// One ingestion attempt for one source. Append-only: finalized exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub source: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: i64,
    pub failed: i64,
    pub duration_ms: Option<i64>,
    pub message: Option<String>,
}

/// Terminal outcome handed to the run ledger's `finalize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub processed: i64,
    pub failed: i64,
    pub message: Option<String>,
}

impl RunOutcome {
    pub fn success(processed: i64, failed: i64) -> Self {
        Self {
            status: RunStatus::Success,
            processed,
            failed,
            message: None,
        }
    }

    /// Source-level failure: nothing processed, the cycle itself counts once.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failure,
            processed: 0,
            failed: 1,
            message: Some(message.into()),
        }
    }
}

/// Per-source result returned to whoever triggered `run_once`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub processed: i64,
    pub failed: i64,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&RunRecord> for RunSummary {
    fn from(r: &RunRecord) -> Self {
        Self {
            status: r.status,
            processed: r.processed,
            failed: r.failed,
            duration_ms: r.duration_ms.unwrap_or(0),
            message: r.message.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 200;

/// Filter + pagination for listing canonical records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalQuery {
    pub key: Option<String>,
    pub source: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub created_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub created_to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl CanonicalQuery {
    /// Key filter normalized the same way the transform normalizes keys.
    pub fn normalized_key(&self) -> Option<String> {
        self.key.as_deref().and_then(normalize_key)
    }

    /// Effective limit, clamped to `1..=MAX_PAGE_LIMIT`.
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    /// True when `r` satisfies every filter (pagination excluded).
    pub fn matches(&self, r: &CanonicalRecord) -> bool {
        if let Some(k) = self.normalized_key() {
            if r.key != k {
                return false;
            }
        }
        if let Some(s) = self.source.as_deref() {
            if r.source != s {
                return false;
            }
        }
        if let Some(from) = self.created_from {
            if r.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if r.created_at > to {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPage {
    pub records: Vec<CanonicalRecord>,
    /// Total matches before pagination.
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Aggregate view for health/stats consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub total_canonical: i64,
    /// Canonical record count per attributed source (deterministic order).
    pub per_source: BTreeMap<String, i64>,
    pub last_success: Option<RunRecord>,
    pub last_failure: Option<RunRecord>,
}

/// Row counts removed by an administrative purge of one source label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub source: String,
    pub canonical: u64,
    pub runs: u64,
    pub checkpoints: u64,
    pub raw: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rec(key: &str, source: &str, created_secs: i64) -> CanonicalRecord {
        CanonicalRecord {
            key: key.to_string(),
            name: Some("Bitcoin".to_string()),
            name_source: None,
            price: PriceE8::from_units(100 * PRICE_SCALE),
            market_cap_usd: None,
            volume_24h_usd: None,
            percent_change_24h: None,
            source: source.to_string(),
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
            ingested_at: Utc.timestamp_opt(created_secs + 5, 0).unwrap(),
        }
    }

    #[test]
    fn key_normalization_handles_non_ascii_tickers() {
        assert_eq!(normalize_key("  ñeko "), Some("ÑEKO".to_string()));
        assert_eq!(normalize_key("   "), None);

        // Stored the way transform stores it.
        let r = rec(&normalize_key("ñeko").unwrap(), "csv", 1_700_000_000);
        let q = CanonicalQuery {
            key: Some("ñeko".into()),
            ..Default::default()
        };
        assert!(q.matches(&r));
    }

    #[test]
    fn same_content_ignores_ingested_at_only() {
        let a = rec("BTC", "csv", 1_700_000_000);
        let mut b = a.clone();
        b.ingested_at = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        assert!(a.same_content(&b));

        b.volume_24h_usd = Some(1.0);
        assert!(!a.same_content(&b));
    }

    #[test]
    fn run_status_round_trips_through_str() {
        for s in [RunStatus::Running, RunStatus::Success, RunStatus::Failure] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("RUNNING"), None);
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Failure.is_terminal());
    }

    #[test]
    fn query_limit_is_clamped() {
        let q = CanonicalQuery {
            limit: Some(10_000),
            offset: Some(-3),
            ..Default::default()
        };
        assert_eq!(q.effective_limit(), MAX_PAGE_LIMIT);
        assert_eq!(q.effective_offset(), 0);
        assert_eq!(CanonicalQuery::default().effective_limit(), DEFAULT_PAGE_LIMIT);

        let q = CanonicalQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(q.effective_limit(), 1);
    }

    #[test]
    fn query_matches_normalizes_key_and_bounds_are_inclusive() {
        let r = rec("BTC", "coinpaprika", 1_700_000_000);
        let q = CanonicalQuery {
            key: Some(" btc ".to_string()),
            created_from: Some(r.created_at),
            created_to: Some(r.created_at),
            ..Default::default()
        };
        assert!(q.matches(&r));

        let q = CanonicalQuery {
            source: Some("csv".to_string()),
            ..Default::default()
        };
        assert!(!q.matches(&r));
    }

    #[test]
    fn payload_external_id_ignores_blank() {
        let mut p = RawPayload::new();
        assert_eq!(payload_external_id(&p), None);
        p.insert(EXTERNAL_ID_FIELD.into(), serde_json::json!("  "));
        assert_eq!(payload_external_id(&p), None);
        p.insert(EXTERNAL_ID_FIELD.into(), serde_json::json!("csv-001"));
        assert_eq!(payload_external_id(&p), Some("csv-001"));
    }

    #[test]
    fn run_summary_from_record() {
        let r = RunRecord {
            run_id: Uuid::new_v4(),
            source: "csv".into(),
            status: RunStatus::Success,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            processed: 3,
            failed: 1,
            duration_ms: Some(12),
            message: None,
        };
        let s = RunSummary::from(&r);
        assert_eq!(s.processed, 3);
        assert_eq!(s.failed, 1);
        assert_eq!(s.duration_ms, 12);
        assert_eq!(s.status, RunStatus::Success);
    }
}
