//! Request and response types for all mdr-daemon HTTP endpoints.
//!
//! `Serialize + Deserialize` so Axum can encode them and tests can decode
//! them. No business logic lives here.

use chrono::{DateTime, Utc};
use mdr_schemas::{CanonicalQuery, CanonicalRecord, RunRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::SweepReport;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
    pub store_reachable: bool,
    /// Most recently started run across all sources.
    pub last_run: Option<RunRecord>,
    pub last_sweep: Option<SweepReport>,
    pub sources: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// /v1/records
// ---------------------------------------------------------------------------

/// Query string for GET /v1/records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordsParams {
    pub key: Option<String>,
    pub source: Option<String>,
    /// Inclusive lower bound on `created_at` (RFC 3339).
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at` (RFC 3339).
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<RecordsParams> for CanonicalQuery {
    fn from(p: RecordsParams) -> Self {
        CanonicalQuery {
            key: p.key,
            source: p.source,
            created_from: p.from,
            created_to: p.to,
            limit: p.limit,
            offset: p.offset,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
    pub returned: usize,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub request_id: Uuid,
    pub api_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsResponse {
    pub data: Vec<CanonicalRecord>,
    pub pagination: Pagination,
    pub meta: ResponseMeta,
}

// ---------------------------------------------------------------------------
// /v1/runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunsParams {
    pub source: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsResponse {
    pub runs: Vec<RunRecord>,
}

// ---------------------------------------------------------------------------
// /v1/trigger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    /// "triggered"
    pub status: String,
    pub trigger_id: Uuid,
    pub sources: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
