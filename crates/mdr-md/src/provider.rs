//! Source adapter boundary.
//!
//! An adapter knows how to reach ONE upstream (HTTP endpoint, CSV file) and
//! hands back raw payloads newer than a cursor. It does not transform,
//! persist or merge anything.

use async_trait::async_trait;
use mdr_schemas::{RawPayload, SourceKind};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Source-scoped fetch failure. Any variant fails the whole source cycle
/// without touching other sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network or transport failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Upstream answered with a non-success status.
    #[error("upstream api error status={status}: {message}")]
    Api { status: u16, message: String },
    /// Response body or file content could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// Local IO failure other than "file not found".
    #[error("io error: {0}")]
    Io(String),
    /// Fetch exceeded the configured bound.
    #[error("fetch timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Upstream source contract.
///
/// Object-safe so the orchestrator can hold `Arc<dyn SourceAdapter>`;
/// `Send + Sync` so cycles can run on any runtime worker.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable source label (`"coinpaprika"`, `"csv"`); used for checkpoints,
    /// run records, attribution and priority lookup.
    fn label(&self) -> &str;

    /// Which raw schema [`crate::transform`] should apply to this source's payloads.
    fn kind(&self) -> SourceKind;

    /// Fetch payloads whose external id is strictly greater than `since_id`
    /// (or all available payloads when `None`).
    async fn fetch(&self, since_id: Option<&str>) -> Result<Vec<RawPayload>, FetchError>;
}

/// Keep payloads strictly after `since_id`. Payloads without an external id
/// are kept so transform rejects them and the cycle counts them as failed.
pub(crate) fn newer_than(payload: &RawPayload, since_id: Option<&str>) -> bool {
    match (mdr_schemas::payload_external_id(payload), since_id) {
        (Some(id), Some(cursor)) => id > cursor,
        _ => true,
    }
}
