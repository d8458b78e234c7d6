//! Persistence contract shared by the Postgres store and the in-memory test store.
//!
//! # Invariants
//!
//! - At most one canonical record per key.
//! - A [`CycleUnit`] is one source cycle's unit of work. Writes made through
//!   it become visible only on [`CycleUnit::commit`]; dropping it rolls them
//!   back and releases every key lock it holds.
//! - [`CycleUnit::lock_canonical`] takes the per-key exclusive lock and holds
//!   it until the unit ends. Read → merge → write for a key happens under it.
//! - Run ledger writes do not go through a unit, so a failure outcome is
//!   recorded even when the cycle's writes are rolled back.
//! - A finalized run is never mutated again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdr_schemas::{
    CanonicalPage, CanonicalQuery, CanonicalRecord, Checkpoint, IngestStats, PurgeReport,
    RawPayload, RunOutcome, RunRecord,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A concurrent writer created the key first (unique violation on insert),
    /// or the row vanished under an update. Retryable with a fresh lock.
    #[error("write conflict on key {key}")]
    Conflict { key: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("store decode failed: {0}")]
    Decode(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Unit of work for one source cycle.
#[async_trait]
pub trait CycleUnit: Send {
    /// Store a fetched payload verbatim, insert-if-absent on
    /// `(source, external_id)`. Returns `true` when a new row was written.
    async fn land_raw(
        &mut self,
        source: &str,
        external_id: &str,
        payload: &RawPayload,
    ) -> Result<bool, StoreError>;

    /// Acquire the exclusive lock for `key` and return the current record.
    async fn lock_canonical(&mut self, key: &str) -> Result<Option<CanonicalRecord>, StoreError>;

    /// Insert (`existed == false`) or replace (`existed == true`) the record
    /// for `record.key`. The caller must hold the key lock.
    async fn write_canonical(
        &mut self,
        record: &CanonicalRecord,
        existed: bool,
    ) -> Result<(), StoreError>;

    /// Stamp `at` and, when given, move the source cursor to `last_id`. The
    /// store never moves `last_id` backwards.
    async fn advance_checkpoint(
        &mut self,
        source: &str,
        last_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IngestStore: Send + Sync {
    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Current cursor for `source`; created as the zero value on first access.
    async fn get_checkpoint(&self, source: &str) -> Result<Checkpoint, StoreError>;

    /// Append a `running` run record.
    async fn begin_run(&self, source: &str, started_at: DateTime<Utc>)
        -> Result<RunRecord, StoreError>;

    /// Move a `running` run to its terminal state exactly once.
    async fn finalize_run(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<RunRecord, StoreError>;

    async fn begin_cycle(&self) -> Result<Box<dyn CycleUnit>, StoreError>;

    /// Committed record for `key`, without locking.
    async fn get_canonical(&self, key: &str) -> Result<Option<CanonicalRecord>, StoreError>;

    async fn list_canonical(&self, query: &CanonicalQuery) -> Result<CanonicalPage, StoreError>;

    /// Most recent runs first.
    async fn list_runs(&self, source: Option<&str>, limit: i64)
        -> Result<Vec<RunRecord>, StoreError>;

    async fn stats(&self) -> Result<IngestStats, StoreError>;

    /// Delete canonical rows attributed to `source`, plus its runs,
    /// checkpoint and landed raw payloads.
    async fn purge_source(&self, source: &str) -> Result<PurgeReport, StoreError>;
}

/// Build the terminal record for a finalize call. Shared by every store so
/// duration and status rules are identical.
pub fn finalized_record(
    run: &RunRecord,
    outcome: &RunOutcome,
    finished_at: DateTime<Utc>,
) -> Result<RunRecord, StoreError> {
    if run.status.is_terminal() {
        return Err(StoreError::InvalidState(format!(
            "run {} already finalized as {}",
            run.run_id,
            run.status.as_str()
        )));
    }
    if !outcome.status.is_terminal() {
        return Err(StoreError::InvalidState(format!(
            "run {} cannot be finalized as {}",
            run.run_id,
            outcome.status.as_str()
        )));
    }
    let duration_ms = (finished_at - run.started_at).num_milliseconds().max(0);
    Ok(RunRecord {
        run_id: run.run_id,
        source: run.source.clone(),
        status: outcome.status,
        started_at: run.started_at,
        finished_at: Some(finished_at),
        processed: outcome.processed,
        failed: outcome.failed,
        duration_ms: Some(duration_ms),
        message: outcome.message.clone(),
    })
}
