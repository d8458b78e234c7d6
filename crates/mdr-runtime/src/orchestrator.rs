//! Ingestion cycle driver.
//!
//! # Invariants
//!
//! - Exactly one `begin_run` / `finalize_run` pair per source cycle, when the
//!   ledger is reachable.
//! - A fetch failure or timeout fails only that source's cycle; the checkpoint
//!   is not touched.
//! - A bad record increments `failed` and never aborts the batch.
//! - Read → merge → write for a key happens under that key's lock. Keys are
//!   visited in sorted order so concurrent cycles lock in the same order.
//! - Any store error rolls back the cycle's unit of work: no canonical write
//!   and no checkpoint move survive it.
//! - The checkpoint only moves forward.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use mdr_db::{CycleUnit, IngestStore, StoreError};
use mdr_md::{transform, FetchError, SourceAdapter};
use mdr_reconcile::{merge, SourcePriority};
use mdr_schemas::{
    payload_external_id, Candidate, CanonicalRecord, RawPayload, RunOutcome, RunRecord,
    RunStatus, RunSummary,
};
use tokio::sync::watch;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub priority: SourcePriority,
    /// Upper bound on one adapter fetch.
    pub fetch_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            priority: SourcePriority::default(),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// What a successful batch did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BatchTally {
    processed: i64,
    failed: i64,
    written: i64,
}

pub struct Orchestrator {
    store: Arc<dyn IngestStore>,
    sources: Vec<Arc<dyn SourceAdapter>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn IngestStore>,
        sources: Vec<Arc<dyn SourceAdapter>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            sources,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn IngestStore> {
        &self.store
    }

    pub fn source_labels(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.label().to_string()).collect()
    }

    /// One cycle for every configured source, concurrently. Never fails: every
    /// outcome is in the returned map and in the run ledger.
    pub async fn run_once(&self) -> BTreeMap<String, RunSummary> {
        let cycles = self.sources.iter().map(|adapter| async move {
            let label = adapter.label().to_string();
            let summary = self.run_source_cycle(adapter.as_ref()).await;
            (label, summary)
        });
        join_all(cycles).await.into_iter().collect()
    }

    /// Drive `run_once` every `every` until `shutdown` flips to `true` or its
    /// sender is dropped. The first sweep runs immediately.
    pub async fn run_forever(&self, every: Duration, shutdown: watch::Receiver<bool>) {
        run_on_interval(every, shutdown, || async {
            let summaries = self.run_once().await;
            let failed = summaries
                .values()
                .filter(|s| s.status == RunStatus::Failure)
                .count();
            tracing::info!(sources = summaries.len(), failed, "scheduled sweep finished");
        })
        .await;
    }

    /// Run one cycle for `adapter` and return its summary.
    pub async fn run_source_cycle(&self, adapter: &dyn SourceAdapter) -> RunSummary {
        let label = adapter.label().to_string();
        let started_at = Utc::now();

        let run = match self.store.begin_run(&label, started_at).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(source = %label, error = %e, "cannot open run record");
                return RunSummary {
                    status: RunStatus::Failure,
                    processed: 0,
                    failed: 1,
                    duration_ms: (Utc::now() - started_at).num_milliseconds().max(0),
                    message: Some(format!("run ledger unavailable: {e}")),
                };
            }
        };

        let span = tracing::info_span!("source_cycle", source = %label, run_id = %run.run_id);
        let outcome = self.cycle(adapter, &label).instrument(span.clone()).await;
        self.finish(&run, outcome).instrument(span).await
    }

    async fn cycle(&self, adapter: &dyn SourceAdapter, label: &str) -> RunOutcome {
        let checkpoint = match self.store.get_checkpoint(label).await {
            Ok(c) => c,
            Err(e) => return RunOutcome::failure(format!("checkpoint read failed: {e}")),
        };
        let cursor = checkpoint.last_id;

        let batch = match self.fetch_bounded(adapter, cursor.as_deref()).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "fetch failed");
                return RunOutcome::failure(e.to_string());
            }
        };
        tracing::debug!(fetched = batch.len(), cursor = ?cursor, "batch fetched");

        let unit = match self.store.begin_cycle().await {
            Ok(u) => u,
            Err(e) => return RunOutcome::failure(format!("begin cycle failed: {e}")),
        };

        match self
            .process_batch(unit, adapter, label, cursor.as_deref(), batch)
            .await
        {
            Ok(t) => {
                tracing::info!(
                    processed = t.processed,
                    failed = t.failed,
                    written = t.written,
                    "cycle committed"
                );
                RunOutcome::success(t.processed, t.failed)
            }
            Err(e) => {
                tracing::error!(error = %e, "cycle rolled back");
                RunOutcome::failure(e.to_string())
            }
        }
    }

    async fn fetch_bounded(
        &self,
        adapter: &dyn SourceAdapter,
        cursor: Option<&str>,
    ) -> Result<Vec<RawPayload>, FetchError> {
        let limit = self.config.fetch_timeout;
        match tokio::time::timeout(limit, adapter.fetch(cursor)).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Timeout {
                after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Land, transform, merge and persist one batch inside `unit`. The unit is
    /// committed on success and dropped (rolled back) on any store error.
    async fn process_batch(
        &self,
        mut unit: Box<dyn CycleUnit>,
        adapter: &dyn SourceAdapter,
        label: &str,
        cursor: Option<&str>,
        batch: Vec<RawPayload>,
    ) -> Result<BatchTally, StoreError> {
        let ingested_at = Utc::now();
        let mut tally = BatchTally::default();
        let mut candidates: Vec<Candidate> = Vec::with_capacity(batch.len());

        for payload in &batch {
            if let Some(ext) = payload_external_id(payload) {
                unit.land_raw(label, ext, payload).await?;
            }
            match transform(adapter.kind(), label, payload, ingested_at) {
                Ok(c) => candidates.push(c),
                Err(e) => {
                    tally.failed += 1;
                    tracing::warn!(
                        external_id = payload_external_id(payload).unwrap_or("<none>"),
                        error = %e,
                        "record rejected"
                    );
                }
            }
        }

        // Stable: records for the same key keep their arrival order.
        candidates.sort_by(|a, b| a.record.key.cmp(&b.record.key));

        let mut max_id: Option<String> = cursor.map(str::to_string);
        for c in candidates {
            if self.upsert_locked(unit.as_mut(), &c.record).await? {
                tally.written += 1;
            }
            tally.processed += 1;
            if max_id.as_deref().map_or(true, |m| c.external_id.as_str() > m) {
                max_id = Some(c.external_id);
            }
        }

        // Stamped on every committed cycle, even an empty one.
        unit.advance_checkpoint(label, max_id.as_deref(), Utc::now())
            .await?;

        unit.commit().await?;
        Ok(tally)
    }

    /// Critical section for one key. Returns `true` when a write happened.
    ///
    /// A `Conflict` (another cycle inserted the key between our lock and our
    /// insert) is retried once with a fresh lock and read.
    async fn upsert_locked(
        &self,
        unit: &mut dyn CycleUnit,
        incoming: &CanonicalRecord,
    ) -> Result<bool, StoreError> {
        let mut retried = false;
        loop {
            let existing = unit.lock_canonical(&incoming.key).await?;
            let merged = merge(existing.as_ref(), incoming.clone(), &self.config.priority)
                .map_err(|e| StoreError::InvalidState(e.to_string()))?;

            if let Some(current) = &existing {
                if merged.same_content(current) {
                    return Ok(false);
                }
            }

            match unit.write_canonical(&merged, existing.is_some()).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_conflict() && !retried => {
                    tracing::warn!(key = %incoming.key, "write conflict; retrying once");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finish(&self, run: &RunRecord, outcome: RunOutcome) -> RunSummary {
        let finished_at = Utc::now();
        match self
            .store
            .finalize_run(run.run_id, &outcome, finished_at)
            .await
        {
            Ok(done) => RunSummary::from(&done),
            Err(e) => {
                tracing::error!(error = %e, "cannot finalize run record");
                let message = match outcome.message {
                    Some(m) => format!("{m}; ledger finalize failed: {e}"),
                    None => format!("ledger finalize failed: {e}"),
                };
                RunSummary {
                    status: outcome.status,
                    processed: outcome.processed,
                    failed: outcome.failed,
                    duration_ms: (finished_at - run.started_at).num_milliseconds().max(0),
                    message: Some(message),
                }
            }
        }
    }
}

/// Call `sweep` every `every` until `shutdown` flips to `true` or its sender is
/// dropped. The first sweep runs immediately; a sweep is never interrupted.
/// Missed ticks are delayed, not bunched.
pub async fn run_on_interval<F, Fut>(
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut sweep: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => sweep().await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!("scheduler stopped");
}
