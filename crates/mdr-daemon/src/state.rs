//! Shared runtime state for mdr-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Sweeps (scheduled or
//! triggered) go through [`AppState::sweep`] so the last outcome is always
//! visible to health consumers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mdr_db::IngestStore;
use mdr_runtime::{run_on_interval, Orchestrator};
use mdr_schemas::{RunStatus, RunSummary};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// SweepReport
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepTrigger {
    Scheduler,
    Manual,
}

/// Outcome of the most recent `run_once` sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepReport {
    pub trigger: SweepTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summaries: BTreeMap<String, RunSummary>,
}

impl SweepReport {
    pub fn failed_sources(&self) -> usize {
        self.summaries
            .values()
            .filter(|s| s.status == RunStatus::Failure)
            .count()
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub build: BuildInfo,
    pub orchestrator: Arc<Orchestrator>,
    /// Same store the orchestrator writes to; read paths go here directly.
    pub store: Arc<dyn IngestStore>,
    /// When set, trigger and purge require a matching `X-Scheduler-Token`.
    pub scheduler_token: Option<String>,
    pub last_sweep: RwLock<Option<SweepReport>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, scheduler_token: Option<String>) -> Self {
        Self {
            build: BuildInfo {
                service: "mdr-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            store: Arc::clone(orchestrator.store()),
            orchestrator,
            scheduler_token,
            last_sweep: RwLock::new(None),
        }
    }

    /// Run one sweep over every source and record it as the last sweep.
    pub async fn sweep(&self, trigger: SweepTrigger) -> SweepReport {
        let started_at = Utc::now();
        let summaries = self.orchestrator.run_once().await;
        let report = SweepReport {
            trigger,
            started_at,
            finished_at: Utc::now(),
            summaries,
        };
        tracing::info!(
            trigger = ?trigger,
            sources = report.summaries.len(),
            failed = report.failed_sources(),
            "sweep finished"
        );
        *self.last_sweep.write().await = Some(report.clone());
        report
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Spawn the interval scheduler. The first sweep runs immediately; the task
/// exits when `shutdown` flips to `true` or its sender is dropped.
pub fn spawn_scheduler(
    state: Arc<AppState>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_on_interval(every, shutdown, || async {
            state.sweep(SweepTrigger::Scheduler).await;
        })
        .await;
    })
}
