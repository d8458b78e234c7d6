//! In-memory [`IngestStore`] with real per-key locking and fault injection.
//!
//! Key locks are `tokio::sync::Mutex<()>` per key, taken as owned guards by a
//! cycle unit and released when the unit commits or drops. Canonical writes,
//! checkpoint moves and raw landings are buffered in the unit and applied on
//! commit, so a dropped unit leaves no trace.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdr_db::{finalized_record, CycleUnit, IngestStore, StoreError};
use mdr_schemas::{
    CanonicalPage, CanonicalQuery, CanonicalRecord, Checkpoint, IngestStats, PurgeReport,
    RawPayload, RunOutcome, RunRecord, RunStatus,
};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Tables {
    canonical: BTreeMap<String, CanonicalRecord>,
    checkpoints: BTreeMap<String, Checkpoint>,
    runs: Vec<RunRecord>,
    raw: BTreeMap<(String, String), RawPayload>,
    canonical_writes: usize,
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_begin_run: AtomicBool,
    fail_commit: AtomicBool,
    conflicts: AtomicUsize,
    fail_write_key: Mutex<Option<String>>,
    lock_hold: Mutex<Option<Duration>>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    key_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    faults: Arc<Faults>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Every operation fails with `Unavailable` while set.
    pub fn set_unavailable(&self, on: bool) {
        self.faults.unavailable.store(on, Ordering::SeqCst);
    }

    pub fn fail_begin_run(&self, on: bool) {
        self.faults.fail_begin_run.store(on, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, on: bool) {
        self.faults.fail_commit.store(on, Ordering::SeqCst);
    }

    /// The next `n` canonical writes report `Conflict`.
    pub fn inject_conflicts(&self, n: usize) {
        self.faults.conflicts.store(n, Ordering::SeqCst);
    }

    /// Writes for `key` fail with `Unavailable`.
    pub fn fail_writes_for(&self, key: Option<&str>) {
        *guard(&self.faults.fail_write_key) = key.map(str::to_string);
    }

    /// Sleep this long right after acquiring a key lock. Widens the
    /// read → write window so concurrent cycles overlap.
    pub fn hold_locks_for(&self, d: Option<Duration>) {
        *guard(&self.faults.lock_hold) = d;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Committed checkpoint without creating one.
    pub fn checkpoint(&self, source: &str) -> Option<Checkpoint> {
        guard(&self.tables).checkpoints.get(source).cloned()
    }

    pub fn canonical(&self, key: &str) -> Option<CanonicalRecord> {
        guard(&self.tables).canonical.get(key).cloned()
    }

    pub fn canonical_len(&self) -> usize {
        guard(&self.tables).canonical.len()
    }

    /// Committed canonical inserts + updates since creation.
    pub fn canonical_write_count(&self) -> usize {
        guard(&self.tables).canonical_writes
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        guard(&self.tables).runs.clone()
    }

    pub fn raw_len(&self) -> usize {
        guard(&self.tables).raw.len()
    }

    /// Seed a committed record directly.
    pub fn put_canonical(&self, record: CanonicalRecord) {
        guard(&self.tables)
            .canonical
            .insert(record.key.clone(), record);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    // Entries are never evicted; fine for the short-lived stores tests create.
    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        guard(&self.key_locks)
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl IngestStore for InMemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn get_checkpoint(&self, source: &str) -> Result<Checkpoint, StoreError> {
        self.check_available()?;
        let mut t = guard(&self.tables);
        Ok(t.checkpoints
            .entry(source.to_string())
            .or_insert_with(|| Checkpoint::zero(source))
            .clone())
    }

    async fn begin_run(
        &self,
        source: &str,
        started_at: DateTime<Utc>,
    ) -> Result<RunRecord, StoreError> {
        self.check_available()?;
        if self.faults.fail_begin_run.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("runs table unavailable".into()));
        }
        let run = RunRecord {
            run_id: Uuid::new_v4(),
            source: source.to_string(),
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            processed: 0,
            failed: 0,
            duration_ms: None,
            message: None,
        };
        guard(&self.tables).runs.push(run.clone());
        Ok(run)
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<RunRecord, StoreError> {
        self.check_available()?;
        let mut t = guard(&self.tables);
        let slot = t
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| StoreError::InvalidState(format!("unknown run {run_id}")))?;
        let done = finalized_record(slot, outcome, finished_at)?;
        *slot = done.clone();
        Ok(done)
    }

    async fn begin_cycle(&self) -> Result<Box<dyn CycleUnit>, StoreError> {
        self.check_available()?;
        Ok(Box::new(MemCycleUnit {
            store: self.clone(),
            held: HashMap::new(),
            canonical: BTreeMap::new(),
            raw: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
        }))
    }

    async fn get_canonical(&self, key: &str) -> Result<Option<CanonicalRecord>, StoreError> {
        self.check_available()?;
        Ok(self.canonical(key))
    }

    async fn list_canonical(&self, query: &CanonicalQuery) -> Result<CanonicalPage, StoreError> {
        self.check_available()?;
        let t = guard(&self.tables);
        let matching: Vec<&CanonicalRecord> =
            t.canonical.values().filter(|r| query.matches(r)).collect();
        let limit = query.effective_limit();
        let offset = query.effective_offset();
        let records = matching
            .iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|r| (*r).clone())
            .collect();
        Ok(CanonicalPage {
            records,
            total: i64::try_from(matching.len()).unwrap_or(i64::MAX),
            limit,
            offset,
        })
    }

    async fn list_runs(
        &self,
        source: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RunRecord>, StoreError> {
        self.check_available()?;
        let t = guard(&self.tables);
        let mut runs: Vec<RunRecord> = t
            .runs
            .iter()
            .filter(|r| source.map_or(true, |s| r.source == s))
            .cloned()
            .collect();
        // Newest first; insertion order breaks ties.
        runs.reverse();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(usize::try_from(limit.max(1)).unwrap_or(usize::MAX));
        Ok(runs)
    }

    async fn stats(&self) -> Result<IngestStats, StoreError> {
        self.check_available()?;
        let t = guard(&self.tables);
        let mut stats = IngestStats::default();
        for r in t.canonical.values() {
            stats.total_canonical += 1;
            *stats.per_source.entry(r.source.clone()).or_insert(0) += 1;
        }
        let last = |status: RunStatus| {
            t.runs
                .iter()
                .filter(|r| r.status == status)
                .max_by_key(|r| r.finished_at)
                .cloned()
        };
        stats.last_success = last(RunStatus::Success);
        stats.last_failure = last(RunStatus::Failure);
        Ok(stats)
    }

    async fn purge_source(&self, source: &str) -> Result<PurgeReport, StoreError> {
        self.check_available()?;
        let mut t = guard(&self.tables);
        let count = |before: usize, after: usize| (before - after) as u64;

        let before = t.canonical.len();
        t.canonical.retain(|_, r| r.source != source);
        let canonical = count(before, t.canonical.len());

        let before = t.runs.len();
        t.runs.retain(|r| r.source != source);
        let runs = count(before, t.runs.len());

        let checkpoints = u64::from(t.checkpoints.remove(source).is_some());

        let before = t.raw.len();
        t.raw.retain(|(s, _), _| s != source);
        let raw = count(before, t.raw.len());

        Ok(PurgeReport {
            source: source.to_string(),
            canonical,
            runs,
            checkpoints,
            raw,
        })
    }
}

// ---------------------------------------------------------------------------
// Cycle unit
// ---------------------------------------------------------------------------

struct MemCycleUnit {
    store: InMemoryStore,
    held: HashMap<String, OwnedMutexGuard<()>>,
    canonical: BTreeMap<String, CanonicalRecord>,
    raw: BTreeMap<(String, String), RawPayload>,
    checkpoints: BTreeMap<String, (Option<String>, DateTime<Utc>)>,
}

#[async_trait]
impl CycleUnit for MemCycleUnit {
    async fn land_raw(
        &mut self,
        source: &str,
        external_id: &str,
        payload: &RawPayload,
    ) -> Result<bool, StoreError> {
        self.store.check_available()?;
        let k = (source.to_string(), external_id.to_string());
        if self.raw.contains_key(&k) || guard(&self.store.tables).raw.contains_key(&k) {
            return Ok(false);
        }
        self.raw.insert(k, payload.clone());
        Ok(true)
    }

    async fn lock_canonical(&mut self, key: &str) -> Result<Option<CanonicalRecord>, StoreError> {
        self.store.check_available()?;
        if !self.held.contains_key(key) {
            let g = self.store.key_lock(key).lock_owned().await;
            self.held.insert(key.to_string(), g);
            let hold = *guard(&self.store.faults.lock_hold);
            if let Some(d) = hold {
                tokio::time::sleep(d).await;
            }
        }
        if let Some(r) = self.canonical.get(key) {
            return Ok(Some(r.clone()));
        }
        Ok(self.store.canonical(key))
    }

    async fn write_canonical(
        &mut self,
        record: &CanonicalRecord,
        existed: bool,
    ) -> Result<(), StoreError> {
        self.store.check_available()?;
        if !self.held.contains_key(&record.key) {
            return Err(StoreError::InvalidState(format!(
                "write without lock for key {}",
                record.key
            )));
        }
        if guard(&self.store.faults.fail_write_key).as_deref() == Some(record.key.as_str()) {
            return Err(StoreError::Unavailable(format!(
                "write failed for key {}",
                record.key
            )));
        }
        let injected = self
            .store
            .faults
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let present = self.canonical.contains_key(&record.key)
            || guard(&self.store.tables).canonical.contains_key(&record.key);
        if injected || (!existed && present) || (existed && !present) {
            return Err(StoreError::Conflict {
                key: record.key.clone(),
            });
        }
        self.canonical.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn advance_checkpoint(
        &mut self,
        source: &str,
        last_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.check_available()?;
        self.checkpoints
            .insert(source.to_string(), (last_id.map(str::to_string), at));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.store.check_available()?;
        if self.store.faults.fail_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("commit failed".into()));
        }
        let MemCycleUnit {
            store,
            held,
            canonical,
            raw,
            checkpoints,
        } = *self;
        {
            let mut t = guard(&store.tables);
            t.canonical_writes += canonical.len();
            t.canonical.extend(canonical);
            for (k, v) in raw {
                t.raw.entry(k).or_insert(v);
            }
            for (source, (last_id, at)) in checkpoints {
                let cp = t
                    .checkpoints
                    .entry(source.clone())
                    .or_insert_with(|| Checkpoint::zero(&source));
                if let Some(id) = last_id {
                    if cp.last_id.as_deref().map_or(true, |cur| id.as_str() > cur) {
                        cp.last_id = Some(id);
                    }
                }
                cp.last_timestamp = Some(at);
            }
        }
        drop(held);
        Ok(())
    }
}
