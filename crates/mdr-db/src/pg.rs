//! Postgres implementation of [`IngestStore`].
//!
//! Key locks are `SELECT ... FOR UPDATE` row locks inside the cycle's
//! transaction. A key with no row yet cannot be row-locked, so two cycles may
//! both try to insert it; the loser's insert runs under a savepoint and comes
//! back as [`StoreError::Conflict`] with the transaction still usable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdr_schemas::{
    CanonicalPage, CanonicalQuery, CanonicalRecord, Checkpoint, IngestStats, PriceE8,
    PurgeReport, RawPayload, RunOutcome, RunRecord, RunStatus,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::store::{finalized_record, CycleUnit, IngestStore, StoreError};

const UNIQUE_VIOLATION: &str = "23505";
const UNDEFINED_TABLE: &str = "42P01";

const CANONICAL_COLUMNS: &str = "key, name, name_source, price_e8, market_cap_usd, volume_24h_usd, \
     percent_change_24h, source, created_at, ingested_at";

const RUN_COLUMNS: &str =
    "run_id, source, status, started_at, finished_at, processed, failed, duration_ms, message";

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn sqlstate(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn map_sqlx(what: &str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Unavailable(format!("{what}: {e}")),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. } => StoreError::Decode(format!("{what}: {e}")),
        other => StoreError::Query(format!("{what}: {other}")),
    }
}

fn decode(e: sqlx::Error) -> StoreError {
    StoreError::Decode(e.to_string())
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn canonical_from_row(row: &PgRow) -> Result<CanonicalRecord, StoreError> {
    let price_e8: i64 = row.try_get("price_e8").map_err(decode)?;
    if price_e8 < 0 {
        return Err(StoreError::Decode(format!("negative price_e8: {price_e8}")));
    }
    Ok(CanonicalRecord {
        key: row.try_get("key").map_err(decode)?,
        name: row.try_get("name").map_err(decode)?,
        name_source: row.try_get("name_source").map_err(decode)?,
        price: PriceE8::from_units(price_e8),
        market_cap_usd: row.try_get("market_cap_usd").map_err(decode)?,
        volume_24h_usd: row.try_get("volume_24h_usd").map_err(decode)?,
        percent_change_24h: row.try_get("percent_change_24h").map_err(decode)?,
        source: row.try_get("source").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        ingested_at: row.try_get("ingested_at").map_err(decode)?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let status_s: String = row.try_get("status").map_err(decode)?;
    let status = RunStatus::parse(&status_s)
        .ok_or_else(|| StoreError::Decode(format!("unknown run status: {status_s}")))?;
    Ok(RunRecord {
        run_id: row.try_get("run_id").map_err(decode)?,
        source: row.try_get("source").map_err(decode)?,
        status,
        started_at: row.try_get("started_at").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
        processed: row.try_get("processed").map_err(decode)?,
        failed: row.try_get("failed").map_err(decode)?,
        duration_ms: row.try_get("duration_ms").map_err(decode)?,
        message: row.try_get("message").map_err(decode)?,
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let sql = format!("select {RUN_COLUMNS} from runs where run_id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("fetch run", e))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn last_run_with_status(&self, status: RunStatus) -> Result<Option<RunRecord>, StoreError> {
        let sql = format!(
            "select {RUN_COLUMNS} from runs where status = $1 \
             order by finished_at desc nulls last, started_at desc limit 1"
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("last run", e))?;
        row.as_ref().map(run_from_row).transpose()
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("select 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("ping", e))?;
        Ok(())
    }

    async fn get_checkpoint(&self, source: &str) -> Result<Checkpoint, StoreError> {
        sqlx::query("insert into checkpoints (source) values ($1) on conflict (source) do nothing")
            .bind(source)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("create checkpoint", e))?;

        let row = sqlx::query("select source, last_id, last_timestamp from checkpoints where source = $1")
            .bind(source)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx("read checkpoint", e))?;

        Ok(Checkpoint {
            source: row.try_get("source").map_err(decode)?,
            last_id: row.try_get("last_id").map_err(decode)?,
            last_timestamp: row.try_get("last_timestamp").map_err(decode)?,
        })
    }

    async fn begin_run(
        &self,
        source: &str,
        started_at: DateTime<Utc>,
    ) -> Result<RunRecord, StoreError> {
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
        sqlx::query("insert into runs (run_id, source, status, started_at) values ($1, $2, $3, $4)")
            .bind(run.run_id)
            .bind(&run.source)
            .bind(run.status.as_str())
            .bind(run.started_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("begin run", e))?;
        Ok(run)
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<RunRecord, StoreError> {
        let current = self
            .fetch_run(run_id)
            .await?
            .ok_or_else(|| StoreError::InvalidState(format!("unknown run {run_id}")))?;
        let done = finalized_record(&current, outcome, finished_at)?;

        let res = sqlx::query(
            r#"
            update runs
            set status = $2, finished_at = $3, processed = $4, failed = $5,
                duration_ms = $6, message = $7
            where run_id = $1 and status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(done.status.as_str())
        .bind(done.finished_at)
        .bind(done.processed)
        .bind(done.failed)
        .bind(done.duration_ms)
        .bind(&done.message)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("finalize run", e))?;

        if res.rows_affected() != 1 {
            return Err(StoreError::InvalidState(format!(
                "run {run_id} was finalized concurrently"
            )));
        }
        Ok(done)
    }

    async fn begin_cycle(&self) -> Result<Box<dyn CycleUnit>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("begin cycle", e))?;
        Ok(Box::new(PgCycleUnit { tx }))
    }

    async fn get_canonical(&self, key: &str) -> Result<Option<CanonicalRecord>, StoreError> {
        let sql = format!("select {CANONICAL_COLUMNS} from canonical_records where key = $1");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get canonical", e))?;
        row.as_ref().map(canonical_from_row).transpose()
    }

    async fn list_canonical(&self, query: &CanonicalQuery) -> Result<CanonicalPage, StoreError> {
        const FILTER: &str = r#"
            ($1::text is null or key = $1)
            and ($2::text is null or source = $2)
            and ($3::timestamptz is null or created_at >= $3)
            and ($4::timestamptz is null or created_at <= $4)
        "#;
        let key = query.normalized_key();
        let limit = query.effective_limit();
        let offset = query.effective_offset();

        let (total,): (i64,) =
            sqlx::query_as(&format!("select count(*)::bigint from canonical_records where {FILTER}"))
                .bind(&key)
                .bind(&query.source)
                .bind(query.created_from)
                .bind(query.created_to)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx("count canonical", e))?;

        let sql = format!(
            "select {CANONICAL_COLUMNS} from canonical_records where {FILTER} \
             order by key limit $5 offset $6"
        );
        let rows = sqlx::query(&sql)
            .bind(&key)
            .bind(&query.source)
            .bind(query.created_from)
            .bind(query.created_to)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("list canonical", e))?;

        let records = rows
            .iter()
            .map(canonical_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CanonicalPage {
            records,
            total,
            limit,
            offset,
        })
    }

    async fn list_runs(
        &self,
        source: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let sql = format!(
            "select {RUN_COLUMNS} from runs where ($1::text is null or source = $1) \
             order by started_at desc, run_id limit $2"
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .bind(limit.max(1))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("list runs", e))?;
        rows.iter().map(run_from_row).collect()
    }

    async fn stats(&self) -> Result<IngestStats, StoreError> {
        let rows = sqlx::query(
            "select source, count(*)::bigint as n from canonical_records group by source",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("stats per source", e))?;

        let mut stats = IngestStats::default();
        for row in rows {
            let source: String = row.try_get("source").map_err(decode)?;
            let n: i64 = row.try_get("n").map_err(decode)?;
            stats.total_canonical += n;
            stats.per_source.insert(source, n);
        }
        stats.last_success = self.last_run_with_status(RunStatus::Success).await?;
        stats.last_failure = self.last_run_with_status(RunStatus::Failure).await?;
        Ok(stats)
    }

    async fn purge_source(&self, source: &str) -> Result<PurgeReport, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("begin purge", e))?;

        let canonical = sqlx::query("delete from canonical_records where source = $1")
            .bind(source)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("purge canonical", e))?
            .rows_affected();
        let runs = sqlx::query("delete from runs where source = $1")
            .bind(source)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("purge runs", e))?
            .rows_affected();
        let checkpoints = sqlx::query("delete from checkpoints where source = $1")
            .bind(source)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("purge checkpoints", e))?
            .rows_affected();

        // raw_payloads may be absent on databases that never enabled raw
        // landing. Only "undefined table" is tolerated; the savepoint keeps
        // the outer transaction usable after that error.
        let raw = {
            let mut sp = sqlx::Connection::begin(&mut *tx)
                .await
                .map_err(|e| map_sqlx("purge savepoint", e))?;
            match sqlx::query("delete from raw_payloads where source = $1")
                .bind(source)
                .execute(&mut *sp)
                .await
            {
                Ok(res) => {
                    sp.commit()
                        .await
                        .map_err(|e| map_sqlx("purge savepoint release", e))?;
                    res.rows_affected()
                }
                Err(e) if sqlstate(&e).as_deref() == Some(UNDEFINED_TABLE) => {
                    sp.rollback()
                        .await
                        .map_err(|e| map_sqlx("purge savepoint rollback", e))?;
                    tracing::debug!(source, "raw_payloads table absent; nothing to purge");
                    0
                }
                Err(e) => return Err(map_sqlx("purge raw", e)),
            }
        };

        tx.commit().await.map_err(|e| map_sqlx("commit purge", e))?;

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

/// One source cycle's transaction. Dropping it without `commit` rolls back.
pub struct PgCycleUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CycleUnit for PgCycleUnit {
    async fn land_raw(
        &mut self,
        source: &str,
        external_id: &str,
        payload: &RawPayload,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            insert into raw_payloads (source, external_id, payload)
            values ($1, $2, $3)
            on conflict (source, external_id) do nothing
            "#,
        )
        .bind(source)
        .bind(external_id)
        .bind(sqlx::types::Json(payload))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx("land raw", e))?;
        Ok(res.rows_affected() == 1)
    }

    async fn lock_canonical(&mut self, key: &str) -> Result<Option<CanonicalRecord>, StoreError> {
        let sql = format!(
            "select {CANONICAL_COLUMNS} from canonical_records where key = $1 for update"
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx("lock canonical", e))?;
        row.as_ref().map(canonical_from_row).transpose()
    }

    async fn write_canonical(
        &mut self,
        record: &CanonicalRecord,
        existed: bool,
    ) -> Result<(), StoreError> {
        if existed {
            let res = sqlx::query(
                r#"
                update canonical_records
                set name = $2, name_source = $3, price_e8 = $4, market_cap_usd = $5,
                    volume_24h_usd = $6, percent_change_24h = $7, source = $8,
                    created_at = $9, ingested_at = $10
                where key = $1
                "#,
            )
            .bind(&record.key)
            .bind(&record.name)
            .bind(&record.name_source)
            .bind(record.price.units())
            .bind(record.market_cap_usd)
            .bind(record.volume_24h_usd)
            .bind(record.percent_change_24h)
            .bind(&record.source)
            .bind(record.created_at)
            .bind(record.ingested_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx("update canonical", e))?;
            if res.rows_affected() != 1 {
                return Err(StoreError::Conflict {
                    key: record.key.clone(),
                });
            }
            return Ok(());
        }

        let mut sp = sqlx::Connection::begin(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx("insert savepoint", e))?;
        let res = sqlx::query(&format!(
            "insert into canonical_records ({CANONICAL_COLUMNS}) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(&record.key)
        .bind(&record.name)
        .bind(&record.name_source)
        .bind(record.price.units())
        .bind(record.market_cap_usd)
        .bind(record.volume_24h_usd)
        .bind(record.percent_change_24h)
        .bind(&record.source)
        .bind(record.created_at)
        .bind(record.ingested_at)
        .execute(&mut *sp)
        .await;

        match res {
            Ok(_) => sp
                .commit()
                .await
                .map_err(|e| map_sqlx("insert savepoint release", e)),
            Err(e) if sqlstate(&e).as_deref() == Some(UNIQUE_VIOLATION) => {
                sp.rollback()
                    .await
                    .map_err(|e| map_sqlx("insert savepoint rollback", e))?;
                Err(StoreError::Conflict {
                    key: record.key.clone(),
                })
            }
            Err(e) => Err(map_sqlx("insert canonical", e)),
        }
    }

    async fn advance_checkpoint(
        &mut self,
        source: &str,
        last_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into checkpoints (source, last_id, last_timestamp)
            values ($1, $2, $3)
            on conflict (source) do update set
                last_id = case
                    when excluded.last_id is not null and (
                        checkpoints.last_id is null
                        or excluded.last_id collate "C" > checkpoints.last_id collate "C"
                    )
                    then excluded.last_id
                    else checkpoints.last_id
                end,
                last_timestamp = excluded.last_timestamp
            "#,
        )
        .bind(source)
        .bind(last_id)
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx("advance checkpoint", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx("commit cycle", e))
    }
}
