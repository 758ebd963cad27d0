//! PostgreSQL backend. Runtime-checked queries so the workspace builds
//! without a live database.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use adsync_core::{
    BreakdownType, ConnectionMetadata, ConnectionStatus, DailyMetricKey, DailyMetricRecord, DailyTotals,
    DateBucket, DemographicBreakdownRecord, DerivedRatios, Granularity, JobKind, JobStatus,
    JobTask, LedgerStatus, MetricLevel, MetricValues, PlatformConnection, Priority, QueueStats,
    RemoveOutcome, Result, RolloverLedgerEntry, SyncError, SyncJob, SyncProgressState, SyncStage,
    SyncStatus, TimeRange, UpsertOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    advance_progress, ConnectionStore, JobStore, MetricStore, ProgressStore, RolloverCommit,
    RolloverFn,
};

/// Serializes queue claimers across processes.
const CLAIM_LOCK_KEY: i64 = 0x6164_7379_6e63;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: Some(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn db(err: sqlx::Error) -> SyncError {
    SyncError::storage(err)
}

impl PgStore {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self> {
        if config.max_connections == 0 || config.max_connections < config.min_connections {
            return Err(SyncError::validation(
                "max_connections must be >= min_connections and > 0",
            ));
        }
        let mut opts = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));
        if let Some(idle) = config.idle_timeout_secs {
            opts = opts.idle_timeout(Duration::from_secs(idle));
        }
        let pool = opts.connect(database_url).await.map_err(db)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(SyncError::storage)
    }
}

fn parse_col<T>(row: &PgRow, col: &str) -> Result<T>
where
    T: std::str::FromStr<Err = SyncError>,
{
    let raw: String = row.try_get(col).map_err(db)?;
    raw.parse()
}

fn job_from_row(row: &PgRow) -> Result<SyncJob> {
    let task: serde_json::Value = row.try_get("task").map_err(db)?;
    let task: JobTask = serde_json::from_value(task)
        .map_err(|e| SyncError::storage(format!("corrupt job payload: {e}")))?;
    let attempts: i32 = row.try_get("attempts").map_err(db)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(db)?;
    let priority: i16 = row.try_get("priority").map_err(db)?;
    Ok(SyncJob {
        id: row.try_get("id").map_err(db)?,
        brand_id: row.try_get("brand_id").map_err(db)?,
        task,
        priority: Priority::from_rank(priority),
        status: parse_col(row, "status")?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        run_at: row.try_get("run_at").map_err(db)?,
        created_at: row.try_get("created_at").map_err(db)?,
        updated_at: row.try_get("updated_at").map_err(db)?,
        seq: row.try_get("seq").map_err(db)?,
        locked_by: row.try_get("locked_by").map_err(db)?,
        lease_until: row.try_get("lease_until").map_err(db)?,
        cancel_requested: row.try_get("cancel_requested").map_err(db)?,
        last_error: row.try_get("last_error").map_err(db)?,
    })
}

fn metrics_from_row(row: &PgRow) -> Result<(MetricValues, DerivedRatios)> {
    let impressions: i64 = row.try_get("impressions").map_err(db)?;
    let clicks: i64 = row.try_get("clicks").map_err(db)?;
    let reach: i64 = row.try_get("reach").map_err(db)?;
    Ok((
        MetricValues {
            spend: row.try_get("spend").map_err(db)?,
            impressions: impressions.max(0) as u64,
            clicks: clicks.max(0) as u64,
            conversions: row.try_get("conversions").map_err(db)?,
            reach: reach.max(0) as u64,
        },
        DerivedRatios {
            ctr: row.try_get("ctr").map_err(db)?,
            cpc: row.try_get("cpc").map_err(db)?,
            cpm: row.try_get("cpm").map_err(db)?,
        },
    ))
}

fn daily_from_row(row: &PgRow) -> Result<DailyMetricRecord> {
    let (metrics, ratios) = metrics_from_row(row)?;
    Ok(DailyMetricRecord {
        brand_id: row.try_get("brand_id").map_err(db)?,
        platform: row.try_get("platform").map_err(db)?,
        date: row.try_get("date").map_err(db)?,
        ad_id: row.try_get("ad_id").map_err(db)?,
        level: parse_col(row, "level")?,
        account_id: row.try_get("account_id").map_err(db)?,
        campaign_id: row.try_get("campaign_id").map_err(db)?,
        ad_name: row.try_get("ad_name").map_err(db)?,
        metrics,
        ratios,
        updated_at: row.try_get("updated_at").map_err(db)?,
    })
}

fn demographic_from_row(row: &PgRow) -> Result<DemographicBreakdownRecord> {
    let (metrics, ratios) = metrics_from_row(row)?;
    Ok(DemographicBreakdownRecord {
        brand_id: row.try_get("brand_id").map_err(db)?,
        platform: row.try_get("platform").map_err(db)?,
        date_range_start: row.try_get("date_range_start").map_err(db)?,
        date_range_end: row.try_get("date_range_end").map_err(db)?,
        granularity: parse_col(row, "granularity")?,
        breakdown_type: parse_col(row, "breakdown_type")?,
        breakdown_value: row.try_get("breakdown_value").map_err(db)?,
        metrics,
        ratios,
        updated_at: row.try_get("updated_at").map_err(db)?,
    })
}

fn connection_from_row(row: &PgRow) -> Result<PlatformConnection> {
    let metadata: serde_json::Value = row.try_get("metadata").map_err(db)?;
    let metadata: ConnectionMetadata = serde_json::from_value(metadata)
        .map_err(|e| SyncError::storage(format!("corrupt connection metadata: {e}")))?;
    Ok(PlatformConnection {
        id: row.try_get("id").map_err(db)?,
        brand_id: row.try_get("brand_id").map_err(db)?,
        platform: row.try_get("platform").map_err(db)?,
        access_token: row.try_get("access_token").map_err(db)?,
        status: parse_col(row, "status")?,
        sync_status: parse_col(row, "sync_status")?,
        metadata,
        created_at: row.try_get("created_at").map_err(db)?,
    })
}

fn progress_from_row(row: &PgRow) -> Result<SyncProgressState> {
    let completed: i32 = row.try_get("days_completed").map_err(db)?;
    let target: i32 = row.try_get("days_target").map_err(db)?;
    Ok(SyncProgressState {
        connection_id: row.try_get("connection_id").map_err(db)?,
        stage: parse_col(row, "stage")?,
        days_completed: completed.max(0) as u32,
        days_target: target.max(0) as u32,
        percent: row.try_get("percent").map_err(db)?,
        updated_at: row.try_get("updated_at").map_err(db)?,
    })
}

fn upsert_outcome(row: &PgRow) -> Result<UpsertOutcome> {
    let inserted: bool = row.try_get("inserted").map_err(db)?;
    Ok(if inserted {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Updated
    })
}

const UPSERT_DEMOGRAPHIC_SQL: &str = r#"
    INSERT INTO demographic_breakdowns (
        brand_id, platform, date_range_start, date_range_end, granularity,
        breakdown_type, breakdown_value, spend, impressions, clicks,
        conversions, reach, ctr, cpc, cpm, updated_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
    ON CONFLICT (brand_id, platform, date_range_start, date_range_end,
                 granularity, breakdown_type, breakdown_value)
    DO UPDATE SET spend = EXCLUDED.spend,
                  impressions = EXCLUDED.impressions,
                  clicks = EXCLUDED.clicks,
                  conversions = EXCLUDED.conversions,
                  reach = EXCLUDED.reach,
                  ctr = EXCLUDED.ctr,
                  cpc = EXCLUDED.cpc,
                  cpm = EXCLUDED.cpm,
                  updated_at = EXCLUDED.updated_at
    RETURNING (xmax = 0) AS inserted
"#;

async fn upsert_demographic_in<'e, E>(executor: E, r: &DemographicBreakdownRecord) -> Result<PgRow>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(UPSERT_DEMOGRAPHIC_SQL)
        .bind(r.brand_id)
        .bind(&r.platform)
        .bind(r.date_range_start)
        .bind(r.date_range_end)
        .bind(r.granularity.as_str())
        .bind(r.breakdown_type.as_str())
        .bind(&r.breakdown_value)
        .bind(r.metrics.spend)
        .bind(r.metrics.impressions as i64)
        .bind(r.metrics.clicks as i64)
        .bind(r.metrics.conversions)
        .bind(r.metrics.reach as i64)
        .bind(r.ratios.ctr)
        .bind(r.ratios.cpc)
        .bind(r.ratios.cpm)
        .bind(r.updated_at)
        .fetch_one(executor)
        .await
        .map_err(db)
}

#[async_trait]
impl JobStore for PgStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind()))]
    async fn insert_job(&self, job: SyncJob) -> Result<SyncJob> {
        let task = serde_json::to_value(&job.task)
            .map_err(|e| SyncError::validation(format!("unserializable job payload: {e}")))?;
        let row = sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, brand_id, connection_id, kind, task, priority, status,
                attempts, max_attempts, run_at, cancel_requested, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE, $11, $12)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(job.brand_id)
        .bind(job.connection_id())
        .bind(job.kind().as_str())
        .bind(task)
        .bind(job.priority.rank())
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.run_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        job_from_row(&row)
    }

    async fn claim_ready(
        &self,
        max_jobs: usize,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<SyncJob>> {
        if max_jobs == 0 {
            return Ok(Vec::new());
        }
        let lease_until = now
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(5));
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        // Best ready job per free connection; rollover jobs have no connection
        // and are keyed by their own id.
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT DISTINCT ON (COALESCE(j.connection_id, j.id)) j.*
                  FROM sync_jobs j
                 WHERE ((j.status IN ('waiting', 'delayed') AND j.run_at <= $1)
                        OR (j.status = 'active' AND j.lease_until <= $1))
                   AND NOT EXISTS (
                        SELECT 1 FROM sync_jobs a
                         WHERE a.connection_id = j.connection_id
                           AND a.status = 'active'
                           AND (a.lease_until IS NULL OR a.lease_until > $1))
                 ORDER BY COALESCE(j.connection_id, j.id), j.priority DESC, j.seq ASC
            ) ready
            ORDER BY priority DESC, seq ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(max_jobs as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = job_from_row(row)?;
            if job.status == JobStatus::Active {
                job.attempts += 1;
                if job.attempts >= job.max_attempts {
                    sqlx::query(
                        r#"
                        UPDATE sync_jobs
                           SET status = 'failed', attempts = $2, locked_by = NULL,
                               lease_until = NULL, last_error = $3, updated_at = $4
                         WHERE id = $1
                        "#,
                    )
                    .bind(job.id)
                    .bind(job.attempts as i32)
                    .bind("lease expired on final attempt")
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                    continue;
                }
            }
            sqlx::query(
                r#"
                UPDATE sync_jobs
                   SET status = 'active', attempts = $2, locked_by = $3,
                       lease_until = $4, updated_at = $5
                 WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(job.attempts as i32)
            .bind(worker_id)
            .bind(lease_until)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
            job.status = JobStatus::Active;
            job.locked_by = Some(worker_id.to_string());
            job.lease_until = Some(lease_until);
            job.updated_at = now;
            claimed.push(job);
        }
        tx.commit().await.map_err(db)?;
        debug!(worker_id, claimed = claimed.len(), "claimed jobs");
        Ok(claimed)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<SyncJob>> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'completed', attempts = $3, locked_by = NULL,
                   lease_until = NULL, updated_at = $4
             WHERE id = $1 AND status = 'active' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(attempts as i32)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'failed', attempts = $3, last_error = $4,
                   locked_by = NULL, lease_until = NULL, updated_at = $5
             WHERE id = $1 AND status = 'active' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(attempts as i32)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn mark_delayed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'delayed', attempts = $3, run_at = $4, last_error = $5,
                   locked_by = NULL, lease_until = NULL, updated_at = $6
             WHERE id = $1 AND status = 'active' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(attempts as i32)
        .bind(run_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET lease_until = $3
             WHERE id = $1 AND status = 'active' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_until)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_job(&self, job_id: Uuid) -> Result<RemoveOutcome> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let row = sqlx::query("SELECT status FROM sync_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        let Some(row) = row else {
            return Ok(RemoveOutcome::NotFound);
        };
        let status: JobStatus = parse_col(&row, "status")?;
        let outcome = match status {
            JobStatus::Waiting | JobStatus::Delayed => {
                sqlx::query("DELETE FROM sync_jobs WHERE id = $1")
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                RemoveOutcome::Removed
            }
            JobStatus::Active => {
                sqlx::query("UPDATE sync_jobs SET cancel_requested = TRUE WHERE id = $1")
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                RemoveOutcome::CancellationRequested
            }
            other => RemoveOutcome::NotRemovable(other),
        };
        tx.commit().await.map_err(db)?;
        Ok(outcome)
    }

    async fn cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM sync_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        Ok(flag.unwrap_or(false))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM sync_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sync_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        let mut stats = QueueStats::default();
        for row in &rows {
            let n: i64 = row.try_get("n").map_err(db)?;
            let n = n.max(0) as u64;
            match parse_col::<JobStatus>(row, "status")? {
                JobStatus::Waiting => stats.waiting = n,
                JobStatus::Active => stats.active = n,
                JobStatus::Completed => stats.completed = n,
                JobStatus::Failed => stats.failed = n,
                JobStatus::Delayed => stats.delayed = n,
            }
        }
        Ok(stats)
    }

    async fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query("SELECT * FROM sync_jobs WHERE status = $1 ORDER BY seq LIMIT $2")
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn requeue_failed(&self, job_id: Uuid, run_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'waiting', attempts = 0, run_at = $2, updated_at = $2
             WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .bind(run_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn live_jobs(&self, brand_id: Uuid, kind: JobKind) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sync_jobs
             WHERE brand_id = $1 AND kind = $2
               AND status IN ('waiting', 'delayed', 'active')
             ORDER BY seq
            "#,
        )
        .bind(brand_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn pending_count(&self, brand_id: Uuid, kind: JobKind) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sync_jobs
             WHERE brand_id = $1 AND kind = $2
               AND status IN ('waiting', 'delayed', 'active')
            "#,
        )
        .bind(brand_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        Ok(n.max(0) as u64)
    }

    async fn archive_completed(&self, before: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM sync_jobs WHERE status = 'completed' AND updated_at < $1")
                .bind(before)
                .execute(&self.pool)
                .await
                .map_err(db)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ConnectionStore for PgStore {
    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<PlatformConnection>> {
        let row = sqlx::query("SELECT * FROM platform_connections WHERE id = $1")
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(connection_from_row).transpose()
    }

    async fn upsert_connection(&self, c: &PlatformConnection) -> Result<()> {
        let metadata = serde_json::to_value(&c.metadata)
            .map_err(|e| SyncError::validation(format!("unserializable metadata: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO platform_connections (
                id, brand_id, platform, access_token, status, sync_status, metadata, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
               SET brand_id = EXCLUDED.brand_id,
                   platform = EXCLUDED.platform,
                   access_token = EXCLUDED.access_token,
                   status = EXCLUDED.status,
                   sync_status = EXCLUDED.sync_status,
                   metadata = EXCLUDED.metadata
            "#,
        )
        .bind(c.id)
        .bind(c.brand_id)
        .bind(&c.platform)
        .bind(&c.access_token)
        .bind(c.status.as_str())
        .bind(c.sync_status.as_str())
        .bind(metadata)
        .bind(c.created_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn set_connection_state(
        &self,
        connection_id: Uuid,
        status: ConnectionStatus,
        sync_status: SyncStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE platform_connections SET status = $2, sync_status = $3 WHERE id = $1",
        )
        .bind(connection_id)
        .bind(status.as_str())
        .bind(sync_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("connection {connection_id}")));
        }
        Ok(())
    }

    async fn set_sync_status(&self, connection_id: Uuid, sync_status: SyncStatus) -> Result<()> {
        let result = sqlx::query("UPDATE platform_connections SET sync_status = $2 WHERE id = $1")
            .bind(connection_id)
            .bind(sync_status.as_str())
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("connection {connection_id}")));
        }
        Ok(())
    }

    async fn list_active_connections(&self) -> Result<Vec<PlatformConnection>> {
        let rows = sqlx::query(
            "SELECT * FROM platform_connections WHERE status = 'active' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(connection_from_row).collect()
    }
}

#[async_trait]
impl MetricStore for PgStore {
    async fn upsert_daily_metric(&self, r: &DailyMetricRecord) -> Result<UpsertOutcome> {
        let row = sqlx::query(
            r#"
            INSERT INTO daily_metrics (
                brand_id, platform, date, ad_id, level, account_id, campaign_id, ad_name,
                spend, impressions, clicks, conversions, reach, ctr, cpc, cpm, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (brand_id, platform, date, ad_id, level)
            DO UPDATE SET account_id = EXCLUDED.account_id,
                          campaign_id = EXCLUDED.campaign_id,
                          ad_name = EXCLUDED.ad_name,
                          spend = EXCLUDED.spend,
                          impressions = EXCLUDED.impressions,
                          clicks = EXCLUDED.clicks,
                          conversions = EXCLUDED.conversions,
                          reach = EXCLUDED.reach,
                          ctr = EXCLUDED.ctr,
                          cpc = EXCLUDED.cpc,
                          cpm = EXCLUDED.cpm,
                          updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(r.brand_id)
        .bind(&r.platform)
        .bind(r.date)
        .bind(&r.ad_id)
        .bind(r.level.as_str())
        .bind(&r.account_id)
        .bind(&r.campaign_id)
        .bind(&r.ad_name)
        .bind(r.metrics.spend)
        .bind(r.metrics.impressions as i64)
        .bind(r.metrics.clicks as i64)
        .bind(r.metrics.conversions)
        .bind(r.metrics.reach as i64)
        .bind(r.ratios.ctr)
        .bind(r.ratios.cpc)
        .bind(r.ratios.cpm)
        .bind(r.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        upsert_outcome(&row)
    }

    async fn upsert_demographic(&self, record: &DemographicBreakdownRecord) -> Result<UpsertOutcome> {
        let row = upsert_demographic_in(&self.pool, record).await?;
        upsert_outcome(&row)
    }

    async fn get_daily_metric(&self, key: &DailyMetricKey) -> Result<Option<DailyMetricRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM daily_metrics
             WHERE brand_id = $1 AND platform = $2 AND date = $3 AND ad_id = $4 AND level = $5
            "#,
        )
        .bind(key.brand_id)
        .bind(&key.platform)
        .bind(key.date)
        .bind(&key.ad_id)
        .bind(key.level.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(daily_from_row).transpose()
    }

    async fn daily_row_counts(
        &self,
        brand_id: Uuid,
        platform: &str,
        range: TimeRange,
    ) -> Result<BTreeMap<NaiveDate, u64>> {
        let rows = sqlx::query(
            r#"
            SELECT date, COUNT(*) AS n FROM daily_metrics
             WHERE brand_id = $1 AND platform = $2 AND date >= $3 AND date < $4
             GROUP BY date
            "#,
        )
        .bind(brand_id)
        .bind(platform)
        .bind(range.since)
        .bind(range.until)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        let mut out = BTreeMap::new();
        for row in &rows {
            let date: NaiveDate = row.try_get("date").map_err(db)?;
            let n: i64 = row.try_get("n").map_err(db)?;
            out.insert(date, n.max(0) as u64);
        }
        Ok(out)
    }

    async fn daily_totals(
        &self,
        brand_id: Uuid,
        platform: &str,
        range: TimeRange,
        level: MetricLevel,
    ) -> Result<BTreeMap<NaiveDate, DailyTotals>> {
        let rows = sqlx::query(
            r#"
            SELECT date,
                   SUM(spend)::DOUBLE PRECISION AS spend,
                   SUM(impressions)::BIGINT AS impressions,
                   SUM(conversions)::DOUBLE PRECISION AS conversions,
                   COUNT(*) AS n
              FROM daily_metrics
             WHERE brand_id = $1 AND platform = $2 AND level = $3
               AND date >= $4 AND date < $5
             GROUP BY date
            "#,
        )
        .bind(brand_id)
        .bind(platform)
        .bind(level.as_str())
        .bind(range.since)
        .bind(range.until)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        let mut out = BTreeMap::new();
        for row in &rows {
            let date: NaiveDate = row.try_get("date").map_err(db)?;
            let impressions: i64 = row.try_get("impressions").map_err(db)?;
            let n: i64 = row.try_get("n").map_err(db)?;
            out.insert(
                date,
                DailyTotals {
                    spend: row.try_get("spend").map_err(db)?,
                    impressions: impressions.max(0) as u64,
                    conversions: row.try_get("conversions").map_err(db)?,
                    rows: n.max(0) as u64,
                },
            );
        }
        Ok(out)
    }

    async fn demographic_records(
        &self,
        brand_id: Uuid,
        granularity: Granularity,
        range: TimeRange,
    ) -> Result<Vec<DemographicBreakdownRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM demographic_breakdowns
             WHERE brand_id = $1 AND granularity = $2
               AND date_range_start >= $3 AND date_range_start < $4
            "#,
        )
        .bind(brand_id)
        .bind(granularity.as_str())
        .bind(range.since)
        .bind(range.until)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(demographic_from_row).collect()
    }

    async fn demographic_dates(
        &self,
        brand_id: Uuid,
        granularity: Granularity,
        before: NaiveDate,
    ) -> Result<Vec<(BreakdownType, NaiveDate)>> {
        let rows: Vec<(String, NaiveDate)> = sqlx::query_as(
            r#"
            SELECT DISTINCT breakdown_type, date_range_start FROM demographic_breakdowns
             WHERE brand_id = $1 AND granularity = $2 AND date_range_start < $3
             ORDER BY breakdown_type, date_range_start
            "#,
        )
        .bind(brand_id)
        .bind(granularity.as_str())
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter()
            .map(|(breakdown, date)| Ok((breakdown.parse()?, date)))
            .collect()
    }

    async fn ledger_entry(
        &self,
        brand_id: Uuid,
        breakdown_type: BreakdownType,
        bucket_start: NaiveDate,
        granularity: Granularity,
    ) -> Result<Option<RolloverLedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM rollover_ledger
             WHERE brand_id = $1 AND breakdown_type = $2
               AND bucket_start = $3 AND granularity = $4
            "#,
        )
        .bind(brand_id)
        .bind(breakdown_type.as_str())
        .bind(bucket_start)
        .bind(granularity.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let source_rows: i64 = row.try_get("source_rows").map_err(db)?;
        Ok(Some(RolloverLedgerEntry {
            brand_id: row.try_get("brand_id").map_err(db)?,
            breakdown_type: parse_col(&row, "breakdown_type")?,
            bucket_start: row.try_get("bucket_start").map_err(db)?,
            bucket_end: row.try_get("bucket_end").map_err(db)?,
            granularity: parse_col(&row, "granularity")?,
            status: parse_col(&row, "status")?,
            source_rows: source_rows.max(0) as u64,
            completed_at: row.try_get("completed_at").map_err(db)?,
        }))
    }

    #[instrument(skip(self, aggregate), fields(%brand_id, %breakdown_type, bucket = %bucket.start, granularity = %bucket.granularity))]
    async fn commit_rollover(
        &self,
        brand_id: Uuid,
        breakdown_type: BreakdownType,
        bucket: DateBucket,
        prune_source: bool,
        aggregate: &RolloverFn,
    ) -> Result<RolloverCommit> {
        let Some(source) = bucket.granularity.finer() else {
            return Err(SyncError::validation("daily buckets have no rollover source"));
        };
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            r#"
            INSERT INTO rollover_ledger
                (brand_id, breakdown_type, bucket_start, bucket_end, granularity, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            ON CONFLICT (brand_id, breakdown_type, bucket_start, granularity) DO NOTHING
            "#,
        )
        .bind(brand_id)
        .bind(breakdown_type.as_str())
        .bind(bucket.start)
        .bind(bucket.end)
        .bind(bucket.granularity.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let status: String = sqlx::query_scalar(
            r#"
            SELECT status FROM rollover_ledger
             WHERE brand_id = $1 AND breakdown_type = $2
               AND bucket_start = $3 AND granularity = $4
             FOR UPDATE
            "#,
        )
        .bind(brand_id)
        .bind(breakdown_type.as_str())
        .bind(bucket.start)
        .bind(bucket.granularity.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;
        if status.parse::<LedgerStatus>()? == LedgerStatus::Done {
            tx.rollback().await.map_err(db)?;
            return Ok(RolloverCommit::AlreadyDone);
        }

        let rows = sqlx::query(
            r#"
            SELECT * FROM demographic_breakdowns
             WHERE brand_id = $1 AND granularity = $2 AND breakdown_type = $3
               AND date_range_start >= $4 AND date_range_end <= $5
            "#,
        )
        .bind(brand_id)
        .bind(source.as_str())
        .bind(breakdown_type.as_str())
        .bind(bucket.start)
        .bind(bucket.end)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        if rows.is_empty() {
            tx.rollback().await.map_err(db)?;
            return Ok(RolloverCommit::NoSource);
        }
        let source_rows = rows
            .iter()
            .map(demographic_from_row)
            .collect::<Result<Vec<_>>>()?;

        let aggregates = aggregate(&source_rows);
        for agg in &aggregates {
            upsert_demographic_in(&mut *tx, agg).await?;
        }

        let mut pruned = 0;
        if prune_source {
            pruned = sqlx::query(
                r#"
                DELETE FROM demographic_breakdowns
                 WHERE brand_id = $1 AND granularity = $2 AND breakdown_type = $3
                   AND date_range_start >= $4 AND date_range_end <= $5
                "#,
            )
            .bind(brand_id)
            .bind(source.as_str())
            .bind(breakdown_type.as_str())
            .bind(bucket.start)
            .bind(bucket.end)
            .execute(&mut *tx)
            .await
            .map_err(db)?
            .rows_affected();
        }

        sqlx::query(
            r#"
            UPDATE rollover_ledger
               SET status = 'done', source_rows = $5, completed_at = NOW()
             WHERE brand_id = $1 AND breakdown_type = $2
               AND bucket_start = $3 AND granularity = $4
            "#,
        )
        .bind(brand_id)
        .bind(breakdown_type.as_str())
        .bind(bucket.start)
        .bind(bucket.granularity.as_str())
        .bind(source_rows.len() as i64)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(RolloverCommit::Applied {
            source_rows: source_rows.len() as u64,
            aggregates: aggregates.len() as u64,
            pruned,
        })
    }

    async fn mark_days_synced(&self, brand_id: Uuid, platform: &str, range: TimeRange) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO synced_days (brand_id, platform, date, synced_at)
            SELECT $1, $2, day::date, NOW()
              FROM generate_series($3::date, $4::date - 1, INTERVAL '1 day') AS day
            ON CONFLICT (brand_id, platform, date) DO UPDATE SET synced_at = EXCLUDED.synced_at
            "#,
        )
        .bind(brand_id)
        .bind(platform)
        .bind(range.since)
        .bind(range.until)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn synced_days(
        &self,
        brand_id: Uuid,
        platform: &str,
        range: TimeRange,
    ) -> Result<BTreeSet<NaiveDate>> {
        let days: Vec<NaiveDate> = sqlx::query_scalar(
            r#"
            SELECT date FROM synced_days
             WHERE brand_id = $1 AND platform = $2 AND date >= $3 AND date < $4
            "#,
        )
        .bind(brand_id)
        .bind(platform)
        .bind(range.since)
        .bind(range.until)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(days.into_iter().collect())
    }

    async fn purge_brand(&self, brand_id: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let mut removed = 0;
        for table in ["daily_metrics", "demographic_breakdowns", "rollover_ledger", "synced_days"] {
            removed += sqlx::query(&format!("DELETE FROM {table} WHERE brand_id = $1"))
                .bind(brand_id)
                .execute(&mut *tx)
                .await
                .map_err(db)?
                .rows_affected();
        }
        tx.commit().await.map_err(db)?;
        Ok(removed)
    }
}

#[async_trait]
impl ProgressStore for PgStore {
    async fn get_progress(&self, connection_id: Uuid) -> Result<Option<SyncProgressState>> {
        let row = sqlx::query("SELECT * FROM sync_progress WHERE connection_id = $1")
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(progress_from_row).transpose()
    }

    async fn reset_progress(
        &self,
        connection_id: Uuid,
        stage: SyncStage,
        days_target: u32,
    ) -> Result<SyncProgressState> {
        let state = SyncProgressState {
            connection_id,
            stage,
            days_completed: 0,
            days_target,
            percent: SyncProgressState::percent_of(0, days_target),
            updated_at: Utc::now(),
        };
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("DELETE FROM sync_progress_chunks WHERE connection_id = $1")
            .bind(connection_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        write_progress(&mut *tx, &state).await?;
        tx.commit().await.map_err(db)?;
        Ok(state)
    }

    async fn record_progress(
        &self,
        connection_id: Uuid,
        stage: SyncStage,
        chunk: Option<TimeRange>,
    ) -> Result<SyncProgressState> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let row = sqlx::query("SELECT * FROM sync_progress WHERE connection_id = $1 FOR UPDATE")
            .bind(connection_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        let mut days = 0;
        if let Some(range) = chunk {
            let inserted = sqlx::query(
                r#"
                INSERT INTO sync_progress_chunks (connection_id, since, until)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(connection_id)
            .bind(range.since)
            .bind(range.until)
            .execute(&mut *tx)
            .await
            .map_err(db)?
            .rows_affected();
            if inserted > 0 {
                days = range.days();
            }
        }
        let current = row.as_ref().map(progress_from_row).transpose()?;
        let next = advance_progress(current.as_ref(), connection_id, stage, days, Utc::now());
        write_progress(&mut *tx, &next).await?;
        tx.commit().await.map_err(db)?;
        Ok(next)
    }
}

async fn write_progress<'e, E>(executor: E, state: &SyncProgressState) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO sync_progress (connection_id, stage, days_completed, days_target, percent, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (connection_id) DO UPDATE
           SET stage = EXCLUDED.stage,
               days_completed = EXCLUDED.days_completed,
               days_target = EXCLUDED.days_target,
               percent = EXCLUDED.percent,
               updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(state.connection_id)
    .bind(state.stage.as_str())
    .bind(state.days_completed as i32)
    .bind(state.days_target as i32)
    .bind(state.percent)
    .bind(state.updated_at)
    .execute(executor)
    .await
    .map_err(db)?;
    Ok(())
}
