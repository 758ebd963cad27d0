//! Durable stores for sync jobs, connections, metric rows, rollover ledger and
//! progress, plus the HTTP fetch utilities used against the upstream API.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use adsync_core::{
    BreakdownType, ConnectionStatus, DailyMetricKey, DailyMetricRecord, DailyTotals, DateBucket,
    DemographicBreakdownRecord, Granularity, JobKind, JobStatus, MetricLevel, PlatformConnection,
    QueueStats, RemoveOutcome, Result, RolloverLedgerEntry, SyncJob, SyncProgressState, SyncStage,
    SyncStatus, TimeRange, UpsertOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    AccountRateLimit, AccountRateLimiter, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::{PgStore, PoolConfig};

pub const CRATE_NAME: &str = "adsync-storage";

/// Durable job table backing the sync queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job and return it with its store-assigned `seq`.
    async fn insert_job(&self, job: SyncJob) -> Result<SyncJob>;

    /// Atomically claim up to `max_jobs` ready jobs for `worker_id`.
    ///
    /// Ordering is priority then enqueue order. A connection that already has
    /// an active job (or gets one earlier in this batch) is skipped. Active
    /// jobs whose lease expired are redelivered with `attempts` bumped, or
    /// failed when that exhausts their budget.
    async fn claim_ready(
        &self,
        max_jobs: usize,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<SyncJob>>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<SyncJob>>;

    /// The `mark_*` transitions apply only while `worker_id` still holds the
    /// job's lease; `false` means another worker reclaimed it.
    async fn mark_completed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn mark_delayed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Push the lease forward; false when the job is no longer held by `worker_id`.
    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete a pending job, or flag an active one for cooperative cancellation.
    async fn remove_job(&self, job_id: Uuid) -> Result<RemoveOutcome>;

    async fn cancel_requested(&self, job_id: Uuid) -> Result<bool>;

    async fn delete_job(&self, job_id: Uuid) -> Result<()>;

    async fn queue_stats(&self) -> Result<QueueStats>;

    async fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<SyncJob>>;

    /// Move a failed job back to `waiting` with a fresh attempt budget.
    async fn requeue_failed(&self, job_id: Uuid, run_at: DateTime<Utc>) -> Result<bool>;

    /// Jobs of `kind` for `brand_id` that are waiting, delayed or active.
    /// Waiting, delayed and active jobs of `kind` for `brand_id`, in enqueue order.
    async fn live_jobs(&self, brand_id: Uuid, kind: JobKind) -> Result<Vec<SyncJob>>;

    async fn pending_count(&self, brand_id: Uuid, kind: JobKind) -> Result<u64>;

    /// Drop completed jobs last touched before `before`.
    async fn archive_completed(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<PlatformConnection>>;

    /// Written by the external auth flow; exposed here for seeding and tests.
    async fn upsert_connection(&self, connection: &PlatformConnection) -> Result<()>;

    async fn set_connection_state(
        &self,
        connection_id: Uuid,
        status: ConnectionStatus,
        sync_status: SyncStatus,
    ) -> Result<()>;

    async fn set_sync_status(&self, connection_id: Uuid, sync_status: SyncStatus) -> Result<()>;

    async fn list_active_connections(&self) -> Result<Vec<PlatformConnection>>;
}

/// Aggregation callback run inside the rollover transaction.
pub type RolloverFn =
    dyn Fn(&[DemographicBreakdownRecord]) -> Vec<DemographicBreakdownRecord> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverCommit {
    Applied {
        source_rows: u64,
        aggregates: u64,
        pruned: u64,
    },
    AlreadyDone,
    NoSource,
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Insert-or-overwrite by natural key, atomically per row.
    async fn upsert_daily_metric(&self, record: &DailyMetricRecord) -> Result<UpsertOutcome>;

    async fn upsert_demographic(&self, record: &DemographicBreakdownRecord) -> Result<UpsertOutcome>;

    async fn get_daily_metric(&self, key: &DailyMetricKey) -> Result<Option<DailyMetricRecord>>;

    /// Stored metric rows per day, across all levels.
    async fn daily_row_counts(
        &self,
        brand_id: Uuid,
        platform: &str,
        range: TimeRange,
    ) -> Result<BTreeMap<NaiveDate, u64>>;

    /// Per-day totals of exactly one level.
    async fn daily_totals(
        &self,
        brand_id: Uuid,
        platform: &str,
        range: TimeRange,
        level: MetricLevel,
    ) -> Result<BTreeMap<NaiveDate, DailyTotals>>;

    /// Rows of `granularity` whose range starts inside `range`.
    async fn demographic_records(
        &self,
        brand_id: Uuid,
        granularity: Granularity,
        range: TimeRange,
    ) -> Result<Vec<DemographicBreakdownRecord>>;

    /// Distinct `(breakdown type, range start)` pairs of `granularity` rows
    /// strictly before `before`.
    async fn demographic_dates(
        &self,
        brand_id: Uuid,
        granularity: Granularity,
        before: NaiveDate,
    ) -> Result<Vec<(BreakdownType, NaiveDate)>>;

    async fn ledger_entry(
        &self,
        brand_id: Uuid,
        breakdown_type: BreakdownType,
        bucket_start: NaiveDate,
        granularity: Granularity,
    ) -> Result<Option<RolloverLedgerEntry>>;

    /// In one atomic step: skip if the ledger says `done`, otherwise read the
    /// finer-grained `breakdown_type` rows inside `bucket`, write
    /// `aggregate`'s output, mark the ledger `done` and optionally delete the
    /// source rows.
    async fn commit_rollover(
        &self,
        brand_id: Uuid,
        breakdown_type: BreakdownType,
        bucket: DateBucket,
        prune_source: bool,
        aggregate: &RolloverFn,
    ) -> Result<RolloverCommit>;

    /// Remember that every day of `range` was fetched in full, including days
    /// upstream reported no activity for.
    async fn mark_days_synced(&self, brand_id: Uuid, platform: &str, range: TimeRange) -> Result<()>;

    async fn synced_days(
        &self,
        brand_id: Uuid,
        platform: &str,
        range: TimeRange,
    ) -> Result<BTreeSet<NaiveDate>>;

    /// Explicit brand-level purge of metric, demographic and ledger rows.
    async fn purge_brand(&self, brand_id: Uuid) -> Result<u64>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get_progress(&self, connection_id: Uuid) -> Result<Option<SyncProgressState>>;

    /// Start a new plan: zero completed days against `days_target`, and
    /// forget the chunks counted by the previous plan.
    async fn reset_progress(
        &self,
        connection_id: Uuid,
        stage: SyncStage,
        days_target: u32,
    ) -> Result<SyncProgressState>;

    /// Record a finished job. `chunk` adds its days once per distinct range
    /// since the last reset; a repeated completion only refreshes the stage.
    /// Never lowers the stored percentage.
    async fn record_progress(
        &self,
        connection_id: Uuid,
        stage: SyncStage,
        chunk: Option<TimeRange>,
    ) -> Result<SyncProgressState>;
}

/// Shared progress arithmetic so both backends behave the same.
pub fn advance_progress(
    current: Option<&SyncProgressState>,
    connection_id: Uuid,
    stage: SyncStage,
    days: u32,
    now: DateTime<Utc>,
) -> SyncProgressState {
    let (completed, target) = match current {
        Some(state) => (state.days_completed.saturating_add(days), state.days_target),
        None => (days, days),
    };
    let completed = completed.min(target);
    let stage = if completed >= target {
        SyncStage::Complete
    } else {
        stage
    };
    let percent = SyncProgressState::percent_of(completed, target)
        .max(current.map_or(0.0, |state| state.percent));
    SyncProgressState {
        connection_id,
        stage,
        days_completed: completed,
        days_target: target,
        percent,
        updated_at: now,
    }
}

/// Trait-object handles over one backend.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub connections: Arc<dyn ConnectionStore>,
    pub metrics: Arc<dyn MetricStore>,
    pub progress: Arc<dyn ProgressStore>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: JobStore + ConnectionStore + MetricStore + ProgressStore + 'static,
    {
        Self {
            jobs: backend.clone(),
            connections: backend.clone(),
            metrics: backend.clone(),
            progress: backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_never_regresses_and_completes() {
        let conn = Uuid::new_v4();
        let now = Utc::now();
        let start = SyncProgressState {
            connection_id: conn,
            stage: SyncStage::Queued,
            days_completed: 0,
            days_target: 60,
            percent: 0.0,
            updated_at: now,
        };
        let half = advance_progress(Some(&start), conn, SyncStage::HistoricalMetrics, 30, now);
        assert_eq!(half.percent, 50.0);
        assert_eq!(half.stage, SyncStage::HistoricalMetrics);

        let done = advance_progress(Some(&half), conn, SyncStage::HistoricalMetrics, 45, now);
        assert_eq!(done.days_completed, 60);
        assert_eq!(done.percent, 100.0);
        assert_eq!(done.stage, SyncStage::Complete);
    }

    #[test]
    fn progress_without_plan_is_complete_after_one_job() {
        let conn = Uuid::new_v4();
        let state = advance_progress(None, conn, SyncStage::DailyRefresh, 3, Utc::now());
        assert_eq!(state.days_target, 3);
        assert_eq!(state.stage, SyncStage::Complete);
    }
}
