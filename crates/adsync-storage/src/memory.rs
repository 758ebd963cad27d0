//! In-process backend for tests and dry runs. Every operation runs under a
//! single lock, which gives the same atomicity the PostgreSQL backend gets
//! from transactions.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use adsync_core::{
    BreakdownType, ConnectionStatus, DailyMetricKey, DailyMetricRecord, DailyTotals, DateBucket,
    DemographicBreakdownRecord, DemographicKey, Granularity, JobKind, JobStatus, LedgerStatus,
    MetricLevel, PlatformConnection, QueueStats, RemoveOutcome, Result, RolloverLedgerEntry,
    SyncError, SyncJob, SyncProgressState, SyncStage, SyncStatus, TimeRange, UpsertOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    advance_progress, ConnectionStore, JobStore, MetricStore, ProgressStore, RolloverCommit,
    RolloverFn,
};

#[derive(Debug, Default)]
struct State {
    next_seq: i64,
    jobs: HashMap<Uuid, SyncJob>,
    connections: HashMap<Uuid, PlatformConnection>,
    daily_metrics: BTreeMap<DailyMetricKey, DailyMetricRecord>,
    demographics: BTreeMap<DemographicKey, DemographicBreakdownRecord>,
    ledger: BTreeMap<(Uuid, BreakdownType, NaiveDate, Granularity), RolloverLedgerEntry>,
    progress: HashMap<Uuid, SyncProgressState>,
    progress_chunks: HashMap<Uuid, BTreeSet<TimeRange>>,
    synced_days: BTreeSet<(Uuid, String, NaiveDate)>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn daily_metric_count(&self) -> usize {
        self.state.lock().await.daily_metrics.len()
    }

    pub async fn demographic_count(&self, granularity: Granularity) -> usize {
        self.state
            .lock()
            .await
            .demographics
            .values()
            .filter(|r| r.granularity == granularity)
            .count()
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(5))
}

fn held_by(job: &SyncJob, worker_id: &str) -> bool {
    job.status == JobStatus::Active && job.locked_by.as_deref() == Some(worker_id)
}

fn job_mut<'a>(state: &'a mut State, job_id: Uuid) -> Result<&'a mut SyncJob> {
    state
        .jobs
        .get_mut(&job_id)
        .ok_or_else(|| SyncError::NotFound(format!("job {job_id}")))
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, mut job: SyncJob) -> Result<SyncJob> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(SyncError::validation(format!("job {} already exists", job.id)));
        }
        state.next_seq += 1;
        job.seq = state.next_seq;
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_ready(
        &self,
        max_jobs: usize,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<SyncJob>> {
        let mut state = self.state.lock().await;

        let mut busy: HashSet<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.holds_connection(now))
            .filter_map(SyncJob::connection_id)
            .collect();

        let mut candidates: Vec<(i16, i64, Uuid)> = state
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .map(|j| (j.priority.rank(), j.seq, j.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut claimed = Vec::new();
        for (_, _, id) in candidates {
            if claimed.len() >= max_jobs {
                break;
            }
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if let Some(conn) = job.connection_id() {
                if busy.contains(&conn) {
                    continue;
                }
            }
            if job.status == JobStatus::Active {
                job.attempts += 1;
                if job.attempts >= job.max_attempts {
                    job.status = JobStatus::Failed;
                    job.locked_by = None;
                    job.lease_until = None;
                    job.last_error = Some("lease expired on final attempt".to_string());
                    job.updated_at = now;
                    continue;
                }
            }
            if let Some(conn) = job.connection_id() {
                busy.insert(conn);
            }
            job.status = JobStatus::Active;
            job.locked_by = Some(worker_id.to_string());
            job.lease_until = Some(lease_deadline(now, lease));
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<SyncJob>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let job = job_mut(&mut state, job_id)?;
        if !held_by(job, worker_id) {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.attempts = attempts;
        job.locked_by = None;
        job.lease_until = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let job = job_mut(&mut state, job_id)?;
        if !held_by(job, worker_id) {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.attempts = attempts;
        job.last_error = Some(error.to_string());
        job.locked_by = None;
        job.lease_until = None;
        job.updated_at = now;
        Ok(true)
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
        let mut state = self.state.lock().await;
        let job = job_mut(&mut state, job_id)?;
        if !held_by(job, worker_id) {
            return Ok(false);
        }
        job.status = JobStatus::Delayed;
        job.attempts = attempts;
        job.run_at = run_at;
        job.last_error = Some(error.to_string());
        job.locked_by = None;
        job.lease_until = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let job = job_mut(&mut state, job_id)?;
        if !held_by(job, worker_id) {
            return Ok(false);
        }
        job.lease_until = Some(lease_until);
        Ok(true)
    }

    async fn remove_job(&self, job_id: Uuid) -> Result<RemoveOutcome> {
        let mut state = self.state.lock().await;
        let Some(status) = state.jobs.get(&job_id).map(|j| j.status) else {
            return Ok(RemoveOutcome::NotFound);
        };
        match status {
            JobStatus::Waiting | JobStatus::Delayed => {
                state.jobs.remove(&job_id);
                Ok(RemoveOutcome::Removed)
            }
            JobStatus::Active => {
                job_mut(&mut state, job_id)?.cancel_requested = true;
                Ok(RemoveOutcome::CancellationRequested)
            }
            status => Ok(RemoveOutcome::NotRemovable(status)),
        }
    }

    async fn cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).is_some_and(|j| j.cancel_requested))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.state.lock().await.jobs.remove(&job_id);
        Ok(())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Delayed => stats.delayed += 1,
            }
        }
        Ok(stats)
    }

    async fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<SyncJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<SyncJob> = state
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn requeue_failed(&self, job_id: Uuid, run_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Failed {
            return Ok(false);
        }
        job.status = JobStatus::Waiting;
        job.attempts = 0;
        job.run_at = run_at;
        job.updated_at = run_at;
        Ok(true)
    }

    async fn live_jobs(&self, brand_id: Uuid, kind: JobKind) -> Result<Vec<SyncJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<SyncJob> = state
            .jobs
            .values()
            .filter(|j| j.brand_id == brand_id && j.kind() == kind)
            .filter(|j| j.status.is_pending() || j.status == JobStatus::Active)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        Ok(jobs)
    }

    async fn pending_count(&self, brand_id: Uuid, kind: JobKind) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.brand_id == brand_id && j.kind() == kind)
            .filter(|j| j.status.is_pending() || j.status == JobStatus::Active)
            .count() as u64)
    }

    async fn archive_completed(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before_len = state.jobs.len();
        state
            .jobs
            .retain(|_, j| !(j.status == JobStatus::Completed && j.updated_at < before));
        Ok((before_len - state.jobs.len()) as u64)
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<PlatformConnection>> {
        Ok(self.state.lock().await.connections.get(&connection_id).cloned())
    }

    async fn upsert_connection(&self, connection: &PlatformConnection) -> Result<()> {
        self.state
            .lock()
            .await
            .connections
            .insert(connection.id, connection.clone());
        Ok(())
    }

    async fn set_connection_state(
        &self,
        connection_id: Uuid,
        status: ConnectionStatus,
        sync_status: SyncStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let conn = state
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| SyncError::NotFound(format!("connection {connection_id}")))?;
        conn.status = status;
        conn.sync_status = sync_status;
        Ok(())
    }

    async fn set_sync_status(&self, connection_id: Uuid, sync_status: SyncStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let conn = state
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| SyncError::NotFound(format!("connection {connection_id}")))?;
        conn.sync_status = sync_status;
        Ok(())
    }

    async fn list_active_connections(&self) -> Result<Vec<PlatformConnection>> {
        let state = self.state.lock().await;
        let mut out: Vec<PlatformConnection> = state
            .connections
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn upsert_daily_metric(&self, record: &DailyMetricRecord) -> Result<UpsertOutcome> {
        let mut state = self.state.lock().await;
        Ok(match state.daily_metrics.insert(record.key(), record.clone()) {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn upsert_demographic(&self, record: &DemographicBreakdownRecord) -> Result<UpsertOutcome> {
        let mut state = self.state.lock().await;
        Ok(match state.demographics.insert(record.key(), record.clone()) {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn get_daily_metric(&self, key: &DailyMetricKey) -> Result<Option<DailyMetricRecord>> {
        Ok(self.state.lock().await.daily_metrics.get(key).cloned())
    }

    async fn daily_row_counts(
        &self,
        brand_id: Uuid,
        platform: &str,
        range: TimeRange,
    ) -> Result<BTreeMap<NaiveDate, u64>> {
        let state = self.state.lock().await;
        let mut out = BTreeMap::new();
        for rec in state.daily_metrics.values() {
            if rec.brand_id == brand_id && rec.platform == platform && range.contains(rec.date) {
                *out.entry(rec.date).or_default() += 1;
            }
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
        let state = self.state.lock().await;
        let mut out: BTreeMap<NaiveDate, DailyTotals> = BTreeMap::new();
        for rec in state.daily_metrics.values() {
            if rec.brand_id != brand_id
                || rec.platform != platform
                || rec.level != level
                || !range.contains(rec.date)
            {
                continue;
            }
            let totals = out.entry(rec.date).or_default();
            totals.spend += rec.metrics.spend;
            totals.impressions += rec.metrics.impressions;
            totals.conversions += rec.metrics.conversions;
            totals.rows += 1;
        }
        Ok(out)
    }

    async fn demographic_records(
        &self,
        brand_id: Uuid,
        granularity: Granularity,
        range: TimeRange,
    ) -> Result<Vec<DemographicBreakdownRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .demographics
            .values()
            .filter(|r| {
                r.brand_id == brand_id
                    && r.granularity == granularity
                    && range.contains(r.date_range_start)
            })
            .cloned()
            .collect())
    }

    async fn demographic_dates(
        &self,
        brand_id: Uuid,
        granularity: Granularity,
        before: NaiveDate,
    ) -> Result<Vec<(BreakdownType, NaiveDate)>> {
        let state = self.state.lock().await;
        let dates: BTreeSet<(BreakdownType, NaiveDate)> = state
            .demographics
            .values()
            .filter(|r| {
                r.brand_id == brand_id
                    && r.granularity == granularity
                    && r.date_range_start < before
            })
            .map(|r| (r.breakdown_type, r.date_range_start))
            .collect();
        Ok(dates.into_iter().collect())
    }

    async fn ledger_entry(
        &self,
        brand_id: Uuid,
        breakdown_type: BreakdownType,
        bucket_start: NaiveDate,
        granularity: Granularity,
    ) -> Result<Option<RolloverLedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .get(&(brand_id, breakdown_type, bucket_start, granularity))
            .cloned())
    }

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
        let mut state = self.state.lock().await;
        let ledger_key = (brand_id, breakdown_type, bucket.start, bucket.granularity);
        if state
            .ledger
            .get(&ledger_key)
            .is_some_and(|e| e.status == LedgerStatus::Done)
        {
            return Ok(RolloverCommit::AlreadyDone);
        }

        let source_keys: Vec<DemographicKey> = state
            .demographics
            .iter()
            .filter(|(_, r)| {
                r.brand_id == brand_id
                    && r.granularity == source
                    && r.breakdown_type == breakdown_type
                    && r.date_range_start >= bucket.start
                    && r.date_range_end <= bucket.end
            })
            .map(|(k, _)| k.clone())
            .collect();
        if source_keys.is_empty() {
            return Ok(RolloverCommit::NoSource);
        }
        let rows: Vec<DemographicBreakdownRecord> = source_keys
            .iter()
            .filter_map(|k| state.demographics.get(k).cloned())
            .collect();

        let aggregates = aggregate(&rows);
        for agg in &aggregates {
            state.demographics.insert(agg.key(), agg.clone());
        }
        let mut pruned = 0u64;
        if prune_source {
            for key in &source_keys {
                if state.demographics.remove(key).is_some() {
                    pruned += 1;
                }
            }
        }
        state.ledger.insert(
            ledger_key,
            RolloverLedgerEntry {
                brand_id,
                breakdown_type,
                bucket_start: bucket.start,
                bucket_end: bucket.end,
                granularity: bucket.granularity,
                status: LedgerStatus::Done,
                source_rows: rows.len() as u64,
                completed_at: Some(Utc::now()),
            },
        );
        Ok(RolloverCommit::Applied {
            source_rows: rows.len() as u64,
            aggregates: aggregates.len() as u64,
            pruned,
        })
    }

    async fn mark_days_synced(&self, brand_id: Uuid, platform: &str, range: TimeRange) -> Result<()> {
        let mut state = self.state.lock().await;
        for day in range.iter_days() {
            state.synced_days.insert((brand_id, platform.to_string(), day));
        }
        Ok(())
    }

    async fn synced_days(
        &self,
        brand_id: Uuid,
        platform: &str,
        range: TimeRange,
    ) -> Result<BTreeSet<NaiveDate>> {
        let state = self.state.lock().await;
        Ok(state
            .synced_days
            .iter()
            .filter(|(b, p, day)| *b == brand_id && p == platform && range.contains(*day))
            .map(|(_, _, day)| *day)
            .collect())
    }

    async fn purge_brand(&self, brand_id: Uuid) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.synced_days.retain(|(b, _, _)| *b != brand_id);
        let before = state.daily_metrics.len() + state.demographics.len() + state.ledger.len();
        state.daily_metrics.retain(|k, _| k.brand_id != brand_id);
        state.demographics.retain(|k, _| k.brand_id != brand_id);
        state.ledger.retain(|k, _| k.0 != brand_id);
        let after = state.daily_metrics.len() + state.demographics.len() + state.ledger.len();
        Ok((before - after) as u64)
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn get_progress(&self, connection_id: Uuid) -> Result<Option<SyncProgressState>> {
        Ok(self.state.lock().await.progress.get(&connection_id).cloned())
    }

    async fn reset_progress(
        &self,
        connection_id: Uuid,
        stage: SyncStage,
        days_target: u32,
    ) -> Result<SyncProgressState> {
        let progress = SyncProgressState {
            connection_id,
            stage,
            days_completed: 0,
            days_target,
            percent: SyncProgressState::percent_of(0, days_target),
            updated_at: Utc::now(),
        };
        let mut state = self.state.lock().await;
        state.progress.insert(connection_id, progress.clone());
        state.progress_chunks.remove(&connection_id);
        Ok(progress)
    }

    async fn record_progress(
        &self,
        connection_id: Uuid,
        stage: SyncStage,
        chunk: Option<TimeRange>,
    ) -> Result<SyncProgressState> {
        let mut state = self.state.lock().await;
        let days = match chunk {
            Some(range) if state.progress_chunks.entry(connection_id).or_default().insert(range) => {
                range.days()
            }
            _ => 0,
        };
        let next = advance_progress(
            state.progress.get(&connection_id),
            connection_id,
            stage,
            days,
            Utc::now(),
        );
        state.progress.insert(connection_id, next.clone());
        Ok(next)
    }
}
