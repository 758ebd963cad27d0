//! Typed job queue over a durable [`JobStore`].

use std::sync::Arc;
use std::time::Duration;

use adsync_core::{
    JobKind, JobSpec, JobStatus, QueueStats, RemoveOutcome, Result, SyncError, SyncJob,
};
use adsync_storage::JobStore;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    default_max_attempts: u32,
    lease: Duration,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn lease_check(job: &SyncJob, held: bool, op: &str) -> bool {
    if !held {
        warn!(job_id = %job.id, op, "lease lost; leaving the job to its current owner");
    }
    held
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, default_max_attempts: u32, lease: Duration) -> Self {
        Self {
            store,
            default_max_attempts: default_max_attempts.max(1),
            lease,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Validate the job request and persist it as a `waiting` (or `delayed`) job.
    pub async fn enqueue(&self, spec: &JobSpec) -> Result<Uuid> {
        let (brand_id, task) = spec.validate()?;
        let mut job = SyncJob::new(
            brand_id,
            task,
            spec.priority.unwrap_or_default(),
            spec.max_attempts.unwrap_or(self.default_max_attempts),
        );
        if let Some(delay) = spec.delay_secs.filter(|d| *d > 0) {
            job.status = JobStatus::Delayed;
            job.run_at = job.created_at + chrono::Duration::seconds(delay as i64);
        }
        let job = self.store.insert_job(job).await?;
        debug!(
            job_id = %job.id,
            kind = %job.kind(),
            priority = %job.priority,
            seq = job.seq,
            "enqueued job"
        );
        Ok(job.id)
    }

    /// Claim up to `max_jobs` ready jobs, at most one per connection.
    pub async fn dequeue(&self, max_jobs: usize, worker_id: &str) -> Result<Vec<SyncJob>> {
        self.store
            .claim_ready(max_jobs, worker_id, Utc::now(), self.lease)
            .await
    }

    /// Mark a finished execution `completed`. The lifecycle calls return
    /// `false` when the claim in `job` no longer holds the lease.
    pub async fn ack(&self, job: &SyncJob) -> Result<bool> {
        let Some(owner) = job.locked_by.as_deref() else {
            return Ok(false);
        };
        let held = self
            .store
            .mark_completed(job.id, owner, job.attempts + 1, Utc::now())
            .await?;
        Ok(lease_check(job, held, "ack"))
    }

    /// Dead-letter the job after its final execution.
    pub async fn fail(&self, job: &SyncJob, error: &SyncError) -> Result<bool> {
        let Some(owner) = job.locked_by.as_deref() else {
            return Ok(false);
        };
        let held = self
            .store
            .mark_failed(job.id, owner, job.attempts + 1, &error.to_string(), Utc::now())
            .await?;
        if held {
            warn!(job_id = %job.id, kind = %job.kind(), %error, "job failed permanently");
        }
        Ok(lease_check(job, held, "fail"))
    }

    /// Schedule another execution after `delay`.
    pub async fn retry(&self, job: &SyncJob, delay: Duration, error: &SyncError) -> Result<bool> {
        let Some(owner) = job.locked_by.as_deref() else {
            return Ok(false);
        };
        let now = Utc::now();
        let held = self
            .store
            .mark_delayed(
                job.id,
                owner,
                job.attempts + 1,
                now + to_chrono(delay),
                &error.to_string(),
                now,
            )
            .await?;
        Ok(lease_check(job, held, "retry"))
    }

    pub async fn extend_lease(&self, job: &SyncJob, worker_id: &str) -> Result<bool> {
        self.store
            .extend_lease(job.id, worker_id, Utc::now() + to_chrono(self.lease))
            .await
    }

    pub async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        self.store.cancel_requested(job_id).await
    }

    /// Drop a job whose cancellation the worker honored.
    pub async fn finish_cancelled(&self, job: &SyncJob) -> Result<()> {
        info!(job_id = %job.id, "job cancelled at page boundary");
        self.store.delete_job(job.id).await
    }

    pub async fn remove(&self, job_id: Uuid) -> Result<RemoveOutcome> {
        self.store.remove_job(job_id).await
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<SyncJob>> {
        self.store.get_job(job_id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.queue_stats().await
    }

    pub async fn list_failed(&self, limit: usize) -> Result<Vec<SyncJob>> {
        self.store.list_jobs(JobStatus::Failed, limit).await
    }

    pub async fn requeue_failed(&self, job_id: Uuid) -> Result<bool> {
        let requeued = self.store.requeue_failed(job_id, Utc::now()).await?;
        if requeued {
            info!(%job_id, "failed job requeued");
        }
        Ok(requeued)
    }

    pub async fn live_jobs(&self, brand_id: Uuid, kind: JobKind) -> Result<Vec<SyncJob>> {
        self.store.live_jobs(brand_id, kind).await
    }

    pub async fn pending_count(&self, brand_id: Uuid, kind: JobKind) -> Result<u64> {
        self.store.pending_count(brand_id, kind).await
    }

    /// Delete completed jobs older than `older_than`.
    pub async fn archive_completed(&self, older_than: Duration) -> Result<u64> {
        let archived = self
            .store
            .archive_completed(Utc::now() - to_chrono(older_than))
            .await?;
        if archived > 0 {
            info!(archived, "archived completed jobs");
        }
        Ok(archived)
    }
}
