//! Job execution: claim, fetch every page, upsert, then ack, retry or fail.

use std::sync::Arc;
use std::time::Duration;

use adsync_adapters::{
    parse_demographic_row, parse_metric_row, AdsApi, InsightsPage, InsightsRequest,
};
use adsync_core::{
    BreakdownType, ChunkSize, ConnectionStatus, DailyMetricRecord, DemographicBreakdownRecord,
    DerivedRatios, ErrorClass, Granularity, JobKind, JobTask, MetricLevel, PlatformConnection,
    Result, SyncError, SyncJob, SyncStage, SyncStatus, TimeRange,
};
use adsync_storage::{BackoffPolicy, ConnectionStore, MetricStore, ProgressStore, Stores};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backfill::continue_stream;
use crate::config::{SyncSettings, WorkerSettings};
use crate::notify::{DataChangeNotifier, DataChanged};
use crate::queue::JobQueue;
use crate::rollover::RolloverManager;
use crate::upsert::{MetricRecord, UpsertLayer};

/// Counters for one `process_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Jobs another worker reclaimed before this one could settle them.
    pub lease_lost: usize,
    pub rows_written: u64,
    pub rows_skipped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RowCounts {
    written: u64,
    skipped: u64,
}

enum Execution {
    Completed(RowCounts),
    Cancelled,
    LeaseLost,
}

enum Settlement {
    Retried,
    Failed,
    LeaseLost,
}

/// What one request feeds into the upsert layer.
#[derive(Debug, Clone, Copy)]
enum RowShape {
    Metric(MetricLevel),
    Demographic(BreakdownType),
}

#[derive(Clone)]
pub struct SyncWorker {
    id: String,
    queue: JobQueue,
    connections: Arc<dyn ConnectionStore>,
    progress: Arc<dyn ProgressStore>,
    metrics: Arc<dyn MetricStore>,
    upsert: UpsertLayer,
    rollover: RolloverManager,
    api: Arc<dyn AdsApi>,
    notifier: Arc<dyn DataChangeNotifier>,
    settings: WorkerSettings,
    chunk: ChunkSize,
}

impl SyncWorker {
    pub fn new(
        id: impl Into<String>,
        queue: JobQueue,
        stores: &Stores,
        api: Arc<dyn AdsApi>,
        notifier: Arc<dyn DataChangeNotifier>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            connections: stores.connections.clone(),
            progress: stores.progress.clone(),
            metrics: stores.metrics.clone(),
            upsert: UpsertLayer::new(stores.metrics.clone(), settings.worker.upsert_timeout()),
            rollover: RolloverManager::new(stores.metrics.clone(), settings.rollover.clone()),
            api,
            notifier,
            settings: settings.worker.clone(),
            chunk: settings.backfill.chunk_size(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(self.settings.retry_base_ms),
            max_delay: Duration::from_secs(self.settings.retry_cap_secs),
        }
    }

    /// Claim up to `max_jobs` ready jobs and run them to a terminal or
    /// rescheduled state.
    pub async fn process_batch(&self, max_jobs: usize) -> Result<BatchReport> {
        let jobs = self.queue.dequeue(max_jobs, &self.id).await?;
        let mut report = BatchReport {
            claimed: jobs.len(),
            ..Default::default()
        };
        for job in jobs {
            self.process_job(job, &mut report).await?;
        }
        Ok(report)
    }

    /// Run one claimed job. Only queue bookkeeping failures are returned;
    /// job errors are settled through ack, retry or fail.
    pub async fn process_job(&self, job: SyncJob, report: &mut BatchReport) -> Result<()> {
        let span = info_span!(
            "sync_job",
            job_id = %job.id,
            kind = %job.kind(),
            attempt = job.attempts + 1,
            worker = %self.id
        );
        async move {
            match self.execute(&job).await {
                Ok(Execution::Completed(rows)) => {
                    if !self.queue.ack(&job).await? {
                        report.lease_lost += 1;
                        return Ok(());
                    }
                    report.completed += 1;
                    report.rows_written += rows.written;
                    report.rows_skipped += rows.skipped;
                    info!(written = rows.written, skipped = rows.skipped, "job completed");
                    self.after_success(&job, rows).await;
                }
                Ok(Execution::Cancelled) => {
                    self.queue.finish_cancelled(&job).await?;
                    report.cancelled += 1;
                }
                Ok(Execution::LeaseLost) => report.lease_lost += 1,
                Err(err) => match self.settle_failure(&job, err).await? {
                    Settlement::Retried => report.retried += 1,
                    Settlement::Failed => report.failed += 1,
                    Settlement::LeaseLost => report.lease_lost += 1,
                },
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job: &SyncJob) -> Result<Execution> {
        let connection = match &job.task {
            JobTask::Rollover { target } => {
                let summary = self
                    .rollover
                    .run(job.brand_id, *target, Utc::now().date_naive())
                    .await?;
                return Ok(Execution::Completed(RowCounts {
                    written: summary.aggregates,
                    skipped: 0,
                }));
            }
            JobTask::HistoricalMetrics { connection_id, .. }
            | JobTask::HistoricalDemographics { connection_id, .. }
            | JobTask::DailyRefresh { connection_id, .. } => self.connection(job, *connection_id).await?,
        };

        let mut counts = RowCounts::default();
        for (request, shape) in self.plan_requests(job, &connection) {
            match self.drain(job, &connection, &request, shape).await? {
                Execution::Completed(rows) => {
                    counts.written += rows.written;
                    counts.skipped += rows.skipped;
                }
                stopped => return Ok(stopped),
            }
        }
        // Every page of the range was read, so its empty days are real.
        if let JobTask::HistoricalMetrics { time_range, .. } | JobTask::DailyRefresh { time_range, .. } =
            &job.task
        {
            self.metrics
                .mark_days_synced(job.brand_id, &connection.platform, *time_range)
                .await?;
        }
        Ok(Execution::Completed(counts))
    }

    async fn connection(&self, job: &SyncJob, connection_id: uuid::Uuid) -> Result<PlatformConnection> {
        let connection = self
            .connections
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("connection {connection_id}")))?;
        if connection.brand_id != job.brand_id {
            return Err(SyncError::validation(format!(
                "connection {connection_id} does not belong to brand {}",
                job.brand_id
            )));
        }
        if !connection.is_active() {
            return Err(SyncError::PermanentFailure(format!(
                "connection {connection_id} is {}",
                connection.status
            )));
        }
        Ok(connection)
    }

    fn plan_requests(
        &self,
        job: &SyncJob,
        connection: &PlatformConnection,
    ) -> Vec<(InsightsRequest, RowShape)> {
        let request = |time_range: TimeRange, level: MetricLevel, breakdown: Option<BreakdownType>| {
            InsightsRequest {
                account_id: connection.metadata.ad_account_id.clone(),
                access_token: connection.access_token.clone(),
                time_range,
                level,
                breakdown,
            }
        };
        // Account totals ride along with every metrics job; the detector
        // compares against them.
        let metric_levels = |range: TimeRange, levels: &[MetricLevel]| {
            let mut seen = Vec::new();
            for level in levels {
                if !seen.contains(level) {
                    seen.push(*level);
                }
            }
            seen.into_iter()
                .map(|level| (request(range, level, None), RowShape::Metric(level)))
                .collect::<Vec<_>>()
        };
        match &job.task {
            JobTask::HistoricalMetrics {
                time_range, level, ..
            } => metric_levels(*time_range, &[MetricLevel::Account, *level]),
            JobTask::DailyRefresh { time_range, .. } => {
                metric_levels(*time_range, &[MetricLevel::Account, MetricLevel::Ad])
            }
            JobTask::HistoricalDemographics {
                time_range,
                breakdown,
                ..
            } => vec![(
                request(*time_range, MetricLevel::Account, Some(*breakdown)),
                RowShape::Demographic(*breakdown),
            )],
            JobTask::Rollover { .. } => Vec::new(),
        }
    }

    /// Follow the cursor to the last page, honoring cancellation between pages.
    async fn drain(
        &self,
        job: &SyncJob,
        connection: &PlatformConnection,
        request: &InsightsRequest,
        shape: RowShape,
    ) -> Result<Execution> {
        let mut counts = RowCounts::default();
        let mut cursor: Option<String> = None;
        loop {
            if self.queue.is_cancel_requested(job.id).await? {
                return Ok(Execution::Cancelled);
            }
            let page = self.fetch_page(request, cursor.as_deref()).await?;
            let rows = self.store_page(job, connection, request, shape, &page).await?;
            counts.written += rows.written;
            counts.skipped += rows.skipped;

            if !self.queue.extend_lease(job, &self.id).await? {
                warn!("lease lost while paging; stopping");
                return Ok(Execution::LeaseLost);
            }
            match page.next_cursor {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    warn!(cursor = %next, "upstream repeated a cursor; stopping");
                    break;
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(Execution::Completed(counts))
    }

    async fn fetch_page(&self, request: &InsightsRequest, cursor: Option<&str>) -> Result<InsightsPage> {
        let timeout = self.settings.api_timeout();
        tokio::time::timeout(timeout, self.api.fetch_insights(request, cursor))
            .await
            .map_err(|_| SyncError::Timeout(format!("insights call exceeded {timeout:?}")))?
    }

    async fn store_page(
        &self,
        job: &SyncJob,
        connection: &PlatformConnection,
        request: &InsightsRequest,
        shape: RowShape,
        page: &InsightsPage,
    ) -> Result<RowCounts> {
        let mut counts = RowCounts::default();
        for raw in &page.rows {
            let record = match to_record(job, connection, request, shape, raw) {
                Ok(record) => record,
                Err(reason) => {
                    warn!(%reason, "skipping malformed row");
                    counts.skipped += 1;
                    continue;
                }
            };
            match self.upsert.apply(record).await {
                Ok(_) => counts.written += 1,
                Err(SyncError::Validation(reason)) => {
                    warn!(%reason, "skipping invalid row");
                    counts.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        debug!(rows = page.rows.len(), written = counts.written, "page stored");
        Ok(counts)
    }

    /// Post-ack bookkeeping. The job is already completed, so failures here
    /// are logged and never change its state.
    async fn after_success(&self, job: &SyncJob, rows: RowCounts) {
        let (Some(connection_id), Some(range)) = (job.connection_id(), job.time_range()) else {
            return;
        };
        let chunk = match job.kind() {
            JobKind::HistoricalMetrics => Some(range),
            _ => None,
        };
        match self
            .progress
            .record_progress(connection_id, SyncStage::from(job.kind()), chunk)
            .await
        {
            Ok(state) if state.stage == SyncStage::Complete => {
                if let Err(err) = self
                    .connections
                    .set_sync_status(connection_id, SyncStatus::Synced)
                    .await
                {
                    warn!(error = %err, "could not mark connection synced");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "progress update failed"),
        }

        if let JobTask::HistoricalDemographics {
            breakdown,
            stream: Some(stream),
            ..
        } = &job.task
        {
            if let Some(spec) =
                continue_stream(job.brand_id, connection_id, range, *breakdown, stream, self.chunk)
            {
                if let Err(err) = self.queue.enqueue(&spec).await {
                    error!(error = %err, "demographic stream continuation lost");
                }
            }
        }

        if rows.written > 0 {
            self.notifier
                .data_changed(&DataChanged {
                    brand_id: job.brand_id,
                    connection_id: Some(connection_id),
                    kind: job.kind(),
                    date_range: range,
                })
                .await;
        }
    }

    /// Apply the retry policy. Connection side effects only follow a
    /// transition this worker still owned.
    async fn settle_failure(&self, job: &SyncJob, err: SyncError) -> Result<Settlement> {
        let attempt = job.attempts + 1;
        let exhausted = attempt >= job.max_attempts;
        match err.class() {
            ErrorClass::Fatal => {
                if !self.queue.fail(job, &err).await? {
                    return Ok(Settlement::LeaseLost);
                }
                if let Some(connection_id) = job.connection_id() {
                    self.connections
                        .set_connection_state(
                            connection_id,
                            ConnectionStatus::Inactive,
                            SyncStatus::ReconnectRequired,
                        )
                        .await?;
                    warn!(%connection_id, "connection deactivated; reconnect required");
                }
                Ok(Settlement::Failed)
            }
            ErrorClass::Reject => {
                if !self.queue.fail(job, &err).await? {
                    return Ok(Settlement::LeaseLost);
                }
                Ok(Settlement::Failed)
            }
            ErrorClass::Backoff | ErrorClass::RateLimit if exhausted => {
                let final_error =
                    SyncError::PermanentFailure(format!("gave up after {attempt} attempts: {err}"));
                if !self.queue.fail(job, &final_error).await? {
                    return Ok(Settlement::LeaseLost);
                }
                if let Some(connection_id) = job.connection_id() {
                    self.connections
                        .set_sync_status(connection_id, SyncStatus::Stalled)
                        .await?;
                }
                Ok(Settlement::Failed)
            }
            ErrorClass::RateLimit => {
                let delay = err
                    .retry_after()
                    .unwrap_or_else(|| self.backoff().delay_for_attempt(job.attempts as usize));
                info!(?delay, error = %err, "rate limited; rescheduling");
                self.reschedule(job, delay, &err).await
            }
            ErrorClass::Backoff => {
                let delay = self.backoff().delay_for_attempt(job.attempts as usize);
                warn!(?delay, error = %err, "job attempt failed; retrying");
                self.reschedule(job, delay, &err).await
            }
        }
    }

    async fn reschedule(&self, job: &SyncJob, delay: Duration, err: &SyncError) -> Result<Settlement> {
        Ok(if self.queue.retry(job, delay, err).await? {
            Settlement::Retried
        } else {
            Settlement::LeaseLost
        })
    }
}

fn to_record(
    job: &SyncJob,
    connection: &PlatformConnection,
    request: &InsightsRequest,
    shape: RowShape,
    raw: &serde_json::Value,
) -> std::result::Result<MetricRecord, String> {
    let now = Utc::now();
    match shape {
        RowShape::Metric(level) => {
            let row = parse_metric_row(raw, level).map_err(|e| e.to_string())?;
            if !request.time_range.contains(row.date) {
                return Err(format!("row date {} outside {}", row.date, request.time_range));
            }
            Ok(MetricRecord::Daily(DailyMetricRecord {
                brand_id: job.brand_id,
                platform: connection.platform.clone(),
                date: row.date,
                ad_id: row.entity_id,
                level,
                account_id: row.account_id,
                campaign_id: row.campaign_id,
                ad_name: row.ad_name,
                metrics: row.metrics,
                ratios: DerivedRatios::default(),
                updated_at: now,
            }))
        }
        RowShape::Demographic(breakdown) => {
            let row = parse_demographic_row(raw, breakdown).map_err(|e| e.to_string())?;
            if !request.time_range.contains(row.date_start) {
                return Err(format!("row date {} outside {}", row.date_start, request.time_range));
            }
            Ok(MetricRecord::Demographic(DemographicBreakdownRecord {
                brand_id: job.brand_id,
                platform: connection.platform.clone(),
                date_range_start: row.date_start,
                date_range_end: row.date_stop,
                granularity: Granularity::Daily,
                breakdown_type: breakdown,
                breakdown_value: row.breakdown_value,
                metrics: row.metrics,
                ratios: DerivedRatios::default(),
                updated_at: now,
            }))
        }
    }
}

/// N workers polling one queue until shutdown.
pub struct WorkerPool {
    workers: Vec<SyncWorker>,
    batch_size: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(workers: Vec<SyncWorker>, batch_size: usize, poll_interval: Duration) -> Self {
        Self {
            workers,
            batch_size: batch_size.max(1),
            poll_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawn every worker. A batch in flight finishes before its worker
    /// observes the shutdown signal.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let batch_size = self.batch_size;
        let poll_interval = self.poll_interval;
        self.workers
            .into_iter()
            .map(|worker| {
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    info!(worker = %worker.id(), "worker started");
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match worker.process_batch(batch_size).await {
                            Ok(report) if report.claimed > 0 => continue,
                            Ok(_) => {}
                            Err(err) => error!(worker = %worker.id(), error = %err, "batch failed"),
                        }
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    info!(worker = %worker.id(), "worker stopped");
                })
            })
            .collect()
    }
}
