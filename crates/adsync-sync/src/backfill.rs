//! Splits historical ranges into chunked jobs, newest first, and keeps the
//! per-brand demographic backlog under its cap.

use std::collections::BTreeSet;
use std::sync::Arc;

use adsync_core::{
    contiguous_ranges, next_day, BreakdownType, ChunkSize, DemographicStream, JobKind, JobSpec,
    JobTask, PlatformConnection, Priority, Result, SyncError, SyncStage, SyncStatus, TimeRange,
};
use adsync_storage::{ConnectionStore, ProgressStore};
use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BackfillSettings;
use crate::queue::JobQueue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSyncRequest {
    pub brand_id: Uuid,
    pub connection_id: Uuid,
    pub access_token: String,
    pub account_id: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillPlan {
    pub connection_id: Uuid,
    pub range: TimeRange,
    pub days_target: u32,
    pub metric_jobs: Vec<Uuid>,
    pub demographic_jobs: Vec<Uuid>,
    /// Dimensions left out because the brand's demographic cap was full.
    pub deferred_breakdowns: Vec<BreakdownType>,
}

/// Priority of the `index`-th chunk counted from the newest.
pub fn chunk_priority(index: usize) -> Priority {
    match index {
        0 => Priority::High,
        1 | 2 => Priority::Normal,
        _ => Priority::Low,
    }
}

/// Deal `dims` round-robin onto `streams` streams.
pub fn assign_streams(dims: &[BreakdownType], streams: usize) -> Vec<Vec<BreakdownType>> {
    let mut out = vec![Vec::new(); streams.min(dims.len())];
    if out.is_empty() {
        return out;
    }
    let n = out.len();
    for (i, dim) in dims.iter().enumerate() {
        out[i % n].push(*dim);
    }
    out
}

/// Follow-up job for a finished demographic chunk: the next older chunk of
/// the same dimension, or the newest chunk of the stream's next dimension.
pub fn continue_stream(
    brand_id: Uuid,
    connection_id: Uuid,
    finished: TimeRange,
    breakdown: BreakdownType,
    stream: &DemographicStream,
    chunk: ChunkSize,
) -> Option<JobSpec> {
    if let Some(older) = finished.previous_chunk(stream.floor, chunk) {
        return Some(
            JobSpec::historical_demographics(brand_id, connection_id, older, breakdown)
                .with_priority(Priority::Low)
                .with_stream(stream.clone()),
        );
    }
    let (next, rest) = stream.queued_breakdowns.split_first()?;
    let newest = TimeRange::new(stream.floor, stream.ceiling)
        .ok()?
        .chunks(chunk)
        .pop()?;
    Some(
        JobSpec::historical_demographics(brand_id, connection_id, newest, *next)
            .with_priority(Priority::Low)
            .with_stream(DemographicStream {
                floor: stream.floor,
                ceiling: stream.ceiling,
                queued_breakdowns: rest.to_vec(),
            }),
    )
}

#[derive(Clone)]
pub struct BackfillOrchestrator {
    queue: JobQueue,
    connections: Arc<dyn ConnectionStore>,
    progress: Arc<dyn ProgressStore>,
    settings: BackfillSettings,
}

impl BackfillOrchestrator {
    pub fn new(
        queue: JobQueue,
        connections: Arc<dyn ConnectionStore>,
        progress: Arc<dyn ProgressStore>,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            queue,
            connections,
            progress,
            settings,
        }
    }

    pub fn settings(&self) -> &BackfillSettings {
        &self.settings
    }

    async fn resolve(&self, brand_id: Uuid, connection_id: Uuid) -> Result<PlatformConnection> {
        let connection = self
            .connections
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("connection {connection_id}")))?;
        if connection.brand_id != brand_id {
            return Err(SyncError::validation(format!(
                "connection {connection_id} does not belong to brand {brand_id}"
            )));
        }
        if !connection.is_active() {
            return Err(SyncError::validation(format!(
                "connection {connection_id} is {}",
                connection.status
            )));
        }
        Ok(connection)
    }

    /// Queue the full history for a freshly connected account.
    pub async fn queue_historical_sync(
        &self,
        request: &HistoricalSyncRequest,
        today: NaiveDate,
    ) -> Result<BackfillPlan> {
        if request.access_token.trim().is_empty() {
            return Err(SyncError::validation("access token is empty"));
        }
        let connection = self.resolve(request.brand_id, request.connection_id).await?;
        let stored_account = connection.metadata.ad_account_id.trim_start_matches("act_");
        if stored_account != request.account_id.trim_start_matches("act_") {
            return Err(SyncError::validation(format!(
                "account {} does not match connection account {}",
                request.account_id, connection.metadata.ad_account_id
            )));
        }

        let since = match request.start_date {
            Some(start) => start,
            None => connection
                .created_at
                .date_naive()
                .checked_sub_months(Months::new(self.settings.history_months))
                .ok_or_else(|| SyncError::validation("history start out of range"))?,
        };
        let range = TimeRange::new(since, next_day(today))?;
        let chunk = self.settings.chunk_size();

        let mut metric_jobs = Vec::new();
        for (index, piece) in range.chunks(chunk).into_iter().rev().enumerate() {
            let spec = JobSpec::historical_metrics(request.brand_id, connection.id, piece)
                .with_priority(chunk_priority(index));
            metric_jobs.push(self.queue.enqueue(&spec).await?);
        }

        let (demographic_jobs, deferred_breakdowns) =
            self.start_demographic_streams(&connection, range, chunk).await?;

        let days_target = range.days();
        self.progress
            .reset_progress(connection.id, SyncStage::Queued, days_target)
            .await?;
        self.connections
            .set_sync_status(connection.id, SyncStatus::Syncing)
            .await?;

        info!(
            brand_id = %request.brand_id,
            connection_id = %connection.id,
            %range,
            metric_jobs = metric_jobs.len(),
            demographic_streams = demographic_jobs.len(),
            "historical sync queued"
        );
        Ok(BackfillPlan {
            connection_id: connection.id,
            range,
            days_target,
            metric_jobs,
            demographic_jobs,
            deferred_breakdowns,
        })
    }

    /// Breakdowns a live stream of `connection` is fetching now or will
    /// reach later.
    async fn streaming_breakdowns(
        &self,
        connection: &PlatformConnection,
    ) -> Result<BTreeSet<BreakdownType>> {
        let live = self
            .queue
            .live_jobs(connection.brand_id, JobKind::HistoricalDemographics)
            .await?;
        let mut streaming = BTreeSet::new();
        for job in live {
            if let JobTask::HistoricalDemographics {
                connection_id,
                breakdown,
                stream,
                ..
            } = job.task
            {
                if connection_id != connection.id {
                    continue;
                }
                streaming.insert(breakdown);
                if let Some(stream) = stream {
                    streaming.extend(stream.queued_breakdowns);
                }
            }
        }
        Ok(streaming)
    }

    async fn start_demographic_streams(
        &self,
        connection: &PlatformConnection,
        range: TimeRange,
        chunk: ChunkSize,
    ) -> Result<(Vec<Uuid>, Vec<BreakdownType>)> {
        let streaming = self.streaming_breakdowns(connection).await?;
        let dims: Vec<BreakdownType> = self
            .settings
            .breakdowns
            .iter()
            .copied()
            .filter(|b| !streaming.contains(b))
            .collect();
        if dims.is_empty() {
            if !streaming.is_empty() {
                debug!(connection_id = %connection.id, "every breakdown already has a live stream");
            }
            return Ok((Vec::new(), Vec::new()));
        }
        let pending = self
            .queue
            .pending_count(connection.brand_id, JobKind::HistoricalDemographics)
            .await?;
        let slots = self
            .settings
            .demographic_cap
            .saturating_sub(usize::try_from(pending).unwrap_or(usize::MAX));
        if slots == 0 {
            warn!(
                brand_id = %connection.brand_id,
                pending,
                cap = self.settings.demographic_cap,
                "demographic backlog full; breakdowns deferred"
            );
            return Ok((Vec::new(), dims));
        }

        let Some(newest) = range.chunks(chunk).pop() else {
            return Ok((Vec::new(), Vec::new()));
        };
        let mut ids = Vec::new();
        for assigned in assign_streams(&dims, slots) {
            let Some((first, rest)) = assigned.split_first() else {
                continue;
            };
            let spec = JobSpec::historical_demographics(connection.brand_id, connection.id, newest, *first)
                .with_priority(Priority::Normal)
                .with_stream(DemographicStream {
                    floor: range.since,
                    ceiling: range.until,
                    queued_breakdowns: rest.to_vec(),
                });
            ids.push(self.queue.enqueue(&spec).await?);
        }
        Ok((ids, Vec::new()))
    }

    /// Operator entry point: history for an existing connection.
    pub async fn trigger_backfill(
        &self,
        brand_id: Uuid,
        connection_id: Uuid,
        start_date: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<BackfillPlan> {
        let connection = self.resolve(brand_id, connection_id).await?;
        let request = HistoricalSyncRequest {
            brand_id,
            connection_id,
            access_token: connection.access_token.clone(),
            account_id: connection.metadata.ad_account_id.clone(),
            start_date,
        };
        self.queue_historical_sync(&request, today).await
    }

    /// One `daily_refresh` job per maximal run of consecutive `dates`.
    pub async fn queue_refresh(
        &self,
        connection: &PlatformConnection,
        dates: &[NaiveDate],
    ) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        for range in contiguous_ranges(dates) {
            let spec = JobSpec::daily_refresh(connection.brand_id, connection.id, range)
                .with_priority(Priority::High);
            ids.push(self.queue.enqueue(&spec).await?);
        }
        if !ids.is_empty() {
            info!(connection_id = %connection.id, jobs = ids.len(), "refresh queued");
        }
        Ok(ids)
    }

    /// Refresh the trailing `days` days ending today.
    pub async fn queue_daily_refresh(
        &self,
        connection: &PlatformConnection,
        days: u32,
        today: NaiveDate,
    ) -> Result<Uuid> {
        let range = TimeRange::ending_on(today, days.max(1));
        let spec = JobSpec::daily_refresh(connection.brand_id, connection.id, range);
        self.queue.enqueue(&spec).await
    }
}
