//! Cron entry points: daily refresh, stale/gap scan, rollover and archive.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::service::{today, SyncService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronTask {
    DailyRefresh,
    Detect,
    Rollover,
    Archive,
}

impl CronTask {
    pub const ALL: [CronTask; 4] = [
        CronTask::DailyRefresh,
        CronTask::Detect,
        CronTask::Rollover,
        CronTask::Archive,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CronTask::DailyRefresh => "daily_refresh",
            CronTask::Detect => "detect",
            CronTask::Rollover => "rollover",
            CronTask::Archive => "archive",
        }
    }

    pub fn cron<'a>(&self, service: &'a SyncService) -> &'a str {
        let config = service.config();
        match self {
            CronTask::DailyRefresh => &config.refresh_cron,
            CronTask::Detect => &config.detect_cron,
            CronTask::Rollover => &config.rollover_cron,
            CronTask::Archive => &config.archive_cron,
        }
    }
}

/// Execute one cron task now. Also used by the CLI for manual runs.
pub async fn run_task(service: &SyncService, task: CronTask) -> Result<()> {
    match task {
        CronTask::DailyRefresh => {
            let queued = service.enqueue_daily_refreshes(today()).await?;
            info!(queued, "scheduled daily refresh");
        }
        CronTask::Detect => {
            let reports = service.scan_all(today()).await?;
            let jobs: usize = reports.iter().map(|r| r.refresh_jobs.len()).sum();
            info!(connections = reports.len(), jobs, "scheduled stale/gap scan");
        }
        CronTask::Rollover => {
            let brands = service.enqueue_rollovers().await?;
            info!(brands, "scheduled rollover");
        }
        CronTask::Archive => {
            let archived = service.archive_completed().await?;
            info!(archived, "scheduled archive");
        }
    }
    Ok(())
}

/// `None` unless `ADSYNC_SCHEDULER_ENABLED` is set. The caller starts the
/// returned scheduler.
pub async fn maybe_build_scheduler(service: Arc<SyncService>) -> Result<Option<JobScheduler>> {
    if !service.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for task in CronTask::ALL {
        let cron = task.cron(&service).to_string();
        let service = service.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                if let Err(err) = run_task(&service, task).await {
                    error!(task = task.name(), error = %err, "scheduled task failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job {} for cron {cron}", task.name()))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsync_adapters::FixtureAdsApi;
    use adsync_storage::Stores;

    use crate::config::{SyncConfig, SyncSettings};
    use crate::notify::TracingNotifier;

    fn service(enabled: bool) -> Arc<SyncService> {
        let config = SyncConfig {
            scheduler_enabled: enabled,
            ..SyncConfig::from_env()
        };
        Arc::new(SyncService::new(
            config,
            SyncSettings::default(),
            Stores::in_memory(),
            Arc::new(FixtureAdsApi::new()),
            Arc::new(TracingNotifier),
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        assert!(maybe_build_scheduler(service(false)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn default_crons_are_accepted() {
        assert!(maybe_build_scheduler(service(true)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tasks_run_against_an_empty_store() {
        let service = service(false);
        for task in CronTask::ALL {
            run_task(&service, task).await.unwrap();
        }
        assert_eq!(service.get_queue_stats().await.unwrap().waiting, 0);
    }
}
