//! Operational surface shared by the CLI, the JSON API and the scheduler.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use adsync_adapters::{AdsApi, GraphApiConfig, GraphInsightsApi};
use adsync_core::{
    Granularity, JobSpec, PlatformConnection, QueueStats, RemoveOutcome, Result, SyncError,
    SyncJob, SyncProgressState,
};
use adsync_storage::{
    AccountRateLimit, ConnectionStore, HttpClientConfig, HttpFetcher, PgStore, PoolConfig,
    ProgressStore, Stores,
};
use anyhow::Context;
use chrono::{NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backfill::{BackfillOrchestrator, BackfillPlan, HistoricalSyncRequest};
use crate::config::{SyncConfig, SyncSettings};
use crate::detector::{ScanReport, StaleDetector};
use crate::notify::{DataChangeNotifier, TracingNotifier, WebhookNotifier};
use crate::queue::JobQueue;
use crate::rollover::{RolloverManager, RolloverReport};
use crate::worker::{SyncWorker, WorkerPool};

#[derive(Clone)]
pub struct SyncService {
    config: SyncConfig,
    settings: SyncSettings,
    stores: Stores,
    queue: JobQueue,
    orchestrator: BackfillOrchestrator,
    detector: StaleDetector,
    rollover: RolloverManager,
    api: Arc<dyn AdsApi>,
    notifier: Arc<dyn DataChangeNotifier>,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        settings: SyncSettings,
        stores: Stores,
        api: Arc<dyn AdsApi>,
        notifier: Arc<dyn DataChangeNotifier>,
    ) -> Self {
        let queue = JobQueue::new(
            stores.jobs.clone(),
            config.max_attempts,
            settings.worker.lease(),
        );
        let orchestrator = BackfillOrchestrator::new(
            queue.clone(),
            stores.connections.clone(),
            stores.progress.clone(),
            settings.backfill.clone(),
        );
        let detector = StaleDetector::new(
            stores.connections.clone(),
            stores.metrics.clone(),
            api.clone(),
            orchestrator.clone(),
            settings.detector.clone(),
            settings.worker.api_timeout(),
        );
        let rollover = RolloverManager::new(stores.metrics.clone(), settings.rollover.clone());
        Self {
            config,
            settings,
            stores,
            queue,
            orchestrator,
            detector,
            rollover,
            api,
            notifier,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn orchestrator(&self) -> &BackfillOrchestrator {
        &self.orchestrator
    }

    pub fn detector(&self) -> &StaleDetector {
        &self.detector
    }

    pub fn rollover(&self) -> &RolloverManager {
        &self.rollover
    }

    pub async fn enqueue(&self, spec: &JobSpec) -> Result<Uuid> {
        self.queue.enqueue(spec).await
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    pub async fn get_connection_progress(&self, connection_id: Uuid) -> Result<SyncProgressState> {
        self.stores
            .progress
            .get_progress(connection_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("no sync progress for connection {connection_id}")))
    }

    pub async fn get_connection(&self, connection_id: Uuid) -> Result<PlatformConnection> {
        self.stores
            .connections
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("connection {connection_id}")))
    }

    pub async fn trigger_backfill(
        &self,
        brand_id: Uuid,
        connection_id: Uuid,
        start_date: Option<NaiveDate>,
    ) -> Result<BackfillPlan> {
        self.orchestrator
            .trigger_backfill(brand_id, connection_id, start_date, today())
            .await
    }

    pub async fn queue_historical_sync(&self, request: &HistoricalSyncRequest) -> Result<BackfillPlan> {
        self.orchestrator.queue_historical_sync(request, today()).await
    }

    pub async fn remove_job(&self, job_id: Uuid) -> Result<RemoveOutcome> {
        self.queue.remove(job_id).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<SyncJob>> {
        self.queue.get(job_id).await
    }

    pub async fn list_failed(&self, limit: usize) -> Result<Vec<SyncJob>> {
        self.queue.list_failed(limit).await
    }

    pub async fn requeue_failed(&self, job_id: Uuid) -> Result<bool> {
        self.queue.requeue_failed(job_id).await
    }

    pub fn worker(&self, id: impl Into<String>) -> SyncWorker {
        SyncWorker::new(
            id,
            self.queue.clone(),
            &self.stores,
            self.api.clone(),
            self.notifier.clone(),
            &self.settings,
        )
    }

    pub fn worker_pool(&self) -> WorkerPool {
        let workers = (0..self.config.workers)
            .map(|i| self.worker(format!("worker-{i}")))
            .collect();
        WorkerPool::new(workers, self.config.batch_size, self.config.poll_interval())
    }

    /// One trailing-window `daily_refresh` per active connection.
    pub async fn enqueue_daily_refreshes(&self, today: NaiveDate) -> Result<usize> {
        let connections = self.stores.connections.list_active_connections().await?;
        let days = self.settings.backfill.refresh_days;
        for connection in &connections {
            self.orchestrator
                .queue_daily_refresh(connection, days, today)
                .await?;
        }
        info!(connections = connections.len(), days, "daily refresh queued");
        Ok(connections.len())
    }

    pub async fn scan_all(&self, today: NaiveDate) -> Result<Vec<ScanReport>> {
        self.detector.scan_all(today).await
    }

    /// Weekly and monthly rollover jobs for every brand with an active
    /// connection.
    pub async fn enqueue_rollovers(&self) -> Result<usize> {
        let brands: BTreeSet<Uuid> = self
            .stores
            .connections
            .list_active_connections()
            .await?
            .into_iter()
            .map(|c| c.brand_id)
            .collect();
        for brand_id in &brands {
            for target in [Granularity::Weekly, Granularity::Monthly] {
                self.queue.enqueue(&JobSpec::rollover(*brand_id, target)).await?;
            }
        }
        Ok(brands.len())
    }

    /// Run the rollover for one brand inline, bypassing the queue.
    pub async fn run_rollover(&self, brand_id: Uuid, today: NaiveDate) -> Result<RolloverReport> {
        self.rollover.run_all(brand_id, today).await
    }

    pub async fn archive_completed(&self) -> Result<u64> {
        let days = u64::from(self.settings.worker.archive_after_days);
        self.queue
            .archive_completed(Duration::from_secs(days * 24 * 60 * 60))
            .await
    }
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Webhook when configured, log-only otherwise.
pub fn notifier_from_config(config: &SyncConfig) -> anyhow::Result<Arc<dyn DataChangeNotifier>> {
    match &config.webhook_url {
        Some(url) => {
            let notifier = WebhookNotifier::new(url.clone(), Duration::from_secs(config.http_timeout_secs))
                .context("building webhook notifier")?;
            Ok(Arc::new(notifier))
        }
        None => Ok(Arc::new(TracingNotifier)),
    }
}

pub fn http_config(config: &SyncConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        global_concurrency: config.http_concurrency,
        account_rate_limit: (config.account_rps > 0.0).then_some(AccountRateLimit {
            per_second: config.account_rps,
            burst: config.account_burst,
        }),
        ..Default::default()
    }
}

pub async fn connect_postgres(config: &SyncConfig) -> anyhow::Result<PgStore> {
    PgStore::connect(&config.database_url, PoolConfig::default())
        .await
        .context("connecting to postgres")
}

/// Wire the production stack: Postgres stores, the Graph insights client and
/// the configured notifier.
pub async fn build_service_from_env() -> anyhow::Result<SyncService> {
    let config = SyncConfig::from_env();
    let settings = SyncSettings::load(&config.settings_path)?;
    let store = connect_postgres(&config).await?;
    let fetcher = HttpFetcher::new(http_config(&config))?;
    if fetcher.is_rate_limited() {
        info!(rps = config.account_rps, burst = config.account_burst, "per-account request rate enabled");
    }
    let api = GraphInsightsApi::new(
        Arc::new(fetcher),
        GraphApiConfig {
            base_url: config.api_base_url.clone(),
            api_version: config.api_version.clone(),
            ..Default::default()
        },
    );
    let notifier = notifier_from_config(&config)?;
    if config.webhook_url.is_none() {
        warn!("ADSYNC_WEBHOOK_URL not set; data changes are only logged");
    }
    Ok(SyncService::new(
        config,
        settings,
        Stores::from_backend(Arc::new(store)),
        Arc::new(api),
        notifier,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsync_adapters::FixtureAdsApi;
    use adsync_core::{
        ConnectionMetadata, ConnectionStatus, JobKind, JobStatus, SyncStatus, TimeRange,
    };
    use adsync_storage::MemoryStore;

    fn config() -> SyncConfig {
        SyncConfig {
            workers: 2,
            max_attempts: 3,
            ..SyncConfig::from_env()
        }
    }

    #[test]
    fn account_rate_limit_follows_config() {
        let off = http_config(&SyncConfig {
            account_rps: 0.0,
            ..config()
        });
        assert!(off.account_rate_limit.is_none());
        assert!(!HttpFetcher::new(off).unwrap().is_rate_limited());

        let on = http_config(&SyncConfig {
            account_rps: 4.0,
            account_burst: 8,
            http_concurrency: 3,
            ..config()
        });
        assert_eq!(
            on.account_rate_limit,
            Some(AccountRateLimit {
                per_second: 4.0,
                burst: 8
            })
        );
        assert_eq!(on.global_concurrency, 3);
        assert!(HttpFetcher::new(on).unwrap().is_rate_limited());
    }

    async fn service_with_connection() -> (Arc<MemoryStore>, SyncService, PlatformConnection) {
        let store = Arc::new(MemoryStore::new());
        let connection = PlatformConnection {
            id: Uuid::new_v4(),
            brand_id: Uuid::new_v4(),
            platform: "meta".into(),
            access_token: "token".into(),
            status: ConnectionStatus::Active,
            sync_status: SyncStatus::Idle,
            metadata: ConnectionMetadata {
                ad_account_id: "act_5".into(),
                extra: Default::default(),
            },
            created_at: Utc::now(),
        };
        store.upsert_connection(&connection).await.unwrap();
        let service = SyncService::new(
            config(),
            SyncSettings::default(),
            Stores::from_backend(store.clone()),
            Arc::new(FixtureAdsApi::new()),
            Arc::new(TracingNotifier),
        );
        (store, service, connection)
    }

    #[tokio::test]
    async fn progress_is_not_found_until_a_plan_exists() {
        let (_, service, connection) = service_with_connection().await;
        assert!(matches!(
            service.get_connection_progress(connection.id).await,
            Err(SyncError::NotFound(_))
        ));
        service
            .trigger_backfill(connection.brand_id, connection.id, Some(today() - chrono::Days::new(10)))
            .await
            .unwrap();
        let progress = service.get_connection_progress(connection.id).await.unwrap();
        assert_eq!(progress.days_target, 11);
    }

    #[tokio::test]
    async fn cron_entry_points_enqueue_per_connection_and_brand() {
        let (_, service, connection) = service_with_connection().await;
        assert_eq!(service.enqueue_daily_refreshes(today()).await.unwrap(), 1);
        assert_eq!(service.enqueue_rollovers().await.unwrap(), 1);
        let stats = service.get_queue_stats().await.unwrap();
        assert_eq!(stats.waiting, 3);
        assert_eq!(
            service
                .queue()
                .pending_count(connection.brand_id, JobKind::Rollover)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn pool_size_follows_config() {
        let (_, service, _) = service_with_connection().await;
        assert_eq!(service.worker_pool().len(), 2);
    }

    #[tokio::test]
    async fn removing_a_waiting_job_deletes_it() {
        let (_, service, connection) = service_with_connection().await;
        let id = service
            .enqueue(&JobSpec::daily_refresh(
                connection.brand_id,
                connection.id,
                TimeRange::single_day(today()),
            ))
            .await
            .unwrap();
        assert_eq!(service.remove_job(id).await.unwrap(), RemoveOutcome::Removed);
        assert!(service.get_job(id).await.unwrap().is_none());
        assert_eq!(service.remove_job(id).await.unwrap(), RemoveOutcome::NotFound);
        assert!(service.list_failed(10).await.unwrap().iter().all(|j| j.status == JobStatus::Failed));
    }
}
