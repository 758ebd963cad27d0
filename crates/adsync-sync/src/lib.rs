//! Ad-metrics sync engine: durable job queue, workers, idempotent upserts,
//! stale/gap detection, historical backfill and demographic rollover.

pub mod backfill;
pub mod config;
pub mod detector;
pub mod notify;
pub mod queue;
pub mod rollover;
pub mod scheduler;
pub mod service;
pub mod upsert;
pub mod worker;

pub use backfill::{BackfillOrchestrator, BackfillPlan, HistoricalSyncRequest};
pub use config::{
    BackfillSettings, DetectorSettings, RetentionPolicy, RolloverSettings, SyncConfig,
    SyncSettings, WorkerSettings,
};
pub use detector::{decide_backfill, BackfillDecision, ScanReport, StaleDetector};
pub use notify::{DataChangeNotifier, DataChanged, TracingNotifier, WebhookNotifier};
pub use queue::{JobQueue, DEFAULT_MAX_ATTEMPTS};
pub use rollover::{BucketState, RolloverManager, RolloverReport};
pub use scheduler::{maybe_build_scheduler, run_task, CronTask};
pub use service::{build_service_from_env, connect_postgres, http_config, today, SyncService};
pub use upsert::{MetricRecord, UpsertLayer};
pub use worker::{BatchReport, SyncWorker, WorkerPool};

pub const CRATE_NAME: &str = "adsync-sync";
