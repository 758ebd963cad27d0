use std::sync::Arc;

use adsync_sync::{build_service_from_env, connect_postgres, maybe_build_scheduler, run_task, CronTask, SyncConfig};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::to_string_pretty;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "adsync")]
#[command(about = "Ad metrics sync: queue workers, backfills, rollover and JSON API")]
struct Cli {
    /// Debug-level logs unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TaskArg {
    DailyRefresh,
    Detect,
    Rollover,
    Archive,
}

impl From<TaskArg> for CronTask {
    fn from(arg: TaskArg) -> Self {
        match arg {
            TaskArg::DailyRefresh => CronTask::DailyRefresh,
            TaskArg::Detect => CronTask::Detect,
            TaskArg::Rollover => CronTask::Rollover,
            TaskArg::Archive => CronTask::Archive,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply SQL migrations.
    Migrate,
    /// Run the worker pool (and the cron scheduler when enabled) until Ctrl-C.
    Worker,
    /// Run the cron scheduler until Ctrl-C, or one task with --run.
    Schedule {
        #[arg(long, value_enum)]
        run: Option<TaskArg>,
    },
    /// Serve the JSON API.
    Serve,
    /// Queue a historical backfill for a connection.
    Backfill {
        brand_id: Uuid,
        connection_id: Uuid,
        #[arg(long)]
        start: Option<NaiveDate>,
    },
    Stats,
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Requeue {
        job_id: Uuid,
    },
    Remove {
        job_id: Uuid,
    },
    /// Run demographic rollover for one brand inline.
    Rollover {
        brand_id: Uuid,
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Scan active connections for gaps and stale days.
    Detect,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or(Commands::Worker) {
        Commands::Migrate => {
            let store = connect_postgres(&SyncConfig::from_env()).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Worker => {
            let service = Arc::new(build_service_from_env().await?);
            let scheduler = maybe_build_scheduler(service.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            let pool = service.worker_pool();
            info!(workers = pool.len(), "starting worker pool");
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handles = pool.spawn(shutdown_rx);

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutdown requested; finishing in-flight batches");
            shutdown_tx.send(true).ok();
            for handle in handles {
                handle.await.context("joining worker")?;
            }
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Schedule { run: Some(task) } => {
            let service = build_service_from_env().await?;
            run_task(&service, task.into()).await?;
        }
        Commands::Schedule { run: None } => {
            let service = Arc::new(build_service_from_env().await?);
            let Some(mut sched) = maybe_build_scheduler(service).await? else {
                anyhow::bail!("scheduler disabled; set ADSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            adsync_web::serve_from_env().await?;
        }
        Commands::Backfill {
            brand_id,
            connection_id,
            start,
        } => {
            let service = build_service_from_env().await?;
            let plan = service.trigger_backfill(brand_id, connection_id, start).await?;
            println!(
                "backfill queued: range={} metric_jobs={} demographic_streams={} deferred={}",
                plan.range,
                plan.metric_jobs.len(),
                plan.demographic_jobs.len(),
                plan.deferred_breakdowns.len()
            );
        }
        Commands::Stats => {
            let service = build_service_from_env().await?;
            println!("{}", to_string_pretty(&service.get_queue_stats().await?)?);
        }
        Commands::Failed { limit } => {
            let service = build_service_from_env().await?;
            println!("{}", to_string_pretty(&service.list_failed(limit).await?)?);
        }
        Commands::Requeue { job_id } => {
            let service = build_service_from_env().await?;
            if service.requeue_failed(job_id).await? {
                println!("requeued {job_id}");
            } else {
                anyhow::bail!("job {job_id} is not in the failed set");
            }
        }
        Commands::Remove { job_id } => {
            let service = build_service_from_env().await?;
            let outcome = service.remove_job(job_id).await?;
            println!("{}", to_string_pretty(&outcome)?);
        }
        Commands::Rollover { brand_id, today } => {
            let service = build_service_from_env().await?;
            let today = today.unwrap_or_else(adsync_sync::today);
            let report = service.run_rollover(brand_id, today).await?;
            println!("{}", to_string_pretty(&report)?);
        }
        Commands::Detect => {
            let service = build_service_from_env().await?;
            let reports = service.scan_all(adsync_sync::today()).await?;
            println!("{}", to_string_pretty(&reports)?);
        }
    }

    Ok(())
}
