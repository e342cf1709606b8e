use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use chorus_ai::{Generator, HttpGenerator};
use chorus_infra::config::WorkerConfig;
use chorus_infra::content::{ContentStore, PgContentStore};
use chorus_infra::digest::{ActivityStore, DigestAggregator, DigestKind, PgActivityStore};
use chorus_infra::executors::{
    BattleTurnExecutor, FanOutRepliesExecutor, ReplyExecutor, VerdictExecutor,
};
use chorus_infra::health::PgHealthProbe;
use chorus_infra::jobs::{JobDispatcher, JobStore, PgJobStore, QueueDepthReporter, StaleJobReaper};
use chorus_infra::notify::{Notifier, PgNotifier};
use chorus_infra::quota::{PgQuotaLedger, QuotaLedger};
use chorus_infra::scheduler::Scheduler;
use chorus_infra::schema;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chorus_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let database_url = config.require_database_url()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;
    if config.apply_schema {
        schema::apply(&pool).await?;
    }

    let jobs: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let content: Arc<dyn ContentStore> = Arc::new(PgContentStore::new(pool.clone()));
    let quota: Arc<dyn QuotaLedger> =
        Arc::new(PgQuotaLedger::new(pool.clone(), config.quota.utc_offset));
    let activity: Arc<dyn ActivityStore> = Arc::new(PgActivityStore::new(pool.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(PgNotifier::new(pool.clone()));
    let generator: Arc<dyn Generator> = Arc::new(
        HttpGenerator::new(config.generator.clone()).context("failed to build generator")?,
    );

    let dispatcher = JobDispatcher::new(jobs.clone(), config.retry.clone())
        .with_execution_timeout(config.execution_timeout())
        .with_executor(Arc::new(FanOutRepliesExecutor::new(
            content.clone(),
            jobs.clone(),
            config.reply_fanout_limit,
        )))
        .with_executor(Arc::new(ReplyExecutor::new(
            content.clone(),
            quota,
            generator.clone(),
            notifier.clone(),
            config.quota.clone(),
            config.generation_timeout,
        )))
        .with_executor(Arc::new(BattleTurnExecutor::new(
            content.clone(),
            jobs.clone(),
            generator.clone(),
            config.generation_timeout,
        )))
        .with_executor(Arc::new(VerdictExecutor::new(
            content,
            generator.clone(),
            notifier,
            config.generation_timeout,
        )));

    let digest = |kind| {
        let offset = config.quota.utc_offset;
        Arc::new(
            DigestAggregator::new(kind, activity.clone(), generator.clone(), offset)
                .with_activity_limit(config.digest_activity_limit)
                .with_top_k(config.digest_top_k)
                .with_generation_timeout(config.generation_timeout),
        )
    };

    let scheduler = Scheduler::new(config.poll_interval, config.task_timeout)
        .with_task(Arc::new(StaleJobReaper::new(
            jobs.clone(),
            config.stale_lock_after(),
            config.retry.max_attempts,
        )))
        .with_task(digest(DigestKind::PersonaDaily))
        .with_task(digest(DigestKind::UserWeekly))
        .with_task(Arc::new(dispatcher))
        .with_task(Arc::new(QueueDepthReporter::new(
            jobs,
            config.depth_report_interval,
        )));

    let listener = tokio::net::TcpListener::bind(config.health_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.health_addr))?;
    tracing::info!(
        worker = %config.worker_name,
        addr = %listener.local_addr()?,
        "health endpoints listening"
    );

    let scheduler = scheduler.spawn();
    let app = chorus_worker::health_router(Arc::new(PgHealthProbe::new(pool.clone())));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("health server failed")?;

    tracing::info!("shutting down");
    scheduler.shutdown().await;
    pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
