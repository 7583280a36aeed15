use jobengine::config;
use jobengine::db;
use jobengine::jobs::{cleanup_old_jobs, JobStore, PgJobStore, QueueWorker};

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod handlers;
use handlers::build_registry;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cfg = config::Config::from_env()?;

    info!(
        worker = %cfg.worker_name,
        queues = ?cfg.queues,
        max_concurrent = cfg.max_concurrent,
        poll_interval_ms = cfg.poll_interval_ms,
        heartbeat_secs = cfg.heartbeat_secs,
        handler_timeout_secs = ?cfg.handler_timeout_secs,
        migrate_on_startup = cfg.migrate_on_startup,
        cleanup_after_days = cfg.cleanup_after_days,
        cleanup_interval_secs = cfg.cleanup_interval_secs,
        "job worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    let registry = build_registry();

    let workers: Vec<QueueWorker> = cfg
        .queues
        .iter()
        .map(|queue| {
            QueueWorker::with_registry(Arc::clone(&store), registry.clone(), cfg.worker_config(queue))
        })
        .collect();

    for worker in &workers {
        worker.start().await;
    }

    // ---- Retention task ----
    let maintenance_handle = {
        let store = Arc::clone(&store);
        let queues = cfg.queues.clone();
        let days = cfg.cleanup_after_days;
        let every = Duration::from_secs(cfg.cleanup_interval_secs);
        tokio::spawn(async move {
            loop {
                for queue in &queues {
                    if let Err(e) = cleanup_old_jobs(store.as_ref(), queue, days).await {
                        warn!(queue = %queue, error = %e, "retention cleanup failed");
                    }
                }
                tokio::time::sleep(every).await;
            }
        })
    };

    shutdown_signal().await;
    info!("shutdown signal received, stopping workers");

    maintenance_handle.abort();
    for worker in &workers {
        worker.stop().await;
    }

    let grace = Duration::from_secs(cfg.shutdown_grace_secs);
    for worker in &workers {
        if !worker.wait_idle(grace).await {
            warn!(
                worker = %worker.name(),
                still_running = worker.active_count().await,
                "in-flight jobs did not finish within the grace period"
            );
        }
    }

    info!("job worker stopped");
    Ok(())
}
