//! Worker process of the competence matcher.
//!
//! Connects the store, checks every inference service, then runs the
//! embedder and matcher pools until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use competence_db::{log_pool_metrics, Database, PgStoreFactory, PoolConfig};
use competence_jobs::{
    MatcherConfig, MatchingService, RemoteModels, WorkerManager, WorkerPoolConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "competence_jobs=debug,competence_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "competence_jobs=debug,competence_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("competence-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let matcher = MatcherConfig::from_env();
    let pools = WorkerPoolConfig::from_env();
    info!(
        embedding_dim = matcher.embedding_dim,
        metric = %matcher.metric,
        segmentation = matcher.segmentation_enabled,
        reasoning = matcher.reasoning_enabled,
        embedding_workers = pools.embedding_workers,
        matching_workers = pools.matching_workers,
        "Configuration loaded"
    );

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = Database::connect_with_config(&database_url, PoolConfig::default(), matcher.embedding_dim)
        .await
        .context("failed to connect to database")?;
    db.migrate().await.context("failed to run migrations")?;
    info!(subsystem = "db", "Database ready");

    let models = Arc::new(RemoteModels::from_env());
    if let Err(e) = models.check_dimension(matcher.embedding_dim) {
        error!(error = %e, "Embedding dimensions disagree, aborting startup");
        return Err(e.into());
    }
    if let Err(e) = models.check_health().await {
        error!(error = %e, "Inference services unavailable, aborting startup");
        return Err(e.into());
    }

    let manager = Arc::new(WorkerManager::start(
        &pools,
        matcher.clone(),
        models,
        Arc::new(PgStoreFactory::dedicated(&database_url, matcher.embedding_dim)),
        Arc::new(PgStoreFactory::shared(db.clone())),
    ));
    let service = MatchingService::new(db.handle(), manager.clone());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut status_tick = tokio::time::interval(pools.health_check_interval);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status_tick.tick() => match service.manager().status().await {
                Ok(status) => {
                    log_pool_metrics(db.pool());
                    let lock = service.manager().engine_lock();
                    debug!(
                        permits = lock.permits(),
                        available = lock.available(),
                        "Engine lock status"
                    );
                    for pool in status {
                        info!(
                            worker_type = %pool.worker_type,
                            workers = pool.workers,
                            ready = pool.ready,
                            busy = pool.busy,
                            queued = pool.queued,
                            replacements = pool.replacements,
                            "Pool status"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Pool status unavailable"),
            },
        }
    }

    info!("Shutdown signal received");
    manager.shutdown().await;
    Ok(())
}
