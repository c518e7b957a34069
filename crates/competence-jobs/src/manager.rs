//! The two worker pools of a process.

use std::sync::Arc;

use tracing::info;

use competence_core::{Result, StoreFactory, WorkerType};

use crate::config::{MatcherConfig, WorkerPoolConfig};
use crate::engine_lock::EngineLock;
use crate::handler::HandlerFactory;
use crate::messages::{JobOutcome, JobSpec};
use crate::pipeline::{EmbedderFactory, MatcherFactory, ModelProvider};
use crate::pool::{PoolSettings, PoolStatus, WorkerPool};

/// Embedder and matcher pools sharing one engine lock.
pub struct WorkerManager {
    embedder: WorkerPool,
    matcher: WorkerPool,
    lock: EngineLock,
}

impl WorkerManager {
    /// Start both pools with the pipeline handlers.
    ///
    /// Workers open their own stores through `stores`; `abandon_stores`
    /// marks jobs failed once their retries run out.
    pub fn start(
        pools: &WorkerPoolConfig,
        matcher: MatcherConfig,
        models: Arc<dyn ModelProvider>,
        stores: Arc<dyn StoreFactory>,
        abandon_stores: Arc<dyn StoreFactory>,
    ) -> Self {
        let lock = EngineLock::new(pools.engine_lock_permits);
        let embedder_handlers: Arc<dyn HandlerFactory> = Arc::new(EmbedderFactory::new(
            models.clone(),
            lock.clone(),
            matcher.clone(),
        ));
        let matcher_handlers: Arc<dyn HandlerFactory> =
            Arc::new(MatcherFactory::new(models, lock.clone(), matcher));
        Self::with_handlers(
            pools,
            lock,
            embedder_handlers,
            matcher_handlers,
            stores,
            abandon_stores,
        )
    }

    /// Start both pools with arbitrary handlers.
    pub fn with_handlers(
        pools: &WorkerPoolConfig,
        lock: EngineLock,
        embedder_handlers: Arc<dyn HandlerFactory>,
        matcher_handlers: Arc<dyn HandlerFactory>,
        stores: Arc<dyn StoreFactory>,
        abandon_stores: Arc<dyn StoreFactory>,
    ) -> Self {
        let embedder = WorkerPool::start(
            WorkerType::Embedder,
            PoolSettings::for_type(pools, WorkerType::Embedder),
            embedder_handlers,
            stores.clone(),
            abandon_stores.clone(),
        );
        let matcher = WorkerPool::start(
            WorkerType::Matcher,
            PoolSettings::for_type(pools, WorkerType::Matcher),
            matcher_handlers,
            stores,
            abandon_stores,
        );
        info!(
            subsystem = "jobs",
            component = "manager",
            embedding_workers = pools.embedding_workers,
            matching_workers = pools.matching_workers,
            engine_lock_permits = lock.permits(),
            "Worker manager started"
        );
        Self {
            embedder,
            matcher,
            lock,
        }
    }

    pub fn pool(&self, worker_type: WorkerType) -> &WorkerPool {
        match worker_type {
            WorkerType::Embedder => &self.embedder,
            WorkerType::Matcher => &self.matcher,
        }
    }

    pub fn engine_lock(&self) -> &EngineLock {
        &self.lock
    }

    /// Run `spec` on the pool for its kind and wait for the outcome.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobOutcome> {
        self.pool(spec.worker_type()).submit(spec).await
    }

    pub async fn status(&self) -> Result<Vec<PoolStatus>> {
        Ok(vec![self.embedder.status().await?, self.matcher.status().await?])
    }

    pub async fn shutdown(&self) {
        futures::join!(self.embedder.shutdown(), self.matcher.shutdown());
        info!(subsystem = "jobs", component = "manager", "Worker manager stopped");
    }
}
