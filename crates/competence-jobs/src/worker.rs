//! A single pool worker.
//!
//! Each worker is its own tokio task. It runs at most one job at a time
//! and heartbeats from the same `select!` loop that drives the job, so a
//! worker whose thread is stuck falls silent and gets replaced.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, OptionFuture};
use futures::FutureExt;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use competence_core::{Error, StoreFactory, StoreHandle, WorkerType};

use crate::handler::{HandlerFactory, JobContext, JobHandler, Reporter};
use crate::messages::{JobOutcome, JobSpec, PoolEvent, PoolMessage, WorkerId, WorkerMessage};

/// Everything a worker needs, handed over by its pool.
#[derive(Clone)]
pub(crate) struct WorkerSpawn {
    pub id: WorkerId,
    pub worker_type: WorkerType,
    pub heartbeat_interval: Duration,
    pub handlers: Arc<dyn HandlerFactory>,
    pub stores: Arc<dyn StoreFactory>,
    pub events: mpsc::UnboundedSender<PoolEvent>,
}

/// Pool-side handle of a spawned worker.
pub(crate) struct WorkerHandle {
    pub tx: mpsc::UnboundedSender<PoolMessage>,
    pub task: JoinHandle<()>,
}

/// Handler and store, built on the first job and kept for the worker's life.
struct Ready {
    handler: Arc<dyn JobHandler>,
    store: StoreHandle,
}

type ActiveJob = BoxFuture<'static, (Uuid, JobOutcome)>;

impl WorkerSpawn {
    fn send(&self, message: WorkerMessage) {
        let _ = self.events.send(PoolEvent::Message {
            worker_id: self.id,
            message,
        });
    }
}

/// Spawn a worker task. A panic is reported to the pool as an exit.
pub(crate) fn spawn(worker: WorkerSpawn) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let events = worker.events.clone();
    let worker_id = worker.id;
    let span = tracing::info_span!(
        "worker",
        subsystem = "jobs",
        component = "worker",
        worker_id,
        worker_type = %worker.worker_type
    );

    let task = tokio::spawn(
        async move {
            if let Err(panic) = AssertUnwindSafe(run(worker, rx)).catch_unwind().await {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                error!(%reason, "Worker exited abnormally");
                let _ = events.send(PoolEvent::Exited { worker_id, reason });
            }
        }
        .instrument(span),
    );

    WorkerHandle { tx, task }
}

async fn run(worker: WorkerSpawn, mut rx: mpsc::UnboundedReceiver<PoolMessage>) {
    let ready: Arc<OnceCell<Ready>> = Arc::new(OnceCell::new());
    let mut heartbeat = tokio::time::interval(worker.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut active: Option<ActiveJob> = None;
    let mut started = Instant::now();

    debug!("Worker started");

    loop {
        tokio::select! {
            _ = heartbeat.tick() => worker.send(WorkerMessage::Heartbeat),
            message = rx.recv() => match message {
                Some(PoolMessage::Job { job }) => {
                    if active.is_some() {
                        error!(job_id = %job.job_id(), "Job dispatched to a busy worker, ignoring");
                        continue;
                    }
                    info!(job_id = %job.job_id(), kind = job.kind(), "Job started");
                    started = Instant::now();
                    active = Some(start_job(&worker, ready.clone(), job));
                }
                Some(PoolMessage::HealthCheck) => worker.send(WorkerMessage::HealthCheckResponse),
                Some(PoolMessage::Shutdown) | None => break,
            },
            Some((job_id, outcome)) = OptionFuture::from(active.as_mut()), if active.is_some() => {
                active = None;
                info!(
                    %job_id,
                    outcome = ?outcome,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Job finished"
                );
                worker.send(WorkerMessage::JobCompleted { job_id, outcome });
            }
        }
    }

    debug!("Worker stopped");
}

fn start_job(worker: &WorkerSpawn, ready: Arc<OnceCell<Ready>>, job: JobSpec) -> ActiveJob {
    let handlers = worker.handlers.clone();
    let stores = worker.stores.clone();
    let job_id = job.job_id();
    let reporter = Reporter::new(worker.id, job_id, worker.events.clone());

    async move {
        let init = ready
            .get_or_try_init(|| async {
                let store = stores.open().await?;
                let handler = handlers.build().await?;
                Ok::<_, Error>(Ready { handler, store })
            })
            .await;

        let outcome = match init {
            Ok(ready) => {
                ready
                    .handler
                    .execute(JobContext::new(job, ready.store.clone(), reporter))
                    .await
            }
            Err(e) => {
                warn!(%job_id, error = %e, "Worker initialization failed");
                JobOutcome::Retry(format!("worker initialization failed: {}", e))
            }
        };
        (job_id, outcome)
    }
    .boxed()
}
