//! Fixed-size worker pool.
//!
//! A supervisor task owns all pool state: the FIFO queue, the worker slots
//! and their liveness deadlines. It reacts to submissions, worker messages,
//! a watchdog tick, and shutdown, and never awaits a job itself.
//!
//! Worker-level failures (a missed heartbeat deadline, a panic, a closed
//! channel, or [`JobOutcome::Retry`]) requeue the job at the front of the
//! queue until `max_retries` is reached. After that the submitter receives
//! [`Error::Worker`] and the job is marked `failed`.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use competence_core::{Error, JobStatus, Result, StoreFactory, WorkerType};

use crate::config::WorkerPoolConfig;
use crate::handler::HandlerFactory;
use crate::messages::{JobOutcome, JobSpec, PoolEvent, PoolMessage, WorkerId, WorkerMessage};
use crate::worker::{self, WorkerHandle, WorkerSpawn};

/// Pool sizing and timing, resolved for one worker type.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    pub heartbeat_interval: Duration,
    pub death_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_retries: u32,
    pub shutdown_grace: Duration,
}

impl PoolSettings {
    pub fn for_type(config: &WorkerPoolConfig, worker_type: WorkerType) -> Self {
        let size = match worker_type {
            WorkerType::Embedder => config.embedding_workers,
            WorkerType::Matcher => config.matching_workers,
        };
        Self {
            size: size.max(1),
            heartbeat_interval: config.heartbeat_interval,
            death_timeout: config.death_timeout,
            health_check_interval: config.health_check_interval,
            max_retries: config.max_retries,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// Snapshot of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub worker_type: WorkerType,
    pub workers: usize,
    /// Workers that have heartbeated at least once.
    pub ready: usize,
    pub busy: usize,
    pub queued: usize,
    /// Workers replaced since start.
    pub replacements: u64,
    /// Replacements still in flight.
    pub replacing: usize,
}

struct QueuedJob {
    spec: JobSpec,
    retry_count: u32,
    reply: oneshot::Sender<Result<JobOutcome>>,
}

enum Command {
    Submit(QueuedJob),
    Status(oneshot::Sender<PoolStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running pool. Dropping it shuts the pool down.
pub struct WorkerPool {
    worker_type: WorkerType,
    commands: mpsc::UnboundedSender<Command>,
}

impl WorkerPool {
    /// Spawn the supervisor and its workers.
    ///
    /// Workers open their stores through `stores`. The supervisor uses
    /// `abandon_stores` to mark jobs failed once their retries run out.
    pub fn start(
        worker_type: WorkerType,
        settings: PoolSettings,
        handlers: Arc<dyn HandlerFactory>,
        stores: Arc<dyn StoreFactory>,
        abandon_stores: Arc<dyn StoreFactory>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            worker_type,
            settings,
            handlers,
            stores,
            abandon_stores,
            events_tx,
            workers: BTreeMap::new(),
            queue: VecDeque::new(),
            replacing: HashSet::new(),
            next_id: 1,
            replacements: 0,
        };
        tokio::spawn(supervisor.run(command_rx, events_rx));

        Self {
            worker_type,
            commands,
        }
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    fn stopped(&self, job_id: Uuid) -> Error {
        Error::Worker {
            worker_type: self.worker_type,
            job_id,
            message: "pool is not running".into(),
        }
    }

    /// Queue a job and wait for its outcome.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobOutcome> {
        let job_id = spec.job_id();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit(QueuedJob {
                spec,
                retry_count: 0,
                reply,
            }))
            .map_err(|_| self.stopped(job_id))?;
        rx.await.map_err(|_| self.stopped(job_id))?
    }

    pub async fn status(&self) -> Result<PoolStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .map_err(|_| Error::Internal("pool is not running".into()))?;
        rx.await
            .map_err(|_| Error::Internal("pool is not running".into()))
    }

    /// Reject pending work, stop workers, and wait for the supervisor.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct Slot {
    handle: WorkerHandle,
    ready: bool,
    active: Option<QueuedJob>,
    deadline: Instant,
}

struct Supervisor {
    worker_type: WorkerType,
    settings: PoolSettings,
    handlers: Arc<dyn HandlerFactory>,
    stores: Arc<dyn StoreFactory>,
    abandon_stores: Arc<dyn StoreFactory>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    workers: BTreeMap<WorkerId, Slot>,
    queue: VecDeque<QueuedJob>,
    /// Workers whose replacement has started; later reports are ignored.
    replacing: HashSet<WorkerId>,
    next_id: WorkerId,
    replacements: u64,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        for _ in 0..self.settings.size {
            self.spawn_worker();
        }
        info!(
            subsystem = "jobs",
            component = "pool",
            worker_type = %self.worker_type,
            size = self.settings.size,
            "Worker pool started"
        );

        let mut watchdog = tokio::time::interval(self.settings.heartbeat_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let health_every = self.settings.health_check_interval;
        let mut health = tokio::time::interval_at(Instant::now() + health_every, health_every);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Submit(job)) => {
                        debug!(
                            worker_type = %self.worker_type,
                            job_id = %job.spec.job_id(),
                            kind = job.spec.kind(),
                            queue_depth = self.queue.len() + 1,
                            "Job queued"
                        );
                        self.queue.push_back(job);
                    }
                    Some(Command::Status(tx)) => {
                        let _ = tx.send(self.status());
                    }
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = watchdog.tick() => self.check_deadlines(),
                _ = health.tick() => self.broadcast(PoolMessage::HealthCheck),
            }
            self.dispatch();
        }
    }

    fn spawn_worker(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let handle = worker::spawn(WorkerSpawn {
            id,
            worker_type: self.worker_type,
            heartbeat_interval: self.settings.heartbeat_interval,
            handlers: self.handlers.clone(),
            stores: self.stores.clone(),
            events: self.events_tx.clone(),
        });
        self.workers.insert(
            id,
            Slot {
                handle,
                ready: false,
                active: None,
                deadline: Instant::now() + self.settings.death_timeout,
            },
        );
        debug!(worker_type = %self.worker_type, worker_id = id, "Worker spawned");
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            worker_type: self.worker_type,
            workers: self.workers.len(),
            ready: self.workers.values().filter(|s| s.ready).count(),
            busy: self.workers.values().filter(|s| s.active.is_some()).count(),
            queued: self.queue.len(),
            replacements: self.replacements,
            replacing: self.replacing.len(),
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        let (worker_id, message) = match event {
            PoolEvent::Exited { worker_id, reason } => {
                self.replace_worker(worker_id, &reason);
                return;
            }
            PoolEvent::Message { worker_id, message } => (worker_id, message),
        };

        let death_timeout = self.settings.death_timeout;
        let Some(slot) = self.workers.get_mut(&worker_id) else {
            trace!(worker_id, "Message from retired worker ignored");
            return;
        };

        match message {
            WorkerMessage::Heartbeat | WorkerMessage::HealthCheckResponse => {
                slot.deadline = Instant::now() + death_timeout;
                if !slot.ready {
                    slot.ready = true;
                    debug!(worker_type = %self.worker_type, worker_id, "Worker available");
                }
            }
            WorkerMessage::Status { job_id, status } => {
                debug!(worker_type = %self.worker_type, worker_id, %job_id, %status, "Job status");
            }
            WorkerMessage::Error { job_id, message } => {
                warn!(
                    worker_type = %self.worker_type,
                    worker_id,
                    %job_id,
                    error = %message,
                    "Item failed, job continues"
                );
            }
            WorkerMessage::JobCompleted { job_id, outcome } => {
                let owns = slot.active.as_ref().map(|job| job.spec.job_id()) == Some(job_id);
                if !owns {
                    warn!(worker_id, %job_id, "Completion for a job the worker does not own");
                    return;
                }
                if let Some(job) = slot.active.take() {
                    self.finish(job, outcome);
                }
            }
        }
    }

    fn finish(&mut self, job: QueuedJob, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Retry(message) => self.retry_or_abandon(job, message),
            outcome => {
                let _ = job.reply.send(Ok(outcome));
            }
        }
    }

    fn retry_or_abandon(&mut self, mut job: QueuedJob, message: String) {
        let job_id = job.spec.job_id();
        if job.retry_count < self.settings.max_retries {
            job.retry_count += 1;
            warn!(
                worker_type = %self.worker_type,
                %job_id,
                retry_count = job.retry_count,
                error = %message,
                "Worker failure, requeueing job"
            );
            self.queue.push_front(job);
            return;
        }

        error!(
            worker_type = %self.worker_type,
            %job_id,
            retry_count = job.retry_count,
            error = %message,
            "Job retries exhausted"
        );
        tokio::spawn(mark_failed(self.abandon_stores.clone(), job_id));
        let _ = job.reply.send(Err(Error::Worker {
            worker_type: self.worker_type,
            job_id,
            message,
        }));
    }

    /// Tear down a dead worker, recover its job, and start a fresh one.
    fn replace_worker(&mut self, worker_id: WorkerId, reason: &str) {
        if !self.replacing.insert(worker_id) {
            return;
        }
        let Some(slot) = self.workers.remove(&worker_id) else {
            self.replacing.remove(&worker_id);
            return;
        };
        slot.handle.task.abort();
        warn!(
            worker_type = %self.worker_type,
            worker_id,
            %reason,
            "Replacing worker"
        );

        if let Some(job) = slot.active {
            self.retry_or_abandon(job, format!("worker {} failed: {}", worker_id, reason));
        }
        self.replacements += 1;
        self.spawn_worker();
        self.replacing.remove(&worker_id);
    }

    fn check_deadlines(&mut self) {
        let now = Instant::now();
        let dead: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, slot)| now >= slot.deadline)
            .map(|(id, _)| *id)
            .collect();
        for worker_id in dead {
            self.replace_worker(worker_id, "heartbeat timeout");
        }
    }

    fn broadcast(&self, message: PoolMessage) {
        for slot in self.workers.values() {
            let _ = slot.handle.tx.send(message.clone());
        }
    }

    /// Hand queued jobs to idle workers, first idle worker first.
    fn dispatch(&mut self) {
        let mut unreachable = Vec::new();
        while !self.queue.is_empty() {
            let Some((&worker_id, slot)) = self
                .workers
                .iter_mut()
                .find(|(_, slot)| slot.ready && slot.active.is_none())
            else {
                break;
            };
            let Some(job) = self.queue.pop_front() else {
                break;
            };

            if slot
                .handle
                .tx
                .send(PoolMessage::Job {
                    job: job.spec.clone(),
                })
                .is_err()
            {
                slot.ready = false;
                self.queue.push_front(job);
                unreachable.push(worker_id);
                continue;
            }
            debug!(
                worker_type = %self.worker_type,
                worker_id,
                job_id = %job.spec.job_id(),
                retry_count = job.retry_count,
                "Job dispatched"
            );
            slot.active = Some(job);
        }

        for worker_id in unreachable {
            self.replace_worker(worker_id, "worker channel closed");
        }
    }

    async fn shutdown(&mut self) {
        let rejection = |worker_type, job_id| Error::Worker {
            worker_type,
            job_id,
            message: "pool shutting down".into(),
        };

        for job in self.queue.drain(..) {
            let _ = job
                .reply
                .send(Err(rejection(self.worker_type, job.spec.job_id())));
        }

        let mut abandoned = Vec::new();
        let mut tasks = Vec::new();
        for (_, mut slot) in std::mem::take(&mut self.workers) {
            if let Some(job) = slot.active.take() {
                let job_id = job.spec.job_id();
                abandoned.push(mark_failed(self.abandon_stores.clone(), job_id));
                let _ = job.reply.send(Err(rejection(self.worker_type, job_id)));
            }
            let _ = slot.handle.tx.send(PoolMessage::Shutdown);
            tasks.push(slot.handle.task);
        }

        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let grace = self.settings.shutdown_grace;
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(worker_type = %self.worker_type, "Workers did not stop in time, aborting");
            aborts.iter().for_each(|a| a.abort());
        }
        let _ = tokio::time::timeout(grace, futures::future::join_all(abandoned)).await;

        info!(
            subsystem = "jobs",
            component = "pool",
            worker_type = %self.worker_type,
            "Worker pool stopped"
        );
    }
}

/// Mark a job `failed` after its owner is gone.
fn mark_failed(stores: Arc<dyn StoreFactory>, job_id: Uuid) -> impl Future<Output = ()> {
    async move {
        let result = async {
            let store = stores.open().await?;
            store.jobs.advance_status(job_id, JobStatus::Failed).await
        }
        .await;
        match result {
            Ok(status) => debug!(%job_id, %status, "Abandoned job marked failed"),
            Err(e) => error!(%job_id, error = %e, "Failed to mark abandoned job as failed"),
        }
    }
}
