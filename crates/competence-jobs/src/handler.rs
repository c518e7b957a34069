//! Job handlers and their per-worker construction.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use competence_core::{JobStatus, Result, StoreHandle, WorkerType};

use crate::messages::{JobOutcome, JobSpec, PoolEvent, WorkerId, WorkerMessage};

/// Sends progress and item failures of one job to the pool.
#[derive(Clone)]
pub struct Reporter {
    worker_id: WorkerId,
    job_id: Uuid,
    events: Option<mpsc::UnboundedSender<PoolEvent>>,
}

impl Reporter {
    pub(crate) fn new(
        worker_id: WorkerId,
        job_id: Uuid,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        Self {
            worker_id,
            job_id,
            events: Some(events),
        }
    }

    /// Reporter that drops everything, for running handlers outside a pool.
    pub fn detached(job_id: Uuid) -> Self {
        Self {
            worker_id: 0,
            job_id,
            events: None,
        }
    }

    fn send(&self, message: WorkerMessage) {
        if let Some(events) = &self.events {
            let _ = events.send(PoolEvent::Message {
                worker_id: self.worker_id,
                message,
            });
        }
    }

    pub fn status(&self, status: JobStatus) {
        self.send(WorkerMessage::Status {
            job_id: self.job_id,
            status,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(WorkerMessage::Error {
            job_id: self.job_id,
            message: message.into(),
        });
    }
}

/// Context provided to job handlers.
pub struct JobContext {
    pub spec: JobSpec,
    /// The worker's own store instance.
    pub store: StoreHandle,
    pub reporter: Reporter,
}

impl JobContext {
    pub fn new(spec: JobSpec, store: StoreHandle, reporter: Reporter) -> Self {
        Self {
            spec,
            store,
            reporter,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.spec.job_id()
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The pool this handler serves.
    fn worker_type(&self) -> WorkerType;

    /// Execute the job. Status transitions are the handler's responsibility.
    async fn execute(&self, ctx: JobContext) -> JobOutcome;
}

/// Builds a worker's handler on its first job.
///
/// Failure is reported as a worker-level failure and retried.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    fn worker_type(&self) -> WorkerType;

    async fn build(&self) -> Result<Arc<dyn JobHandler>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_sends_tagged_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job_id = Uuid::new_v4();
        let reporter = Reporter::new(7, job_id, tx);

        reporter.status(JobStatus::Running);
        reporter.error("chunk failed");

        match rx.try_recv().unwrap() {
            PoolEvent::Message {
                worker_id,
                message: WorkerMessage::Status { status, .. },
            } => {
                assert_eq!(worker_id, 7);
                assert_eq!(status, JobStatus::Running);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            PoolEvent::Message {
                message: WorkerMessage::Error { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_detached_reporter_is_silent() {
        let reporter = Reporter::detached(Uuid::nil());
        reporter.status(JobStatus::Running);
        reporter.error("ignored");
    }
}
