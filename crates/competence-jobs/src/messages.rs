//! Pool ↔ worker message protocol.
//!
//! Both directions are tagged unions discriminated by a `type` field, so
//! every message kind is matched exhaustively.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use competence_core::{EmbeddingTask, JobStatus, MatchingTask, SearchFilter, WorkerType};

/// Identity of one spawned worker; replacements get fresh ids.
pub type WorkerId = u64;

/// Workload of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    /// Segment and embed the competences of a freshly ingested list.
    EmbedResources {
        job_id: Uuid,
        list_id: Uuid,
        tasks: Vec<EmbeddingTask>,
    },
    /// Embed the texts of matching tasks ahead of the match stage.
    EmbedTasks {
        job_id: Uuid,
        tasks: Vec<MatchingTask>,
    },
    /// Search, align, reason and persist.
    Match {
        job_id: Uuid,
        filter: SearchFilter,
        tasks: Vec<MatchingTask>,
    },
}

impl JobSpec {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::EmbedResources { job_id, .. }
            | Self::EmbedTasks { job_id, .. }
            | Self::Match { job_id, .. } => *job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmbedResources { .. } => "embed_resources",
            Self::EmbedTasks { .. } => "embed_tasks",
            Self::Match { .. } => "match",
        }
    }

    /// Pool that runs this kind of job.
    pub fn worker_type(&self) -> WorkerType {
        match self {
            Self::EmbedResources { .. } | Self::EmbedTasks { .. } => WorkerType::Embedder,
            Self::Match { .. } => WorkerType::Matcher,
        }
    }
}

/// How a job ended, as reported by its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "message", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Job reached its target status.
    Success,
    /// Job failed and its status was set to `failed`.
    Failed(String),
    /// Worker-level failure; the pool requeues the job.
    Retry(String),
}

/// Pool → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolMessage {
    Job { job: JobSpec },
    HealthCheck,
    Shutdown,
}

/// Worker → pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Progress update of the active job.
    Status { job_id: Uuid, status: JobStatus },
    /// Recoverable per-item failure.
    Error { job_id: Uuid, message: String },
    /// Terminal; frees the worker.
    JobCompleted { job_id: Uuid, outcome: JobOutcome },
    Heartbeat,
    HealthCheckResponse,
}

/// What the pool receives on its event channel.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    Message {
        worker_id: WorkerId,
        message: WorkerMessage,
    },
    /// Worker task ended without being asked to.
    Exited { worker_id: WorkerId, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_message_tags() {
        let json = serde_json::to_value(WorkerMessage::Heartbeat).unwrap();
        assert_eq!(json, serde_json::json!({"type": "heartbeat"}));

        let json = serde_json::to_value(WorkerMessage::HealthCheckResponse).unwrap();
        assert_eq!(json["type"], "health_check_response");

        let job_id = Uuid::nil();
        let json = serde_json::to_value(WorkerMessage::Status {
            job_id,
            status: JobStatus::Preprocessing,
        })
        .unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "preprocessing");
    }

    #[test]
    fn test_job_completed_carries_outcome() {
        let message = WorkerMessage::JobCompleted {
            job_id: Uuid::nil(),
            outcome: JobOutcome::Retry("model init".into()),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "job_completed");
        assert_eq!(json["outcome"]["result"], "retry");
        assert_eq!(json["outcome"]["message"], "model init");

        let back: WorkerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_pool_message_job() {
        let job_id = Uuid::new_v4();
        let message = PoolMessage::Job {
            job: JobSpec::EmbedTasks {
                job_id,
                tasks: vec![],
            },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "job");
        assert_eq!(json["job"]["kind"], "embed_tasks");
        assert_eq!(
            serde_json::to_value(PoolMessage::HealthCheck).unwrap()["type"],
            "health_check"
        );
    }

    #[test]
    fn test_job_spec_accessors() {
        let job_id = Uuid::new_v4();
        let spec = JobSpec::Match {
            job_id,
            filter: SearchFilter::default(),
            tasks: vec![],
        };
        assert_eq!(spec.job_id(), job_id);
        assert_eq!(spec.kind(), "match");
        assert_eq!(spec.worker_type(), WorkerType::Matcher);
    }
}
