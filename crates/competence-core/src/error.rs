//! Error types for the competence matcher.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{JobStatus, WorkerType};

/// Result type alias using the competence matcher's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for competence matcher operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input; never fatal to the service.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing list, resource, competence, or job.
    #[error("Not found: {0}")]
    ResourceNotFound(String),

    /// Worker crash, heartbeat timeout, or model initialization failure.
    #[error("Worker error in {worker_type} pool for job {job_id}: {message}")]
    Worker {
        worker_type: WorkerType,
        job_id: Uuid,
        message: String,
    },

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Segmentation, embedding, alignment, or reasoning failed for one item.
    #[error("Pipeline stage '{stage}' failed: {message}")]
    PipelineStage { stage: String, message: String },

    /// A required model or engine is unreachable.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Job status change not allowed by the state machine.
    #[error("Invalid job status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// An atomic operation is already open on this store instance.
    #[error("Transaction already in progress")]
    TransactionInProgress,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a pipeline stage failure.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::PipelineStage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Whether the error came from the store connection rather than one item.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::Database(_) | Error::TransactionInProgress)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
