//! Structured logging field names shared by every competence crate.
//!
//! Fields are recorded with `tracing` so that JSON output can be filtered by
//! a stable key set regardless of which crate emitted the event.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service: store down, model unreachable, job failed |
//! | WARN  | Recoverable item failure with a fallback (segment, embed, reason) |
//! | INFO  | Lifecycle: startup, shutdown, job start/finish, worker replaced |
//! | DEBUG | Decisions: dispatch, retries, alignment labels, config choices |
//! | TRACE | Per-item detail: heartbeats, search hits, individual embeddings |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "inference", "jobs", "service"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "ollama", "nli", "pool", "worker", "matcher", "embedder"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "embed_texts", "classify", "search", "dispatch"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Competence list UUID.
pub const LIST_ID: &str = "list_id";

/// Matching task identifier.
pub const TASK_ID: &str = "task_id";

/// Competence identifier within a resource.
pub const COMPETENCE_ID: &str = "competence_id";

/// Worker identifier inside its pool.
pub const WORKER_ID: &str = "worker_id";

/// Worker pool kind ("embedder", "matcher").
pub const WORKER_TYPE: &str = "worker_type";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of results returned by a search or query.
pub const RESULT_COUNT: &str = "result_count";

/// Number of input texts sent to a model.
pub const INPUT_COUNT: &str = "input_count";

/// Retry attempt of a job inside the pool.
pub const RETRY_COUNT: &str = "retry_count";

/// Jobs waiting in a pool queue.
pub const QUEUE_DEPTH: &str = "queue_depth";

// ─── Inference fields ──────────────────────────────────────────────────────

/// Model name used for inference.
pub const MODEL: &str = "model";

/// Alignment label assigned to a match.
pub const ALIGNMENT: &str = "alignment";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
