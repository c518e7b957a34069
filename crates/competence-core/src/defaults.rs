//! Centralized default constants for the competence matcher.
//!
//! Configuration structs in other crates read environment variables and fall
//! back to these values.

use crate::models::DistanceMetric;

// =============================================================================
// EMBEDDING
// =============================================================================

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Default embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

// =============================================================================
// GENERATION
// =============================================================================

/// Default generation model for segmentation and match reasons.
pub const GEN_MODEL: &str = "llama3.2";

/// Temperature for segmentation and reasoning prompts.
pub const GEN_TEMPERATURE: f32 = 0.2;

/// Delimiter the segmentation model places between segments.
pub const SPLITTING_SYMBOL: &str = "#|#";

// =============================================================================
// SERVICE URLS & TIMEOUTS
// =============================================================================

/// Default Ollama API base URL.
pub const OLLAMA_URL: &str = "http://localhost:11434";

/// Default NLI sidecar base URL.
pub const NLI_URL: &str = "http://localhost:8090";

/// Default NLI model name reported by the sidecar.
pub const NLI_MODEL: &str = "MoritzLaurer/deberta-v3-large-zeroshot-v2.0";

/// HTTP timeout for embedding requests (seconds).
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// HTTP timeout for generation requests (seconds).
pub const GEN_TIMEOUT_SECS: u64 = 120;

/// HTTP timeout for NLI classification requests (seconds).
pub const NLI_TIMEOUT_SECS: u64 = 30;

/// Timeout for startup health checks (seconds).
pub const HEALTH_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// MATCHING
// =============================================================================

pub const MATCH_DISTANCE_OFFSET: f64 = 0.0;
pub const MATCH_DISTANCE_MULTIPLIER: f64 = 1.0;
pub const CONTRADICTION_THRESHOLD: f64 = 0.5;
pub const ENTAILMENT_THRESHOLD: f64 = 0.5;
pub const ALIGNMENT_DISTANCE_THRESHOLD: f64 = 0.5;
pub const ALIGNMENT_BOOST_MULTIPLIER: f64 = 1.2;
pub const NEUTRAL_REDUCTION_MULTIPLIER: f64 = 0.8;

/// Default search metric.
pub const MATCH_METRIC: DistanceMetric = DistanceMetric::Cosine;

/// Contradiction check is positive when the max exceeds this...
pub const CONTRADICTION_CHECK_MAX: f64 = 0.5;
/// ...or the mean exceeds this.
pub const CONTRADICTION_CHECK_AVG: f64 = 0.45;

/// Alignment check is positive when the max exceeds this and the mean
/// exceeds [`ALIGNMENT_CHECK_AVG`].
pub const ALIGNMENT_CHECK_MAX: f64 = 0.65;
pub const ALIGNMENT_CHECK_AVG: f64 = 0.5;

// =============================================================================
// SEGMENTATION
// =============================================================================

pub const SEGMENTATION_ENABLED: bool = true;

/// Descriptions at or below this length are embedded whole.
pub const SEGMENT_MIN_CHARS: usize = 80;

/// Descriptions segmented concurrently per batch.
pub const SEGMENT_BATCH_SIZE: usize = 4;

pub const REASONING_ENABLED: bool = true;

// =============================================================================
// WORKER POOLS
// =============================================================================

pub const EMBEDDING_WORKERS: usize = 2;
pub const MATCHING_WORKERS: usize = 2;
pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const DEATH_TIMEOUT_MS: u64 = 30_000;
pub const HEALTH_CHECK_INTERVAL_MS: u64 = 10_000;
pub const JOB_MAX_RETRIES: u32 = 3;

/// Permits of the shared inference engine lock.
pub const ENGINE_LOCK_PERMITS: usize = 1;

/// Time given to workers to exit after `shutdown` before they are aborted.
pub const SHUTDOWN_GRACE_MS: u64 = 5_000;

// =============================================================================
// DATABASE
// =============================================================================

/// Maximum connections of the shared service pool.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Connections held by each worker's dedicated store.
pub const DB_WORKER_CONNECTIONS: u32 = 1;

pub const DB_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;
