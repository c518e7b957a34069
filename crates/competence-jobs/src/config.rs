//! Matching and worker pool configuration.

use std::str::FromStr;
use std::time::Duration;

use competence_core::{defaults, DistanceMetric};

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| !matches!(v.trim(), "false" | "0" | "no" | "off"))
}

/// Scoring thresholds and stage toggles of the matching pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MatcherConfig {
    pub embedding_dim: usize,
    pub distance_offset: f64,
    pub distance_multiplier: f64,
    pub contradiction_threshold: f64,
    pub entailment_threshold: f64,
    pub alignment_distance_threshold: f64,
    pub alignment_boost_multiplier: f64,
    pub neutral_reduction_multiplier: f64,
    pub metric: DistanceMetric,
    /// Hits per task; `None` keeps every candidate.
    pub top_k: Option<i64>,
    pub segmentation_enabled: bool,
    pub segment_min_chars: usize,
    pub segment_batch_size: usize,
    pub reasoning_enabled: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            embedding_dim: defaults::EMBED_DIMENSION,
            distance_offset: defaults::MATCH_DISTANCE_OFFSET,
            distance_multiplier: defaults::MATCH_DISTANCE_MULTIPLIER,
            contradiction_threshold: defaults::CONTRADICTION_THRESHOLD,
            entailment_threshold: defaults::ENTAILMENT_THRESHOLD,
            alignment_distance_threshold: defaults::ALIGNMENT_DISTANCE_THRESHOLD,
            alignment_boost_multiplier: defaults::ALIGNMENT_BOOST_MULTIPLIER,
            neutral_reduction_multiplier: defaults::NEUTRAL_REDUCTION_MULTIPLIER,
            metric: defaults::MATCH_METRIC,
            top_k: None,
            segmentation_enabled: defaults::SEGMENTATION_ENABLED,
            segment_min_chars: defaults::SEGMENT_MIN_CHARS,
            segment_batch_size: defaults::SEGMENT_BATCH_SIZE,
            reasoning_enabled: defaults::REASONING_ENABLED,
        }
    }
}

impl MatcherConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `EMBEDDING_DIM` | `768` |
    /// | `MATCH_DISTANCE_OFFSET` | `0.0` |
    /// | `MATCH_DISTANCE_MULTIPLIER` | `1.0` |
    /// | `CONTRADICTION_THRESHOLD` | `0.5` |
    /// | `ENTAILMENT_THRESHOLD` | `0.5` |
    /// | `ALIGNMENT_DISTANCE_THRESHOLD` | `0.5` |
    /// | `ALIGNMENT_BOOST_MULTIPLIER` | `1.2` |
    /// | `NEUTRAL_REDUCTION_MULTIPLIER` | `0.8` |
    /// | `MATCH_METRIC` | `cosine` |
    /// | `MATCH_TOP_K` | unset (all hits) |
    /// | `SEGMENTATION_ENABLED` | `true` |
    /// | `SEGMENT_MIN_CHARS` | `80` |
    /// | `SEGMENT_BATCH_SIZE` | `4` |
    /// | `REASONING_ENABLED` | `true` |
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            embedding_dim: env_parse("EMBEDDING_DIM").unwrap_or(d.embedding_dim),
            distance_offset: env_parse("MATCH_DISTANCE_OFFSET").unwrap_or(d.distance_offset),
            distance_multiplier: env_parse("MATCH_DISTANCE_MULTIPLIER")
                .unwrap_or(d.distance_multiplier),
            contradiction_threshold: env_parse("CONTRADICTION_THRESHOLD")
                .unwrap_or(d.contradiction_threshold),
            entailment_threshold: env_parse("ENTAILMENT_THRESHOLD")
                .unwrap_or(d.entailment_threshold),
            alignment_distance_threshold: env_parse("ALIGNMENT_DISTANCE_THRESHOLD")
                .unwrap_or(d.alignment_distance_threshold),
            alignment_boost_multiplier: env_parse("ALIGNMENT_BOOST_MULTIPLIER")
                .unwrap_or(d.alignment_boost_multiplier),
            neutral_reduction_multiplier: env_parse("NEUTRAL_REDUCTION_MULTIPLIER")
                .unwrap_or(d.neutral_reduction_multiplier),
            metric: env_parse("MATCH_METRIC").unwrap_or(d.metric),
            top_k: env_parse::<i64>("MATCH_TOP_K").filter(|k| *k > 0),
            segmentation_enabled: env_bool("SEGMENTATION_ENABLED")
                .unwrap_or(d.segmentation_enabled),
            segment_min_chars: env_parse("SEGMENT_MIN_CHARS").unwrap_or(d.segment_min_chars),
            segment_batch_size: env_parse::<usize>("SEGMENT_BATCH_SIZE")
                .unwrap_or(d.segment_batch_size)
                .max(1),
            reasoning_enabled: env_bool("REASONING_ENABLED").unwrap_or(d.reasoning_enabled),
        }
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_top_k(mut self, k: Option<i64>) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_segmentation(mut self, enabled: bool) -> Self {
        self.segmentation_enabled = enabled;
        self
    }

    pub fn with_segment_min_chars(mut self, chars: usize) -> Self {
        self.segment_min_chars = chars;
        self
    }

    pub fn with_segment_batch_size(mut self, size: usize) -> Self {
        self.segment_batch_size = size.max(1);
        self
    }

    pub fn with_reasoning(mut self, enabled: bool) -> Self {
        self.reasoning_enabled = enabled;
        self
    }

    pub fn with_distance_adjustment(mut self, offset: f64, multiplier: f64) -> Self {
        self.distance_offset = offset;
        self.distance_multiplier = multiplier;
        self
    }
}

/// Sizing and liveness settings of the worker pools.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    pub embedding_workers: usize,
    pub matching_workers: usize,
    pub heartbeat_interval: Duration,
    pub death_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_retries: u32,
    pub engine_lock_permits: usize,
    pub shutdown_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            embedding_workers: defaults::EMBEDDING_WORKERS,
            matching_workers: defaults::MATCHING_WORKERS,
            heartbeat_interval: Duration::from_millis(defaults::HEARTBEAT_INTERVAL_MS),
            death_timeout: Duration::from_millis(defaults::DEATH_TIMEOUT_MS),
            health_check_interval: Duration::from_millis(defaults::HEALTH_CHECK_INTERVAL_MS),
            max_retries: defaults::JOB_MAX_RETRIES,
            engine_lock_permits: defaults::ENGINE_LOCK_PERMITS,
            shutdown_grace: Duration::from_millis(defaults::SHUTDOWN_GRACE_MS),
        }
    }
}

impl WorkerPoolConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `EMBEDDING_WORKERS` | `2` |
    /// | `MATCHING_WORKERS` | `2` |
    /// | `WORKER_HEARTBEAT_INTERVAL_MS` | `1000` |
    /// | `WORKER_DEATH_TIMEOUT_MS` | `30000` |
    /// | `WORKER_HEALTH_CHECK_INTERVAL_MS` | `10000` |
    /// | `JOB_MAX_RETRIES` | `3` |
    /// | `ENGINE_LOCK_PERMITS` | `1` |
    pub fn from_env() -> Self {
        let d = Self::default();
        let ms = |name: &str, fallback: Duration| {
            env_parse::<u64>(name)
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        Self {
            embedding_workers: env_parse::<usize>("EMBEDDING_WORKERS")
                .unwrap_or(d.embedding_workers)
                .max(1),
            matching_workers: env_parse::<usize>("MATCHING_WORKERS")
                .unwrap_or(d.matching_workers)
                .max(1),
            heartbeat_interval: ms("WORKER_HEARTBEAT_INTERVAL_MS", d.heartbeat_interval),
            death_timeout: ms("WORKER_DEATH_TIMEOUT_MS", d.death_timeout),
            health_check_interval: ms("WORKER_HEALTH_CHECK_INTERVAL_MS", d.health_check_interval),
            max_retries: env_parse("JOB_MAX_RETRIES").unwrap_or(d.max_retries),
            engine_lock_permits: env_parse::<usize>("ENGINE_LOCK_PERMITS")
                .unwrap_or(d.engine_lock_permits)
                .max(1),
            shutdown_grace: d.shutdown_grace,
        }
    }

    pub fn with_workers(mut self, embedding: usize, matching: usize) -> Self {
        self.embedding_workers = embedding.max(1);
        self.matching_workers = matching.max(1);
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, death_timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.death_timeout = death_timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_engine_lock_permits(mut self, permits: usize) -> Self {
        self.engine_lock_permits = permits.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
