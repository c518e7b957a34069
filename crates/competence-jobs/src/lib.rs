//! # competence-jobs
//!
//! Asynchronous job engine of the competence matcher.
//!
//! This crate provides:
//! - Fixed-size worker pools with heartbeats, crash recovery and retries
//! - A shared-engine lock serializing calls into the inference engine
//! - The matching pipeline (segment, embed, search and align, reason, persist)
//! - [`MatchingService`], the caller-facing ingest/match/poll operations
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use competence_db::{Database, PgStoreFactory};
//! use competence_jobs::{MatcherConfig, MatchingService, RemoteModels, WorkerManager, WorkerPoolConfig};
//!
//! let db = Database::connect("postgres://...").await?;
//! let stores = Arc::new(PgStoreFactory::dedicated(url, 768));
//! let manager = WorkerManager::start(
//!     &WorkerPoolConfig::from_env(),
//!     MatcherConfig::from_env(),
//!     Arc::new(RemoteModels::from_env()),
//!     stores.clone(),
//!     stores,
//! );
//! let service = MatchingService::new(db.handle(), Arc::new(manager));
//!
//! let ticket = service.ingest(resources).await?;
//! let status = service.poll_ingestion(ticket.job_id).await?;
//! ```

pub mod config;
pub mod engine_lock;
pub mod handler;
pub mod manager;
pub mod messages;
pub mod pipeline;
pub mod pool;
pub mod scoring;
pub mod service;
mod worker;

// Re-export core types
pub use competence_core::*;

pub use config::{MatcherConfig, WorkerPoolConfig};
pub use engine_lock::{EngineLock, Locked};
pub use handler::{HandlerFactory, JobContext, JobHandler, Reporter};
pub use manager::WorkerManager;
pub use messages::{JobOutcome, JobSpec, PoolMessage, WorkerId, WorkerMessage};
pub use pipeline::{
    EmbedderFactory, EmbedderHandler, MatcherFactory, MatcherHandler, ModelProvider, ModelSet,
    RemoteModels, StaticModels,
};
pub use pool::{PoolSettings, PoolStatus, WorkerPool};
pub use scoring::{adjust, AlignmentSignals, Scored};
pub use service::{IngestionStatus, JobTicket, MatchRequest, MatchStatus, MatchingService};
