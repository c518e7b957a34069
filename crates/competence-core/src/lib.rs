//! # competence-core
//!
//! Core types, traits, and abstractions for the competence matcher.
//!
//! This crate provides the domain model, the error type, the repository and
//! inference traits, and the ranking of match results that the other
//! competence crates depend on.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod ranking;
pub mod store;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use ranking::{rank_results, GroupedMatchResults, RankBy, ResourceRanking, TaskOverview};
pub use store::{StoreFactory, StoreHandle};
pub use traits::*;
