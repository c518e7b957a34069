//! Store handles passed to the pipeline and service.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::traits::{
    CompetenceRepository, EmbeddingRepository, JobRepository, MatchResultRepository,
};

/// One store instance, seen through its repository traits.
#[derive(Clone)]
pub struct StoreHandle {
    pub jobs: Arc<dyn JobRepository>,
    pub competences: Arc<dyn CompetenceRepository>,
    pub embeddings: Arc<dyn EmbeddingRepository>,
    pub matches: Arc<dyn MatchResultRepository>,
}

impl StoreHandle {
    /// Build a handle from a type implementing every repository trait.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: JobRepository
            + CompetenceRepository
            + EmbeddingRepository
            + MatchResultRepository
            + 'static,
    {
        Self {
            jobs: store.clone(),
            competences: store.clone(),
            embeddings: store.clone(),
            matches: store,
        }
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("dimension", &self.embeddings.dimension())
            .finish_non_exhaustive()
    }
}

/// Opens store instances.
///
/// Workers call [`StoreFactory::open`] once, before their first job, so
/// that each holds its own connection.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open(&self) -> Result<StoreHandle>;
}
