//! # competence-db
//!
//! PostgreSQL + pgvector similarity store for the competence matcher.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for jobs, competence lists, embeddings, and
//!   match results
//! - Scoped atomic operations, one in flight per store instance
//! - An in-memory store with the same semantics for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use competence_db::Database;
//! use competence_core::CompetenceRepository;
//!
//! let db = Database::connect("postgres://localhost/competence").await?;
//! db.migrate().await?;
//! let list_id = db.competences.create_list().await?;
//! ```

pub mod atomic;
pub mod competences;
pub mod embeddings;
pub mod jobs;
pub mod matches;
pub mod memory;
pub mod pool;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use competence_core::{defaults, Result, StoreFactory, StoreHandle};

pub use atomic::AtomicScope;
pub use competences::PgCompetenceRepository;
pub use embeddings::PgEmbeddingRepository;
pub use jobs::PgJobRepository;
pub use matches::PgMatchResultRepository;
pub use memory::{MemoryStore, MemoryStoreFactory};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};

/// One store instance: a connection pool plus repositories sharing an
/// atomic scope.
///
/// Cloning yields a new instance over the same pool, with its own scope.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<Postgres>,
    pub jobs: PgJobRepository,
    pub competences: PgCompetenceRepository,
    pub embeddings: PgEmbeddingRepository,
    pub matches: PgMatchResultRepository,
    scope: AtomicScope,
    dimension: usize,
}

impl Database {
    /// Create a store instance over an existing pool.
    pub fn new(pool: sqlx::Pool<Postgres>, dimension: usize) -> Self {
        let scope = AtomicScope::new(pool.clone());
        Self {
            jobs: PgJobRepository::new(pool.clone(), scope.clone()),
            competences: PgCompetenceRepository::new(pool.clone(), scope.clone()),
            embeddings: PgEmbeddingRepository::new(pool.clone(), dimension),
            matches: PgMatchResultRepository::new(pool.clone(), scope.clone()),
            pool,
            scope,
            dimension,
        }
    }

    /// Connect with the default pool and embedding dimension.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool, defaults::EMBED_DIMENSION))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig, dimension: usize) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool, dimension))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| competence_core::Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<Postgres> {
        &self.pool
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Run `f` as one all-or-nothing transaction on this store instance.
    ///
    /// Fails with `Error::TransactionInProgress` while another atomic
    /// operation of this instance is running.
    pub async fn atomic<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(
            &'a mut Transaction<'static, Postgres>,
        ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>,
    {
        self.scope.execute(f).await
    }

    /// Whether an atomic operation of this instance is open.
    pub fn in_transaction(&self) -> bool {
        self.scope.is_active()
    }

    /// View this instance through the repository traits.
    pub fn handle(&self) -> StoreHandle {
        StoreHandle {
            jobs: std::sync::Arc::new(self.jobs.clone()),
            competences: std::sync::Arc::new(self.competences.clone()),
            embeddings: std::sync::Arc::new(self.embeddings.clone()),
            matches: std::sync::Arc::new(self.matches.clone()),
        }
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone(), self.dimension)
    }
}

/// Where a [`PgStoreFactory`] gets its connections.
#[derive(Clone)]
enum Source {
    /// Each `open` connects a dedicated single-connection pool.
    Dedicated { url: String, dimension: usize },
    /// Each `open` returns a fresh instance over a shared pool.
    Shared(Database),
}

/// [`StoreFactory`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStoreFactory {
    source: Source,
}

impl PgStoreFactory {
    /// One connection per opened store, for workers.
    pub fn dedicated(url: impl Into<String>, dimension: usize) -> Self {
        Self {
            source: Source::Dedicated {
                url: url.into(),
                dimension,
            },
        }
    }

    /// New instances over an existing pool, for request handling.
    pub fn shared(db: Database) -> Self {
        Self {
            source: Source::Shared(db),
        }
    }
}

#[async_trait]
impl StoreFactory for PgStoreFactory {
    async fn open(&self) -> Result<StoreHandle> {
        match &self.source {
            Source::Dedicated { url, dimension } => {
                let db = Database::connect_with_config(url, PoolConfig::dedicated(), *dimension)
                    .await?;
                Ok(db.handle())
            }
            Source::Shared(db) => Ok(db.clone().handle()),
        }
    }
}
