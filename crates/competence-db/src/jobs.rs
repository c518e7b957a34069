//! Job repository implementation.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use competence_core::{Error, Job, JobRepository, JobStatus, Result};

use crate::atomic::AtomicScope;

/// PostgreSQL implementation of JobRepository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
    scope: AtomicScope,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>, scope: AtomicScope) -> Self {
        Self { pool, scope }
    }

    fn parse_job_row(row: PgRow) -> Result<Job> {
        let status: String = row.get("status");
        Ok(Job {
            id: row.get("id"),
            status: status.parse()?,
            reference_id: row.get("reference_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Insert a pending job inside a caller's transaction.
    pub async fn create_tx(
        tx: &mut Transaction<'_, Postgres>,
        reference_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO job (id, status, reference_id) VALUES ($1, 'pending', $2)")
            .bind(id)
            .bind(reference_id)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(id)
    }

    /// Lock the job row and move it to `next`.
    ///
    /// With `forward_only`, a job already at or past `next` is left alone;
    /// otherwise an illegal move is an [`Error::InvalidTransition`].
    pub async fn transition_tx(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        next: JobStatus,
        forward_only: bool,
    ) -> Result<JobStatus> {
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM job WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(Error::Database)?;
        let current: JobStatus = current
            .ok_or_else(|| Error::ResourceNotFound(format!("job {}", id)))?
            .parse()?;

        if forward_only && current.advance_satisfied(next) {
            debug!(
                subsystem = "db",
                component = "jobs",
                job_id = %id,
                current = %current,
                target = %next,
                "Job already advanced, status unchanged"
            );
            return Ok(current);
        }
        if !current.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: current,
                to: next,
            });
        }

        sqlx::query("UPDATE job SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(next.as_str())
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(next)
    }

    async fn transition(&self, id: Uuid, next: JobStatus, forward_only: bool) -> Result<JobStatus> {
        let _in_flight = self.scope.enter()?;
        let mut tx = self.scope.begin().await?;
        let status = Self::transition_tx(&mut tx, id, next, forward_only).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(status)
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, reference_id: Option<Uuid>) -> Result<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO job (id, status, reference_id) VALUES ($1, 'pending', $2)")
            .bind(id)
            .bind(reference_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, status, reference_id, created_at, updated_at FROM job WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        self.transition(id, status, false).await.map(|_| ())
    }

    async fn advance_status(&self, id: Uuid, status: JobStatus) -> Result<JobStatus> {
        self.transition(id, status, true).await
    }
}
