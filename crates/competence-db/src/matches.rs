//! Match result repository.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use competence_core::{
    Alignment, EmbeddingType, Error, JobStatus, MatchResult, MatchResultRepository, Result,
};

use crate::atomic::AtomicScope;
use crate::jobs::PgJobRepository;

/// PostgreSQL implementation of MatchResultRepository.
#[derive(Clone)]
pub struct PgMatchResultRepository {
    pool: Pool<Postgres>,
    scope: AtomicScope,
}

impl PgMatchResultRepository {
    pub fn new(pool: Pool<Postgres>, scope: AtomicScope) -> Self {
        Self { pool, scope }
    }
}

#[async_trait]
impl MatchResultRepository for PgMatchResultRepository {
    async fn persist_results_and_complete(
        &self,
        job_id: Uuid,
        results: &[MatchResult],
    ) -> Result<()> {
        let _in_flight = self.scope.enter()?;
        let mut tx = self.scope.begin().await?;

        for result in results {
            sqlx::query(
                "INSERT INTO match_result (job_id, task_id, task_text, list_id, competence_id,
                     resource_id, distance, text, type, alignment, reason)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(job_id)
            .bind(&result.task_id)
            .bind(&result.task_text)
            .bind(result.list_id)
            .bind(&result.competence_id)
            .bind(&result.resource_id)
            .bind(result.distance.clamp(0.0, 1.0))
            .bind(&result.text)
            .bind(result.embedding_type.as_str())
            .bind(result.alignment.as_str())
            .bind(&result.reason)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        PgJobRepository::transition_tx(&mut tx, job_id, JobStatus::Completed, false).await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "matches",
            op = "persist",
            job_id = %job_id,
            result_count = results.len(),
            "Match results persisted, job completed"
        );
        Ok(())
    }

    async fn get_results(&self, job_id: Uuid) -> Result<Vec<MatchResult>> {
        let rows = sqlx::query(
            "SELECT task_id, task_text, list_id, competence_id, resource_id, distance, text,
                    type, alignment, reason
             FROM match_result WHERE job_id = $1 ORDER BY task_id, distance DESC, id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| {
                let embedding_type: String = row.get("type");
                let alignment: String = row.get("alignment");
                Ok(MatchResult {
                    job_id,
                    task_id: row.get("task_id"),
                    task_text: row.get("task_text"),
                    list_id: row.get("list_id"),
                    competence_id: row.get("competence_id"),
                    resource_id: row.get("resource_id"),
                    distance: row.get("distance"),
                    text: row.get("text"),
                    embedding_type: embedding_type.parse::<EmbeddingType>()?,
                    alignment: alignment.parse::<Alignment>()?,
                    reason: row.get("reason"),
                })
            })
            .collect()
    }
}
