//! Competence and task embedding repository with metric-aware search.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, trace};
use uuid::Uuid;

use competence_core::{
    check_dimension, DistanceMetric, EmbeddingRepository, EmbeddingTask, EmbeddingType, Error,
    Result, SearchFilter, SearchHit, SearchOptions, Vector,
};

/// PostgreSQL implementation of EmbeddingRepository.
#[derive(Clone)]
pub struct PgEmbeddingRepository {
    pool: Pool<Postgres>,
    dimension: usize,
}

impl PgEmbeddingRepository {
    pub fn new(pool: Pool<Postgres>, dimension: usize) -> Self {
        Self { pool, dimension }
    }

    /// SQL expression yielding the raw distance between `e.vector` and `$1`.
    ///
    /// Hamming compares binary-quantized vectors and divides the bit distance
    /// by the dimension so the raw value lies in `[0, 1]`.
    fn distance_expr(metric: DistanceMetric, dimension: usize) -> String {
        match metric {
            DistanceMetric::Cosine => "(e.vector <=> $1::vector)".to_string(),
            DistanceMetric::Euclidean => "(e.vector <-> $1::vector)".to_string(),
            DistanceMetric::Hamming => format!(
                "((binary_quantize(e.vector) <~> binary_quantize($1::vector)) / {}::float8)",
                dimension.max(1)
            ),
        }
    }
}

#[async_trait]
impl EmbeddingRepository for PgEmbeddingRepository {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert_embedding(&self, task: &EmbeddingTask, vector: &Vector) -> Result<()> {
        check_dimension(vector.as_slice(), self.dimension)?;

        let result = sqlx::query(
            "INSERT INTO competence_embedding (cid, text, type, vector)
             SELECT c.cid, $4, $5, $6 FROM competence c
             JOIN resource r ON r.rid = c.resource_rid
             WHERE r.list_id = $1 AND r.resource_id = $2 AND c.competence_id = $3
             ON CONFLICT (cid, type, text) DO UPDATE SET vector = EXCLUDED.vector",
        )
        .bind(task.list_id)
        .bind(&task.resource_id)
        .bind(&task.competence_id)
        .bind(&task.text)
        .bind(task.embedding_type.as_str())
        .bind(vector)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ResourceNotFound(format!(
                "competence {} of resource {} in list {}",
                task.competence_id, task.resource_id, task.list_id
            )));
        }
        trace!(
            subsystem = "db",
            component = "embeddings",
            competence_id = %task.competence_id,
            embedding_type = %task.embedding_type,
            "Embedding upserted"
        );
        Ok(())
    }

    async fn delete_embeddings_for_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM competence_embedding WHERE cid IN (
                 SELECT c.cid FROM competence c JOIN resource r ON r.rid = c.resource_rid
                 WHERE r.list_id = $1 AND r.resource_id = $2 AND c.competence_id = $3)",
        )
        .bind(list_id)
        .bind(resource_id)
        .bind(competence_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn count_embeddings(&self, filter: &SearchFilter) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM competence_embedding e
             JOIN competence c ON c.cid = e.cid
             JOIN resource r ON r.rid = c.resource_rid
             WHERE ($1::uuid IS NULL OR r.list_id = $1)
               AND ($2::text IS NULL OR r.resource_id = $2)",
        )
        .bind(filter.list_id)
        .bind(&filter.resource_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn search(&self, vector: &Vector, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        options.validate()?;
        check_dimension(vector.as_slice(), self.dimension)?;

        let query = format!(
            "SELECT r.list_id, r.resource_id, c.competence_id, e.text, e.type,
                    {} AS raw_distance
             FROM competence_embedding e
             JOIN competence c ON c.cid = e.cid
             JOIN resource r ON r.rid = c.resource_rid
             WHERE ($2::uuid IS NULL OR r.list_id = $2)
               AND ($3::text IS NULL OR r.resource_id = $3)
             ORDER BY raw_distance ASC, e.id
             LIMIT $4",
            Self::distance_expr(options.metric, self.dimension)
        );

        let rows = sqlx::query(&query)
            .bind(vector)
            .bind(options.filter.list_id)
            .bind(&options.filter.resource_id)
            .bind(options.k)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let hits = rows
            .into_iter()
            .map(|row| {
                let embedding_type: String = row.get("type");
                let raw_distance: f64 = row.get("raw_distance");
                Ok(SearchHit {
                    list_id: row.get("list_id"),
                    resource_id: row.get("resource_id"),
                    competence_id: row.get("competence_id"),
                    text: row.get("text"),
                    embedding_type: embedding_type.parse::<EmbeddingType>()?,
                    raw_distance,
                    similarity: options.metric.normalize(raw_distance, self.dimension),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            subsystem = "db",
            component = "embeddings",
            op = "search",
            metric = %options.metric,
            k = ?options.k,
            result_count = hits.len(),
            "Vector search complete"
        );
        Ok(hits)
    }

    async fn upsert_task_embedding(
        &self,
        job_id: Uuid,
        task_id: &str,
        vector: &Vector,
    ) -> Result<()> {
        check_dimension(vector.as_slice(), self.dimension)?;
        sqlx::query(
            "INSERT INTO task_embedding (job_id, task_id, vector) VALUES ($1, $2, $3)
             ON CONFLICT (job_id, task_id) DO UPDATE SET vector = EXCLUDED.vector",
        )
        .bind(job_id)
        .bind(task_id)
        .bind(vector)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_task_embedding(&self, job_id: Uuid, task_id: &str) -> Result<Option<Vector>> {
        sqlx::query_scalar("SELECT vector FROM task_embedding WHERE job_id = $1 AND task_id = $2")
            .bind(job_id)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn delete_task_embeddings(&self, job_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM task_embedding WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_expr_operators() {
        assert!(PgEmbeddingRepository::distance_expr(DistanceMetric::Cosine, 768).contains("<=>"));
        assert!(
            PgEmbeddingRepository::distance_expr(DistanceMetric::Euclidean, 768).contains("<->")
        );
        let hamming = PgEmbeddingRepository::distance_expr(DistanceMetric::Hamming, 768);
        assert!(hamming.contains("binary_quantize"));
        assert!(hamming.contains("/ 768::float8"));
    }
}
