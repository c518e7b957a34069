//! Resource list, resource, and competence repository.
//!
//! Every delete removes dependent embeddings explicitly in the same
//! transaction before the owning rows go.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use competence_core::{
    Competence, CompetenceInput, CompetenceRepository, CompetenceUpdate, EmbeddingTask,
    EmbeddingType, Error, Ingestion, ResourceInput, ResourceListView, ResourceUpdate,
    ResourceView, Result,
};

use crate::atomic::AtomicScope;
use crate::jobs::PgJobRepository;

const COMPETENCE_COLUMNS: &str = "r.list_id, r.resource_id, c.competence_id, c.name, \
     c.description, c.external_qualification_needed, c.renew_time, c.proficiency_level, \
     c.qualification_dates, c.last_usages";

/// PostgreSQL implementation of CompetenceRepository.
#[derive(Clone)]
pub struct PgCompetenceRepository {
    pool: Pool<Postgres>,
    scope: AtomicScope,
}

/// Map a unique-key violation to a validation error naming the entity.
fn conflict(e: sqlx::Error, what: impl FnOnce() -> String) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Validation(format!("{} already exists", what()))
        }
        _ => Error::Database(e),
    }
}

impl PgCompetenceRepository {
    pub fn new(pool: Pool<Postgres>, scope: AtomicScope) -> Self {
        Self { pool, scope }
    }

    fn parse_competence_row(row: &PgRow) -> Competence {
        let dates: Json<Vec<String>> = row.get("qualification_dates");
        let usages: Json<Vec<String>> = row.get("last_usages");
        Competence {
            list_id: row.get("list_id"),
            resource_id: row.get("resource_id"),
            competence_id: row.get("competence_id"),
            name: row.get("name"),
            description: row.get("description"),
            external_qualification_needed: row.get("external_qualification_needed"),
            renew_time: row.get("renew_time"),
            proficiency_level: row.get("proficiency_level"),
            qualification_dates: dates.0,
            last_usages: usages.0,
        }
    }

    async fn resource_rid_tx(
        tx: &mut Transaction<'_, Postgres>,
        list_id: Uuid,
        resource_id: &str,
    ) -> Result<i64> {
        sqlx::query_scalar("SELECT rid FROM resource WHERE list_id = $1 AND resource_id = $2")
            .bind(list_id)
            .bind(resource_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| {
                Error::ResourceNotFound(format!("resource {} in list {}", resource_id, list_id))
            })
    }

    async fn competence_cid_tx(
        tx: &mut Transaction<'_, Postgres>,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT c.cid FROM competence c JOIN resource r ON r.rid = c.resource_rid
             WHERE r.list_id = $1 AND r.resource_id = $2 AND c.competence_id = $3",
        )
        .bind(list_id)
        .bind(resource_id)
        .bind(competence_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| {
            Error::ResourceNotFound(format!(
                "competence {} of resource {} in list {}",
                competence_id, resource_id, list_id
            ))
        })
    }

    async fn insert_resource_tx(
        tx: &mut Transaction<'_, Postgres>,
        list_id: Uuid,
        resource_id: Option<String>,
    ) -> Result<(i64, String)> {
        let resource_id = resource_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let rid: i64 = sqlx::query_scalar(
            "INSERT INTO resource (resource_id, list_id) VALUES ($1, $2) RETURNING rid",
        )
        .bind(&resource_id)
        .bind(list_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| conflict(e, || format!("resource {} in list {}", resource_id, list_id)))?;
        Ok((rid, resource_id))
    }

    async fn insert_competence_tx(
        tx: &mut Transaction<'_, Postgres>,
        rid: i64,
        input: &CompetenceInput,
    ) -> Result<String> {
        let competence_id = input
            .competence_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        sqlx::query(
            "INSERT INTO competence (competence_id, resource_rid, name, description,
                 external_qualification_needed, renew_time, proficiency_level,
                 qualification_dates, last_usages)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&competence_id)
        .bind(rid)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.external_qualification_needed.unwrap_or(false))
        .bind(input.renew_time)
        .bind(&input.proficiency_level)
        .bind(Json(input.qualification_dates.clone().unwrap_or_default()))
        .bind(Json(input.last_usages.clone().unwrap_or_default()))
        .execute(&mut **tx)
        .await
        .map_err(|e| conflict(e, || format!("competence {}", competence_id)))?;
        Ok(competence_id)
    }

    async fn load_competences(
        &self,
        list_id: Uuid,
        resource_id: Option<&str>,
    ) -> Result<Vec<Competence>> {
        let query = format!(
            "SELECT {} FROM competence c JOIN resource r ON r.rid = c.resource_rid
             WHERE r.list_id = $1 AND ($2::text IS NULL OR r.resource_id = $2)
             ORDER BY r.rid, c.cid",
            COMPETENCE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(list_id)
            .bind(resource_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.iter().map(Self::parse_competence_row).collect())
    }
}

/// Reject submitted resources that cannot be stored as one consistent list.
pub(crate) fn validate_ingestion(resources: &[ResourceInput]) -> Result<()> {
    let mut seen_resources = std::collections::HashSet::new();
    for (i, resource) in resources.iter().enumerate() {
        let rid = resource
            .resource_id
            .as_deref()
            .ok_or_else(|| Error::Validation(format!("resource at index {} has no resourceId", i)))?;
        if !seen_resources.insert(rid) {
            return Err(Error::Validation(format!("duplicate resourceId {}", rid)));
        }
        let mut seen_competences = std::collections::HashSet::new();
        for (j, competence) in resource.competencies.iter().enumerate() {
            let cid = competence.competence_id.as_deref().ok_or_else(|| {
                Error::Validation(format!(
                    "competence at index {} of resource {} has no competenceId",
                    j, rid
                ))
            })?;
            if !seen_competences.insert(cid) {
                return Err(Error::Validation(format!(
                    "duplicate competenceId {} in resource {}",
                    cid, rid
                )));
            }
        }
    }
    Ok(())
}

/// Description texts to embed for an ingested list.
pub(crate) fn description_tasks(list_id: Uuid, resources: &[ResourceInput]) -> Vec<EmbeddingTask> {
    resources
        .iter()
        .flat_map(|resource| {
            let resource_id = resource.resource_id.clone().unwrap_or_default();
            resource.competencies.iter().filter_map(move |c| {
                let text = c.description.as_deref()?.trim();
                if text.is_empty() {
                    return None;
                }
                Some(EmbeddingTask {
                    list_id,
                    resource_id: resource_id.clone(),
                    competence_id: c.competence_id.clone().unwrap_or_default(),
                    text: text.to_string(),
                    embedding_type: EmbeddingType::Description,
                })
            })
        })
        .collect()
}

#[async_trait]
impl CompetenceRepository for PgCompetenceRepository {
    async fn create_list(&self) -> Result<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO resource_list (id) VALUES ($1)")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(id)
    }

    async fn delete_list(&self, list_id: Uuid) -> Result<()> {
        let _in_flight = self.scope.enter()?;
        let mut tx = self.scope.begin().await?;

        let purged = sqlx::query(
            "DELETE FROM competence_embedding WHERE cid IN (
                 SELECT c.cid FROM competence c JOIN resource r ON r.rid = c.resource_rid
                 WHERE r.list_id = $1)",
        )
        .bind(list_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();
        let results_purged = sqlx::query("DELETE FROM match_result WHERE list_id = $1")
            .bind(list_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        sqlx::query(
            "DELETE FROM competence WHERE resource_rid IN (
                 SELECT rid FROM resource WHERE list_id = $1)",
        )
        .bind(list_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
        sqlx::query("DELETE FROM resource WHERE list_id = $1")
            .bind(list_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        let deleted = sqlx::query("DELETE FROM resource_list WHERE id = $1")
            .bind(list_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();
        if deleted == 0 {
            return Err(Error::ResourceNotFound(format!("list {}", list_id)));
        }

        tx.commit().await.map_err(Error::Database)?;
        info!(
            subsystem = "db",
            component = "competences",
            op = "delete_list",
            list_id = %list_id,
            embeddings_purged = purged,
            results_purged,
            "Resource list deleted"
        );
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>> {
        sqlx::query_scalar("SELECT id FROM resource_list ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn list_exists(&self, list_id: Uuid) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM resource_list WHERE id = $1)")
            .bind(list_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn get_list(&self, list_id: Uuid) -> Result<ResourceListView> {
        if !self.list_exists(list_id).await? {
            return Err(Error::ResourceNotFound(format!("list {}", list_id)));
        }
        let resource_ids: Vec<String> =
            sqlx::query_scalar("SELECT resource_id FROM resource WHERE list_id = $1 ORDER BY rid")
                .bind(list_id)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::Database)?;
        let mut competences = self.load_competences(list_id, None).await?;

        let resources = resource_ids
            .into_iter()
            .map(|resource_id| {
                let (mine, rest): (Vec<_>, Vec<_>) = competences
                    .drain(..)
                    .partition(|c| c.resource_id == resource_id);
                competences = rest;
                ResourceView {
                    resource_id,
                    competencies: mine,
                }
            })
            .collect();

        Ok(ResourceListView { list_id, resources })
    }

    async fn add_resource(&self, list_id: Uuid, resource_id: Option<String>) -> Result<String> {
        if !self.list_exists(list_id).await? {
            return Err(Error::ResourceNotFound(format!("list {}", list_id)));
        }
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let (_, resource_id) = Self::insert_resource_tx(&mut tx, list_id, resource_id).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(resource_id)
    }

    async fn update_resource(
        &self,
        list_id: Uuid,
        resource_id: &str,
        update: ResourceUpdate,
    ) -> Result<()> {
        let _in_flight = self.scope.enter()?;
        let mut tx = self.scope.begin().await?;
        let rid = Self::resource_rid_tx(&mut tx, list_id, resource_id).await?;

        if let Some(new_list_id) = update.new_list_id {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM resource_list WHERE id = $1)")
                    .bind(new_list_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
            if !exists {
                return Err(Error::ResourceNotFound(format!("list {}", new_list_id)));
            }
        }

        let target_list = update.new_list_id.unwrap_or(list_id);
        let target_id = update
            .new_resource_id
            .clone()
            .unwrap_or_else(|| resource_id.to_string());
        sqlx::query("UPDATE resource SET list_id = $2, resource_id = $3 WHERE rid = $1")
            .bind(rid)
            .bind(target_list)
            .bind(&target_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| conflict(e, || format!("resource {} in list {}", target_id, target_list)))?;
        sqlx::query(
            "UPDATE match_result SET list_id = $3, resource_id = $4
             WHERE list_id = $1 AND resource_id = $2",
        )
        .bind(list_id)
        .bind(resource_id)
        .bind(target_list)
        .bind(&target_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_resource(&self, list_id: Uuid, resource_id: &str) -> Result<()> {
        let _in_flight = self.scope.enter()?;
        let mut tx = self.scope.begin().await?;
        let rid = Self::resource_rid_tx(&mut tx, list_id, resource_id).await?;

        sqlx::query(
            "DELETE FROM competence_embedding
             WHERE cid IN (SELECT cid FROM competence WHERE resource_rid = $1)",
        )
        .bind(rid)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
        sqlx::query("DELETE FROM match_result WHERE list_id = $1 AND resource_id = $2")
            .bind(list_id)
            .bind(resource_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query("DELETE FROM competence WHERE resource_rid = $1")
            .bind(rid)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query("DELETE FROM resource WHERE rid = $1")
            .bind(rid)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn get_resource(&self, list_id: Uuid, resource_id: &str) -> Result<ResourceView> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM resource WHERE list_id = $1 AND resource_id = $2)",
        )
        .bind(list_id)
        .bind(resource_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        if !exists {
            return Err(Error::ResourceNotFound(format!(
                "resource {} in list {}",
                resource_id, list_id
            )));
        }
        Ok(ResourceView {
            resource_id: resource_id.to_string(),
            competencies: self.load_competences(list_id, Some(resource_id)).await?,
        })
    }

    async fn add_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        input: &CompetenceInput,
    ) -> Result<String> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let rid = Self::resource_rid_tx(&mut tx, list_id, resource_id).await?;
        let competence_id = Self::insert_competence_tx(&mut tx, rid, input).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(competence_id)
    }

    async fn update_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
        update: &CompetenceUpdate,
    ) -> Result<Competence> {
        let _in_flight = self.scope.enter()?;
        let mut tx = self.scope.begin().await?;
        let cid = Self::competence_cid_tx(&mut tx, list_id, resource_id, competence_id).await?;

        if !update.is_empty() {
            sqlx::query(
                "UPDATE competence SET
                     name = COALESCE($2, name),
                     description = COALESCE($3, description),
                     external_qualification_needed = COALESCE($4, external_qualification_needed),
                     renew_time = COALESCE($5, renew_time),
                     proficiency_level = COALESCE($6, proficiency_level),
                     qualification_dates = COALESCE($7, qualification_dates),
                     last_usages = COALESCE($8, last_usages)
                 WHERE cid = $1",
            )
            .bind(cid)
            .bind(&update.name)
            .bind(&update.description)
            .bind(update.external_qualification_needed)
            .bind(update.renew_time)
            .bind(&update.proficiency_level)
            .bind(update.qualification_dates.clone().map(Json))
            .bind(update.last_usages.clone().map(Json))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        let stale: Vec<String> = update
            .stale_embedding_types()
            .into_iter()
            .map(|t| t.as_str().to_string())
            .collect();
        if !stale.is_empty() {
            let purged = sqlx::query(
                "DELETE FROM competence_embedding WHERE cid = $1 AND type = ANY($2)",
            )
            .bind(cid)
            .bind(&stale)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();
            debug!(
                subsystem = "db",
                component = "competences",
                competence_id = %competence_id,
                purged,
                "Purged stale embeddings after competence update"
            );
        }

        let query = format!(
            "SELECT {} FROM competence c JOIN resource r ON r.rid = c.resource_rid WHERE c.cid = $1",
            COMPETENCE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(cid)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;
        let competence = Self::parse_competence_row(&row);

        tx.commit().await.map_err(Error::Database)?;
        Ok(competence)
    }

    async fn delete_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<()> {
        let _in_flight = self.scope.enter()?;
        let mut tx = self.scope.begin().await?;
        let cid = Self::competence_cid_tx(&mut tx, list_id, resource_id, competence_id).await?;

        sqlx::query("DELETE FROM competence_embedding WHERE cid = $1")
            .bind(cid)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query(
            "DELETE FROM match_result
             WHERE list_id = $1 AND resource_id = $2 AND competence_id = $3",
        )
        .bind(list_id)
        .bind(resource_id)
        .bind(competence_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
        sqlx::query("DELETE FROM competence WHERE cid = $1")
            .bind(cid)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn get_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<Competence> {
        let query = format!(
            "SELECT {} FROM competence c JOIN resource r ON r.rid = c.resource_rid
             WHERE r.list_id = $1 AND r.resource_id = $2 AND c.competence_id = $3",
            COMPETENCE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(list_id)
            .bind(resource_id)
            .bind(competence_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| {
                Error::ResourceNotFound(format!(
                    "competence {} of resource {} in list {}",
                    competence_id, resource_id, list_id
                ))
            })?;
        Ok(Self::parse_competence_row(&row))
    }

    async fn ingest(&self, resources: &[ResourceInput]) -> Result<Ingestion> {
        validate_ingestion(resources)?;

        let _in_flight = self.scope.enter()?;
        let mut tx = self.scope.begin().await?;

        let list_id = Uuid::now_v7();
        sqlx::query("INSERT INTO resource_list (id) VALUES ($1)")
            .bind(list_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for resource in resources {
            let (rid, _) =
                Self::insert_resource_tx(&mut tx, list_id, resource.resource_id.clone()).await?;
            for competence in &resource.competencies {
                Self::insert_competence_tx(&mut tx, rid, competence).await?;
            }
        }

        let job_id = PgJobRepository::create_tx(&mut tx, Some(list_id)).await?;
        tx.commit().await.map_err(Error::Database)?;

        let tasks = description_tasks(list_id, resources);
        info!(
            subsystem = "db",
            component = "competences",
            op = "ingest",
            list_id = %list_id,
            job_id = %job_id,
            resource_count = resources.len(),
            task_count = tasks.len(),
            "Resource list stored"
        );
        Ok(Ingestion {
            list_id,
            job_id,
            tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn competence(id: Option<&str>, description: Option<&str>) -> CompetenceInput {
        CompetenceInput {
            competence_id: id.map(String::from),
            description: description.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_ingestion_requires_ids() {
        let missing_resource = vec![ResourceInput {
            resource_id: None,
            competencies: vec![],
        }];
        assert!(matches!(
            validate_ingestion(&missing_resource),
            Err(Error::Validation(_))
        ));

        let missing_competence = vec![ResourceInput {
            resource_id: Some("r-1".into()),
            competencies: vec![competence(None, Some("x"))],
        }];
        let err = validate_ingestion(&missing_competence).unwrap_err();
        assert!(err.to_string().contains("competenceId"));
    }

    #[test]
    fn test_validate_ingestion_rejects_duplicates() {
        let dup = vec![ResourceInput {
            resource_id: Some("r-1".into()),
            competencies: vec![competence(Some("c"), None), competence(Some("c"), None)],
        }];
        assert!(validate_ingestion(&dup).is_err());
    }

    #[test]
    fn test_description_tasks_skip_blank() {
        let list_id = Uuid::new_v4();
        let resources = vec![
            ResourceInput {
                resource_id: Some("r-1".into()),
                competencies: vec![
                    competence(Some("c-1"), Some("  Operates CNC mills  ")),
                    competence(Some("c-2"), None),
                ],
            },
            ResourceInput {
                resource_id: Some("r-2".into()),
                competencies: vec![competence(Some("c-3"), Some("   "))],
            },
        ];
        let tasks = description_tasks(list_id, &resources);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].text, "Operates CNC mills");
        assert_eq!(tasks[0].embedding_type, EmbeddingType::Description);
        assert_eq!(tasks[0].resource_id, "r-1");
    }
}
