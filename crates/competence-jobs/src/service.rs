//! Caller-facing operations: ingest a list, start a match, poll either.
//!
//! Every operation returns once its job row exists; the pipeline runs in
//! the background and callers poll the job.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use competence_core::{
    rank_results, Error, GroupedMatchResults, Ingestion, JobStatus, MatchingTask, RankBy,
    ResourceInput, Result, SearchFilter, StoreHandle,
};

use crate::manager::WorkerManager;
use crate::messages::{JobOutcome, JobSpec};

/// Job id handed back to the caller for polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTicket {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Competence source of a matching request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MatchRequest {
    /// A previously ingested list.
    Existing { list_id: Uuid },
    /// Resources ingested as part of the request.
    Inline { resources: Vec<ResourceInput> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStatus {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Set once the job has completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competence_list_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStatus {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Set once the job has completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<GroupedMatchResults>,
}

/// Entry point of the matcher.
#[derive(Clone)]
pub struct MatchingService {
    store: StoreHandle,
    manager: Arc<WorkerManager>,
}

impl MatchingService {
    pub fn new(store: StoreHandle, manager: Arc<WorkerManager>) -> Self {
        Self { store, manager }
    }

    pub fn manager(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    /// Persist a resource list and embed it in the background.
    #[instrument(skip_all, fields(subsystem = "service", op = "ingest", resource_count = resources.len()))]
    pub async fn ingest(&self, resources: Vec<ResourceInput>) -> Result<JobTicket> {
        let ingestion = self.store.competences.ingest(&resources).await?;
        let ticket = JobTicket {
            job_id: ingestion.job_id,
            status: JobStatus::Pending,
        };
        info!(
            job_id = %ingestion.job_id,
            list_id = %ingestion.list_id,
            text_count = ingestion.tasks.len(),
            "Competence list ingested"
        );

        let this = self.clone();
        tokio::spawn(async move {
            let job_id = ingestion.job_id;
            if let Err(e) = this.embed_list(ingestion).await {
                error!(%job_id, error = %e, "Ingestion failed");
                this.fail(job_id).await;
            }
        });
        Ok(ticket)
    }

    /// Start matching `tasks` against a list.
    #[instrument(skip_all, fields(subsystem = "service", op = "match", task_count = tasks.len()))]
    pub async fn match_list(
        &self,
        request: MatchRequest,
        tasks: Vec<MatchingTask>,
    ) -> Result<JobTicket> {
        if tasks.is_empty() {
            return Err(Error::Validation("tasks must not be empty".into()));
        }
        if tasks.iter().any(|t| t.task_id.trim().is_empty()) {
            return Err(Error::Validation("every task needs a taskId".into()));
        }

        let jobs = &self.store.jobs;
        let (job_id, list_id, ingestion) = match request {
            MatchRequest::Existing { list_id } => {
                if !self.store.competences.list_exists(list_id).await? {
                    return Err(Error::ResourceNotFound(format!(
                        "Competence list {} not found",
                        list_id
                    )));
                }
                (jobs.create(Some(list_id)).await?, list_id, None)
            }
            MatchRequest::Inline { resources } => {
                let ingestion = self.store.competences.ingest(&resources).await?;
                let job_id = jobs.create(Some(ingestion.list_id)).await?;
                jobs.set_status(job_id, JobStatus::Preprocessing).await?;
                (job_id, ingestion.list_id, Some(ingestion))
            }
        };
        info!(%job_id, %list_id, inline = ingestion.is_some(), "Matching job created");

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_match(job_id, list_id, ingestion, tasks).await {
                error!(%job_id, error = %e, "Matching failed");
                this.fail(job_id).await;
                if let Err(e) = this.store.embeddings.delete_task_embeddings(job_id).await {
                    warn!(%job_id, error = %e, "Failed to remove task embeddings");
                }
            }
        });

        Ok(JobTicket {
            job_id,
            status: JobStatus::Pending,
        })
    }

    async fn embed_list(&self, ingestion: Ingestion) -> Result<()> {
        let outcome = self
            .manager
            .submit(JobSpec::EmbedResources {
                job_id: ingestion.job_id,
                list_id: ingestion.list_id,
                tasks: ingestion.tasks,
            })
            .await?;
        expect_success(outcome, "ingestion")
    }

    async fn run_match(
        &self,
        job_id: Uuid,
        list_id: Uuid,
        ingestion: Option<Ingestion>,
        tasks: Vec<MatchingTask>,
    ) -> Result<()> {
        if let Some(ingestion) = ingestion {
            self.embed_list(ingestion).await?;
        }

        let outcome = self
            .manager
            .submit(JobSpec::EmbedTasks {
                job_id,
                tasks: tasks.clone(),
            })
            .await?;
        expect_success(outcome, "task embedding")?;

        let outcome = self
            .manager
            .submit(JobSpec::Match {
                job_id,
                filter: SearchFilter {
                    list_id: Some(list_id),
                    resource_id: None,
                },
                tasks,
            })
            .await?;
        expect_success(outcome, "matching")
    }

    async fn fail(&self, job_id: Uuid) {
        if let Err(e) = self
            .store
            .jobs
            .advance_status(job_id, JobStatus::Failed)
            .await
        {
            error!(%job_id, error = %e, "Failed to mark job as failed");
        }
    }

    async fn job_status(&self, job_id: Uuid) -> Result<(JobStatus, Option<Uuid>)> {
        let job = self
            .store
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| Error::ResourceNotFound(format!("Job {} not found", job_id)))?;
        Ok((job.status, job.reference_id))
    }

    /// Status of an ingestion job, with its list id once completed.
    pub async fn poll_ingestion(&self, job_id: Uuid) -> Result<IngestionStatus> {
        let (status, reference_id) = self.job_status(job_id).await?;
        Ok(IngestionStatus {
            job_id,
            status,
            competence_list_id: reference_id.filter(|_| status == JobStatus::Completed),
        })
    }

    /// Status of a matching job, with ranked results once completed.
    pub async fn poll_match(&self, job_id: Uuid, rank_by: RankBy) -> Result<MatchStatus> {
        let (status, _) = self.job_status(job_id).await?;
        let results = match status {
            JobStatus::Completed => {
                let rows = self.store.matches.get_results(job_id).await?;
                Some(rank_results(&rows, rank_by))
            }
            _ => None,
        };
        Ok(MatchStatus {
            job_id,
            status,
            results,
        })
    }
}

fn expect_success(outcome: JobOutcome, stage: &str) -> Result<()> {
    match outcome {
        JobOutcome::Success => Ok(()),
        JobOutcome::Failed(message) | JobOutcome::Retry(message) => {
            Err(Error::stage(stage, message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_request_serde() {
        let list_id = Uuid::nil();
        let json = serde_json::to_value(MatchRequest::Existing { list_id }).unwrap();
        assert_eq!(json["source"], "existing");
        assert_eq!(json["listId"], list_id.to_string());

        let parsed: MatchRequest =
            serde_json::from_value(serde_json::json!({"source": "inline", "resources": []}))
                .unwrap();
        assert_eq!(parsed, MatchRequest::Inline { resources: vec![] });
    }

    #[test]
    fn test_poll_status_omits_pending_fields() {
        let status = IngestionStatus {
            job_id: Uuid::nil(),
            status: JobStatus::Running,
            competence_list_id: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "running");
        assert!(json.get("competenceListId").is_none());
    }

    #[test]
    fn test_expect_success() {
        assert!(expect_success(JobOutcome::Success, "matching").is_ok());
        let err = expect_success(JobOutcome::Failed("store down".into()), "matching").unwrap_err();
        assert!(matches!(err, Error::PipelineStage { .. }));
    }
}
