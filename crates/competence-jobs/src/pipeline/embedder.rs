//! Embedder pool handler: resource ingestion and task pre-embedding.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use competence_core::{
    check_dimension, EmbeddingBackend, EmbeddingTask, Error, JobStatus, MatchingTask, Result,
    Vector, WorkerType,
};
use competence_inference::Segmenter;

use crate::config::MatcherConfig;
use crate::handler::{JobContext, JobHandler};
use crate::messages::{JobOutcome, JobSpec};

use super::fail_job;
use super::segmentation::segment_tasks;

/// Runs [`JobSpec::EmbedResources`] and [`JobSpec::EmbedTasks`].
pub struct EmbedderHandler {
    embedding: Arc<dyn EmbeddingBackend>,
    segmenter: Option<Segmenter>,
    config: MatcherConfig,
}

/// Items embedded and items skipped by one job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbedCounts {
    pub embedded: usize,
    pub failed: usize,
}

impl EmbedderHandler {
    pub fn new(
        embedding: Arc<dyn EmbeddingBackend>,
        segmenter: Option<Segmenter>,
        config: MatcherConfig,
    ) -> Self {
        Self {
            embedding,
            segmenter,
            config,
        }
    }

    async fn embed_one(&self, text: &str, dimension: usize) -> Result<Vector> {
        let vector = self
            .embedding
            .embed_texts(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::stage("embedding", "backend returned no vector"))?;
        check_dimension(vector.as_slice(), dimension)?;
        Ok(vector)
    }

    /// `pending → preprocessing → running → completed`.
    #[instrument(skip_all, fields(subsystem = "jobs", component = "embedder", op = "embed_resources", %job_id, %list_id))]
    async fn embed_resources(
        &self,
        ctx: &JobContext,
        job_id: Uuid,
        list_id: Uuid,
        tasks: Vec<EmbeddingTask>,
    ) -> Result<Option<EmbedCounts>> {
        let jobs = &ctx.store.jobs;
        if jobs.advance_status(job_id, JobStatus::Preprocessing).await?.is_terminal() {
            return Ok(None);
        }
        ctx.reporter.status(JobStatus::Preprocessing);

        let tasks = match &self.segmenter {
            Some(segmenter) => segment_tasks(segmenter, tasks, &self.config, &ctx.reporter).await,
            None => tasks,
        };

        jobs.advance_status(job_id, JobStatus::Running).await?;
        ctx.reporter.status(JobStatus::Running);

        let dimension = ctx.store.embeddings.dimension();
        let mut counts = EmbedCounts::default();
        for task in &tasks {
            let stored = match self.embed_one(&task.text, dimension).await {
                Ok(vector) => ctx.store.embeddings.upsert_embedding(task, &vector).await,
                Err(e) => Err(e),
            };
            match stored {
                Ok(()) => counts.embedded += 1,
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => {
                    counts.failed += 1;
                    warn!(
                        competence_id = %task.competence_id,
                        error = %e,
                        "Embedding failed, skipping text"
                    );
                    ctx.reporter
                        .error(format!("embedding of {} failed: {}", task.competence_id, e));
                }
            }
        }

        jobs.advance_status(job_id, JobStatus::Completed).await?;
        Ok(Some(counts))
    }

    /// `pending → preprocessing → pending`, with task embeddings stored.
    #[instrument(skip_all, fields(subsystem = "jobs", component = "embedder", op = "embed_tasks", %job_id))]
    async fn embed_tasks(
        &self,
        ctx: &JobContext,
        job_id: Uuid,
        tasks: &[MatchingTask],
    ) -> Result<Option<EmbedCounts>> {
        let jobs = &ctx.store.jobs;
        let status = jobs.advance_status(job_id, JobStatus::Preprocessing).await?;
        if status != JobStatus::Preprocessing {
            if status.is_terminal() {
                return Ok(None);
            }
            // Already handed to the match stage by an earlier attempt.
            return Ok(Some(EmbedCounts::default()));
        }
        ctx.reporter.status(JobStatus::Preprocessing);

        let dimension = ctx.store.embeddings.dimension();
        let mut counts = EmbedCounts::default();
        for task in tasks {
            let Some(text) = task.text() else {
                debug!(task_id = %task.task_id, "Task has no description, not embedded");
                continue;
            };
            let stored = match self.embed_one(text, dimension).await {
                Ok(vector) => {
                    ctx.store
                        .embeddings
                        .upsert_task_embedding(job_id, &task.task_id, &vector)
                        .await
                }
                Err(e) => Err(e),
            };
            match stored {
                Ok(()) => counts.embedded += 1,
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => {
                    counts.failed += 1;
                    warn!(task_id = %task.task_id, error = %e, "Task embedding failed");
                    ctx.reporter
                        .error(format!("embedding of task {} failed: {}", task.task_id, e));
                }
            }
        }

        jobs.set_status(job_id, JobStatus::Pending).await?;
        ctx.reporter.status(JobStatus::Pending);
        Ok(Some(counts))
    }
}

#[async_trait]
impl JobHandler for EmbedderHandler {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Embedder
    }

    async fn execute(&self, ctx: JobContext) -> JobOutcome {
        let start = Instant::now();
        let job_id = ctx.job_id();
        let result = match &ctx.spec {
            JobSpec::EmbedResources {
                list_id, tasks, ..
            } => {
                self.embed_resources(&ctx, job_id, *list_id, tasks.clone())
                    .await
            }
            JobSpec::EmbedTasks { tasks, .. } => self.embed_tasks(&ctx, job_id, tasks).await,
            JobSpec::Match { .. } => Err(Error::Internal(
                "match jobs run on the matcher pool".into(),
            )),
        };

        match result {
            Ok(Some(counts)) => {
                info!(
                    %job_id,
                    kind = ctx.spec.kind(),
                    embedded = counts.embedded,
                    failed = counts.failed,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Embedding job finished"
                );
                JobOutcome::Success
            }
            Ok(None) => {
                warn!(%job_id, "Job already finished, nothing to do");
                JobOutcome::Failed("job already finished".into())
            }
            Err(e) => fail_job(&ctx, job_id, &e).await,
        }
    }
}
