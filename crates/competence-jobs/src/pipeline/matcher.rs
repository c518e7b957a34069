//! Matcher pool handler: search, alignment, reasoning and persistence.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use competence_core::{
    check_dimension, Error, JobStatus, MatchResult, MatchingTask, Result, SearchFilter,
    SearchOptions, WorkerType,
};
use competence_inference::{AlignmentAnalyzer, Reasoner};

use crate::config::MatcherConfig;
use crate::handler::{JobContext, JobHandler};
use crate::messages::{JobOutcome, JobSpec};
use crate::scoring::{adjust, AlignmentSignals};

use super::fail_job;

/// Runs [`JobSpec::Match`].
pub struct MatcherHandler {
    analyzer: AlignmentAnalyzer,
    reasoner: Option<Reasoner>,
    config: MatcherConfig,
}

impl MatcherHandler {
    pub fn new(analyzer: AlignmentAnalyzer, reasoner: Option<Reasoner>, config: MatcherConfig) -> Self {
        Self {
            analyzer,
            reasoner,
            config,
        }
    }

    /// Score every search hit of one task.
    async fn match_task(
        &self,
        ctx: &JobContext,
        job_id: Uuid,
        filter: &SearchFilter,
        task: &MatchingTask,
        text: &str,
    ) -> Result<Vec<MatchResult>> {
        let embeddings = &ctx.store.embeddings;
        let vector = embeddings
            .get_task_embedding(job_id, &task.task_id)
            .await?
            .ok_or_else(|| {
                Error::stage("search", format!("no embedding stored for task {}", task.task_id))
            })?;
        check_dimension(vector.as_slice(), embeddings.dimension())?;

        let options = SearchOptions {
            k: self.config.top_k,
            filter: filter.clone(),
            metric: self.config.metric,
        };
        let hits = embeddings.search(&vector, &options).await?;
        debug!(task_id = %task.task_id, result_count = hits.len(), "Candidates found");

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let signals = match AlignmentSignals::gather(&self.analyzer, text, &hit.text).await {
                Ok(signals) => signals,
                Err(e) => {
                    warn!(
                        task_id = %task.task_id,
                        competence_id = %hit.competence_id,
                        error = %e,
                        "Alignment failed, skipping candidate"
                    );
                    ctx.reporter.error(format!(
                        "alignment of task {} with {} failed: {}",
                        task.task_id, hit.competence_id, e
                    ));
                    continue;
                }
            };
            let scored = adjust(hit.similarity, &signals, &self.config);

            let reason = match &self.reasoner {
                Some(reasoner) => match reasoner
                    .reason(text, &hit.text, scored.distance, scored.alignment)
                    .await
                {
                    Ok(reason) => Some(reason),
                    Err(e) => {
                        warn!(
                            task_id = %task.task_id,
                            competence_id = %hit.competence_id,
                            error = %e,
                            "Reasoning failed, keeping match without reason"
                        );
                        None
                    }
                },
                None => None,
            };

            results.push(MatchResult {
                job_id,
                task_id: task.task_id.clone(),
                task_text: text.to_string(),
                list_id: hit.list_id,
                competence_id: hit.competence_id,
                resource_id: hit.resource_id,
                distance: scored.distance,
                text: hit.text,
                embedding_type: hit.embedding_type,
                alignment: scored.alignment,
                reason,
            });
        }

        results.sort_by(|a, b| b.distance.total_cmp(&a.distance));
        Ok(results)
    }

    /// `pending → running → completed`, results written with the transition.
    #[instrument(skip_all, fields(subsystem = "jobs", component = "matcher", op = "match", %job_id, task_count = tasks.len()))]
    async fn run(
        &self,
        ctx: &JobContext,
        job_id: Uuid,
        filter: &SearchFilter,
        tasks: &[MatchingTask],
    ) -> Result<Option<usize>> {
        let status = ctx
            .store
            .jobs
            .advance_status(job_id, JobStatus::Running)
            .await?;
        if status.is_terminal() {
            return Ok(None);
        }
        ctx.reporter.status(JobStatus::Running);

        let mut results = Vec::new();
        for task in tasks {
            let Some(text) = task.text() else {
                debug!(task_id = %task.task_id, "Task has no description, skipped");
                continue;
            };
            match self.match_task(ctx, job_id, filter, task, text).await {
                Ok(rows) => results.extend(rows),
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "Task matching failed, skipped");
                    ctx.reporter
                        .error(format!("matching of task {} failed: {}", task.task_id, e));
                }
            }
        }

        ctx.store
            .matches
            .persist_results_and_complete(job_id, &results)
            .await?;
        Ok(Some(results.len()))
    }
}

#[async_trait]
impl JobHandler for MatcherHandler {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Matcher
    }

    async fn execute(&self, ctx: JobContext) -> JobOutcome {
        let start = Instant::now();
        let job_id = ctx.job_id();
        let result = match &ctx.spec {
            JobSpec::Match { filter, tasks, .. } => self.run(&ctx, job_id, filter, tasks).await,
            other => Err(Error::Internal(format!(
                "{} jobs run on the embedder pool",
                other.kind()
            ))),
        };

        let outcome = match result {
            Ok(Some(count)) => {
                info!(
                    %job_id,
                    result_count = count,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Matching job completed"
                );
                JobOutcome::Success
            }
            Ok(None) => {
                warn!(%job_id, "Job already finished, nothing to do");
                JobOutcome::Failed("job already finished".into())
            }
            Err(e) => fail_job(&ctx, job_id, &e).await,
        };

        match ctx.store.embeddings.delete_task_embeddings(job_id).await {
            Ok(deleted) => debug!(%job_id, deleted, "Task embeddings removed"),
            Err(e) => warn!(%job_id, error = %e, "Failed to remove task embeddings"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use competence_core::{Alignment, CompetenceInput, EmbeddingTask, ResourceInput, StoreHandle};
    use competence_db::MemoryStore;
    use competence_inference::mock::{MockEmbeddingGenerator, MockInferenceBackend, MockNliBackend};

    use crate::handler::Reporter;

    const TASK: &str = "Weld a stainless steel pipe";

    /// One list with two resources whose competences are embedded.
    async fn seeded(store: &Arc<MemoryStore>) -> (StoreHandle, Uuid) {
        let handle = store.handle();
        let ingestion = handle
            .competences
            .ingest(&[
                ResourceInput {
                    resource_id: Some("alice".into()),
                    competencies: vec![CompetenceInput {
                        competence_id: Some("weld".into()),
                        description: Some(TASK.into()),
                        ..Default::default()
                    }],
                },
                ResourceInput {
                    resource_id: Some("bob".into()),
                    competencies: vec![CompetenceInput {
                        competence_id: Some("paint".into()),
                        description: Some("Paint car bodies".into()),
                        ..Default::default()
                    }],
                },
            ])
            .await
            .unwrap();
        for task in &ingestion.tasks {
            embed(&handle, task).await;
        }
        (handle, ingestion.list_id)
    }

    async fn embed(handle: &StoreHandle, task: &EmbeddingTask) {
        let vector = MockEmbeddingGenerator::generate(&task.text, 4).into();
        handle.embeddings.upsert_embedding(task, &vector).await.unwrap();
    }

    async fn match_job(handle: &StoreHandle, list_id: Uuid, tasks: &[MatchingTask]) -> JobSpec {
        let job_id = handle.jobs.create(Some(list_id)).await.unwrap();
        for task in tasks {
            if let Some(text) = task.text() {
                let vector = MockEmbeddingGenerator::generate(text, 4).into();
                handle
                    .embeddings
                    .upsert_task_embedding(job_id, &task.task_id, &vector)
                    .await
                    .unwrap();
            }
        }
        JobSpec::Match {
            job_id,
            filter: SearchFilter {
                list_id: Some(list_id),
                resource_id: None,
            },
            tasks: tasks.to_vec(),
        }
    }

    fn task(id: &str, description: &str) -> MatchingTask {
        MatchingTask {
            task_id: id.into(),
            description: Some(description.into()),
            ..Default::default()
        }
    }

    fn aligned_nli() -> MockNliBackend {
        MockNliBackend::new()
            .with_score("entailment", 0.8)
            .with_score("contradicting", 0.1)
            .with_score("somewhat sufficently", 0.9)
    }

    fn handler(nli: MockNliBackend, generation: Option<MockInferenceBackend>) -> MatcherHandler {
        MatcherHandler::new(
            AlignmentAnalyzer::new(Arc::new(nli)),
            generation.map(|g| Reasoner::new(Arc::new(g))),
            MatcherConfig::default().with_embedding_dim(4),
        )
    }

    fn ctx(handle: &StoreHandle, spec: JobSpec) -> JobContext {
        let job_id = spec.job_id();
        JobContext::new(spec, handle.clone(), Reporter::detached(job_id))
    }

    #[tokio::test]
    async fn test_match_persists_sorted_results_and_completes() {
        let store = MemoryStore::shared(4);
        let (handle, list_id) = seeded(&store).await;
        let spec = match_job(&handle, list_id, &[task("t1", TASK)]).await;
        let job_id = spec.job_id();

        let generation = MockInferenceBackend::new().with_fixed_response("Direct experience.");
        let outcome = handler(aligned_nli(), Some(generation))
            .execute(ctx(&handle, spec))
            .await;
        assert_eq!(outcome, JobOutcome::Success);

        let job = handle.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let results = handle.matches.get_results(job_id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].competence_id, "weld");
        assert_eq!(results[0].alignment, Alignment::Aligning);
        assert_eq!(results[0].distance, 1.0);
        assert!(results[0].distance >= results[1].distance);
        assert_eq!(results[0].reason.as_deref(), Some("Direct experience."));
        assert_eq!(store.task_embedding_count().await, 0);
    }

    #[tokio::test]
    async fn test_contradicting_candidates_score_zero() {
        let store = MemoryStore::shared(4);
        let (handle, list_id) = seeded(&store).await;
        let spec = match_job(&handle, list_id, &[task("t1", TASK)]).await;
        let job_id = spec.job_id();

        let nli = MockNliBackend::new().with_score("contradiction or not related", 0.9);
        handler(nli, None).execute(ctx(&handle, spec)).await;

        let results = handle.matches.get_results(job_id).await.unwrap();
        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.alignment, Alignment::Contradicting);
            assert_eq!(r.distance, 0.0);
            assert!(r.reason.is_none());
        }
    }

    #[tokio::test]
    async fn test_reasoning_failure_keeps_match() {
        let store = MemoryStore::shared(4);
        let (handle, list_id) = seeded(&store).await;
        let spec = match_job(&handle, list_id, &[task("t1", TASK)]).await;
        let job_id = spec.job_id();

        let generation = MockInferenceBackend::new().with_failure_rate(1.0);
        let outcome = handler(aligned_nli(), Some(generation))
            .execute(ctx(&handle, spec))
            .await;
        assert_eq!(outcome, JobOutcome::Success);

        let results = handle.matches.get_results(job_id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.reason.is_none()));
    }

    #[tokio::test]
    async fn test_empty_list_completes_with_no_results() {
        let store = MemoryStore::shared(4);
        let handle = store.handle();
        let list_id = handle.competences.create_list().await.unwrap();
        let spec = match_job(&handle, list_id, &[task("t1", TASK)]).await;
        let job_id = spec.job_id();

        let outcome = handler(aligned_nli(), None).execute(ctx(&handle, spec)).await;
        assert_eq!(outcome, JobOutcome::Success);

        let job = handle.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(handle.matches.get_results(job_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_task_embedding_skips_task_only() {
        let store = MemoryStore::shared(4);
        let (handle, list_id) = seeded(&store).await;
        let mut spec = match_job(&handle, list_id, &[task("t1", TASK)]).await;
        if let JobSpec::Match { tasks, .. } = &mut spec {
            tasks.push(task("t2", "Task without stored embedding"));
        }
        let job_id = spec.job_id();

        let outcome = handler(aligned_nli(), None).execute(ctx(&handle, spec)).await;
        assert_eq!(outcome, JobOutcome::Success);

        let results = handle.matches.get_results(job_id).await.unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.task_id == "t1"));
    }

    #[tokio::test]
    async fn test_persist_failure_marks_job_failed() {
        let store = MemoryStore::shared(4);
        let (handle, list_id) = seeded(&store).await;
        let spec = match_job(&handle, list_id, &[task("t1", TASK)]).await;
        let job_id = spec.job_id();

        store.fail_next_persist();
        let outcome = handler(aligned_nli(), None).execute(ctx(&handle, spec)).await;
        assert!(matches!(outcome, JobOutcome::Failed(_)));

        let job = handle.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(handle.matches.get_results(job_id).await.unwrap().is_empty());
        assert_eq!(store.task_embedding_count().await, 0);
    }

    #[tokio::test]
    async fn test_top_k_limits_candidates() {
        let store = MemoryStore::shared(4);
        let (handle, list_id) = seeded(&store).await;
        let spec = match_job(&handle, list_id, &[task("t1", TASK)]).await;
        let job_id = spec.job_id();

        let handler = MatcherHandler::new(
            AlignmentAnalyzer::new(Arc::new(aligned_nli())),
            None,
            MatcherConfig::default().with_top_k(Some(1)),
        );
        handler.execute(ctx(&handle, spec)).await;

        let results = handle.matches.get_results(job_id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].competence_id, "weld");
    }
}
