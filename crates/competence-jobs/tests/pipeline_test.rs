//! End-to-end tests of the matching pipeline through `MatchingService`.
//!
//! This test suite validates:
//! - Ingestion of a two-resource list embeds every description
//! - Matching an existing list ranks aligned resources above contradicting ones
//! - Matching an empty list still completes with empty results
//! - Inline lists are ingested and matched under one matching job
//! - Validation errors surface synchronously
//! - Store failures and unavailable models end in `failed`
//!
//! Everything runs against `MemoryStore` and the mock inference backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use competence_core::{
    CompetenceInput, Error, JobStatus, MatchingTask, RankBy, ResourceInput, Result, SearchFilter,
};
use competence_db::MemoryStore;
use competence_inference::mock::{MockInferenceBackend, MockNliBackend};
use competence_jobs::{
    MatchRequest, MatcherConfig, MatchingService, ModelProvider, ModelSet, StaticModels,
    WorkerManager, WorkerPoolConfig,
};

// ============================================================================
// HELPERS
// ============================================================================

const WELD: &str = "Weld a stainless steel pipe";

fn pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig::default()
        .with_workers(2, 2)
        .with_heartbeat(Duration::from_millis(20), Duration::from_secs(2))
        .with_health_check_interval(Duration::from_millis(200))
        .with_max_retries(2)
        .with_shutdown_grace(Duration::from_millis(200))
}

/// Aligned for welding, contradicting for anything about painting.
fn nli() -> MockNliBackend {
    MockNliBackend::new()
        .with_score("entailment", 0.8)
        .with_score("contradicting", 0.1)
        .with_score("somewhat sufficently", 0.9)
        .with_score_when("Paint", "contradiction or not related", 0.95)
        .with_score_when("Paint", "contradicting", 0.9)
}

fn models() -> ModelSet {
    let backend = Arc::new(MockInferenceBackend::new().with_fixed_response("Relevant experience."));
    ModelSet {
        embedding: backend.clone(),
        generation: backend,
        nli: Arc::new(nli()),
    }
}

struct Setup {
    store: Arc<MemoryStore>,
    service: MatchingService,
}

fn setup_with(models: Arc<dyn ModelProvider>) -> Setup {
    let store = MemoryStore::shared(4);
    let manager = WorkerManager::start(
        &pool_config(),
        MatcherConfig::default().with_embedding_dim(4),
        models,
        Arc::new(store.factory()),
        Arc::new(store.factory()),
    );
    let service = MatchingService::new(store.handle(), Arc::new(manager));
    Setup { store, service }
}

fn setup() -> Setup {
    setup_with(Arc::new(StaticModels(models())))
}

fn resource(id: &str, competences: &[(&str, &str)]) -> ResourceInput {
    ResourceInput {
        resource_id: Some(id.into()),
        competencies: competences
            .iter()
            .map(|(cid, description)| CompetenceInput {
                competence_id: Some((*cid).into()),
                description: Some((*description).into()),
                ..Default::default()
            })
            .collect(),
    }
}

fn two_resources() -> Vec<ResourceInput> {
    vec![
        resource("alice", &[("weld", WELD)]),
        resource("bob", &[("paint", "Paint car bodies")]),
    ]
}

fn task(id: &str, description: &str) -> MatchingTask {
    MatchingTask {
        task_id: id.into(),
        description: Some(description.into()),
        ..Default::default()
    }
}

/// Poll until the job is terminal.
async fn wait_terminal(service: &MatchingService, job_id: Uuid) -> JobStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = service
            .poll_ingestion(job_id)
            .await
            .expect("job should exist")
            .status;
        if status.is_terminal() || tokio::time::Instant::now() > deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// INGESTION
// ============================================================================

#[tokio::test]
async fn test_ingest_two_resources() {
    let s = setup();
    let ticket = s.service.ingest(two_resources()).await.unwrap();
    assert_eq!(ticket.status, JobStatus::Pending);

    assert_eq!(wait_terminal(&s.service, ticket.job_id).await, JobStatus::Completed);
    let polled = s.service.poll_ingestion(ticket.job_id).await.unwrap();
    let list_id = polled.competence_list_id.expect("completed ingestion has a list");

    let handle = s.store.handle();
    let list = handle.competences.get_list(list_id).await.unwrap();
    assert_eq!(list.resources.len(), 2);
    let filter = SearchFilter {
        list_id: Some(list_id),
        resource_id: None,
    };
    assert_eq!(handle.embeddings.count_embeddings(&filter).await.unwrap(), 2);
}

#[tokio::test]
async fn test_ingest_rejects_competence_without_id() {
    let s = setup();
    let mut resources = two_resources();
    resources[0].competencies[0].competence_id = None;

    let err = s.service.ingest(resources).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(s.store.handle().competences.list_ids().await.unwrap().is_empty());
}

// ============================================================================
// MATCHING
// ============================================================================

async fn ingested_list(s: &Setup) -> Uuid {
    let ticket = s.service.ingest(two_resources()).await.unwrap();
    assert_eq!(wait_terminal(&s.service, ticket.job_id).await, JobStatus::Completed);
    s.service
        .poll_ingestion(ticket.job_id)
        .await
        .unwrap()
        .competence_list_id
        .unwrap()
}

#[tokio::test]
async fn test_match_existing_list_ranks_resources() {
    let s = setup();
    let list_id = ingested_list(&s).await;

    let ticket = s
        .service
        .match_list(MatchRequest::Existing { list_id }, vec![task("t1", WELD)])
        .await
        .unwrap();
    assert_eq!(ticket.status, JobStatus::Pending);
    assert_eq!(wait_terminal(&s.service, ticket.job_id).await, JobStatus::Completed);

    let polled = s.service.poll_match(ticket.job_id, RankBy::AvgFit).await.unwrap();
    let results = polled.results.expect("completed match has results");
    assert_eq!(results.tasks.len(), 1);
    assert_eq!(results.tasks[0].task_text, WELD);
    assert_eq!(results.resource_ranking.len(), 2);

    let best = &results.resource_ranking[0];
    assert_eq!(best.resource_id, "alice");
    assert!(!best.contradicting);
    let part = &best.task_matchings[0].competence_matchings[0].matchings[0];
    assert_eq!(part.reason.as_deref(), Some("Relevant experience."));

    let worst = &results.resource_ranking[1];
    assert_eq!(worst.resource_id, "bob");
    assert!(worst.contradicting);

    assert_eq!(s.store.task_embedding_count().await, 0);
}

#[tokio::test]
async fn test_match_empty_list_completes() {
    let s = setup();
    let list_id = s.store.handle().competences.create_list().await.unwrap();

    let ticket = s
        .service
        .match_list(MatchRequest::Existing { list_id }, vec![task("t1", WELD)])
        .await
        .unwrap();
    assert_eq!(wait_terminal(&s.service, ticket.job_id).await, JobStatus::Completed);

    let results = s
        .service
        .poll_match(ticket.job_id, RankBy::BestFit)
        .await
        .unwrap()
        .results
        .unwrap();
    assert!(results.tasks.is_empty());
    assert!(results.resource_ranking.is_empty());
}

#[tokio::test]
async fn test_match_inline_list() {
    let s = setup();
    let ticket = s
        .service
        .match_list(
            MatchRequest::Inline {
                resources: two_resources(),
            },
            vec![task("t1", WELD)],
        )
        .await
        .unwrap();
    assert_eq!(ticket.status, JobStatus::Pending);
    assert_eq!(wait_terminal(&s.service, ticket.job_id).await, JobStatus::Completed);

    let results = s
        .service
        .poll_match(ticket.job_id, RankBy::AvgFit)
        .await
        .unwrap()
        .results
        .unwrap();
    assert_eq!(results.resource_ranking.len(), 2);
    assert_eq!(s.store.handle().competences.list_ids().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_match_validation() {
    let s = setup();

    let err = s
        .service
        .match_list(
            MatchRequest::Existing {
                list_id: Uuid::new_v4(),
            },
            vec![task("t1", WELD)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResourceNotFound(_)));

    let list_id = s.store.handle().competences.create_list().await.unwrap();
    let err = s
        .service
        .match_list(MatchRequest::Existing { list_id }, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_poll_unknown_job() {
    let s = setup();
    let err = s.service.poll_match(Uuid::new_v4(), RankBy::AvgFit).await.unwrap_err();
    assert!(matches!(err, Error::ResourceNotFound(_)));
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_persist_failure_fails_match_job() {
    let s = setup();
    let list_id = ingested_list(&s).await;

    s.store.fail_next_persist();
    let ticket = s
        .service
        .match_list(MatchRequest::Existing { list_id }, vec![task("t1", WELD)])
        .await
        .unwrap();
    assert_eq!(wait_terminal(&s.service, ticket.job_id).await, JobStatus::Failed);

    let polled = s.service.poll_match(ticket.job_id, RankBy::AvgFit).await.unwrap();
    assert!(polled.results.is_none());
    assert_eq!(s.store.task_embedding_count().await, 0);
}

struct UnavailableModels;

#[async_trait]
impl ModelProvider for UnavailableModels {
    async fn load(&self) -> Result<ModelSet> {
        Err(Error::ServiceUnavailable("ollama is unhealthy".into()))
    }
}

#[tokio::test]
async fn test_unavailable_models_fail_ingestion_after_retries() {
    let s = setup_with(Arc::new(UnavailableModels));
    let ticket = s.service.ingest(two_resources()).await.unwrap();
    assert_eq!(wait_terminal(&s.service, ticket.job_id).await, JobStatus::Failed);
}
