//! In-memory store implementing every repository trait.
//!
//! Applies the same validation, cascade, and normalization rules as the
//! PostgreSQL repositories. Each operation holds the state lock for its whole
//! duration, so multi-step writes are all-or-nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use competence_core::{
    check_dimension, Competence, CompetenceInput, CompetenceRepository, CompetenceUpdate,
    DistanceMetric, EmbeddingRepository, EmbeddingTask, EmbeddingType, Error, Ingestion, Job,
    JobRepository, JobStatus, MatchResult, MatchResultRepository, ResourceInput,
    ResourceListView, ResourceUpdate, ResourceView, Result, SearchFilter, SearchHit,
    SearchOptions, StoreFactory, StoreHandle, Vector,
};

use crate::competences::{description_tasks, validate_ingestion};

#[derive(Debug, Clone)]
struct StoredEmbedding {
    id: u64,
    list_id: Uuid,
    resource_id: String,
    competence_id: String,
    text: String,
    embedding_type: EmbeddingType,
    vector: Vec<f32>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    lists: Vec<Uuid>,
    /// (list, resource id) in insertion order.
    resources: Vec<(Uuid, String)>,
    competences: Vec<Competence>,
    embeddings: Vec<StoredEmbedding>,
    next_embedding_id: u64,
    task_embeddings: HashMap<(Uuid, String), Vector>,
    results: Vec<MatchResult>,
}

impl State {
    fn has_list(&self, list_id: Uuid) -> bool {
        self.lists.contains(&list_id)
    }

    fn has_resource(&self, list_id: Uuid, resource_id: &str) -> bool {
        self.resources
            .iter()
            .any(|(l, r)| *l == list_id && r == resource_id)
    }

    fn require_resource(&self, list_id: Uuid, resource_id: &str) -> Result<()> {
        if !self.has_resource(list_id, resource_id) {
            return Err(Error::ResourceNotFound(format!(
                "resource {} in list {}",
                resource_id, list_id
            )));
        }
        Ok(())
    }

    fn competence_index(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<usize> {
        self.competences
            .iter()
            .position(|c| {
                c.list_id == list_id
                    && c.resource_id == resource_id
                    && c.competence_id == competence_id
            })
            .ok_or_else(|| {
                Error::ResourceNotFound(format!(
                    "competence {} of resource {} in list {}",
                    competence_id, resource_id, list_id
                ))
            })
    }

    fn insert_competence(
        &mut self,
        list_id: Uuid,
        resource_id: &str,
        input: &CompetenceInput,
    ) -> Result<String> {
        let competence_id = input
            .competence_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self
            .competence_index(list_id, resource_id, &competence_id)
            .is_ok()
        {
            return Err(Error::Validation(format!(
                "competence {} already exists",
                competence_id
            )));
        }
        self.competences.push(Competence::from_input(
            list_id,
            resource_id,
            competence_id.clone(),
            input,
        ));
        Ok(competence_id)
    }

    fn new_job(&mut self, reference_id: Option<Uuid>) -> Uuid {
        let id = Uuid::now_v7();
        let now = Utc::now();
        self.jobs.insert(
            id,
            Job {
                id,
                status: JobStatus::Pending,
                reference_id,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    fn transition(&mut self, id: Uuid, next: JobStatus, forward_only: bool) -> Result<JobStatus> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::ResourceNotFound(format!("job {}", id)))?;
        if forward_only && job.status.advance_satisfied(next) {
            return Ok(job.status);
        }
        if !job.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: job.status,
                to: next,
            });
        }
        job.status = next;
        job.updated_at = Utc::now();
        Ok(next)
    }

    fn competences_of(&self, list_id: Uuid, resource_id: &str) -> Vec<Competence> {
        self.competences
            .iter()
            .filter(|c| c.list_id == list_id && c.resource_id == resource_id)
            .cloned()
            .collect()
    }

    fn in_scope(filter: &SearchFilter, list_id: Uuid, resource_id: &str) -> bool {
        filter.list_id.map_or(true, |l| l == list_id)
            && filter.resource_id.as_deref().map_or(true, |r| r == resource_id)
    }
}

fn raw_distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f64 {
    match metric {
        DistanceMetric::Cosine => {
            let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
            for (x, y) in a.iter().zip(b) {
                let (x, y) = (*x as f64, *y as f64);
                dot += x * y;
                na += x * x;
                nb += y * y;
            }
            if na == 0.0 || nb == 0.0 {
                return 1.0;
            }
            1.0 - dot / (na.sqrt() * nb.sqrt())
        }
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = (*x - *y) as f64;
                d * d
            })
            .sum::<f64>()
            .sqrt(),
        DistanceMetric::Hamming => {
            let differing = a.iter().zip(b).filter(|(x, y)| (**x > 0.0) != (**y > 0.0)).count();
            differing as f64 / a.len().max(1) as f64
        }
    }
}

/// In-memory implementation of the repository traits.
pub struct MemoryStore {
    dimension: usize,
    state: Mutex<State>,
    fail_next_persist: AtomicBool,
}

impl MemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            state: Mutex::new(State::default()),
            fail_next_persist: AtomicBool::new(false),
        }
    }

    /// Shared store wrapped for use as a [`StoreHandle`].
    pub fn shared(dimension: usize) -> Arc<Self> {
        Arc::new(Self::new(dimension))
    }

    pub fn handle(self: &Arc<Self>) -> StoreHandle {
        StoreHandle::from_shared(self.clone())
    }

    /// Factory whose every `open` returns a handle to this store.
    pub fn factory(self: &Arc<Self>) -> MemoryStoreFactory {
        MemoryStoreFactory {
            store: self.clone(),
        }
    }

    /// Make the next `persist_results_and_complete` fail like a lost connection.
    pub fn fail_next_persist(&self) {
        self.fail_next_persist.store(true, Ordering::SeqCst);
    }

    /// Total rows in the task embedding table.
    pub async fn task_embedding_count(&self) -> usize {
        self.state.lock().await.task_embeddings.len()
    }
}

/// [`StoreFactory`] over one shared [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryStoreFactory {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn open(&self) -> Result<StoreHandle> {
        Ok(self.store.handle())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create(&self, reference_id: Option<Uuid>) -> Result<Uuid> {
        Ok(self.state.lock().await.new_job(reference_id))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        self.state
            .lock()
            .await
            .transition(id, status, false)
            .map(|_| ())
    }

    async fn advance_status(&self, id: Uuid, status: JobStatus) -> Result<JobStatus> {
        self.state.lock().await.transition(id, status, true)
    }
}

#[async_trait]
impl CompetenceRepository for MemoryStore {
    async fn create_list(&self) -> Result<Uuid> {
        let id = Uuid::now_v7();
        self.state.lock().await.lists.push(id);
        Ok(id)
    }

    async fn delete_list(&self, list_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.has_list(list_id) {
            return Err(Error::ResourceNotFound(format!("list {}", list_id)));
        }
        state.embeddings.retain(|e| e.list_id != list_id);
        state.results.retain(|r| r.list_id != list_id);
        state.competences.retain(|c| c.list_id != list_id);
        state.resources.retain(|(l, _)| *l != list_id);
        state.lists.retain(|l| *l != list_id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self.state.lock().await.lists.clone())
    }

    async fn list_exists(&self, list_id: Uuid) -> Result<bool> {
        Ok(self.state.lock().await.has_list(list_id))
    }

    async fn get_list(&self, list_id: Uuid) -> Result<ResourceListView> {
        let state = self.state.lock().await;
        if !state.has_list(list_id) {
            return Err(Error::ResourceNotFound(format!("list {}", list_id)));
        }
        let resources = state
            .resources
            .iter()
            .filter(|(l, _)| *l == list_id)
            .map(|(_, r)| ResourceView {
                resource_id: r.clone(),
                competencies: state.competences_of(list_id, r),
            })
            .collect();
        Ok(ResourceListView { list_id, resources })
    }

    async fn add_resource(&self, list_id: Uuid, resource_id: Option<String>) -> Result<String> {
        let mut state = self.state.lock().await;
        if !state.has_list(list_id) {
            return Err(Error::ResourceNotFound(format!("list {}", list_id)));
        }
        let resource_id = resource_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if state.has_resource(list_id, &resource_id) {
            return Err(Error::Validation(format!(
                "resource {} in list {} already exists",
                resource_id, list_id
            )));
        }
        state.resources.push((list_id, resource_id.clone()));
        Ok(resource_id)
    }

    async fn update_resource(
        &self,
        list_id: Uuid,
        resource_id: &str,
        update: ResourceUpdate,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.require_resource(list_id, resource_id)?;
        let target_list = update.new_list_id.unwrap_or(list_id);
        let target_id = update
            .new_resource_id
            .unwrap_or_else(|| resource_id.to_string());
        if !state.has_list(target_list) {
            return Err(Error::ResourceNotFound(format!("list {}", target_list)));
        }
        if (target_list, target_id.as_str()) != (list_id, resource_id)
            && state.has_resource(target_list, &target_id)
        {
            return Err(Error::Validation(format!(
                "resource {} in list {} already exists",
                target_id, target_list
            )));
        }

        for (l, r) in state.resources.iter_mut() {
            if *l == list_id && r == resource_id {
                *l = target_list;
                *r = target_id.clone();
            }
        }
        for c in state.competences.iter_mut() {
            if c.list_id == list_id && c.resource_id == resource_id {
                c.list_id = target_list;
                c.resource_id = target_id.clone();
            }
        }
        for e in state.embeddings.iter_mut() {
            if e.list_id == list_id && e.resource_id == resource_id {
                e.list_id = target_list;
                e.resource_id = target_id.clone();
            }
        }
        for r in state.results.iter_mut() {
            if r.list_id == list_id && r.resource_id == resource_id {
                r.list_id = target_list;
                r.resource_id = target_id.clone();
            }
        }
        Ok(())
    }

    async fn delete_resource(&self, list_id: Uuid, resource_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.require_resource(list_id, resource_id)?;
        state
            .embeddings
            .retain(|e| !(e.list_id == list_id && e.resource_id == resource_id));
        state
            .results
            .retain(|r| !(r.list_id == list_id && r.resource_id == resource_id));
        state
            .competences
            .retain(|c| !(c.list_id == list_id && c.resource_id == resource_id));
        state
            .resources
            .retain(|(l, r)| !(*l == list_id && r == resource_id));
        Ok(())
    }

    async fn get_resource(&self, list_id: Uuid, resource_id: &str) -> Result<ResourceView> {
        let state = self.state.lock().await;
        state.require_resource(list_id, resource_id)?;
        Ok(ResourceView {
            resource_id: resource_id.to_string(),
            competencies: state.competences_of(list_id, resource_id),
        })
    }

    async fn add_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        input: &CompetenceInput,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        state.require_resource(list_id, resource_id)?;
        state.insert_competence(list_id, resource_id, input)
    }

    async fn update_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
        update: &CompetenceUpdate,
    ) -> Result<Competence> {
        let mut state = self.state.lock().await;
        let index = state.competence_index(list_id, resource_id, competence_id)?;
        state.competences[index].apply(update);

        let stale = update.stale_embedding_types();
        state.embeddings.retain(|e| {
            !(e.list_id == list_id
                && e.resource_id == resource_id
                && e.competence_id == competence_id
                && stale.contains(&e.embedding_type))
        });
        Ok(state.competences[index].clone())
    }

    async fn delete_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let index = state.competence_index(list_id, resource_id, competence_id)?;
        state.embeddings.retain(|e| {
            !(e.list_id == list_id
                && e.resource_id == resource_id
                && e.competence_id == competence_id)
        });
        state.results.retain(|r| {
            !(r.list_id == list_id
                && r.resource_id == resource_id
                && r.competence_id == competence_id)
        });
        state.competences.remove(index);
        Ok(())
    }

    async fn get_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<Competence> {
        let state = self.state.lock().await;
        let index = state.competence_index(list_id, resource_id, competence_id)?;
        Ok(state.competences[index].clone())
    }

    async fn ingest(&self, resources: &[ResourceInput]) -> Result<Ingestion> {
        validate_ingestion(resources)?;

        let mut state = self.state.lock().await;
        let list_id = Uuid::now_v7();
        state.lists.push(list_id);
        for resource in resources {
            let resource_id = resource.resource_id.clone().unwrap_or_default();
            state.resources.push((list_id, resource_id.clone()));
            for competence in &resource.competencies {
                state.insert_competence(list_id, &resource_id, competence)?;
            }
        }
        let job_id = state.new_job(Some(list_id));

        Ok(Ingestion {
            list_id,
            job_id,
            tasks: description_tasks(list_id, resources),
        })
    }
}

#[async_trait]
impl EmbeddingRepository for MemoryStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert_embedding(&self, task: &EmbeddingTask, vector: &Vector) -> Result<()> {
        check_dimension(vector.as_slice(), self.dimension)?;
        let mut state = self.state.lock().await;
        state.competence_index(task.list_id, &task.resource_id, &task.competence_id)?;

        let existing = state.embeddings.iter_mut().find(|e| {
            e.list_id == task.list_id
                && e.resource_id == task.resource_id
                && e.competence_id == task.competence_id
                && e.embedding_type == task.embedding_type
                && e.text == task.text
        });
        match existing {
            Some(e) => e.vector = vector.to_vec(),
            None => {
                let id = state.next_embedding_id;
                state.next_embedding_id += 1;
                state.embeddings.push(StoredEmbedding {
                    id,
                    list_id: task.list_id,
                    resource_id: task.resource_id.clone(),
                    competence_id: task.competence_id.clone(),
                    text: task.text.clone(),
                    embedding_type: task.embedding_type,
                    vector: vector.to_vec(),
                });
            }
        }
        Ok(())
    }

    async fn delete_embeddings_for_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.embeddings.len();
        state.embeddings.retain(|e| {
            !(e.list_id == list_id
                && e.resource_id == resource_id
                && e.competence_id == competence_id)
        });
        Ok((before - state.embeddings.len()) as u64)
    }

    async fn count_embeddings(&self, filter: &SearchFilter) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .embeddings
            .iter()
            .filter(|e| State::in_scope(filter, e.list_id, &e.resource_id))
            .count() as i64)
    }

    async fn search(&self, vector: &Vector, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        options.validate()?;
        check_dimension(vector.as_slice(), self.dimension)?;
        let query = vector.as_slice();

        let state = self.state.lock().await;
        let mut scored: Vec<(f64, u64, &StoredEmbedding)> = state
            .embeddings
            .iter()
            .filter(|e| State::in_scope(&options.filter, e.list_id, &e.resource_id))
            .map(|e| (raw_distance(options.metric, &e.vector, query), e.id, e))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        if let Some(k) = options.k {
            scored.truncate(k as usize);
        }

        Ok(scored
            .into_iter()
            .map(|(raw, _, e)| SearchHit {
                list_id: e.list_id,
                resource_id: e.resource_id.clone(),
                competence_id: e.competence_id.clone(),
                text: e.text.clone(),
                embedding_type: e.embedding_type,
                raw_distance: raw,
                similarity: options.metric.normalize(raw, self.dimension),
            })
            .collect())
    }

    async fn upsert_task_embedding(
        &self,
        job_id: Uuid,
        task_id: &str,
        vector: &Vector,
    ) -> Result<()> {
        check_dimension(vector.as_slice(), self.dimension)?;
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(&job_id) {
            return Err(Error::ResourceNotFound(format!("job {}", job_id)));
        }
        state
            .task_embeddings
            .insert((job_id, task_id.to_string()), vector.clone());
        Ok(())
    }

    async fn get_task_embedding(&self, job_id: Uuid, task_id: &str) -> Result<Option<Vector>> {
        Ok(self
            .state
            .lock()
            .await
            .task_embeddings
            .get(&(job_id, task_id.to_string()))
            .cloned())
    }

    async fn delete_task_embeddings(&self, job_id: Uuid) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.task_embeddings.len();
        state.task_embeddings.retain(|(job, _), _| *job != job_id);
        Ok((before - state.task_embeddings.len()) as u64)
    }
}

#[async_trait]
impl MatchResultRepository for MemoryStore {
    async fn persist_results_and_complete(
        &self,
        job_id: Uuid,
        results: &[MatchResult],
    ) -> Result<()> {
        if self.fail_next_persist.swap(false, Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolClosed));
        }
        let mut state = self.state.lock().await;
        state.transition(job_id, JobStatus::Completed, false)?;
        state.results.extend(results.iter().map(|r| MatchResult {
            job_id,
            distance: r.distance.clamp(0.0, 1.0),
            ..r.clone()
        }));
        Ok(())
    }

    async fn get_results(&self, job_id: Uuid) -> Result<Vec<MatchResult>> {
        let mut rows: Vec<MatchResult> = self
            .state
            .lock()
            .await
            .results
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.task_id
                .cmp(&b.task_id)
                .then_with(|| b.distance.total_cmp(&a.distance))
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use competence_core::Alignment;

    fn vector(values: &[f32]) -> Vector {
        Vector::from(values.to_vec())
    }

    async fn seeded(store: &MemoryStore) -> Uuid {
        let resources = vec![
            ResourceInput {
                resource_id: Some("r-1".into()),
                competencies: vec![
                    CompetenceInput {
                        competence_id: Some("c-1".into()),
                        description: Some("Welding".into()),
                        ..Default::default()
                    },
                    CompetenceInput {
                        competence_id: Some("c-2".into()),
                        description: Some("Painting".into()),
                        ..Default::default()
                    },
                ],
            },
            ResourceInput {
                resource_id: Some("r-2".into()),
                competencies: vec![CompetenceInput {
                    competence_id: Some("c-3".into()),
                    description: Some("Forklift".into()),
                    ..Default::default()
                }],
            },
        ];
        store.ingest(&resources).await.unwrap().list_id
    }

    fn task(list_id: Uuid, resource: &str, competence: &str, text: &str) -> EmbeddingTask {
        EmbeddingTask {
            list_id,
            resource_id: resource.into(),
            competence_id: competence.into(),
            text: text.into(),
            embedding_type: EmbeddingType::Description,
        }
    }

    fn result(
        list_id: Uuid,
        task_id: &str,
        resource: &str,
        competence: &str,
        distance: f64,
    ) -> MatchResult {
        MatchResult {
            job_id: Uuid::nil(),
            task_id: task_id.into(),
            task_text: format!("text of {}", task_id),
            list_id,
            competence_id: competence.into(),
            resource_id: resource.into(),
            distance,
            text: format!("{} text", competence),
            embedding_type: EmbeddingType::Description,
            alignment: Alignment::Neutral,
            reason: None,
        }
    }

    /// Completed matching job holding one result per competence of `seeded`.
    async fn matched(store: &MemoryStore, list_id: Uuid) -> Uuid {
        let job_id = store.create(Some(list_id)).await.unwrap();
        store.set_status(job_id, JobStatus::Running).await.unwrap();
        let rows = [
            result(list_id, "t1", "r-1", "c-1", 0.9),
            result(list_id, "t1", "r-1", "c-2", 0.4),
            result(list_id, "t1", "r-2", "c-3", 0.6),
        ];
        store.persist_results_and_complete(job_id, &rows).await.unwrap();
        job_id
    }

    fn competence_ids(rows: &[MatchResult]) -> Vec<&str> {
        rows.iter().map(|r| r.competence_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_ingest_creates_list_and_pending_job() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        let view = store.get_list(list_id).await.unwrap();
        assert_eq!(view.resources.len(), 2);
        assert_eq!(view.resources[0].competencies.len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_validation_leaves_no_rows() {
        let store = MemoryStore::new(4);
        let bad = vec![ResourceInput {
            resource_id: Some("r".into()),
            competencies: vec![CompetenceInput::default()],
        }];
        assert!(matches!(store.ingest(&bad).await, Err(Error::Validation(_))));
        assert!(store.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_rejects_wrong_dimension() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        let err = store
            .upsert_embedding(&task(list_id, "r-1", "c-1", "Welding"), &vector(&[1.0; 3]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(
            store.count_embeddings(&SearchFilter::default()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_upsert_same_key_overwrites() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        let t = task(list_id, "r-1", "c-1", "Welding");
        store
            .upsert_embedding(&t, &vector(&[1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        store
            .upsert_embedding(&t, &vector(&[0.0, 1.0, 0.0, 0.0]))
            .await
            .unwrap();
        assert_eq!(
            store.count_embeddings(&SearchFilter::default()).await.unwrap(),
            1
        );
        let hits = store
            .search(&vector(&[0.0, 1.0, 0.0, 0.0]), &SearchOptions::new())
            .await
            .unwrap();
        assert_eq!(hits[0].similarity, 1.0);
    }

    #[tokio::test]
    async fn test_search_orders_and_limits() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        for (r, c, v) in [
            ("r-1", "c-1", [1.0, 0.0, 0.0, 0.0]),
            ("r-1", "c-2", [0.7, 0.7, 0.0, 0.0]),
            ("r-2", "c-3", [0.0, 1.0, 0.0, 0.0]),
        ] {
            store
                .upsert_embedding(&task(list_id, r, c, c), &vector(&v))
                .await
                .unwrap();
        }

        let hits = store
            .search(
                &vector(&[1.0, 0.0, 0.0, 0.0]),
                &SearchOptions::new().with_k(2).with_list(list_id),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].competence_id, "c-1");
        assert_eq!(hits[1].competence_id, "c-2");
        assert!(hits[0].raw_distance <= hits[1].raw_distance);

        let scoped = store
            .search(
                &vector(&[1.0, 0.0, 0.0, 0.0]),
                &SearchOptions::new().with_resource("r-2"),
            )
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].resource_id, "r-2");
    }

    #[tokio::test]
    async fn test_search_euclidean_normalization() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        store
            .upsert_embedding(
                &task(list_id, "r-1", "c-1", "Welding"),
                &vector(&[1.0, 0.0, 0.0, 0.0]),
            )
            .await
            .unwrap();
        let hits = store
            .search(
                &vector(&[0.0, 0.0, 0.0, 0.0]),
                &SearchOptions::new().with_metric(DistanceMetric::Euclidean),
            )
            .await
            .unwrap();
        assert_eq!(hits[0].raw_distance, 1.0);
        assert_eq!(hits[0].similarity, 0.5);
    }

    #[tokio::test]
    async fn test_search_rejects_bad_k() {
        let store = MemoryStore::new(4);
        let err = store
            .search(&vector(&[0.0; 4]), &SearchOptions::new().with_k(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_resource_cascades_embeddings() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        store
            .upsert_embedding(&task(list_id, "r-1", "c-1", "W"), &vector(&[1.0; 4]))
            .await
            .unwrap();
        store
            .upsert_embedding(&task(list_id, "r-2", "c-3", "F"), &vector(&[1.0; 4]))
            .await
            .unwrap();
        let job_id = matched(&store, list_id).await;

        store.delete_resource(list_id, "r-1").await.unwrap();
        let left = store.get_results(job_id).await.unwrap();
        assert_eq!(competence_ids(&left), vec!["c-3"]);

        let filter = SearchFilter {
            list_id: Some(list_id),
            resource_id: Some("r-1".into()),
        };
        assert_eq!(store.count_embeddings(&filter).await.unwrap(), 0);
        assert_eq!(
            store.count_embeddings(&SearchFilter::default()).await.unwrap(),
            1
        );
        assert!(matches!(
            store.get_resource(list_id, "r-1").await,
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_list_cascades_everything() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        store
            .upsert_embedding(&task(list_id, "r-2", "c-3", "F"), &vector(&[1.0; 4]))
            .await
            .unwrap();
        let job_id = matched(&store, list_id).await;

        store.delete_list(list_id).await.unwrap();
        assert_eq!(
            store.count_embeddings(&SearchFilter::default()).await.unwrap(),
            0
        );
        assert!(store.get_results(job_id).await.unwrap().is_empty());
        assert!(matches!(
            store.delete_list(list_id).await,
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_competence_removes_its_results() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        let job_id = matched(&store, list_id).await;

        store.delete_competence(list_id, "r-1", "c-2").await.unwrap();
        let left = store.get_results(job_id).await.unwrap();
        assert_eq!(competence_ids(&left), vec!["c-1", "c-3"]);
    }

    #[tokio::test]
    async fn test_move_resource_moves_its_results() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        let job_id = matched(&store, list_id).await;

        store
            .update_resource(
                list_id,
                "r-2",
                ResourceUpdate {
                    new_list_id: None,
                    new_resource_id: Some("r-9".into()),
                },
            )
            .await
            .unwrap();
        let rows = store.get_results(job_id).await.unwrap();
        assert!(rows.iter().any(|r| r.resource_id == "r-9" && r.competence_id == "c-3"));
        assert!(rows.iter().all(|r| r.resource_id != "r-2"));
    }

    #[tokio::test]
    async fn test_update_competence_purges_stale_type_only() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        store
            .upsert_embedding(&task(list_id, "r-1", "c-1", "Welding"), &vector(&[1.0; 4]))
            .await
            .unwrap();

        let updated = store
            .update_competence(
                list_id,
                "r-1",
                "c-1",
                &CompetenceUpdate {
                    renew_time: Some(90),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.renew_time, Some(90));
        assert_eq!(
            store.count_embeddings(&SearchFilter::default()).await.unwrap(),
            1
        );

        store
            .update_competence(
                list_id,
                "r-1",
                "c-1",
                &CompetenceUpdate {
                    description: Some("MIG welding".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.count_embeddings(&SearchFilter::default()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_update_missing_competence_is_not_found() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        let err = store
            .update_competence(list_id, "r-1", "nope", &CompetenceUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_move_resource_keeps_embeddings() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        let other = store.create_list().await.unwrap();
        store
            .upsert_embedding(&task(list_id, "r-2", "c-3", "F"), &vector(&[1.0; 4]))
            .await
            .unwrap();

        store
            .update_resource(
                list_id,
                "r-2",
                ResourceUpdate {
                    new_list_id: Some(other),
                    new_resource_id: None,
                },
            )
            .await
            .unwrap();

        let filter = SearchFilter {
            list_id: Some(other),
            resource_id: None,
        };
        assert_eq!(store.count_embeddings(&filter).await.unwrap(), 1);
        assert_eq!(store.get_list(other).await.unwrap().resources.len(), 1);
    }

    #[tokio::test]
    async fn test_job_status_forward_only() {
        let store = MemoryStore::new(4);
        let id = store.create(None).await.unwrap();
        store.set_status(id, JobStatus::Running).await.unwrap();

        let err = store.set_status(id, JobStatus::Pending).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(
            store
                .advance_status(id, JobStatus::Preprocessing)
                .await
                .unwrap(),
            JobStatus::Running
        );
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_persist_completes_job() {
        let store = MemoryStore::new(4);
        let id = store.create(None).await.unwrap();
        store.set_status(id, JobStatus::Running).await.unwrap();
        store.persist_results_and_complete(id, &[]).await.unwrap();
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_get_results_ordered_by_task_then_distance() {
        let store = MemoryStore::new(4);
        let list_id = seeded(&store).await;
        let job_id = store.create(Some(list_id)).await.unwrap();
        store.set_status(job_id, JobStatus::Running).await.unwrap();
        let rows = [
            result(list_id, "t2", "r-1", "c-1", 0.8),
            result(list_id, "t1", "r-1", "c-2", 0.3),
            result(list_id, "t1", "r-2", "c-3", 0.7),
        ];
        store.persist_results_and_complete(job_id, &rows).await.unwrap();

        let ordered: Vec<(String, String)> = store
            .get_results(job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.task_id, r.competence_id))
            .collect();
        assert_eq!(
            ordered,
            vec![
                ("t1".to_string(), "c-3".to_string()),
                ("t1".to_string(), "c-2".to_string()),
                ("t2".to_string(), "c-1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_fail_next_persist_leaves_job_running() {
        let store = MemoryStore::new(4);
        let id = store.create(None).await.unwrap();
        store.set_status(id, JobStatus::Running).await.unwrap();
        store.fail_next_persist();
        let err = store.persist_results_and_complete(id, &[]).await.unwrap_err();
        assert!(err.is_store_failure());
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_task_embeddings_deleted_per_job() {
        let store = MemoryStore::new(4);
        let a = store.create(None).await.unwrap();
        let b = store.create(None).await.unwrap();
        store.upsert_task_embedding(a, "t1", &vector(&[1.0; 4])).await.unwrap();
        store.upsert_task_embedding(b, "t1", &vector(&[1.0; 4])).await.unwrap();

        assert_eq!(store.delete_task_embeddings(a).await.unwrap(), 1);
        assert!(store.get_task_embedding(a, "t1").await.unwrap().is_none());
        assert!(store.get_task_embedding(b, "t1").await.unwrap().is_some());
    }
}
