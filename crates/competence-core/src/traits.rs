//! Core traits for the competence matcher.
//!
//! Storage traits are implemented by `competence-db` (PostgreSQL and the
//! in-memory store); inference traits by `competence-inference`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// REPOSITORY TRAITS
// =============================================================================

/// Result of atomically persisting a submitted resource list.
#[derive(Debug, Clone)]
pub struct Ingestion {
    pub list_id: Uuid,
    pub job_id: Uuid,
    /// Description texts to embed, one per competence that has one.
    pub tasks: Vec<EmbeddingTask>,
}

/// Move or rename a resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceUpdate {
    pub new_list_id: Option<Uuid>,
    pub new_resource_id: Option<String>,
}

/// Repository for job rows.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Create a job in `pending`.
    async fn create(&self, reference_id: Option<Uuid>) -> Result<Uuid>;

    /// Fetch a job by id.
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Transition a job, rejecting moves the state machine forbids.
    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<()>;

    /// Move a job forward to `status` unless it has already reached it.
    ///
    /// Returns the status the job holds afterwards.
    async fn advance_status(&self, id: Uuid, status: JobStatus) -> Result<JobStatus>;
}

/// Repository for lists, resources, and competences.
///
/// Every delete path also removes dependent embeddings in the same
/// transaction.
#[async_trait]
pub trait CompetenceRepository: Send + Sync {
    async fn create_list(&self) -> Result<Uuid>;
    async fn delete_list(&self, list_id: Uuid) -> Result<()>;
    async fn list_ids(&self) -> Result<Vec<Uuid>>;
    async fn list_exists(&self, list_id: Uuid) -> Result<bool>;
    async fn get_list(&self, list_id: Uuid) -> Result<ResourceListView>;

    /// Add a resource, generating its id when none is supplied.
    async fn add_resource(&self, list_id: Uuid, resource_id: Option<String>) -> Result<String>;
    async fn update_resource(
        &self,
        list_id: Uuid,
        resource_id: &str,
        update: ResourceUpdate,
    ) -> Result<()>;
    async fn delete_resource(&self, list_id: Uuid, resource_id: &str) -> Result<()>;
    async fn get_resource(&self, list_id: Uuid, resource_id: &str) -> Result<ResourceView>;

    /// Add a competence, generating its id when none is supplied.
    async fn add_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        input: &CompetenceInput,
    ) -> Result<String>;
    async fn update_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
        update: &CompetenceUpdate,
    ) -> Result<Competence>;
    async fn delete_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<()>;
    async fn get_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<Competence>;

    /// Create a list, its resources, its competences, and an ingestion job
    /// as one all-or-nothing step.
    async fn ingest(&self, resources: &[ResourceInput]) -> Result<Ingestion>;
}

/// Repository for competence and task embeddings.
#[async_trait]
pub trait EmbeddingRepository: Send + Sync {
    /// Configured vector dimension.
    fn dimension(&self) -> usize;

    /// Insert or overwrite the embedding keyed by (competence, type, text).
    async fn upsert_embedding(&self, task: &EmbeddingTask, vector: &Vector) -> Result<()>;

    async fn delete_embeddings_for_competence(
        &self,
        list_id: Uuid,
        resource_id: &str,
        competence_id: &str,
    ) -> Result<u64>;

    /// Count stored embeddings within a scope.
    async fn count_embeddings(&self, filter: &SearchFilter) -> Result<i64>;

    /// Nearest neighbours ordered by ascending raw distance.
    async fn search(&self, vector: &Vector, options: &SearchOptions) -> Result<Vec<SearchHit>>;

    async fn upsert_task_embedding(&self, job_id: Uuid, task_id: &str, vector: &Vector)
        -> Result<()>;
    async fn get_task_embedding(&self, job_id: Uuid, task_id: &str) -> Result<Option<Vector>>;
    async fn delete_task_embeddings(&self, job_id: Uuid) -> Result<u64>;
}

/// Repository for match results.
#[async_trait]
pub trait MatchResultRepository: Send + Sync {
    /// Write every result, then mark the job `completed`, atomically.
    async fn persist_results_and_complete(&self, job_id: Uuid, results: &[MatchResult])
        -> Result<()>;

    /// Results of a job ordered by task, then by descending similarity.
    async fn get_results(&self, job_id: Uuid) -> Result<Vec<MatchResult>>;
}

// =============================================================================
// INFERENCE TRAITS
// =============================================================================

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One chat message for a generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Backend for generating embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for the given texts.
    ///
    /// Returns a vector of embedding vectors, one per input text.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>>;

    /// Get the expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

/// Backend for text generation (LLM).
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Run a chat completion over the given messages.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Generate text with system context.
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        self.chat(&messages).await
    }

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

/// Combined inference backend supporting both embedding and generation.
#[async_trait]
pub trait InferenceBackend: EmbeddingBackend + GenerationBackend {
    /// Check if the backend is available and responding.
    async fn health_check(&self) -> Result<bool>;
}

/// Zero-shot classification output, labels sorted by descending score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub labels: Vec<String>,
    pub scores: Vec<f64>,
}

impl Classification {
    /// Score of a label, 0 when the model did not return it.
    pub fn score_of(&self, label: &str) -> f64 {
        self.labels
            .iter()
            .position(|l| l == label)
            .and_then(|i| self.scores.get(i).copied())
            .unwrap_or(0.0)
    }
}

/// Backend for zero-shot NLI classification.
#[async_trait]
pub trait NliBackend: Send + Sync {
    /// Classify `text` against candidate labels.
    ///
    /// Each label is substituted for `{}` in `hypothesis_template` to form
    /// the hypothesis paired with `text` as premise.
    async fn classify(
        &self,
        text: &str,
        labels: &[&str],
        hypothesis_template: &str,
    ) -> Result<Classification>;

    /// Check if the backend is available.
    async fn health_check(&self) -> Result<bool>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_score_of() {
        let c = Classification {
            labels: vec!["entailment".into(), "neutral statement".into()],
            scores: vec![0.8, 0.2],
        };
        assert_eq!(c.score_of("entailment"), 0.8);
        assert_eq!(c.score_of("neutral statement"), 0.2);
        assert_eq!(c.score_of("contradiction or not related"), 0.0);
    }

    #[test]
    fn test_chat_message_constructors() {
        assert_eq!(ChatMessage::system("s").role, ChatRole::System);
        assert_eq!(ChatMessage::user("u").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("a").role, ChatRole::Assistant);
    }

    #[test]
    fn test_chat_role_serde() {
        let json = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }
}
