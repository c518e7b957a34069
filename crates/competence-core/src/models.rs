//! Domain models for competence lists, embeddings, jobs, and match results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

pub use pgvector::Vector;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Status of an asynchronous job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Preprocessing,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Position on the forward path. Terminal states share the last rank.
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Preprocessing => 1,
            Self::Running => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    /// Whether the job can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Status only moves forward. The one backward edge is
    /// `preprocessing -> pending`, which matching jobs use to mark their
    /// task embeddings as ready for the match stage.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        if self == Self::Preprocessing && next == Self::Pending {
            return true;
        }
        next.rank() > self.rank()
    }

    /// Whether the job is already at or beyond `target` on the forward path.
    pub fn has_reached(self, target: JobStatus) -> bool {
        self == target || self.is_terminal() || self.rank() > target.rank()
    }

    /// Whether an idempotent advance to `target` has nothing left to do.
    ///
    /// Returning to `pending` is only outstanding from `preprocessing`.
    pub fn advance_satisfied(self, target: JobStatus) -> bool {
        if target == Self::Pending {
            return self != Self::Preprocessing;
        }
        self.has_reached(target)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preprocessing => "preprocessing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "preprocessing" => Ok(Self::Preprocessing),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::Validation(format!("Invalid job status: {}", s))),
        }
    }
}

/// A tracked unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    /// Originating entity, usually a resource list.
    pub reference_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of worker pool a job runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Embedder,
    Matcher,
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedder => write!(f, "embedder"),
            Self::Matcher => write!(f, "matcher"),
        }
    }
}

// =============================================================================
// COMPETENCE LISTS
// =============================================================================

/// Competence as submitted by a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetenceInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_qualification_needed: Option<bool>,
    /// Renewal interval in days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proficiency_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualification_dates: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_usages: Option<Vec<String>>,
}

/// Partial competence update. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetenceUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub external_qualification_needed: Option<bool>,
    #[serde(default)]
    pub renew_time: Option<i32>,
    #[serde(default)]
    pub proficiency_level: Option<String>,
    #[serde(default)]
    pub qualification_dates: Option<Vec<String>>,
    #[serde(default)]
    pub last_usages: Option<Vec<String>>,
}

impl CompetenceUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Embedding types whose source text this update replaces.
    pub fn stale_embedding_types(&self) -> Vec<EmbeddingType> {
        let mut stale = Vec::new();
        if self.name.is_some() {
            stale.push(EmbeddingType::Name);
        }
        if self.description.is_some() {
            stale.push(EmbeddingType::Description);
        }
        if self.proficiency_level.is_some() {
            stale.push(EmbeddingType::ProficiencyLevel);
        }
        stale
    }
}

/// Resource with its competences as submitted by a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub competencies: Vec<CompetenceInput>,
}

/// Stored competence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Competence {
    pub list_id: Uuid,
    pub resource_id: String,
    pub competence_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub external_qualification_needed: bool,
    pub renew_time: Option<i32>,
    pub proficiency_level: Option<String>,
    pub qualification_dates: Vec<String>,
    pub last_usages: Vec<String>,
}

impl Competence {
    /// Build a stored competence from caller input.
    pub fn from_input(
        list_id: Uuid,
        resource_id: &str,
        competence_id: String,
        input: &CompetenceInput,
    ) -> Self {
        Self {
            list_id,
            resource_id: resource_id.to_string(),
            competence_id,
            name: input.name.clone(),
            description: input.description.clone(),
            external_qualification_needed: input.external_qualification_needed.unwrap_or(false),
            renew_time: input.renew_time,
            proficiency_level: input.proficiency_level.clone(),
            qualification_dates: input.qualification_dates.clone().unwrap_or_default(),
            last_usages: input.last_usages.clone().unwrap_or_default(),
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &CompetenceUpdate) {
        if let Some(ref name) = update.name {
            self.name = Some(name.clone());
        }
        if let Some(ref description) = update.description {
            self.description = Some(description.clone());
        }
        if let Some(flag) = update.external_qualification_needed {
            self.external_qualification_needed = flag;
        }
        if let Some(days) = update.renew_time {
            self.renew_time = Some(days);
        }
        if let Some(ref level) = update.proficiency_level {
            self.proficiency_level = Some(level.clone());
        }
        if let Some(ref dates) = update.qualification_dates {
            self.qualification_dates = dates.clone();
        }
        if let Some(ref usages) = update.last_usages {
            self.last_usages = usages.clone();
        }
    }
}

/// Resource with its competences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub resource_id: String,
    pub competencies: Vec<Competence>,
}

/// Resource list with nested resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceListView {
    pub list_id: Uuid,
    pub resources: Vec<ResourceView>,
}

// =============================================================================
// EMBEDDINGS & SEARCH
// =============================================================================

/// Which competence field an embedding was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EmbeddingType {
    Name,
    Description,
    ProficiencyLevel,
}

impl EmbeddingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Description => "description",
            Self::ProficiencyLevel => "proficiencyLevel",
        }
    }
}

impl std::fmt::Display for EmbeddingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmbeddingType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "name" => Ok(Self::Name),
            "description" => Ok(Self::Description),
            "proficiencyLevel" => Ok(Self::ProficiencyLevel),
            _ => Err(Error::Validation(format!("Invalid embedding type: {}", s))),
        }
    }
}

/// One text to embed for a competence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingTask {
    pub list_id: Uuid,
    pub resource_id: String,
    pub competence_id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub embedding_type: EmbeddingType,
}

/// Distance metric for vector search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Hamming,
    Euclidean,
}

impl DistanceMetric {
    /// Map a raw distance to a similarity in `[0, 1]`.
    ///
    /// | Metric | Raw range | Similarity |
    /// |--------|-----------|------------|
    /// | cosine | `[0, 2]` | `1 - d/2` |
    /// | euclidean | `[0, sqrt(dim)]` | `1 - d/sqrt(dim)` |
    /// | hamming | `[0, 1]` | `1 - d` |
    pub fn normalize(self, raw_distance: f64, dimension: usize) -> f64 {
        let similarity = match self {
            Self::Cosine => 1.0 - raw_distance / 2.0,
            Self::Euclidean => {
                let max = (dimension.max(1) as f64).sqrt();
                1.0 - raw_distance / max
            }
            Self::Hamming => 1.0 - raw_distance,
        };
        similarity.clamp(0.0, 1.0)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Hamming => "hamming",
            Self::Euclidean => "euclidean",
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "hamming" => Ok(Self::Hamming),
            "euclidean" => Ok(Self::Euclidean),
            _ => Err(Error::Validation(format!(
                "Unsupported distance metric: {}",
                s
            ))),
        }
    }
}

/// Scope restriction for vector search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub list_id: Option<Uuid>,
    pub resource_id: Option<String>,
}

/// Options for `search_embedding`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    /// Maximum number of hits; `None` returns every candidate.
    pub k: Option<i64>,
    pub filter: SearchFilter,
    pub metric: DistanceMetric,
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_k(mut self, k: i64) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_list(mut self, list_id: Uuid) -> Self {
        self.filter.list_id = Some(list_id);
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.filter.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Reject non-positive `k`.
    pub fn validate(&self) -> Result<()> {
        match self.k {
            Some(k) if k <= 0 => Err(Error::Validation(format!(
                "k must be a positive integer, got {}",
                k
            ))),
            _ => Ok(()),
        }
    }
}

/// One candidate returned by vector search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub list_id: Uuid,
    pub resource_id: String,
    pub competence_id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub embedding_type: EmbeddingType,
    /// Metric-dependent distance as computed by the store.
    pub raw_distance: f64,
    /// Normalized similarity in `[0, 1]`.
    pub similarity: f64,
}

/// Reject vectors whose length differs from the configured dimension.
pub fn check_dimension(vector: &[f32], dimension: usize) -> Result<()> {
    if vector.len() != dimension {
        return Err(Error::Validation(format!(
            "Embedding dimension mismatch: expected {}, received {}",
            dimension,
            vector.len()
        )));
    }
    Ok(())
}

// =============================================================================
// MATCHING
// =============================================================================

/// Competence requirement attached to a task, either by id or inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequiredCompetence {
    Id(String),
    Inline(CompetenceInput),
}

/// Task to be matched against a competence list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingTask {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_competencies: Vec<RequiredCompetence>,
}

impl MatchingTask {
    /// Description text, if present and non-blank.
    pub fn text(&self) -> Option<&str> {
        self.description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }
}

/// NLI-derived relation between a task and a competence text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Aligning,
    Neutral,
    Contradicting,
}

impl Alignment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aligning => "aligning",
            Self::Neutral => "neutral",
            Self::Contradicting => "contradicting",
        }
    }
}

impl std::fmt::Display for Alignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Alignment {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aligning" => Ok(Self::Aligning),
            "neutral" => Ok(Self::Neutral),
            "contradicting" => Ok(Self::Contradicting),
            _ => Err(Error::Validation(format!("Invalid alignment: {}", s))),
        }
    }
}

/// Persisted match between a task and a competence text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub job_id: Uuid,
    pub task_id: String,
    pub task_text: String,
    /// List the matched competence belongs to.
    pub list_id: Uuid,
    pub competence_id: String,
    pub resource_id: String,
    /// Adjusted similarity in `[0, 1]`.
    pub distance: f64,
    pub text: String,
    #[serde(rename = "type")]
    pub embedding_type: EmbeddingType,
    pub alignment: Alignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
