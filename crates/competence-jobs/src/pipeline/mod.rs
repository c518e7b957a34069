//! Matching pipeline: segment → embed → search + align → reason → persist.
//!
//! [`EmbedderFactory`] and [`MatcherFactory`] build the handlers of the two
//! pools. Each worker loads its own [`ModelSet`] on its first job; every
//! call into the shared engine goes through the [`EngineLock`].

pub mod embedder;
pub mod matcher;
pub mod segmentation;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};
use uuid::Uuid;

use competence_core::{
    defaults, EmbeddingBackend, Error, GenerationBackend, InferenceBackend, JobStatus,
    NliBackend, Result, WorkerType,
};
use competence_inference::{
    AlignmentAnalyzer, NliSidecarBackend, OllamaBackend, Reasoner, Segmenter,
};

use crate::config::MatcherConfig;
use crate::engine_lock::{EngineLock, Locked};
use crate::handler::{HandlerFactory, JobContext, JobHandler};
use crate::messages::JobOutcome;

pub use embedder::EmbedderHandler;
pub use matcher::MatcherHandler;

/// Inference collaborators used by one worker.
#[derive(Clone)]
pub struct ModelSet {
    pub embedding: Arc<dyn EmbeddingBackend>,
    pub generation: Arc<dyn GenerationBackend>,
    pub nli: Arc<dyn NliBackend>,
}

/// Loads the models of a worker.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn load(&self) -> Result<ModelSet>;
}

impl ModelSet {
    /// Route every call of every model through `lock`.
    pub fn locked(self, lock: &EngineLock) -> Self {
        Self {
            embedding: Arc::new(Locked::new(self.embedding, lock.clone())),
            generation: Arc::new(Locked::new(self.generation, lock.clone())),
            nli: Arc::new(Locked::new(self.nli, lock.clone())),
        }
    }
}

/// Already-built models, shared by every worker.
pub struct StaticModels(pub ModelSet);

#[async_trait]
impl ModelProvider for StaticModels {
    async fn load(&self) -> Result<ModelSet> {
        Ok(self.0.clone())
    }
}

/// Ollama for embedding and generation, the NLI sidecar for alignment.
///
/// Both services are health-checked on load; an unreachable one yields
/// [`Error::ServiceUnavailable`].
pub struct RemoteModels {
    ollama: Arc<OllamaBackend>,
    nli: Arc<NliSidecarBackend>,
}

impl RemoteModels {
    pub fn new(ollama: OllamaBackend, nli: NliSidecarBackend) -> Self {
        Self {
            ollama: Arc::new(ollama),
            nli: Arc::new(nli),
        }
    }

    /// Configure both services from the environment.
    pub fn from_env() -> Self {
        Self::new(OllamaBackend::from_env(), NliSidecarBackend::from_env())
    }

    /// Fail unless Ollama embeds into vectors of `expected` dimensions.
    pub fn check_dimension(&self, expected: usize) -> Result<()> {
        let actual = EmbeddingBackend::dimension(self.ollama.as_ref());
        if actual != expected {
            return Err(Error::Config(format!(
                "OLLAMA_EMBED_DIM is {} but EMBEDDING_DIM is {}",
                actual, expected
            )));
        }
        Ok(())
    }

    /// Check every service once.
    pub async fn check_health(&self) -> Result<()> {
        let timeout = Duration::from_secs(defaults::HEALTH_TIMEOUT_SECS);
        check_service("ollama", timeout, self.ollama.health_check()).await?;
        check_service("nli", timeout, self.nli.health_check()).await?;
        info!(
            subsystem = "inference",
            embed_model = EmbeddingBackend::model_name(self.ollama.as_ref()),
            gen_model = GenerationBackend::model_name(self.ollama.as_ref()),
            nli_model = self.nli.model_name(),
            "Inference services healthy"
        );
        Ok(())
    }
}

async fn check_service<F>(service: &str, timeout: Duration, check: F) -> Result<()>
where
    F: std::future::Future<Output = Result<bool>>,
{
    match tokio::time::timeout(timeout, check).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(Error::ServiceUnavailable(format!("{} is unhealthy", service))),
        Ok(Err(e)) => Err(Error::ServiceUnavailable(format!("{}: {}", service, e))),
        Err(_) => Err(Error::ServiceUnavailable(format!(
            "{} health check timed out",
            service
        ))),
    }
}

#[async_trait]
impl ModelProvider for RemoteModels {
    async fn load(&self) -> Result<ModelSet> {
        self.check_health().await?;
        Ok(ModelSet {
            embedding: self.ollama.clone(),
            generation: self.ollama.clone(),
            nli: self.nli.clone(),
        })
    }
}

/// Builds [`EmbedderHandler`]s.
pub struct EmbedderFactory {
    models: Arc<dyn ModelProvider>,
    lock: EngineLock,
    config: MatcherConfig,
}

impl EmbedderFactory {
    pub fn new(models: Arc<dyn ModelProvider>, lock: EngineLock, config: MatcherConfig) -> Self {
        Self {
            models,
            lock,
            config,
        }
    }
}

#[async_trait]
impl HandlerFactory for EmbedderFactory {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Embedder
    }

    async fn build(&self) -> Result<Arc<dyn JobHandler>> {
        let models = self.models.load().await?.locked(&self.lock);
        let segmenter = self
            .config
            .segmentation_enabled
            .then(|| Segmenter::from_env(models.generation));
        let embedding = models.embedding;
        debug!(
            worker_type = "embedder",
            model = embedding.model_name(),
            segmentation = segmenter.is_some(),
            "Embedder handler built"
        );
        Ok(Arc::new(EmbedderHandler::new(
            embedding,
            segmenter,
            self.config.clone(),
        )))
    }
}

/// Builds [`MatcherHandler`]s.
pub struct MatcherFactory {
    models: Arc<dyn ModelProvider>,
    lock: EngineLock,
    config: MatcherConfig,
}

impl MatcherFactory {
    pub fn new(models: Arc<dyn ModelProvider>, lock: EngineLock, config: MatcherConfig) -> Self {
        Self {
            models,
            lock,
            config,
        }
    }
}

#[async_trait]
impl HandlerFactory for MatcherFactory {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Matcher
    }

    async fn build(&self) -> Result<Arc<dyn JobHandler>> {
        let models = self.models.load().await?.locked(&self.lock);
        let nli = models.nli;
        let reasoner = self
            .config
            .reasoning_enabled
            .then(|| Reasoner::new(models.generation));
        debug!(
            worker_type = "matcher",
            model = nli.model_name(),
            reasoning = reasoner.is_some(),
            "Matcher handler built"
        );
        Ok(Arc::new(MatcherHandler::new(
            AlignmentAnalyzer::new(nli),
            reasoner,
            self.config.clone(),
        )))
    }
}

/// Set `failed` after a fatal error and turn it into an outcome.
pub(crate) async fn fail_job(ctx: &JobContext, job_id: Uuid, err: &Error) -> JobOutcome {
    error!(%job_id, error = %err, "Job failed");
    if let Err(e) = ctx.store.jobs.advance_status(job_id, JobStatus::Failed).await {
        error!(%job_id, error = %e, "Failed to mark job as failed");
    }
    ctx.reporter.status(JobStatus::Failed);
    JobOutcome::Failed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use competence_inference::mock::{MockInferenceBackend, MockNliBackend};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mock_models() -> ModelSet {
        let backend = Arc::new(MockInferenceBackend::new());
        ModelSet {
            embedding: backend.clone(),
            generation: backend,
            nli: Arc::new(MockNliBackend::new()),
        }
    }

    #[tokio::test]
    async fn test_factories_build_handlers() {
        let models: Arc<dyn ModelProvider> = Arc::new(StaticModels(mock_models()));
        let config = MatcherConfig::default();

        let embedder = EmbedderFactory::new(models.clone(), EngineLock::new(1), config.clone());
        assert_eq!(embedder.build().await.unwrap().worker_type(), WorkerType::Embedder);

        let matcher = MatcherFactory::new(models, EngineLock::new(1), config);
        assert_eq!(matcher.build().await.unwrap().worker_type(), WorkerType::Matcher);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_models_wait_for_the_engine() {
        let lock = EngineLock::new(1);
        let models = mock_models().locked(&lock);

        let holder = lock.clone();
        let held = tokio::spawn(async move {
            holder
                .with_lock(async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(lock.available(), 0);

        let messages = [competence_core::ChatMessage::user("why")];
        let blocked =
            tokio::time::timeout(Duration::from_secs(1), models.generation.chat(&messages)).await;
        assert!(blocked.is_err());

        held.await.unwrap().unwrap();
        assert!(models.generation.chat(&messages).await.is_ok());
        assert!(models.embedding.embed_texts(&["weld".to_string()]).await.is_ok());
    }

    #[test]
    fn test_remote_models_dimension_mismatch() {
        let models = RemoteModels::new(
            OllamaBackend::with_config(
                "http://localhost:1".into(),
                "embed".into(),
                "gen".into(),
                768,
            ),
            NliSidecarBackend::new("http://localhost:1".into()),
        );
        assert!(models.check_dimension(768).is_ok());
        assert!(matches!(models.check_dimension(1024), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_remote_models_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let models = RemoteModels::new(
            OllamaBackend::with_config(
                server.uri(),
                "embed".into(),
                "gen".into(),
                4,
            ),
            NliSidecarBackend::new(server.uri()),
        );
        let err = models.load().await.err().unwrap();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_remote_models_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "healthy"})),
            )
            .mount(&server)
            .await;

        let models = RemoteModels::new(
            OllamaBackend::with_config(server.uri(), "embed".into(), "gen".into(), 4),
            NliSidecarBackend::new(server.uri()),
        );
        let set = models.load().await.unwrap();
        assert_eq!(set.embedding.dimension(), 4);
    }
}
