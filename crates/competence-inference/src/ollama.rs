//! Ollama backend for embeddings and chat generation.
//!
//! # Configuration
//!
//! - `OLLAMA_BASE`: server URL (default: `http://localhost:11434`)
//! - `OLLAMA_EMBED_MODEL`: embedding model (default: `nomic-embed-text`)
//! - `OLLAMA_GEN_MODEL`: chat model used for segmentation and reasoning
//! - `OLLAMA_EMBED_DIM`: embedding dimension reported to the store
//! - `OLLAMA_TEMPERATURE`: sampling temperature for chat requests

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use competence_core::{
    defaults, ChatMessage, EmbeddingBackend, Error, GenerationBackend, InferenceBackend, Result,
    Vector,
};

/// Ollama inference backend.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    embed_model: String,
    gen_model: String,
    dimension: usize,
    temperature: f32,
    embed_timeout_secs: u64,
    gen_timeout_secs: u64,
}

impl OllamaBackend {
    /// Create a backend with default settings.
    pub fn new() -> Self {
        Self::with_config(
            defaults::OLLAMA_URL.to_string(),
            defaults::EMBED_MODEL.to_string(),
            defaults::GEN_MODEL.to_string(),
            defaults::EMBED_DIMENSION,
        )
    }

    /// Create a backend from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("OLLAMA_BASE").unwrap_or_else(|_| defaults::OLLAMA_URL.to_string());
        let embed_model = std::env::var("OLLAMA_EMBED_MODEL")
            .unwrap_or_else(|_| defaults::EMBED_MODEL.to_string());
        let gen_model =
            std::env::var("OLLAMA_GEN_MODEL").unwrap_or_else(|_| defaults::GEN_MODEL.to_string());
        let dimension = std::env::var("OLLAMA_EMBED_DIM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::EMBED_DIMENSION);

        let mut backend = Self::with_config(base_url, embed_model, gen_model, dimension);
        if let Some(temperature) = std::env::var("OLLAMA_TEMPERATURE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            backend.temperature = temperature;
        }
        backend
    }

    /// Create a backend with explicit endpoint, models and dimension.
    pub fn with_config(
        base_url: String,
        embed_model: String,
        gen_model: String,
        dimension: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            embed_model,
            gen_model,
            dimension,
            temperature: defaults::GEN_TEMPERATURE,
            embed_timeout_secs: defaults::EMBED_TIMEOUT_SECS,
            gen_timeout_secs: defaults::GEN_TIMEOUT_SECS,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_timeouts(mut self, embed_secs: u64, gen_secs: u64) -> Self {
        self.embed_timeout_secs = embed_secs;
        self.gen_timeout_secs = gen_secs;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

/// Request payload for the Ollama `/api/chat` endpoint.
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Response from the Ollama `/api/chat` endpoint.
#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    #[instrument(skip(self, texts), fields(subsystem = "inference", component = "ollama", op = "embed_texts", model = %self.embed_model, input_count = texts.len()))]
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let start = Instant::now();
        let request = EmbeddingRequest {
            model: &self.embed_model,
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(Duration::from_secs(self.embed_timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Request(format!("Ollama embed request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Request(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let result: EmbeddingResponse = response.json().await.map_err(|e| {
            Error::Serialization(format!("Failed to parse Ollama embed response: {}", e))
        })?;

        if result.embeddings.len() != texts.len() {
            return Err(Error::Request(format!(
                "Ollama returned {} embeddings for {} inputs",
                result.embeddings.len(),
                texts.len()
            )));
        }

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            result_count = result.embeddings.len(),
            duration_ms = elapsed,
            "Embedding complete"
        );
        if elapsed > 10_000 {
            warn!(duration_ms = elapsed, slow = true, "Slow embedding operation");
        }

        Ok(result.embeddings.into_iter().map(Vector::from).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.embed_model
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    #[instrument(skip(self, messages), fields(subsystem = "inference", component = "ollama", op = "chat", model = %self.gen_model, input_count = messages.len()))]
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let start = Instant::now();
        let request = ChatRequest {
            model: &self.gen_model,
            messages,
            stream: false,
            options: ChatOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(Duration::from_secs(self.gen_timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Request(format!("Ollama chat request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Request(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let result: ChatResponse = response.json().await.map_err(|e| {
            Error::Serialization(format!("Failed to parse Ollama chat response: {}", e))
        })?;

        let content = result.message.content;
        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            response_len = content.len(),
            duration_ms = elapsed,
            "Generation complete"
        );
        if elapsed > 30_000 {
            warn!(duration_ms = elapsed, slow = true, "Slow generation operation");
        }
        Ok(content)
    }

    fn model_name(&self) -> &str {
        &self.gen_model
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(defaults::HEALTH_TIMEOUT_SECS))
            .send()
            .await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                debug!(error = %e, "Ollama health check failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> OllamaBackend {
        OllamaBackend::with_config(server.uri(), "embed".into(), "gen".into(), 3)
    }

    #[test]
    fn test_with_config_trims_trailing_slash() {
        let backend = OllamaBackend::with_config(
            "http://ollama:11434/".into(),
            "e".into(),
            "g".into(),
            8,
        );
        assert_eq!(backend.base_url(), "http://ollama:11434");
        assert_eq!(backend.dimension(), 8);
        assert_eq!(EmbeddingBackend::model_name(&backend), "e");
        assert_eq!(GenerationBackend::model_name(&backend), "g");
    }

    #[test]
    fn test_chat_request_serialization() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "gen",
            messages: &messages,
            stream: false,
            options: ChatOptions { temperature: 0.5 },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["stream"], false);
        assert!((json["options"]["temperature"].as_f64().unwrap() - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_embed_texts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_partial_json(serde_json::json!({"model": "embed"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let vectors = backend(&server)
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1].as_slice(), &[0.4, 0.5, 0.6]);
    }

    #[tokio::test]
    async fn test_embed_texts_empty_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        assert!(backend(&server).embed_texts(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embed_texts_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .embed_texts(&["a".to_string()])
            .await
            .unwrap_err();
        match err {
            Error::Request(msg) => assert!(msg.contains("model not found")),
            other => panic!("Expected Request error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_embed_texts_count_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embeddings": [[0.1, 0.2, 0.3]]})),
            )
            .mount(&server)
            .await;

        let result = backend(&server)
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await;
        assert!(matches!(result, Err(Error::Request(_))));
    }

    #[tokio::test]
    async fn test_chat_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({
                "model": "gen",
                "stream": false,
                "messages": [{"role": "system", "content": "be brief"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "done"}
            })))
            .mount(&server)
            .await;

        let content = backend(&server)
            .generate_with_system("be brief", "hello")
            .await
            .unwrap();
        assert_eq!(content, "done");
    }

    #[tokio::test]
    async fn test_chat_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let result = backend(&server).chat(&[ChatMessage::user("x")]).await;
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .mount(&server)
            .await;

        assert!(backend(&server).health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check_unreachable() {
        let backend =
            OllamaBackend::with_config("http://127.0.0.1:1".into(), "e".into(), "g".into(), 3);
        assert!(!backend.health_check().await.unwrap());
    }
}
