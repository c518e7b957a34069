//! Zero-shot NLI classifier sidecar client.
//!
//! The sidecar wraps a zero-shot classification model and exposes:
//!
//! - `POST /classify` with `{text, labels, hypothesis_template}`, answering
//!   `{labels, scores}` sorted by descending score
//! - `GET /health` answering `{status: "healthy", model}`
//!
//! # Configuration
//!
//! - `NLI_BASE_URL`: sidecar URL (default: `http://localhost:8090`)
//! - `NLI_MODEL`: model name reported in logs

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use competence_core::{defaults, Classification, Error, NliBackend, Result};

/// NLI sidecar client.
pub struct NliSidecarBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl NliSidecarBackend {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: defaults::NLI_MODEL.to_string(),
            client: reqwest::Client::new(),
            timeout_secs: defaults::NLI_TIMEOUT_SECS,
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("NLI_BASE_URL").unwrap_or_else(|_| defaults::NLI_URL.to_string());
        let mut backend = Self::new(base_url);
        if let Ok(model) = std::env::var("NLI_MODEL") {
            backend.model = model;
        }
        backend
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Request payload for the `/classify` endpoint.
#[derive(Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
    labels: &'a [&'a str],
    hypothesis_template: &'a str,
}

/// Health check response from the sidecar.
#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

#[async_trait]
impl NliBackend for NliSidecarBackend {
    #[instrument(skip(self, text, hypothesis_template), fields(subsystem = "inference", component = "nli", op = "classify", model = %self.model, input_count = labels.len()))]
    async fn classify(
        &self,
        text: &str,
        labels: &[&str],
        hypothesis_template: &str,
    ) -> Result<Classification> {
        let start = Instant::now();
        let request = ClassifyRequest {
            text,
            labels,
            hypothesis_template,
        };

        let response = self
            .client
            .post(format!("{}/classify", self.base_url))
            .json(&request)
            .timeout(Duration::from_secs(self.timeout_secs))
            .send()
            .await
            .map_err(|e| Error::Request(format!("NLI request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Request(format!(
                "NLI sidecar returned {}: {}",
                status, body
            )));
        }

        let result: Classification = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse NLI response: {}", e)))?;

        if result.labels.len() != result.scores.len() {
            return Err(Error::Serialization(format!(
                "NLI response has {} labels but {} scores",
                result.labels.len(),
                result.scores.len()
            )));
        }

        debug!(
            duration_ms = start.elapsed().as_millis() as u64,
            top_label = result.labels.first().map(String::as_str).unwrap_or(""),
            "Classification complete"
        );
        Ok(result)
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(defaults::HEALTH_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(resp) => {
                if resp.status().is_success() {
                    if let Ok(health) = resp.json::<HealthResponse>().await {
                        return Ok(health.status == "healthy");
                    }
                }
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
