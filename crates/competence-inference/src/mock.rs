//! Mock inference backends for deterministic testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use competence_inference::mock::{MockInferenceBackend, MockNliBackend};
//!
//! let backend = MockInferenceBackend::new()
//!     .with_dimension(4)
//!     .with_response_mapping("Task:", "They have done this before.");
//! let nli = MockNliBackend::new().with_score("entailment", 0.9);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use competence_core::{
    ChatMessage, Classification, EmbeddingBackend, Error, GenerationBackend, InferenceBackend,
    NliBackend, Result, Vector,
};

/// Mock embedding + chat backend.
#[derive(Clone)]
pub struct MockInferenceBackend {
    config: Arc<MockConfig>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
}

#[derive(Debug, Clone)]
struct MockConfig {
    dimension: usize,
    response_mappings: Vec<(String, String)>,
    default_response: String,
    latency_ms: u64,
    failure_rate: f64,
    failing_inputs: Vec<String>,
    healthy: bool,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub operation: String,
    pub input: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            dimension: 4,
            response_mappings: Vec::new(),
            default_response: "Mock response".to_string(),
            latency_ms: 0,
            failure_rate: 0.0,
            failing_inputs: Vec::new(),
            healthy: true,
        }
    }
}

impl MockInferenceBackend {
    pub fn new() -> Self {
        Self {
            config: Arc::new(MockConfig::default()),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn config_mut(&mut self) -> &mut MockConfig {
        Arc::make_mut(&mut self.config)
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.config_mut().dimension = dimension;
        self
    }

    pub fn with_fixed_response(mut self, response: impl Into<String>) -> Self {
        self.config_mut().default_response = response.into();
        self
    }

    /// Answer `response` when the last chat message contains `needle`.
    pub fn with_response_mapping(
        mut self,
        needle: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        self.config_mut()
            .response_mappings
            .push((needle.into(), response.into()));
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.config_mut().latency_ms = latency_ms;
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.config_mut().failure_rate = rate;
        self
    }

    /// Fail every call whose input contains `needle`.
    pub fn with_failing_input(mut self, needle: impl Into<String>) -> Self {
        self.config_mut().failing_inputs.push(needle.into());
        self
    }

    pub fn with_healthy(mut self, healthy: bool) -> Self {
        self.config_mut().healthy = healthy;
        self
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.call_log.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn embed_call_count(&self) -> usize {
        self.count("embed")
    }

    pub fn chat_call_count(&self) -> usize {
        self.count("chat")
    }

    fn count(&self, operation: &str) -> usize {
        self.get_calls()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn log_call(&self, operation: &str, input: &str) {
        if let Ok(mut log) = self.call_log.lock() {
            log.push(MockCall {
                operation: operation.to_string(),
                input: input.to_string(),
            });
        }
    }

    fn should_fail(&self, input: &str) -> bool {
        use rand::Rng;
        if self.config.failing_inputs.iter().any(|n| input.contains(n)) {
            return true;
        }
        self.config.failure_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.config.failure_rate
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }
}

impl Default for MockInferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingBackend for MockInferenceBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            self.log_call("embed", text);
            self.simulate_latency().await;
            if self.should_fail(text) {
                return Err(Error::Request("Simulated embedding failure".into()));
            }
            vectors.push(Vector::from(MockEmbeddingGenerator::generate(
                text,
                self.config.dimension,
            )));
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

#[async_trait]
impl GenerationBackend for MockInferenceBackend {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let input = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        self.log_call("chat", input);
        self.simulate_latency().await;

        if self.should_fail(input) {
            return Err(Error::Request("Simulated generation failure".into()));
        }

        let response = self
            .config
            .response_mappings
            .iter()
            .find(|(needle, _)| input.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.config.default_response.clone());
        Ok(response)
    }

    fn model_name(&self) -> &str {
        "mock-gen"
    }
}

#[async_trait]
impl InferenceBackend for MockInferenceBackend {
    async fn health_check(&self) -> Result<bool> {
        Ok(self.config.healthy)
    }
}

/// Mock zero-shot classifier.
///
/// Configured labels get their fixed score. The remaining probability mass
/// is split evenly among unconfigured labels, so the default is uniform.
#[derive(Clone, Default)]
pub struct MockNliBackend {
    scores: HashMap<String, f64>,
    overrides: Vec<(String, String, f64)>,
    failing: bool,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockNliBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_score(mut self, label: impl Into<String>, score: f64) -> Self {
        self.scores.insert(label.into(), score);
        self
    }

    /// Score `label` as `score` when the premise or template contains `needle`.
    pub fn with_score_when(
        mut self,
        needle: impl Into<String>,
        label: impl Into<String>,
        score: f64,
    ) -> Self {
        self.overrides.push((needle.into(), label.into(), score));
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn templates(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|(_, t)| t.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NliBackend for MockNliBackend {
    async fn classify(
        &self,
        text: &str,
        labels: &[&str],
        hypothesis_template: &str,
    ) -> Result<Classification> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((text.to_string(), hypothesis_template.to_string()));
        }
        if self.failing {
            return Err(Error::Request("Simulated NLI failure".into()));
        }

        let mut fixed = self.scores.clone();
        for (needle, label, score) in &self.overrides {
            if text.contains(needle.as_str()) || hypothesis_template.contains(needle.as_str()) {
                fixed.insert(label.clone(), *score);
            }
        }

        let assigned: f64 = labels.iter().filter_map(|l| fixed.get(*l)).sum();
        let free = labels.iter().filter(|l| !fixed.contains_key(**l)).count();
        let share = if free > 0 {
            ((1.0 - assigned) / free as f64).max(0.0)
        } else {
            0.0
        };

        let mut pairs: Vec<(String, f64)> = labels
            .iter()
            .map(|l| (l.to_string(), fixed.get(*l).copied().unwrap_or(share)))
            .collect();
        pairs.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(Classification {
            labels: pairs.iter().map(|(l, _)| l.clone()).collect(),
            scores: pairs.iter().map(|(_, s)| *s).collect(),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.failing)
    }

    fn model_name(&self) -> &str {
        "mock-nli"
    }
}

/// Mock embedding generator with deterministic output.
pub struct MockEmbeddingGenerator;

impl MockEmbeddingGenerator {
    /// Deterministic unit vector from text; equal texts give equal vectors.
    pub fn generate(text: &str, dimension: usize) -> Vec<f32> {
        let mut vec = vec![0.0; dimension];
        if dimension == 0 {
            return vec;
        }
        for (i, c) in text.chars().enumerate() {
            let idx = (c as usize + i) % dimension;
            vec[idx] += 0.1;
        }
        Self::normalize(&mut vec);
        vec
    }

    fn normalize(vec: &mut [f32]) {
        let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            vec.iter_mut().for_each(|x| *x /= magnitude);
        }
    }
}
