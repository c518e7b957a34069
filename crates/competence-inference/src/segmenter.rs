//! Semantic segmentation of long texts via the chat model.

use std::sync::Arc;

use tracing::{debug, instrument};

use competence_core::{defaults, Error, GenerationBackend, Result};

use crate::prompts;

/// Splits a text into semantically independent parts.
#[derive(Clone)]
pub struct Segmenter {
    backend: Arc<dyn GenerationBackend>,
    symbol: String,
}

impl Segmenter {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            backend,
            symbol: defaults::SPLITTING_SYMBOL.to_string(),
        }
    }

    /// Read `SPLITTING_SYMBOL` from the environment.
    pub fn from_env(backend: Arc<dyn GenerationBackend>) -> Self {
        let symbol = std::env::var("SPLITTING_SYMBOL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| defaults::SPLITTING_SYMBOL.to_string());
        Self::new(backend).with_symbol(symbol)
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = symbol.into();
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Split `text`; fails when the model returns nothing usable.
    #[instrument(skip_all, fields(subsystem = "inference", component = "segmenter", op = "split", input_len = text.len()))]
    pub async fn split(&self, text: &str) -> Result<Vec<String>> {
        let response = self
            .backend
            .chat(&prompts::semantic_splitter(&self.symbol, text))
            .await
            .map_err(|e| Error::stage("segmentation", e.to_string()))?;

        let parts = parse_segments(&response, &self.symbol);
        if parts.is_empty() {
            return Err(Error::stage("segmentation", "model returned no segments"));
        }
        debug!(result_count = parts.len(), "Text segmented");
        Ok(parts)
    }
}

/// Split a model response on `symbol`, trimming and dropping empty parts.
pub fn parse_segments(response: &str, symbol: &str) -> Vec<String> {
    response
        .split(symbol)
        .map(|part| {
            part.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInferenceBackend;

    #[test]
    fn test_parse_segments() {
        let response = "  First part.\n  Still first.\n#|#\nSecond part.\n#|#\n\n";
        assert_eq!(
            parse_segments(response, "#|#"),
            vec!["First part.\nStill first.".to_string(), "Second part.".to_string()]
        );
    }

    #[test]
    fn test_parse_segments_without_delimiter() {
        assert_eq!(parse_segments("One unit.", "#|#"), vec!["One unit.".to_string()]);
        assert!(parse_segments("  \n ", "#|#").is_empty());
    }

    #[tokio::test]
    async fn test_split_uses_backend() {
        let backend = MockInferenceBackend::new().with_fixed_response("Weld.\n#|#\nPaint.");
        let segmenter = Segmenter::new(Arc::new(backend.clone()));
        let parts = segmenter.split("Weld. Paint.").await.unwrap();
        assert_eq!(parts, vec!["Weld.".to_string(), "Paint.".to_string()]);
        assert_eq!(backend.chat_call_count(), 1);
    }

    #[tokio::test]
    async fn test_split_empty_response_is_stage_error() {
        let backend = MockInferenceBackend::new().with_fixed_response("#|#");
        let segmenter = Segmenter::new(Arc::new(backend));
        let err = segmenter.split("anything").await.unwrap_err();
        assert!(matches!(err, Error::PipelineStage { ref stage, .. } if stage == "segmentation"));
    }

    #[tokio::test]
    async fn test_split_custom_symbol() {
        let backend = MockInferenceBackend::new().with_fixed_response("a\n---\nb");
        let segmenter = Segmenter::new(Arc::new(backend)).with_symbol("---");
        assert_eq!(segmenter.split("a b").await.unwrap().len(), 2);
    }
}
