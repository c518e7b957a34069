//! Natural-language justification of a match.

use std::sync::Arc;

use tracing::instrument;

use competence_core::{Alignment, Error, GenerationBackend, Result};

use crate::prompts;

/// Generates a short reason for one (task, competence text) match.
#[derive(Clone)]
pub struct Reasoner {
    backend: Arc<dyn GenerationBackend>,
}

impl Reasoner {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    #[instrument(skip_all, fields(subsystem = "inference", component = "reasoner", op = "reason", alignment = %alignment))]
    pub async fn reason(
        &self,
        task: &str,
        competence: &str,
        score: f64,
        alignment: Alignment,
    ) -> Result<String> {
        let response = self
            .backend
            .chat(&prompts::match_reason(task, competence, score, alignment))
            .await
            .map_err(|e| Error::stage("reasoning", e.to_string()))?;

        let reason = response.trim();
        if reason.is_empty() {
            return Err(Error::stage("reasoning", "model returned an empty reason"));
        }
        Ok(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInferenceBackend;

    #[tokio::test]
    async fn test_reason_trims_response() {
        let backend = MockInferenceBackend::new().with_fixed_response("  Good fit.\n");
        let reasoner = Reasoner::new(Arc::new(backend));
        let reason = reasoner
            .reason("Weld", "TIG welding", 0.9, Alignment::Aligning)
            .await
            .unwrap();
        assert_eq!(reason, "Good fit.");
    }

    #[tokio::test]
    async fn test_reason_failure_is_stage_error() {
        let backend = MockInferenceBackend::new().with_failing_input("Weld");
        let reasoner = Reasoner::new(Arc::new(backend));
        let err = reasoner
            .reason("Weld", "TIG welding", 0.9, Alignment::Neutral)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PipelineStage { ref stage, .. } if stage == "reasoning"));
    }

    #[tokio::test]
    async fn test_reason_empty_response() {
        let backend = MockInferenceBackend::new().with_fixed_response("   ");
        let reasoner = Reasoner::new(Arc::new(backend));
        assert!(reasoner
            .reason("t", "c", 0.0, Alignment::Contradicting)
            .await
            .is_err());
    }
}
