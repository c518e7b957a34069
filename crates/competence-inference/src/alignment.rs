//! NLI-based alignment signals between a task and a competence text.
//!
//! Three signals feed match scoring:
//!
//! - [`AlignmentAnalyzer::bidirectional`]: entailment/neutral/contradiction
//!   probabilities, averaged over capability→task, task→capability and a
//!   combined premise (contradiction takes the maximum)
//! - [`AlignmentAnalyzer::contradiction_check`]: explicit
//!   "contradicting / not contradicting" check
//! - [`AlignmentAnalyzer::alignment_check`]: "requirements met" check
//!
//! Each signal issues three classifier calls concurrently.

use std::sync::Arc;

use futures::try_join;
use tracing::{instrument, trace};

use competence_core::{defaults, Classification, NliBackend, Result};

/// Labels of the bidirectional classification, in entail/neutral/contradict order.
pub const NLI_LABELS: [&str; 3] = [
    "entailment",
    "neutral statement",
    "contradiction or not related",
];

const CONTRADICTION_LABELS: [&str; 2] = ["contradicting", "not contradicting"];

const ALIGNMENT_LABELS: [&str; 3] = ["somewhat sufficently", "only partially", "not at all"];

/// Class of the bidirectional classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NliLabel {
    Entail,
    Neutral,
    Contradict,
}

/// Aggregated bidirectional NLI probabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BidirectionalNli {
    pub entail: f64,
    pub neutral: f64,
    pub contradict: f64,
    /// Labels by descending score; ties keep entail, neutral, contradict order.
    pub ranking: [NliLabel; 3],
}

impl BidirectionalNli {
    fn from_directions(directions: [Classification; 3]) -> Self {
        let scores = |label: &str| -> Vec<f64> {
            directions.iter().map(|d| d.score_of(label)).collect()
        };
        let entail = scores(NLI_LABELS[0]).iter().sum::<f64>() / 3.0;
        let neutral = scores(NLI_LABELS[1]).iter().sum::<f64>() / 3.0;
        let contradict = scores(NLI_LABELS[2]).into_iter().fold(0.0, f64::max);

        let mut ranked = [
            (NliLabel::Entail, entail),
            (NliLabel::Neutral, neutral),
            (NliLabel::Contradict, contradict),
        ];
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        Self {
            entail,
            neutral,
            contradict,
            ranking: ranked.map(|(label, _)| label),
        }
    }

    /// Highest-ranked label.
    pub fn top(&self) -> NliLabel {
        self.ranking[0]
    }
}

/// Max and mean of the positive label over the three directions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckOutcome {
    pub max: f64,
    pub avg: f64,
    pub positive: bool,
}

impl CheckOutcome {
    fn positive_scores(label: &str, outputs: &[Classification; 3]) -> (f64, f64) {
        let scores: Vec<f64> = outputs
            .iter()
            .filter(|o| o.labels.iter().any(|l| l == label))
            .map(|o| o.score_of(label))
            .collect();
        if scores.is_empty() {
            return (0.0, 0.0);
        }
        let max = scores.iter().copied().fold(f64::MIN, f64::max);
        let avg = scores.iter().sum::<f64>() / scores.len() as f64;
        (max, avg)
    }
}

/// Escape braces so user text survives `str.format`-style templating.
fn escape_template(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

/// Runs the NLI classifications for one (task, capability) pair.
#[derive(Clone)]
pub struct AlignmentAnalyzer {
    backend: Arc<dyn NliBackend>,
}

impl AlignmentAnalyzer {
    pub fn new(backend: Arc<dyn NliBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn NliBackend> {
        &self.backend
    }

    async fn classify_all(
        &self,
        premises: [&str; 3],
        templates: [String; 3],
        labels: &[&str],
    ) -> Result<[Classification; 3]> {
        let (a, b, c) = try_join!(
            self.backend.classify(premises[0], labels, &templates[0]),
            self.backend.classify(premises[1], labels, &templates[1]),
            self.backend.classify(premises[2], labels, &templates[2]),
        )?;
        Ok([a, b, c])
    }

    #[instrument(skip_all, fields(subsystem = "inference", component = "alignment", op = "bidirectional"))]
    pub async fn bidirectional(&self, task: &str, capability: &str) -> Result<BidirectionalNli> {
        let (t, c) = (escape_template(task), escape_template(capability));
        let mix = format!("Task: {}\nCapability: {}", task, capability);
        let outputs = self
            .classify_all(
                [capability, task, &mix],
                [
                    format!("This is a/an {{}} to the task: {}.", t),
                    format!("The described task is a/an {{}} to the capability: {}.", c),
                    "The task and capability are a/an {}.".to_string(),
                ],
                &NLI_LABELS,
            )
            .await?;

        let result = BidirectionalNli::from_directions(outputs);
        trace!(
            entail = result.entail,
            neutral = result.neutral,
            contradict = result.contradict,
            "Bidirectional NLI"
        );
        Ok(result)
    }

    #[instrument(skip_all, fields(subsystem = "inference", component = "alignment", op = "contradiction_check"))]
    pub async fn contradiction_check(&self, task: &str, capability: &str) -> Result<CheckOutcome> {
        let (t, c) = (escape_template(task), escape_template(capability));
        let mix = format!("Task: {}\nCapability: {}", task, capability);
        let outputs = self
            .classify_all(
                [capability, task, &mix],
                [
                    format!("The capability is {{}} to the task: {}.", t),
                    format!("The task is {{}} to the capability: {}.", c),
                    "The task and capability are {}.".to_string(),
                ],
                &CONTRADICTION_LABELS,
            )
            .await?;

        let (max, avg) = CheckOutcome::positive_scores(CONTRADICTION_LABELS[0], &outputs);
        Ok(CheckOutcome {
            max,
            avg,
            positive: max > defaults::CONTRADICTION_CHECK_MAX
                || avg > defaults::CONTRADICTION_CHECK_AVG,
        })
    }

    #[instrument(skip_all, fields(subsystem = "inference", component = "alignment", op = "alignment_check"))]
    pub async fn alignment_check(&self, task: &str, capability: &str) -> Result<CheckOutcome> {
        let (t, c) = (escape_template(task), escape_template(capability));
        let mix = format!("Task: \"{}\"\nCapability: \"{}\"", task, capability);
        let outputs = self
            .classify_all(
                [capability, task, &mix],
                [
                    format!(
                        "The capability is meeting the requirements of the task \"{}\" {{}}.",
                        t
                    ),
                    format!(
                        "The tasks requirements are met {{}} by the capability: \"{}\".",
                        c
                    ),
                    "The task and capability are {} matching.".to_string(),
                ],
                &ALIGNMENT_LABELS,
            )
            .await?;

        let (max, avg) = CheckOutcome::positive_scores(ALIGNMENT_LABELS[0], &outputs);
        Ok(CheckOutcome {
            max,
            avg,
            positive: max > defaults::ALIGNMENT_CHECK_MAX && avg > defaults::ALIGNMENT_CHECK_AVG,
        })
    }
}
