//! Adjustment of search similarity by NLI alignment signals.

use futures::try_join;

use competence_core::{Alignment, Result};
use competence_inference::{AlignmentAnalyzer, BidirectionalNli, CheckOutcome, NliLabel};

use crate::config::MatcherConfig;

/// The three NLI signals of one (task, competence text) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentSignals {
    pub nli: BidirectionalNli,
    pub contradiction: CheckOutcome,
    pub alignment: CheckOutcome,
}

impl AlignmentSignals {
    /// Run all three checks concurrently.
    pub async fn gather(analyzer: &AlignmentAnalyzer, task: &str, text: &str) -> Result<Self> {
        let (nli, contradiction, alignment) = try_join!(
            analyzer.bidirectional(task, text),
            analyzer.contradiction_check(task, text),
            analyzer.alignment_check(task, text),
        )?;
        Ok(Self {
            nli,
            contradiction,
            alignment,
        })
    }
}

/// Adjusted similarity and its alignment class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub distance: f64,
    pub alignment: Alignment,
}

/// Apply offset and multiplier to `similarity`, then the alignment rules.
///
/// Contradiction wins over alignment; the result is always in `[0, 1]`.
pub fn adjust(similarity: f64, signals: &AlignmentSignals, config: &MatcherConfig) -> Scored {
    let base = ((similarity - config.distance_offset).max(0.0) * config.distance_multiplier)
        .clamp(0.0, 1.0);

    let contradicting = signals.nli.top() == NliLabel::Contradict
        || signals.nli.contradict > config.contradiction_threshold
        || signals.contradiction.positive;
    if contradicting {
        return Scored {
            distance: 0.0,
            alignment: Alignment::Contradicting,
        };
    }

    let aligning = signals.nli.entail > config.entailment_threshold
        && similarity > config.alignment_distance_threshold
        && signals.alignment.positive;
    if aligning {
        return Scored {
            distance: (base * config.alignment_boost_multiplier).min(1.0),
            alignment: Alignment::Aligning,
        };
    }

    Scored {
        distance: (base * config.neutral_reduction_multiplier).clamp(0.0, 1.0),
        alignment: Alignment::Neutral,
    }
}
